//! Externalised media side effects (spec.md §4.6 step 4b, §9).
//!
//! Transcription, vision description and PDF extraction are modelled as
//! opaque coroutines over a URL or local path. The core never inspects their
//! internals; a failure degrades to a neutral placeholder and never aborts
//! the turn.

use async_trait::async_trait;

const PDF_TRUNCATE_CHARS: usize = 3000;

#[async_trait]
pub trait MediaPipeline: Send + Sync {
    async fn transcribe_audio(&self, url: &str) -> Result<String, String>;
    async fn describe_image(&self, url: &str) -> Result<String, String>;
    async fn extract_pdf_text(&self, url: &str) -> Result<String, String>;

    /// Best-effort deletion of a local (non-URL) media pointer. Swallows
    /// not-found; this is fire-and-forget cleanup, not a correctness path.
    async fn delete_local(&self, _path: &str) {}
}

/// No external services configured. Every call fails, which the caller
/// turns into the documented neutral placeholder.
pub struct NoopMediaPipeline;

#[async_trait]
impl MediaPipeline for NoopMediaPipeline {
    async fn transcribe_audio(&self, _url: &str) -> Result<String, String> {
        Err("no transcription service configured".into())
    }

    async fn describe_image(&self, _url: &str) -> Result<String, String> {
        Err("no vision service configured".into())
    }

    async fn extract_pdf_text(&self, _url: &str) -> Result<String, String> {
        Err("no PDF extraction service configured".into())
    }
}

pub fn is_remote(pointer: &str) -> bool {
    pointer.starts_with("http://") || pointer.starts_with("https://")
}

pub fn truncate_pdf_text(text: &str) -> String {
    if text.chars().count() <= PDF_TRUNCATE_CHARS {
        return text.to_string();
    }
    text.chars().take(PDF_TRUNCATE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_pointer_is_not_deleted() {
        assert!(is_remote("https://cdn.example.com/a.png"));
        assert!(!is_remote("/tmp/upload-123.png"));
    }

    #[test]
    fn pdf_text_truncates_at_cap() {
        let long = "a".repeat(4000);
        let truncated = truncate_pdf_text(&long);
        assert_eq!(truncated.chars().count(), PDF_TRUNCATE_CHARS);
    }

    #[tokio::test]
    async fn noop_pipeline_fails_every_call() {
        let pipeline = NoopMediaPipeline;
        assert!(pipeline.transcribe_audio("x").await.is_err());
        assert!(pipeline.describe_image("x").await.is_err());
        assert!(pipeline.extract_pdf_text("x").await.is_err());
    }
}
