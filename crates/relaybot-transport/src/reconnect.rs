use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::transport::Transport;

/// Maximum number of reconnect attempts before giving up (spec.md §5 QR/reconnect timeouts).
const MAX_ATTEMPTS: u32 = 10;
/// Backoff cap: `min(base * 2^attempts, 120s)`.
const BACKOFF_MAX_SECS: u64 = 120;
/// Jitter fraction applied to each delay (±10%), same shape as the channel manager's.
const JITTER_FRACTION: f64 = 0.10;

/// `base=5s` on a plain disconnect, `base=15s` after a conflict (WhatsApp
/// status 440 — another device took over the session).
pub fn base_delay_secs(conflict: bool) -> u64 {
    if conflict {
        15
    } else {
        5
    }
}

/// Reconnect `bot_id` with exponential backoff and jitter, matching the
/// schedule `min(base*2^attempt, 120s)` up to [`MAX_ATTEMPTS`] tries.
pub async fn start_with_backoff(
    transport: &dyn Transport,
    bot_id: &str,
    conflict: bool,
) -> Result<()> {
    let mut delay_secs = base_delay_secs(conflict);

    for attempt in 1..=MAX_ATTEMPTS {
        match transport.start_session(bot_id).await {
            Ok(()) => {
                info!(bot_id, attempt, "transport session started");
                return Ok(());
            }
            Err(e) if attempt == MAX_ATTEMPTS => {
                error!(bot_id, attempt, error = %e, "giving up on transport reconnect");
                return Err(e);
            }
            Err(e) => {
                let jitter = jitter_secs(delay_secs);
                let total = delay_secs + jitter;
                warn!(
                    bot_id,
                    attempt,
                    max = MAX_ATTEMPTS,
                    error = %e,
                    retry_after_secs = total,
                    "transport start failed, retrying with backoff"
                );
                sleep(Duration::from_secs(total)).await;
                delay_secs = (delay_secs * 2).min(BACKOFF_MAX_SECS);
            }
        }
    }

    unreachable!("backoff loop exited without returning")
}

fn jitter_secs(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = ((base_secs as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_is_longer_after_conflict() {
        assert_eq!(base_delay_secs(false), 5);
        assert_eq!(base_delay_secs(true), 15);
    }
}
