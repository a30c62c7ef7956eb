use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::ProviderKind;

pub const DEFAULT_PORT: u16 = 8089;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Lock TTL for the per-session AI mutex (spec.md §4.6 step 3). Seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 60;
/// Rolling size cap on ConversationStore's fast cache (spec.md §4.2).
pub const DEFAULT_CONV_MAX_MESSAGES: usize = 100;
/// Fast-cache TTL, reset on every append (spec.md §4.2). Seconds.
pub const DEFAULT_CONV_TTL_SECS: u64 = 7 * 24 * 3600;
/// Durable-store reconstruction window (spec.md §4.2). Days.
pub const DEFAULT_CONV_PG_HISTORY_DAYS: i64 = 30;
/// Tool loop iteration bound (spec.md §4.6 step f).
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;
/// Pending-queue drain retry bound via recursion depth (spec.md §4.6 step 6).
pub const DEFAULT_MAX_PENDING_RETRIES: usize = 3;
/// Automation sweep cadence (spec.md §4.8). Milliseconds.
pub const DEFAULT_AUTOMATION_CHECK_INTERVAL_MS: u64 = 30 * 60 * 1000;

/// Top-level config (relaybot.toml + RELAYBOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaybotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for RelaybotConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            providers: ProvidersConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub gemini: Option<GeminiConfig>,
    pub openai: Option<OpenAiConfig>,
    /// Cross-provider failover mapping (spec.md §4.6.1). Deployment data,
    /// not a hard-coded constant — see SPEC_FULL.md Open Question 2.
    #[serde(default)]
    pub failover: HashMap<ProviderKind, FailoverTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverTarget {
    pub provider: ProviderKind,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    pub api_key: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    /// Token estimate threshold above which the system-prompt cache kicks in.
    #[serde(default = "default_cache_threshold")]
    pub cache_threshold_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

/// Miscellaneous numeric knobs overridable from the environment
/// (spec.md §6 "Environment").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_conv_ttl")]
    pub conv_ttl_secs: u64,
    #[serde(default = "default_conv_max_messages")]
    pub conv_max_messages: usize,
    #[serde(default = "default_conv_history_days")]
    pub conv_pg_history_days: i64,
    #[serde(default = "default_automation_interval")]
    pub automation_check_interval_ms: u64,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    #[serde(default = "default_max_pending_retries")]
    pub max_pending_retries: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            conv_ttl_secs: default_conv_ttl(),
            conv_max_messages: default_conv_max_messages(),
            conv_pg_history_days: default_conv_history_days(),
            automation_check_interval_ms: default_automation_interval(),
            max_tool_iterations: default_max_tool_iterations(),
            max_pending_retries: default_max_pending_retries(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relaybot/relaybot.db", home)
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_cache_threshold() -> u32 {
    4096
}
fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_conv_ttl() -> u64 {
    DEFAULT_CONV_TTL_SECS
}
fn default_conv_max_messages() -> usize {
    DEFAULT_CONV_MAX_MESSAGES
}
fn default_conv_history_days() -> i64 {
    DEFAULT_CONV_PG_HISTORY_DAYS
}
fn default_automation_interval() -> u64 {
    DEFAULT_AUTOMATION_CHECK_INTERVAL_MS
}
fn default_max_tool_iterations() -> usize {
    DEFAULT_MAX_TOOL_ITERATIONS
}
fn default_max_pending_retries() -> usize {
    DEFAULT_MAX_PENDING_RETRIES
}

impl RelaybotConfig {
    /// Load config from a TOML file with RELAYBOT_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: RelaybotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("RELAYBOT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.relaybot/relaybot.toml", home)
}
