use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::kv::RetryPolicy;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Turnstile configuration, loaded from `config.toml`.
///
/// Resolution order: `TURNSTILE_CONFIG_DIR` env → `~/.turnstile/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TurnstileConfig {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Shared key-value store (`[store]`).
    #[serde(default)]
    pub store: StoreConfig,

    /// Lock, queue and context lifetimes and cycle bounds (`[session]`).
    #[serde(default)]
    pub session: SessionConfig,

    /// Webhook server (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Reasoning engine adapter (`[engine]`).
    #[serde(default)]
    pub engine: EngineConfig,

    /// System-of-record sync for the persistent tier (`[record_sync]`).
    #[serde(default)]
    pub record_sync: RecordSyncConfig,

    /// Business profiles keyed by tenant id (`[tenants.<id>]`).
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,
}

// ── Store ─────────────────────────────────────────────────────────

/// Shared key-value store configuration (`[store]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// `"sqlite"` (shared across processes on one host) or `"memory"` (single process).
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// SQLite database file. `~` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How long a writer waits on a locked database. Default: `5000`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Retries for transient read failures. Default: `3`.
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    /// First backoff delay; doubles per retry. Default: `50`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

fn default_store_path() -> String {
    "~/.turnstile/state.db".into()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_read_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            read_retries: default_read_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.read_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

// ── Session ───────────────────────────────────────────────────────

/// Session lifecycle configuration (`[session]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Lock lifetime; refreshed before every reasoning step. Default: `300`.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Active task state lifetime after its last write. Default: `3600`.
    #[serde(default = "default_active_ttl_secs")]
    pub active_ttl_secs: u64,
    /// Cached customer record lifetime. Default: 30 days.
    #[serde(default = "default_persistent_ttl_secs")]
    pub persistent_ttl_secs: u64,
    /// Queue list lifetime, refreshed on every enqueue. Default: `3600`.
    #[serde(default = "default_queue_ttl_secs")]
    pub queue_ttl_secs: u64,
    /// New-messages marker lifetime. Default: `300`.
    #[serde(default = "default_marker_ttl_secs")]
    pub marker_ttl_secs: u64,
    /// Reasoning steps per cycle. Default: `10`.
    #[serde(default = "default_max_reasoning_steps")]
    pub max_reasoning_steps: u32,
    /// Extra cycles one invocation may run for messages that arrived mid-cycle.
    /// `0` disables chaining. Default: `3`.
    #[serde(default = "default_max_chained_cycles")]
    pub max_chained_cycles: u32,
    /// Time kept free at the end of the lock TTL for persisting. A single
    /// reasoning step may run for `lock_ttl_secs - persist_margin_secs`. Default: `30`.
    #[serde(default = "default_persist_margin_secs")]
    pub persist_margin_secs: u64,
    /// Conversation history entries shown to the engine. Default: `14`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Engine faults a message may be part of before it is dropped. Default: `2`.
    #[serde(default = "default_max_message_attempts")]
    pub max_message_attempts: u32,
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_active_ttl_secs() -> u64 {
    3600
}

fn default_persistent_ttl_secs() -> u64 {
    30 * 24 * 3600
}

fn default_queue_ttl_secs() -> u64 {
    3600
}

fn default_marker_ttl_secs() -> u64 {
    300
}

fn default_max_reasoning_steps() -> u32 {
    10
}

fn default_max_chained_cycles() -> u32 {
    3
}

fn default_persist_margin_secs() -> u64 {
    30
}

fn default_history_limit() -> usize {
    14
}

fn default_max_message_attempts() -> u32 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            active_ttl_secs: default_active_ttl_secs(),
            persistent_ttl_secs: default_persistent_ttl_secs(),
            queue_ttl_secs: default_queue_ttl_secs(),
            marker_ttl_secs: default_marker_ttl_secs(),
            max_reasoning_steps: default_max_reasoning_steps(),
            max_chained_cycles: default_max_chained_cycles(),
            persist_margin_secs: default_persist_margin_secs(),
            history_limit: default_history_limit(),
            max_message_attempts: default_max_message_attempts(),
        }
    }
}

impl SessionConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn active_ttl(&self) -> Duration {
        Duration::from_secs(self.active_ttl_secs)
    }

    pub fn persistent_ttl(&self) -> Duration {
        Duration::from_secs(self.persistent_ttl_secs)
    }

    pub fn queue_ttl(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs)
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }

    /// Longest a single reasoning step may run.
    pub fn step_deadline(&self) -> Duration {
        Duration::from_secs(
            self.lock_ttl_secs
                .saturating_sub(self.persist_margin_secs)
                .max(1),
        )
    }
}

// ── Gateway ───────────────────────────────────────────────────────

/// Webhook server configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 42618)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// When set, `POST /webhook` requires an `X-Turnstile-Signature` HMAC-SHA256
    /// of the body keyed with this secret.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Maximum request body size in bytes. Default: `65536`.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Request timeout. Must cover a full cycle. Default: `330`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_port() -> u16 {
    42618
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_request_timeout_secs() -> u64 {
    330
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            webhook_secret: None,
            max_body_bytes: default_max_body_bytes(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

// ── Adapters ──────────────────────────────────────────────────────

/// Reasoning engine configuration (`[engine]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// `"echo"` (acknowledges every message) or `"http"`. Default: `"echo"`.
    #[serde(default = "default_engine_kind")]
    pub kind: String,
    /// Reasoning service endpoint for `kind = "http"`. Overridden by `TURNSTILE_ENGINE_URL`.
    #[serde(default)]
    pub url: Option<String>,
    /// Bearer token sent to the reasoning service.
    #[serde(default)]
    pub api_token: Option<String>,
    /// HTTP timeout per step. Default: `120`.
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_engine_kind() -> String {
    "echo".into()
}

fn default_engine_timeout_secs() -> u64 {
    120
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            url: None,
            api_token: None,
            timeout_secs: default_engine_timeout_secs(),
        }
    }
}

/// System-of-record configuration (`[record_sync]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RecordSyncConfig {
    /// `"none"`, `"memory"` or `"http"`. Default: `"none"`.
    #[serde(default = "default_record_kind")]
    pub kind: String,
    /// Base URL for `kind = "http"`. Overridden by `TURNSTILE_RECORD_URL`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token. Overridden by `TURNSTILE_RECORD_TOKEN`.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Default: `10`.
    #[serde(default = "default_record_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_record_kind() -> String {
    "none".into()
}

fn default_record_timeout_secs() -> u64 {
    10
}

impl Default for RecordSyncConfig {
    fn default() -> Self {
        Self {
            kind: default_record_kind(),
            base_url: None,
            api_token: None,
            timeout_secs: default_record_timeout_secs(),
        }
    }
}

// ── Tenants ───────────────────────────────────────────────────────

/// Business profile shown to the engine with every cycle (`[tenants.<id>]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TenantConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Bookable slots, e.g. `"09:00"`.
    #[serde(default)]
    pub booking_slots: Vec<String>,
    /// e.g. `["mon", "tue", "wed"]`
    #[serde(default)]
    pub working_days: Vec<String>,
    #[serde(default)]
    pub crm_pipeline_id: Option<u64>,
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TURNSTILE_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(dir.trim()).into_owned()));
        }
    }
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".turnstile"))
}

impl TurnstileConfig {
    pub async fn load_or_init() -> Result<Self> {
        let dir = default_config_dir()?;
        Self::load_or_init_in(&dir).await
    }

    /// Load `config.toml` from `dir`, writing defaults there on first run.
    pub async fn load_or_init_in(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = TurnstileConfig {
                config_path: config_path.clone(),
                ..TurnstileConfig::default()
            };
            config.save().await?;
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
            // Tokens live in this file.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: TurnstileConfig =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            tenants = config.tenants.len(),
            store = %config.store.backend,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }

        let s = &self.session;
        for (name, value) in [
            ("session.lock_ttl_secs", s.lock_ttl_secs),
            ("session.active_ttl_secs", s.active_ttl_secs),
            ("session.persistent_ttl_secs", s.persistent_ttl_secs),
            ("session.queue_ttl_secs", s.queue_ttl_secs),
            ("session.marker_ttl_secs", s.marker_ttl_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than 0");
            }
        }
        if s.persist_margin_secs >= s.lock_ttl_secs {
            anyhow::bail!(
                "session.persist_margin_secs ({}) must be smaller than session.lock_ttl_secs ({})",
                s.persist_margin_secs,
                s.lock_ttl_secs
            );
        }
        if s.max_reasoning_steps == 0 {
            anyhow::bail!("session.max_reasoning_steps must be greater than 0");
        }
        if s.max_message_attempts == 0 {
            anyhow::bail!("session.max_message_attempts must be greater than 0");
        }
        if s.queue_ttl_secs < s.lock_ttl_secs {
            anyhow::bail!("session.queue_ttl_secs must be at least session.lock_ttl_secs");
        }

        for id in self.tenants.keys() {
            if id.trim().is_empty() || id.contains('_') || id.contains(':') {
                anyhow::bail!("tenant id '{id}' must be non-empty and contain no '_' or ':'");
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        fn non_empty(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        if let Some(host) = non_empty("TURNSTILE_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = non_empty("TURNSTILE_GATEWAY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid TURNSTILE_GATEWAY_PORT={port}"),
            }
        }
        if let Some(path) = non_empty("TURNSTILE_STORE_PATH") {
            self.store.path = path;
        }
        if let Some(url) = non_empty("TURNSTILE_ENGINE_URL") {
            self.engine.url = Some(url);
        }
        if let Some(url) = non_empty("TURNSTILE_RECORD_URL") {
            self.record_sync.base_url = Some(url);
        }
        if let Some(token) = non_empty("TURNSTILE_RECORD_TOKEN") {
            self.record_sync.api_token = Some(token);
        }
    }

    /// Atomically write the config: temp file, fsync, rename.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = TurnstileConfig::default();
        assert_eq!(c.store.backend, "sqlite");
        assert_eq!(c.session.lock_ttl(), Duration::from_secs(300));
        assert_eq!(c.session.active_ttl(), Duration::from_secs(3600));
        assert_eq!(c.session.persistent_ttl(), Duration::from_secs(2_592_000));
        assert_eq!(c.session.marker_ttl(), Duration::from_secs(300));
        assert_eq!(c.session.max_reasoning_steps, 10);
        assert_eq!(c.session.max_chained_cycles, 3);
        assert_eq!(c.session.history_limit, 14);
        assert_eq!(c.session.max_message_attempts, 2);
        assert_eq!(c.engine.kind, "echo");
        assert_eq!(c.record_sync.kind, "none");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn step_deadline_leaves_persist_margin() {
        let s = SessionConfig::default();
        assert_eq!(s.step_deadline(), Duration::from_secs(270));
        assert!(s.step_deadline() < s.lock_ttl());
    }

    #[test]
    fn retry_policy_follows_store_section() {
        let store = StoreConfig {
            read_retries: 5,
            retry_base_delay_ms: 10,
            ..StoreConfig::default()
        };
        let policy = store.retry_policy();
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn minimal_toml_uses_defaults() {
        let parsed: TurnstileConfig = toml::from_str(
            r#"
[tenants.74274]
name = "Sunny Swim School"
working_days = ["mon", "wed"]
"#,
        )
        .unwrap();
        assert_eq!(parsed.session.lock_ttl_secs, 300);
        assert_eq!(parsed.gateway.port, 42618);
        let tenant = &parsed.tenants["74274"];
        assert_eq!(tenant.name, "Sunny Swim School");
        assert_eq!(tenant.working_days, vec!["mon", "wed"]);
        assert!(tenant.crm_pipeline_id.is_none());
    }

    // ── Validation ───────────────────────────────────────────

    #[test]
    fn margin_must_fit_inside_lock_ttl() {
        let mut c = TurnstileConfig::default();
        c.session.persist_margin_secs = 300;
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("persist_margin_secs"));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut c = TurnstileConfig::default();
        c.session.marker_ttl_secs = 0;
        assert!(c.validate().unwrap_err().to_string().contains("marker_ttl_secs"));
    }

    #[test]
    fn zero_steps_is_rejected() {
        let mut c = TurnstileConfig::default();
        c.session.max_reasoning_steps = 0;
        assert!(c.validate().is_err());

        let mut c = TurnstileConfig::default();
        c.session.max_message_attempts = 0;
        assert!(c.validate().unwrap_err().to_string().contains("max_message_attempts"));
    }

    #[test]
    fn tenant_id_cannot_break_key_layout() {
        let mut c = TurnstileConfig::default();
        c.tenants.insert("a_b".into(), TenantConfig::default());
        assert!(c.validate().unwrap_err().to_string().contains("a_b"));
    }

    #[test]
    fn empty_gateway_host_is_rejected() {
        let mut c = TurnstileConfig::default();
        c.gateway.host = "  ".into();
        assert!(c.validate().is_err());
    }

    // ── Persistence ──────────────────────────────────────────

    #[tokio::test]
    async fn first_load_writes_defaults_then_reads_them_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let first = TurnstileConfig::load_or_init_in(tmp.path()).await.unwrap();
        let path = tmp.path().join("config.toml");
        assert!(path.exists());
        assert_eq!(first.config_path, path);

        let mut edited = first.clone();
        edited.session.max_chained_cycles = 7;
        edited.tenants.insert(
            "74274".into(),
            TenantConfig {
                name: "Sunny Swim School".into(),
                ..TenantConfig::default()
            },
        );
        edited.save().await.unwrap();

        let second = TurnstileConfig::load_or_init_in(tmp.path()).await.unwrap();
        assert_eq!(second.session.max_chained_cycles, 7);
        assert_eq!(second.tenants["74274"].name, "Sunny Swim School");
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = TurnstileConfig {
            config_path: tmp.path().join("config.toml"),
            ..TurnstileConfig::default()
        };
        config.save().await.unwrap();
        config.save().await.unwrap();

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["config.toml".to_string()]);
    }

    #[test]
    fn schema_export_names_sections() {
        let schema = schemars::schema_for!(TurnstileConfig);
        let json = serde_json::to_string(&schema).unwrap();
        for section in ["store", "session", "gateway", "engine", "record_sync", "tenants"] {
            assert!(json.contains(section), "schema is missing {section}");
        }
    }
}
