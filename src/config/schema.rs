use crate::store::{AutoDeliveryConfig, AutoReplyRule, MatchType};
use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_FILE_NAME: &str = "config.toml";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level xyrelay configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` flag → `XYRELAY_CONFIG_DIR` env → `~/.xyrelay/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed from the config directory, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// IM gateway connection (`[transport]`).
    #[serde(default)]
    pub transport: TransportConfig,

    /// Inbound frame worker pool (`[scheduler]`).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Access token acquisition and refresh (`[token]`).
    #[serde(default)]
    pub token: TokenConfig,

    /// Human-like delays before automated sends (`[timing]`).
    #[serde(default)]
    pub timing: TimingConfig,

    /// Session restart backoff (`[reliability]`).
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    /// Local database (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Marketplace accounts (`[[accounts]]`).
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = default_config_dir().unwrap_or_else(|_| PathBuf::from(".xyrelay"));
        Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            token: TokenConfig::default(),
            timing: TimingConfig::default(),
            reliability: ReliabilityConfig::default(),
            storage: StorageConfig::default(),
            accounts: Vec::new(),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────

/// WebSocket transport configuration (`[transport]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransportConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Upper bound for connect + registration.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Pause between the registration and sync-ack frames.
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Log every inbound and outbound frame at debug level.
    #[serde(default)]
    pub log_frames: bool,
}

fn default_ws_url() -> String {
    "wss://wss-goofish.dingtalk.com/".into()
}

fn default_origin() -> String {
    "https://www.goofish.com".into()
}

fn default_host() -> String {
    "wss-goofish.dingtalk.com".into()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/133.0.0.0 Safari/537.36 DingTalk(2.1.5) OS(Windows/10) Browser(Chrome/133.0.0.0) \
     DingWeb/2.1.5 IMPaaS DingWeb/2.1.5"
        .into()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_delay_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            origin: default_origin(),
            host: default_host(),
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_delay_ms: default_handshake_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            log_frames: false,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// ── Scheduler ────────────────────────────────────────────────────

/// Inbound message scheduler (`[scheduler]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    /// Handlers executing at the same time.
    #[serde(default = "default_scheduler_workers")]
    pub workers: usize,
    /// Handlers admitted (queued or running) before intake blocks.
    #[serde(default = "default_scheduler_admission")]
    pub admission: usize,
}

fn default_scheduler_workers() -> usize {
    10
}

fn default_scheduler_admission() -> usize {
    100
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_scheduler_workers(),
            admission: default_scheduler_admission(),
        }
    }
}

// ── Token ────────────────────────────────────────────────────────

/// Access token lifecycle (`[token]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TokenConfig {
    #[serde(default = "default_token_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_app_key")]
    pub app_key: String,
    /// How long an issued credential is trusted before re-acquisition.
    #[serde(default = "default_token_validity_hours")]
    pub validity_hours: u64,
    #[serde(default = "default_token_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Upper bound of the random offset added to each refresh interval.
    #[serde(default = "default_token_refresh_jitter_secs")]
    pub refresh_jitter_secs: u64,
    /// Pause before retrying an account that hit a verification challenge.
    #[serde(default = "default_token_verification_retry_secs")]
    pub verification_retry_secs: u64,
    #[serde(default = "default_token_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_token_api_base() -> String {
    "https://h5api.m.goofish.com/h5/".into()
}

fn default_token_app_key() -> String {
    "34839810".into()
}

fn default_token_validity_hours() -> u64 {
    20
}

fn default_token_refresh_interval_secs() -> u64 {
    3600
}

fn default_token_refresh_jitter_secs() -> u64 {
    600
}

fn default_token_verification_retry_secs() -> u64 {
    1800
}

fn default_token_request_timeout_secs() -> u64 {
    20
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            api_base: default_token_api_base(),
            app_key: default_token_app_key(),
            validity_hours: default_token_validity_hours(),
            refresh_interval_secs: default_token_refresh_interval_secs(),
            refresh_jitter_secs: default_token_refresh_jitter_secs(),
            verification_retry_secs: default_token_verification_retry_secs(),
            request_timeout_secs: default_token_request_timeout_secs(),
        }
    }
}

// ── Timing ───────────────────────────────────────────────────────

/// Simulated human timing before automated sends (`[timing]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimingConfig {
    /// Set to false to send immediately (useful for local testing).
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_read_min_ms")]
    pub read_min_ms: u64,
    #[serde(default = "default_read_max_ms")]
    pub read_max_ms: u64,
    #[serde(default = "default_think_min_ms")]
    pub think_min_ms: u64,
    #[serde(default = "default_think_max_ms")]
    pub think_max_ms: u64,
    /// Typing cost per character of outgoing text.
    #[serde(default = "default_typing_ms_per_char")]
    pub typing_ms_per_char: u64,
    /// Cap applied to each individual stage.
    #[serde(default = "default_stage_cap_ms")]
    pub stage_cap_ms: u64,
    /// Delay range before confirming shipment.
    #[serde(default = "default_shipment_min_secs")]
    pub shipment_min_secs: u64,
    #[serde(default = "default_shipment_max_secs")]
    pub shipment_max_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_read_min_ms() -> u64 {
    1_000
}

fn default_read_max_ms() -> u64 {
    3_000
}

fn default_think_min_ms() -> u64 {
    500
}

fn default_think_max_ms() -> u64 {
    2_000
}

fn default_typing_ms_per_char() -> u64 {
    150
}

fn default_stage_cap_ms() -> u64 {
    8_000
}

fn default_shipment_min_secs() -> u64 {
    10
}

fn default_shipment_max_secs() -> u64 {
    30
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_min_ms: default_read_min_ms(),
            read_max_ms: default_read_max_ms(),
            think_min_ms: default_think_min_ms(),
            think_max_ms: default_think_max_ms(),
            typing_ms_per_char: default_typing_ms_per_char(),
            stage_cap_ms: default_stage_cap_ms(),
            shipment_min_secs: default_shipment_min_secs(),
            shipment_max_secs: default_shipment_max_secs(),
        }
    }
}

// ── Reliability ──────────────────────────────────────────────────

/// Session restart policy (`[reliability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReliabilityConfig {
    /// Initial backoff for session restarts.
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    /// Max backoff for session restarts.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// A session must stay Ready this long before the backoff resets.
    #[serde(default = "default_stable_session_secs")]
    pub stable_session_secs: u64,
    /// Shortest wait before a reconnect, even after a credential change.
    #[serde(default = "default_min_reconnect_ms")]
    pub min_reconnect_ms: u64,
}

fn default_initial_backoff_secs() -> u64 {
    2
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_stable_session_secs() -> u64 {
    60
}

fn default_min_reconnect_ms() -> u64 {
    1_000
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            stable_session_secs: default_stable_session_secs(),
            min_reconnect_ms: default_min_reconnect_ms(),
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    /// SQLite file, relative to the config directory unless absolute.
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

fn default_db_file() -> String {
    "xyrelay.db".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

// ── Accounts ─────────────────────────────────────────────────────

/// One marketplace account (`[[accounts]]`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountConfig {
    pub id: String,
    /// Browser cookie string; must contain `unb` and `_m_h5_tk`.
    #[serde(default)]
    pub cookie: String,
    /// Reused across reconnects; generated on first start when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-goods automation rules (`[[accounts.goods]]`). Use `goods_id = "*"`
    /// for account-wide fallbacks.
    #[serde(default)]
    pub goods: Vec<GoodsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GoodsConfig {
    pub goods_id: String,
    #[serde(default)]
    pub delivery: AutoDeliveryConfig,
    #[serde(default)]
    pub replies: Vec<AutoReplyRule>,
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".xyrelay"))
}

/// `--config-dir` > `XYRELAY_CONFIG_DIR` > `~/.xyrelay`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(custom) = std::env::var("XYRELAY_CONFIG_DIR") {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok(PathBuf::from(custom));
        }
    }
    default_config_dir()
}

fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub async fn load_or_init(explicit_dir: Option<&Path>) -> Result<Self> {
        let dir = resolve_config_dir(explicit_dir)?;
        Self::load_from_dir(&dir).await
    }

    /// Load `config.toml` from `dir`, writing defaults first if it is missing.
    pub async fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;

            // Cookies are credentials
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        } else {
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
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            accounts = config.accounts.len(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Directory holding config.toml and, by default, the database.
    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn db_path(&self) -> PathBuf {
        let file = Path::new(&self.storage.db_file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            self.config_dir().join(file)
        }
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Transport
        let ws_url = self.transport.ws_url.trim();
        if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
            anyhow::bail!("transport.ws_url must start with ws:// or wss:// (got {ws_url:?})");
        }
        if self.transport.connect_timeout_secs == 0 {
            anyhow::bail!("transport.connect_timeout_secs must be greater than 0");
        }
        if self.transport.heartbeat_interval_secs == 0 {
            anyhow::bail!("transport.heartbeat_interval_secs must be greater than 0");
        }

        // Scheduler
        if self.scheduler.workers == 0 {
            anyhow::bail!("scheduler.workers must be greater than 0");
        }
        if self.scheduler.admission < self.scheduler.workers {
            anyhow::bail!(
                "scheduler.admission ({}) must be at least scheduler.workers ({})",
                self.scheduler.admission,
                self.scheduler.workers
            );
        }

        // Token
        if self.token.validity_hours == 0 {
            anyhow::bail!("token.validity_hours must be greater than 0");
        }
        if self.token.refresh_interval_secs == 0 {
            anyhow::bail!("token.refresh_interval_secs must be greater than 0");
        }

        // Timing
        if self.timing.read_min_ms > self.timing.read_max_ms {
            anyhow::bail!("timing.read_min_ms must not exceed timing.read_max_ms");
        }
        if self.timing.think_min_ms > self.timing.think_max_ms {
            anyhow::bail!("timing.think_min_ms must not exceed timing.think_max_ms");
        }
        if self.timing.shipment_min_secs > self.timing.shipment_max_secs {
            anyhow::bail!("timing.shipment_min_secs must not exceed timing.shipment_max_secs");
        }

        // Reliability
        if self.reliability.initial_backoff_secs == 0 {
            anyhow::bail!("reliability.initial_backoff_secs must be greater than 0");
        }

        // Accounts
        let mut seen = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            if account.id.trim().is_empty() {
                anyhow::bail!("accounts[{i}].id must not be empty");
            }
            if !seen.insert(account.id.as_str()) {
                anyhow::bail!("accounts[{i}].id {:?} is duplicated", account.id);
            }
            for (g, goods) in account.goods.iter().enumerate() {
                if goods.goods_id.trim().is_empty() {
                    anyhow::bail!("accounts[{i}].goods[{g}].goods_id must not be empty");
                }
                for (r, rule) in goods.replies.iter().enumerate() {
                    if rule.keyword.is_empty() {
                        anyhow::bail!("accounts[{i}].goods[{g}].replies[{r}].keyword must not be empty");
                    }
                    if rule.match_type == MatchType::Regex {
                        regex::Regex::new(&rule.keyword).with_context(|| {
                            format!("accounts[{i}].goods[{g}].replies[{r}].keyword is not a valid regex")
                        })?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("XYRELAY_WS_URL") {
            if !url.trim().is_empty() {
                self.transport.ws_url = url.trim().to_string();
            }
        }

        if let Ok(raw) = std::env::var("XYRELAY_LOG_FRAMES") {
            if let Some(enabled) = parse_bool_env(&raw) {
                self.transport.log_frames = enabled;
            }
        }

        if let Ok(raw) = std::env::var("XYRELAY_WORKERS") {
            if let Ok(workers) = raw.trim().parse::<usize>() {
                if workers > 0 {
                    self.scheduler.workers = workers;
                }
            }
        }

        if let Ok(raw) = std::env::var("XYRELAY_ADMISSION") {
            if let Ok(admission) = raw.trim().parse::<usize>() {
                if admission > 0 {
                    self.scheduler.admission = admission;
                }
            }
        }
    }

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
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let backup_path = parent_dir.join(format!("{file_name}.bak"));

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

        let had_existing_config = self.config_path.exists();
        if had_existing_config {
            fs::copy(&self.config_path, &backup_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to create config backup before atomic replace: {}",
                        backup_path.display()
                    )
                })?;
        }

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if had_existing_config && backup_path.exists() {
                fs::copy(&backup_path, &self.config_path)
                    .await
                    .context("Failed to restore config backup")?;
            }
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;

        if had_existing_config {
            let _ = fs::remove_file(&backup_path).await;
        }

        Ok(())
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
        return Ok(());
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

    fn account(id: &str) -> AccountConfig {
        AccountConfig {
            id: id.into(),
            cookie: String::new(),
            device_id: None,
            enabled: true,
            goods: Vec::new(),
        }
    }

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.transport.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.scheduler.workers, 10);
        assert_eq!(config.scheduler.admission, 100);
        assert_eq!(config.token.validity_hours, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_admission_below_workers() {
        let mut config = Config::default();
        config.scheduler.admission = 4;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("scheduler.admission"), "{err}");
    }

    #[test]
    fn validate_rejects_non_websocket_url() {
        let mut config = Config::default();
        config.transport.ws_url = "https://example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_accounts_and_bad_regex() {
        let mut config = Config::default();
        config.accounts = vec![account("a"), account("a")];
        assert!(config.validate().unwrap_err().to_string().contains("duplicated"));

        let mut bad = account("b");
        bad.goods.push(GoodsConfig {
            goods_id: "1".into(),
            delivery: AutoDeliveryConfig::default(),
            replies: vec![AutoReplyRule {
                keyword: "(".into(),
                match_type: MatchType::Regex,
                reply: "x".into(),
            }],
        });
        config.accounts = vec![bad];
        assert!(config.validate().unwrap_err().to_string().contains("regex"));
    }

    #[test]
    fn db_path_is_relative_to_config_dir() {
        let mut config = Config::default();
        config.config_path = PathBuf::from("/srv/xyrelay/config.toml");
        assert_eq!(config.db_path(), PathBuf::from("/srv/xyrelay/xyrelay.db"));
        config.storage.db_file = "/var/lib/xy.db".into();
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/xy.db"));
    }

    #[test]
    fn parse_bool_env_accepts_common_spellings() {
        assert_eq!(parse_bool_env("TRUE"), Some(true));
        assert_eq!(parse_bool_env(" off "), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn resolve_config_dir_prefers_explicit_path() {
        let dir = resolve_config_dir(Some(Path::new("/tmp/xy"))).unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/xy"));
    }
}
