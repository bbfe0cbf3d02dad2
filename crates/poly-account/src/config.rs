//! Configuration for poly-account.
//!
//! Resolved once at startup: defaults, then an optional TOML file, then
//! environment overrides through the `SettingKey` alias table, then CLI flags.
//! Secrets are only ever read from the environment, never from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use poly_common::{EnvSettings, SettingKey};
use poly_market::{ApiCreds, RestConfig, WsConfig, endpoints};
use serde::Deserialize;

/// Top-level configuration for poly-account.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Logging level.
    pub log_level: String,

    /// Venue endpoints.
    pub venue: VenueConfig,

    /// Snapshot cache parameters.
    pub cache: CacheConfig,

    /// Streaming connection parameters.
    pub websocket: WebsocketConfig,

    /// Activity context parameters.
    pub activity: ActivityConfig,

    /// Durable storage location.
    pub storage: StorageConfig,

    /// Wallet and API credentials (environment only).
    pub wallet: WalletConfig,
}

/// Venue endpoints and HTTP behaviour.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub clob_api_url: String,
    pub clob_ws_url: String,
    pub request_timeout: Duration,
    pub chain_id: u64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            clob_api_url: endpoints::CLOB_REST.to_string(),
            clob_ws_url: endpoints::CLOB_WS.to_string(),
            request_timeout: Duration::from_secs(30),
            chain_id: endpoints::CHAIN_ID,
        }
    }
}

/// Account snapshot cache parameters.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Snapshot lifetime.
    pub ttl: Duration,

    /// Period of the background refresh loop.
    pub refresh_interval: Duration,

    /// Timeout applied to each venue fetch inside a refresh.
    pub fetch_timeout: Duration,

    /// Maximum fills kept on the snapshot.
    pub recent_trades_cap: usize,

    /// Maximum conditional tokens whose balances are fetched.
    pub max_tracked_tokens: usize,

    /// Tokens always tracked, ahead of those discovered from orders and fills.
    pub tracked_token_ids: Vec<String>,

    /// Page size for the trade listing.
    pub trade_page_limit: u32,

    /// Maximum pages walked for the trade listing.
    pub trade_max_pages: u32,

    /// Infer a proxy funding wallet when the collateral balance is zero.
    pub detect_proxy_wallet: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(15),
            recent_trades_cap: 50,
            max_tracked_tokens: 25,
            tracked_token_ids: Vec::new(),
            trade_page_limit: endpoints::DEFAULT_PAGE_LIMIT,
            trade_max_pages: 10,
            detect_proxy_wallet: true,
        }
    }
}

/// Streaming connection parameters.
#[derive(Debug, Clone)]
pub struct WebsocketConfig {
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// Entries kept in the recent-history ring.
    pub max_history: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self { max_history: 20 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Directory for the file-backed store. In-memory storage when unset.
    pub data_dir: Option<PathBuf>,
}

/// Wallet configuration, loaded from the environment only.
#[derive(Clone, Default)]
pub struct WalletConfig {
    pub private_key: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub api_passphrase: Option<String>,
    /// Allow creating a new API key when none can be derived.
    pub allow_create_api_key: bool,
}

impl std::fmt::Debug for WalletConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("WalletConfig")
            .field("private_key", &redact(&self.private_key))
            .field("api_key", &self.api_key)
            .field("api_secret", &redact(&self.api_secret))
            .field("api_passphrase", &redact(&self.api_passphrase))
            .field("allow_create_api_key", &self.allow_create_api_key)
            .finish()
    }
}

impl WalletConfig {
    /// Configured API credentials, if all three parts are present.
    pub fn api_creds(&self) -> Option<ApiCreds> {
        match (&self.api_key, &self.api_secret, &self.api_passphrase) {
            (Some(key), Some(secret), Some(passphrase)) => {
                let creds = ApiCreds::new(key, secret, passphrase);
                creds.is_complete().then_some(creds)
            }
            _ => None,
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            venue: VenueConfig::default(),
            cache: CacheConfig::default(),
            websocket: WebsocketConfig::default(),
            activity: ActivityConfig::default(),
            storage: StorageConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

/// Truthy flag values accepted from the environment.
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl AccountConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any name lookup, resolving each setting through
    /// its alias list.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in SettingKey::ALL {
            let Some(value) = key.resolve(&lookup) else {
                continue;
            };
            match key {
                SettingKey::PrivateKey => self.wallet.private_key = Some(value),
                SettingKey::ApiKey => self.wallet.api_key = Some(value),
                SettingKey::ApiSecret => self.wallet.api_secret = Some(value),
                SettingKey::ApiPassphrase => self.wallet.api_passphrase = Some(value),
                SettingKey::ClobApiUrl => self.venue.clob_api_url = value,
                SettingKey::ClobWsUrl => self.venue.clob_ws_url = value,
                SettingKey::AllowCreateApiKey => {
                    self.wallet.allow_create_api_key = parse_flag(&value)
                }
            }
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        log_level: Option<String>,
        clob_api_url: Option<String>,
        data_dir: Option<PathBuf>,
        allow_create: bool,
    ) {
        if let Some(level) = log_level {
            self.log_level = level;
        }
        if let Some(url) = clob_api_url {
            self.venue.clob_api_url = url;
        }
        if let Some(dir) = data_dir {
            self.storage.data_dir = Some(dir);
        }
        if allow_create {
            self.wallet.allow_create_api_key = true;
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.venue.clob_api_url.starts_with("http://")
            || self.venue.clob_api_url.starts_with("https://"))
        {
            bail!("clob_api_url must be an http(s) URL");
        }
        if !(self.venue.clob_ws_url.starts_with("ws://")
            || self.venue.clob_ws_url.starts_with("wss://"))
        {
            bail!("clob_ws_url must be a ws(s) URL");
        }
        if self.venue.request_timeout.is_zero() {
            bail!("request_timeout_secs must be positive");
        }

        if self.cache.ttl.is_zero() {
            bail!("ttl_secs must be positive");
        }
        if self.cache.refresh_interval.is_zero() {
            bail!("refresh_interval_secs must be positive");
        }
        if self.cache.fetch_timeout.is_zero() {
            bail!("fetch_timeout_secs must be positive");
        }
        if self.cache.recent_trades_cap == 0 {
            bail!("recent_trades_cap must be at least 1");
        }
        if self.cache.max_tracked_tokens == 0 {
            bail!("max_tracked_tokens must be at least 1");
        }
        if self.cache.trade_page_limit == 0 || self.cache.trade_page_limit > endpoints::MAX_PAGE_LIMIT {
            bail!(
                "trade_page_limit must be between 1 and {}",
                endpoints::MAX_PAGE_LIMIT
            );
        }
        if self.cache.trade_max_pages == 0 {
            bail!("trade_max_pages must be at least 1");
        }

        if self.websocket.max_reconnect_attempts == 0 {
            bail!("max_reconnect_attempts must be at least 1");
        }
        if self.websocket.ping_interval.is_zero() {
            bail!("ping_interval_secs must be positive");
        }
        if self.websocket.max_reconnect_delay < self.websocket.reconnect_delay {
            bail!("max_reconnect_delay_secs cannot be below reconnect_delay_secs");
        }

        if self.activity.max_history == 0 {
            bail!("max_history must be at least 1");
        }

        Ok(())
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.venue.clob_api_url.clone(),
            request_timeout: self.venue.request_timeout,
            chain_id: self.venue.chain_id,
        }
    }

    pub fn ws_config(&self) -> WsConfig {
        WsConfig {
            url: self.venue.clob_ws_url.clone(),
            connect_timeout: self.websocket.connect_timeout,
            ping_interval: self.websocket.ping_interval,
            reconnect_delay: self.websocket.reconnect_delay,
            max_reconnect_delay: self.websocket.max_reconnect_delay,
            max_reconnect_attempts: self.websocket.max_reconnect_attempts,
            ..WsConfig::default()
        }
    }

    /// Settings store over the environment, with the resolved values on top.
    pub fn to_settings(&self) -> EnvSettings {
        let w = &self.wallet;
        let values = [
            (SettingKey::PrivateKey, w.private_key.clone()),
            (SettingKey::ApiKey, w.api_key.clone()),
            (SettingKey::ApiSecret, w.api_secret.clone()),
            (SettingKey::ApiPassphrase, w.api_passphrase.clone()),
            (SettingKey::ClobApiUrl, Some(self.venue.clob_api_url.clone())),
            (SettingKey::ClobWsUrl, Some(self.venue.clob_ws_url.clone())),
            (
                SettingKey::AllowCreateApiKey,
                Some(w.allow_create_api_key.to_string()),
            ),
        ];
        EnvSettings::with_overrides(
            values
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v))),
        )
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    venue: VenueToml,
    #[serde(default)]
    cache: CacheToml,
    #[serde(default)]
    websocket: WebsocketToml,
    #[serde(default)]
    activity: ActivityToml,
    #[serde(default)]
    storage: StorageToml,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct VenueToml {
    clob_api_url: String,
    clob_ws_url: String,
    request_timeout_secs: u64,
}

impl Default for VenueToml {
    fn default() -> Self {
        Self {
            clob_api_url: endpoints::CLOB_REST.to_string(),
            clob_ws_url: endpoints::CLOB_WS.to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CacheToml {
    ttl_secs: u64,
    refresh_interval_secs: u64,
    fetch_timeout_secs: u64,
    recent_trades_cap: usize,
    max_tracked_tokens: usize,
    tracked_token_ids: Vec<String>,
    trade_page_limit: u32,
    trade_max_pages: u32,
    detect_proxy_wallet: bool,
}

impl Default for CacheToml {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            refresh_interval_secs: 300,
            fetch_timeout_secs: 15,
            recent_trades_cap: 50,
            max_tracked_tokens: 25,
            tracked_token_ids: Vec::new(),
            trade_page_limit: endpoints::DEFAULT_PAGE_LIMIT,
            trade_max_pages: 10,
            detect_proxy_wallet: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WebsocketToml {
    ping_interval_secs: u64,
    reconnect_delay_secs: u64,
    max_reconnect_delay_secs: u64,
    max_reconnect_attempts: u32,
    connect_timeout_secs: u64,
}

impl Default for WebsocketToml {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 5,
            max_reconnect_attempts: 5,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ActivityToml {
    max_history: usize,
}

impl Default for ActivityToml {
    fn default() -> Self {
        Self { max_history: 20 }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StorageToml {
    data_dir: Option<PathBuf>,
}

impl From<TomlConfig> for AccountConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            venue: VenueConfig {
                clob_api_url: toml.venue.clob_api_url,
                clob_ws_url: toml.venue.clob_ws_url,
                request_timeout: Duration::from_secs(toml.venue.request_timeout_secs),
                chain_id: endpoints::CHAIN_ID,
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(toml.cache.ttl_secs),
                refresh_interval: Duration::from_secs(toml.cache.refresh_interval_secs),
                fetch_timeout: Duration::from_secs(toml.cache.fetch_timeout_secs),
                recent_trades_cap: toml.cache.recent_trades_cap,
                max_tracked_tokens: toml.cache.max_tracked_tokens,
                tracked_token_ids: toml.cache.tracked_token_ids,
                trade_page_limit: toml.cache.trade_page_limit,
                trade_max_pages: toml.cache.trade_max_pages,
                detect_proxy_wallet: toml.cache.detect_proxy_wallet,
            },
            websocket: WebsocketConfig {
                ping_interval: Duration::from_secs(toml.websocket.ping_interval_secs),
                reconnect_delay: Duration::from_secs(toml.websocket.reconnect_delay_secs),
                max_reconnect_delay: Duration::from_secs(toml.websocket.max_reconnect_delay_secs),
                max_reconnect_attempts: toml.websocket.max_reconnect_attempts,
                connect_timeout: Duration::from_secs(toml.websocket.connect_timeout_secs),
            },
            activity: ActivityConfig {
                max_history: toml.activity.max_history,
            },
            storage: StorageConfig {
                data_dir: toml.storage.data_dir,
            },
            wallet: WalletConfig::default(),
        }
    }
}
