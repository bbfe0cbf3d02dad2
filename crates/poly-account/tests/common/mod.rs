//! Shared fixtures for poly-account integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use poly_account::config::CacheConfig;
use poly_account::{AccountStateCache, CredentialStore};
use poly_common::{AssetType, KeyValueStore, MemorySettings, MemoryStore, SettingKey, SettingsStore};
use poly_market::{
    ApiCreds, ApiKeyMeta, ApiKeysResponse, BalanceAllowance, BalanceAllowanceParams, OpenOrder,
    TradeEntry, VenueClient, VenueError,
};

pub const WALLET: &str = "0x1111111111111111111111111111111111111111";

#[derive(Debug, Default)]
pub struct Calls {
    pub derive: AtomicUsize,
    pub create: AtomicUsize,
    pub revoke: AtomicUsize,
    pub api_keys: AtomicUsize,
    pub collateral: AtomicUsize,
    pub token_balances: AtomicUsize,
    pub orders: AtomicUsize,
    pub trades: AtomicUsize,
    pub scoring: AtomicUsize,
}

fn count(counter: &AtomicUsize) -> usize {
    counter.fetch_add(1, Ordering::SeqCst) + 1
}

/// Scripted venue with call counters, delays and failure switches.
#[derive(Debug, Default)]
pub struct MockVenue {
    pub calls: Calls,
    /// Delay applied to every call.
    pub delay: Duration,
    /// Extra delay on the trades listing.
    pub trades_delay: Duration,

    pub fail_derive: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_revoke: AtomicBool,
    pub fail_balances: AtomicBool,
    pub fail_orders: AtomicBool,
    pub fail_trades: AtomicBool,
    pub fail_api_keys: AtomicBool,
    pub fail_scoring: AtomicBool,

    pub collateral: Mutex<BalanceAllowance>,
    pub token_balances: Mutex<HashMap<String, BalanceAllowance>>,
    pub orders: Mutex<Vec<OpenOrder>>,
    pub trades: Mutex<Vec<TradeEntry>>,
    pub scoring: Mutex<HashMap<String, bool>>,
    pub scoring_requests: Mutex<Vec<Vec<String>>>,
}

impl MockVenue {
    pub fn new() -> Self {
        let venue = Self::default();
        *venue.collateral.lock() = BalanceAllowance {
            balance: Some("25000000".to_string()),
            allowance: Some("1000000000".to_string()),
        };
        venue
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_trades_delay(mut self, delay: Duration) -> Self {
        self.trades_delay = delay;
        self
    }

    pub fn fail(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn check(flag: &AtomicBool, what: &str) -> Result<(), VenueError> {
        if flag.load(Ordering::SeqCst) {
            return Err(VenueError::Http {
                status: 500,
                body: format!("{what} unavailable"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    fn address(&self) -> String {
        WALLET.to_string()
    }

    async fn derive_api_key(&self) -> Result<ApiCreds, VenueError> {
        count(&self.calls.derive);
        self.pause().await;
        Self::check(&self.fail_derive, "derive")?;
        Ok(ApiCreds::new("derived-key", "ZGVyaXZlZA==", "derived-pass"))
    }

    async fn create_api_key(&self) -> Result<ApiCreds, VenueError> {
        count(&self.calls.create);
        self.pause().await;
        Self::check(&self.fail_create, "create")?;
        Ok(ApiCreds::new("created-key", "Y3JlYXRlZA==", "created-pass"))
    }

    async fn revoke_api_key(&self, _creds: &ApiCreds) -> Result<(), VenueError> {
        count(&self.calls.revoke);
        self.pause().await;
        Self::check(&self.fail_revoke, "revoke")
    }

    async fn get_api_keys(&self, creds: &ApiCreds) -> Result<ApiKeysResponse, VenueError> {
        count(&self.calls.api_keys);
        self.pause().await;
        Self::check(&self.fail_api_keys, "api keys")?;
        Ok(ApiKeysResponse {
            api_keys: vec![ApiKeyMeta::from_id(creds.key.clone())],
            cert_required: Some(false),
        })
    }

    async fn get_balance_allowance(
        &self,
        _creds: &ApiCreds,
        params: &BalanceAllowanceParams,
    ) -> Result<BalanceAllowance, VenueError> {
        self.pause().await;
        Self::check(&self.fail_balances, "balances")?;
        match params.asset_type {
            AssetType::Collateral => {
                count(&self.calls.collateral);
                Ok(self.collateral.lock().clone())
            }
            AssetType::Conditional => {
                count(&self.calls.token_balances);
                let token = params.token_id.clone().unwrap_or_default();
                self.token_balances
                    .lock()
                    .get(&token)
                    .cloned()
                    .ok_or_else(|| VenueError::Http {
                        status: 404,
                        body: format!("unknown token {token}"),
                    })
            }
        }
    }

    async fn get_open_orders(&self, _creds: &ApiCreds) -> Result<Vec<OpenOrder>, VenueError> {
        count(&self.calls.orders);
        self.pause().await;
        Self::check(&self.fail_orders, "orders")?;
        Ok(self.orders.lock().clone())
    }

    async fn get_trades(
        &self,
        _creds: &ApiCreds,
        _page_limit: u32,
        _max_pages: u32,
    ) -> Result<Vec<TradeEntry>, VenueError> {
        count(&self.calls.trades);
        self.pause().await;
        if !self.trades_delay.is_zero() {
            tokio::time::sleep(self.trades_delay).await;
        }
        Self::check(&self.fail_trades, "trades")?;
        Ok(self.trades.lock().clone())
    }

    async fn get_order_scoring(
        &self,
        _creds: &ApiCreds,
        order_ids: &[String],
    ) -> Result<HashMap<String, bool>, VenueError> {
        count(&self.calls.scoring);
        self.scoring_requests.lock().push(order_ids.to_vec());
        self.pause().await;
        Self::check(&self.fail_scoring, "scoring")?;
        let scoring = self.scoring.lock();
        Ok(order_ids
            .iter()
            .filter_map(|id| scoring.get(id).map(|s| (id.clone(), *s)))
            .collect())
    }
}

pub fn counted(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// A venue fill. `match_time` is unix seconds.
pub fn trade(id: &str, asset: &str, side: &str, size: &str, price: &str, match_time: i64) -> TradeEntry {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "market": format!("market-{asset}"),
        "asset_id": asset,
        "side": side,
        "size": size,
        "price": price,
        "status": "CONFIRMED",
        "match_time": match_time.to_string(),
        "maker_address": WALLET,
    }))
    .unwrap()
}

pub fn order(id: &str, asset: &str) -> OpenOrder {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "status": "LIVE",
        "market": format!("market-{asset}"),
        "asset_id": asset,
        "side": "BUY",
        "original_size": "10",
        "size_matched": "0",
        "price": "0.45",
    }))
    .unwrap()
}

pub fn configured_settings() -> Arc<MemorySettings> {
    Arc::new(MemorySettings::with_values([
        (SettingKey::ApiKey, "cfg-key".to_string()),
        (SettingKey::ApiSecret, "Y2ZnLXNlY3JldA==".to_string()),
        (SettingKey::ApiPassphrase, "cfg-pass".to_string()),
    ]))
}

pub fn cache_config() -> CacheConfig {
    CacheConfig {
        ttl: Duration::from_secs(60),
        fetch_timeout: Duration::from_secs(2),
        ..CacheConfig::default()
    }
}

pub struct Harness {
    pub venue: Arc<MockVenue>,
    pub settings: Arc<dyn SettingsStore>,
    pub store: Arc<dyn KeyValueStore>,
    pub credentials: CredentialStore,
    pub cache: AccountStateCache,
}

impl Harness {
    /// Harness with configured credentials and an in-memory store.
    pub fn new(venue: MockVenue, config: CacheConfig) -> Self {
        Self::with_store(venue, config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(venue: MockVenue, config: CacheConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(venue, config, configured_settings(), store, false)
    }

    /// Harness with no configured credentials; they must be derived or created.
    pub fn unconfigured(venue: MockVenue, allow_create: bool) -> Self {
        Self::build(
            venue,
            cache_config(),
            Arc::new(MemorySettings::new()),
            Arc::new(MemoryStore::new()),
            allow_create,
        )
    }

    pub fn build(
        venue: MockVenue,
        config: CacheConfig,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn KeyValueStore>,
        allow_create: bool,
    ) -> Self {
        let venue = Arc::new(venue);
        let client: Arc<dyn VenueClient> = venue.clone();
        let credentials = CredentialStore::new(
            Some(Arc::clone(&client)),
            Arc::clone(&settings),
            Arc::clone(&store),
            allow_create,
        );
        let cache = AccountStateCache::new(
            Some(client),
            credentials.clone(),
            Arc::clone(&store),
            config,
        );
        Self {
            venue,
            settings,
            store,
            credentials,
            cache,
        }
    }
}
