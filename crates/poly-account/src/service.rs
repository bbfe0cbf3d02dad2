//! The account service component graph.
//!
//! One instance per wallet: a credential store, the snapshot cache, the
//! websocket manager and the activity context, all constructed here and
//! driven by the owning process through `start`/`stop`.

use std::sync::Arc;

use parking_lot::Mutex;
use poly_common::{FileStore, KeyValueStore, MemoryStore, SettingKey, SettingsStore};
use poly_market::{
    ClobRestClient, CredentialProvider, SubscriptionRequest, VenueClient, VenueError,
    WebsocketConnectionManager, WsStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::activity::{ActivityContext, ActivityCursor, ActivityState, ActivityType};
use crate::cache::{AccountStateCache, SnapshotSummary};
use crate::config::AccountConfig;
use crate::credentials::CredentialStore;
use crate::error::{AccountError, AccountResult};

/// Synchronous view for request-time context providers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderContext {
    pub clob_api_url: String,
    pub chain_id: u64,
    pub wallet_address: Option<String>,
    pub has_private_key: bool,
    pub has_api_creds: bool,
    pub features: Vec<&'static str>,
    pub account: Option<SnapshotSummary>,
    pub websocket: WsStatus,
    pub activity: ActivityState,
}

pub struct AccountService {
    config: AccountConfig,
    settings: Arc<dyn SettingsStore>,
    credentials: CredentialStore,
    cache: AccountStateCache,
    websocket: WebsocketConnectionManager,
    activity: ActivityContext,
    shutdown: broadcast::Sender<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl AccountService {
    /// Build the live service: REST client from the configured private key,
    /// file-backed storage when a data directory is set.
    pub fn from_config(config: AccountConfig) -> AccountResult<Self> {
        let venue: Option<Arc<dyn VenueClient>> = match config.wallet.private_key.as_deref() {
            Some(key) => {
                let client = ClobRestClient::new(config.rest_config(), key).map_err(|e| match e {
                    VenueError::Auth(msg) => AccountError::InvalidPrivateKey(msg),
                    other => AccountError::Venue(other),
                })?;
                let client: Arc<dyn VenueClient> = Arc::new(client);
                Some(client)
            }
            None => {
                warn!("No private key configured; account state unavailable");
                None
            }
        };

        let store: Arc<dyn KeyValueStore> = match &config.storage.data_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "Using file-backed account storage");
                Arc::new(FileStore::new(dir.clone()))
            }
            None => Arc::new(MemoryStore::new()),
        };
        let settings: Arc<dyn SettingsStore> = Arc::new(config.to_settings());

        Ok(Self::with_parts(config, venue, settings, store))
    }

    /// Assemble the graph from explicit collaborators.
    pub fn with_parts(
        config: AccountConfig,
        venue: Option<Arc<dyn VenueClient>>,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let credentials = CredentialStore::new(
            venue.clone(),
            Arc::clone(&settings),
            Arc::clone(&store),
            config.wallet.allow_create_api_key,
        );
        let cache = AccountStateCache::new(
            venue,
            credentials.clone(),
            Arc::clone(&store),
            config.cache.clone(),
        );
        let provider: Arc<dyn CredentialProvider> = Arc::new(credentials.clone());
        let websocket = WebsocketConnectionManager::new(config.ws_config(), Some(provider));
        let activity = ActivityContext::new(store, config.activity.max_history);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            settings,
            credentials,
            cache,
            websocket,
            activity,
            shutdown,
            refresh_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn cache(&self) -> &AccountStateCache {
        &self.cache
    }

    pub fn websocket(&self) -> &WebsocketConnectionManager {
        &self.websocket
    }

    pub fn activity(&self) -> &ActivityContext {
        &self.activity
    }

    /// Restore persisted state, start the refresh loop and open the
    /// websocket if anything should be streamed.
    pub async fn start(&self, subscriptions: Vec<SubscriptionRequest>) {
        if self.cache.restore().await {
            info!("Serving restored account snapshot until first refresh");
        }
        self.activity.load().await;

        {
            let mut task = self.refresh_task.lock();
            if task.is_none() {
                let handle = self
                    .cache
                    .spawn_refresh_loop(self.config.cache.refresh_interval, self.shutdown.subscribe());
                *task = Some(handle);
            }
        }

        if !subscriptions.is_empty() {
            self.websocket.start(subscriptions).await;
        }
        info!(
            wallet = ?self.cache.wallet_address(),
            refresh_secs = self.config.cache.refresh_interval.as_secs(),
            "Account service started"
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let task = self.refresh_task.lock().take();
        if let Some(handle) = task {
            let _ = handle.await;
        }
        self.websocket.stop().await;
        info!("Account service stopped");
    }

    /// Record an activity. Order placement or cancellation also invalidates
    /// the cached snapshot.
    pub async fn record_activity(
        &self,
        activity_type: ActivityType,
        payload: serde_json::Value,
    ) -> ActivityCursor {
        if activity_type.mutates_account() {
            self.cache.invalidate();
        }
        self.activity.record(activity_type, payload).await
    }

    /// Context for request-time providers. Never suspends.
    pub fn provider_context(&self) -> ProviderContext {
        let has_private_key = self.settings.get(SettingKey::PrivateKey).is_some();
        let has_api_creds = self.credentials.has_credentials();

        let mut features = vec!["market_data", "price_feeds", "order_book"];
        if has_private_key {
            features.push("wallet_operations");
        }
        if has_api_creds {
            features.push("authenticated_trading");
            features.push("order_management");
        }

        ProviderContext {
            clob_api_url: self.config.venue.clob_api_url.clone(),
            chain_id: self.config.venue.chain_id,
            wallet_address: self.cache.wallet_address(),
            has_private_key,
            has_api_creds,
            features,
            account: self.cache.get_cached().map(|s| s.summary()),
            websocket: self.websocket.status_snapshot(),
            activity: self.activity.get(),
        }
    }
}
