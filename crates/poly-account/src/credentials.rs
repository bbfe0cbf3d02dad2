//! API credential acquisition and caching.
//!
//! Sources, first hit wins:
//! 1. in-memory cache
//! 2. configured settings (all three fields present)
//! 3. durable copy from a previous run
//! 4. derived from the wallet signature
//! 5. newly created, only when the caller allows it
//!
//! Concurrent callers share one in-flight acquisition so the venue never sees
//! parallel derive/create calls for the same wallet.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use poly_common::{KeyValueStore, SettingKey, SettingsStore, store};
use poly_market::{ApiCreds, CredentialProvider, VenueClient};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AccountError, AccountResult};

/// Durable store key for the credential copy.
pub const CREDENTIALS_KEY: &str = "polymarket:credentials";

/// Where a set of credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Configured,
    Derived,
    Created,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Configured => write!(f, "configured"),
            CredentialSource::Derived => write!(f, "derived"),
            CredentialSource::Created => write!(f, "created"),
        }
    }
}

/// Credentials plus provenance, as cached and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCredentials {
    pub creds: ApiCreds,
    pub source: CredentialSource,
    pub cached_at: DateTime<Utc>,
}

impl CachedCredentials {
    fn new(creds: ApiCreds, source: CredentialSource) -> Self {
        Self {
            creds,
            source,
            cached_at: Utc::now(),
        }
    }
}

type Acquisition = Shared<BoxFuture<'static, Option<CachedCredentials>>>;

struct InFlight {
    id: u64,
    allow_create: bool,
    future: Acquisition,
}

struct Inner {
    venue: Option<Arc<dyn VenueClient>>,
    settings: Arc<dyn SettingsStore>,
    store: Arc<dyn KeyValueStore>,
    allow_create: bool,
    cached: RwLock<Option<CachedCredentials>>,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

/// Single owner of the account's API credentials.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<Inner>,
}

impl CredentialStore {
    /// `venue` is `None` when no private key is configured; only configured
    /// or previously persisted credentials are then available.
    pub fn new(
        venue: Option<Arc<dyn VenueClient>>,
        settings: Arc<dyn SettingsStore>,
        store: Arc<dyn KeyValueStore>,
        allow_create: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                venue,
                settings,
                store,
                allow_create,
                cached: RwLock::new(None),
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Cached credentials, without I/O.
    pub fn cached(&self) -> Option<CachedCredentials> {
        self.inner.cached.read().clone()
    }

    /// Whether credentials are cached or fully configured. Never suspends.
    pub fn has_credentials(&self) -> bool {
        self.inner.cached.read().is_some() || configured_creds(self.inner.settings.as_ref()).is_some()
    }

    /// Whether a signing wallet is available for derive/create/revoke.
    pub fn has_wallet(&self) -> bool {
        self.inner.venue.is_some()
    }

    /// Return credentials, acquiring them if needed. `None` means
    /// authenticated operations are unavailable; this path never errors.
    pub async fn ensure(&self, allow_create: bool) -> Option<ApiCreds> {
        loop {
            if let Some(cached) = self.cached() {
                return Some(cached.creds);
            }

            let (future, covers_request) = {
                let mut slot = self.inner.in_flight.lock();
                match slot.as_ref() {
                    Some(flight) => (flight.future.clone(), flight.allow_create || !allow_create),
                    None => {
                        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                        let future = self.spawn_acquisition(id, allow_create);
                        *slot = Some(InFlight {
                            id,
                            allow_create,
                            future: future.clone(),
                        });
                        (future, true)
                    }
                }
            };

            let result = future.await;
            if result.is_some() || covers_request {
                return result.map(|c| c.creds);
            }
            // Joined an attempt that was not allowed to create; try again
            // with creation enabled.
            debug!("Shared credential acquisition found nothing, retrying with create");
        }
    }

    /// `ensure` with the configured create policy.
    pub async fn ensure_default(&self) -> Option<ApiCreds> {
        self.ensure(self.inner.allow_create).await
    }

    /// Credentials for paths that must be authenticated.
    pub async fn require(&self) -> AccountResult<ApiCreds> {
        if !self.has_wallet() && !self.has_credentials() {
            return Err(AccountError::MissingCredentials(
                "no private key or API credentials configured".to_string(),
            ));
        }
        self.ensure_default().await.ok_or_else(|| {
            AccountError::MissingCredentials("could not obtain API credentials".to_string())
        })
    }

    /// Revoke the current API key on the venue, then clear every local copy.
    ///
    /// If the venue call fails the error is returned and local state is left
    /// untouched.
    pub async fn revoke(&self) -> AccountResult<()> {
        let venue = self.inner.venue.clone().ok_or_else(|| {
            AccountError::MissingCredentials("revocation requires a private key".to_string())
        })?;
        let creds = self
            .ensure(false)
            .await
            .ok_or_else(|| AccountError::MissingCredentials("no API credentials to revoke".to_string()))?;

        venue.revoke_api_key(&creds).await?;

        *self.inner.cached.write() = None;
        for key in [SettingKey::ApiKey, SettingKey::ApiSecret, SettingKey::ApiPassphrase] {
            self.inner.settings.delete(key);
        }
        self.inner.store.delete(CREDENTIALS_KEY).await?;

        info!(key = %creds.key, "Revoked API credentials");
        Ok(())
    }

    fn spawn_acquisition(&self, id: u64, allow_create: bool) -> Acquisition {
        let inner = Arc::clone(&self.inner);
        async move {
            let result = inner.acquire(allow_create).await;
            let mut slot = inner.in_flight.lock();
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared()
    }
}

fn configured_creds(settings: &dyn SettingsStore) -> Option<ApiCreds> {
    let creds = ApiCreds::new(
        settings.get(SettingKey::ApiKey)?,
        settings.get(SettingKey::ApiSecret)?,
        settings.get(SettingKey::ApiPassphrase)?,
    );
    creds.is_complete().then_some(creds)
}

impl Inner {
    async fn acquire(&self, allow_create: bool) -> Option<CachedCredentials> {
        if let Some(creds) = configured_creds(self.settings.as_ref()) {
            return Some(self.install(CachedCredentials::new(creds, CredentialSource::Configured)));
        }

        match store::load::<CachedCredentials>(self.store.as_ref(), CREDENTIALS_KEY).await {
            Ok(Some(cached)) if cached.creds.is_complete() => {
                debug!(source = %cached.source, "Loaded persisted API credentials");
                return Some(self.install(cached));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read persisted credentials"),
        }

        let Some(venue) = &self.venue else {
            debug!("No wallet configured, cannot derive API credentials");
            return None;
        };

        match venue.derive_api_key().await {
            Ok(creds) => {
                info!(address = %venue.address(), "Derived API credentials");
                return Some(self.persist(CachedCredentials::new(creds, CredentialSource::Derived)).await);
            }
            Err(e) => debug!(error = %e, "Deriving API credentials failed"),
        }

        if !allow_create {
            return None;
        }

        match venue.create_api_key().await {
            Ok(creds) => {
                info!(address = %venue.address(), "Created API credentials");
                Some(self.persist(CachedCredentials::new(creds, CredentialSource::Created)).await)
            }
            Err(e) => {
                warn!(error = %e, "Creating API credentials failed");
                None
            }
        }
    }

    fn install(&self, cached: CachedCredentials) -> CachedCredentials {
        *self.cached.write() = Some(cached.clone());
        cached
    }

    /// Cache, write back to settings and persist. Storage failures are
    /// logged; the credentials stay usable for this process.
    async fn persist(&self, cached: CachedCredentials) -> CachedCredentials {
        self.settings.set(SettingKey::ApiKey, &cached.creds.key);
        self.settings.set(SettingKey::ApiSecret, &cached.creds.secret);
        self.settings.set(SettingKey::ApiPassphrase, &cached.creds.passphrase);
        if let Err(e) = store::save(self.store.as_ref(), CREDENTIALS_KEY, &cached).await {
            warn!(error = %e, "Failed to persist API credentials");
        }
        self.install(cached)
    }
}

#[async_trait]
impl CredentialProvider for CredentialStore {
    async fn credentials(&self) -> Option<ApiCreds> {
        self.ensure(false).await
    }
}
