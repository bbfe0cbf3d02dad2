//! Account state cache.
//!
//! Holds one immutable `AccountSnapshot` behind an `Arc`. Readers clone the
//! `Arc` and never see a half-built snapshot; a refresh builds a complete new
//! value and swaps it in. Concurrent refreshes share one in-flight future.
//!
//! A refresh runs four independent venue fetches (balances, open orders,
//! trades, API keys) concurrently, each with its own timeout. A failed or
//! timed-out fetch degrades its slice to an empty default. Reward scoring is
//! fetched afterwards, for the open orders only.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::{Mutex, RwLock};
use poly_common::{KeyValueStore, store};
use poly_market::{
    ApiCreds, ApiKeyMeta, BalanceAllowance, BalanceAllowanceParams, OpenOrder, TradeEntry,
    VenueClient, VenueError, endpoints,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::credentials::CredentialStore;
use crate::positions::{Position, positions_from_trades};

/// Durable store key for the last snapshot.
pub const SNAPSHOT_KEY: &str = "polymarket:account_snapshot";

/// A balance/allowance pair in whole units. `None` when unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    pub balance: Option<Decimal>,
    pub allowance: Option<Decimal>,
}

impl BalanceView {
    fn from_raw(raw: &BalanceAllowance) -> Self {
        Self {
            balance: raw.balance.as_deref().and_then(normalize_amount),
            allowance: raw.allowance.as_deref().and_then(normalize_amount),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub collateral: BalanceView,
    #[serde(default)]
    pub tokens: BTreeMap<String, BalanceView>,
}

/// One complete capture of account state. Never mutated after install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub wallet_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_wallet: Option<String>,
    pub balances: Balances,
    pub active_orders: Vec<OpenOrder>,
    pub recent_trades: Vec<TradeEntry>,
    pub positions: Vec<Position>,
    pub order_scoring_status: BTreeMap<String, bool>,
    pub api_keys_meta: Vec<ApiKeyMeta>,
    pub cert_required: Option<bool>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            wallet_address: self.wallet_address.clone(),
            proxy_wallet: self.proxy_wallet.clone(),
            collateral_balance: self.balances.collateral.balance,
            active_orders: self.active_orders.len(),
            recent_trades: self.recent_trades.len(),
            positions: self.positions.len(),
            scoring_orders: self.order_scoring_status.values().filter(|s| **s).count(),
            last_updated_at: self.last_updated_at,
            expires_at: self.expires_at,
        }
    }
}

/// Compact view for provider context.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub wallet_address: String,
    pub proxy_wallet: Option<String>,
    pub collateral_balance: Option<Decimal>,
    pub active_orders: usize,
    pub recent_trades: usize,
    pub positions: usize,
    pub scoring_orders: usize,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Convert a venue balance string to whole collateral units.
///
/// Heuristic: the venue reports some balances in base units (integer micro
/// USDC) and some already in decimal form. A value with a decimal point, or
/// one below a single unit, is taken as already decimal; any other integer
/// is scaled down by the USDC decimals.
pub fn normalize_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    let value = Decimal::from_str(raw).ok()?;
    if raw.contains('.') || value.abs() < Decimal::ONE {
        return Some(value);
    }
    Some(value / Decimal::from(10u64.pow(endpoints::USDC_DECIMALS)))
}

/// Most frequent maker address on the wallet's fills that is not the wallet
/// itself. Ties resolve to the lexicographically smallest address.
pub fn detect_proxy_wallet(wallet: &str, trades: &[TradeEntry]) -> Option<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for trade in trades {
        let Some(maker) = trade.maker_address.as_deref() else {
            continue;
        };
        let maker = maker.trim();
        if maker.is_empty() || maker.eq_ignore_ascii_case(wallet) {
            continue;
        }
        *counts.entry(maker.to_string()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|(a, ca), (b, cb)| ca.cmp(cb).then_with(|| b.cmp(a)))
        .map(|(addr, _)| addr)
}

/// Run one fetch under a timeout. Failures and timeouts become `None`.
async fn bounded<T, F>(limit: Duration, what: &'static str, fetch: F) -> Option<T>
where
    F: Future<Output = Result<T, VenueError>>,
{
    match tokio::time::timeout(limit, fetch).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(fetch = what, error = %e, "Account fetch failed, using default");
            None
        }
        Err(_) => {
            warn!(fetch = what, timeout = ?limit, "Account fetch timed out, using default");
            None
        }
    }
}

type Refresh = Shared<BoxFuture<'static, Option<Arc<AccountSnapshot>>>>;

struct Inner {
    venue: Option<Arc<dyn VenueClient>>,
    credentials: CredentialStore,
    store: Arc<dyn KeyValueStore>,
    config: CacheConfig,
    snapshot: RwLock<Option<Arc<AccountSnapshot>>>,
    in_flight: Mutex<Option<(u64, Refresh)>>,
    next_id: AtomicU64,
    /// Bumped by `invalidate`; a refresh that started under an older value
    /// must not install its result.
    generation: AtomicU64,
}

/// TTL cache of the account snapshot with single-flight refresh.
#[derive(Clone)]
pub struct AccountStateCache {
    inner: Arc<Inner>,
}

impl AccountStateCache {
    pub fn new(
        venue: Option<Arc<dyn VenueClient>>,
        credentials: CredentialStore,
        store: Arc<dyn KeyValueStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                venue,
                credentials,
                store,
                config,
                snapshot: RwLock::new(None),
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Wallet whose state this cache tracks, if a wallet is configured.
    pub fn wallet_address(&self) -> Option<String> {
        self.inner.venue.as_ref().map(|v| v.address())
    }

    /// Current snapshot if present and unexpired. Never suspends.
    pub fn get_cached(&self) -> Option<Arc<AccountSnapshot>> {
        self.inner
            .snapshot
            .read()
            .as_ref()
            .filter(|s| !s.is_expired())
            .cloned()
    }

    /// Cached snapshot, refreshing if there is none.
    pub async fn get(&self) -> Option<Arc<AccountSnapshot>> {
        match self.get_cached() {
            Some(snapshot) => Some(snapshot),
            None => self.refresh().await,
        }
    }

    /// Refresh unconditionally. Concurrent callers share one refresh.
    pub async fn refresh(&self) -> Option<Arc<AccountSnapshot>> {
        let future = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some((_, future)) => future.clone(),
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let inner = Arc::clone(&self.inner);
                    let future = async move {
                        let result = inner.build_and_install().await;
                        let mut slot = inner.in_flight.lock();
                        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                            *slot = None;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some((id, future.clone()));
                    future
                }
            }
        };
        future.await
    }

    /// Drop the in-memory snapshot and detach any refresh in flight, so the
    /// next `get`/`refresh` fetches again. The durable copy is left alone.
    pub fn invalidate(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let detached = self.inner.in_flight.lock().take().is_some();
        *self.inner.snapshot.write() = None;
        debug!(generation, detached, "Account snapshot invalidated");
    }

    /// Install the persisted snapshot if it is still valid. Returns whether
    /// one was installed.
    pub async fn restore(&self) -> bool {
        let persisted =
            match store::load::<AccountSnapshot>(self.inner.store.as_ref(), SNAPSHOT_KEY).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return false,
                Err(e) => {
                    warn!(error = %e, "Failed to load persisted account snapshot");
                    return false;
                }
            };

        if persisted.is_expired() {
            debug!(expired_at = %persisted.expires_at, "Persisted snapshot expired, ignoring");
            return false;
        }
        if let Some(wallet) = self.wallet_address()
            && !persisted.wallet_address.eq_ignore_ascii_case(&wallet)
        {
            warn!(
                persisted = %persisted.wallet_address,
                wallet = %wallet,
                "Persisted snapshot belongs to another wallet, ignoring"
            );
            return false;
        }

        let mut slot = self.inner.snapshot.write();
        if slot.is_none() {
            info!(expires_at = %persisted.expires_at, "Restored account snapshot");
            *slot = Some(Arc::new(persisted));
            true
        } else {
            false
        }
    }

    /// Refresh on a fixed period until `shutdown` fires.
    pub fn spawn_refresh_loop(
        &self,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }
                // A refresh cut short here stays in flight for the next caller
                tokio::select! {
                    result = cache.refresh() => match result {
                        Some(snapshot) => debug!(
                            orders = snapshot.active_orders.len(),
                            positions = snapshot.positions.len(),
                            "Scheduled account refresh complete"
                        ),
                        None => debug!("Scheduled account refresh produced no snapshot"),
                    },
                    _ = shutdown.recv() => break,
                }
            }
            info!("Account refresh loop stopping");
        })
    }
}

impl Inner {
    async fn build_and_install(&self) -> Option<Arc<AccountSnapshot>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let Some(venue) = self.venue.as_ref() else {
            debug!("No wallet configured, skipping account refresh");
            return None;
        };
        let creds = match self.credentials.require().await {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "Skipping account refresh");
                return None;
            }
        };

        let snapshot = Arc::new(self.build(venue.as_ref(), &creds).await?);
        {
            let mut slot = self.snapshot.write();
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Snapshot invalidated during refresh, not installing");
                return Some(snapshot);
            }
            *slot = Some(Arc::clone(&snapshot));
        }

        if let Err(e) = store::save(self.store.as_ref(), SNAPSHOT_KEY, snapshot.as_ref()).await {
            warn!(error = %e, "Failed to persist account snapshot");
        }
        Some(snapshot)
    }

    /// Tokens whose conditional balances are fetched: configured ids first,
    /// then instruments from the previous snapshot, capped.
    fn tracked_tokens(&self) -> Vec<String> {
        let previous = self.snapshot.read().clone();
        let discovered = previous.iter().flat_map(|s| {
            s.positions
                .iter()
                .map(|p| p.instrument_id.clone())
                .chain(s.active_orders.iter().filter_map(|o| o.asset_id.clone()))
                .collect::<Vec<_>>()
        });

        let mut seen = HashSet::new();
        self.config
            .tracked_token_ids
            .iter()
            .cloned()
            .chain(discovered)
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .take(self.config.max_tracked_tokens)
            .collect()
    }

    async fn fetch_balances(
        &self,
        venue: &dyn VenueClient,
        creds: &ApiCreds,
        tokens: &[String],
    ) -> Result<Balances, VenueError> {
        let collateral = venue
            .get_balance_allowance(creds, &BalanceAllowanceParams::collateral())
            .await?;

        let results = join_all(tokens.iter().map(|token| async move {
            let params = BalanceAllowanceParams::conditional(token.clone());
            (token, venue.get_balance_allowance(creds, &params).await)
        }))
        .await;

        let mut balances = Balances {
            collateral: BalanceView::from_raw(&collateral),
            tokens: BTreeMap::new(),
        };
        for (token, result) in results {
            match result {
                Ok(raw) => {
                    balances.tokens.insert(token.clone(), BalanceView::from_raw(&raw));
                }
                Err(e) => debug!(token = %token, error = %e, "Token balance unavailable"),
            }
        }
        Ok(balances)
    }

    async fn build(&self, venue: &dyn VenueClient, creds: &ApiCreds) -> Option<AccountSnapshot> {
        let limit = self.config.fetch_timeout;
        let tokens = self.tracked_tokens();

        let (balances, orders, trades, keys) = tokio::join!(
            bounded(limit, "balances", self.fetch_balances(venue, creds, &tokens)),
            bounded(limit, "open_orders", venue.get_open_orders(creds)),
            bounded(
                limit,
                "trades",
                venue.get_trades(creds, self.config.trade_page_limit, self.config.trade_max_pages)
            ),
            bounded(limit, "api_keys", venue.get_api_keys(creds)),
        );

        if balances.is_none() && orders.is_none() && trades.is_none() && keys.is_none() {
            warn!("Every account fetch failed, keeping previous snapshot");
            return None;
        }

        let balances = balances.unwrap_or_default();
        let active_orders = orders.unwrap_or_default();
        let trades = trades.unwrap_or_default();
        let keys = keys.unwrap_or_default();

        let order_ids: Vec<String> = active_orders.iter().map(|o| o.id.clone()).collect();
        let order_scoring_status = if order_ids.is_empty() {
            BTreeMap::new()
        } else {
            let scored = bounded(limit, "order_scoring", venue.get_order_scoring(creds, &order_ids))
                .await
                .unwrap_or_default();
            order_ids
                .iter()
                .map(|id| (id.clone(), scored.get(id).copied().unwrap_or(false)))
                .collect()
        };

        // Venue lists newest first; replay oldest first by `match_time`
        // (unix seconds, unparseable as 0), stable on ties
        let mut replay: Vec<&TradeEntry> = trades
            .iter()
            .rev()
            .filter(|t| !t.status.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("FAILED")))
            .collect();
        replay.sort_by_key(|t| t.match_time_secs().unwrap_or(0));
        let positions = positions_from_trades(replay);

        let wallet_address = venue.address();
        let proxy_wallet = if self.config.detect_proxy_wallet
            && balances.collateral.balance.is_some_and(|b| b.is_zero())
        {
            detect_proxy_wallet(&wallet_address, &trades)
        } else {
            None
        };
        if let Some(proxy) = &proxy_wallet {
            info!(wallet = %wallet_address, proxy = %proxy, "Detected proxy wallet from trade history");
        }

        let recent_trades: Vec<TradeEntry> = trades
            .into_iter()
            .take(self.config.recent_trades_cap)
            .collect();

        let last_updated_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::zero());

        info!(
            orders = active_orders.len(),
            trades = recent_trades.len(),
            positions = positions.len(),
            tokens = balances.tokens.len(),
            "Account snapshot refreshed"
        );

        Some(AccountSnapshot {
            wallet_address,
            proxy_wallet,
            balances,
            active_orders,
            recent_trades,
            positions,
            order_scoring_status,
            api_keys_meta: keys.api_keys,
            cert_required: keys.cert_required,
            last_updated_at,
            expires_at: last_updated_at + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(maker: &str) -> TradeEntry {
        serde_json::from_value(serde_json::json!({
            "id": "t",
            "market": "m",
            "asset_id": "a",
            "side": "BUY",
            "maker_address": maker
        }))
        .unwrap()
    }

    #[test]
    fn test_normalize_amount_heuristic() {
        // Base units
        assert_eq!(normalize_amount("12500000"), Some(dec!(12.5)));
        // Already decimal
        assert_eq!(normalize_amount("12.5"), Some(dec!(12.5)));
        assert_eq!(normalize_amount("0"), Some(Decimal::ZERO));
        assert_eq!(normalize_amount(" 1000000 "), Some(dec!(1)));
        assert_eq!(normalize_amount("abc"), None);
    }

    #[test]
    fn test_detect_proxy_wallet() {
        let wallet = "0xAbC";
        let trades = vec![
            trade("0xabc"),
            trade("0xproxy"),
            trade("0xproxy"),
            trade("0xother"),
            trade(""),
        ];
        assert_eq!(detect_proxy_wallet(wallet, &trades), Some("0xproxy".to_string()));
        assert_eq!(detect_proxy_wallet(wallet, &[trade("0xabc")]), None);
    }

    #[test]
    fn test_detect_proxy_wallet_tie_is_deterministic() {
        let trades = vec![trade("0xbbb"), trade("0xaaa")];
        assert_eq!(detect_proxy_wallet("0xw", &trades), Some("0xaaa".to_string()));
    }

    #[test]
    fn test_snapshot_expiry() {
        let now = Utc::now();
        let snapshot = AccountSnapshot {
            wallet_address: "0xw".to_string(),
            proxy_wallet: None,
            balances: Balances::default(),
            active_orders: vec![],
            recent_trades: vec![],
            positions: vec![],
            order_scoring_status: BTreeMap::new(),
            api_keys_meta: vec![],
            cert_required: None,
            last_updated_at: now,
            expires_at: now + chrono::Duration::seconds(10),
        };
        assert!(!snapshot.is_expired_at(now));
        assert!(snapshot.is_expired_at(now + chrono::Duration::seconds(10)));
        assert_eq!(snapshot.summary().active_orders, 0);
    }
}
