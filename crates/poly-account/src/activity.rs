//! What the account owner last looked at.
//!
//! One slot per activity type plus a bounded newest-first history, persisted
//! on every record. Reads are cache-only; the durable copy is loaded at most
//! once per process.
//!
//! Records are serialized: each one mutates the state and writes it out
//! while holding `write_lock`, so the last persisted copy always equals the
//! in-memory state once recording settles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use poly_common::{KeyValueStore, store};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

/// Durable store key for the activity context.
pub const ACTIVITY_KEY: &str = "polymarket:activity_context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Markets,
    MarketDetails,
    OrderBook,
    PriceHistory,
    Search,
    OrderPlaced,
    OrderCancelled,
    Orders,
    Trades,
    Positions,
    Balances,
    ApiKeys,
    Realtime,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Markets => "markets",
            ActivityType::MarketDetails => "market_details",
            ActivityType::OrderBook => "order_book",
            ActivityType::PriceHistory => "price_history",
            ActivityType::Search => "search",
            ActivityType::OrderPlaced => "order_placed",
            ActivityType::OrderCancelled => "order_cancelled",
            ActivityType::Orders => "orders",
            ActivityType::Trades => "trades",
            ActivityType::Positions => "positions",
            ActivityType::Balances => "balances",
            ActivityType::ApiKeys => "api_keys",
            ActivityType::Realtime => "realtime",
        }
    }

    /// Activities after which cached account state is stale.
    pub fn mutates_account(&self) -> bool {
        matches!(self, ActivityType::OrderPlaced | ActivityType::OrderCancelled)
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCursor {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ActivityCursor {
    pub fn new(activity_type: ActivityType, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            activity_type,
            payload,
        }
    }
}

/// Persisted shape of the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    #[serde(default)]
    pub last_activity_by_type: BTreeMap<ActivityType, ActivityCursor>,
    #[serde(default)]
    pub recent_history: VecDeque<ActivityCursor>,
}

impl ActivityState {
    pub fn is_empty(&self) -> bool {
        self.last_activity_by_type.is_empty() && self.recent_history.is_empty()
    }

    pub fn last(&self, activity_type: ActivityType) -> Option<&ActivityCursor> {
        self.last_activity_by_type.get(&activity_type)
    }

    fn push(&mut self, cursor: ActivityCursor, max_history: usize) {
        self.last_activity_by_type
            .insert(cursor.activity_type, cursor.clone());
        self.recent_history.push_front(cursor);
        self.recent_history.truncate(max_history);
    }
}

pub struct ActivityContext {
    store: Arc<dyn KeyValueStore>,
    max_history: usize,
    state: RwLock<ActivityState>,
    write_lock: Mutex<()>,
    loaded: OnceCell<()>,
}

impl ActivityContext {
    pub fn new(store: Arc<dyn KeyValueStore>, max_history: usize) -> Self {
        Self {
            store,
            max_history: max_history.max(1),
            state: RwLock::new(ActivityState::default()),
            write_lock: Mutex::new(()),
            loaded: OnceCell::new(),
        }
    }

    /// Current context. Never suspends.
    pub fn get(&self) -> ActivityState {
        self.state.read().clone()
    }

    /// Current context, loading the durable copy on the first miss.
    pub async fn get_or_load(&self) -> ActivityState {
        if self.state.read().is_empty() {
            self.load().await;
        }
        self.get()
    }

    /// Merge the durable copy into memory. Runs at most once; later calls
    /// return immediately.
    pub async fn load(&self) {
        self.loaded
            .get_or_init(|| async {
                match store::load::<ActivityState>(self.store.as_ref(), ACTIVITY_KEY).await {
                    Ok(Some(persisted)) => {
                        let mut state = self.state.write();
                        // Entries recorded before the load are newer
                        for (kind, cursor) in persisted.last_activity_by_type {
                            state.last_activity_by_type.entry(kind).or_insert(cursor);
                        }
                        state.recent_history.extend(persisted.recent_history);
                        state.recent_history.truncate(self.max_history);
                        debug!(entries = state.recent_history.len(), "Loaded activity context");
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Failed to load activity context"),
                }
            })
            .await;
    }

    /// Record an activity and persist the context.
    pub async fn record(
        &self,
        activity_type: ActivityType,
        payload: serde_json::Value,
    ) -> ActivityCursor {
        self.load().await;

        let _guard = self.write_lock.lock().await;
        let cursor = ActivityCursor::new(activity_type, payload);
        let snapshot = {
            let mut state = self.state.write();
            state.push(cursor.clone(), self.max_history);
            state.clone()
        };

        if let Err(e) = store::save(self.store.as_ref(), ACTIVITY_KEY, &snapshot).await {
            warn!(error = %e, activity = %activity_type, "Failed to persist activity context");
        }
        cursor
    }
}
