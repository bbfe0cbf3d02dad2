//! Account state cache against a scripted venue.
//!
//! Covers single-flight refresh, snapshot swaps, TTL expiry, degraded
//! fetches, scoring, positions and restore from the durable store.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, MockVenue, WALLET, cache_config, counted, order, trade};
use poly_account::config::CacheConfig;
use poly_common::{FileStore, KeyValueStore};
use poly_market::BalanceAllowance;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

// ============================================================================
// Single-flight and atomic swap
// ============================================================================

#[tokio::test]
async fn test_concurrent_refreshes_share_one_batch() {
    let h = Harness::new(
        MockVenue::new().with_delay(Duration::from_millis(100)),
        cache_config(),
    );
    h.venue.orders.lock().push(order("o1", "tok-a"));

    let refreshes: Vec<_> = (0..8)
        .map(|_| {
            let cache = h.cache.clone();
            tokio::spawn(async move { cache.refresh().await })
        })
        .collect();

    let mut snapshots = Vec::new();
    for handle in refreshes {
        snapshots.push(handle.await.unwrap().expect("snapshot"));
    }

    for snapshot in &snapshots[1..] {
        assert!(Arc::ptr_eq(&snapshots[0], snapshot));
    }
    assert_eq!(counted(&h.venue.calls.collateral), 1);
    assert_eq!(counted(&h.venue.calls.orders), 1);
    assert_eq!(counted(&h.venue.calls.trades), 1);
    assert_eq!(counted(&h.venue.calls.api_keys), 1);
    assert_eq!(counted(&h.venue.calls.scoring), 1);
}

#[tokio::test]
async fn test_sequential_refreshes_each_hit_the_venue() {
    let h = Harness::new(MockVenue::new(), cache_config());

    h.cache.refresh().await.expect("first");
    h.cache.refresh().await.expect("second");

    assert_eq!(counted(&h.venue.calls.trades), 2);
}

#[tokio::test]
async fn test_readers_see_old_snapshot_during_refresh() {
    let h = Harness::new(
        MockVenue::new().with_delay(Duration::from_millis(200)),
        cache_config(),
    );
    h.venue.orders.lock().push(order("o1", "tok-a"));
    let first = h.cache.refresh().await.expect("first");

    h.venue.orders.lock().push(order("o2", "tok-b"));
    let cache = h.cache.clone();
    let pending = tokio::spawn(async move { cache.refresh().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let during = h.cache.get_cached().expect("old snapshot stays readable");
    assert!(Arc::ptr_eq(&first, &during));
    assert_eq!(during.active_orders.len(), 1);

    let second = pending.await.unwrap().expect("second");
    assert_eq!(second.active_orders.len(), 2);
    assert!(Arc::ptr_eq(&second, &h.cache.get_cached().unwrap()));
}

#[tokio::test]
async fn test_invalidate_during_refresh_discards_stale_result() {
    let h = Harness::new(
        MockVenue::new().with_delay(Duration::from_millis(200)),
        cache_config(),
    );
    h.venue.orders.lock().push(order("o1", "tok-a"));

    let cache = h.cache.clone();
    let pending = tokio::spawn(async move { cache.refresh().await });

    // Orders were read at ~200ms; scoring keeps the refresh running
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.venue.orders.lock().push(order("o2", "tok-b"));
    h.cache.invalidate();

    let stale = pending.await.unwrap().expect("stale");
    assert_eq!(stale.active_orders.len(), 1);
    assert!(h.cache.get_cached().is_none());

    let fresh = h.cache.get().await.expect("fresh");
    assert_eq!(fresh.active_orders.len(), 2);
    assert_eq!(counted(&h.venue.calls.orders), 2);
    assert!(Arc::ptr_eq(&fresh, &h.cache.get_cached().unwrap()));
}

#[tokio::test]
async fn test_refresh_after_invalidate_starts_new_flight() {
    let h = Harness::new(
        MockVenue::new().with_delay(Duration::from_millis(150)),
        cache_config(),
    );

    let cache = h.cache.clone();
    let first = tokio::spawn(async move { cache.refresh().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.cache.invalidate();

    let second = h.cache.refresh().await.expect("second");
    first.await.unwrap().expect("first");

    assert_eq!(counted(&h.venue.calls.trades), 2);
    assert!(Arc::ptr_eq(&second, &h.cache.get_cached().unwrap()));
}

// ============================================================================
// TTL and invalidation
// ============================================================================

#[tokio::test]
async fn test_snapshot_expires_after_ttl() {
    let config = CacheConfig {
        ttl: Duration::from_millis(100),
        ..cache_config()
    };
    let h = Harness::new(MockVenue::new(), config);

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert!(snapshot.expires_at > snapshot.last_updated_at);
    assert!(h.cache.get_cached().is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.cache.get_cached().is_none());

    // get() refreshes on a miss
    assert!(h.cache.get().await.is_some());
    assert_eq!(counted(&h.venue.calls.trades), 2);
}

#[tokio::test]
async fn test_get_serves_cached_without_fetching() {
    let h = Harness::new(MockVenue::new(), cache_config());

    h.cache.get().await.expect("first");
    h.cache.get().await.expect("cached");
    assert_eq!(counted(&h.venue.calls.trades), 1);
}

#[tokio::test]
async fn test_invalidate_keeps_durable_copy() {
    let h = Harness::new(MockVenue::new(), cache_config());
    h.cache.refresh().await.expect("snapshot");

    h.cache.invalidate();
    assert!(h.cache.get_cached().is_none());

    assert!(h.cache.restore().await);
    assert!(h.cache.get_cached().is_some());
}

// ============================================================================
// Degraded fetches
// ============================================================================

#[tokio::test]
async fn test_failed_trades_degrade_to_empty() {
    let venue = MockVenue::new();
    MockVenue::fail(&venue.fail_trades);
    venue.orders.lock().push(order("o1", "tok-a"));
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("partial snapshot");
    assert!(snapshot.recent_trades.is_empty());
    assert!(snapshot.positions.is_empty());
    assert_eq!(snapshot.active_orders.len(), 1);
    assert_eq!(snapshot.balances.collateral.balance, Some(dec!(25)));
    assert_eq!(snapshot.balances.collateral.allowance, Some(dec!(1000)));
}

#[tokio::test]
async fn test_slow_fetch_times_out_to_empty() {
    let config = CacheConfig {
        fetch_timeout: Duration::from_millis(100),
        ..cache_config()
    };
    let venue = MockVenue::new().with_trades_delay(Duration::from_millis(500));
    venue.trades.lock().push(trade("t1", "tok-a", "BUY", "5", "0.5", 100));
    let h = Harness::new(venue, config);

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert!(snapshot.recent_trades.is_empty());
    assert_eq!(snapshot.api_keys_meta.len(), 1);
}

#[tokio::test]
async fn test_all_fetches_failing_yields_none() {
    let venue = MockVenue::new();
    for flag in [
        &venue.fail_balances,
        &venue.fail_orders,
        &venue.fail_trades,
        &venue.fail_api_keys,
    ] {
        MockVenue::fail(flag);
    }
    let h = Harness::new(venue, cache_config());

    assert!(h.cache.refresh().await.is_none());
    assert!(h.cache.get_cached().is_none());
}

#[tokio::test]
async fn test_total_failure_keeps_previous_snapshot() {
    let h = Harness::new(MockVenue::new(), cache_config());
    let first = h.cache.refresh().await.expect("first");

    for flag in [
        &h.venue.fail_balances,
        &h.venue.fail_orders,
        &h.venue.fail_trades,
        &h.venue.fail_api_keys,
    ] {
        MockVenue::fail(flag);
    }
    assert!(h.cache.refresh().await.is_none());
    assert!(Arc::ptr_eq(&first, &h.cache.get_cached().unwrap()));
}

#[tokio::test]
async fn test_no_credentials_skips_refresh() {
    let venue = MockVenue::new();
    MockVenue::fail(&venue.fail_derive);
    let h = Harness::unconfigured(venue, false);

    assert!(h.cache.refresh().await.is_none());
    assert_eq!(counted(&h.venue.calls.trades), 0);
    assert_eq!(counted(&h.venue.calls.create), 0);
}

// ============================================================================
// Scoring, balances and positions
// ============================================================================

#[tokio::test]
async fn test_scoring_fetched_only_for_open_orders() {
    let venue = MockVenue::new();
    venue.orders.lock().extend([order("o1", "tok-a"), order("o2", "tok-b")]);
    venue.scoring.lock().extend([("o1".to_string(), true), ("o9".to_string(), true)]);
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    let expected: BTreeMap<String, bool> =
        [("o1".to_string(), true), ("o2".to_string(), false)].into();
    assert_eq!(snapshot.order_scoring_status, expected);
    assert_eq!(
        *h.venue.scoring_requests.lock(),
        vec![vec!["o1".to_string(), "o2".to_string()]]
    );
    assert_eq!(snapshot.summary().scoring_orders, 1);
}

#[tokio::test]
async fn test_no_orders_no_scoring_call() {
    let h = Harness::new(MockVenue::new(), cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert!(snapshot.order_scoring_status.is_empty());
    assert_eq!(counted(&h.venue.calls.scoring), 0);
}

#[tokio::test]
async fn test_failed_scoring_defaults_to_false() {
    let venue = MockVenue::new();
    MockVenue::fail(&venue.fail_scoring);
    venue.orders.lock().push(order("o1", "tok-a"));
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert_eq!(snapshot.order_scoring_status.get("o1"), Some(&false));
}

#[tokio::test]
async fn test_token_balances_follow_known_instruments() {
    let venue = MockVenue::new();
    venue.orders.lock().push(order("o1", "tok-a"));
    venue.token_balances.lock().insert(
        "tok-a".to_string(),
        BalanceAllowance {
            balance: Some("5000000".to_string()),
            allowance: None,
        },
    );
    let config = CacheConfig {
        tracked_token_ids: vec!["tok-cfg".to_string()],
        ..cache_config()
    };
    let h = Harness::new(venue, config);

    // First pass only knows the configured token, which the venue rejects
    let first = h.cache.refresh().await.expect("first");
    assert!(first.balances.tokens.is_empty());
    assert_eq!(counted(&h.venue.calls.token_balances), 1);

    // Second pass also tracks the open order's instrument
    let second = h.cache.refresh().await.expect("second");
    assert_eq!(counted(&h.venue.calls.token_balances), 3);
    assert_eq!(second.balances.tokens["tok-a"].balance, Some(dec!(5)));
    assert_eq!(second.balances.tokens["tok-a"].allowance, None);
}

#[tokio::test]
async fn test_positions_replay_oldest_first() {
    let venue = MockVenue::new();
    let mut failed = trade("t4", "tok-a", "SELL", "6", "0.9", 400);
    failed.status = Some("FAILED".to_string());
    // Venue order: newest first
    venue.trades.lock().extend([
        failed,
        trade("t3", "tok-a", "SELL", "4", "0.6", 300),
        trade("t2", "tok-a", "BUY", "6", "0.5", 200),
        trade("t1", "tok-a", "BUY", "4", "0.4", 100),
        trade("t0", "tok-b", "SELL", "2", "0.3", 50),
    ]);
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert_eq!(snapshot.recent_trades.len(), 5);
    assert_eq!(snapshot.recent_trades[0].id, "t4");

    assert_eq!(snapshot.positions.len(), 2);
    let b = &snapshot.positions[0];
    assert_eq!(b.instrument_id, "tok-b");
    assert_eq!(b.size, dec!(-2));
    assert_eq!(b.average_price, dec!(0.3));

    let a = &snapshot.positions[1];
    assert_eq!(a.instrument_id, "tok-a");
    assert_eq!(a.market, "market-tok-a");
    assert_eq!(a.size, dec!(6));
    assert_eq!(a.average_price, dec!(0.46));
    assert_eq!(a.realized_pnl, dec!(0.56));
}

#[tokio::test]
async fn test_recent_trades_capped() {
    let venue = MockVenue::new();
    venue.trades.lock().extend(
        (0..10).map(|i| trade(&format!("t{i}"), "tok-a", "BUY", "1", "0.5", 1000 - i)),
    );
    let config = CacheConfig {
        recent_trades_cap: 3,
        ..cache_config()
    };
    let h = Harness::new(venue, config);

    let snapshot = h.cache.refresh().await.expect("snapshot");
    let ids: Vec<&str> = snapshot.recent_trades.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["t0", "t1", "t2"]);
    // Positions still see every fill
    assert_eq!(snapshot.positions[0].size, dec!(10));
}

#[tokio::test]
async fn test_proxy_wallet_detected_on_zero_balance() {
    let venue = MockVenue::new();
    venue.collateral.lock().balance = Some("0".to_string());
    venue.trades.lock().extend((0..3).map(|i| {
        let mut t = trade(&format!("t{i}"), "tok-a", "BUY", "1", "0.5", 100 + i);
        t.maker_address = Some("0xproxy".to_string());
        t
    }));
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert_eq!(snapshot.wallet_address, WALLET);
    assert_eq!(snapshot.proxy_wallet.as_deref(), Some("0xproxy"));
}

#[tokio::test]
async fn test_proxy_wallet_skipped_when_funded() {
    let venue = MockVenue::new();
    let mut t = trade("t1", "tok-a", "BUY", "1", "0.5", 100);
    t.maker_address = Some("0xproxy".to_string());
    venue.trades.lock().push(t);
    let h = Harness::new(venue, cache_config());

    let snapshot = h.cache.refresh().await.expect("snapshot");
    assert_eq!(snapshot.proxy_wallet, None);
}

// ============================================================================
// Persistence and background refresh
// ============================================================================

#[tokio::test]
async fn test_restore_from_file_store() {
    let dir = tempfile::tempdir().unwrap();

    let first = Harness::with_store(
        MockVenue::new(),
        cache_config(),
        Arc::new(FileStore::new(dir.path())),
    );
    first.venue.orders.lock().push(order("o1", "tok-a"));
    let saved = first.cache.refresh().await.expect("snapshot");

    let second = Harness::with_store(
        MockVenue::new(),
        cache_config(),
        Arc::new(FileStore::new(dir.path())),
    );
    assert!(second.cache.get_cached().is_none());
    assert!(second.cache.restore().await);

    let restored = second.cache.get_cached().expect("restored");
    assert_eq!(*restored, *saved);
    assert_eq!(counted(&second.venue.calls.orders), 0);
}

#[tokio::test]
async fn test_expired_persisted_snapshot_ignored() {
    let config = CacheConfig {
        ttl: Duration::from_millis(50),
        ..cache_config()
    };
    let h = Harness::new(MockVenue::new(), config);
    h.cache.refresh().await.expect("snapshot");
    h.cache.invalidate();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.cache.restore().await);
    assert!(h.store.get(poly_account::cache::SNAPSHOT_KEY).await.unwrap().is_some());
}

#[tokio::test]
async fn test_refresh_loop_runs_until_shutdown() {
    let h = Harness::new(MockVenue::new(), cache_config());
    let (tx, rx) = broadcast::channel(1);

    let handle = h.cache.spawn_refresh_loop(Duration::from_millis(50), rx);
    tokio::time::sleep(Duration::from_millis(180)).await;
    tx.send(()).unwrap();
    handle.await.unwrap();

    let runs = counted(&h.venue.calls.trades);
    assert!(runs >= 2, "expected repeated refreshes, got {runs}");
    assert!(h.cache.get_cached().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counted(&h.venue.calls.trades), runs);
}
