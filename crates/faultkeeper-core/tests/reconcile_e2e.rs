//! End-to-end reconciliation tests against an in-memory proxy engine and
//! a real on-disk control database, with a second connection playing the
//! external test harness.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use faultkeeper_core::engine::EngineError;
use faultkeeper_core::gateway::{GatewayError, ProxyApi, ToxicDirection};
use faultkeeper_core::{
    CompletionReason, ControlStore, FaultInjector, ProxyCatalog, ProxySpec, Reconciler,
    ReconcilerConfig, RetryPolicy,
};

#[derive(Default)]
struct EngineState {
    proxies: HashSet<String>,
    toxics: HashMap<String, HashSet<String>>,
}

/// In-memory stand-in for the proxy engine with call counters and
/// failure injection.
#[derive(Default)]
struct MockEngine {
    state: Mutex<EngineState>,
    add_toxic_calls: AtomicU32,
    delete_calls: AtomicU32,
    /// Number of toxic-operation calls that fail before succeeding.
    fail_next: AtomicU32,
    /// When set, every add_toxic call fails.
    fail_add_toxic: AtomicBool,
}

impl MockEngine {
    fn maybe_fail(&self) -> Result<(), GatewayError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    fn proxy_names(&self) -> HashSet<String> {
        self.state.lock().expect("lock").proxies.clone()
    }

    fn toxics_of(&self, proxy: &str) -> HashSet<String> {
        self.state
            .lock()
            .expect("lock")
            .toxics
            .get(proxy)
            .cloned()
            .unwrap_or_default()
    }

    fn toxic_count(&self) -> usize {
        self.state
            .lock()
            .expect("lock")
            .toxics
            .values()
            .map(HashSet::len)
            .sum()
    }
}

#[async_trait]
impl ProxyApi for MockEngine {
    async fn create_proxy(&self, spec: &ProxySpec) -> Result<(), GatewayError> {
        let mut state = self.state.lock().expect("lock");
        if !state.proxies.insert(spec.name.clone()) {
            return Err(GatewayError::Api {
                status: 409,
                message: "proxy already exists".to_string(),
            });
        }
        Ok(())
    }

    async fn has_toxic(&self, proxy: &str, toxic: &str) -> Result<bool, GatewayError> {
        self.maybe_fail()?;
        let state = self.state.lock().expect("lock");
        Ok(state
            .toxics
            .get(proxy)
            .is_some_and(|set| set.contains(toxic)))
    }

    async fn add_toxic(&self, proxy: &str, direction: ToxicDirection) -> Result<(), GatewayError> {
        self.add_toxic_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_add_toxic.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 500,
                message: "engine unavailable".to_string(),
            });
        }
        self.maybe_fail()?;
        let mut state = self.state.lock().expect("lock");
        state
            .toxics
            .entry(proxy.to_string())
            .or_default()
            .insert(direction.toxic_name().to_string());
        Ok(())
    }

    async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<(), GatewayError> {
        self.maybe_fail()?;
        let mut state = self.state.lock().expect("lock");
        let removed = state
            .toxics
            .get_mut(proxy)
            .is_some_and(|set| set.remove(toxic));
        if removed {
            Ok(())
        } else {
            Err(GatewayError::Api {
                status: 404,
                message: "toxic not found".to_string(),
            })
        }
    }

    async fn delete_proxy(&self, proxy: &str) -> Result<(), GatewayError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("lock");
        if state.proxies.remove(proxy) {
            state.toxics.remove(proxy);
            Ok(())
        } else {
            Err(GatewayError::Api {
                status: 404,
                message: "proxy not found".to_string(),
            })
        }
    }
}

fn catalog() -> ProxyCatalog {
    ProxyCatalog::new(vec![
        ProxySpec::new("search_proxy", "0.0.0.0:6000", "search_tool:5000"),
        ProxySpec::new("weather_proxy", "0.0.0.0:6001", "weather_tool:5001"),
    ])
}

/// One test scenario: temp database, mock engine, assembled reconciler.
struct Scenario {
    _dir: tempfile::TempDir,
    engine: Arc<MockEngine>,
    store: ControlStore,
    harness: rusqlite::Connection,
    reconciler: Reconciler,
}

fn scenario() -> Scenario {
    scenario_with(ReconcilerConfig::default().with_poll_interval(Duration::from_millis(5)))
}

fn scenario_with(config: ReconcilerConfig) -> Scenario {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let db_path = dir.path().join("control.db");

    let store = ControlStore::open(&db_path).expect("open store");
    // Schema up front so the harness can write before the engine starts,
    // as it can in the real deployment.
    store.initialize().expect("initialize");
    let harness = harness_connection(&db_path);

    let engine = Arc::new(MockEngine::default());
    let injector = FaultInjector::new(
        Arc::clone(&engine) as Arc<dyn ProxyApi>,
        RetryPolicy::new(2, Duration::ZERO),
    );
    let reconciler = Reconciler::new(
        store.clone(),
        injector,
        catalog(),
        RetryPolicy::new(2, Duration::ZERO),
        config,
    );

    Scenario {
        _dir: dir,
        engine,
        store,
        harness,
        reconciler,
    }
}

fn harness_connection(path: &Path) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(path).expect("harness connection");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn
}

fn exec(conn: &rusqlite::Connection, sql: &str) {
    conn.execute(sql, []).expect("harness write");
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {what}"));
}

#[tokio::test]
async fn reaching_the_target_tears_everything_down() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET count = 3, data_size = 3 WHERE id = 1");

    let reason = s.reconciler.run().await.expect("clean exit");

    assert_eq!(reason, CompletionReason::TargetReached);
    assert!(s.engine.proxy_names().is_empty(), "all proxies deleted");
    // Both catalog proxies were created before teardown deleted them.
    assert_eq!(s.engine.delete_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn completion_takes_precedence_over_pending_events() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET count = 1 WHERE id = 1");

    let reason = s.reconciler.run().await.expect("clean exit");

    assert_eq!(reason, CompletionReason::TargetReached);
    // The pending inject event was never applied: teardown made it moot.
    assert_eq!(s.engine.add_toxic_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inject_event_converges_every_proxy() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");

    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("one toxic per proxy", || {
        let engine = Arc::clone(&engine);
        async move {
            engine.toxics_of("search_proxy").len() == 1
                && engine.toxics_of("weather_proxy").len() == 1
        }
    })
    .await;

    exec(&s.harness, "UPDATE control SET count = 100 WHERE id = 1");
    let reason = handle.await.expect("join").expect("clean exit");
    assert_eq!(reason, CompletionReason::TargetReached);
    assert!(engine.proxy_names().is_empty());
}

#[tokio::test]
async fn clear_event_removes_all_toxics() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");

    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("toxics active", || {
        let engine = Arc::clone(&engine);
        async move { engine.toxic_count() == 2 }
    })
    .await;

    exec(&s.harness, "UPDATE control SET inject = 0 WHERE id = 1");
    wait_until("toxics cleared", || {
        let engine = Arc::clone(&engine);
        async move { engine.toxic_count() == 0 }
    })
    .await;

    exec(&s.harness, "UPDATE control SET count = 100 WHERE id = 1");
    handle.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn shutdown_request_drains_exactly_once() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");

    let shutdown = s.reconciler.shutdown_handle();
    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("proxies created", || {
        let engine = Arc::clone(&engine);
        async move { engine.proxy_names().len() == 2 }
    })
    .await;

    shutdown.store(true, Ordering::SeqCst);
    let reason = handle.await.expect("join").expect("clean exit");

    assert_eq!(reason, CompletionReason::ShutdownRequested);
    assert!(engine.proxy_names().is_empty());
    assert_eq!(engine.delete_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn consecutive_event_failures_abort_and_still_tear_down() {
    let config = ReconcilerConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_max_consecutive_failures(2);
    let s = scenario_with(config);

    s.engine.fail_add_toxic.store(true, Ordering::SeqCst);
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");

    let err = s.reconciler.run().await.expect_err("failure limit");
    assert!(matches!(err, EngineError::FailureLimit { failures: 2 }));
    // Fatal exit still fails safe: no proxies left behind.
    assert!(s.engine.proxy_names().is_empty());
}

#[tokio::test]
async fn failed_event_is_retried_until_it_converges() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");

    // Exhaust the first event attempt entirely (2 retry attempts), so
    // convergence only happens on a later tick's redelivery.
    s.engine.fail_next.store(6, Ordering::SeqCst);

    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("eventual convergence", || {
        let engine = Arc::clone(&engine);
        async move { engine.toxic_count() == 2 }
    })
    .await;

    exec(&s.harness, "UPDATE control SET count = 100 WHERE id = 1");
    handle.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn events_apply_in_timestamp_order_not_insertion_order() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");

    // Newer clear event inserted first, older inject event second; the
    // engine must apply inject then clear, ending with no toxics.
    exec(
        &s.harness,
        "INSERT INTO events (event_type, old_value, new_value, timestamp, processed)
         VALUES ('inject_changed', 1, 0, '2026-01-01T00:00:02.000', 0)",
    );
    exec(
        &s.harness,
        "INSERT INTO events (event_type, old_value, new_value, timestamp, processed)
         VALUES ('inject_changed', 0, 1, '2026-01-01T00:00:01.000', 0)",
    );

    let engine = Arc::clone(&s.engine);
    let store = s.store.clone();
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("both events consumed", || {
        let store = store.clone();
        async move {
            store
                .drain_events_async()
                .await
                .map(|events| events.is_empty())
                .unwrap_or(false)
        }
    })
    .await;

    assert!(
        engine.add_toxic_calls.load(Ordering::SeqCst) >= 2,
        "older inject event was applied"
    );
    assert_eq!(engine.toxic_count(), 0, "newer clear event won");

    exec(&s.harness, "UPDATE control SET count = 100 WHERE id = 1");
    handle.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn drain_failures_spend_the_budget_instead_of_aborting_outright() {
    let config = ReconcilerConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_max_consecutive_failures(2);
    let s = scenario_with(config);
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");

    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("proxies created", || {
        let engine = Arc::clone(&engine);
        async move { engine.proxy_names().len() == 2 }
    })
    .await;

    // Make every subsequent drain fail. The first exhausted drain must be
    // absorbed by the failure budget; only the second is fatal.
    exec(&s.harness, "DROP TABLE events");

    let err = handle.await.expect("join").expect_err("budget spent");
    assert!(matches!(err, EngineError::FailureLimit { failures: 2 }));
    assert!(s.engine.proxy_names().is_empty(), "teardown still ran");
}

#[tokio::test]
async fn drain_failures_within_the_budget_recover() {
    let config = ReconcilerConfig::default()
        .with_poll_interval(Duration::from_millis(50))
        .with_max_consecutive_failures(3);
    let s = scenario_with(config);
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");

    let engine = Arc::clone(&s.engine);
    let handle = tokio::spawn(s.reconciler.run());

    wait_until("proxies created", || {
        let engine = Arc::clone(&engine);
        async move { engine.proxy_names().len() == 2 }
    })
    .await;

    // Break the queue for roughly one tick, then restore it before the
    // budget (3 failures, one per 50ms tick) is spent.
    exec(&s.harness, "DROP TABLE events");
    tokio::time::sleep(Duration::from_millis(60)).await;
    exec(
        &s.harness,
        "CREATE TABLE events (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             event_type TEXT NOT NULL,
             old_value INTEGER NOT NULL,
             new_value INTEGER NOT NULL,
             timestamp TEXT NOT NULL,
             processed INTEGER NOT NULL DEFAULT 0
         )",
    );

    exec(&s.harness, "UPDATE control SET count = 100 WHERE id = 1");
    let reason = handle.await.expect("join").expect("recovered");
    assert_eq!(reason, CompletionReason::TargetReached);
}

#[tokio::test]
async fn repeated_harness_writes_of_same_value_enqueue_nothing() {
    let s = scenario();
    exec(&s.harness, "UPDATE control SET data_size = 100 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");
    exec(&s.harness, "UPDATE control SET inject = 1 WHERE id = 1");

    let events = s.store.drain_events().expect("drain");
    assert_eq!(events.len(), 1, "equal writes are silent");
}
