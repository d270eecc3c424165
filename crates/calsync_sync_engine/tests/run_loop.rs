//! The background loop with real timers.

use calsync_core::{EntityKind, Fields, Replica, SyncStatus};
use calsync_sync_engine::{
    connectivity, CancellationToken, Connectivity, EngineState, MockRemote, RemoteError,
    RetryConfig, SyncConfig, SyncEngine, SyncEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn name(value: &str) -> Fields {
    [("name".to_string(), json!(value))].into_iter().collect()
}

fn config() -> SyncConfig {
    SyncConfig::default()
        .with_timeout(Duration::from_millis(200))
        .with_poll_interval(Duration::from_millis(50))
        .without_refresh()
        .with_retry(
            RetryConfig::new(Duration::from_millis(20), Duration::from_secs(1)).with_jitter(false),
        )
}

fn start(engine: &Arc<SyncEngine<MockRemote>>, shutdown: &CancellationToken) -> JoinHandle<()> {
    let engine = Arc::clone(engine);
    let shutdown = shutdown.clone();
    tokio::spawn(async move { engine.run(shutdown).await.unwrap() })
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn paused_while_offline_then_drains_on_reconnect() {
    let replica = Replica::open_in_memory().unwrap();
    let (online, signal) = connectivity::channel(Connectivity::Unknown);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(replica.queue()),
        Arc::new(MockRemote::new()),
        signal,
        config(),
    ));
    let shutdown = CancellationToken::new();
    let task = start(&engine, &shutdown);

    let (id, _) = replica.create(EntityKind::Calendar, name("Work")).unwrap();
    eventually("pause", || engine.state() == EngineState::Paused).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.remote().request_count(), 0);
    assert_eq!(replica.status(id), Some(SyncStatus::Pending { count: 1 }));

    online.send(Connectivity::Online).unwrap();
    eventually("drain", || replica.queue().is_empty()).await;
    assert_eq!(replica.status(id), Some(SyncStatus::Synced));
    assert_eq!(engine.remote().request_count(), 1);

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn enqueue_wakes_idle_engine() {
    let replica = Replica::open_in_memory().unwrap();
    let (_online, signal) = connectivity::channel(Connectivity::Online);
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(replica.queue()),
        Arc::new(MockRemote::new()),
        signal,
        config().with_poll_interval(Duration::from_secs(3_600)),
    ));
    let shutdown = CancellationToken::new();
    let task = start(&engine, &shutdown);

    eventually("idle", || engine.state() == EngineState::Idle).await;
    let (id, _) = replica.create(EntityKind::Event, name("Lunch")).unwrap();
    eventually("ack", || replica.status(id) == Some(SyncStatus::Synced)).await;

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let replica = Replica::open_in_memory().unwrap();
    let (_online, signal) = connectivity::channel(Connectivity::Online);
    let remote = Arc::new(MockRemote::new());
    remote.fail_next(RemoteError::status(500, "boom"));
    remote.fail_next(RemoteError::network("reset"));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(replica.queue()),
        Arc::clone(&remote),
        signal,
        config(),
    ));
    let mut events = engine.subscribe();
    let shutdown = CancellationToken::new();
    let task = start(&engine, &shutdown);

    let (id, _) = replica.create(EntityKind::Event, name("Standup")).unwrap();
    eventually("ack", || replica.queue().is_empty()).await;
    shutdown.cancel();
    task.await.unwrap();

    let mut delays = Vec::new();
    let mut acked = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SyncEvent::Rescheduled { delay, .. } => delays.push(delay),
            SyncEvent::Acked { entity_id, .. } => acked = entity_id == id,
            _ => {}
        }
    }
    assert_eq!(
        delays,
        vec![Duration::from_millis(20), Duration::from_millis(40)]
    );
    assert!(acked);
    // Scripted failures still count as received requests.
    assert_eq!(remote.request_count(), 3);
    assert_eq!(engine.stats().retries, 2);
    assert_eq!(replica.get(id).unwrap().version, Some(1));
}

#[tokio::test]
async fn slow_server_times_out_and_is_retried() {
    let replica = Replica::open_in_memory().unwrap();
    let (_online, signal) = connectivity::channel(Connectivity::Online);
    let remote = Arc::new(MockRemote::new());
    remote.set_latency(Duration::from_millis(500));
    let engine = SyncEngine::new(
        Arc::clone(replica.queue()),
        Arc::clone(&remote),
        signal,
        config(),
    );

    let (_, seq) = replica.create(EntityKind::Event, name("Slow")).unwrap();
    let report = engine.drain_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(replica.queue().get(seq).unwrap().attempt_count, 1);
    assert!(engine.stats().last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn cancellation_lets_started_sends_finish() {
    let replica = Replica::open_in_memory().unwrap();
    let (_online, signal) = connectivity::channel(Connectivity::Online);
    let remote = Arc::new(MockRemote::new());
    remote.set_latency(Duration::from_millis(100));
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(replica.queue()),
        Arc::clone(&remote),
        signal,
        config().with_max_concurrent_sends(1),
    ));

    let (first, _) = replica.create(EntityKind::Event, name("a")).unwrap();
    let (second, _) = replica.create(EntityKind::Event, name("b")).unwrap();

    let shutdown = CancellationToken::new();
    let drain = tokio::spawn({
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        async move { engine.drain_once(&shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();
    let report = drain.await.unwrap().unwrap();

    // The first send was under way and completed; the second never started.
    assert_eq!(report.acked, 1);
    assert_eq!(replica.status(first), Some(SyncStatus::Synced));
    assert_eq!(replica.status(second), Some(SyncStatus::Pending { count: 1 }));
    assert_eq!(replica.queue().in_flight(), 0);
    assert_eq!(remote.request_count(), 1);
}
