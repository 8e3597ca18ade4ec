//! Service loop behavior: polling worker, lease reaper, terminal cleanup,
//! and the schema readiness gate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailroom::testing::{InMemoryStore, RecordingHandler};
use mailroom::{
    CleanupConfig, Clock, ConfiguredProvider, Handler, Dispatcher, DispatcherConfig, HandlerRegistry,
    LeaseReaper, ManualClock, NewWorkItem, NoBackoff, OwnerToken, QueueWorker, ReaperConfig,
    RoundRobin, SchemaReady, Service, TerminalCleanup, WorkItemStatus, WorkItemStore,
    WorkerConfig,
};
use tokio_util::sync::CancellationToken;

fn provider_for(store: &Arc<InMemoryStore>) -> Arc<ConfiguredProvider> {
    Arc::new(ConfiguredProvider::single(
        "primary",
        store.clone() as Arc<dyn WorkItemStore>,
    ))
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn worker_processes_items_until_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let recorder = Arc::new(RecordingHandler::new("email.send"));
    let registry = Arc::new(HandlerRegistry::from_handlers([recorder.clone() as Arc<dyn Handler>]).unwrap());
    let dispatcher = Dispatcher::with_config(registry, DispatcherConfig::default())
        .backoff(Arc::new(NoBackoff));

    for _ in 0..3 {
        store
            .enqueue(NewWorkItem::new("email.send", "{}"))
            .await
            .unwrap();
    }

    let worker = QueueWorker::new(provider_for(&store), Arc::new(RoundRobin), dispatcher)
        .with_config(WorkerConfig {
            poll_interval: Duration::from_millis(10),
        });

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(worker).run(shutdown.clone()));

    let store_check = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            store_check.items_with_status(WorkItemStatus::Done).len() == 3
        })
        .await
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(recorder.call_count(), 3);
}

#[tokio::test]
async fn worker_keeps_running_after_gate_failure() {
    struct BrokenGate;

    #[async_trait]
    impl SchemaReady for BrokenGate {
        async fn wait_ready(&self) -> anyhow::Result<()> {
            anyhow::bail!("schema deploy still running")
        }
    }

    let store = Arc::new(InMemoryStore::new());
    let recorder = Arc::new(RecordingHandler::new("email.send"));
    let registry = Arc::new(HandlerRegistry::from_handlers([recorder.clone() as Arc<dyn Handler>]).unwrap());
    let dispatcher = Dispatcher::with_config(registry, DispatcherConfig::default());

    store
        .enqueue(NewWorkItem::new("email.send", "{}"))
        .await
        .unwrap();

    let worker = QueueWorker::new(provider_for(&store), Arc::new(RoundRobin), dispatcher)
        .with_config(WorkerConfig {
            poll_interval: Duration::from_millis(10),
        })
        .with_schema_gate(Arc::new(BrokenGate));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(worker).run(shutdown.clone()));

    // The failed gate is logged and ignored; work still flows.
    let store_check = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            !store_check.items_with_status(WorkItemStatus::Done).is_empty()
        })
        .await
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn reaper_service_releases_expired_leases() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));

    store
        .enqueue(NewWorkItem::new("email.send", "{}"))
        .await
        .unwrap();
    store
        .claim(&OwnerToken::mint(), Duration::from_secs(1), 10)
        .await
        .unwrap();

    // The worker holding the lease disappears; its lease expires.
    clock.advance(chrono::Duration::seconds(2));

    let reaper = LeaseReaper::new(
        provider_for(&store),
        ReaperConfig {
            interval: Duration::from_millis(10),
        },
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(reaper).run(shutdown.clone()));

    let store_check = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            store_check.items_with_status(WorkItemStatus::Ready).len() == 1
        })
        .await
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();

    // The reaped item is claimable by a second worker.
    let reclaimed = store
        .claim(&OwnerToken::mint(), Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn cleanup_service_prunes_old_terminal_rows() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));

    store
        .enqueue(NewWorkItem::new("email.send", "{}"))
        .await
        .unwrap();
    let owner = OwnerToken::mint();
    let claimed = store
        .claim(&owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    store.ack(&owner, "worker-1", &claimed).await.unwrap();

    clock.advance(chrono::Duration::days(8));

    let cleanup = TerminalCleanup::new(
        provider_for(&store),
        CleanupConfig {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            interval: Duration::from_millis(10),
        },
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(Box::new(cleanup).run(shutdown.clone()));

    let store_check = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            store_check.all_items().is_empty()
        })
        .await
    );

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn reaper_config_tracks_the_lease() {
    let config = ReaperConfig::for_lease(Duration::from_secs(30));
    assert_eq!(config.interval, Duration::from_secs(15));

    // Floored so tiny leases do not spin the scan.
    let config = ReaperConfig::for_lease(Duration::from_millis(100));
    assert_eq!(config.interval, Duration::from_secs(1));
}

#[tokio::test]
async fn manual_clock_steers_store_time() {
    // Sanity: the clock used above really is the store's time source.
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = InMemoryStore::with_clock(clock.clone());

    store
        .enqueue(NewWorkItem::new("email.send", "{}"))
        .await
        .unwrap();
    let created = store.all_items()[0].created_on;
    assert_eq!(created, clock.now());
}
