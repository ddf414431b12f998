//! Fast-path relay tests: publisher → bus → subscriber → local schedule.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use workpool::bus::{MemoryBus, PoolBus};
use workpool::config::ScheduleConfig;
use workpool::engine::{PoolPublisher, PoolSubscriber, ScheduleRegistry, WorkSchedule, handler_fn};
use workpool::model::*;
use workpool::storage::{MemoryWorkStore, WorkStore};

const POOL: &str = "test";

/// Poll interval long enough that only the fast path can run work.
fn no_poll_config() -> ScheduleConfig {
    ScheduleConfig {
        parallelism: 2,
        bucket_size: 4,
        poll_secs: 3600.0,
        ..ScheduleConfig::default()
    }
}

struct Instance {
    schedule: WorkSchedule<Value>,
    registry: Arc<ScheduleRegistry<Value>>,
    subscriber: PoolSubscriber,
    runs: Arc<AtomicUsize>,
}

/// One pool member: a started schedule over the shared store, subscribed to
/// the shared bus.
async fn instance(store: &MemoryWorkStore<Value>, bus: &MemoryBus) -> Instance {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let schedule = WorkSchedule::new(
        "mail",
        no_poll_config(),
        store.clone(),
        handler_fn(move |_: WorkRecord<Value>| {
            let runs = Arc::clone(&counter);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                WorkOutcome::done()
            }
        }),
    )
    .unwrap();
    let bus: Arc<dyn PoolBus> = Arc::new(bus.clone());
    schedule.attach_publisher(PoolPublisher::new(Arc::clone(&bus), POOL, "mail"));
    let registry = Arc::new(ScheduleRegistry::single(schedule.clone()));
    let subscriber = PoolSubscriber::spawn(bus, POOL, "mail", Arc::clone(&registry))
        .await
        .unwrap();
    schedule.start().unwrap();
    // Let the start-up poll cycle pass so later work can only arrive by notice.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Instance {
        schedule,
        registry,
        subscriber,
        runs,
    }
}

impl Instance {
    async fn shutdown(self) {
        self.subscriber.shutdown().await.unwrap();
        self.schedule.stop().await.unwrap();
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn immediate_post_runs_once_across_the_pool() {
    let store = MemoryWorkStore::new();
    let bus = MemoryBus::new();
    let a = instance(&store, &bus).await;
    let b = instance(&store, &bus).await;

    a.schedule
        .post_work(NewWork::new("job-1", json!({})), PostMode::Immediate, None)
        .await
        .unwrap();

    eventually("job-1 to finish", || async { store.is_empty().unwrap() }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let total = a.runs.load(Ordering::SeqCst) + b.runs.load(Ordering::SeqCst);
    assert_eq!(total, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn peer_without_a_publisher_still_receives_work() {
    let store = MemoryWorkStore::new();
    let bus = MemoryBus::new();
    let worker = instance(&store, &bus).await;

    // A poster that never started its own schedule, like a CLI process.
    let poster = WorkSchedule::new(
        "mail",
        no_poll_config(),
        store.clone(),
        handler_fn(|_: WorkRecord<Value>| async { WorkOutcome::retry() }),
    )
    .unwrap();
    poster.attach_publisher(PoolPublisher::new(Arc::new(bus.clone()), POOL, "mail"));

    poster
        .post_work(NewWork::new("job-1", json!({})), PostMode::Immediate, None)
        .await
        .unwrap();

    eventually("the peer to run job-1", || async {
        worker.runs.load(Ordering::SeqCst) == 1
    })
    .await;
    worker.shutdown().await;
}

#[tokio::test]
async fn undecodable_notices_are_dropped() {
    let store = MemoryWorkStore::new();
    let bus = MemoryBus::new();
    let member = instance(&store, &bus).await;
    let topic = member.subscriber.topic().to_string();

    bus.publish(&topic, "not json").await.unwrap();
    bus.publish(&topic, r#"{"work_type":"mail"}"#).await.unwrap();

    // The subscriber survives and keeps relaying.
    member
        .schedule
        .post_work(NewWork::new("job-1", json!({})), PostMode::Immediate, None)
        .await
        .unwrap();
    eventually("job-1 to run", || async {
        member.runs.load(Ordering::SeqCst) == 1
    })
    .await;
    member.shutdown().await;
}

#[tokio::test]
async fn notice_for_an_unserved_scope_is_left_alone() {
    let store = MemoryWorkStore::new();
    let bus = MemoryBus::new();
    let member = instance(&store, &bus).await;
    let tenant = member.registry.unregister(None).expect("unscoped schedule");
    member.registry.register(Some("tenant-a".to_string()), tenant);

    let record = store
        .upsert(
            &NewWork::new("job-1", json!({})),
            chrono::Utc::now(),
            chrono::Utc::now(),
        )
        .await
        .unwrap();
    let publisher = PoolPublisher::new(Arc::new(bus.clone()), POOL, "mail");

    publisher
        .invoke_work(&record, PostMode::Immediate, Some("tenant-b"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(member.runs.load(Ordering::SeqCst), 0);
    assert!(store.get("job-1").await.unwrap().is_some());

    publisher
        .invoke_work(&record, PostMode::Immediate, Some("tenant-a"))
        .await
        .unwrap();
    eventually("tenant-a schedule to run job-1", || async {
        member.runs.load(Ordering::SeqCst) == 1
    })
    .await;
    member.shutdown().await;
}

#[tokio::test]
async fn stale_notice_for_finished_work_is_harmless() {
    let store = MemoryWorkStore::new();
    let bus = MemoryBus::new();
    let member = instance(&store, &bus).await;
    let publisher = PoolPublisher::new(Arc::new(bus.clone()), POOL, "mail");

    let record = member
        .schedule
        .post_work(NewWork::new("job-1", json!({})), PostMode::Immediate, None)
        .await
        .unwrap();
    eventually("job-1 to finish", || async { store.is_empty().unwrap() }).await;

    // Replaying the notice finds no row to claim.
    publisher
        .invoke_work(&record, PostMode::Immediate, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(member.runs.load(Ordering::SeqCst), 1);
    member.shutdown().await;
}

#[test]
fn registry_resolves_by_scope() {
    let schedule = WorkSchedule::new(
        "mail",
        no_poll_config(),
        MemoryWorkStore::<Value>::new(),
        handler_fn(|_: WorkRecord<Value>| async { WorkOutcome::done() }),
    )
    .unwrap();
    let registry = ScheduleRegistry::new();
    registry.register(Some("tenant-a".to_string()), schedule);

    assert!(registry.resolve(Some("tenant-a")).is_some());
    assert!(registry.resolve(Some("tenant-b")).is_none());
    assert!(registry.resolve(None).is_none());
    assert!(registry.unregister(Some("tenant-a")).is_some());
    assert!(registry.resolve(Some("tenant-a")).is_none());
}
