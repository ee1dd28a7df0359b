use std::{collections::HashSet, ops::Deref, sync::Arc, time::Duration};

use chrono::TimeDelta;
use leasemq::{
    clock::ManualClock,
    error::Error,
    store::{DocumentStore, SqliteStore},
    AddOptions, LeaseOptions, Message, Queue,
};
use serde_json::json;
use tempfile::TempDir;

struct TmpQueue {
    queue: Queue,
    store: Arc<SqliteStore>,
    clock: ManualClock,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpQueue {
    type Target = Queue;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}

impl TmpQueue {
    fn queue(&self, name: &str) -> Queue {
        Queue::builder()
            .store(self.store.clone())
            .name(name)
            .clock(Arc::new(self.clock.clone()))
            .build()
            .unwrap()
    }
}

async fn setup() -> TmpQueue {
    let path = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStore::connect(path.path().join("leasemq.db"))
            .await
            .unwrap(),
    );
    let clock = ManualClock::default();

    TmpQueue {
        queue: Queue::builder()
            .store(store.clone())
            .name("testing")
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap(),
        store,
        clock,
        tmpdir: path,
    }
}

#[tokio::test]
async fn test_lease_expiry_reclaim() {
    let q = setup().await;

    let id = q.add("work", AddOptions::default()).await.unwrap();

    let first = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert_eq!(first.id, id);
    assert_eq!(first.tries, 1);
    assert!(q.get(LeaseOptions::default()).await.unwrap().is_none());

    q.clock.advance(TimeDelta::seconds(30));

    let second = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert_eq!(second.id, id);
    assert_eq!(second.tries, 2);
    assert_ne!(second.ack, first.ack);

    // The lapsed lease no longer grants ownership.
    assert!(matches!(
        q.ack(&first.ack).await,
        Err(Error::UnidentifiedAck { .. })
    ));
    assert_eq!(q.ack(&second.ack).await.unwrap(), id);
}

#[tokio::test]
async fn test_ping_extends_lease() {
    let q = setup().await;

    q.add("work", AddOptions::default()).await.unwrap();
    let msg = q.get(LeaseOptions::default()).await.unwrap().unwrap();

    q.clock.advance(TimeDelta::seconds(20));
    assert_eq!(
        q.ping(
            &msg.ack,
            LeaseOptions::builder()
                .visibility(Duration::from_secs(60))
                .build()
        )
        .await
        .unwrap(),
        msg.id
    );

    // Past the original lease, still held.
    q.clock.advance(TimeDelta::seconds(30));
    assert!(q.get(LeaseOptions::default()).await.unwrap().is_none());
    assert_eq!(q.in_flight().await.unwrap(), 1);

    q.clock.advance(TimeDelta::seconds(30));
    assert!(matches!(
        q.ping(&msg.ack, LeaseOptions::default()).await,
        Err(Error::UnidentifiedAck { .. })
    ));
}

#[tokio::test]
async fn test_idempotent_insert() {
    let q = setup().await;

    assert_eq!(
        q.add_if_missing("x", json!({"v": 1}), AddOptions::default())
            .await
            .unwrap()
            .as_deref(),
        Some("x")
    );
    assert_eq!(
        q.add_if_missing("x", json!({"v": 2}), AddOptions::default())
            .await
            .unwrap(),
        None
    );
    assert_eq!(q.total().await.unwrap(), 1);

    let msg = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert_eq!(msg.id, "x");
    assert_eq!(msg.payload, json!({"v": 1}));

    // Still a duplicate once finalized, until cleaned.
    q.ack(&msg.ack).await.unwrap();
    assert_eq!(
        q.add_if_missing("x", json!({"v": 3}), AddOptions::default())
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_retry_ceiling_forwards_to_dead_letter() {
    let q = setup().await;
    let dead = q.queue("testing-dead");
    let queue = Queue::builder()
        .store(q.store.clone())
        .name("retried")
        .clock(Arc::new(q.clock.clone()))
        .dead_letter(dead.clone())
        .max_retries(2)
        .build()
        .unwrap();

    let id = queue.add("flaky", AddOptions::default()).await.unwrap();

    for tries in 1..=2 {
        let msg = queue.get(LeaseOptions::default()).await.unwrap().unwrap();
        assert_eq!(msg.tries, tries);
        q.clock.advance(TimeDelta::seconds(30));
    }

    // Third claim exceeds the ceiling.
    assert!(queue.get(LeaseOptions::default()).await.unwrap().is_none());
    assert_eq!(queue.done().await.unwrap(), 1);
    assert_eq!(queue.size().await.unwrap(), 0);

    q.clock.advance(TimeDelta::seconds(30));
    assert!(queue.get(LeaseOptions::default()).await.unwrap().is_none());

    let forwarded = dead.get(LeaseOptions::default()).await.unwrap().unwrap();
    let original: Message = forwarded.payload_as().unwrap();
    assert_eq!(original.id, id);
    assert_eq!(original.tries, 3);
    assert_eq!(original.payload, json!("flaky"));
}

#[tokio::test]
async fn test_counts_partition() {
    let q = setup().await;

    q.add("a", AddOptions::default()).await.unwrap();
    assert_eq!(q.size().await.unwrap(), 1);
    assert_eq!(q.in_flight().await.unwrap(), 0);
    assert_eq!(q.done().await.unwrap(), 0);

    q.add_batch(["b", "c", "d"], AddOptions::default())
        .await
        .unwrap();
    q.add(
        "e",
        AddOptions::builder().delay(Duration::from_secs(10)).build(),
    )
    .await
    .unwrap();

    let leased = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    let acked = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    q.ack(&acked.ack).await.unwrap();

    let stats = q.stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.size, 2);
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.done, 1);
    assert!(stats.size + stats.in_flight + stats.done <= stats.total);

    assert_eq!(q.clean().await.unwrap(), 1);
    assert_eq!(q.total().await.unwrap(), 4);
    assert_eq!(q.done().await.unwrap(), 0);

    // Cleaning leaves live leases alone.
    assert_eq!(q.ack(&leased.ack).await.unwrap(), leased.id);
}

#[tokio::test]
async fn test_delay_honored() {
    let q = setup().await;

    q.add(
        "later",
        AddOptions::builder().delay(Duration::from_secs(5)).build(),
    )
    .await
    .unwrap();

    assert!(q.get(LeaseOptions::default()).await.unwrap().is_none());

    q.clock.advance(TimeDelta::seconds(5));

    let msg = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert_eq!(msg.payload, json!("later"));
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let q = setup().await;

    q.add("a", AddOptions::default()).await.unwrap();

    assert!(matches!(
        q.ping("never-issued", LeaseOptions::default()).await,
        Err(Error::UnidentifiedAck { .. })
    ));
    assert!(matches!(
        q.ack("never-issued").await,
        Err(Error::UnidentifiedAck { .. })
    ));
    assert!(matches!(
        q.cancel("no-such-id").await,
        Err(Error::UnidentifiedId { .. })
    ));
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let q = setup().await;
    let other = q.queue("other");

    q.add("mine", AddOptions::default()).await.unwrap();

    assert!(other.get(LeaseOptions::default()).await.unwrap().is_none());
    assert_eq!(other.total().await.unwrap(), 0);

    // Same caller id in two queues is two messages.
    assert!(q
        .add_if_missing("k", 1, AddOptions::default())
        .await
        .unwrap()
        .is_some());
    assert!(other
        .add_if_missing("k", 2, AddOptions::default())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_claim_order_follows_insertion_not_id() {
    let q = setup().await;

    q.add_if_missing("zzz", "first", AddOptions::default())
        .await
        .unwrap();
    q.add_if_missing("aaa", "second", AddOptions::default())
        .await
        .unwrap();

    let msg = q.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert_eq!(msg.id, "zzz");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claimant() {
    let q = setup().await;

    q.add_batch(0..20, AddOptions::default()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = q.queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(msg) = queue.get(LeaseOptions::default()).await.unwrap() {
                claimed.push(msg.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique = all.iter().collect::<HashSet<_>>();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(q.in_flight().await.unwrap(), 20);
}

#[tokio::test]
async fn test_shared_database_file() {
    let q = setup().await;

    // A second store over the same file sees the same queue.
    let path = q.tmpdir.path().join("leasemq.db");
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteStore::connect(path).await.unwrap());
    let remote = Queue::builder()
        .store(store)
        .name("testing")
        .clock(Arc::new(q.clock.clone()))
        .build()
        .unwrap();

    q.add("hello", AddOptions::default()).await.unwrap();

    let msg = remote.get(LeaseOptions::default()).await.unwrap().unwrap();
    assert!(q.get(LeaseOptions::default()).await.unwrap().is_none());
    assert_eq!(q.ack(&msg.ack).await.unwrap(), msg.id);
}
