use std::{sync::Arc, time::Duration};

use leasemq::{store::SqliteStore, AddOptions, LeaseOptions, Queue};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

const IDLE_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(4);

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    tracing_subscriber::fmt::init();

    let store = Arc::new(SqliteStore::connect("demo.db").await?);

    let dead = Queue::builder()
        .store(store.clone())
        .name("emails-dead")
        .build()?;

    let queue = Queue::builder()
        .store(store)
        .name("emails")
        .visibility(Duration::from_secs(10))
        .dead_letter(dead)
        .max_retries(3)
        .build()?;

    let ids = queue
        .add_batch(
            (0..5).map(|i| Email {
                to: format!("user{i}@example.com"),
                subject: "Welcome".to_owned(),
            }),
            AddOptions::default(),
        )
        .await?;

    tracing::info!("Enqueued {} emails", ids.len());

    let mut backoff = IDLE_BACKOFF;
    let mut sent = 0;

    while sent < ids.len() {
        let Some(msg) = queue.get(LeaseOptions::default()).await? else {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        };
        backoff = IDLE_BACKOFF;

        let email: Email = msg.payload_as()?;
        tracing::info!("Sending {:?} (attempt {})", email, msg.tries);

        queue.ack(&msg.ack).await?;
        sent += 1;
    }

    tracing::info!("Queue stats: {:?}", queue.stats().await?);

    Ok(())
}
