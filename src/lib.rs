use std::sync::Arc;

use config::Config;
use store::{DocumentStore, SqliteStore};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod store;
pub mod token;

pub use error::Error;
pub use message::Message;
pub use queue::{AddOptions, LeaseOptions, Queue, QueueStatistics};

/// Builds the queue described by `config`, with its dead-letter queue if one is named.
pub fn queue_from_config(store: Arc<dyn DocumentStore>, config: &Config) -> Result<Queue, Error> {
    let dead_letter = config
        .dead_letter_queue
        .as_ref()
        .map(|name| Queue::builder().store(store.clone()).name(name).build())
        .transpose()?;

    Queue::builder()
        .store(store)
        .name(config.queue())
        .maybe_visibility(config.visibility())
        .maybe_delay(config.delay())
        .maybe_dead_letter(dead_letter)
        .maybe_max_retries(config.max_retries)
        .build()
}

/// Runs the maintenance loop: periodically logs queue counts and purges finalized messages,
/// until Ctrl-C.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let store = Arc::new(SqliteStore::connect(config.db_path()).await?);
    let queue = queue_from_config(store, &config)?;

    tracing::info!(db = config.db_path(), queue = queue.name(), "starting maintenance");

    let mut interval = tokio::time::interval(config.clean_interval());

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for queue in std::iter::once(&queue).chain(queue.dead_letter()) {
                    if let Err(e) = maintain(queue).await {
                        tracing::error!(queue = queue.name(), "maintenance failed: {e}");
                    }
                }
            }
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn maintain(queue: &Queue) -> Result<(), Error> {
    let stats = queue.stats().await?;
    let removed = queue.clean().await?;

    tracing::info!(
        queue = queue.name(),
        total = stats.total,
        size = stats.size,
        in_flight = stats.in_flight,
        done = stats.done,
        removed,
        "queue maintenance"
    );

    Ok(())
}
