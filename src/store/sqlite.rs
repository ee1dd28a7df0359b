//! SQLite-backed implementation of the document store.
//!
//! All collections share the `messages` table, keyed by `(queue, id)`, with an autoincrementing
//! `seq` recording insertion order. Each trait call compiles to a single SQL statement (or, for
//! large batches, one transaction), so atomicity comes from SQLite's write lock: a write
//! statement takes the lock before it reads, which makes the claim's select-and-update one
//! indivisible step even across processes sharing the database file.

use std::{path::Path, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    QueryBuilder, Sqlite, SqlitePool,
};

use crate::{
    error::Error,
    message::{MessageRecord, NewMessage},
};

use super::{AckMatch, DocumentStore, Filter, Update, Visibility};

/// Rows per INSERT statement. Keeps batches well under SQLite's bound-parameter limit.
const INSERT_CHUNK: usize = 1000;

const RETURNING: &str = " RETURNING id, payload, visible_at, ack_token, tries, deleted_at";

/// A `messages` row as returned by `RETURNING`, with timestamps in epoch milliseconds.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    payload: Json<serde_json::Value>,
    visible_at: i64,
    ack_token: Option<String>,
    tries: i64,
    deleted_at: Option<i64>,
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::store(format!("bad timestamp {ms}")))
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tries: u32::try_from(row.tries)
                .map_err(|_| Error::store(format!("bad tries {} on {}", row.tries, row.id)))?,
            visible_at: from_millis(row.visible_at)?,
            deleted_at: row.deleted_at.map(from_millis).transpose()?,
            ack_token: row.ack_token,
            payload: row.payload.0,
            id: row.id,
        })
    }
}

/// Appends ` WHERE ...` for `filter`, scoped to `collection`.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, collection: &str, filter: &Filter) {
    qb.push(" WHERE queue = ").push_bind(collection.to_owned());

    if let Some(id) = &filter.id {
        qb.push(" AND id = ").push_bind(id.clone());
    }

    match &filter.ack {
        Some(AckMatch::Is(ack)) => {
            qb.push(" AND ack_token = ").push_bind(ack.clone());
        }
        Some(AckMatch::Present) => {
            qb.push(" AND ack_token IS NOT NULL");
        }
        None => {}
    }

    match filter.deleted {
        Some(true) => {
            qb.push(" AND deleted_at IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND deleted_at IS NULL");
        }
        None => {}
    }

    match filter.visible {
        Some(Visibility::Elapsed(at)) => {
            qb.push(" AND visible_at <= ").push_bind(at.timestamp_millis());
        }
        Some(Visibility::Hidden(at)) => {
            qb.push(" AND visible_at > ").push_bind(at.timestamp_millis());
        }
        None => {}
    }
}

/// Appends the `SET` list for `update`.
fn push_update(qb: &mut QueryBuilder<'_, Sqlite>, update: &Update) {
    let mut sets = qb.separated(", ");

    if let Some(visible_at) = update.visible_at {
        sets.push("visible_at = ")
            .push_bind_unseparated(visible_at.timestamp_millis());
    }

    match &update.ack {
        Some(Some(ack)) => {
            sets.push("ack_token = ").push_bind_unseparated(ack.clone());
        }
        Some(None) => {
            sets.push("ack_token = NULL");
        }
        None => {}
    }

    if update.increment_tries {
        sets.push("tries = tries + 1");
    }

    if let Some(deleted_at) = update.deleted_at {
        sets.push("deleted_at = ")
            .push_bind_unseparated(deleted_at.timestamp_millis());
    }
}

/// A document store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path` and applies migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(Duration::from_secs(5))
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::with_pool(pool).await
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection for its whole lifetime, since the database is
    /// dropped together with the connection that created it.
    pub async fn in_memory() -> Result<Self, Error> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wraps an existing pool, applying migrations to it.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl DocumentStore for SqliteStore {
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        docs: Vec<NewMessage>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;

            let mut docs = docs.into_iter().peekable();
            while docs.peek().is_some() {
                let mut qb = QueryBuilder::<Sqlite>::new(
                    "INSERT INTO messages (queue, id, payload, visible_at) ",
                );
                qb.push_values(docs.by_ref().take(INSERT_CHUNK), |mut row, doc| {
                    row.push_bind(collection.to_owned())
                        .push_bind(doc.id)
                        .push_bind(Json(doc.payload))
                        .push_bind(doc.visible_at.timestamp_millis());
                });

                qb.build().execute(tx.as_mut()).await?;
            }

            tx.commit().await?;

            Ok(())
        })
    }

    fn insert_if_absent<'a>(
        &'a self,
        collection: &'a str,
        doc: NewMessage,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let res = sqlx::query(
                "
                INSERT INTO messages (queue, id, payload, visible_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (queue, id) DO NOTHING
                ",
            )
            .bind(collection)
            .bind(&doc.id)
            .bind(Json(&doc.payload))
            .bind(doc.visible_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

            Ok(res.rows_affected() == 1)
        })
    }

    fn find_one_and_update<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'a, Result<Option<MessageRecord>, Error>> {
        Box::pin(async move {
            if update.is_empty() {
                return Err(Error::usage("find_one_and_update requires a non-empty update"));
            }

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE messages SET ");
            push_update(&mut qb, &update);
            qb.push(" WHERE seq = (SELECT seq FROM messages");
            push_filter(&mut qb, collection, &filter);
            qb.push(" ORDER BY seq ASC LIMIT 1)");
            qb.push(RETURNING);

            qb.build_query_as::<MessageRow>()
                .fetch_optional(&self.pool)
                .await?
                .map(MessageRecord::try_from)
                .transpose()
        })
    }

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM messages");
            push_filter(&mut qb, collection, &filter);

            let count = qb
                .build_query_scalar::<i64>()
                .fetch_one(&self.pool)
                .await?;

            Ok(count as u64)
        })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM messages");
            push_filter(&mut qb, collection, &filter);

            Ok(qb.build().execute(&self.pool).await?.rows_affected())
        })
    }
}
