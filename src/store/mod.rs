//! Document store abstraction.
//!
//! This module defines the contract the queue needs from its backing collection. Every method is
//! a single atomic operation against the store; the queue never composes a read with a separate
//! write to effect a transition.

use futures_util::future::BoxFuture;

use crate::{
    error::Error,
    message::{MessageRecord, NewMessage},
};

pub mod memory;
pub mod query;
pub mod sqlite;

pub use memory::MemoryStore;
pub use query::{AckMatch, Filter, Update, Visibility};
pub use sqlite::SqliteStore;

/// Core trait for document store operations.
///
/// Documents are grouped by `collection`, one per queue. Implementations must guarantee that:
/// - `insert_if_absent` and `find_one_and_update` are indivisible with respect to every other
///   call, from this process or any other sharing the store
/// - no two live documents in a collection carry the same ack token
/// - `find_one_and_update` selects the earliest-inserted matching document
pub trait DocumentStore: Send + Sync + 'static {
    /// Inserts all documents, in order, in one call.
    ///
    /// # Errors
    /// Fails if any id already exists in the collection; no document is inserted in that case.
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        docs: Vec<NewMessage>,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Inserts the document unless one with the same id exists.
    ///
    /// # Returns
    /// `true` when the document was inserted
    fn insert_if_absent<'a>(
        &'a self,
        collection: &'a str,
        doc: NewMessage,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Applies `update` to the earliest-inserted document matching `filter`.
    ///
    /// # Returns
    /// The document as it is after the update, or `None` when nothing matched
    fn find_one_and_update<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'a, Result<Option<MessageRecord>, Error>>;

    fn count<'a>(&'a self, collection: &'a str, filter: Filter)
        -> BoxFuture<'a, Result<u64, Error>>;

    /// Removes every matching document, returning how many were removed.
    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, Error>>;
}
