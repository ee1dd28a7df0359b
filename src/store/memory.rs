//! In-memory implementation of the document store.
//!
//! Holds every collection behind one async mutex, which makes each trait call trivially atomic.
//! Only useful within a single process: tests, and embedding a queue without a database.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::{
    error::Error,
    message::{MessageRecord, NewMessage},
};

use super::{DocumentStore, Filter, Update};

#[derive(Default)]
struct Collection {
    next_seq: u64,
    /// Documents keyed by insertion sequence
    docs: BTreeMap<u64, MessageRecord>,
    ids: HashMap<String, u64>,
}

impl Collection {
    fn insert(&mut self, doc: NewMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ids.insert(doc.id.clone(), seq);
        self.docs.insert(seq, doc.into_record());
    }

    fn ack_in_use(&self, ack: &str) -> bool {
        self.docs
            .values()
            .any(|doc| doc.ack_token.as_deref() == Some(ack))
    }
}

/// Thread-safe in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, Collection>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        docs: Vec<NewMessage>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().await;
            let coll = collections.entry(collection.to_owned()).or_default();

            let mut seen = HashSet::new();
            for doc in &docs {
                if coll.ids.contains_key(&doc.id) || !seen.insert(doc.id.as_str()) {
                    return Err(Error::store(format!(
                        "duplicate id {} in {collection}",
                        doc.id
                    )));
                }
            }

            for doc in docs {
                coll.insert(doc);
            }

            Ok(())
        })
    }

    fn insert_if_absent<'a>(
        &'a self,
        collection: &'a str,
        doc: NewMessage,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().await;
            let coll = collections.entry(collection.to_owned()).or_default();

            if coll.ids.contains_key(&doc.id) {
                return Ok(false);
            }

            coll.insert(doc);
            Ok(true)
        })
    }

    fn find_one_and_update<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
        update: Update,
    ) -> BoxFuture<'a, Result<Option<MessageRecord>, Error>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().await;
            let Some(coll) = collections.get_mut(collection) else {
                return Ok(None);
            };

            let Some(seq) = coll
                .docs
                .iter()
                .find(|(_, doc)| filter.matches(doc))
                .map(|(seq, _)| *seq)
            else {
                return Ok(None);
            };

            if let Some(Some(ack)) = &update.ack {
                if coll.ack_in_use(ack) {
                    return Err(Error::store(format!("duplicate ack in {collection}")));
                }
            }

            let Some(doc) = coll.docs.get_mut(&seq) else {
                return Ok(None);
            };
            update.apply(doc);

            Ok(Some(doc.clone()))
        })
    }

    fn count<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let collections = self.collections.lock().await;

            Ok(collections
                .get(collection)
                .map(|coll| coll.docs.values().filter(|doc| filter.matches(doc)).count() as u64)
                .unwrap_or(0))
        })
    }

    fn delete_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Filter,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let mut collections = self.collections.lock().await;
            let Some(coll) = collections.get_mut(collection) else {
                return Ok(0);
            };

            let doomed = coll
                .docs
                .iter()
                .filter(|(_, doc)| filter.matches(doc))
                .map(|(seq, doc)| (*seq, doc.id.clone()))
                .collect::<Vec<_>>();

            for (seq, id) in &doomed {
                coll.docs.remove(seq);
                coll.ids.remove(id);
            }

            Ok(doomed.len() as u64)
        })
    }
}
