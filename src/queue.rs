//! The queue: message lifecycle operations over a [`DocumentStore`].
//!
//! Every state transition is exactly one atomic store call, so any number of producers and
//! consumers, in any number of processes, can share a queue without coordinating:
//!
//! - `add`/`add_batch`/`add_if_missing` insert *pending* messages
//! - `get` claims the oldest claimable message and issues an ack token
//! - `ping` extends a lease, `ack` finalizes it
//! - a lease nobody acks expires on its own and the message becomes claimable again
//!
//! When a dead-letter queue is attached, a message claimed more than `max_retries` times is
//! moved there instead of being handed out again.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    message::{self, Message, NewMessage},
    store::{DocumentStore, Filter},
    token,
};

const DEFAULT_VISIBILITY: TimeDelta = TimeDelta::seconds(30);

/// Retry ceiling used when a dead-letter queue is attached without an explicit limit.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How many extra claims `get` makes after forwarding a message to the dead-letter queue.
const DEAD_LETTER_RECLAIMS: usize = 1;

/// Per-call options for inserts. Unset fields fall back to the queue's configuration.
#[derive(Clone, Copy, Debug, Default, bon::Builder)]
pub struct AddOptions {
    /// Time before the message becomes claimable
    pub delay: Option<Duration>,
}

/// Per-call options for `get` and `ping`. Unset fields fall back to the queue's configuration.
#[derive(Clone, Copy, Debug, Default, bon::Builder)]
pub struct LeaseOptions {
    /// Length of the lease taken or extended
    pub visibility: Option<Duration>,
}

/// Point-in-time message counts for a queue.
///
/// Each count is taken separately, so under concurrent traffic the numbers need not add up.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: u64,
    pub size: u64,
    pub in_flight: u64,
    pub done: u64,
}

/// A named queue in a [`DocumentStore`].
///
/// Cloning is cheap and clones operate on the same queue. Build one with [`Queue::builder`].
#[derive(Clone)]
pub struct Queue {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    name: String,
    visibility: TimeDelta,
    delay: TimeDelta,
    dead_letter: Option<Arc<Queue>>,
    max_retries: u32,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .field("delay", &self.delay)
            .field("dead_letter", &self.dead_letter.as_ref().map(|q| &q.name))
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Converts `d` to whole milliseconds, the resolution timestamps are stored at.
fn to_delta(d: Duration, what: &str) -> Result<TimeDelta, Error> {
    i64::try_from(d.as_millis())
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .ok_or_else(|| Error::usage(format!("{what} out of range: {d:?}")))
}

fn offset(now: DateTime<Utc>, by: TimeDelta, what: &str) -> Result<DateTime<Utc>, Error> {
    now.checked_add_signed(by)
        .ok_or_else(|| Error::usage(format!("{what} of {by} overflows the clock")))
}

#[bon::bon]
impl Queue {
    /// Configures a queue over the collection `name` in `store`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the name is blank, the visibility timeout is under a
    /// millisecond,
    /// `max_retries` is given without a dead-letter queue, or the dead-letter queue is this
    /// queue.
    #[builder]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        #[builder(into)] name: String,
        clock: Option<Arc<dyn Clock>>,
        /// Lease length for `get` and `ping`, 30 seconds by default
        visibility: Option<Duration>,
        /// Delay applied to inserts, none by default
        delay: Option<Duration>,
        dead_letter: Option<Queue>,
        /// Claims allowed before forwarding; requires `dead_letter`
        max_retries: Option<u32>,
    ) -> Result<Self, Error> {
        if name.trim().is_empty() {
            return Err(Error::configuration("queue name must not be empty"));
        }

        let visibility = match visibility {
            Some(v) => to_delta(v, "visibility").map_err(|e| Error::configuration(e.to_string()))?,
            None => DEFAULT_VISIBILITY,
        };
        if visibility <= TimeDelta::zero() {
            return Err(Error::configuration("visibility timeout must be positive"));
        }

        let delay = match delay {
            Some(d) => to_delta(d, "delay").map_err(|e| Error::configuration(e.to_string()))?,
            None => TimeDelta::zero(),
        };

        if max_retries.is_some() && dead_letter.is_none() {
            return Err(Error::configuration(
                "max_retries requires a dead letter queue",
            ));
        }

        if let Some(dlq) = &dead_letter {
            if dlq.name == name && std::ptr::addr_eq(Arc::as_ptr(&dlq.store), Arc::as_ptr(&store))
            {
                return Err(Error::configuration(format!(
                    "queue {name} cannot be its own dead letter queue"
                )));
            }
        }

        Ok(Self {
            store,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            name,
            visibility,
            delay,
            dead_letter: dead_letter.map(Arc::new),
            max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        })
    }
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dead_letter(&self) -> Option<&Queue> {
        self.dead_letter.as_deref()
    }

    /// The retry ceiling, if a dead-letter queue is attached.
    pub fn max_retries(&self) -> Option<u32> {
        self.dead_letter.as_ref().map(|_| self.max_retries)
    }

    fn visibility(&self, opts: LeaseOptions) -> Result<TimeDelta, Error> {
        let visibility = match opts.visibility {
            Some(v) => to_delta(v, "visibility")?,
            None => self.visibility,
        };
        if visibility <= TimeDelta::zero() {
            return Err(Error::usage("visibility must be positive"));
        }
        Ok(visibility)
    }

    fn new_message(
        &self,
        id: String,
        payload: impl Serialize,
        opts: AddOptions,
    ) -> Result<NewMessage, Error> {
        let delay = match opts.delay {
            Some(d) => to_delta(d, "delay")?,
            None => self.delay,
        };

        Ok(NewMessage {
            id,
            payload: serde_json::to_value(payload)?,
            visible_at: offset(self.clock.now(), delay, "delay")?,
        })
    }

    /// Inserts one message and returns its generated id.
    pub async fn add(&self, payload: impl Serialize, opts: AddOptions) -> Result<String, Error> {
        let mut ids = self.add_batch([payload], opts).await?;
        ids.pop()
            .ok_or_else(|| Error::store("insert returned no id"))
    }

    /// Inserts each payload as an independent message, in order, in one store call.
    ///
    /// # Errors
    /// Returns [`Error::Usage`] if `payloads` is empty.
    pub async fn add_batch<T: Serialize>(
        &self,
        payloads: impl IntoIterator<Item = T>,
        opts: AddOptions,
    ) -> Result<Vec<String>, Error> {
        let docs = payloads
            .into_iter()
            .map(|payload| self.new_message(token::generate_id(), payload, opts))
            .collect::<Result<Vec<_>, _>>()?;

        if docs.is_empty() {
            return Err(Error::usage("payload batch must not be empty"));
        }

        let ids = docs.iter().map(|doc| doc.id.clone()).collect::<Vec<_>>();

        self.store.insert_many(&self.name, docs).await?;

        tracing::debug!(queue = %self.name, count = ids.len(), "added messages");

        Ok(ids)
    }

    /// Inserts a message under a caller-chosen id unless that id is already present, in any
    /// state.
    ///
    /// # Returns
    /// `Some(id)` on insert, `None` if the message already existed
    pub async fn add_if_missing(
        &self,
        id: impl Into<String>,
        payload: impl Serialize,
        opts: AddOptions,
    ) -> Result<Option<String>, Error> {
        let doc = self.new_message(id.into(), payload, opts)?;
        let id = doc.id.clone();

        if self.store.insert_if_absent(&self.name, doc).await? {
            tracing::debug!(queue = %self.name, %id, "added message");
            Ok(Some(id))
        } else {
            tracing::debug!(queue = %self.name, %id, "message already present");
            Ok(None)
        }
    }

    /// Claims the oldest claimable message, if any.
    ///
    /// The returned [`Message::ack`] is required to `ping` or `ack` the message before
    /// the lease elapses.
    pub async fn get(&self, opts: LeaseOptions) -> Result<Option<Message>, Error> {
        let visibility = self.visibility(opts)?;

        for _ in 0..=DEAD_LETTER_RECLAIMS {
            let Some(message) = self.claim(visibility).await? else {
                return Ok(None);
            };

            match &self.dead_letter {
                Some(dlq) if message.tries > self.max_retries => {
                    self.forward(dlq, &message).await?;
                }
                _ => return Ok(Some(message)),
            }
        }

        Ok(None)
    }

    async fn claim(&self, visibility: TimeDelta) -> Result<Option<Message>, Error> {
        let now = self.clock.now();
        let until = offset(now, visibility, "visibility")?;
        let ack = token::generate_ack()?;

        let claimed = self
            .store
            .find_one_and_update(
                &self.name,
                message::claimable(now),
                message::claim(ack, until),
            )
            .await?
            .map(Message::try_from)
            .transpose()?;

        if let Some(message) = &claimed {
            tracing::debug!(queue = %self.name, id = %message.id, tries = message.tries, "claimed message");
        }

        Ok(claimed)
    }

    /// Moves an over-retried message to the dead-letter queue.
    ///
    /// The copy is inserted before the original is acked. A failure in between leaves the
    /// original leased, so it comes back after the lease elapses and is forwarded again.
    async fn forward(&self, dlq: &Queue, message: &Message) -> Result<(), Error> {
        let dead_id = dlq.add(message, AddOptions::default()).await?;
        self.ack(&message.ack).await?;

        tracing::warn!(
            queue = %self.name,
            id = %message.id,
            tries = message.tries,
            dead_letter = %dlq.name,
            %dead_id,
            "forwarded message to dead letter queue"
        );

        Ok(())
    }

    /// Extends the lease identified by `ack`, returning the message id.
    ///
    /// # Errors
    /// Returns [`Error::UnidentifiedAck`] if the token is unknown, finalized or expired.
    pub async fn ping(&self, ack: &str, opts: LeaseOptions) -> Result<String, Error> {
        let visibility = self.visibility(opts)?;
        let now = self.clock.now();
        let until = offset(now, visibility, "visibility")?;

        self.store
            .find_one_and_update(
                &self.name,
                message::leased(ack, now),
                message::extend(until),
            )
            .await?
            .map(|record| record.id)
            .ok_or_else(|| Error::unidentified_ack(ack))
    }

    /// Finalizes the message leased under `ack`, returning its id.
    ///
    /// # Errors
    /// Returns [`Error::UnidentifiedAck`] if the token is unknown, finalized or expired.
    pub async fn ack(&self, ack: &str) -> Result<String, Error> {
        let now = self.clock.now();

        let id = self
            .store
            .find_one_and_update(&self.name, message::leased(ack, now), message::finalize(now))
            .await?
            .map(|record| record.id)
            .ok_or_else(|| Error::unidentified_ack(ack))?;

        tracing::debug!(queue = %self.name, %id, "acked message");

        Ok(id)
    }

    /// Finalizes a visible message nobody holds a lease on.
    ///
    /// # Errors
    /// Returns [`Error::UnidentifiedId`] if the message does not exist, is leased, is delayed,
    /// or is already finalized.
    pub async fn cancel(&self, id: &str) -> Result<(), Error> {
        let now = self.clock.now();

        self.store
            .find_one_and_update(&self.name, message::cancelable(id, now), message::finalize(now))
            .await?
            .ok_or_else(|| Error::unidentified_id(id))?;

        tracing::debug!(queue = %self.name, %id, "canceled message");

        Ok(())
    }

    /// Number of messages in any state.
    pub async fn total(&self) -> Result<u64, Error> {
        self.store.count(&self.name, Filter::all()).await
    }

    /// Number of messages claimable right now.
    pub async fn size(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        self.store.count(&self.name, message::claimable(now)).await
    }

    /// Number of messages under an unexpired lease.
    pub async fn in_flight(&self) -> Result<u64, Error> {
        let now = self.clock.now();
        self.store.count(&self.name, message::in_flight(now)).await
    }

    /// Number of finalized messages not yet cleaned.
    pub async fn done(&self) -> Result<u64, Error> {
        self.store.count(&self.name, message::finalized()).await
    }

    pub async fn stats(&self) -> Result<QueueStatistics, Error> {
        Ok(QueueStatistics {
            total: self.total().await?,
            size: self.size().await?,
            in_flight: self.in_flight().await?,
            done: self.done().await?,
        })
    }

    /// Physically removes finalized messages, returning how many were removed.
    ///
    /// Only touches finalized documents, so it is safe to run alongside any other operation.
    pub async fn clean(&self) -> Result<u64, Error> {
        let removed = self
            .store
            .delete_many(&self.name, message::finalized())
            .await?;

        tracing::debug!(queue = %self.name, removed, "cleaned queue");

        Ok(removed)
    }
}
