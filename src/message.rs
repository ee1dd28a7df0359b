//! Message documents and the transitions between their states.
//!
//! Each queue entry is one document. Its lifecycle state is never stored directly; it is derived
//! from `deleted_at`, `ack_token` and `visible_at` relative to the current time.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created `Pending` (or `Delayed` when inserted with a delay)
//! 2. A claim moves them to `Leased`, issuing a fresh ack token
//! 3. An ack, a cancel or dead-letter forwarding moves them to `Done`
//!
//! A lease that elapses without an ack returns the message to `Pending` without any write.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::Error,
    store::{Filter, Update},
};

/// Lifecycle state of a message at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MessageState {
    /// Claimable now.
    Pending,
    /// Inserted with a delay that has not elapsed yet.
    Delayed,
    /// Claimed, and the lease has not lapsed.
    Leased,
    /// Acknowledged, canceled or forwarded to a dead-letter queue.
    Done,
}

/// A message document as held by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRecord {
    /// Unique within its queue
    pub id: String,
    /// Producer-supplied value, returned verbatim
    pub payload: serde_json::Value,
    /// Claimable once `now >= visible_at`
    pub visible_at: DateTime<Utc>,
    /// Credential of the current lease
    pub ack_token: Option<String>,
    /// Number of claims so far
    pub tries: u32,
    /// Set once the message is finalized
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn state(&self, now: DateTime<Utc>) -> MessageState {
        if self.deleted_at.is_some() {
            MessageState::Done
        } else if self.visible_at <= now {
            MessageState::Pending
        } else if self.ack_token.is_some() {
            MessageState::Leased
        } else {
            MessageState::Delayed
        }
    }
}

/// A document about to be inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub id: String,
    pub payload: serde_json::Value,
    pub visible_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            payload: self.payload,
            visible_at: self.visible_at,
            ack_token: None,
            tries: 0,
            deleted_at: None,
        }
    }
}

/// A claimed message as handed to a consumer.
///
/// This is also the payload a dead-letter queue receives for a message that exceeded its retry
/// ceiling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Proof of the current lease, required by `ping` and `ack`
    pub ack: String,
    pub payload: serde_json::Value,
    pub tries: u32,
}

impl Message {
    /// Deserializes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = Error;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let ack = record
            .ack_token
            .ok_or_else(|| Error::store(format!("claimed message {} has no ack", record.id)))?;

        Ok(Self {
            id: record.id,
            ack,
            payload: record.payload,
            tries: record.tries,
        })
    }
}

/// Live messages whose visibility has elapsed.
pub fn claimable(now: DateTime<Utc>) -> Filter {
    Filter::all().live().visible_by(now)
}

/// The live, unexpired lease identified by `ack`.
pub fn leased(ack: &str, now: DateTime<Utc>) -> Filter {
    Filter::all().ack(ack).live().hidden_at(now)
}

/// Every live, unexpired lease.
pub fn in_flight(now: DateTime<Utc>) -> Filter {
    Filter::all().has_ack().live().hidden_at(now)
}

pub fn finalized() -> Filter {
    Filter::all().deleted()
}

/// The visible, unclaimed message `id`.
pub fn cancelable(id: &str, now: DateTime<Utc>) -> Filter {
    claimable(now).id(id)
}

/// Takes a new lease until `until`.
pub fn claim(ack: String, until: DateTime<Utc>) -> Update {
    Update {
        visible_at: Some(until),
        ack: Some(Some(ack)),
        increment_tries: true,
        deleted_at: None,
    }
}

/// Pushes an existing lease out to `until`.
pub fn extend(until: DateTime<Utc>) -> Update {
    Update {
        visible_at: Some(until),
        ..Default::default()
    }
}

pub fn finalize(now: DateTime<Utc>) -> Update {
    Update {
        ack: Some(None),
        deleted_at: Some(now),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    fn pending(now: DateTime<Utc>) -> MessageRecord {
        NewMessage {
            id: "m".to_owned(),
            payload: json!({"n": 1}),
            visible_at: now,
        }
        .into_record()
    }

    #[test]
    fn test_lifecycle_states() {
        let now = Utc::now();
        let mut rec = pending(now);
        assert_eq!(rec.state(now), MessageState::Pending);
        assert!(claimable(now).matches(&rec));

        claim("a".to_owned(), now + TimeDelta::seconds(30)).apply(&mut rec);
        assert_eq!(rec.state(now), MessageState::Leased);
        assert!(!claimable(now).matches(&rec));
        assert!(leased("a", now).matches(&rec));
        assert!(in_flight(now).matches(&rec));

        // An elapsed lease is claimable again and no longer ackable.
        let later = now + TimeDelta::seconds(30);
        assert_eq!(rec.state(later), MessageState::Pending);
        assert!(claimable(later).matches(&rec));
        assert!(!leased("a", later).matches(&rec));

        finalize(now).apply(&mut rec);
        assert_eq!(rec.state(later), MessageState::Done);
        assert!(finalized().matches(&rec));
        assert!(!claimable(later).matches(&rec));
    }

    #[test]
    fn test_delayed_is_not_cancelable() {
        let now = Utc::now();
        let mut rec = pending(now);
        rec.visible_at = now + TimeDelta::seconds(5);

        assert_eq!(rec.state(now), MessageState::Delayed);
        assert!(!cancelable("m", now).matches(&rec));
        assert!(cancelable("m", now + TimeDelta::seconds(5)).matches(&rec));
    }

    #[test]
    fn test_payload_as() {
        #[derive(Deserialize)]
        struct Job {
            n: u32,
        }

        let msg = Message {
            id: "m".to_owned(),
            ack: "a".to_owned(),
            payload: json!({"n": 7}),
            tries: 1,
        };

        assert_eq!(msg.payload_as::<Job>().unwrap().n, 7);
        assert!(msg.payload_as::<String>().is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(MessageState::Leased.to_string(), "leased");
    }
}
