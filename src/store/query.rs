//! Predicates and mutations understood by every [`DocumentStore`](super::DocumentStore).
//!
//! A [`Filter`] is a conjunction of field conditions; an unset field matches anything. An
//! [`Update`] lists the fields a matching document receives. Stores translate both into their
//! native query language, or evaluate them directly with [`Filter::matches`] and
//! [`Update::apply`].

use chrono::{DateTime, Utc};

use crate::message::MessageRecord;

/// Condition on the `ack_token` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckMatch {
    /// The token equals the given value.
    Is(String),
    /// Any token is set.
    Present,
}

/// Condition on the `visible_at` field relative to an instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    /// `visible_at <= instant`
    Elapsed(DateTime<Utc>),
    /// `visible_at > instant`
    Hidden(DateTime<Utc>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub id: Option<String>,
    pub ack: Option<AckMatch>,
    /// `Some(false)` for `deleted_at IS NULL`, `Some(true)` for `deleted_at IS NOT NULL`.
    pub deleted: Option<bool>,
    pub visible: Option<Visibility>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn ack(mut self, ack: impl Into<String>) -> Self {
        self.ack = Some(AckMatch::Is(ack.into()));
        self
    }

    pub fn has_ack(mut self) -> Self {
        self.ack = Some(AckMatch::Present);
        self
    }

    pub fn live(mut self) -> Self {
        self.deleted = Some(false);
        self
    }

    pub fn deleted(mut self) -> Self {
        self.deleted = Some(true);
        self
    }

    pub fn visible_by(mut self, at: DateTime<Utc>) -> Self {
        self.visible = Some(Visibility::Elapsed(at));
        self
    }

    pub fn hidden_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible = Some(Visibility::Hidden(at));
        self
    }

    pub fn matches(&self, record: &MessageRecord) -> bool {
        if let Some(id) = &self.id {
            if &record.id != id {
                return false;
            }
        }

        match (&self.ack, &record.ack_token) {
            (Some(AckMatch::Is(want)), Some(have)) if want == have => {}
            (Some(AckMatch::Present), Some(_)) | (None, _) => {}
            _ => return false,
        }

        if let Some(deleted) = self.deleted {
            if record.deleted_at.is_some() != deleted {
                return false;
            }
        }

        match self.visible {
            Some(Visibility::Elapsed(at)) => record.visible_at <= at,
            Some(Visibility::Hidden(at)) => record.visible_at > at,
            None => true,
        }
    }
}

/// Field assignments applied to a matched document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Update {
    pub visible_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the token.
    pub ack: Option<Option<String>>,
    pub increment_tries: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.visible_at.is_none()
            && self.ack.is_none()
            && !self.increment_tries
            && self.deleted_at.is_none()
    }

    pub fn apply(&self, record: &mut MessageRecord) {
        if let Some(visible_at) = self.visible_at {
            record.visible_at = visible_at;
        }
        if let Some(ack) = &self.ack {
            record.ack_token = ack.clone();
        }
        if self.increment_tries {
            record.tries += 1;
        }
        if let Some(deleted_at) = self.deleted_at {
            record.deleted_at = Some(deleted_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    fn record(now: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            id: "a".to_owned(),
            payload: json!("hello"),
            visible_at: now,
            ack_token: None,
            tries: 0,
            deleted_at: None,
        }
    }

    #[test]
    fn test_visibility_boundaries() {
        let now = Utc::now();
        let rec = record(now);

        assert!(Filter::all().visible_by(now).matches(&rec));
        assert!(!Filter::all().hidden_at(now).matches(&rec));
        assert!(Filter::all()
            .hidden_at(now - TimeDelta::milliseconds(1))
            .matches(&rec));
    }

    #[test]
    fn test_ack_conditions() {
        let now = Utc::now();
        let mut rec = record(now);

        assert!(!Filter::all().has_ack().matches(&rec));
        assert!(!Filter::all().ack("t").matches(&rec));

        rec.ack_token = Some("t".to_owned());
        assert!(Filter::all().has_ack().matches(&rec));
        assert!(Filter::all().ack("t").matches(&rec));
        assert!(!Filter::all().ack("u").matches(&rec));
    }

    #[test]
    fn test_update_apply() {
        let now = Utc::now();
        let mut rec = record(now);

        Update {
            visible_at: Some(now + TimeDelta::seconds(30)),
            ack: Some(Some("t".to_owned())),
            increment_tries: true,
            deleted_at: None,
        }
        .apply(&mut rec);

        assert_eq!(rec.tries, 1);
        assert_eq!(rec.ack_token.as_deref(), Some("t"));
        assert!(Filter::all().live().hidden_at(now).matches(&rec));

        Update {
            ack: Some(None),
            deleted_at: Some(now),
            ..Default::default()
        }
        .apply(&mut rec);

        assert_eq!(rec.ack_token, None);
        assert!(Filter::all().deleted().matches(&rec));
    }
}
