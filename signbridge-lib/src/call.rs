use chrono::Utc;
use derive_new::new;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

pub type CallId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Calling,
    Ringing,
    Accepted,
    Rejected,
    Ended,
    Cancelled,
    Missed,
}

impl CallStatus {
    /// Still waiting for the callee.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Calling | Self::Ringing)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Getters, new)]
pub struct Participant {
    #[get = "pub"]
    id: String,
    #[get = "pub"]
    name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Getters, CopyGetters)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    /// primary
    #[get = "pub"]
    id: CallId,
    #[get = "pub"]
    caller_id: String,
    #[get = "pub"]
    caller_name: String,
    #[get = "pub"]
    callee_id: String,
    #[get = "pub"]
    callee_name: String,
    #[get_copy = "pub"]
    status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[get = "pub"]
    offer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[get = "pub"]
    answer: Option<String>,
    /// unix millis
    #[get_copy = "pub"]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[get_copy = "pub"]
    end_time: Option<i64>,
}

impl Call {
    /// A fresh `CALLING` record; the id is assigned by the store.
    pub fn new(caller: &Participant, callee: &Participant) -> Self {
        Self {
            id: String::new(),
            caller_id: caller.id.clone(),
            caller_name: caller.name.clone(),
            callee_id: callee.id.clone(),
            callee_name: callee.name.clone(),
            status: CallStatus::Calling,
            offer: None,
            answer: None,
            timestamp: Utc::now().timestamp_millis(),
            end_time: None,
        }
    }

    pub fn with_id(mut self, id: CallId) -> Self {
        self.id = id;
        self
    }

    pub fn caller(&self) -> Participant {
        Participant::new(self.caller_id.clone(), self.caller_name.clone())
    }

    pub fn apply(&mut self, update: &CallUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(offer) = &update.offer {
            self.offer = Some(offer.clone());
        }
        if let Some(answer) = &update.answer {
            self.answer = Some(answer.clone());
        }
        if let Some(end_time) = update.end_time {
            self.end_time = Some(end_time);
        }
    }
}

/// Fields to overwrite on a stored [`Call`]; `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub offer: Option<String>,
    pub answer: Option<String>,
    pub end_time: Option<i64>,
}

impl CallUpdate {
    pub fn status(status: CallStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn ended(now_millis: i64) -> Self {
        Self {
            status: Some(CallStatus::Ended),
            end_time: Some(now_millis),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_like_the_record_table() {
        let call = Call::new(
            &Participant::new("alice".into(), "Alice".into()),
            &Participant::new("bob".into(), "Bob".into()),
        )
        .with_id("c1".into());
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["id"], json!("c1"));
        assert_eq!(value["callerId"], json!("alice"));
        assert_eq!(value["calleeName"], json!("Bob"));
        assert_eq!(value["status"], json!("CALLING"));
        assert!(value.get("endTime").is_none());

        let back: Call = serde_json::from_value(value).unwrap();
        assert_eq!(back, call);
    }

    #[test]
    fn update_only_touches_given_fields() {
        let mut call = Call::new(
            &Participant::new("a".into(), "A".into()),
            &Participant::new("b".into(), "B".into()),
        );
        call.apply(&CallUpdate {
            offer: Some("v=0".into()),
            ..Default::default()
        });
        assert_eq!(call.status(), CallStatus::Calling);
        assert_eq!(call.offer().as_deref(), Some("v=0"));

        call.apply(&CallUpdate::ended(42));
        assert_eq!(call.status(), CallStatus::Ended);
        assert_eq!(call.end_time(), Some(42));
        assert_eq!(call.offer().as_deref(), Some("v=0"));
    }

    #[test]
    fn pending_statuses() {
        assert!(CallStatus::Calling.is_pending());
        assert!(CallStatus::Ringing.is_pending());
        assert!(!CallStatus::Accepted.is_pending());
        assert!(!CallStatus::Missed.is_pending());
    }
}
