//! Records that flow through the migration pipeline.
//!
//! Property bags on both sides of the migration are loosely typed, so every
//! record carries a [`Properties`] map of JSON values. Strongly typed fields
//! only exist for the handful of keys the destination treats specially
//! (`distinct_id`, timestamps, event name).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dynamically typed property bag: string keys, JSON values (string, number,
/// bool, null, arrays and nested maps).
pub type Properties = serde_json::Map<String, Value>;

/// One decoded unit of the Mixpanel raw export stream.
///
/// ```json
/// {"event": "Pageview", "properties": {"distinct_id": "u1", "time": 1700000000}}
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawEventRecord {
    /// Source event label
    #[serde(default)]
    pub event: String,

    /// Everything Mixpanel knows about the occurrence, including
    /// `distinct_id` and `time`
    #[serde(default)]
    pub properties: Properties,
}

/// An event in the destination schema, ready to be captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event: String,
    pub distinct_id: String,
    pub occurred_at: DateTime<Utc>,
    pub properties: Properties,
}

/// One row of the people CSV export, keyed by column header.
///
/// Column order is kept so the row can be mapped back to its header line,
/// but lookups are always by header name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawUserRecord {
    pub columns: Vec<(String, String)>,
}

impl RawUserRecord {
    pub fn new(columns: Vec<(String, String)>) -> Self {
        Self { columns }
    }

    /// Value of the first column named `header`
    pub fn get(&self, header: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == header)
            .map(|(_, value)| value.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawUserRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A user profile in the destination schema, sent as an identify call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedUser {
    pub distinct_id: String,
    pub properties: Properties,
    pub identify_timestamp: DateTime<Utc>,
}

impl NormalizedUser {
    /// The user's `email` property, if it is a non-blank string.
    ///
    /// Blank emails never participate in identity reconciliation, otherwise
    /// every row with an empty CSV cell would collapse onto one identity.
    pub fn email(&self) -> Option<&str> {
        match self.properties.get("email") {
            Some(Value::String(email)) if !email.trim().is_empty() => Some(email.as_str()),
            _ => None,
        }
    }
}

/// Unit accepted by the sink adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Event(NormalizedEvent),
    User(NormalizedUser),
}

impl Record {
    pub fn distinct_id(&self) -> &str {
        match self {
            Record::Event(event) => &event.distinct_id,
            Record::User(user) => &user.distinct_id,
        }
    }

    /// Short label used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Event(_) => "event",
            Record::User(_) => "user",
        }
    }
}

impl From<NormalizedEvent> for Record {
    fn from(event: NormalizedEvent) -> Self {
        Record::Event(event)
    }
}

impl From<NormalizedUser> for Record {
    fn from(user: NormalizedUser) -> Self {
        Record::User(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_with(email: Value) -> NormalizedUser {
        let mut properties = Properties::new();
        properties.insert("email".into(), email);
        NormalizedUser {
            distinct_id: "abc".into(),
            properties,
            identify_timestamp: Utc::now(),
        }
    }

    #[test]
    fn raw_event_tolerates_missing_fields() {
        let raw: RawEventRecord = serde_json::from_value(json!({"event": "Signup"})).unwrap();
        assert_eq!(raw.event, "Signup");
        assert!(raw.properties.is_empty());
    }

    #[test]
    fn raw_user_lookup_is_by_header() {
        let row: RawUserRecord = [("$distinct_id", "u1"), ("$email", "a@x.com")]
            .into_iter()
            .collect();
        assert_eq!(row.get("$email"), Some("a@x.com"));
        assert_eq!(row.get("$city"), None);
    }

    #[test]
    fn email_ignores_blank_and_non_string_values() {
        assert_eq!(user_with(json!("a@x.com")).email(), Some("a@x.com"));
        assert_eq!(user_with(json!("  ")).email(), None);
        assert_eq!(user_with(json!(42)).email(), None);
    }
}
