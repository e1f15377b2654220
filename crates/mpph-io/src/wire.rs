//! PostHog batch API message shape, shared by the HTTP and stdout clients.

use chrono::{DateTime, Utc};
use mpph_core::{CaptureMessage, IdentifyMessage, Properties};
use serde::Serialize;
use serde_json::Value;

/// One element of the `/batch/` payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub event: String,
    pub distinct_id: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

impl From<CaptureMessage> for BatchItem {
    fn from(message: CaptureMessage) -> Self {
        Self {
            kind: "capture",
            event: message.event,
            distinct_id: message.distinct_id,
            properties: message.properties,
            timestamp: message.timestamp,
        }
    }
}

impl From<IdentifyMessage> for BatchItem {
    fn from(message: IdentifyMessage) -> Self {
        let mut properties = message.properties;
        properties.insert("$set".into(), Value::Object(message.set));
        Self {
            kind: "identify",
            event: "$identify".into(),
            distinct_id: message.distinct_id,
            properties,
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub api_key: &'a str,
    pub batch: &'a [BatchItem],
}
