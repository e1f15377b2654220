//! Mixpanel export unit → PostHog event.

use std::fmt;

use chrono::{DateTime, Utc};
use mpph_core::{NormalizedEvent, Properties, RawEventRecord, MIGRATOR_IDENTITY};
use serde_json::Value;
use tracing::info;

/// Source event names with a reserved PostHog equivalent
static EVENT_ALIASES: &[(&str, &str)] = &[("Pageview", "$pageview")];

/// What happens to a source property key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAction {
    /// Becomes the event's `distinct_id`
    DistinctId,
    /// Epoch seconds, becomes the event timestamp
    Time,
    /// Moved under `rename_to` with the value tagged as imported
    TagImported { rename_to: &'static str },
    /// Source bookkeeping, meaningless in the destination
    Drop,
    Passthrough,
}

static PROPERTY_ACTIONS: &[(&str, PropertyAction)] = &[
    ("distinct_id", PropertyAction::DistinctId),
    ("time", PropertyAction::Time),
    ("mp_lib", PropertyAction::TagImported { rename_to: "$lib" }),
    ("$mp_api_endpoint", PropertyAction::Drop),
    ("$mp_api_timestamp_ms", PropertyAction::Drop),
    ("mp_processing_time_ms", PropertyAction::Drop),
];

pub fn event_alias(name: &str) -> Option<&'static str> {
    EVENT_ALIASES
        .iter()
        .find(|(source, _)| *source == name)
        .map(|(_, dest)| *dest)
}

pub fn property_action(key: &str) -> PropertyAction {
    PROPERTY_ACTIONS
        .iter()
        .find(|(source, _)| *source == key)
        .map(|(_, action)| *action)
        .unwrap_or(PropertyAction::Passthrough)
}

/// Why a raw record produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyEventName,
    MissingDistinctId,
    InvalidDistinctId,
    MissingTime,
    InvalidTime,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SkipReason::EmptyEventName => "empty event name",
            SkipReason::MissingDistinctId => "no distinct_id",
            SkipReason::InvalidDistinctId => "distinct_id is not a non-empty string",
            SkipReason::MissingTime => "no time",
            SkipReason::InvalidTime => "time is not epoch seconds",
        };
        f.write_str(reason)
    }
}

/// Remaps Mixpanel export units into PostHog events.
///
/// Stateless apart from the library version stamped on every event.
#[derive(Debug, Clone)]
pub struct EventTransformer {
    lib_version: String,
}

impl EventTransformer {
    /// `version` is the migrator's own release, not the source library's.
    pub fn new(version: &str) -> Self {
        Self {
            lib_version: format!("{MIGRATOR_IDENTITY}@{version}"),
        }
    }

    /// Value injected as `$lib_version`
    pub fn lib_version(&self) -> &str {
        &self.lib_version
    }

    /// Transform one record, logging and discarding it when a required
    /// field is missing.
    pub fn transform(&self, raw: &RawEventRecord) -> Option<NormalizedEvent> {
        match self.try_transform(raw) {
            Ok(event) => Some(event),
            Err(reason) => {
                info!(event = %raw.event, %reason, "Skipping event");
                None
            }
        }
    }

    pub fn try_transform(&self, raw: &RawEventRecord) -> Result<NormalizedEvent, SkipReason> {
        if raw.event.is_empty() {
            return Err(SkipReason::EmptyEventName);
        }
        let event = event_alias(&raw.event).unwrap_or(raw.event.as_str()).to_string();

        let mut distinct_id = None;
        let mut time = None;
        let mut tagged = Vec::new();
        let mut properties = Properties::new();

        for (key, value) in &raw.properties {
            match property_action(key) {
                PropertyAction::DistinctId => distinct_id = Some(value),
                PropertyAction::Time => time = Some(value),
                PropertyAction::TagImported { rename_to } => tagged.push((rename_to, value)),
                PropertyAction::Drop => {}
                PropertyAction::Passthrough => {
                    properties.insert(key.clone(), value.clone());
                }
            }
        }

        let distinct_id = match distinct_id {
            None => return Err(SkipReason::MissingDistinctId),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(SkipReason::InvalidDistinctId),
        };
        let occurred_at = match time {
            None => return Err(SkipReason::MissingTime),
            Some(value) => parse_epoch_seconds(value).ok_or(SkipReason::InvalidTime)?,
        };

        // rewrites and the library tag win over same-named source properties
        for (rename_to, value) in tagged {
            properties.insert(
                rename_to.to_string(),
                Value::String(format!("{}-imported", display_value(value))),
            );
        }
        properties.insert("$lib_version".into(), Value::String(self.lib_version.clone()));

        Ok(NormalizedEvent {
            event,
            distinct_id,
            occurred_at,
            properties,
        })
    }
}

/// Whole seconds since the epoch. Floats are truncated toward zero.
fn parse_epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => match n.as_i64() {
            Some(secs) => secs,
            None => {
                let secs = n.as_f64().filter(|f| f.is_finite())?;
                if secs.abs() > i64::MAX as f64 {
                    return None;
                }
                secs.trunc() as i64
            }
        },
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
