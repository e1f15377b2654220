//! Rate-limited adapter between normalized records and an ingestion client.

use std::time::Duration;

use mpph_core::{
    CaptureMessage, DeliveryError, IdentifyMessage, IngestionClient, NormalizedEvent,
    NormalizedUser, Record, SinkError,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::pacing::Pacer;

/// Destination flag suppressing IP-based geolocation enrichment
pub const GEOIP_DISABLE: &str = "$geoip_disable";

/// Library tag carried by migrated identify records
pub const IDENTIFY_LIB: &str = "stablecog/mp-to-ph-identify";

/// Event → capture message. Migrated events already carry their own geo
/// properties, re-deriving them from the migrator's IP would be wrong.
pub fn capture_message(event: NormalizedEvent) -> CaptureMessage {
    let mut properties = event.properties;
    properties.insert(GEOIP_DISABLE.into(), Value::Bool(true));
    CaptureMessage {
        distinct_id: event.distinct_id,
        event: event.event,
        properties,
        timestamp: event.occurred_at,
    }
}

/// User → identify message; profile properties go to `$set`.
pub fn identify_message(user: NormalizedUser) -> IdentifyMessage {
    let mut properties = mpph_core::Properties::new();
    properties.insert(GEOIP_DISABLE.into(), Value::Bool(true));
    properties.insert("$lib".into(), Value::String(IDENTIFY_LIB.into()));
    IdentifyMessage {
        distinct_id: user.distinct_id,
        set: user.properties,
        properties,
        timestamp: user.identify_timestamp,
    }
}

/// Sends records one at a time with a minimum spacing between sends.
///
/// `&mut self` on every send keeps exactly one send in flight. The first
/// failure is returned to the caller; nothing is retried here.
pub struct RateLimitedSink<C> {
    client: C,
    pacer: Pacer,
    delivered: usize,
}

impl<C: IngestionClient> RateLimitedSink<C> {
    pub fn new(client: C, spacing: Duration) -> Self {
        Self {
            client,
            pacer: Pacer::new(spacing),
            delivered: 0,
        }
    }

    pub async fn send(&mut self, record: Record) -> Result<(), SinkError> {
        self.pacer.ready().await;
        debug!(kind = record.kind(), distinct_id = record.distinct_id(), "Sending record");
        let result = match record {
            Record::Event(event) => self.client.capture(capture_message(event)).await,
            Record::User(user) => self.client.identify(identify_message(user)).await,
        };
        self.pacer.mark_sent();
        if let Err(e) = result {
            self.forget_lost(&e);
            return Err(e);
        }
        self.delivered += 1;
        Ok(())
    }

    /// Buffered messages that went down with a failed request were counted
    /// when the client accepted them; take them back out.
    fn forget_lost(&mut self, error: &SinkError) {
        let lost = error.lost().min(self.delivered);
        if lost > 0 {
            warn!(lost, "Accepted records dropped with a failed batch");
            self.delivered -= lost;
        }
    }

    /// Send every record in order, aborting on the first failure.
    ///
    /// Returns how many records this call delivered.
    pub async fn send_all<I>(&mut self, records: I) -> Result<usize, DeliveryError>
    where
        I: IntoIterator<Item = Record>,
    {
        let start = self.delivered;
        for record in records {
            if let Err(source) = self.send(record).await {
                return Err(DeliveryError {
                    delivered: self.delivered.saturating_sub(start),
                    source,
                });
            }
        }
        Ok(self.delivered - start)
    }

    /// Flush and close the underlying client
    pub async fn close(&mut self) -> Result<(), SinkError> {
        let result = self.client.close().await;
        if let Err(e) = &result {
            self.forget_lost(e);
        }
        result
    }

    /// Records accepted so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub fn into_inner(self) -> C {
        self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mpph_core::Properties;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::time::Instant;

    #[derive(Debug, PartialEq)]
    enum Sent {
        Capture(CaptureMessage),
        Identify(IdentifyMessage),
    }

    /// Records every call with the (paused) time it happened at
    #[derive(Default)]
    struct Recorder {
        sent: Vec<(Sent, Instant)>,
        fail_on: Option<usize>,
    }

    impl Recorder {
        fn check(&self) -> Result<(), SinkError> {
            if self.fail_on == Some(self.sent.len()) {
                return Err(SinkError::Rejected {
                    status: 429,
                    body: "slow down".into(),
                    lost: 0,
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl IngestionClient for Recorder {
        async fn capture(&mut self, message: CaptureMessage) -> Result<(), SinkError> {
            self.check()?;
            self.sent.push((Sent::Capture(message), Instant::now()));
            Ok(())
        }

        async fn identify(&mut self, message: IdentifyMessage) -> Result<(), SinkError> {
            self.check()?;
            self.sent.push((Sent::Identify(message), Instant::now()));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn event(id: &str) -> Record {
        let mut properties = Properties::new();
        properties.insert("$lib".into(), json!("web-imported"));
        Record::Event(NormalizedEvent {
            event: "$pageview".into(),
            distinct_id: id.into(),
            occurred_at: Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap(),
            properties,
        })
    }

    fn user(id: &str) -> Record {
        let mut properties = Properties::new();
        properties.insert("email".into(), json!("a@x.com"));
        Record::User(NormalizedUser {
            distinct_id: id.into(),
            properties,
            identify_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn events_get_geoip_disabled() {
        let mut sink = RateLimitedSink::new(Recorder::default(), Duration::from_millis(1));
        sink.send(event("u1")).await.unwrap();

        let recorder = sink.into_inner();
        let Sent::Capture(message) = &recorder.sent[0].0 else {
            panic!("expected capture");
        };
        assert_eq!(message.distinct_id, "u1");
        assert_eq!(message.event, "$pageview");
        assert_eq!(
            Value::Object(message.properties.clone()),
            json!({"$lib": "web-imported", "$geoip_disable": true})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn users_get_geoip_disabled_and_library_tag() {
        let mut sink = RateLimitedSink::new(Recorder::default(), Duration::from_millis(5));
        sink.send(user("u1")).await.unwrap();

        let recorder = sink.into_inner();
        let Sent::Identify(message) = &recorder.sent[0].0 else {
            panic!("expected identify");
        };
        assert_eq!(
            Value::Object(message.properties.clone()),
            json!({"$geoip_disable": true, "$lib": IDENTIFY_LIB})
        );
        assert_eq!(Value::Object(message.set.clone()), json!({"email": "a@x.com"}));
        assert_eq!(message.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_spaced() {
        let mut sink = RateLimitedSink::new(Recorder::default(), Duration::from_millis(5));
        let delivered = sink
            .send_all(vec![user("a"), user("b"), user("c")])
            .await
            .unwrap();
        assert_eq!(delivered, 3);

        let times: Vec<Instant> = sink.into_inner().sent.iter().map(|(_, t)| *t).collect();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_aborts_the_batch() {
        let recorder = Recorder {
            fail_on: Some(2),
            ..Default::default()
        };
        let mut sink = RateLimitedSink::new(recorder, Duration::from_millis(1));
        let err = sink
            .send_all(vec![event("a"), event("b"), event("c"), event("d")])
            .await
            .unwrap_err();

        assert_eq!(err.delivered, 2);
        assert!(matches!(err.source, SinkError::Rejected { status: 429, .. }));
        assert_eq!(sink.delivered(), 2);
        assert_eq!(sink.into_inner().sent.len(), 2);
    }
}
