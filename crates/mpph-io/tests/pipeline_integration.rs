//! End-to-end runs of source → transform → sink over in-memory channels.

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use mpph_core::{
    CaptureMessage, DeliveryError, IdentifyMessage, IngestionClient, SinkError, Sink, Source,
    Transform,
};
use mpph_io::sink_posthog::PostHogSink;
use mpph_io::sink_stdout::StdoutClient;
use mpph_io::source_csv::UsersCsvSource;
use mpph_io::source_export::ExportFileSource;
use mpph_tx::{EventTransform, EventTransformer, UserReconcile};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const VALID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn file_with(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn lines(out: Vec<u8>) -> Vec<Value> {
    String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

type StdoutSink = PostHogSink<StdoutClient<Vec<u8>>>;

fn stdout_sink() -> StdoutSink {
    PostHogSink::new(
        "posthog".into(),
        StdoutClient::with_writer(Vec::new()),
        Duration::from_millis(1),
    )
}

async fn run_events(
    path: &str,
    sink: &mut StdoutSink,
) -> (anyhow::Result<()>, anyhow::Result<()>, anyhow::Result<()>) {
    let cancel = CancellationToken::new();
    let (tx1, rx1) = mpsc::channel(1);
    let (tx2, rx2) = mpsc::channel(1);
    let mut source = ExportFileSource::new("export".into(), path.to_string());
    let mut transform = EventTransform::new("events".into(), EventTransformer::new("test"));

    tokio::join!(
        source.run(tx1, cancel.child_token()),
        transform.run(rx1, tx2, cancel.child_token()),
        sink.run(rx2, cancel.child_token()),
    )
}

#[tokio::test]
async fn export_file_to_capture_messages() {
    let export = file_with(concat!(
        r#"{"event":"Pageview","properties":{"distinct_id":"u1","time":1700000000,"mp_lib":"web","$mp_api_endpoint":"api.mixpanel.com"}}"#,
        "\n",
        r#"{"event":"Signup","properties":{"distinct_id":"u2"}}"#,
        "\n",
        r#"{"event":"Signup","properties":{"distinct_id":"u3","time":1700000001,"plan":"pro"}}"#,
        "\n",
    ));

    let mut sink = stdout_sink();
    let (source, transform, delivered) =
        run_events(export.path().to_str().unwrap(), &mut sink).await;
    source.unwrap();
    transform.unwrap();
    delivered.unwrap();
    assert_eq!(sink.delivered(), 2);

    let out = lines(sink.into_inner().into_inner());
    assert_eq!(
        out,
        vec![
            json!({
                "type": "capture",
                "event": "$pageview",
                "distinct_id": "u1",
                "timestamp": "2023-11-14T22:13:20Z",
                "properties": {
                    "$lib": "web-imported",
                    "$lib_version": "stablecog/mp-to-ph@test",
                    "$geoip_disable": true
                }
            }),
            json!({
                "type": "capture",
                "event": "Signup",
                "distinct_id": "u3",
                "timestamp": "2023-11-14T22:13:21Z",
                "properties": {
                    "plan": "pro",
                    "$lib_version": "stablecog/mp-to-ph@test",
                    "$geoip_disable": true
                }
            }),
        ]
    );
}

#[tokio::test]
async fn truncated_export_fails_but_keeps_earlier_events() {
    let export = file_with(concat!(
        r#"{"event":"A","properties":{"distinct_id":"u1","time":1}}"#,
        "\n",
        r#"{"event":"B","properties":{"distinct_id":"u2","ti"#,
    ));

    let mut sink = stdout_sink();
    let (source, transform, delivered) =
        run_events(export.path().to_str().unwrap(), &mut sink).await;

    assert!(source.is_err());
    transform.unwrap();
    delivered.unwrap();

    let out = lines(sink.into_inner().into_inner());
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["distinct_id"], json!("u1"));
}

#[tokio::test]
async fn users_csv_to_reconciled_identifies() {
    let csv = file_with(&format!(
        "$distinct_id,$email,$city,$mp_first_event_time,plan\n\
         abc123,a@x.com,Berlin,2023-01-01T00:00:00,free\n\
         {VALID},a@x.com,Berlin,2023-01-01T00:00:00,pro\n\
         legacy-7,,Paris,2023-01-01T00:00:00,free\n"
    ));

    let cancel = CancellationToken::new();
    let (tx1, rx1) = mpsc::channel(1);
    let (tx2, rx2) = mpsc::channel(1);
    let mut source = UsersCsvSource::new("users-csv".into(), csv.path().to_str().unwrap().into());
    let mut reconcile = UserReconcile::new("reconcile".into());
    let mut sink = PostHogSink::new(
        "posthog".into(),
        StdoutClient::with_writer(Vec::new()),
        Duration::from_millis(5),
    );

    let (a, b, c) = tokio::join!(
        source.run(tx1, cancel.child_token()),
        reconcile.run(rx1, tx2, cancel.child_token()),
        sink.run(rx2, cancel.child_token()),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let out = lines(sink.into_inner().into_inner());
    let ids: Vec<&str> = out.iter().map(|l| l["distinct_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec![VALID, VALID, "legacy-7"]);

    assert_eq!(out[0]["type"], json!("identify"));
    assert_eq!(out[0]["event"], json!("$identify"));
    assert_eq!(out[0]["properties"]["$geoip_disable"], json!(true));
    assert_eq!(out[0]["properties"]["$lib"], json!("stablecog/mp-to-ph-identify"));
    assert_eq!(
        out[0]["properties"]["$set"],
        json!({"email": "a@x.com", "$geoip_city_name": "Berlin", "plan": "free"})
    );
}

/// Accepts `limit` messages, then rejects everything
struct FlakyClient {
    accepted: usize,
    limit: usize,
}

#[async_trait]
impl IngestionClient for FlakyClient {
    async fn capture(&mut self, _message: CaptureMessage) -> Result<(), SinkError> {
        if self.accepted == self.limit {
            return Err(SinkError::Transport {
                message: "connection reset".into(),
                lost: 0,
            });
        }
        self.accepted += 1;
        Ok(())
    }

    async fn identify(&mut self, _message: IdentifyMessage) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[tokio::test]
async fn sink_failure_aborts_the_export() {
    let mut export = String::new();
    for i in 0..5 {
        export.push_str(&format!(
            "{{\"event\":\"E\",\"properties\":{{\"distinct_id\":\"u{i}\",\"time\":{i}}}}}\n"
        ));
    }
    let export = file_with(&export);

    let cancel = CancellationToken::new();
    let (tx1, rx1) = mpsc::channel(1);
    let (tx2, rx2) = mpsc::channel(1);
    let mut source = ExportFileSource::new("export".into(), export.path().to_str().unwrap().into());
    let mut transform = EventTransform::new("events".into(), EventTransformer::new("test"));
    let mut sink = PostHogSink::new(
        "posthog".into(),
        FlakyClient { accepted: 0, limit: 2 },
        Duration::ZERO,
    );

    let (_, _, delivered) = tokio::join!(
        source.run(tx1, cancel.child_token()),
        transform.run(rx1, tx2, cancel.child_token()),
        sink.run(rx2, cancel.child_token()),
    );

    let err = delivered.unwrap_err();
    let delivery = err.downcast_ref::<DeliveryError>().unwrap();
    assert_eq!(delivery.delivered, 2);
    assert!(matches!(delivery.source, SinkError::Transport { .. }));
    assert_eq!(sink.into_inner().accepted, 2);
}
