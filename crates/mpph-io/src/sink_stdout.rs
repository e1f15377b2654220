use std::io::{self, Write};

use async_trait::async_trait;
use mpph_core::{CaptureMessage, IdentifyMessage, IngestionClient, SinkError};

use crate::wire::BatchItem;

/// Dry-run client: prints one batch item per line instead of sending it.
pub struct StdoutClient<W = io::Stdout> {
    out: W,
}

impl StdoutClient {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for StdoutClient {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StdoutClient<W> {
    pub fn with_writer(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, item: &BatchItem) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.out, item)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

#[async_trait]
impl<W: Write + Send> IngestionClient for StdoutClient<W> {
    async fn capture(&mut self, message: CaptureMessage) -> Result<(), SinkError> {
        self.emit(&message.into())
    }

    async fn identify(&mut self, message: IdentifyMessage) -> Result<(), SinkError> {
        self.emit(&message.into())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mpph_core::Properties;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn writes_json_lines() {
        let mut client = StdoutClient::with_writer(Vec::new());
        let mut set = Properties::new();
        set.insert("email".into(), json!("a@x.com"));
        let ts = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();

        client
            .capture(CaptureMessage {
                distinct_id: "u1".into(),
                event: "$pageview".into(),
                properties: Properties::new(),
                timestamp: ts,
            })
            .await
            .unwrap();
        client
            .identify(IdentifyMessage {
                distinct_id: "u1".into(),
                set,
                properties: Properties::new(),
                timestamp: ts,
            })
            .await
            .unwrap();
        client.close().await.unwrap();

        let out = String::from_utf8(client.into_inner()).unwrap();
        let lines: Vec<Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                json!({"type": "capture", "event": "$pageview", "distinct_id": "u1",
                       "properties": {}, "timestamp": "2023-11-14T22:13:20Z"}),
                json!({"type": "identify", "event": "$identify", "distinct_id": "u1",
                       "properties": {"$set": {"email": "a@x.com"}},
                       "timestamp": "2023-11-14T22:13:20Z"}),
            ]
        );
    }
}
