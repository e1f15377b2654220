//! Sources for the Mixpanel raw event export: the live export API and
//! previously downloaded export files.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use glob::glob;
use mpph_core::{Message, MixpanelSpec, Operator, RecordTx, Source};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::export_decoder::{forward_decoded, ExportDecoder};

const DATE_FORMAT: &str = "%Y-%m-%d";
const FILE_CHUNK: usize = 64 * 1024;

/// Streams `GET {api_url}/export` for an inclusive date range.
pub struct MixpanelExportSource {
    pub id: String,
    spec: MixpanelSpec,
    from_date: NaiveDate,
    to_date: NaiveDate,
    http: Client,
}

impl MixpanelExportSource {
    pub fn try_new(
        id: String,
        spec: MixpanelSpec,
        from_date: NaiveDate,
        to_date: NaiveDate,
    ) -> Result<Self> {
        anyhow::ensure!(
            from_date <= to_date,
            "from_date {} is after to_date {}",
            from_date,
            to_date
        );
        // no overall timeout: large exports stream for a long time
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            id,
            spec,
            from_date,
            to_date,
            http,
        })
    }

    pub fn export_url(&self) -> String {
        format!("{}/export", self.spec.api_url.trim_end_matches('/'))
    }

    /// Query parameters of the export request
    pub fn query(&self) -> [(&'static str, String); 3] {
        [
            ("from_date", self.from_date.format(DATE_FORMAT).to_string()),
            ("to_date", self.to_date.format(DATE_FORMAT).to_string()),
            ("project_id", self.spec.project_id.clone()),
        ]
    }
}

#[async_trait]
impl Operator for MixpanelExportSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for MixpanelExportSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<()> {
        info!(
            from_date = %self.from_date,
            to_date = %self.to_date,
            project_id = %self.spec.project_id,
            "Exporting data from Mixpanel"
        );

        let response = self
            .http
            .get(self.export_url())
            .query(&self.query())
            .basic_auth(&self.spec.username, Some(&self.spec.password))
            .send()
            .await
            .context("requesting Mixpanel export")?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("status={}; Export failed: {}", status, body.trim());
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = ExportDecoder::new();
        loop {
            let chunk = tokio::select! {
                biased;
                // a cancelled export is incomplete: no end-of-stream marker
                _ = cancel.cancelled() => {
                    warn!(units = decoder.units(), "Mixpanel export cancelled");
                    return Ok(());
                }
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(bytes) => {
                    decoder.feed(&bytes.context("reading Mixpanel export body")?);
                    if !forward_decoded(&mut decoder, &tx).await? {
                        return Ok(());
                    }
                }
                None => {
                    decoder.finish()?;
                    break;
                }
            }
        }

        info!(units = decoder.units(), "Mixpanel export finished");
        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}

/// Reads export files matching a path or glob pattern, in sorted order.
pub struct ExportFileSource {
    pub id: String,
    pub path: String,
}

impl ExportFileSource {
    pub fn new(id: String, path: String) -> Self {
        Self { id, path }
    }
}

#[async_trait]
impl Operator for ExportFileSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for ExportFileSource {
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<()> {
        let mut paths = vec![];
        for entry in glob(&self.path).context("glob")? {
            paths.push(entry?);
        }
        paths.sort();

        if paths.is_empty() {
            anyhow::bail!("no files matched: {}", self.path);
        }

        let mut chunk = vec![0u8; FILE_CHUNK];
        for path in &paths {
            let mut file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("open {}", path.display()))?;
            // each file is a complete export on its own
            let mut decoder = ExportDecoder::new();

            loop {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let read = file
                    .read(&mut chunk)
                    .await
                    .with_context(|| format!("read {}", path.display()))?;
                if read == 0 {
                    decoder
                        .finish()
                        .with_context(|| format!("decode {}", path.display()))?;
                    break;
                }
                decoder.feed(&chunk[..read]);
                let open = forward_decoded(&mut decoder, &tx)
                    .await
                    .with_context(|| format!("decode {}", path.display()))?;
                if !open {
                    return Ok(());
                }
            }
            info!(file = %path.display(), units = decoder.units(), "Export file finished");
        }

        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}
