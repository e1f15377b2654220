//! PostHog destination: batch HTTP client and the pipeline sink operator.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use mpph_core::{
    CaptureMessage, DeliveryError, IdentifyMessage, IngestionClient, Message, Operator,
    PostHogSpec, Record, RecordRx, Sink, SinkError,
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::sink_adapter::RateLimitedSink;
use crate::wire::{BatchItem, BatchRequest};

/// Buffers capture/identify messages and posts them to `{endpoint}/batch/`.
///
/// A message is accepted once buffered; the request that carries it is sent
/// when the buffer reaches `batch_size` or on [`IngestionClient::close`]. A
/// failed request fails the call that triggered it.
pub struct PostHogClient {
    http: Client,
    batch_url: String,
    api_key: String,
    batch_size: usize,
    buffer: Vec<BatchItem>,
    closed: bool,
}

impl PostHogClient {
    pub fn new(spec: &PostHogSpec) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            batch_url: format!("{}/batch/", spec.endpoint.trim_end_matches('/')),
            api_key: spec.project_key.clone(),
            batch_size: spec.batch_size.max(1),
            buffer: Vec::with_capacity(spec.batch_size.max(1)),
            closed: false,
        })
    }

    pub fn batch_url(&self) -> &str {
        &self.batch_url
    }

    async fn push(&mut self, item: BatchItem) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.buffer.push(item);
        if self.buffer.len() >= self.batch_size {
            // the message being pushed was never accepted, so it is not lost
            self.flush().await.map_err(|e| match e {
                SinkError::Transport { message, lost } => SinkError::Transport {
                    message,
                    lost: lost.saturating_sub(1),
                },
                SinkError::Rejected { status, body, lost } => SinkError::Rejected {
                    status,
                    body,
                    lost: lost.saturating_sub(1),
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Post everything buffered. A failed batch is not retried, so it is
    /// dropped either way and reported as `lost`.
    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let lost = batch.len();
        let request = BatchRequest {
            api_key: &self.api_key,
            batch: &batch,
        };

        let response = self
            .http
            .post(&self.batch_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SinkError::Transport {
                message: e.to_string(),
                lost,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
                lost,
            });
        }
        info!(messages = batch.len(), "Flushed batch to PostHog");
        Ok(())
    }
}

#[async_trait]
impl IngestionClient for PostHogClient {
    async fn capture(&mut self, message: CaptureMessage) -> Result<(), SinkError> {
        self.push(message.into()).await
    }

    async fn identify(&mut self, message: IdentifyMessage) -> Result<(), SinkError> {
        self.push(message.into()).await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush().await
    }
}

/// Pipeline sink delivering normalized records through a [`RateLimitedSink`].
pub struct PostHogSink<C> {
    id: String,
    adapter: RateLimitedSink<C>,
}

impl<C: IngestionClient> PostHogSink<C> {
    pub fn new(id: String, client: C, spacing: Duration) -> Self {
        Self {
            id,
            adapter: RateLimitedSink::new(client, spacing),
        }
    }

    pub fn delivered(&self) -> usize {
        self.adapter.delivered()
    }

    pub fn into_inner(self) -> C {
        self.adapter.into_inner()
    }
}

#[async_trait]
impl<C: IngestionClient + Sync> Operator for PostHogSink<C> {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl<C: IngestionClient + Sync> Sink for PostHogSink<C> {
    async fn run(&mut self, mut rx: RecordRx, cancel: CancellationToken) -> Result<()> {
        let (mut events, mut users) = (0usize, 0usize);
        let mut saw_eos = false;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(operator = %self.id, "Sink cancelled");
                    break;
                }
                msg = rx.recv() => msg,
            };
            let record = match msg {
                Some(Message::Record(record)) => record,
                Some(Message::Eos) => {
                    saw_eos = true;
                    break;
                }
                Some(_) => {
                    warn!(operator = %self.id, "Sink ignoring untransformed message");
                    continue;
                }
                None => break,
            };

            let is_event = matches!(record, Record::Event(_));
            let distinct_id = record.distinct_id().to_string();
            if let Err(source) = self.adapter.send(record).await {
                error!(operator = %self.id, %distinct_id, error = %source, "Error importing record");
                if let Err(close_error) = self.adapter.close().await {
                    warn!(operator = %self.id, error = %close_error, "Closing client after failure");
                }
                return Err(DeliveryError {
                    delivered: self.adapter.delivered(),
                    source,
                }
                .into());
            }
            if is_event {
                events += 1;
            } else {
                users += 1;
            }
        }

        if !saw_eos {
            warn!(operator = %self.id, "Input ended without end-of-stream; flushing what was delivered");
        }
        if let Err(source) = self.adapter.close().await {
            error!(operator = %self.id, error = %source, "Error flushing final batch");
            return Err(DeliveryError {
                delivered: self.adapter.delivered(),
                source,
            }
            .into());
        }
        info!(operator = %self.id, events, users, "Sink finished");
        Ok(())
    }
}
