//! # MPPH TX - Mixpanel → PostHog transforms
//!
//! Pure remapping logic plus the pipeline operators that drive it:
//!
//! - [`event::EventTransformer`] / [`EventTransform`]: export units → events
//! - [`users::reconcile`] / [`UserReconcile`]: CSV rows → reconciled users

use async_trait::async_trait;
use mpph_core::{Message, Operator, RawUserRecord, Record, RecordRx, RecordTx, Transform};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod event;
pub mod users;

pub use event::{EventTransformer, PropertyAction, SkipReason};
pub use users::{reconcile, reconcile_rows, users_from_rows, IdentityMap};

/// Streams raw export units through an [`EventTransformer`].
pub struct EventTransform {
    id: String,
    transformer: EventTransformer,
}

impl EventTransform {
    pub fn new(id: String, transformer: EventTransformer) -> Self {
        Self { id, transformer }
    }
}

#[async_trait]
impl Operator for EventTransform {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Transform for EventTransform {
    async fn run(
        &mut self,
        mut rx: RecordRx,
        tx: RecordTx,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(operator = %self.id, "Event transform started");
        let (mut transformed, mut skipped) = (0usize, 0usize);

        while let Some(msg) = rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            let out = match msg {
                Message::RawEvent(raw) => match self.transformer.transform(&raw) {
                    Some(event) => {
                        transformed += 1;
                        Message::Record(Record::Event(event))
                    }
                    None => {
                        skipped += 1;
                        continue;
                    }
                },
                Message::Eos => {
                    let _ = tx.send(Message::Eos).await;
                    break;
                }
                other => {
                    warn!(operator = %self.id, "Event transform forwarding non-event message");
                    other
                }
            };
            if tx.send(out).await.is_err() {
                info!(operator = %self.id, "Event transform: downstream closed");
                break;
            }
        }

        info!(operator = %self.id, transformed, skipped, "Event transform finished");
        Ok(())
    }
}

/// Collects every CSV row, then emits the reconciled users.
///
/// Reconciliation needs the full row set, so nothing is emitted before the
/// upstream end-of-stream marker.
pub struct UserReconcile {
    id: String,
}

impl UserReconcile {
    pub fn new(id: String) -> Self {
        Self { id }
    }
}

#[async_trait]
impl Operator for UserReconcile {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Transform for UserReconcile {
    async fn run(
        &mut self,
        mut rx: RecordRx,
        tx: RecordTx,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut rows: Vec<RawUserRecord> = Vec::new();
        let mut complete = false;

        while let Some(msg) = rx.recv().await {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match msg {
                Message::RawUser(row) => rows.push(row),
                Message::Eos => {
                    complete = true;
                    break;
                }
                _ => warn!(operator = %self.id, "User reconcile ignoring non-user message"),
            }
        }
        if !complete {
            if cancel.is_cancelled() {
                return Ok(());
            }
            anyhow::bail!("user rows ended without end-of-stream marker; refusing partial reconcile");
        }

        info!(operator = %self.id, rows = rows.len(), "Reconciling users");
        for user in users::reconcile_rows(&rows) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if tx.send(Message::Record(Record::User(user))).await.is_err() {
                info!(operator = %self.id, "User reconcile: downstream closed");
                return Ok(());
            }
        }
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
