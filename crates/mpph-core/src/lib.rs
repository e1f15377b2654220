//! # MPPH Core - Mixpanel to PostHog migration core library
//!
//! This crate provides the foundational types and traits shared by the
//! migration pipeline: the records that flow between operators, the operator
//! interfaces, the destination client seam and configuration.
//!
//! ## Key Components
//!
//! - **Records**: raw Mixpanel units and their normalized PostHog forms
//! - **Message System**: messages passed between pipeline operators
//! - **Operator Traits**: Source, Transform and Sink abstractions
//! - **Ingestion Client**: the black-box destination accepting one message at a time
//! - **Configuration**: layered YAML/environment migration settings
//!
//! ## Example Usage
//!
//! ```rust
//! use mpph_core::{Message, Source, Transform, Sink};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (tx, rx) = mpsc::channel::<Message>(1);
//! let cancel = CancellationToken::new();
//!
//! // Pipeline operators implement the Source, Transform and Sink traits
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod record;
pub mod spec;

pub use error::{DecodeError, DeliveryError, MpphError, SinkError};
pub use record::{
    NormalizedEvent, NormalizedUser, Properties, RawEventRecord, RawUserRecord, Record,
};
pub use spec::{MigrationSpec, MixpanelSpec, PacingSpec, PostHogSpec};

/// Identity stamped on every migrated record
pub const MIGRATOR_IDENTITY: &str = "stablecog/mp-to-ph";

/// Type alias for the sender side of a message channel between pipeline operators
pub type RecordTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a message channel between pipeline operators
pub type RecordRx = mpsc::Receiver<Message>;

/// Messages passed between pipeline operators
#[derive(Debug, Clone)]
pub enum Message {
    /// A decoded but untransformed export unit
    RawEvent(RawEventRecord),

    /// A people CSV row before column mapping
    RawUser(RawUserRecord),

    /// A normalized record ready for the sink
    Record(Record),

    /// End-of-stream marker
    ///
    /// Signals that no more data will be sent through this channel,
    /// allowing downstream operators to finalize their processing.
    Eos,
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the unique name/identifier of this operator
    ///
    /// Used for logging and pipeline wiring.
    fn name(&self) -> &str;
}

/// Trait for data source operators
///
/// Sources are the entry points of the pipeline, responsible for pulling data
/// from Mixpanel (API or files) and converting it into messages.
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages to downstream operators
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: RecordTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for data transformation operators
///
/// Transforms remap raw Mixpanel records into the PostHog schema.
#[async_trait]
pub trait Transform: Operator {
    /// Run the transform operator
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `tx` - Channel sender for publishing transformed messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: RecordRx, tx: RecordTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for data sink operators
///
/// Sinks are the exit points of the pipeline, responsible for delivering
/// normalized records to the destination.
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: RecordRx, cancel: CancellationToken) -> Result<()>;
}

/// A timestamped named event, as accepted by the destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureMessage {
    pub distinct_id: String,
    pub event: String,
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

/// A profile update for one identity, as accepted by the destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifyMessage {
    pub distinct_id: String,
    /// Profile properties to set on the person
    pub set: Properties,
    /// Message-level properties (library tags, enrichment flags)
    pub properties: Properties,
    pub timestamp: DateTime<Utc>,
}

/// Destination ingestion client.
///
/// Implementations may buffer and batch internally; a successful return only
/// means the message was accepted for delivery. [`IngestionClient::close`]
/// flushes anything still buffered.
#[async_trait]
pub trait IngestionClient: Send {
    async fn capture(&mut self, message: CaptureMessage) -> Result<(), SinkError>;

    async fn identify(&mut self, message: IdentifyMessage) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

#[async_trait]
impl<C: IngestionClient + ?Sized> IngestionClient for Box<C> {
    async fn capture(&mut self, message: CaptureMessage) -> Result<(), SinkError> {
        (**self).capture(message).await
    }

    async fn identify(&mut self, message: IdentifyMessage) -> Result<(), SinkError> {
        (**self).identify(message).await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        (**self).close().await
    }
}
