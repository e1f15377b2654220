//! # MPPH I/O - Sources and sinks for the Mixpanel → PostHog migration
//!
//! ## Features
//!
//! ### Data Sources
//! - **Mixpanel export API**: streamed raw event export for a date range
//! - **Export files**: previously downloaded exports (path or glob pattern)
//! - **People CSV**: Mixpanel user profile export
//!
//! ### Data Sinks
//! - **PostHog**: batched capture/identify through a rate-limited adapter
//! - **Stdout**: dry-run client printing what would be sent
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mpph_io::sink_adapter::RateLimitedSink;
//! use mpph_io::sink_stdout::StdoutClient;
//!
//! let sink = RateLimitedSink::new(StdoutClient::new(), Duration::from_millis(1));
//! ```

/// Incremental decoder for the concatenated-JSON export format
pub mod export_decoder;

/// Minimum spacing between destination sends
pub mod pacing;

/// Record → ingestion message adapter with pacing
pub mod sink_adapter;

/// PostHog batch client and pipeline sink
pub mod sink_posthog;

/// Dry-run client
pub mod sink_stdout;

/// People CSV source
pub mod source_csv;

/// Mixpanel export API and export file sources
pub mod source_export;

/// PostHog batch payload shape
pub mod wire;

pub use export_decoder::{decode_export, transform_export, ExportDecoder, PartialExport};
pub use sink_adapter::RateLimitedSink;
