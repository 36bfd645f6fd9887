//! # switchlog-core
//!
//! Routes telephony switch events into one log file per tenant domain.
//!
//! This crate provides:
//!
//! - [`Event`] and [`AttributeSource`] - the event model
//! - [`DomainClassifier`] - maps an event to a [`PartitionKey`]
//! - [`PartitionedLogSink`] - rotating, handle-bounded per-partition files
//! - [`MetricsRegistry`] - shared counters and [`MetricsSnapshot`]
//! - [`RecencyWindow`] - bounded deduplication window
//! - [`ReconnectPolicy`] - fixed delay with a periodic cooldown
//! - [`EventSource`] - the upstream abstraction
//! - [`IngestionLoop`] - connect, receive, classify, write, shut down
//!
//! ## Example
//!
//! ```rust
//! use switchlog_core::{DomainClassifier, Event};
//!
//! let classifier = DomainClassifier::new();
//! let event = Event::named("CHANNEL_CREATE")
//!     .with_header("variable_domain_name", "PBX.Example.com");
//!
//! let key = classifier.classify(&event, "");
//! assert_eq!(key.as_str(), "pbx.example.com");
//!
//! let key = classifier.classify(&Event::named("LOG"), "call from 1000@shop.example.com");
//! assert_eq!(key.as_str(), "shop.example.com");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod classifier;
pub mod dedup;
pub mod error;
pub mod event;
pub mod ingest;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod state;

// Re-export main types
pub use backoff::{Backoff, ReconnectPolicy};
pub use classifier::{DomainClassifier, PartitionKey, UNKNOWN_PARTITION};
pub use dedup::RecencyWindow;
pub use error::{Result, SinkError, SourceError};
pub use event::{AttributeSource, Event};
pub use ingest::{
    ConnectionStats, HealthState, IngestConfig, IngestionLoop, RunSummary, ShutdownHandle,
};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use sink::{PartitionedLogSink, SinkConfig, WriteMode};
pub use source::{Endpoint, EventSource, SourceFuture, SourceResult};
pub use state::{AtomicConnectionState, ConnectionState};
