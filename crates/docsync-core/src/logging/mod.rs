//! Structured logging with optional JSONL capture.
//!
//! Every component logs through `tracing` with a `replica` field. This module
//! adds a [`JsonlLayer`] that turns those events into [`JsonLogEntry`]
//! records and hands them to a [`LogSink`]: an append-only file per instance
//! ([`InstanceLogWriter`]) or an in-memory buffer ([`MemorySink`]).
//!
//! ## Layout
//!
//! ```text
//! logs/
//! ├── 2026-01-21_replica-1.jsonl
//! └── 2026-01-21_replica-2.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use docsync_core::logging::LoggingBuilder;
//!
//! let log_path = LoggingBuilder::new("demo")
//!     .with_logs_dir("./logs")
//!     .with_filter("docsync_core=debug")
//!     .init()?;
//! ```
//!
//! ### Querying logs with jq
//!
//! ```bash
//! # Unknown message kinds and other protocol errors
//! jq 'select(.level == "error")' logs/*.jsonl
//!
//! # Everything one replica did
//! jq 'select(.fields.replica == "1")' logs/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{InstanceLogWriter, LogSink, MemorySink};
