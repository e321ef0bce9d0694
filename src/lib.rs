//! Intake - Folder Watching Ingestion Pipeline
//!
//! Intake watches a directory for delimited text files, parses them row by
//! row, optionally scores each row against an enrichment service, and ships
//! the resulting records to a bulk index endpoint in batches. Finished files
//! move to a done directory along with side files describing malformed rows
//! and rows the enricher had nothing to say about.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Watcher   │     │ WorkerPool  │     │  Processor  │     │  BatchSink  │
//! │ (sweep +    │────▶│ (shared     │────▶│ (parse →    │────▶│ (buffer →   │
//! │  fs events) │     │  FIFO)      │     │  enrich)    │     │  bulk POST) │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                                           │
//!        └──────────────── ActivityTracker ◀─────────────────────────┘
//!                        (liveness watchdogs → mail)
//! ```
//!
//! # Core Concepts
//!
//! - **Settle delay**: A new file is queued only after sitting still for the
//!   configured wait interval
//! - **Capture value**: The column (or whole row) each extraction rule and
//!   enrichment request reads
//! - **Side files**: Parse errors and unmatched rows appended next to the
//!   processed files in the done directory

pub mod alert;
pub mod config;
pub mod enrich;
pub mod error;
pub mod mail;
pub mod parser;
pub mod pool;
pub mod processor;
pub mod record;
pub mod sink;
pub mod watcher;

pub use alert::{ActivityTracker, Side, Watchdog};
pub use config::{apply_env_overrides, Config};
pub use enrich::EnrichClient;
pub use error::{IntakeError, Result};
pub use parser::RecordParser;
pub use pool::{FileHandler, WorkerPool};
pub use processor::FileProcessor;
pub use record::{FieldMap, FieldValue, ParsedRecord};
pub use sink::{BatchSink, BulkIndexer, SinkWriter};
pub use watcher::Watcher;
