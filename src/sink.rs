//! Batch sink and bulk index writer
//!
//! Matched records accumulate in one shared buffer. A submit that brings the
//! buffer to the configured size, or that arrives after the wait interval has
//! passed since the last flush, drains the whole buffer as a single bulk
//! write. The optional throttle makes the flushing submit sleep afterwards so
//! a slow index endpoint sees a quiet window between bursts.
//!
//! Buffer, flush check and drain share one critical section: the buffer can
//! never exceed `queue_size` and concurrent flushes cannot interleave. A
//! failed bulk write drops its batch with a warning; delivery is best
//! effort, not durable.

use crate::alert::ActivityTracker;
use crate::config::Config;
use crate::record::ParsedRecord;
use crate::Result;
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Downstream store boundary for one batch write
#[async_trait]
pub trait SinkWriter: Send + Sync {
    /// Write every record to the named index in one operation
    async fn write_batch(&self, index: &str, records: &[ParsedRecord]) -> anyhow::Result<()>;
}

// ============================================================================
// Bulk Indexer
// ============================================================================

/// Bulk HTTP writer for the search index endpoint
pub struct BulkIndexer {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl BulkIndexer {
    /// Build the writer from configuration; fails only on client setup
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint: format!("{}/_bulk", config.sink.url.trim_end_matches('/')),
            username: config.sink.username.clone(),
            password: config.sink.password.clone(),
        })
    }
}

#[async_trait]
impl SinkWriter for BulkIndexer {
    async fn write_batch(&self, index: &str, records: &[ParsedRecord]) -> anyhow::Result<()> {
        let mut body = String::new();
        for record in records {
            let action = serde_json::json!({"index": {"_index": index}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?.error_for_status()?;
        let status = response.status();
        let summary: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
        if summary
            .get("errors")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            warn!(index = %index, "bulk response reported per-item errors");
        }
        debug!(index = %index, records = records.len(), %status, "bulk write accepted");
        Ok(())
    }
}

// ============================================================================
// Batch Sink
// ============================================================================

struct BufferState {
    records: Vec<ParsedRecord>,
    last_flush: Instant,
}

/// Shared record buffer with size/time-triggered bulk flushing
pub struct BatchSink {
    enabled: bool,
    queue_size: usize,
    wait_interval: Duration,
    throttle: Duration,
    index_prefix: String,
    date_mask: String,
    writer: Arc<dyn SinkWriter>,
    activity: Arc<ActivityTracker>,
    state: Mutex<BufferState>,
}

impl BatchSink {
    pub fn new(config: &Config, writer: Arc<dyn SinkWriter>, activity: Arc<ActivityTracker>) -> Self {
        Self {
            enabled: config.sink.enabled,
            queue_size: config.sink.queue_size.max(1),
            wait_interval: Duration::from_secs(config.wait_interval_secs),
            throttle: Duration::from_secs(config.sink.throttle_secs),
            index_prefix: config.sink.index_prefix.clone(),
            date_mask: config.sink.date_mask.clone(),
            writer,
            activity,
            state: Mutex::new(BufferState {
                records: Vec::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Buffer one record, flushing when a trigger condition is met
    ///
    /// A disabled sink discards the record. When the flush throttle is
    /// configured, the submit that triggered the flush sleeps before
    /// returning, with the buffer lock held.
    pub async fn submit(&self, record: ParsedRecord) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().await;
        state.records.push(record);
        self.activity.mark_output();

        let due = state.records.len() >= self.queue_size
            || state.last_flush.elapsed() >= self.wait_interval;
        if due {
            self.flush_locked(&mut state).await;
            if !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
        }
    }

    /// Drain the buffer now, regardless of the triggers
    pub async fn flush(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await;
    }

    /// Records currently buffered
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.records.len()
    }

    async fn flush_locked(&self, state: &mut BufferState) {
        if state.records.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.records);
        let index = format!("{}{}", self.index_prefix, Local::now().format(&self.date_mask));
        match self.writer.write_batch(&index, &batch).await {
            Ok(()) => debug!(index = %index, records = batch.len(), "flushed batch"),
            Err(e) => {
                warn!(index = %index, dropped = batch.len(), error = %e, "bulk write failed; batch dropped")
            }
        }
        state.last_flush = Instant::now();
    }
}
