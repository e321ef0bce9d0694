//! Liveness watchdogs
//!
//! Two independent watchdogs observe the pipeline: the input side goes quiet
//! when no new files are enqueued, the output side when no records reach the
//! sink buffer. Each ticks once a second and raises an alert through the
//! [`Notifier`] once the observed side has been idle longer than its
//! threshold. Alerts are de-duplicated level-triggered style: while the
//! stall persists, the next alert waits a full threshold window measured
//! from the previous alert.

use crate::config::AlertConfig;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tokio::time::Instant;

/// Watchdog tick period
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Alert delivery boundary
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &str, subject: &str, body_html: &str) -> anyhow::Result<()>;
}

/// Which side of the pipeline a watchdog observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Files arriving in the watched folder
    Input,
    /// Records reaching the sink buffer
    Output,
}

impl Side {
    fn label(self) -> &'static str {
        match self {
            Side::Input => "input",
            Side::Output => "output",
        }
    }
}

// ============================================================================
// Activity Tracker
// ============================================================================

/// Last-action instants for both pipeline sides
///
/// Producers overwrite their side's instant on every action; the watchdogs
/// only ever read. Last-writer-wins is sufficient, so the instants are plain
/// atomics (milliseconds since the tracker's base instant).
pub struct ActivityTracker {
    base: Instant,
    input_ms: AtomicU64,
    output_ms: AtomicU64,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// New tracker with both sides marked active now
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            input_ms: AtomicU64::new(0),
            output_ms: AtomicU64::new(0),
        }
    }

    /// Record input-side activity (a file was enqueued)
    pub fn mark_input(&self) {
        self.input_ms
            .store(self.base.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Record output-side activity (a record reached the sink buffer)
    pub fn mark_output(&self) {
        self.output_ms
            .store(self.base.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last activity on one side
    pub fn idle(&self, side: Side) -> Duration {
        let cell = match side {
            Side::Input => &self.input_ms,
            Side::Output => &self.output_ms,
        };
        let marked = Duration::from_millis(cell.load(Ordering::Relaxed));
        self.base.elapsed().saturating_sub(marked)
    }
}

// ============================================================================
// Alert Report
// ============================================================================

/// Contents of one stall alert
#[derive(Debug, Clone)]
pub struct AlertReport {
    pub subject: String,
    pub last_action: DateTime<Local>,
    pub last_alert: DateTime<Local>,
    pub threshold_secs: u64,
}

impl AlertReport {
    /// Render the report as a small HTML document
    pub fn render_html(&self) -> String {
        format!(
            "<!DOCTYPE html><html><body>\
             <h1>{}</h1>\
             <table>\
             <tr><td>Last action time</td><td>{}</td></tr>\
             <tr><td>Last alert time</td><td>{}</td></tr>\
             <tr><td>Threshold</td><td>{} seconds</td></tr>\
             </table>\
             </body></html>",
            self.subject,
            self.last_action.format("%Y-%m-%d %H:%M:%S"),
            self.last_alert.format("%Y-%m-%d %H:%M:%S"),
            self.threshold_secs,
        )
    }
}

// ============================================================================
// Watchdog
// ============================================================================

/// One side's liveness watchdog
pub struct Watchdog {
    side: Side,
    threshold: Duration,
    recipient: String,
    subject: String,
    activity: Arc<ActivityTracker>,
    notifier: Arc<dyn Notifier>,
}

impl Watchdog {
    /// Build a watchdog for one side; `None` when the threshold disables it
    pub fn new(
        side: Side,
        config: &AlertConfig,
        system_name: &str,
        activity: Arc<ActivityTracker>,
        notifier: Arc<dyn Notifier>,
    ) -> Option<Self> {
        if config.threshold_secs <= 0 {
            return None;
        }
        let subject = match side {
            Side::Input => format!("[{system_name}] no new input files"),
            Side::Output => format!("[{system_name}] no records delivered to the index"),
        };
        Some(Self {
            side,
            threshold: Duration::from_secs(config.threshold_secs as u64),
            recipient: config.recipient.clone(),
            subject,
            activity,
            notifier,
        })
    }

    /// Tick loop; runs until the task is dropped
    pub async fn run(self) {
        info!(
            side = self.side.label(),
            threshold_secs = self.threshold.as_secs(),
            "liveness watchdog started"
        );
        let mut tick = tokio::time::interval(WATCHDOG_TICK);
        let mut last_alert = Instant::now();
        loop {
            tick.tick().await;
            let idle = self.activity.idle(self.side);
            if !should_fire(idle, last_alert.elapsed(), self.threshold) {
                continue;
            }
            warn!(
                side = self.side.label(),
                idle_secs = idle.as_secs(),
                "activity stalled; raising alert"
            );
            let now = Local::now();
            let report = AlertReport {
                subject: self.subject.clone(),
                last_action: now - chrono::Duration::seconds(idle.as_secs() as i64),
                last_alert: now - chrono::Duration::seconds(last_alert.elapsed().as_secs() as i64),
                threshold_secs: self.threshold.as_secs(),
            };
            if let Err(e) = self
                .notifier
                .notify(&self.recipient, &self.subject, &report.render_html())
                .await
            {
                warn!(side = self.side.label(), error = %e, "could not deliver alert");
            }
            last_alert = Instant::now();
        }
    }
}

/// Both idle spans must strictly exceed the threshold for an alert to fire
fn should_fire(idle: Duration, since_last_alert: Duration, threshold: Duration) -> bool {
    idle > threshold && since_last_alert > threshold
}
