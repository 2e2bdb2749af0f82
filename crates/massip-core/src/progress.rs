use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

/// How long a terminal event may wait for room in a full channel.
const TERMINAL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Invoking,
    Skipping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Invocation {
        batch: Arc<str>,
        kind: InvocationKind,
        plugin_name: String,
        entity: String,
        row_index: usize,
        total_rows: Option<usize>,
    },
    InvocationFailed {
        batch: Arc<str>,
        plugin_name: String,
        entity: String,
        row_index: usize,
        message: String,
    },
    RowFailed {
        batch: Arc<str>,
        row_index: usize,
        message: String,
    },
    BatchComplete {
        batch: Arc<str>,
        rows_written: usize,
        cancelled: bool,
    },
    BatchFailed {
        batch: Arc<str>,
        error: String,
    },
}

impl ProgressEvent {
    pub fn batch(&self) -> &str {
        match self {
            Self::Invocation { batch, .. }
            | Self::InvocationFailed { batch, .. }
            | Self::RowFailed { batch, .. }
            | Self::BatchComplete { batch, .. }
            | Self::BatchFailed { batch, .. } => batch,
        }
    }

    /// Terminal events close a batch; exactly one is sent per batch.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::BatchComplete { .. } | Self::BatchFailed { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invocation {
                kind,
                plugin_name,
                entity,
                row_index,
                total_rows,
                ..
            } => {
                let verb = match kind {
                    InvocationKind::Invoking => "Processing",
                    InvocationKind::Skipping => "Skipping",
                };
                write!(f, "{verb} {plugin_name} on {entity} (Line {row_index}")?;
                match total_rows {
                    Some(total) => write!(f, " of {total})"),
                    None => f.write_str(")"),
                }
            }
            Self::InvocationFailed {
                plugin_name,
                entity,
                row_index,
                message,
                ..
            } => write!(f, "{plugin_name} failed on {entity} (Line {row_index}): {message}"),
            Self::RowFailed {
                row_index, message, ..
            } => write!(f, "Line {row_index} could not be read: {message}"),
            Self::BatchComplete {
                rows_written,
                cancelled: false,
                ..
            } => write!(f, "Finished, {rows_written} rows written"),
            Self::BatchComplete { rows_written, .. } => {
                write!(f, "Cancelled after {rows_written} rows")
            }
            Self::BatchFailed { error, .. } => write!(f, "Failed: {error}"),
        }
    }
}

/// Producer half of the progress stream. Cloned into every batch; a disabled
/// sender discards everything.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Never blocks. Events that do not fit are counted and dropped.
    pub fn emit(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    batch = event.batch(),
                    dropped = total,
                    "progress channel full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Terminal events wait for room, up to a bound.
    pub async fn finish(&self, event: ProgressEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(error) = tx.send_timeout(event, TERMINAL_SEND_TIMEOUT).await {
            if let mpsc::error::SendTimeoutError::Timeout(event) = error {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(batch = event.batch(), "terminal progress event dropped");
            }
        }
    }

    /// A handle that shares the drop counter but holds no channel, so the
    /// receiver still closes once every real sender is gone.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            tx: None,
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ProgressSender {
    fn default() -> Self {
        Self::disabled()
    }
}
