//! Output channels.
//!
//! The primary stream carries narration and tool activity and may become
//! unusable the moment a run is cancelled, so every write is gated on the
//! cancel token. Pause and failure notices go through a [`Notifier`] that
//! does not share that stream.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub trait OutputSink: Send + Sync {
    fn write(&self, chunk: &str) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, chunk: &str) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{chunk}")?;
        out.flush()
    }
}

/// Primary-stream writer that refuses to write once the run is cancelled.
#[derive(Clone)]
pub struct GatedOutput {
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    dropped: Arc<AtomicUsize>,
}

impl GatedOutput {
    pub fn new(sink: Arc<dyn OutputSink>, cancel: CancellationToken) -> Self {
        Self {
            sink,
            cancel,
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns whether the chunk was written.
    pub fn write(&self, chunk: &str) -> bool {
        if self.cancel.is_cancelled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("dropping output after cancellation");
            return false;
        }
        match self.sink.write(chunk) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "primary output write failed");
                false
            }
        }
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Paused,
    Cancelled,
    Resumed,
    TaskFailed,
    IssueLogged,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Side channel for user-facing notices. Never fails the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Writes notices to stderr and, if enabled, raises a desktop notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrNotifier {
    pub desktop: bool,
}

impl StderrNotifier {
    pub fn new(desktop: bool) -> Self {
        Self { desktop }
    }
}

impl Notifier for StderrNotifier {
    fn notify(&self, notice: &Notice) {
        let mut err = std::io::stderr().lock();
        if let Err(e) = writeln!(err, "[planwright] {}\n{}", notice.title, notice.body) {
            warn!(error = %e, "failed to write notice to stderr");
        }
        if self.desktop
            && let Err(e) = notify_rust::Notification::new()
                .summary(&notice.title)
                .body(&notice.body)
                .show()
        {
            warn!(error = %e, "desktop notification failed");
        }
    }
}

#[cfg(test)]
pub use recording::{RecordingNotifier, RecordingSink};
