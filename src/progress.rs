use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crate::batch::BatchEvent;
use crate::transfer::TransferProgress;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation request shared between the UI thread and one worker.
///
/// The UI only ever calls [`CancelFlag::cancel`]; the worker polls
/// [`CancelFlag::is_cancelled`] between chunks and between batch items.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Rate limiter for progress callbacks.
///
/// The window starts when the throttle is created, so the first regular
/// emission happens one interval into the operation. Terminal updates bypass
/// the throttle through [`ProgressThrottle::force`].
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Instant,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_emit: start,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_emit) >= self.interval {
            self.last_emit = now;
            true
        } else {
            false
        }
    }

    pub fn force(&mut self, now: Instant) {
        self.last_emit = now;
    }

    pub fn last_emit(&self) -> Instant {
        self.last_emit
    }
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Message(String),
    Transfer(TransferProgress),
    Batch(BatchEvent),
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards events to the UI thread, which drains the receiver on its own tick.
pub struct ChannelSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: ProgressEvent) {
        // receiver gone means the UI already shut down
        let _ = self.sender.send(event);
    }
}

/// Discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1_048_576.0
}

pub fn describe_bytes(received: u64, total: u64) -> String {
    format!(
        "Downloaded: {:6.2} MB / {:6.2} MB",
        megabytes(received),
        megabytes(total)
    )
}
