use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::ftp::{Connector, RemoteSession};
use crate::progress::{
    CancelFlag, DEFAULT_PROGRESS_INTERVAL, ProgressEvent, ProgressSink, ProgressThrottle,
    describe_bytes,
};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    remote: String,
    destination: PathBuf,
}

impl TransferRequest {
    pub fn new(remote: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            destination: destination.into(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Idle,
    Connecting,
    Transferring,
    Cancelling,
    Completed,
    Failed,
}

/// Published snapshot of a [`TransferSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub remote: String,
    pub state: TransferState,
    pub bytes: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    pub fn describe(&self) -> String {
        describe_bytes(self.bytes, self.total.unwrap_or(self.bytes))
    }
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed(u64),
    Cancelled,
    Failed(FetchError),
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferOutcome::Completed(_))
    }
}

/// Mutable state of one in-flight transfer; lives on the worker's stack only.
#[derive(Debug)]
pub struct TransferSession {
    remote: String,
    state: TransferState,
    bytes_transferred: u64,
    expected_size: Option<u64>,
    throttle: ProgressThrottle,
    last_published: Option<u64>,
}

impl TransferSession {
    fn new(request: &TransferRequest, interval: Duration) -> Self {
        Self {
            remote: request.remote.clone(),
            state: TransferState::Idle,
            bytes_transferred: 0,
            expected_size: None,
            throttle: ProgressThrottle::new(interval),
            last_published: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    pub fn snapshot(&self) -> TransferProgress {
        TransferProgress {
            remote: self.remote.clone(),
            state: self.state,
            bytes: self.bytes_transferred,
            total: self.expected_size,
        }
    }

    fn transition(&mut self, state: TransferState) {
        debug!(remote = %self.remote, from = ?self.state, to = ?state, "transfer state");
        self.state = state;
    }

    fn publish(&mut self, sink: &dyn ProgressSink, now: Instant) {
        self.throttle.force(now);
        self.last_published = Some(self.bytes_transferred);
        sink.event(ProgressEvent::Transfer(self.snapshot()));
    }

    fn publish_throttled(&mut self, sink: &dyn ProgressSink, now: Instant) {
        if self.throttle.ready(now) {
            self.last_published = Some(self.bytes_transferred);
            sink.event(ProgressEvent::Transfer(self.snapshot()));
        }
    }

    /// Terminal update; skipped when an event for this byte count already went out.
    fn publish_final(&mut self, sink: &dyn ProgressSink) {
        if self.last_published != Some(self.bytes_transferred) {
            self.publish(sink, Instant::now());
        }
    }
}

/// Quits the control connection on every exit path.
struct ConnectionGuard<S: RemoteSession> {
    session: S,
}

impl<S: RemoteSession> Drop for ConnectionGuard<S> {
    fn drop(&mut self) {
        if let Err(err) = self.session.quit() {
            warn!(error = %err, "failed to close ftp session");
        }
    }
}

enum Finish {
    Completed,
    Cancelled,
}

pub struct TransferEngine<C: Connector> {
    connector: C,
    chunk_size: usize,
    progress_interval: Duration,
}

impl<C: Connector> TransferEngine<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    /// Streams `request.remote()` into `request.destination()`.
    ///
    /// The destination is replaced only by a complete transfer. On `Cancelled`
    /// or `Failed` the partial bytes are dropped with their temp file and an
    /// existing destination is left as it was.
    pub fn run(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> TransferOutcome {
        let mut session = TransferSession::new(request, self.progress_interval);
        info!(
            remote = request.remote(),
            destination = %request.destination().display(),
            "transfer start"
        );
        match self.drive(&mut session, request, cancel, sink) {
            Ok(Finish::Completed) => {
                info!(
                    remote = request.remote(),
                    bytes = session.bytes_transferred,
                    "transfer complete"
                );
                TransferOutcome::Completed(session.bytes_transferred)
            }
            Ok(Finish::Cancelled) => {
                info!(
                    remote = request.remote(),
                    bytes = session.bytes_transferred,
                    "transfer cancelled"
                );
                TransferOutcome::Cancelled
            }
            Err(err) => {
                session.transition(TransferState::Failed);
                session.publish_final(sink);
                warn!(remote = request.remote(), error = %err, "transfer failed");
                TransferOutcome::Failed(err)
            }
        }
    }

    fn drive(
        &self,
        session: &mut TransferSession,
        request: &TransferRequest,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<Finish, FetchError> {
        session.transition(TransferState::Connecting);
        let mut guard = ConnectionGuard {
            session: self.connector.connect()?,
        };

        let total = guard.session.size(request.remote())?;
        session.expected_size = Some(total);

        if cancel.is_cancelled() {
            session.transition(TransferState::Cancelling);
            session.publish_final(sink);
            return Ok(Finish::Cancelled);
        }

        let destination = request.destination();
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|err| FetchError::io(parent, err))?;
        // bytes land in a sibling temp file; the destination only changes on completion
        let mut file = tempfile::Builder::new()
            .prefix(".bvbrc-fetch")
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|err| FetchError::io(parent, err))?;

        let mut data = guard.session.retrieve(request.remote())?;
        session.transition(TransferState::Transferring);

        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = match data.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FetchError::connection(self.connector.host(), err)),
            };
            file.write_all(&buffer[..read])
                .map_err(|err| FetchError::io(destination, err))?;
            session.bytes_transferred += read as u64;

            if cancel.is_cancelled() {
                session.transition(TransferState::Cancelling);
                session.publish_final(sink);
                return Ok(Finish::Cancelled);
            }

            let now = Instant::now();
            if session.bytes_transferred == total {
                session.transition(TransferState::Completed);
                session.publish(sink, now);
            } else {
                session.publish_throttled(sink, now);
            }
        }

        if session.bytes_transferred != total {
            return Err(FetchError::SizeMismatch {
                path: request.remote().to_string(),
                expected: total,
                actual: session.bytes_transferred,
            });
        }
        file.flush().map_err(|err| FetchError::io(destination, err))?;
        file.persist(destination).map_err(|err| FetchError::io(destination, err.error))?;
        session.transition(TransferState::Completed);
        session.publish_final(sink);
        Ok(Finish::Completed)
    }

    /// One-off `MDTM` lookup for display.
    pub fn last_modified(&self, remote: &str) -> Result<NaiveDateTime, FetchError> {
        let mut guard = ConnectionGuard {
            session: self.connector.connect()?,
        };
        guard.session.modified(remote)
    }

    pub fn remote_size(&self, remote: &str) -> Result<u64, FetchError> {
        let mut guard = ConnectionGuard {
            session: self.connector.connect()?,
        };
        guard.session.size(remote)
    }
}
