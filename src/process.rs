use std::ffi::OsString;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::progress::CancelFlag;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// `code` is `None` when the child was ended by a signal.
    Exited { code: Option<i32>, success: bool },
    Cancelled,
}

impl ProcessOutcome {
    fn from_status(status: ExitStatus) -> Self {
        ProcessOutcome::Exited {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// An external tool invocation whose output is streamed line by line.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Runs the command to completion, handing each output line to `on_line`
    /// on the calling thread as soon as it arrives. Setting `cancel` kills the
    /// child; lines already read are still delivered.
    pub fn run<F>(
        &self,
        cancel: &CancelFlag,
        mut on_line: F,
    ) -> Result<ProcessOutcome, FetchError>
    where
        F: FnMut(OutputLine),
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|err| {
            FetchError::Process(format!("failed to start {}: {err}", self.program()))
        })?;
        info!(program = %self.program(), args = self.args.len(), "process started");

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut cancelled = false;
        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                if let Err(err) = child.kill() {
                    warn!(program = %self.program(), error = %err, "failed to kill process");
                }
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => on_line(line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for reader in readers {
            reader.join().ok();
        }
        let status = child.wait().map_err(|err| {
            FetchError::Process(format!("failed to wait for {}: {err}", self.program()))
        })?;

        let outcome = if cancelled {
            ProcessOutcome::Cancelled
        } else {
            ProcessOutcome::from_status(status)
        };
        debug!(program = %self.program(), outcome = ?outcome, "process finished");
        Ok(outcome)
    }
}

/// Forwards `source` line by line. Invalid UTF-8 is replaced rather than
/// ending the stream.
fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: Stream,
    tx: Sender<OutputLine>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(stream = ?stream, error = %err, "output stream read failed");
                    break;
                }
            }
            if buffer.last() == Some(&b'\n') {
                buffer.pop();
                if buffer.last() == Some(&b'\r') {
                    buffer.pop();
                }
            }
            let text = String::from_utf8_lossy(&buffer).into_owned();
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn streams_both_outputs() {
        let mut lines = Vec::new();
        let outcome = ExternalCommand::new("sh")
            .args(["-c", "echo one; echo two 1>&2; echo three"])
            .run(&CancelFlag::new(), |line| lines.push(line))
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Exited {
                code: Some(0),
                success: true
            }
        );
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|line| line.stream == Stream::Stdout)
            .map(|line| line.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(
            lines
                .iter()
                .any(|line| line.stream == Stream::Stderr && line.text == "two")
        );
    }

    #[test]
    fn invalid_utf8_line_does_not_end_the_stream() {
        let mut lines = Vec::new();
        let outcome = ExternalCommand::new("sh")
            .args(["-c", "printf 'one\\n\\377\\nafter\\r\\n'"])
            .run(&CancelFlag::new(), |line| lines.push(line.text))
            .unwrap();

        assert_matches!(outcome, ProcessOutcome::Exited { success: true, .. });
        assert_eq!(lines, vec!["one", "\u{FFFD}", "after"]);
    }

    #[test]
    fn reports_failure_exit_code() {
        let outcome = ExternalCommand::new("sh")
            .args(["-c", "exit 3"])
            .run(&CancelFlag::new(), |_| {})
            .unwrap();
        assert_matches!(
            outcome,
            ProcessOutcome::Exited {
                code: Some(3),
                success: false
            }
        );
    }

    #[test]
    fn cancel_kills_child() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let outcome = ExternalCommand::new("sh")
            .args(["-c", "echo ready; exec sleep 30"])
            .run(&cancel, |line| {
                if line.text == "ready" {
                    trigger.cancel();
                }
            })
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Cancelled);
    }

    #[test]
    fn missing_program_is_an_error() {
        let result =
            ExternalCommand::new("definitely-not-a-real-tool-42").run(&CancelFlag::new(), |_| {});
        assert_matches!(result, Err(FetchError::Process(_)));
    }
}
