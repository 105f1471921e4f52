use std::io::{self, Write};

use serde::Serialize;
use tracing::{info, warn};

use crate::app::{BatchResult, ExportResult, FileResult, ModifiedResult, ProcessResult, TableResult};
use crate::batch::BatchEvent;
use crate::process::ProcessOutcome;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::transfer::TransferState;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_file(result: &FileResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_batch(result: &BatchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_modified(result: &ModifiedResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_table(result: &TableResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_export(result: &ExportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_process(result: &ProcessResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Non-interactive progress: events go to the log on stderr, stdout stays JSON.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message(message) => info!("{message}"),
            ProgressEvent::Transfer(progress) => match progress.state {
                TransferState::Failed => {
                    warn!(remote = %progress.remote, "{}", progress.describe())
                }
                _ => info!(
                    remote = %progress.remote,
                    state = ?progress.state,
                    "{}",
                    progress.describe()
                ),
            },
            ProgressEvent::Batch(event) => log_batch_event(&event),
        }
    }
}

fn log_batch_event(event: &BatchEvent) {
    match event {
        BatchEvent::ItemStarted {
            item,
            kind,
            position,
            total,
            ..
        } => info!(id = %item.id, name = %item.name, kind = %kind, "[{position}/{total}] started"),
        BatchEvent::Progress { completed, total } => info!("{completed}/{total} artifacts done"),
        BatchEvent::ItemCompleted { kind, bytes, path, .. } => {
            info!(kind = %kind, bytes, path = %path, "artifact saved")
        }
        BatchEvent::ItemFailed { kind, message, .. } => {
            warn!(kind = %kind, "artifact failed: {message}")
        }
        BatchEvent::BatchCancelled { completed, total } => {
            warn!("batch cancelled after {completed}/{total} artifacts")
        }
        BatchEvent::Finished {
            completed,
            failed,
            total,
        } => info!(completed, failed, total, "batch finished"),
    }
}

/// Summary line for a finished external process.
pub fn describe_process(outcome: &ProcessOutcome) -> String {
    match outcome {
        ProcessOutcome::Exited {
            code: Some(code), ..
        } => format!("process exited with code {code}"),
        ProcessOutcome::Exited { code: None, .. } => "process terminated by signal".to_string(),
        ProcessOutcome::Cancelled => "process cancelled".to_string(),
    }
}
