use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::info;

use crate::batch::{BatchCoordinator, BatchReport, CompletedArtifact};
use crate::config::Settings;
use crate::dataset::{Dataset, write_tsv};
use crate::domain::{ArtifactKind, ArtifactSelection, BatchItem};
use crate::error::FetchError;
use crate::ftp::{Connector, FtpConnector};
use crate::layout::DownloadLayout;
use crate::process::{ExternalCommand, OutputLine, ProcessOutcome, Stream};
use crate::progress::{CancelFlag, ProgressEvent, ProgressSink};
use crate::table::{Column, ColumnFilter, WindowedTable};
use crate::transfer::{TransferEngine, TransferOutcome, TransferRequest};

const MAX_COLUMN_WIDTH: u16 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub remote: String,
    pub status: FileStatus,
    pub bytes: u64,
    pub path: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedArtifact {
    pub id: String,
    pub name: String,
    pub kind: ArtifactKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub root: Utf8PathBuf,
    pub total: usize,
    pub cancelled: bool,
    pub completed: Vec<CompletedArtifact>,
    pub failed: Vec<FailedArtifact>,
    pub manifests: Vec<Utf8PathBuf>,
}

impl From<(Utf8PathBuf, BatchReport)> for BatchResult {
    fn from((root, report): (Utf8PathBuf, BatchReport)) -> Self {
        Self {
            root,
            total: report.total,
            cancelled: report.cancelled,
            completed: report.completed,
            failed: report
                .failures
                .into_iter()
                .map(|failure| FailedArtifact {
                    id: failure.item.id.to_string(),
                    name: failure.item.name,
                    kind: failure.kind,
                    error: failure.error.to_string(),
                })
                .collect(),
            manifests: report.manifests,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModifiedResult {
    pub remote: String,
    pub modified: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub path: Utf8PathBuf,
    pub columns: Vec<String>,
    pub total_rows: usize,
    pub matching_rows: usize,
    pub start: usize,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub path: Utf8PathBuf,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub program: String,
    pub outcome: ProcessOutcome,
    pub stdout_lines: usize,
    pub stderr_lines: usize,
}

/// Column sort and filter requests expressed by column name.
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    pub capacity: usize,
    pub sort: Vec<String>,
    pub filter: Option<(String, String)>,
}

/// A loaded table and the view over it.
#[derive(Debug)]
pub struct TableSession {
    pub path: Utf8PathBuf,
    pub columns: Vec<String>,
    pub view: WindowedTable,
}

impl TableSession {
    pub fn snapshot(&self) -> TableResult {
        TableResult {
            path: self.path.clone(),
            columns: self.columns.clone(),
            total_rows: self.view.total_rows(),
            matching_rows: self.view.len(),
            start: self.view.start(),
            rows: self
                .view
                .render()
                .iter()
                .map(|row| {
                    (0..self.columns.len())
                        .map(|column| row.row.cell(column).as_text().to_string())
                        .collect()
                })
                .collect(),
        }
    }

    /// Writes the filtered, sorted view (all matching rows, not just the window).
    pub fn export(&self, path: &Utf8Path) -> Result<ExportResult, FetchError> {
        let rows = write_tsv(path.as_std_path(), &self.columns, self.view.ordered_rows())?;
        info!(path = %path, rows, "table view exported");
        Ok(ExportResult {
            path: path.to_path_buf(),
            rows,
        })
    }

    pub fn column_index(&self, name: &str) -> Result<usize, FetchError> {
        self.columns
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| FetchError::MissingColumn(name.to_string()))
    }
}

pub struct App<C: Connector> {
    engine: TransferEngine<C>,
    layout: DownloadLayout,
    artifacts: ArtifactSelection,
}

impl App<FtpConnector> {
    pub fn from_settings(settings: &Settings) -> Self {
        let connector = FtpConnector::new(
            settings.host.clone(),
            settings.port,
            settings.connect_timeout,
        );
        let engine = TransferEngine::new(connector)
            .with_chunk_size(settings.chunk_size)
            .with_progress_interval(settings.progress_interval);
        Self::new(engine, settings.layout()).with_artifacts(settings.artifacts)
    }
}

impl<C: Connector> App<C> {
    pub fn new(engine: TransferEngine<C>, layout: DownloadLayout) -> Self {
        Self {
            engine,
            layout,
            artifacts: ArtifactSelection::all(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactSelection) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn layout(&self) -> &DownloadLayout {
        &self.layout
    }

    /// Default selection when a batch request names no kinds.
    pub fn artifacts(&self) -> ArtifactSelection {
        self.artifacts
    }

    /// Downloads one remote file into `dir` (the download root when `None`).
    /// A cancelled or failed download writes nothing there, and a file already
    /// at the destination is kept.
    pub fn fetch_file(
        &self,
        remote: &str,
        dir: Option<&Utf8Path>,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<FileResult, FetchError> {
        let file_name = remote
            .rsplit('/')
            .find(|part| !part.is_empty())
            .ok_or_else(|| FetchError::Filesystem(format!("no file name in {remote}")))?;
        let destination = dir.unwrap_or(self.layout.root()).join(file_name);
        sink.event(ProgressEvent::Message(format!("fetching {remote}")));

        let request = TransferRequest::new(remote, destination.as_std_path());
        match self.engine.run(&request, cancel, sink) {
            TransferOutcome::Completed(bytes) => Ok(FileResult {
                remote: remote.to_string(),
                status: FileStatus::Completed,
                bytes,
                path: Some(destination),
            }),
            TransferOutcome::Cancelled => {
                sink.event(ProgressEvent::Message(format!("{remote} cancelled")));
                Ok(FileResult {
                    remote: remote.to_string(),
                    status: FileStatus::Cancelled,
                    bytes: 0,
                    path: None,
                })
            }
            TransferOutcome::Failed(err) => Err(err),
        }
    }

    /// Downloads the selected artifacts of every item into the layout (or
    /// `root` when given), strictly in order.
    pub fn fetch_genomes(
        &self,
        items: &[BatchItem],
        selection: ArtifactSelection,
        root: Option<&Utf8Path>,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<BatchResult, FetchError> {
        let layout = match root {
            Some(root) => DownloadLayout::new(root.to_path_buf()),
            None => self.layout.clone(),
        };
        let selection = if selection.is_empty() {
            self.artifacts
        } else {
            selection
        };
        let coordinator = BatchCoordinator::new(&self.engine, layout)
            .with_progress_interval(self.engine.progress_interval());
        let report = coordinator.run(items, selection, cancel, sink)?;
        Ok(BatchResult::from((coordinator.layout().root().to_path_buf(), report)))
    }

    pub fn last_modified(&self, remote: &str) -> Result<ModifiedResult, FetchError> {
        let modified = self.engine.last_modified(remote)?;
        Ok(ModifiedResult {
            remote: remote.to_string(),
            modified: modified.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
    }

    /// Runs an external tool, forwarding each output line to `sink` as it
    /// arrives.
    pub fn run_program(
        &self,
        command: &ExternalCommand,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<ProcessResult, FetchError> {
        let mut stdout_lines = 0usize;
        let mut stderr_lines = 0usize;
        let outcome = command.run(cancel, |OutputLine { stream, text }| {
            match stream {
                Stream::Stdout => stdout_lines += 1,
                Stream::Stderr => stderr_lines += 1,
            }
            sink.event(ProgressEvent::Message(text));
        })?;
        Ok(ProcessResult {
            program: command.program(),
            outcome,
            stdout_lines,
            stderr_lines,
        })
    }
}

pub fn load_batch_items(path: &Path) -> Result<Vec<BatchItem>, FetchError> {
    Dataset::load_tsv(path)?.batch_items()
}

/// Loads a TSV into a windowed view with every column sortable, then applies
/// the requested sort keys (in the order given) and filter.
pub fn open_table(path: &Utf8Path, options: &TableOptions) -> Result<TableSession, FetchError> {
    let dataset = Dataset::load_tsv(path.as_std_path())?;
    let columns: Vec<Column> = dataset
        .columns
        .iter()
        .enumerate()
        .map(|(index, label)| {
            let widest = dataset
                .rows
                .iter()
                .take(200)
                .map(|row| row.cell(index).as_text().chars().count())
                .chain(std::iter::once(label.chars().count()))
                .max()
                .unwrap_or(1);
            let width = u16::try_from(widest).unwrap_or(u16::MAX).min(MAX_COLUMN_WIDTH);
            Column::new(label.clone(), width, true)
        })
        .collect();

    let mut session = TableSession {
        path: path.to_path_buf(),
        columns: dataset.columns,
        view: WindowedTable::new(columns, options.capacity),
    };
    session.view.set_rows(dataset.rows);

    if let Some((column, needle)) = &options.filter {
        let index = session.column_index(column)?;
        session
            .view
            .set_filter(Some(ColumnFilter::new(index, needle)));
    }
    // the last toggled column becomes the primary key
    for name in options.sort.iter().rev() {
        let index = session.column_index(name)?;
        session.view.sort_by_column(index);
    }
    Ok(session)
}
