use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{ArtifactKind, ArtifactSelection, BatchItem};
use crate::error::FetchError;
use crate::ftp::Connector;
use crate::layout::{DownloadLayout, prune_empty_dir};
use crate::progress::{
    CancelFlag, DEFAULT_PROGRESS_INTERVAL, ProgressEvent, ProgressSink, ProgressThrottle,
};
use crate::transfer::{TransferEngine, TransferOutcome, TransferRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    ItemStarted {
        index: usize,
        item: BatchItem,
        kind: ArtifactKind,
        position: usize,
        total: usize,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    ItemCompleted {
        index: usize,
        kind: ArtifactKind,
        bytes: u64,
        path: Utf8PathBuf,
    },
    ItemFailed {
        index: usize,
        kind: ArtifactKind,
        message: String,
    },
    BatchCancelled {
        completed: usize,
        total: usize,
    },
    Finished {
        completed: usize,
        failed: usize,
        total: usize,
    },
}

/// One artifact that could not be fetched; siblings carry on regardless.
#[derive(Debug)]
pub struct BatchItemFailure {
    pub item: BatchItem,
    pub kind: ArtifactKind,
    pub error: FetchError,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedArtifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub bytes: u64,
    pub path: Utf8PathBuf,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub completed: Vec<CompletedArtifact>,
    pub failures: Vec<BatchItemFailure>,
    pub manifests: Vec<Utf8PathBuf>,
    pub cancelled: bool,
}

/// Prunes the item directory when dropped if an unfinished transfer left it
/// empty. The artifact file itself is never touched here: the engine only
/// replaces it on completion.
struct ItemDirGuard {
    dir: Utf8PathBuf,
    armed: bool,
}

impl ItemDirGuard {
    fn new(dir: Utf8PathBuf) -> Self {
        Self { dir, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ItemDirGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = prune_empty_dir(&self.dir) {
                warn!(dir = %self.dir, error = %err, "failed to prune item directory");
            }
        }
    }
}

struct BatchProgress {
    completed: usize,
    total: usize,
    throttle: ProgressThrottle,
    last_published: Option<usize>,
}

impl BatchProgress {
    fn publish(&mut self, sink: &dyn ProgressSink, force: bool) {
        let now = Instant::now();
        if force {
            self.throttle.force(now);
        } else if !self.throttle.ready(now) {
            return;
        }
        self.last_published = Some(self.completed);
        sink.event(ProgressEvent::Batch(BatchEvent::Progress {
            completed: self.completed,
            total: self.total,
        }));
    }

    fn publish_final(&mut self, sink: &dyn ProgressSink) {
        if self.last_published != Some(self.completed) {
            self.publish(sink, true);
        }
    }
}

/// Runs batch items one at a time through a single [`TransferEngine`].
pub struct BatchCoordinator<'a, C: Connector> {
    engine: &'a TransferEngine<C>,
    layout: DownloadLayout,
    progress_interval: Duration,
}

impl<'a, C: Connector> BatchCoordinator<'a, C> {
    pub fn new(engine: &'a TransferEngine<C>, layout: DownloadLayout) -> Self {
        Self {
            engine,
            layout,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn layout(&self) -> &DownloadLayout {
        &self.layout
    }

    /// Downloads every selected artifact of every item, strictly in order.
    ///
    /// A failed artifact is reported, then the batch moves on. Cancellation
    /// ends the loop. Either way the unfinished bytes are discarded, a file
    /// from an earlier run stays in place, and an item directory left empty
    /// is removed. In both
    /// cases manifests are then written for the item directories that were
    /// actually populated. Only manifest failures surface as `Err`.
    pub fn run(
        &self,
        items: &[BatchItem],
        selection: ArtifactSelection,
        cancel: &CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<BatchReport, FetchError> {
        let total = items.len() * selection.len();
        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        let mut progress = BatchProgress {
            completed: 0,
            total,
            throttle: ProgressThrottle::new(self.progress_interval),
            last_published: None,
        };
        let mut populated: Vec<(ArtifactKind, &BatchItem)> = Vec::new();
        let mut position = 0usize;

        info!(items = items.len(), transfers = total, root = %self.layout.root(), "batch start");

        'items: for (index, item) in items.iter().enumerate() {
            for kind in selection.kinds() {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'items;
                }
                position += 1;
                sink.event(ProgressEvent::Batch(BatchEvent::ItemStarted {
                    index,
                    item: item.clone(),
                    kind,
                    position,
                    total,
                }));

                let path = self.layout.artifact_path(kind, item);
                let request = TransferRequest::new(kind.remote_path(&item.id), path.as_std_path());
                let guard = ItemDirGuard::new(self.layout.item_dir(kind, item));
                match self.engine.run(&request, cancel, sink) {
                    TransferOutcome::Completed(bytes) => {
                        guard.keep();
                        progress.completed += 1;
                        populated.push((kind, item));
                        sink.event(ProgressEvent::Batch(BatchEvent::ItemCompleted {
                            index,
                            kind,
                            bytes,
                            path: path.clone(),
                        }));
                        report.completed.push(CompletedArtifact {
                            id: item.id.to_string(),
                            kind,
                            bytes,
                            path,
                        });
                        progress.publish(sink, progress.completed == total);
                    }
                    TransferOutcome::Cancelled => {
                        drop(guard);
                        report.cancelled = true;
                        break 'items;
                    }
                    TransferOutcome::Failed(error) => {
                        drop(guard);
                        warn!(id = %item.id, kind = %kind, error = %error, "batch item failed");
                        sink.event(ProgressEvent::Batch(BatchEvent::ItemFailed {
                            index,
                            kind,
                            message: error.to_string(),
                        }));
                        report.failures.push(BatchItemFailure {
                            item: item.clone(),
                            kind,
                            error,
                        });
                    }
                }
            }
        }

        progress.publish_final(sink);

        let mut seen = BTreeSet::new();
        for (kind, item) in populated {
            let manifest = self.layout.manifest_path(kind, item);
            if seen.insert(manifest) {
                report.manifests.push(self.layout.write_manifest(kind, item)?);
            }
        }

        let completed = report.completed.len();
        if report.cancelled {
            info!(completed, total, "batch cancelled");
            sink.event(ProgressEvent::Batch(BatchEvent::BatchCancelled { completed, total }));
        } else {
            info!(completed, failed = report.failures.len(), total, "batch finished");
            sink.event(ProgressEvent::Batch(BatchEvent::Finished {
                completed,
                failed: report.failures.len(),
                total,
            }));
        }
        Ok(report)
    }
}
