mod common;

use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;

use bvbrc_fetch::batch::{BatchCoordinator, BatchEvent};
use bvbrc_fetch::domain::{ArtifactKind, ArtifactSelection, BatchItem};
use bvbrc_fetch::error::FetchError;
use bvbrc_fetch::layout::DownloadLayout;
use bvbrc_fetch::progress::{CancelFlag, ProgressEvent};
use bvbrc_fetch::transfer::TransferEngine;

use common::{MockConnector, RecordingSink, files_under, genome_payload};

fn items() -> Vec<BatchItem> {
    vec![
        BatchItem::new("562.7587".parse().unwrap(), "Escherichia coli K12"),
        BatchItem::new("1280.100".parse().unwrap(), "Staphylococcus aureus"),
        BatchItem::new("573.12".parse().unwrap(), "Klebsiella pneumoniae"),
    ]
}

fn connector_for(items: &[BatchItem], len: usize) -> MockConnector {
    let mut connector = MockConnector::new();
    for item in items {
        for kind in ArtifactKind::ALL {
            connector = connector.with_file(&kind.remote_path(&item.id), genome_payload(len));
        }
    }
    connector
}

fn layout(temp: &tempfile::TempDir) -> DownloadLayout {
    DownloadLayout::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap())
}

fn batch_events(events: Vec<ProgressEvent>) -> Vec<BatchEvent> {
    events
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::Batch(event) => Some(event),
            _ => None,
        })
        .collect()
}

#[test]
fn downloads_everything_and_writes_manifests() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let engine = TransferEngine::new(connector_for(&items, 3000));
    let coordinator = BatchCoordinator::new(&engine, layout(&temp));
    let sink = RecordingSink::default();

    let report = coordinator
        .run(&items, ArtifactSelection::all(), &CancelFlag::new(), &sink)
        .unwrap();

    assert_eq!(report.total, 6);
    assert_eq!(report.completed.len(), 6);
    assert!(report.failures.is_empty());
    assert!(!report.cancelled);
    assert_eq!(report.manifests.len(), 6);
    assert_eq!(
        files_under(temp.path()),
        vec![
            "contigs/Escherichia-coli-K12/562.7587.fna",
            "contigs/Escherichia-coli-K12_paths.tsv",
            "contigs/Klebsiella-pneumoniae/573.12.fna",
            "contigs/Klebsiella-pneumoniae_paths.tsv",
            "contigs/Staphylococcus-aureus/1280.100.fna",
            "contigs/Staphylococcus-aureus_paths.tsv",
            "features/Escherichia-coli-K12/562.7587.PATRIC.features.tab",
            "features/Escherichia-coli-K12_paths.tsv",
            "features/Klebsiella-pneumoniae/573.12.PATRIC.features.tab",
            "features/Klebsiella-pneumoniae_paths.tsv",
            "features/Staphylococcus-aureus/1280.100.PATRIC.features.tab",
            "features/Staphylococcus-aureus_paths.tsv",
        ]
    );

    let manifest =
        fs::read_to_string(temp.path().join("features/Escherichia-coli-K12_paths.tsv")).unwrap();
    let (id, path) = manifest.trim_end().split_once('\t').unwrap();
    assert_eq!(id, "562.7587");
    assert!(path.ends_with("562.7587.PATRIC.features.tab"));

    let events = batch_events(sink.take());
    let started: Vec<(usize, ArtifactKind)> = events
        .iter()
        .filter_map(|event| match event {
            BatchEvent::ItemStarted { index, kind, .. } => Some((*index, *kind)),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            (0, ArtifactKind::Contigs),
            (0, ArtifactKind::Features),
            (1, ArtifactKind::Contigs),
            (1, ArtifactKind::Features),
            (2, ArtifactKind::Contigs),
            (2, ArtifactKind::Features),
        ]
    );
    assert_eq!(
        events.last(),
        Some(&BatchEvent::Finished {
            completed: 6,
            failed: 0,
            total: 6
        })
    );
    assert!(events.contains(&BatchEvent::Progress {
        completed: 6,
        total: 6
    }));
}

#[test]
fn cancel_after_first_item() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let connector = connector_for(&items, 2048);
    let engine = TransferEngine::new(connector.clone());
    let coordinator = BatchCoordinator::new(&engine, layout(&temp));
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let sink = RecordingSink::with_hook(move |event| {
        if let ProgressEvent::Batch(BatchEvent::ItemCompleted {
            index: 0,
            kind: ArtifactKind::Features,
            ..
        }) = event
        {
            trigger.cancel();
        }
    });

    let report = coordinator
        .run(&items, ArtifactSelection::all(), &cancel, &sink)
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.completed.len(), 2);
    assert!(report.completed.iter().all(|artifact| artifact.id == "562.7587"));
    assert_eq!(
        files_under(temp.path()),
        vec![
            "contigs/Escherichia-coli-K12/562.7587.fna",
            "contigs/Escherichia-coli-K12_paths.tsv",
            "features/Escherichia-coli-K12/562.7587.PATRIC.features.tab",
            "features/Escherichia-coli-K12_paths.tsv",
        ]
    );
    assert_eq!(connector.connects(), 2);
    assert_eq!(
        batch_events(sink.take()).last(),
        Some(&BatchEvent::BatchCancelled {
            completed: 2,
            total: 6
        })
    );
}

#[test]
fn cancel_mid_transfer_leaves_no_partial_files() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let engine = TransferEngine::new(connector_for(&items, 8192))
        .with_progress_interval(Duration::ZERO);
    let coordinator = BatchCoordinator::new(&engine, layout(&temp));
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let sink = RecordingSink::with_hook(move |event| {
        if let ProgressEvent::Transfer(progress) = event {
            if progress.remote.ends_with("1280.100.fna") && progress.bytes >= 1024 {
                trigger.cancel();
            }
        }
    });

    let report = coordinator
        .run(
            &items,
            ArtifactSelection::from_kinds(&[ArtifactKind::Contigs]),
            &cancel,
            &sink,
        )
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.completed.len(), 1);
    assert_eq!(
        files_under(temp.path()),
        vec![
            "contigs/Escherichia-coli-K12/562.7587.fna",
            "contigs/Escherichia-coli-K12_paths.tsv",
        ]
    );
    assert!(!temp.path().join("contigs/Staphylococcus-aureus").exists());
}

#[test]
fn failed_item_does_not_stop_siblings() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let connector = MockConnector::new()
        .with_file(&ArtifactKind::Contigs.remote_path(&items[0].id), genome_payload(100))
        .with_truncated(&ArtifactKind::Contigs.remote_path(&items[1].id), genome_payload(100))
        .with_file(&ArtifactKind::Contigs.remote_path(&items[2].id), genome_payload(100));
    let engine = TransferEngine::new(connector);
    let coordinator = BatchCoordinator::new(&engine, layout(&temp));
    let sink = RecordingSink::default();

    let report = coordinator
        .run(&items, ArtifactSelection::all(), &CancelFlag::new(), &sink)
        .unwrap();

    assert!(!report.cancelled);
    assert_eq!(report.completed.len(), 2);
    // three missing feature tables plus one truncated contig file
    assert_eq!(report.failures.len(), 4);
    assert!(report.failures.iter().any(|failure| {
        failure.item.id.as_str() == "1280.100"
            && failure.kind == ArtifactKind::Contigs
            && matches!(failure.error, FetchError::SizeMismatch { .. })
    }));
    assert_eq!(
        files_under(temp.path()),
        vec![
            "contigs/Escherichia-coli-K12/562.7587.fna",
            "contigs/Escherichia-coli-K12_paths.tsv",
            "contigs/Klebsiella-pneumoniae/573.12.fna",
            "contigs/Klebsiella-pneumoniae_paths.tsv",
        ]
    );
    assert_eq!(
        batch_events(sink.take()).last(),
        Some(&BatchEvent::Finished {
            completed: 2,
            failed: 4,
            total: 6
        })
    );
}

#[test]
fn precancelled_batch_touches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let connector = connector_for(&items, 10);
    let engine = TransferEngine::new(connector.clone());
    let coordinator = BatchCoordinator::new(&engine, layout(&temp));
    let cancel = CancelFlag::new();
    cancel.cancel();
    let sink = RecordingSink::default();

    let report = coordinator
        .run(&items, ArtifactSelection::all(), &cancel, &sink)
        .unwrap();

    assert!(report.cancelled);
    assert!(report.completed.is_empty());
    assert_eq!(connector.connects(), 0);
    assert!(files_under(temp.path()).is_empty());
}

#[test]
fn failed_item_keeps_file_from_earlier_run() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let layout = layout(&temp);
    let earlier = layout.artifact_path(ArtifactKind::Contigs, &items[0]);
    fs::create_dir_all(earlier.parent().unwrap()).unwrap();
    fs::write(&earlier, b">562.7587\nACGT\n").unwrap();
    let engine = TransferEngine::new(MockConnector::new());
    let coordinator = BatchCoordinator::new(&engine, layout);

    let report = coordinator
        .run(
            &items[..1],
            ArtifactSelection::from_kinds(&[ArtifactKind::Contigs]),
            &CancelFlag::new(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.manifests.is_empty());
    assert_eq!(fs::read(&earlier).unwrap(), b">562.7587\nACGT\n");
    assert_eq!(
        files_under(temp.path()),
        vec!["contigs/Escherichia-coli-K12/562.7587.fna"]
    );
}

#[test]
fn cancelled_item_keeps_file_from_earlier_run() {
    let temp = tempfile::tempdir().unwrap();
    let items = items();
    let layout = layout(&temp);
    let earlier = layout.artifact_path(ArtifactKind::Contigs, &items[0]);
    fs::create_dir_all(earlier.parent().unwrap()).unwrap();
    fs::write(&earlier, b"earlier").unwrap();
    let engine = TransferEngine::new(connector_for(&items, 8192))
        .with_progress_interval(Duration::ZERO);
    let coordinator = BatchCoordinator::new(&engine, layout);
    let cancel = CancelFlag::new();
    let trigger = cancel.clone();
    let sink = RecordingSink::with_hook(move |event| {
        if matches!(event, ProgressEvent::Transfer(progress) if progress.bytes >= 1024) {
            trigger.cancel();
        }
    });

    let report = coordinator
        .run(&items[..1], ArtifactSelection::all(), &cancel, &sink)
        .unwrap();

    assert!(report.cancelled);
    assert!(report.completed.is_empty());
    assert_eq!(fs::read(&earlier).unwrap(), b"earlier");
    assert_eq!(
        files_under(temp.path()),
        vec!["contigs/Escherichia-coli-K12/562.7587.fna"]
    );
}
