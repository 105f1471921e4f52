#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;

use bvbrc_fetch::error::FetchError;
use bvbrc_fetch::ftp::{Connector, RemoteSession};
use bvbrc_fetch::progress::{ProgressEvent, ProgressSink};

#[derive(Default)]
struct MockState {
    files: HashMap<String, Vec<u8>>,
    truncated: HashSet<String>,
    reads: AtomicUsize,
    connects: AtomicUsize,
    quits: AtomicUsize,
}

/// In-memory server: every `retrieve` hands out at most `buf.len()` bytes per read.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        Arc::get_mut(&mut self.state)
            .expect("configure before sharing")
            .files
            .insert(path.to_string(), data);
        self
    }

    /// Advertises the full size but closes the data stream halfway.
    pub fn with_truncated(mut self, path: &str, data: Vec<u8>) -> Self {
        let state = Arc::get_mut(&mut self.state).expect("configure before sharing");
        state.files.insert(path.to_string(), data);
        state.truncated.insert(path.to_string());
        self
    }

    pub fn reads(&self) -> usize {
        self.state.reads.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.state.quits.load(Ordering::SeqCst)
    }
}

pub struct MockSession {
    state: Arc<MockState>,
}

struct CountingReader {
    data: Vec<u8>,
    position: usize,
    state: Arc<MockState>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.data.len() - self.position;
        let count = remaining.min(buf.len());
        buf[..count].copy_from_slice(&self.data[self.position..self.position + count]);
        self.position += count;
        if count > 0 {
            self.state.reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(count)
    }
}

impl RemoteSession for MockSession {
    fn size(&mut self, path: &str) -> Result<u64, FetchError> {
        self.state
            .files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| FetchError::SizeUnknown(path.to_string()))
    }

    fn retrieve(&mut self, path: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        let mut data = self
            .state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| FetchError::Protocol {
                code: 550,
                message: format!("{path}: no such file"),
            })?;
        if self.state.truncated.contains(path) {
            data.truncate(data.len() / 2);
        }
        Ok(Box::new(CountingReader {
            data,
            position: 0,
            state: self.state.clone(),
        }))
    }

    fn modified(&mut self, path: &str) -> Result<NaiveDateTime, FetchError> {
        if self.state.files.contains_key(path) {
            Ok(NaiveDateTime::parse_from_str("20240131120000", "%Y%m%d%H%M%S").unwrap())
        } else {
            Err(FetchError::Protocol {
                code: 550,
                message: format!("{path}: no such file"),
            })
        }
    }

    fn quit(&mut self) -> Result<(), FetchError> {
        self.state.quits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    fn host(&self) -> &str {
        "mock.bvbrc"
    }

    fn connect(&self) -> Result<MockSession, FetchError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            state: self.state.clone(),
        })
    }
}

/// Keeps every event; optionally runs a hook on each one.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
    hook: Option<Box<dyn Fn(&ProgressEvent) + Send + Sync>>,
}

impl RecordingSink {
    pub fn with_hook(hook: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            hook: Some(Box::new(hook)),
        }
    }

    pub fn take(&self) -> Vec<ProgressEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        if let Some(hook) = &self.hook {
            hook(&event);
        }
        self.events.lock().unwrap().push(event);
    }
}

/// Every regular file below `root`, relative, sorted.
pub fn files_under(root: &Path) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                found.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    found.sort();
    found
}

pub fn genome_payload(len: usize) -> Vec<u8> {
    (0..len).map(|index| b"ACGT"[index % 4]).collect()
}
