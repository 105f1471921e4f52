use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::FetchError;

/// Spawns named worker threads whose result comes back over a channel, so a
/// UI loop can poll for completion between frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskRunner;

impl TaskRunner {
    pub fn new() -> Self {
        Self
    }

    pub fn submit<T, F>(&self, name: &str, work: F) -> Result<TaskHandle<T>, FetchError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, FetchError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let task_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("bvbrc-{name}"))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(work))
                    .unwrap_or_else(|_| Err(FetchError::TaskPanicked(task_name)));
                let _ = tx.send(result);
            })
            .map_err(|err| FetchError::Process(format!("failed to spawn {name}: {err}")))?;
        debug!(task = name, "task submitted");
        Ok(TaskHandle {
            name: name.to_string(),
            rx,
            thread: Some(handle),
            result: None,
        })
    }
}

pub struct TaskHandle<T> {
    name: String,
    rx: Receiver<Result<T, FetchError>>,
    thread: Option<JoinHandle<()>>,
    result: Option<Result<T, FetchError>>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking. Returns `true` once the result is available.
    pub fn poll(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.result = Some(Err(FetchError::TaskPanicked(self.name.clone())));
                true
            }
        }
    }

    pub fn is_finished(&mut self) -> bool {
        self.poll()
    }

    /// Takes the result if the worker has finished.
    pub fn try_result(&mut self) -> Option<Result<T, FetchError>> {
        if self.poll() {
            self.reap();
            self.result.take()
        } else {
            None
        }
    }

    /// Blocks until the worker finishes.
    pub fn join(mut self) -> Result<T, FetchError> {
        let result = match self.result.take() {
            Some(result) => result,
            None => self
                .rx
                .recv()
                .unwrap_or_else(|_| Err(FetchError::TaskPanicked(self.name.clone()))),
        };
        self.reap();
        result
    }

    fn reap(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    #[test]
    fn join_returns_worker_result() {
        let handle = TaskRunner::new().submit("sum", || Ok(2 + 2)).unwrap();
        assert_eq!(handle.join().unwrap(), 4);
    }

    #[test]
    fn worker_errors_pass_through() {
        let handle = TaskRunner::new()
            .submit::<(), _>("fail", || Err(FetchError::SizeUnknown("x".to_string())))
            .unwrap();
        assert_matches!(handle.join(), Err(FetchError::SizeUnknown(path)) if path == "x");
    }

    #[test]
    fn panics_become_errors() {
        let handle = TaskRunner::new()
            .submit::<(), _>("boom", || panic!("worker exploded"))
            .unwrap();
        assert_matches!(handle.join(), Err(FetchError::TaskPanicked(name)) if name == "boom");
    }

    #[test]
    fn try_result_is_none_until_finished() {
        let (release, gate) = mpsc::channel::<()>();
        let mut handle = TaskRunner::new()
            .submit("gated", move || {
                gate.recv().ok();
                Ok("done")
            })
            .unwrap();

        assert!(handle.try_result().is_none());
        release.send(()).unwrap();

        let mut result = None;
        for _ in 0..200 {
            if let Some(value) = handle.try_result() {
                result = Some(value);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(result.unwrap().unwrap(), "done");
    }
}
