//! Background extension of a torrent's files to their final size.
//!
//! The walk runs on its own OS thread since every step is a blocking
//! filesystem call. It can be stopped between two files, and reports its
//! outcome to the control loop with [`Alert::PreallocationFinished`].
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;

use super::io::file::{CacheFile, ProgressSink};
use crate::alert::{self, Alert, AlertSender};

/// The progress of a preallocation run, shared with the worker thread.
#[derive(Debug)]
pub struct PreallocStatus {
    stopped: AtomicBool,
    not_finished: AtomicBool,
    done: AtomicBool,
    bytes_written: AtomicU64,
    error: Mutex<Option<String>>,
}

impl Default for PreallocStatus {
    fn default() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            not_finished: AtomicBool::new(false),
            done: AtomicBool::new(false),
            bytes_written: AtomicU64::new(0),
            error: Mutex::new(None),
        }
    }
}

impl PreallocStatus {
    /// The sum of the sizes the files were extended to so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// The error that aborted the run.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Whether the run was stopped before every file was handled.
    pub fn is_not_finished(&self) -> bool {
        self.not_finished.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

impl ProgressSink for PreallocStatus {
    fn written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Preallocates a list of files, one after the other.
pub struct PreallocationThread {
    todo: Vec<Arc<CacheFile>>,
    fully: bool,
    status: Arc<PreallocStatus>,
}

impl PreallocationThread {
    /// With `fully` the disk blocks are reserved instead of only setting
    /// each file's length.
    pub fn new(fully: bool) -> Self {
        Self {
            todo: Vec::new(),
            fully,
            status: Arc::new(PreallocStatus::default()),
        }
    }

    pub fn add(&mut self, file: Arc<CacheFile>) {
        self.todo.push(file);
    }

    pub fn file_count(&self) -> usize {
        self.todo.len()
    }

    pub fn status(&self) -> Arc<PreallocStatus> {
        Arc::clone(&self.status)
    }

    /// Walks the files on the calling thread.
    ///
    /// The first storage error aborts the walk and is kept as the run's
    /// error message. Progress reported before it stands.
    pub fn run(&self) {
        log::info!("Preallocating {} files", self.todo.len());
        for file in &self.todo {
            if self.status.is_stopped() {
                log::info!("Preallocation stopped");
                self.status.not_finished.store(true, Ordering::Relaxed);
                break;
            }
            if let Err(e) = file.preallocate(self.fully, self.status.as_ref()) {
                log::warn!("Preallocation failed: {}", e);
                *self.status.error.lock() = Some(e.to_string());
                break;
            }
        }
        if !self.status.is_not_finished() && self.status.error().is_none() {
            log::info!(
                "Preallocation finished, {} bytes",
                self.status.bytes_written()
            );
        }
        self.status.done.store(true, Ordering::Release);
    }

    /// Runs the walk on a new thread, which posts
    /// [`Alert::PreallocationFinished`] once done.
    pub fn spawn(self, alert_tx: Option<AlertSender>) -> std::io::Result<PreallocHandle> {
        let status = self.status();
        let join = thread::Builder::new()
            .name("preallocation".into())
            .spawn(move || {
                self.run();
                alert::post(
                    alert_tx.as_ref(),
                    Alert::PreallocationFinished {
                        error: self.status.error(),
                        completed: !self.status.is_not_finished(),
                    },
                );
            })?;
        Ok(PreallocHandle {
            status,
            join: Some(join),
        })
    }
}

/// The primary thread's side of a spawned preallocation run.
pub struct PreallocHandle {
    status: Arc<PreallocStatus>,
    join: Option<thread::JoinHandle<()>>,
}

impl PreallocHandle {
    pub fn status(&self) -> &PreallocStatus {
        &self.status
    }

    /// Asks the worker to stop before the next file.
    pub fn stop(&self) {
        self.status.stop();
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Waits for the worker to exit.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("Preallocation thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use super::*;
    use crate::conf::DiskConf;

    fn files(dir: &TempDir, sizes: &[u64]) -> Vec<Arc<CacheFile>> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                Arc::new(CacheFile::open(
                    dir.path().join(format!("f{}", i)),
                    size,
                    &DiskConf::default(),
                ))
            })
            .collect()
    }

    /// Every file reaches its size and the progress adds up.
    #[test]
    fn should_extend_all_files() {
        let dir = TempDir::new().unwrap();
        let mut prealloc = PreallocationThread::new(false);
        for file in files(&dir, &[100, 5000, 1]) {
            prealloc.add(file);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = prealloc.spawn(Some(tx)).unwrap();
        handle.join();

        assert_eq!(
            rx.try_recv().unwrap(),
            Alert::PreallocationFinished {
                error: None,
                completed: true
            }
        );
        assert_eq!(fs::metadata(dir.path().join("f1")).unwrap().len(), 5000);
        assert_eq!(fs::metadata(dir.path().join("f2")).unwrap().len(), 1);
    }

    #[test]
    fn should_report_bytes_written() {
        let dir = TempDir::new().unwrap();
        let mut prealloc = PreallocationThread::new(true);
        for file in files(&dir, &[100, 5000]) {
            prealloc.add(file);
        }
        prealloc.run();
        assert_eq!(prealloc.status().bytes_written(), 5100);
        assert!(prealloc.status().is_done());
    }

    /// A stop request before the walk leaves it unfinished.
    #[test]
    fn should_stop_between_files() {
        let dir = TempDir::new().unwrap();
        let mut prealloc = PreallocationThread::new(false);
        for file in files(&dir, &[100, 100]) {
            prealloc.add(file);
        }
        prealloc.status().stop();
        prealloc.run();

        let status = prealloc.status();
        assert!(status.is_not_finished());
        assert_eq!(status.bytes_written(), 0);
        assert!(!dir.path().join("f0").exists());
    }

    /// The first failing file aborts the walk with its error.
    #[test]
    fn should_abort_on_storage_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let mut prealloc = PreallocationThread::new(false);
        prealloc.add(Arc::new(CacheFile::open(
            dir.path().join("ok"),
            10,
            &DiskConf::default(),
        )));
        prealloc.add(Arc::new(CacheFile::open(
            blocker.join("child"),
            10,
            &DiskConf::default(),
        )));
        prealloc.add(Arc::new(CacheFile::open(
            dir.path().join("skipped"),
            10,
            &DiskConf::default(),
        )));
        prealloc.run();

        let status = prealloc.status();
        assert!(status.error().is_some());
        assert_eq!(status.bytes_written(), 10);
        assert!(!dir.path().join("skipped").exists());
    }
}
