use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exclusive advisory lock held for the lifetime of the value.
///
/// Guards the committed manifest during orchestration and the mirror during
/// sync so that only one writer runs at a time.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        tracing::debug!("acquired lock {}", lock_path.display());
        Ok(Self { lock_file: file })
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Cooperative cancellation flag, checked between orchestration steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Cancel this token on Ctrl-C. A second Ctrl-C exits immediately.
    pub fn install_signal_handler(&self) {
        let flag = Arc::clone(&self.flag);
        let _ = ctrlc::set_handler(move || {
            if flag.load(Ordering::SeqCst) {
                std::process::exit(1);
            }
            flag.store(true, Ordering::SeqCst);
            eprintln!("\ncancellation requested, finishing current step...");
        });
    }
}

/// Bounded pool for parallel registry and mirror I/O.
pub(crate) fn worker_pool(workers: usize) -> Result<rayon::ThreadPool, CoreError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| CoreError::WorkerPool(e.to_string()))
}
