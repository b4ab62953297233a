//! Exclusive guard over a path, across threads and processes.
//!
//! `fs2` locks are per process on Unix, so threads of one process would not
//! exclude each other through the file lock alone. Each guard therefore also
//! holds a process-wide mutex keyed by the guard path.

use fs2::FileExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Held for as long as the exclusive section runs; released on drop.
#[derive(Debug)]
pub(crate) struct FileGuard {
    file: File,
    _thread_guard: MutexGuard<'static, ()>,
}

impl FileGuard {
    /// Block until `path` is exclusively held, creating it if needed.
    pub(crate) fn acquire(path: &Path) -> io::Result<Self> {
        let thread_guard = mutex_for(path)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;

        Ok(Self {
            file,
            _thread_guard: thread_guard,
        })
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn mutex_for(path: &Path) -> &'static Mutex<()> {
    static GUARDS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let mut map = GUARDS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    if let Some(existing) = map.get(path) {
        return existing;
    }
    // One mutex per distinct guard path, kept for the life of the process.
    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}
