//! Positioned file access with OS locking.
//!
//! The file handle lives behind a `Mutex` so reads can run through `&self`
//! (cursors and historical snapshots borrow the store immutably). A
//! read-write open takes an exclusive OS lock, a read-only open a shared
//! one; at most one open per process either way.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;

struct FileInner {
    file: File,
    size: u64,
}

/// The store's backing file.
pub(crate) struct StoreFile {
    inner: Mutex<FileInner>,
    path: PathBuf,
    read_only: bool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl std::fmt::Debug for StoreFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFile")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("size", &self.size())
            .finish()
    }
}

impl StoreFile {
    /// Opens and locks the file (exclusive for read-write, shared for
    /// read-only).
    pub fn open(path: &Path, read_only: bool) -> Result<Self, StoreError> {
        let io_err = |e| StoreError::Io {
            file: path.display().to_string(),
            offset: 0,
            source: e,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(io_err)?;
        let locked = if read_only {
            file.try_lock_shared()
        } else {
            file.try_lock()
        };
        match locked {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(StoreError::Locked(path.display().to_string()))
            }
            Err(TryLockError::Error(e)) => return Err(io_err(e)),
        }
        let size = file.metadata().map_err(io_err)?.len();
        Ok(Self {
            inner: Mutex::new(FileInner { file, size }),
            path: path.to_path_buf(),
            read_only,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FileInner> {
        // The guarded state stays consistent even if a panicking thread
        // poisoned the mutex; seek position is re-established per call.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current file size in bytes (tracked, not stat-ed).
    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Reads exactly `len` bytes starting at `pos`.
    pub fn read_at(&self, pos: u64, len: usize) -> std::io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();
        guard.file.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; len];
        guard.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes all of `data` starting at `pos`.
    pub fn write_at(&self, pos: u64, data: &[u8]) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();
        guard.file.seek(SeekFrom::Start(pos))?;
        guard.file.write_all(data)?;
        guard.size = guard.size.max(pos + data.len() as u64);
        Ok(())
    }

    /// Truncates the file to `new_size` bytes.
    pub fn truncate(&self, new_size: u64) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();
        guard.file.set_len(new_size)?;
        guard.size = new_size;
        Ok(())
    }

    /// Flushes file content and metadata to stable storage.
    pub fn sync(&self) -> std::io::Result<()> {
        self.lock().file.sync_all()
    }
}
