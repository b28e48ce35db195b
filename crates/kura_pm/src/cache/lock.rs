use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};

use fs2::FileExt as _;

use super::CacheError;

/// ロック中のパス一覧。所有するストアと同じ寿命を持つ。
///
/// fs2 のロックは Unix では同一プロセス内のスレッドを排他しないため、
/// プロセス内ではこの表で待ち合わせる。
#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl PathLocks {
    /// `path` のロックファイルを排他的に確保する。ガードを破棄すると解放される。
    pub(crate) fn lock_exclusive(&self, path: &Path) -> Result<CacheLock<'_>, CacheError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(path) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(path.to_path_buf());
        drop(held);

        let claim = Claim {
            locks: self,
            path: path.to_path_buf(),
        };
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

        Ok(CacheLock {
            file,
            _claim: claim,
        })
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// プロセス内の確保。破棄時に表から外して待機者を起こす。
#[derive(Debug)]
struct Claim<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
        self.locks.released.notify_all();
    }
}

/// ファイルロックとプロセス内の確保を束ねたガード。
#[derive(Debug)]
pub(crate) struct CacheLock<'a> {
    file: File,
    _claim: Claim<'a>,
}

impl Drop for CacheLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
