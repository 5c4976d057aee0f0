// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-wide mutual exclusion between driver invocations.
//!
//! Every mount and unmount snapshots the host's block devices before and
//! after attaching a disk, so two of them running at once would each see
//! the other's device appear.

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use slog::{info, warn, Logger};
use std::fs::{File, OpenOptions};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("waiting for another process to finish attach/detach")]
    Contended { path: Utf8PathBuf },

    #[error("failed to lock {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct InvocationLock {
    file: File,
    path: Utf8PathBuf,
}

impl InvocationLock {
    /// Takes the lock without blocking.
    pub fn try_acquire(path: &Utf8Path) -> Result<Self, LockError> {
        let io_err = |err| LockError::Io { path: path.to_owned(), err };
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path: path.to_owned() }),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.raw_os_error()
                        == fs2::lock_contended_error().raw_os_error() =>
            {
                Err(LockError::Contended { path: path.to_owned() })
            }
            Err(err) => Err(io_err(err)),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for InvocationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Takes the lock, or sleeps for `backoff` and reports contention so the
/// caller retries later instead of piling up behind the holder.
pub async fn acquire_or_back_off(
    log: &Logger,
    path: &Utf8Path,
    backoff: Duration,
) -> Result<InvocationLock, LockError> {
    match InvocationLock::try_acquire(path) {
        Ok(lock) => {
            info!(log, "acquired invocation lock"; "path" => %path);
            Ok(lock)
        }
        Err(err @ LockError::Contended { .. }) => {
            warn!(
                log,
                "invocation lock is held, backing off";
                "path" => %path,
                "backoff" => ?backoff,
            );
            tokio::time::sleep(backoff).await;
            Err(err)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_log;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn second_holder_is_refused_until_first_drops() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("run/vcd-flexvol.lock");

        let first = InvocationLock::try_acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());
        let err = InvocationLock::try_acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }), "{err}");
        assert_eq!(
            err.to_string(),
            "waiting for another process to finish attach/detach"
        );

        drop(first);
        InvocationLock::try_acquire(&path).unwrap();
    }

    #[tokio::test]
    async fn contended_acquire_backs_off() {
        let log = test_log("contended_acquire_backs_off");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("vcd-flexvol.lock");
        let _held = InvocationLock::try_acquire(&path).unwrap();

        let backoff = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = acquire_or_back_off(&log, &path, backoff).await.unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }));
        assert!(started.elapsed() >= backoff);
    }
}
