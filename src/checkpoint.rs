// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Checkpoint persistence.
//!
//! Homelab records provisioning progress as a single __checkpoint__: the
//! highest step target that finished successfully. The checkpoint lives in a
//! plain file holding one decimal integer. An absent file means that nothing
//! has been done yet, and the file is removed once the final step completes
//! so that the next invocation starts a fresh cycle.
//!
//! # Layout
//!
//! ```text
//! ~/.homelab_checkpoint        current checkpoint, e.g. "4"
//! ~/.homelab_checkpoint.tmp    scratch file used while writing
//! ~/.homelab_checkpoint.lock   advisory lock held for the duration of a run
//! ```
//!
//! New values are written to the scratch file first and then renamed over
//! the checkpoint file, so a reader never observes a half written value.
//!
//! The lock file itself is never removed. Exclusion comes from an advisory
//! `flock(2)` on it, which the kernel drops with the last descriptor of the
//! holding process. A run killed by a signal, a lost session, or a reboot
//! therefore never leaves a lock behind that blocks the next run.

use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    fs::{read_to_string, remove_file, rename, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Checkpoint file manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Construct new checkpoint store backed by file at target path.
    ///
    /// Does not touch the file system.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to checkpoint file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Read current checkpoint.
    ///
    /// Never fails. A missing, unreadable, or garbled checkpoint file is
    /// treated as checkpoint 0.
    pub fn get(&self) -> u32 {
        read_to_string(&self.path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Overwrite checkpoint with new value.
    ///
    /// Creates parent directory of checkpoint file if missing.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Write`] if new value cannot be persisted.
    #[instrument(skip(self), level = "debug")]
    pub fn set(&self, value: u32) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| CheckpointError::Write {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        let scratch = self.sibling("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&scratch)
            .map_err(|err| CheckpointError::Write {
                source: err,
                path: scratch.clone(),
            })?;

        // INVARIANT: Value must hit the disk before it replaces the old one.
        writeln!(file, "{value}")
            .and_then(|_| file.sync_all())
            .map_err(|err| CheckpointError::Write {
                source: err,
                path: scratch.clone(),
            })?;

        rename(&scratch, &self.path).map_err(|err| CheckpointError::Write {
            source: err,
            path: self.path.clone(),
        })?;
        debug!("checkpoint {value} written to {:?}", self.path.display());

        Ok(())
    }

    /// Remove checkpoint file.
    ///
    /// Removing a checkpoint that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Clear`] if checkpoint file exists but
    ///   cannot be removed.
    #[instrument(skip(self), level = "debug")]
    pub fn clear(&self) -> Result<()> {
        match remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CheckpointError::Clear {
                source: err,
                path: self.path.clone(),
            }),
        }
    }

    /// Acquire exclusive run lock next to checkpoint file.
    ///
    /// Lock is held until the returned guard is dropped, or the process
    /// exits in any way. A lock file left behind by a dead run is simply
    /// taken over.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Locked`] if another live run holds the
    ///   lock.
    /// - Return [`CheckpointError::Lock`] if lock file cannot be opened.
    #[instrument(skip(self), level = "debug")]
    pub fn lock(&self) -> Result<RunLock> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent).map_err(|err| CheckpointError::Lock {
                source: err,
                path: parent.to_path_buf(),
            })?;
        }

        let path = self.sibling("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| CheckpointError::Lock {
                source: err,
                path: path.clone(),
            })?;

        let mut file = match acquire(file) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(CheckpointError::Locked { path });
            }
            Err(err) => return Err(CheckpointError::Lock { source: err, path }),
        };

        // Pid is informational only.
        let _ = file.set_len(0).and_then(|_| writeln!(file, "{}", std::process::id()));
        debug!("run lock {:?} acquired", path.display());

        Ok(RunLock { path, _file: file })
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }
}

#[cfg(unix)]
type LockHandle = nix::fcntl::Flock<File>;

#[cfg(not(unix))]
type LockHandle = File;

#[cfg(unix)]
fn acquire(file: File) -> std::io::Result<LockHandle> {
    use nix::fcntl::{Flock, FlockArg};

    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| errno.into())
}

// TODO: Use `File::try_lock` once minimum Rust version reaches 1.89.
#[cfg(not(unix))]
fn acquire(file: File) -> std::io::Result<LockHandle> {
    Ok(file)
}

/// Guard over exclusive run lock.
pub struct RunLock {
    path: PathBuf,
    _file: LockHandle,
}

impl RunLock {
    /// Path to lock file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Debug for RunLock {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

/// Provisioning progress of a single run.
///
/// Loads the checkpoint once, then only moves it forward through
/// [`Progress::advance`]. Every advance is persisted immediately.
#[derive(Debug)]
pub struct Progress {
    store: CheckpointStore,
    completed: u32,
}

impl Progress {
    /// Load progress from checkpoint store.
    pub fn load(store: CheckpointStore) -> Self {
        let completed = store.get();
        Self { store, completed }
    }

    /// Highest step target completed so far.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Check if step with target checkpoint is already done.
    pub fn is_done(&self, target: u32) -> bool {
        self.completed >= target
    }

    /// Record successful completion of step with target checkpoint.
    ///
    /// Targets at or below the current checkpoint are ignored, so progress
    /// never moves backwards.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Write`] if new checkpoint cannot be
    ///   persisted.
    pub fn advance(&mut self, target: u32) -> Result<()> {
        if target <= self.completed {
            return Ok(());
        }

        self.store.set(target)?;
        self.completed = target;

        Ok(())
    }

    /// Mark entire run as complete by removing the checkpoint.
    ///
    /// # Errors
    ///
    /// - Return [`CheckpointError::Clear`] if checkpoint cannot be removed.
    pub fn complete(&mut self) -> Result<()> {
        self.store.clear()?;
        self.completed = 0;

        Ok(())
    }
}

/// Checkpoint persistence error types.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Checkpoint cannot be written.
    #[error("failed to write checkpoint at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Checkpoint cannot be removed.
    #[error("failed to clear checkpoint at {:?}", path.display())]
    Clear {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Run lock cannot be opened.
    #[error("failed to open run lock at {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Another run already holds the lock.
    #[error("another run is in progress, it holds {:?}", path.display())]
    Locked { path: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = CheckpointError> = std::result::Result<T, E>;
