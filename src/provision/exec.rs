// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step script execution.
//!
//! Every script step is an external executable run with no arguments. It
//! inherits the terminal, does its own idempotence checks, and reports
//! through its exit status. The orchestrator blocks on the script until it
//! exits or, when a step timeout is configured, until the timeout expires.
//!
//! A timed script leads a process group of its own. On expiry the whole group
//! is killed, so nothing the script started (package managers, image pulls)
//! keeps running behind an aborted run. Being outside the terminal's
//! foreground group, a timed script cannot read from the terminal.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::process::{Child, Command};
use tracing::{debug, instrument, warn};

/// Environment a step script runs in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecContext {
    /// Variables added to the inherited environment.
    pub env: BTreeMap<String, OsString>,

    /// Working directory, inherited when unset.
    pub working_dir: Option<PathBuf>,

    /// Time limit of a single script.
    pub timeout: Option<Duration>,
}

/// How a step script ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exited with status 0.
    Success,

    /// Exited with nonzero status, or `None` if killed by a signal.
    Failed(Option<i32>),

    /// Killed after exceeding the time limit.
    TimedOut(Duration),
}

/// Layer of indirection for running step scripts.
pub trait Executor {
    /// Check if script exists and can be executed.
    fn locate(&self, script: &Path) -> bool {
        is_executable(script)
    }

    /// Run script to completion.
    fn execute(&self, script: &Path, context: &ExecContext) -> impl Future<Output = Result<Exit>>;
}

/// Run step scripts as child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    #[instrument(skip(self, context), level = "debug")]
    async fn execute(&self, script: &Path, context: &ExecContext) -> Result<Exit> {
        let mut command = Command::new(script);
        command.envs(&context.env).kill_on_drop(true);
        if let Some(dir) = &context.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        if context.timeout.is_some() {
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|err| ExecError::Spawn {
            source: err,
            script: script.to_path_buf(),
        })?;
        debug!("spawned {:?} as pid {:?}", script.display(), child.id());

        let status = match context.timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(limit, child.wait()).await;
                match waited {
                    Ok(status) => status,
                    Err(_) => {
                        warn!("{:?} exceeded {limit:?}, killing it", script.display());
                        terminate(&mut child).await;
                        return Ok(Exit::TimedOut(limit));
                    }
                }
            }
            None => child.wait().await,
        }
        .map_err(|err| ExecError::Wait {
            source: err,
            script: script.to_path_buf(),
        })?;

        if status.success() {
            Ok(Exit::Success)
        } else {
            Ok(Exit::Failed(status.code()))
        }
    }
}

/// Kill timed out script along with everything it started.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::{
            sys::signal::{killpg, Signal},
            unistd::Pid,
        };

        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("failed to kill process group {pid}: {err}");
        }
    }

    let _ = child.kill().await;
}

/// Check if path is a regular file that can be executed.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Step script execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Script could not be started.
    #[error("failed to start {:?}", script.display())]
    Spawn {
        #[source]
        source: std::io::Error,
        script: PathBuf,
    },

    /// Script could not be waited on.
    #[error("failed to wait on {:?}", script.display())]
    Wait {
        #[source]
        source: std::io::Error,
        script: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;
