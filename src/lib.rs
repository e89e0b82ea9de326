// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Resumable homelab provisioning.
//!
//! Homelab bootstraps a single host by running an ordered list of external
//! step scripts. Progress survives reboots and failures through a one-integer
//! __checkpoint__ file, so that invoking homelab again resumes at the first
//! step that has not completed. Host preconditions are checked on every run,
//! and a mandatory secrets gate makes sure decrypted secrets exist before any
//! step that needs them.
//!
//! See [`provision::Orchestrator`] for the run sequence, and [`config`] for the
//! layout of provisioning plans.

pub mod checkpoint;
pub mod config;
pub mod host;
pub mod path;
pub mod provision;

pub use checkpoint::{CheckpointStore, Progress};
pub use config::Plan;
pub use host::PreconditionGate;
pub use provision::{Orchestrator, Outcome, RunSummary, Status};
