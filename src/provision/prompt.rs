// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! User interaction.
//!
//! The orchestrator never talks to the terminal directly. Confirmations go
//! through an [`Interaction`] provider so that runs can be driven headless,
//! e.g., with `--yes` or from tests.

use indicatif::ProgressBar;
use inquire::{Confirm, InquireError};
use tracing::{debug, instrument};

/// Layer of indirection for user interaction.
pub trait Interaction {
    /// Ask user a yes/no question.
    ///
    /// # Errors
    ///
    /// - Return [`PromptError`] if user cannot be asked at all.
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Answer yes to everything without asking.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Interaction for AssumeYes {
    fn confirm(&self, message: &str) -> Result<bool> {
        debug!("assume yes: {message}");
        Ok(true)
    }
}

/// Ask user on the terminal through inquire.
///
/// Suspends progress bar while the question is on screen.
#[derive(Debug, Clone)]
pub struct InquirePrompter {
    pub(crate) bar: ProgressBar,
}

impl InquirePrompter {
    /// Construct new terminal prompter.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Interaction for InquirePrompter {
    #[instrument(skip(self), level = "debug")]
    fn confirm(&self, message: &str) -> Result<bool> {
        self.bar.suspend(|| {
            match Confirm::new(message).with_default(false).prompt() {
                Ok(answer) => Ok(answer),
                // INVARIANT: Escape and Ctrl-C both count as "no".
                Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => {
                    Ok(false)
                }
                Err(err) => Err(PromptError(err)),
            }
        })
    }
}

/// User could not be prompted.
#[derive(Debug, thiserror::Error)]
#[error("failed to prompt user")]
pub struct PromptError(#[source] pub InquireError);

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;
