// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Step registry.
//!
//! The registry is the ordered list of provisioning steps taken from a plan.
//! Order is the only dependency expression: a step may assume every step
//! before it has completed. Each step carries the checkpoint value recorded
//! once it succeeds, and these targets must strictly increase through the
//! registry so that a single integer can describe how far a run got.

use crate::config::{Plan, StepAction, StepKind};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

/// A single provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Human readable name for logging.
    pub name: String,

    /// Whether a missing script aborts the run.
    pub kind: StepKind,

    /// What the step does. Script paths are absolute.
    pub action: StepAction,

    /// Checkpoint recorded once the step succeeds.
    pub target: u32,
}

impl Step {
    /// Construct new script step.
    pub fn script(name: impl Into<String>, script: impl Into<PathBuf>, target: u32) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Optional,
            action: StepAction::Script(script.into()),
            target,
        }
    }

    /// Construct new secrets materialization step.
    ///
    /// Always mandatory, missing secrets can never be skipped.
    pub fn secrets(name: impl Into<String>, target: u32) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Mandatory,
            action: StepAction::Secrets,
            target,
        }
    }

}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.action {
            StepAction::Script(script) => write!(
                fmt,
                "#{} {} ({})",
                self.target,
                self.name,
                script.display()
            ),
            StepAction::Secrets => write!(fmt, "#{} {} (secrets)", self.target, self.name),
        }
    }
}

/// Ordered registry of provisioning steps.
///
/// # Invariant
///
/// - Every target is non-zero.
/// - Targets strictly increase in registry order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registry {
    steps: Vec<Step>,
}

impl Registry {
    /// Construct new registry from ordered listing of steps.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::EmptyName`] if a step has no name.
    /// - Return [`RegistryError::ZeroTarget`] if a step targets checkpoint 0.
    /// - Return [`RegistryError::NotIncreasing`] if targets are out of order
    ///   or duplicated.
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Result<Self> {
        let steps = steps.into_iter().collect::<Vec<_>>();

        let mut previous: Option<&Step> = None;
        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(RegistryError::EmptyName {
                    target: step.target,
                });
            }

            if step.target == 0 {
                return Err(RegistryError::ZeroTarget {
                    name: step.name.clone(),
                });
            }

            if let Some(previous) = previous.filter(|previous| previous.target >= step.target) {
                return Err(RegistryError::NotIncreasing {
                    name: step.name.clone(),
                    target: step.target,
                    previous_name: previous.name.clone(),
                    previous_target: previous.target,
                });
            }

            previous = Some(step);
        }

        Ok(Self { steps })
    }

    /// Build registry from plan.
    ///
    /// Relative script paths are resolved against the plan's base directory.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError`] if plan's steps violate registry invariants.
    pub fn from_plan(plan: &Plan) -> Result<Self> {
        Self::new(plan.steps.iter().map(|definition| match &definition.action {
            StepAction::Script(script) => Step {
                name: definition.name.clone(),
                kind: definition.kind,
                action: StepAction::Script(plan.resolve(script)),
                target: definition.checkpoint,
            },
            StepAction::Secrets => Step::secrets(definition.name.clone(), definition.checkpoint),
        }))
    }

    /// Iterate through steps in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter()
    }

    /// Iterate through steps not yet covered by checkpoint.
    pub fn pending(&self, completed: u32) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |step| step.target > completed)
    }

    /// Checkpoint of final step, or 0 for empty registry.
    pub fn final_target(&self) -> u32 {
        self.steps.last().map(|step| step.target).unwrap_or(0)
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if registry has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Registry validation error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Step has no name.
    #[error("step with checkpoint {target} has no name")]
    EmptyName { target: u32 },

    /// Step targets checkpoint 0, which means "nothing done".
    #[error("step {name:?} cannot target checkpoint 0")]
    ZeroTarget { name: String },

    /// Step target does not increase past the previous step.
    #[error(
        "step {name:?} has checkpoint {target}, which does not follow \
         step {previous_name:?} with checkpoint {previous_target}"
    )]
    NotIncreasing {
        name: String,
        target: u32,
        previous_name: String,
        previous_target: u32,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
