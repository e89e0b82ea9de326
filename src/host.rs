// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Host precondition checks.
//!
//! Before any provisioning step runs, homelab verifies that the host is one
//! the step scripts can assume: a Debian-family distribution with a service
//! supervisor able to keep daemons running. These checks are not steps. They
//! are evaluated on every invocation and never recorded in the checkpoint,
//! because an environment property cannot become "done".
//!
//! # See Also
//!
//! - [os-release(5)](https://www.freedesktop.org/software/systemd/man/latest/os-release.html)
//! - [sd_booted(3)](https://www.freedesktop.org/software/systemd/man/latest/sd_booted.html)

use crate::config::HostSettings;

use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::PathBuf,
};
use tracing::{debug, info, instrument};

/// Identity of host operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsFamily {
    /// Host belongs to a supported family, carries the matched identifier.
    Supported(String),

    /// Host is not supported, carries whatever identifier was found.
    Unsupported(String),
}

/// Presence of a service supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitSystem {
    Present,
    Absent,
}

/// Outcome of precondition checks for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preconditions {
    pub os_family: OsFamily,
    pub init_system: InitSystem,
}

/// Parsed os-release file.
///
/// Only `KEY=value` lines are kept. Values may be wrapped in single or double
/// quotes. Comments and blank lines are ignored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OsRelease {
    fields: HashMap<String, String>,
}

impl OsRelease {
    /// Look up field by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Distribution identifier, i.e., `ID` field.
    pub fn id(&self) -> Option<&str> {
        self.get("ID")
    }

    /// Identifiers of related distributions, i.e., `ID_LIKE` field.
    pub fn id_like(&self) -> impl Iterator<Item = &str> {
        self.get("ID_LIKE").unwrap_or_default().split_whitespace()
    }

    /// Match distribution against listing of supported families.
    pub fn family(&self, supported: &[String]) -> OsFamily {
        let id = self.id().unwrap_or("unknown");
        let matched = std::iter::once(id)
            .chain(self.id_like())
            .find(|candidate| supported.iter().any(|family| family.as_str() == *candidate));

        match matched {
            Some(family) => OsFamily::Supported(family.to_string()),
            None => OsFamily::Unsupported(id.to_string()),
        }
    }
}

impl From<&str> for OsRelease {
    fn from(content: &str) -> Self {
        let fields = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim().to_string(), unquote(value.trim()).to_string()))
            .collect();

        Self { fields }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }

    value
}

/// Precondition gate for host environment.
#[derive(Debug, Clone)]
pub struct PreconditionGate {
    settings: HostSettings,
}

impl PreconditionGate {
    /// Construct new precondition gate from host settings.
    pub fn new(settings: HostSettings) -> Self {
        Self { settings }
    }

    /// Determine operating system family of host.
    ///
    /// An unreadable os-release file yields [`OsFamily::Unsupported`].
    pub fn check_os_family(&self) -> OsFamily {
        match read_to_string(&self.settings.os_release) {
            Ok(content) => {
                OsRelease::from(content.as_str()).family(&self.settings.supported_families)
            }
            Err(err) => {
                debug!(
                    "cannot read {:?}: {err}",
                    self.settings.os_release.display()
                );
                OsFamily::Unsupported("unknown".into())
            }
        }
    }

    /// Determine whether a service supervisor is running on host.
    pub fn check_init_system(&self) -> InitSystem {
        if self.settings.init_marker.exists() {
            InitSystem::Present
        } else {
            InitSystem::Absent
        }
    }

    /// Run all checks, failing on the first unmet precondition.
    ///
    /// # Errors
    ///
    /// - Return [`HostError::UnsupportedOs`] if host is not of a supported
    ///   family.
    /// - Return [`HostError::NoInitSystem`] if no service supervisor exists.
    #[instrument(skip(self), level = "debug")]
    pub fn verify(&self) -> Result<Preconditions> {
        let os_family = self.check_os_family();
        if let OsFamily::Unsupported(id) = &os_family {
            return Err(HostError::UnsupportedOs {
                id: id.clone(),
                supported: self.settings.supported_families.clone(),
            });
        }

        let init_system = self.check_init_system();
        if init_system == InitSystem::Absent {
            return Err(HostError::NoInitSystem {
                marker: self.settings.init_marker.clone(),
            });
        }

        info!("host is {os_family}, service supervisor present");

        Ok(Preconditions {
            os_family,
            init_system,
        })
    }
}

impl Display for OsFamily {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Supported(id) => write!(fmt, "{id} (supported)"),
            Self::Unsupported(id) => write!(fmt, "{id} (unsupported)"),
        }
    }
}

/// Host precondition error types.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Operating system is not of a supported family.
    #[error("operating system {id:?} is not supported, expected one of {supported:?}")]
    UnsupportedOs { id: String, supported: Vec<String> },

    /// No service supervisor found.
    #[error("no service supervisor detected, {:?} does not exist", marker.display())]
    NoInitSystem { marker: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = HostError> = std::result::Result<T, E>;
