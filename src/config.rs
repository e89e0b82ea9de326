// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the __provisioning plan__, the TOML file that tells
//! homelab which steps to run, where their scripts live, and where the
//! checkpoint and secrets are kept. A built-in plan for the standard homelab
//! is used when no plan file exists.
//!
//! # General Layout
//!
//! ```toml
//! [settings]
//! base_dir = "~/homelab"
//! checkpoint = "~/.homelab_checkpoint"
//! step_timeout = 3600
//!
//! [host]
//! os_release = "/etc/os-release"
//! supported_families = ["debian"]
//! init_marker = "/run/systemd/system"
//!
//! [secrets]
//! encrypted = "secrets.env.age"
//! plaintext = "secrets.env"
//! program = "age"
//!
//! [env]
//! HOMELAB_RUNTIME = "podman"
//!
//! [summary]
//! notes = ["Cockpit: https://<host>:9090"]
//!
//! [[step]]
//! name = "install-runtime"
//! checkpoint = 1
//! action = { script = "scripts/install-runtime.sh" }
//!
//! [[step]]
//! name = "materialize-secrets"
//! checkpoint = 2
//! action = "secrets"
//! ```
//!
//! Path fields go through shell expansion, so `~` and `$VAR` may be used.
//! Relative script and secrets paths are resolved against `base_dir`.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, instrument};

/// Built-in plan for the standard homelab.
pub const DEFAULT_PLAN: &str = r#"
[settings]
base_dir = "~/homelab"
checkpoint = "~/.homelab_checkpoint"

[env]
HOMELAB_RUNTIME = "podman"
HOMELAB_MANAGEMENT_UI = "cockpit"

[summary]
notes = [
    "Cockpit: https://<host>:9090",
    "Pi-hole: http://<pihole-ip>/admin",
    "Nginx Proxy Manager: http://<host>:81",
    "UniFi Controller: https://<host>:8443",
    "Home Assistant: http://<host>:8123",
    "Secrets: re-encrypt with `homelab secrets encrypt` after editing secrets.env",
]

[[step]]
name = "install-prerequisites"
checkpoint = 1
action = { script = "scripts/install-prerequisites.sh" }

[[step]]
name = "install-runtime"
checkpoint = 2
kind = "mandatory"
action = { script = "scripts/install-runtime.sh" }

[[step]]
name = "install-management-ui"
checkpoint = 3
action = { script = "scripts/install-management-ui.sh" }

[[step]]
name = "materialize-secrets"
checkpoint = 4
action = "secrets"

[[step]]
name = "configure-network"
checkpoint = 5
action = { script = "scripts/configure-network.sh" }

[[step]]
name = "deploy-services"
checkpoint = 6
action = { script = "scripts/deploy-services.sh" }

[[step]]
name = "verify-services"
checkpoint = 7
action = { script = "scripts/verify-services.sh" }
"#;

/// Provisioning plan layout.
///
/// The plan is composed of general settings, host precondition settings,
/// secrets locations, extra environment for step scripts, post-install notes,
/// and the ordered step registry.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Plan {
    /// General settings.
    #[serde(default)]
    pub settings: PlanSettings,

    /// Host precondition settings.
    #[serde(default)]
    pub host: HostSettings,

    /// Secrets artifact settings.
    #[serde(default)]
    pub secrets: SecretSettings,

    /// Extra environment variables handed to every step script.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Post-install summary.
    #[serde(default)]
    pub summary: SummarySettings,

    /// Ordered step registry.
    #[serde(rename = "step", default)]
    pub steps: Vec<StepDefinition>,
}

impl Plan {
    /// Load plan from file, or fall back to built-in plan if file is missing.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if plan file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if plan is malformed.
    /// - Return [`ConfigError::ShellExpansion`] if path expansion fails.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match read_to_string(path) {
            Ok(content) => {
                debug!("load plan from {:?}", path.display());
                content.parse()
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!("no plan at {:?}, using built-in plan", path.display());
                Self::builtin()
            }
            Err(err) => Err(ConfigError::Read {
                source: err,
                path: path.to_path_buf(),
            }),
        }
    }

    /// Built-in plan for the standard homelab.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ShellExpansion`] if home directory cannot be
    ///   expanded.
    pub fn builtin() -> Result<Self> {
        DEFAULT_PLAN.parse()
    }

    /// Resolve path relative to base directory.
    ///
    /// Absolute paths are returned untouched.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.settings.base_dir.join(path)
    }

    /// Absolute path to encrypted secrets artifact.
    pub fn encrypted_secrets(&self) -> PathBuf {
        self.resolve(&self.secrets.encrypted)
    }

    /// Absolute path to plaintext secrets artifact.
    pub fn plaintext_secrets(&self) -> PathBuf {
        self.resolve(&self.secrets.plaintext)
    }
}

impl FromStr for Plan {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut plan: Plan = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        plan.settings.base_dir = expand(&plan.settings.base_dir)?;
        plan.settings.checkpoint = expand(&plan.settings.checkpoint)?;
        plan.host.os_release = expand(&plan.host.os_release)?;
        plan.host.init_marker = expand(&plan.host.init_marker)?;
        plan.secrets.encrypted = expand(&plan.secrets.encrypted)?;
        plan.secrets.plaintext = expand(&plan.secrets.plaintext)?;
        for step in plan.steps.iter_mut() {
            if let StepAction::Script(script) = &mut step.action {
                *script = expand(script)?;
            }
        }

        Ok(plan)
    }
}

impl Display for Plan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// General plan settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PlanSettings {
    /// Directory holding step scripts and secrets.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Checkpoint file.
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// Seconds a single step may run before it is killed and treated as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout: Option<u64>,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            checkpoint: default_checkpoint(),
            step_timeout: None,
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("~/homelab")
}

fn default_checkpoint() -> PathBuf {
    PathBuf::from("~/.homelab_checkpoint")
}

/// Host precondition settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostSettings {
    /// File describing host operating system identity.
    pub os_release: PathBuf,

    /// Distribution identifiers accepted through `ID` or `ID_LIKE`.
    pub supported_families: Vec<String>,

    /// Path that only exists when a service supervisor is running.
    pub init_marker: PathBuf,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            os_release: PathBuf::from("/etc/os-release"),
            supported_families: vec!["debian".into()],
            init_marker: PathBuf::from("/run/systemd/system"),
        }
    }
}

/// Secrets artifact settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecretSettings {
    /// Encrypted secrets file.
    pub encrypted: PathBuf,

    /// Decrypted secrets file.
    pub plaintext: PathBuf,

    /// File encryption program.
    pub program: String,
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            encrypted: PathBuf::from("secrets.env.age"),
            plaintext: PathBuf::from("secrets.env"),
            program: "age".into(),
        }
    }
}

/// Post-install summary settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SummarySettings {
    /// Lines printed after a complete run.
    pub notes: Vec<String>,
}

/// Definition of a single provisioning step.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct StepDefinition {
    /// Human readable step name.
    pub name: String,

    /// Checkpoint recorded once step succeeds.
    pub checkpoint: u32,

    /// Whether a missing script aborts the run.
    #[serde(default)]
    pub kind: StepKind,

    /// What the step does.
    pub action: StepAction,
}

/// What a step does.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    /// Run external script with no arguments.
    Script(PathBuf),

    /// Ensure plaintext secrets exist, decrypting them if needed.
    Secrets,
}

/// How a step treats a missing script.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Warn and skip without advancing the checkpoint.
    #[default]
    Optional,

    /// Abort the run.
    Mandatory,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read plan file.
    #[error("failed to read plan at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
