// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where homelab looks for its provisioning plan. Every other
//! location (base directory, checkpoint file, secrets) comes from the plan
//! itself.

use std::path::PathBuf;

/// Determine default absolute path to provisioning plan file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/homelab/plan.toml`. Does not
/// check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_plan_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("homelab").join("plan.toml"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's configuration directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[cfg(target_os = "linux")]
    #[sealed_test(env = [("XDG_CONFIG_HOME", "/home/blah/.config")])]
    fn plan_path_follows_xdg() -> anyhow::Result<()> {
        assert_eq!(
            default_plan_path()?,
            PathBuf::from("/home/blah/.config/homelab/plan.toml")
        );

        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[sealed_test(env = [("HOME", "/home/blah"), ("XDG_CONFIG_HOME", "")])]
    fn plan_path_falls_back_to_home() -> anyhow::Result<()> {
        assert_eq!(
            default_plan_path()?,
            PathBuf::from("/home/blah/.config/homelab/plan.toml")
        );

        Ok(())
    }
}
