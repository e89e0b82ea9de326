// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secrets materialization.
//!
//! Later provisioning steps read credentials from a plaintext secrets file.
//! That file is distributed encrypted and decrypted on demand with a file
//! encryption program, `age` by default, which asks for the passphrase on the
//! terminal itself. Homelab never looks inside either file. It only checks
//! which of them exist.
//!
//! Unlike an ordinary step, the secrets gate can never be skipped: if no
//! plaintext can be produced, the run aborts, because every step after it
//! would otherwise proceed with missing credentials.
//!
//! # See Also
//!
//! - [age](https://age-encryption.org)

use crate::provision::prompt::{Interaction, PromptError};

use std::{
    ffi::OsStr,
    fs::{remove_file, OpenOptions},
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Layer of indirection for file encryption.
pub trait SecretCipher {
    /// Decrypt file at `encrypted` into file at `plaintext`.
    ///
    /// The plaintext file already exists, empty and private to the current
    /// user, when this is called. Implementations should write into it rather
    /// than replace it.
    fn decrypt(&self, encrypted: &Path, plaintext: &Path) -> impl Future<Output = Result<()>>;

    /// Encrypt file at `plaintext` into file at `encrypted`.
    fn encrypt(&self, plaintext: &Path, encrypted: &Path) -> impl Future<Output = Result<()>>;
}

/// Passphrase encryption through the `age` command line tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeCipher {
    program: String,
}

impl AgeCipher {
    /// Construct new cipher running target program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn call(&self, args: &[&OsStr], output: Stdio) -> Result<()> {
        let status = Command::new(&self.program)
            .args(args)
            .stdout(output)
            .status()
            .await
            .map_err(|err| SecretsError::Spawn {
                source: err,
                program: self.program.clone(),
            })?;

        if !status.success() {
            return Err(SecretsError::Cipher {
                program: self.program.clone(),
                code: status.code(),
            });
        }

        Ok(())
    }
}

impl Default for AgeCipher {
    fn default() -> Self {
        Self::new("age")
    }
}

impl SecretCipher for AgeCipher {
    #[instrument(skip(self), level = "debug")]
    async fn decrypt(&self, encrypted: &Path, plaintext: &Path) -> Result<()> {
        // INVARIANT: Write through the reserved file so its mode is kept.
        let output = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(plaintext)
            .map_err(|err| SecretsError::Create {
                source: err,
                path: plaintext.to_path_buf(),
            })?;

        self.call(
            &[OsStr::new("--decrypt"), encrypted.as_os_str()],
            Stdio::from(output),
        )
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn encrypt(&self, plaintext: &Path, encrypted: &Path) -> Result<()> {
        self.call(
            &[
                OsStr::new("--passphrase"),
                OsStr::new("--output"),
                encrypted.as_os_str(),
                plaintext.as_os_str(),
            ],
            Stdio::inherit(),
        )
        .await
    }
}

/// What the secrets gate had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// Plaintext already existed.
    AlreadyPresent,

    /// Plaintext was decrypted during this run.
    Decrypted,
}

/// Gate that guarantees plaintext secrets exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsGate {
    encrypted: PathBuf,
    plaintext: PathBuf,
}

impl SecretsGate {
    /// Construct new secrets gate over encrypted and plaintext artifacts.
    pub fn new(encrypted: impl Into<PathBuf>, plaintext: impl Into<PathBuf>) -> Self {
        Self {
            encrypted: encrypted.into(),
            plaintext: plaintext.into(),
        }
    }

    /// Path to encrypted secrets.
    pub fn encrypted(&self) -> &Path {
        self.encrypted.as_path()
    }

    /// Path to plaintext secrets.
    pub fn plaintext(&self) -> &Path {
        self.plaintext.as_path()
    }

    /// Ensure plaintext secrets exist.
    ///
    /// Does nothing if plaintext already exists. Otherwise asks for
    /// confirmation and decrypts the encrypted secrets. A partially written
    /// plaintext is removed when decryption fails.
    ///
    /// # Errors
    ///
    /// - Return [`SecretsError::NoSource`] if neither artifact exists.
    /// - Return [`SecretsError::Declined`] if user declines decryption.
    /// - Return [`SecretsError::Cipher`] or [`SecretsError::Spawn`] if
    ///   decryption fails.
    /// - Return [`SecretsError::NotProduced`] if decryption claims success
    ///   but no plaintext exists afterwards.
    #[instrument(skip(self, cipher, interaction), level = "debug")]
    pub async fn materialize(
        &self,
        cipher: &impl SecretCipher,
        interaction: &impl Interaction,
    ) -> Result<Materialized> {
        if self.plaintext.exists() {
            info!("secrets already present at {:?}", self.plaintext.display());
            return Ok(Materialized::AlreadyPresent);
        }

        if !self.encrypted.exists() {
            return Err(SecretsError::NoSource {
                encrypted: self.encrypted.clone(),
                plaintext: self.plaintext.clone(),
            });
        }

        let question = format!("Decrypt secrets from {}?", self.encrypted.display());
        if !interaction.confirm(&question)? {
            return Err(SecretsError::Declined);
        }

        info!("decrypt secrets from {:?}", self.encrypted.display());
        reserve_private(&self.plaintext)?;
        if let Err(err) = cipher.decrypt(&self.encrypted, &self.plaintext).await {
            self.discard_plaintext();
            return Err(err);
        }

        if !self.plaintext.exists() {
            return Err(SecretsError::NotProduced {
                plaintext: self.plaintext.clone(),
            });
        }

        restrict_permissions(&self.plaintext)?;

        Ok(Materialized::Decrypted)
    }

    /// Encrypt plaintext secrets, replacing encrypted secrets.
    ///
    /// Asks for confirmation before overwriting existing encrypted secrets.
    ///
    /// # Errors
    ///
    /// - Return [`SecretsError::NoPlaintext`] if plaintext does not exist.
    /// - Return [`SecretsError::Declined`] if user declines overwrite.
    /// - Return [`SecretsError::Cipher`] or [`SecretsError::Spawn`] if
    ///   encryption fails.
    #[instrument(skip(self, cipher, interaction), level = "debug")]
    pub async fn seal(
        &self,
        cipher: &impl SecretCipher,
        interaction: &impl Interaction,
    ) -> Result<()> {
        if !self.plaintext.exists() {
            return Err(SecretsError::NoPlaintext {
                plaintext: self.plaintext.clone(),
            });
        }

        if self.encrypted.exists() {
            let question = format!("Overwrite {}?", self.encrypted.display());
            if !interaction.confirm(&question)? {
                return Err(SecretsError::Declined);
            }
        }

        info!("encrypt secrets into {:?}", self.encrypted.display());
        cipher.encrypt(&self.plaintext, &self.encrypted).await
    }

    fn discard_plaintext(&self) {
        if self.plaintext.exists() {
            warn!("remove partial secrets at {:?}", self.plaintext.display());
            let _ = remove_file(&self.plaintext);
        }
    }
}

/// Create empty file that only the current user can read.
#[cfg(unix)]
fn reserve_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map(drop)
        .map_err(|err| SecretsError::Create {
            source: err,
            path: path.to_path_buf(),
        })
}

#[cfg(not(unix))]
fn reserve_private(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(drop)
        .map_err(|err| SecretsError::Create {
            source: err,
            path: path.to_path_buf(),
        })
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::{
        fs::{set_permissions, Permissions},
        os::unix::fs::PermissionsExt,
    };

    set_permissions(path, Permissions::from_mode(0o600)).map_err(|err| {
        SecretsError::Permissions {
            source: err,
            path: path.to_path_buf(),
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Secrets materialization error types.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// Neither plaintext nor encrypted secrets exist.
    #[error(
        "no secrets available, neither {:?} nor {:?} exists",
        plaintext.display(),
        encrypted.display()
    )]
    NoSource {
        encrypted: PathBuf,
        plaintext: PathBuf,
    },

    /// Plaintext secrets missing for encryption.
    #[error("no plaintext secrets at {:?} to encrypt", plaintext.display())]
    NoPlaintext { plaintext: PathBuf },

    /// User declined.
    #[error("secrets operation declined by user")]
    Declined,

    /// Cipher program could not be started.
    #[error("failed to start {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Cipher program failed, e.g., wrong passphrase or corrupt input.
    #[error("{program:?} failed with exit code {code:?}")]
    Cipher { program: String, code: Option<i32> },

    /// Decryption reported success without producing plaintext.
    #[error("decryption did not produce {:?}", plaintext.display())]
    NotProduced { plaintext: PathBuf },

    /// Plaintext file could not be created or opened.
    #[error("failed to create private secrets file at {:?}", path.display())]
    Create {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Plaintext permissions could not be restricted.
    #[error("failed to restrict permissions of {:?}", path.display())]
    Permissions {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// User could not be prompted.
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = SecretsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::prompt::AssumeYes;
    use pretty_assertions::assert_eq;
    use std::{
        fs::{read_to_string, write},
        sync::Mutex,
    };

    /// Cipher that copies files, optionally failing after a partial write.
    #[derive(Default)]
    struct CopyCipher {
        fail: bool,
        calls: Mutex<usize>,
    }

    impl SecretCipher for CopyCipher {
        async fn decrypt(&self, encrypted: &Path, plaintext: &Path) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                write(plaintext, "partial").unwrap();
                return Err(SecretsError::Cipher {
                    program: "copy".into(),
                    code: Some(1),
                });
            }

            std::fs::copy(encrypted, plaintext).unwrap();
            Ok(())
        }

        async fn encrypt(&self, plaintext: &Path, encrypted: &Path) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            std::fs::copy(plaintext, encrypted).unwrap();
            Ok(())
        }
    }

    struct AssumeNo;

    impl Interaction for AssumeNo {
        fn confirm(&self, _message: &str) -> crate::provision::prompt::Result<bool> {
            Ok(false)
        }
    }

    fn gate(dir: &Path) -> SecretsGate {
        SecretsGate::new(dir.join("secrets.env.age"), dir.join("secrets.env"))
    }

    #[tokio::test]
    async fn present_plaintext_is_left_alone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        write(gate.plaintext(), "TOKEN=1")?;
        let cipher = CopyCipher::default();

        let result = gate.materialize(&cipher, &AssumeYes).await?;
        assert_eq!(result, Materialized::AlreadyPresent);
        assert_eq!(*cipher.calls.lock().unwrap(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn encrypted_secrets_are_decrypted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        write(gate.encrypted(), "TOKEN=2")?;

        let result = gate.materialize(&CopyCipher::default(), &AssumeYes).await?;
        assert_eq!(result, Materialized::Decrypted);
        assert_eq!(read_to_string(gate.plaintext())?, "TOKEN=2");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = gate.plaintext().metadata()?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn plaintext_is_private_before_decryption_writes() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        struct ModeCipher(Mutex<Option<u32>>);

        impl SecretCipher for ModeCipher {
            async fn decrypt(&self, _encrypted: &Path, plaintext: &Path) -> Result<()> {
                let mode = plaintext.metadata().unwrap().permissions().mode();
                *self.0.lock().unwrap() = Some(mode & 0o777);
                write(plaintext, "TOKEN=4").unwrap();
                Ok(())
            }

            async fn encrypt(&self, _plaintext: &Path, _encrypted: &Path) -> Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        write(gate.encrypted(), "TOKEN=4")?;
        let cipher = ModeCipher(Mutex::new(None));

        gate.materialize(&cipher, &AssumeYes).await?;
        assert_eq!(*cipher.0.lock().unwrap(), Some(0o600));

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn age_cipher_decrypts_through_reserved_file() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let program = dir.path().join("fake-age");
        write(&program, "#!/bin/sh\n[ \"$1\" = \"--decrypt\" ] && cat \"$2\"\n")?;
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))?;
        let gate = gate(dir.path());
        write(gate.encrypted(), "TOKEN=5\n")?;

        let cipher = AgeCipher::new(program.to_string_lossy());
        let result = gate.materialize(&cipher, &AssumeYes).await?;
        assert_eq!(result, Materialized::Decrypted);
        assert_eq!(read_to_string(gate.plaintext())?, "TOKEN=5\n");
        let mode = gate.plaintext().metadata()?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        Ok(())
    }

    #[tokio::test]
    async fn failed_decryption_leaves_no_plaintext() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        write(gate.encrypted(), "TOKEN=3")?;
        let cipher = CopyCipher {
            fail: true,
            ..Default::default()
        };

        let result = gate.materialize(&cipher, &AssumeYes).await;
        assert!(matches!(result, Err(SecretsError::Cipher { .. })));
        assert!(!gate.plaintext().exists());

        Ok(())
    }

    #[tokio::test]
    async fn missing_secrets_are_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());

        let result = gate.materialize(&CopyCipher::default(), &AssumeYes).await;
        assert!(matches!(result, Err(SecretsError::NoSource { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn declined_decryption_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        write(gate.encrypted(), "TOKEN=4")?;
        let cipher = CopyCipher::default();

        let result = gate.materialize(&cipher, &AssumeNo).await;
        assert!(matches!(result, Err(SecretsError::Declined)));
        assert_eq!(*cipher.calls.lock().unwrap(), 0);
        assert!(!gate.plaintext().exists());

        Ok(())
    }

    #[tokio::test]
    async fn seal_requires_plaintext() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let gate = gate(dir.path());
        let cipher = CopyCipher::default();

        let result = gate.seal(&cipher, &AssumeYes).await;
        assert!(matches!(result, Err(SecretsError::NoPlaintext { .. })));

        write(gate.plaintext(), "TOKEN=5")?;
        gate.seal(&cipher, &AssumeYes).await?;
        assert_eq!(read_to_string(gate.encrypted())?, "TOKEN=5");

        write(gate.plaintext(), "TOKEN=6")?;
        let result = gate.seal(&cipher, &AssumeNo).await;
        assert!(matches!(result, Err(SecretsError::Declined)));
        assert_eq!(read_to_string(gate.encrypted())?, "TOKEN=5");

        Ok(())
    }
}
