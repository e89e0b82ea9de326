// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Resumable provisioning.
//!
//! A __provisioning run__ walks the step registry in order and executes every
//! step that the checkpoint does not already cover. Each success moves the
//! checkpoint to the step's target, so a run cut short by a reboot, a lost
//! session, or a failing script picks up at the first unfinished step when
//! invoked again.
//!
//! # Run Sequence
//!
//! 1. Verify host preconditions. Always, whatever the checkpoint says.
//! 2. Take the run lock, then load the checkpoint.
//! 3. For each step in registry order:
//!     - skip it if the checkpoint already covers its target,
//!     - skip it with a warning if its optional script is missing,
//!     - otherwise run it, advancing the checkpoint on success and aborting
//!       the whole run on failure.
//! 4. Once the final step's target is reached, remove the checkpoint so the
//!    next invocation starts over.
//!
//! The orchestrator trusts the checkpoint over live system state. Scripts are
//! expected to detect work that is already done on their own.

pub mod exec;
pub mod prompt;
pub mod secrets;
pub mod step;

use crate::{
    checkpoint::{CheckpointStore, Progress},
    config::{Plan, StepAction, StepKind},
    host::PreconditionGate,
    provision::{
        exec::{ExecContext, Executor, Exit, ProcessExecutor},
        prompt::{InquirePrompter, Interaction},
        secrets::{AgeCipher, SecretCipher, SecretsGate},
        step::{Registry, Step},
    },
};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    time::Duration,
};
use tracing::{info, instrument, warn};

/// Provisioning orchestrator.
///
/// Ties a plan's registry, checkpoint, host preconditions, and secrets gate
/// together. Script execution, decryption, and user interaction are injected
/// so a run can be driven without a terminal.
#[derive(Debug)]
pub struct Orchestrator<E = ProcessExecutor, C = AgeCipher, I = InquirePrompter>
where
    E: Executor,
    C: SecretCipher,
    I: Interaction,
{
    plan: Plan,
    registry: Registry,
    host: PreconditionGate,
    store: CheckpointStore,
    secrets: SecretsGate,
    executor: E,
    cipher: C,
    interaction: I,
    bar: ProgressBar,
    show_progress: bool,
}

impl<E, C, I> Orchestrator<E, C, I>
where
    E: Executor,
    C: SecretCipher,
    I: Interaction,
{
    /// Construct new orchestrator for plan.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Registry`] if plan's steps are invalid.
    pub fn new(plan: Plan, executor: E, cipher: C, interaction: I) -> Result<Self> {
        let registry = Registry::from_plan(&plan)?;
        let host = PreconditionGate::new(plan.host.clone());
        let store = CheckpointStore::new(&plan.settings.checkpoint);
        let secrets = SecretsGate::new(plan.encrypted_secrets(), plan.plaintext_secrets());

        Ok(Self {
            plan,
            registry,
            host,
            store,
            secrets,
            executor,
            cipher,
            interaction,
            bar: ProgressBar::hidden(),
            show_progress: false,
        })
    }

    /// Display run progress through target progress bar.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::IndicatifStyleTemplate`] if bar style
    ///   cannot be set.
    pub fn with_progress(mut self, bar: ProgressBar) -> Result<Self> {
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  [{pos}/{len}] {msg:<30}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        self.bar = bar;
        self.show_progress = true;

        Ok(self)
    }

    /// Step registry of plan.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Checkpoint store of plan.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Secrets gate of plan.
    pub fn secrets(&self) -> &SecretsGate {
        &self.secrets
    }

    /// Perform one provisioning run.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Host`] if host preconditions are unmet.
    /// - Return [`ProvisionError::Checkpoint`] if run lock cannot be taken,
    ///   or checkpoint cannot be persisted.
    /// - Return [`ProvisionError::Declined`] if user declines a fresh run.
    /// - Return [`ProvisionError::MissingScript`] if a mandatory step's
    ///   script is missing.
    /// - Return [`ProvisionError::StepFailed`] or
    ///   [`ProvisionError::StepTimedOut`] if a step fails.
    /// - Return [`ProvisionError::Secrets`] if secrets cannot be
    ///   materialized.
    #[instrument(skip(self), level = "debug")]
    pub async fn run(&self) -> Result<RunSummary> {
        self.host.verify()?;

        let _lock = self.store.lock()?;
        let mut progress = Progress::load(self.store.clone());
        let mut summary = RunSummary::new(progress.completed());

        if progress.completed() == 0 {
            let question = format!("Provision this host with {} steps?", self.registry.len());
            if !self.interaction.confirm(&question)? {
                return Err(ProvisionError::Declined);
            }
        } else {
            info!("resume after checkpoint {}", progress.completed());
        }
        info!(
            "{} of {} steps pending",
            self.registry.pending(progress.completed()).count(),
            self.registry.len()
        );

        self.bar.set_length(self.registry.len() as u64);
        self.bar.set_position(0);
        for step in self.registry.iter() {
            self.bar.set_message(step.name.clone());
            self.run_step(step, &mut progress, &mut summary).await?;
            self.bar.inc(1);
        }
        self.bar.finish_and_clear();

        if progress.completed() >= self.registry.final_target() {
            progress.complete()?;
            summary.outcome = Outcome::Complete;
            info!("provisioning complete");
        } else {
            warn!(
                "provisioning stopped at checkpoint {}, final step needs {}",
                progress.completed(),
                self.registry.final_target()
            );
        }

        Ok(summary)
    }

    async fn run_step(
        &self,
        step: &Step,
        progress: &mut Progress,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if progress.is_done(step.target) {
            info!("{}: already done", step.name);
            summary.already_done.push(step.name.clone());
            return Ok(());
        }

        match &step.action {
            StepAction::Script(script) => {
                if !self.executor.locate(script) {
                    if step.kind == StepKind::Mandatory {
                        return Err(ProvisionError::MissingScript {
                            step: step.name.clone(),
                            script: script.clone(),
                        });
                    }

                    warn!(
                        "{}: script {:?} not found, skipping",
                        step.name,
                        script.display()
                    );
                    summary.missing.push(step.name.clone());
                    return Ok(());
                }

                info!("running {step}");
                let context = self.context(step);
                self.hide_progress();
                let exit = self.executor.execute(script, &context).await;
                self.show_progress();

                match exit? {
                    Exit::Success => {}
                    Exit::Failed(code) => {
                        return Err(ProvisionError::StepFailed {
                            step: step.name.clone(),
                            code,
                        });
                    }
                    Exit::TimedOut(limit) => {
                        return Err(ProvisionError::StepTimedOut {
                            step: step.name.clone(),
                            limit,
                        });
                    }
                }
            }
            StepAction::Secrets => {
                self.hide_progress();
                let materialized = self.secrets.materialize(&self.cipher, &self.interaction).await;
                self.show_progress();
                materialized?;
            }
        }

        progress.advance(step.target)?;
        info!("{}: done", step.name);
        summary.executed.push(step.name.clone());

        Ok(())
    }

    /// Report where every step stands relative to the checkpoint.
    pub fn status(&self) -> Status {
        let checkpoint = self.store.get();
        let steps = self
            .registry
            .iter()
            .map(|step| {
                let state = if step.target <= checkpoint {
                    StepState::Done
                } else {
                    match &step.action {
                        StepAction::Script(script) if !self.executor.locate(script) => {
                            StepState::Missing
                        }
                        _ => StepState::Pending,
                    }
                };

                StepStatus {
                    name: step.name.clone(),
                    target: step.target,
                    state,
                }
            })
            .collect();

        Status { checkpoint, steps }
    }

    /// Discard recorded progress so the next run starts over.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Checkpoint`] if a run is in progress, or the
    ///   checkpoint cannot be removed.
    pub fn reset(&self) -> Result<()> {
        let _lock = self.store.lock()?;
        self.store.clear()?;
        info!("checkpoint {:?} cleared", self.store.path().display());

        Ok(())
    }

    /// Decrypt secrets outside of a provisioning run.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Secrets`] if secrets cannot be
    ///   materialized.
    pub async fn decrypt_secrets(&self) -> Result<()> {
        self.secrets.materialize(&self.cipher, &self.interaction).await?;
        Ok(())
    }

    /// Encrypt plaintext secrets.
    ///
    /// # Errors
    ///
    /// - Return [`ProvisionError::Secrets`] if secrets cannot be encrypted.
    pub async fn encrypt_secrets(&self) -> Result<()> {
        self.secrets.seal(&self.cipher, &self.interaction).await?;
        Ok(())
    }

    fn context(&self, step: &Step) -> ExecContext {
        let base_dir = &self.plan.settings.base_dir;
        let mut env = self
            .plan
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.into()))
            .collect::<std::collections::BTreeMap<_, _>>();
        env.insert("HOMELAB_BASE_DIR".into(), base_dir.clone().into_os_string());
        env.insert(
            "HOMELAB_SECRETS_FILE".into(),
            self.secrets.plaintext().as_os_str().to_os_string(),
        );
        env.insert("HOMELAB_STEP".into(), step.name.clone().into());
        env.insert("HOMELAB_CHECKPOINT".into(), step.target.to_string().into());

        ExecContext {
            env,
            working_dir: base_dir.is_dir().then(|| base_dir.clone()),
            timeout: self.plan.settings.step_timeout.map(Duration::from_secs),
        }
    }

    // INVARIANT: Child processes and passphrase prompts own the terminal.
    fn hide_progress(&self) {
        self.bar.set_draw_target(ProgressDrawTarget::hidden());
    }

    fn show_progress(&self) {
        if self.show_progress {
            self.bar.set_draw_target(ProgressDrawTarget::stderr());
        }
    }
}

/// How a run ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Final step reached and checkpoint removed.
    Complete,

    /// Run ended cleanly short of the final step, because trailing optional
    /// scripts were missing.
    #[default]
    Incomplete,
}

/// Record of what a run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Checkpoint the run started from.
    pub resumed_from: u32,

    /// Steps executed during this run.
    pub executed: Vec<String>,

    /// Steps skipped because the checkpoint covered them.
    pub already_done: Vec<String>,

    /// Optional steps skipped because their script was missing.
    pub missing: Vec<String>,

    /// How the run ended.
    pub outcome: Outcome,
}

impl RunSummary {
    fn new(resumed_from: u32) -> Self {
        Self {
            resumed_from,
            ..Default::default()
        }
    }
}

impl Display for RunSummary {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self.outcome {
            Outcome::Complete => writeln!(fmt, "provisioning complete")?,
            Outcome::Incomplete => writeln!(fmt, "provisioning incomplete")?,
        }

        if self.resumed_from > 0 {
            writeln!(fmt, "  resumed after checkpoint {}", self.resumed_from)?;
        }
        writeln!(fmt, "  executed:     {}", listing(&self.executed))?;
        writeln!(fmt, "  already done: {}", listing(&self.already_done))?;
        write!(fmt, "  missing:      {}", listing(&self.missing))
    }
}

fn listing(names: &[String]) -> String {
    if names.is_empty() {
        "-".into()
    } else {
        names.join(", ")
    }
}

/// Where a single step stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Done,
    Pending,
    Missing,
}

/// Status of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepStatus {
    pub name: String,
    pub target: u32,
    pub state: StepState,
}

/// Status of all steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub checkpoint: u32,
    pub steps: Vec<StepStatus>,
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "checkpoint: {}", self.checkpoint)?;
        for step in &self.steps {
            let state = match step.state {
                StepState::Done => "done",
                StepState::Pending => "pending",
                StepState::Missing => "missing",
            };
            write!(fmt, "\n  {:>3}  {:<8} {}", step.target, state, step.name)?;
        }

        Ok(())
    }
}

/// Provisioning error types.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Step registry is invalid.
    #[error(transparent)]
    Registry(#[from] crate::provision::step::RegistryError),

    /// Host preconditions are unmet.
    #[error(transparent)]
    Host(#[from] crate::host::HostError),

    /// Checkpoint cannot be read, written, or locked.
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// Step script cannot be run.
    #[error(transparent)]
    Exec(#[from] crate::provision::exec::ExecError),

    /// Secrets cannot be materialized.
    #[error(transparent)]
    Secrets(#[from] crate::provision::secrets::SecretsError),

    /// User could not be prompted.
    #[error(transparent)]
    Prompt(#[from] crate::provision::prompt::PromptError),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// User declined to start provisioning.
    #[error("provisioning declined by user")]
    Declined,

    /// Mandatory step has no script.
    #[error("step {step:?} is mandatory, but script {:?} is missing", script.display())]
    MissingScript { step: String, script: PathBuf },

    /// Step script exited unsuccessfully.
    #[error("step {step:?} failed with exit code {code:?}, re-run to retry it")]
    StepFailed { step: String, code: Option<i32> },

    /// Step script exceeded time limit.
    #[error("step {step:?} timed out after {limit:?}, re-run to retry it")]
    StepTimedOut { step: String, limit: Duration },
}

/// Friendly result alias :3
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::StepDefinition,
        provision::{prompt::AssumeYes, secrets::SecretsError},
    };
    use pretty_assertions::assert_eq;
    use std::{
        collections::HashSet,
        fs::{create_dir_all, write},
        path::Path,
        sync::Mutex,
    };
    use tempfile::TempDir;

    /// Executor that records invocations instead of spawning processes.
    #[derive(Default)]
    struct FakeExecutor {
        missing: HashSet<String>,
        failing: HashSet<String>,
        hanging: HashSet<String>,
        ran: Mutex<Vec<String>>,
    }

    impl FakeExecutor {
        fn missing(mut self, name: &str) -> Self {
            self.missing.insert(name.into());
            self
        }

        fn failing(mut self, name: &str) -> Self {
            self.failing.insert(name.into());
            self
        }

        fn hanging(mut self, name: &str) -> Self {
            self.hanging.insert(name.into());
            self
        }

        fn ran(&self) -> Vec<String> {
            self.ran.lock().unwrap().clone()
        }
    }

    fn stem(script: &Path) -> String {
        script.file_stem().unwrap().to_string_lossy().into_owned()
    }

    impl Executor for FakeExecutor {
        fn locate(&self, script: &Path) -> bool {
            !self.missing.contains(&stem(script))
        }

        async fn execute(&self, script: &Path, context: &ExecContext) -> exec::Result<Exit> {
            let name = stem(script);
            assert_eq!(context.env["HOMELAB_STEP"], name.as_str());
            self.ran.lock().unwrap().push(name.clone());
            if self.failing.contains(&name) {
                Ok(Exit::Failed(Some(1)))
            } else if self.hanging.contains(&name) {
                Ok(Exit::TimedOut(Duration::from_secs(60)))
            } else {
                Ok(Exit::Success)
            }
        }
    }

    /// Cipher that copies files, or fails like a wrong passphrase.
    #[derive(Default)]
    struct FakeCipher {
        fail: bool,
    }

    impl SecretCipher for FakeCipher {
        async fn decrypt(&self, encrypted: &Path, plaintext: &Path) -> secrets::Result<()> {
            if self.fail {
                return Err(SecretsError::Cipher {
                    program: "fake".into(),
                    code: Some(1),
                });
            }

            std::fs::copy(encrypted, plaintext).unwrap();
            Ok(())
        }

        async fn encrypt(&self, plaintext: &Path, encrypted: &Path) -> secrets::Result<()> {
            std::fs::copy(plaintext, encrypted).unwrap();
            Ok(())
        }
    }

    struct AssumeNo;

    impl Interaction for AssumeNo {
        fn confirm(&self, _message: &str) -> prompt::Result<bool> {
            Ok(false)
        }
    }

    /// Supported host with plan rooted in temporary directory.
    struct Lab {
        dir: TempDir,
        plan: Plan,
    }

    impl Lab {
        fn new(steps: &[(&str, u32)]) -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            write(dir.path().join("os-release"), "ID=debian\n")?;
            create_dir_all(dir.path().join("systemd"))?;

            let mut plan: Plan = Plan::builtin()?;
            plan.settings.base_dir = dir.path().to_path_buf();
            plan.settings.checkpoint = dir.path().join("state").join("checkpoint");
            plan.host.os_release = dir.path().join("os-release");
            plan.host.init_marker = dir.path().join("systemd");
            plan.steps = steps
                .iter()
                .map(|(name, checkpoint)| StepDefinition {
                    name: name.to_string(),
                    checkpoint: *checkpoint,
                    kind: StepKind::Optional,
                    action: if *name == "secrets" {
                        StepAction::Secrets
                    } else {
                        StepAction::Script(format!("{name}.sh").into())
                    },
                })
                .collect();

            Ok(Self { dir, plan })
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn store(&self) -> CheckpointStore {
            CheckpointStore::new(&self.plan.settings.checkpoint)
        }

        fn orchestrator<'a>(
            &self,
            executor: &'a FakeExecutor,
        ) -> anyhow::Result<Orchestrator<&'a FakeExecutor, FakeCipher, AssumeYes>> {
            Ok(Orchestrator::new(
                self.plan.clone(),
                executor,
                FakeCipher::default(),
                AssumeYes,
            )?)
        }
    }

    impl<T: Executor> Executor for &T {
        fn locate(&self, script: &Path) -> bool {
            (**self).locate(script)
        }

        async fn execute(&self, script: &Path, context: &ExecContext) -> exec::Result<Exit> {
            (**self).execute(script, context).await
        }
    }

    const FOUR: &[(&str, u32)] = &[("one", 1), ("two", 2), ("three", 3), ("four", 4)];

    #[tokio::test]
    async fn fresh_run_executes_every_step_and_clears_checkpoint() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default();

        let summary = lab.orchestrator(&executor)?.run().await?;
        assert_eq!(executor.ran(), vec!["one", "two", "three", "four"]);
        assert_eq!(summary.outcome, Outcome::Complete);
        assert_eq!(summary.executed, vec!["one", "two", "three", "four"]);
        assert!(!lab.store().path().exists());
        assert_eq!(lab.store().get(), 0);

        // Completion resets, so the next run starts from scratch.
        let executor = FakeExecutor::default();
        lab.orchestrator(&executor)?.run().await?;
        assert_eq!(executor.ran(), vec!["one", "two", "three", "four"]);

        Ok(())
    }

    #[tokio::test]
    async fn resume_runs_exactly_the_uncovered_steps() -> anyhow::Result<()> {
        for completed in 0..=3 {
            let lab = Lab::new(FOUR)?;
            if completed > 0 {
                lab.store().set(completed)?;
            }
            let executor = FakeExecutor::default();

            let summary = lab.orchestrator(&executor)?.run().await?;
            let expect = FOUR
                .iter()
                .filter(|(_, target)| *target > completed)
                .map(|(name, _)| name.to_string())
                .collect::<Vec<_>>();
            assert_eq!(executor.ran(), expect);
            assert_eq!(summary.resumed_from, completed);
            assert_eq!(summary.already_done.len(), completed as usize);
        }

        Ok(())
    }

    #[tokio::test]
    async fn failing_step_aborts_and_keeps_checkpoint() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default().failing("three");

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(
            result,
            Err(ProvisionError::StepFailed { ref step, code: Some(1) }) if step == "three"
        ));
        assert_eq!(executor.ran(), vec!["one", "two", "three"]);
        assert_eq!(lab.store().get(), 2);

        // Retry starts with the failed step.
        let executor = FakeExecutor::default();
        lab.orchestrator(&executor)?.run().await?;
        assert_eq!(executor.ran(), vec!["three", "four"]);

        Ok(())
    }

    #[tokio::test]
    async fn timed_out_step_aborts_and_keeps_checkpoint() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default().hanging("two");

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(
            result,
            Err(ProvisionError::StepTimedOut { ref step, limit }) if step == "two"
                && limit == Duration::from_secs(60)
        ));
        assert_eq!(executor.ran(), vec!["one", "two"]);
        assert_eq!(lab.store().get(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn missing_optional_script_is_skipped() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default().missing("two").failing("three");

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(result.is_err());
        assert_eq!(executor.ran(), vec!["one", "three"]);
        assert_eq!(lab.store().get(), 1);

        let executor = FakeExecutor::default().missing("two");
        let summary = lab.orchestrator(&executor)?.run().await?;
        assert_eq!(executor.ran(), vec!["three", "four"]);
        assert_eq!(summary.missing, vec!["two"]);
        assert_eq!(summary.outcome, Outcome::Complete);

        Ok(())
    }

    #[tokio::test]
    async fn missing_final_script_leaves_run_incomplete() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default().missing("four");

        let summary = lab.orchestrator(&executor)?.run().await?;
        assert_eq!(summary.outcome, Outcome::Incomplete);
        assert_eq!(lab.store().get(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn missing_mandatory_script_is_fatal() -> anyhow::Result<()> {
        let mut lab = Lab::new(FOUR)?;
        lab.plan.steps[1].kind = StepKind::Mandatory;
        let executor = FakeExecutor::default().missing("two");

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(result, Err(ProvisionError::MissingScript { .. })));
        assert_eq!(executor.ran(), vec!["one"]);
        assert_eq!(lab.store().get(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn checkpoint_only_grows_during_run() -> anyhow::Result<()> {
        let lab = Lab::new(&[("one", 10), ("two", 20), ("three", 30)])?;

        struct Watcher {
            store: CheckpointStore,
            seen: Mutex<Vec<u32>>,
        }

        impl Executor for Watcher {
            fn locate(&self, _script: &Path) -> bool {
                true
            }

            async fn execute(&self, _script: &Path, _context: &ExecContext) -> exec::Result<Exit> {
                self.seen.lock().unwrap().push(self.store.get());
                Ok(Exit::Success)
            }
        }

        let watcher = Watcher {
            store: lab.store(),
            seen: Mutex::new(Vec::new()),
        };
        let orchestrator =
            Orchestrator::new(lab.plan.clone(), watcher, FakeCipher::default(), AssumeYes)?;
        orchestrator.run().await?;
        assert_eq!(*orchestrator.executor.seen.lock().unwrap(), vec![0, 10, 20]);
        assert_eq!(lab.store().get(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn unsupported_host_touches_nothing() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        write(lab.path().join("os-release"), "ID=fedora\n")?;
        lab.store().set(2)?;
        let executor = FakeExecutor::default();

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(result, Err(ProvisionError::Host(_))));
        assert!(executor.ran().is_empty());
        assert_eq!(lab.store().get(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let _lock = lab.store().lock()?;
        let executor = FakeExecutor::default();

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(result, Err(ProvisionError::Checkpoint(_))));
        assert!(executor.ran().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn declined_fresh_run_executes_nothing() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        let executor = FakeExecutor::default();

        let orchestrator =
            Orchestrator::new(lab.plan.clone(), &executor, FakeCipher::default(), AssumeNo)?;
        let result = orchestrator.run().await;
        assert!(matches!(result, Err(ProvisionError::Declined)));
        assert!(executor.ran().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn secrets_gate_blocks_later_steps() -> anyhow::Result<()> {
        let lab = Lab::new(&[("one", 1), ("secrets", 2), ("three", 3)])?;
        write(lab.path().join("secrets.env.age"), "TOKEN=1")?;
        let executor = FakeExecutor::default();

        let orchestrator = Orchestrator::new(
            lab.plan.clone(),
            &executor,
            FakeCipher { fail: true },
            AssumeYes,
        )?;
        let result = orchestrator.run().await;
        assert!(matches!(result, Err(ProvisionError::Secrets(SecretsError::Cipher { .. }))));
        assert_eq!(executor.ran(), vec!["one"]);
        assert_eq!(lab.store().get(), 1);
        assert!(!lab.path().join("secrets.env").exists());

        let summary = lab.orchestrator(&executor)?.run().await?;
        assert_eq!(summary.executed, vec!["secrets", "three"]);
        assert!(lab.path().join("secrets.env").exists());

        Ok(())
    }

    #[tokio::test]
    async fn secrets_without_any_source_are_fatal() -> anyhow::Result<()> {
        let lab = Lab::new(&[("secrets", 1), ("two", 2)])?;
        let executor = FakeExecutor::default();

        let result = lab.orchestrator(&executor)?.run().await;
        assert!(matches!(result, Err(ProvisionError::Secrets(SecretsError::NoSource { .. }))));
        assert!(executor.ran().is_empty());
        assert_eq!(lab.store().get(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn scripts_receive_plan_environment() -> anyhow::Result<()> {
        let lab = Lab::new(&[("one", 7)])?;
        let executor = FakeExecutor::default();
        let orchestrator = lab.orchestrator(&executor)?;
        let step = orchestrator.registry().iter().next().unwrap().clone();

        let context = orchestrator.context(&step);
        assert_eq!(context.env["HOMELAB_CHECKPOINT"], "7");
        assert_eq!(context.env["HOMELAB_RUNTIME"], "podman");
        assert_eq!(context.env["HOMELAB_BASE_DIR"], lab.path().as_os_str());
        assert_eq!(
            context.env["HOMELAB_SECRETS_FILE"],
            lab.path().join("secrets.env").as_os_str()
        );
        assert_eq!(context.working_dir.as_deref(), Some(lab.path()));

        Ok(())
    }

    #[tokio::test]
    async fn status_and_reset() -> anyhow::Result<()> {
        let lab = Lab::new(FOUR)?;
        lab.store().set(2)?;
        let executor = FakeExecutor::default().missing("four");
        let orchestrator = lab.orchestrator(&executor)?;

        let result = orchestrator
            .status()
            .steps
            .into_iter()
            .map(|step| step.state)
            .collect::<Vec<_>>();
        let expect = vec![
            StepState::Done,
            StepState::Done,
            StepState::Pending,
            StepState::Missing,
        ];
        assert_eq!(result, expect);

        orchestrator.reset()?;
        assert_eq!(orchestrator.status().checkpoint, 0);

        Ok(())
    }
}
