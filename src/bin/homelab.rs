// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use homelab::{
    config::Plan,
    path::default_plan_path,
    provision::{
        exec::ProcessExecutor,
        prompt::{AssumeYes, InquirePrompter, Interaction},
        secrets::AgeCipher,
        Orchestrator, Outcome,
    },
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "homelab [options] <homelab-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to provisioning plan.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let plan = load_plan(self.config)?;
        match self.command {
            Command::Run(opts) => run_provision(plan, opts).await,
            Command::Status => run_status(plan),
            Command::Reset(opts) => run_reset(plan, opts),
            Command::Plan => run_plan(plan),
            Command::Secrets(opts) => run_secrets(plan, opts).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Provision host, resuming after last completed step.
    #[command(override_usage = "homelab run [options]")]
    Run(RunOptions),

    /// Show checkpoint and status of each step.
    #[command(override_usage = "homelab status [options]")]
    Status,

    /// Clear checkpoint so next run starts over.
    #[command(override_usage = "homelab reset [options]")]
    Reset(ResetOptions),

    /// Print effective provisioning plan.
    #[command(override_usage = "homelab plan [options]")]
    Plan,

    /// Encrypt or decrypt secrets outside of a run.
    #[command(override_usage = "homelab secrets [options] <encrypt|decrypt>")]
    Secrets(SecretsOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Do not ask for confirmation before starting fresh run.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResetOptions {
    /// Do not ask for confirmation before clearing checkpoint.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SecretsOptions {
    #[command(subcommand)]
    pub action: SecretsAction,
}

#[derive(Debug, Clone, Subcommand)]
enum SecretsAction {
    /// Encrypt plaintext secrets into encrypted secrets.
    Encrypt,

    /// Decrypt encrypted secrets into plaintext secrets.
    Decrypt,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_plan(config: Option<PathBuf>) -> Result<Plan> {
    let path = match config {
        Some(path) if !path.exists() => {
            return Err(anyhow!("plan {:?} does not exist", path.display()));
        }
        Some(path) => path,
        None => default_plan_path()?,
    };

    Ok(Plan::load(path)?)
}

fn cipher(plan: &Plan) -> AgeCipher {
    AgeCipher::new(plan.secrets.program.clone())
}

async fn run_provision(plan: Plan, opts: RunOptions) -> Result<()> {
    let notes = plan.summary.notes.clone();
    let cipher = cipher(&plan);
    let bar = ProgressBar::no_length();

    let summary = if opts.yes {
        Orchestrator::new(plan, ProcessExecutor, cipher, AssumeYes)?
            .with_progress(bar)?
            .run()
            .await?
    } else {
        let prompter = InquirePrompter::new(bar.clone());
        Orchestrator::new(plan, ProcessExecutor, cipher, prompter)?
            .with_progress(bar)?
            .run()
            .await?
    };

    println!("{summary}");
    if summary.outcome == Outcome::Complete && !notes.is_empty() {
        println!("\nnext steps:");
        for note in notes {
            println!("  - {note}");
        }
    }

    Ok(())
}

fn run_status(plan: Plan) -> Result<()> {
    let cipher = cipher(&plan);
    let prompter = InquirePrompter::new(ProgressBar::hidden());
    let orchestrator = Orchestrator::new(plan, ProcessExecutor, cipher, prompter)?;
    println!("{}", orchestrator.status());

    Ok(())
}

fn run_reset(plan: Plan, opts: ResetOptions) -> Result<()> {
    let cipher = cipher(&plan);
    let prompter = InquirePrompter::new(ProgressBar::hidden());
    let orchestrator = Orchestrator::new(plan, ProcessExecutor, cipher, prompter.clone())?;

    let question = format!(
        "Clear checkpoint {:?}? Next run starts from the first step.",
        orchestrator.store().path().display()
    );
    if !opts.yes && !prompter.confirm(&question)? {
        info!("checkpoint left untouched");
        return Ok(());
    }

    orchestrator.reset()?;

    Ok(())
}

fn run_plan(plan: Plan) -> Result<()> {
    print!("{plan}");

    Ok(())
}

async fn run_secrets(plan: Plan, opts: SecretsOptions) -> Result<()> {
    let cipher = cipher(&plan);
    let prompter = InquirePrompter::new(ProgressBar::hidden());
    let orchestrator = Orchestrator::new(plan, ProcessExecutor, cipher, prompter)?;
    match opts.action {
        SecretsAction::Encrypt => orchestrator.encrypt_secrets().await?,
        SecretsAction::Decrypt => orchestrator.decrypt_secrets().await?,
    }

    Ok(())
}
