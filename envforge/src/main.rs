//! `envforge` command line.
//!
//! `envforge run` builds an environment for one task file and writes every
//! attempt plus the final `Dockerfile`, `eval.sh` and `status.json` to the
//! output directory. `envforge init-config` writes a default config.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envforge::core::types::{RunOutcome, TaskSpec};
use envforge::exit_codes;
use envforge::io::config::{ForgeConfig, load_config, write_config};
use envforge::io::container::DockerCli;
use envforge::io::generator::CommandGenerator;
use envforge::io::git::prepare_checkout;
use envforge::io::memory::FileMemoryStore;
use envforge::io::remote::{GithubProbe, ResourceProbe};
use envforge::io::repo_browser::RepoBrowser;
use envforge::logging;
use envforge::workflow::{Collaborators, Workflow};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "envforge",
    version,
    about = "Build and verify fail-to-pass test environments"
)]
struct Cli {
    /// Log progress at info level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate and verify an environment for one task.
    Run {
        /// Task JSON file.
        #[arg(long)]
        task: PathBuf,
        /// Directory receiving attempts and final artifacts.
        #[arg(long)]
        output: PathBuf,
        /// TOML config; defaults apply when absent.
        #[arg(long, default_value = "envforge.toml")]
        config: PathBuf,
        /// Checkout to browse during context collection. Cloned when missing.
        #[arg(long)]
        repo_dir: Option<PathBuf>,
    },
    /// Write a config file with every default spelled out.
    InitConfig {
        #[arg(default_value = "envforge.toml")]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Run {
            task,
            output,
            config,
            repo_dir,
        } => cmd_run(&task, &output, &config, repo_dir.as_deref()),
        Command::InitConfig { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            write_config(&path, &ForgeConfig::default())?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(task_path: &Path, output: &Path, config_path: &Path, repo_dir: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    let raw = fs::read_to_string(task_path).with_context(|| format!("read {}", task_path.display()))?;
    let task: TaskSpec =
        serde_json::from_str(&raw).with_context(|| format!("parse task {}", task_path.display()))?;
    let github_token = std::env::var("GITHUB_TOKEN").ok().filter(|token| !token.is_empty());

    let browser = match repo_dir {
        Some(dir) => match prepare_checkout(&task.repo, &task.base_commit, dir) {
            Ok(git) => Some(RepoBrowser::new(git.workdir())),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "no checkout, context collection runs blind");
                None
            }
        },
        None => None,
    };
    let generator = CommandGenerator::new(
        &config.generator.command,
        config.generator_timeout(),
        config.output_limit_bytes,
    )?;
    let memory = FileMemoryStore::new(&config.results_path, config.memory_lock_timeout());
    let runtime = DockerCli::new(
        config.docker.binary.clone(),
        config.docker.platform.clone(),
        config.output_limit_bytes,
    );
    let probe = if config.disable_download_test_resources {
        None
    } else {
        Some(GithubProbe::new(github_token.clone())?)
    };

    let deps = Collaborators {
        generator: &generator,
        memory: &memory,
        runtime: &runtime,
        probe: probe.as_ref().map(|probe| probe as &dyn ResourceProbe),
        browser: browser.as_ref(),
    };
    let report = Workflow::new(task, config, deps, output, github_token)?.run()?;
    println!("{}", serde_json::to_string(&report.status).context("serialize status")?);
    Ok(match report.status.outcome {
        RunOutcome::Finished => exit_codes::OK,
        RunOutcome::Exhausted => exit_codes::EXHAUSTED,
        RunOutcome::Aborted => exit_codes::ABORTED,
    })
}
