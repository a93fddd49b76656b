//! Agent pull-request control loop.
//!
//! Each subcommand is one run-to-completion step meant to be invoked by an
//! external scheduler. Reports are printed to stdout as JSON; diagnostics go
//! to stderr.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use overseer::branch::{GitBranchRemote, ensure_branch};
use overseer::core::types::RepoId;
use overseer::cycle::{AutoFixStatus, auto_fix_pr, run_feedback_cycle};
use overseer::exit_codes;
use overseer::io::config::{DEFAULT_CONFIG_PATH, OverseerConfig, load_config, resolve_repo};
use overseer::io::git::Git;
use overseer::io::github::GhCli;
use overseer::io::mirror::{GitHubContentsMirror, StateMirror};
use overseer::io::session_client::SessionClient;
use overseer::io::state_store::{load_state, render_state};
use overseer::logging;
use overseer::tracks::{Rotation, StartRequest, TickOptions, start_track_session, tick_tracks};

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "Control loop for autonomous coding agents and their pull requests"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect open agent pull requests and send feedback where needed.
    Feedback {
        /// Decide and report, but send nothing and post nothing.
        #[arg(long)]
        dry_run: bool,
        /// Pull request author to inspect (defaults to the configured author).
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        repo: Option<String>,
    },
    /// Fix one pull request now, printing a JSON report.
    Autofix {
        pr: u64,
        #[arg(long)]
        repo: Option<String>,
    },
    /// Make sure the integration branch exists on the remote.
    EnsureBranch {
        /// Branch name (defaults to the configured integration branch).
        #[arg(long)]
        name: Option<String>,
    },
    /// Keep every track's session moving and rotate personas on the cycle
    /// track.
    Tick {
        #[arg(long)]
        repo: Option<String>,
    },
    /// Start a persona's session on a track from the integration branch.
    Start {
        #[arg(long)]
        track: String,
        #[arg(long)]
        persona: String,
        /// File holding the prompt sent to the new session.
        #[arg(long)]
        prompt_file: PathBuf,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        require_plan_approval: bool,
        #[arg(long)]
        repo: Option<String>,
    },
    /// Print the canonical cycle state.
    State,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

/// Errors returned from here mean the invocation itself was invalid; command
/// failures are reported through the returned exit code.
fn run(cli: Cli) -> Result<i32> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Feedback {
            dry_run,
            author,
            repo,
        } => cmd_feedback(&cfg, dry_run, author, repo.as_deref()),
        Command::Autofix { pr, repo } => cmd_autofix(&cfg, pr, repo.as_deref()),
        Command::EnsureBranch { name } => cmd_ensure_branch(&cfg, name),
        Command::Tick { repo } => cmd_tick(&cfg, repo.as_deref()),
        Command::Start {
            track,
            persona,
            prompt_file,
            title,
            require_plan_approval,
            repo,
        } => {
            let prompt = fs::read_to_string(&prompt_file)
                .with_context(|| format!("read {}", prompt_file.display()))?;
            let repo = repo_identity(&cfg, repo.as_deref())?;
            let request = StartRequest {
                repo: &repo,
                integration_branch: &cfg.integration_branch,
                track: &track,
                persona: &persona,
                prompt,
                title,
                require_plan_approval,
            };
            cmd_start(&cfg, request)
        }
        Command::State => cmd_state(&cfg.state_path),
    }
}

fn cmd_feedback(
    cfg: &OverseerConfig,
    dry_run: bool,
    author: Option<String>,
    repo: Option<&str>,
) -> Result<i32> {
    let repo = repo_identity(cfg, repo)?;
    let git = git(cfg)?;
    let prs = GhCli::new(git.clone(), repo.clone(), cfg.gh_timeout(), &cfg.remote);
    let author = author.unwrap_or_else(|| cfg.author.clone());

    let report = if dry_run {
        run_feedback_cycle(None::<&SessionClient>, &prs, &repo, &author)
    } else {
        let sessions = SessionClient::from_config(&cfg.session)?;
        let remote = GitBranchRemote::new(git, &cfg.remote, &cfg.default_branch);
        if let Err(err) = ensure_branch(&remote, &cfg.integration_branch) {
            warn!(err = format!("{err:#}"), "integration branch unavailable");
        }
        run_feedback_cycle(Some(&sessions), &prs, &repo, &author)
    };
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_autofix(cfg: &OverseerConfig, pr: u64, repo: Option<&str>) -> Result<i32> {
    let repo = repo_identity(cfg, repo)?;
    let sessions = SessionClient::from_config(&cfg.session)?;
    let prs = GhCli::new(git(cfg)?, repo.clone(), cfg.gh_timeout(), &cfg.remote);
    let report = auto_fix_pr(&sessions, &prs, &repo, pr);
    print_json(&report)?;
    Ok(match report.status {
        AutoFixStatus::Error => exit_codes::FAILED,
        AutoFixStatus::Success | AutoFixStatus::Skipped => exit_codes::OK,
    })
}

fn cmd_ensure_branch(cfg: &OverseerConfig, name: Option<String>) -> Result<i32> {
    let name = name.unwrap_or_else(|| cfg.integration_branch.clone());
    let remote = branch_remote(cfg)?;
    match ensure_branch(&remote, &name) {
        Ok(status) => {
            print_json(&serde_json::json!({ "branch": name, "status": status }))?;
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err:#}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_tick(cfg: &OverseerConfig, repo: Option<&str>) -> Result<i32> {
    let repo = repo_identity(cfg, repo)?;
    let sessions = SessionClient::from_config(&cfg.session)?;
    let git = git(cfg)?;
    let prs = GhCli::new(git.clone(), repo.clone(), cfg.gh_timeout(), &cfg.remote);
    let mirror = GitHubContentsMirror::from_config(&cfg.mirror, &repo, &cfg.integration_branch)?;
    let remote = GitBranchRemote::new(git, &cfg.remote, &cfg.default_branch);
    let rotation = cfg.rotation.enabled().then(|| Rotation {
        branch_remote: &remote,
        repo: &repo,
        integration_branch: &cfg.integration_branch,
        track: &cfg.rotation.track,
        personas: &cfg.rotation.personas,
        prompts_dir: &cfg.rotation.prompts_dir,
    });
    let opts = TickOptions {
        author: &cfg.author,
        now: Utc::now(),
        session_timeout: cfg.rotation.session_timeout(),
    };
    let report = tick_tracks(
        &cfg.state_path,
        mirror.as_ref().map(|m| m as &dyn StateMirror),
        &sessions,
        Some(&prs),
        &opts,
        rotation.as_ref(),
    )?;
    print_json(&report)?;
    Ok(if report.rotation_failed() {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    })
}

fn cmd_start(cfg: &OverseerConfig, request: StartRequest<'_>) -> Result<i32> {
    let sessions = SessionClient::from_config(&cfg.session)?;
    let remote = branch_remote(cfg)?;
    let mirror =
        GitHubContentsMirror::from_config(&cfg.mirror, request.repo, &cfg.integration_branch)?;
    match start_track_session(
        &cfg.state_path,
        mirror.as_ref().map(|m| m as &dyn StateMirror),
        &remote,
        &sessions,
        request,
    ) {
        Ok(report) => {
            print_json(&report)?;
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err:#}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn cmd_state(state_path: &Path) -> Result<i32> {
    print!("{}", render_state(&load_state(state_path))?);
    Ok(exit_codes::OK)
}

fn repo_identity(cfg: &OverseerConfig, flag: Option<&str>) -> Result<RepoId> {
    let env_repo = env::var("GITHUB_REPOSITORY").ok();
    let explicit = [flag, env_repo.as_deref(), cfg.repository.as_deref()]
        .into_iter()
        .flatten()
        .any(|raw| !raw.trim().is_empty());
    let remote_url = if explicit {
        None
    } else {
        remote_url(cfg)
    };
    resolve_repo(flag, env_repo.as_deref(), cfg, remote_url.as_deref())
}

/// URL of the configured remote in the working directory, if any.
fn remote_url(cfg: &OverseerConfig) -> Option<String> {
    let key = format!("remote.{}.url", cfg.remote);
    git(cfg)
        .and_then(|git| git.config_get(&key))
        .unwrap_or_else(|err| {
            warn!(err = format!("{err:#}"), "reading remote url failed");
            None
        })
}

fn git(cfg: &OverseerConfig) -> Result<Git> {
    Ok(Git::new(workdir()?, cfg.git_timeout()))
}

fn branch_remote(cfg: &OverseerConfig) -> Result<GitBranchRemote> {
    Ok(GitBranchRemote::new(git(cfg)?, &cfg.remote, &cfg.default_branch))
}

fn workdir() -> Result<PathBuf> {
    env::current_dir().context("resolve working directory")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize report")?;
    println!("{payload}");
    Ok(())
}
