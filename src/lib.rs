pub mod archive;
pub mod config;
pub mod interrupt;
pub mod logging;
pub mod remote;
pub mod retention;
pub mod schedule;
pub mod upload;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use tracing::{error, info, warn};

use archive::{Archiver, TarArchiver};
use config::{ApiKey, BackupConfig};
use interrupt::InterruptFlag;
use remote::{RemoteFile, RemoteStore, UploadThingClient};
use retention::{RemoteRetentionOutcome, RetentionEngine};
use schedule::{CronJob, JobKind};
use upload::{CycleOutcome, UploadOrchestrator};

/// Cycle finished: upload confirmed, or a non-backup command succeeded.
pub const EXIT_OK: u8 = 0;
/// Missing credential, source directory, archiver failure or bad config.
pub const EXIT_PRECONDITION: u8 = 1;
/// Upload unresolved after polling; local archive kept.
pub const EXIT_RETAINED: u8 = 3;
/// Prepare or transfer failed outright; local archive kept.
pub const EXIT_FAILED: u8 = 4;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "offsite",
    version,
    about = "Back up a directory to remote object storage and enforce retention"
)]
pub struct Cli {
    /// Config file (defaults to $OFFSITE_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Also append logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Defaults to `backup`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Archive the source directory and upload it
    Backup,
    /// Delete old local archives and the oldest remote file beyond the window
    Prune {
        /// Skip remote retention (no credential needed)
        #[arg(long)]
        local_only: bool,
    },
    /// List remote files, oldest first
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage cron entries for backup and prune
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    /// Print the managed crontab lines without installing them
    Show,
    /// Install or replace the managed crontab lines
    Install,
    /// Remove the managed crontab lines
    Remove,
}

/// Load `.env` from the working directory, then from the config directory.
/// Variables already set in the environment win.
pub fn load_env_files() {
    let _ = dotenvy::dotenv();
    if let Some(path) = config::default_env_file()
        && path.is_file()
    {
        let _ = dotenvy::from_path(path);
    }
}

pub fn run(cli: Cli) -> Result<ExitCode> {
    let command = cli.command.clone().unwrap_or(Commands::Backup);

    match command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "offsite", &mut std::io::stdout());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Man => {
            let man = clap_mangen::Man::new(Cli::command());
            man.render(&mut std::io::stdout())?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let loaded = BackupConfig::load(cli.config.as_deref());
    let log_file = cli.log_file.clone().or_else(|| {
        loaded
            .as_ref()
            .ok()
            .and_then(|config| config.logging.file.clone())
    });
    let _log_guard = logging::init(cli.verbose, log_file.as_deref())?;

    let config = match loaded {
        Ok(config) => config,
        Err(e) => return Ok(precondition_failed(&e)),
    };

    let result = match command {
        Commands::Backup => run_backup(&config),
        Commands::Prune { local_only } => run_prune(&config, local_only),
        Commands::List { json } => run_list(&config, json),
        Commands::Schedule { action } => run_schedule(&config, cli.config.as_deref(), action),
        Commands::Completions { .. } | Commands::Man => Ok(ExitCode::SUCCESS),
    };

    result.or_else(|e| {
        error!("{e:#}");
        Ok(ExitCode::from(EXIT_PRECONDITION))
    })
}

/// Exit code for a finished backup cycle.
pub fn exit_code_for(outcome: &CycleOutcome) -> u8 {
    match outcome {
        CycleOutcome::Uploaded { .. } => EXIT_OK,
        CycleOutcome::Retained { .. } => EXIT_RETAINED,
        CycleOutcome::Failed { .. } => EXIT_FAILED,
    }
}

fn precondition_failed(err: &dyn std::fmt::Display) -> ExitCode {
    error!(error = %err, "precondition failed; nothing was uploaded");
    ExitCode::from(EXIT_PRECONDITION)
}

fn run_backup(config: &BackupConfig) -> Result<ExitCode> {
    let api_key = match ApiKey::from_env() {
        Ok(key) => key,
        Err(e) => return Ok(precondition_failed(&e)),
    };
    let source = match config.require_source_dir() {
        Ok(source) => source,
        Err(e) => return Ok(precondition_failed(&e)),
    };

    let interrupt = InterruptFlag::new();
    if let Err(e) = interrupt::spawn_ctrl_c_listener(interrupt.clone()) {
        warn!(error = %e, "could not install interrupt handler");
    }

    let client = UploadThingClient::new(&config.remote, api_key)
        .context("creating remote store client")?
        .with_interrupt(interrupt);

    info!(source = %source.display(), archive_dir = %config.archive_dir.display(), "starting backup");
    let archiver = TarArchiver::new(config.naming()).with_excludes(config.exclude.iter().cloned());
    let archive = match archiver.create(source, &config.archive_dir, Local::now()) {
        Ok(archive) => archive,
        Err(e) => return Ok(precondition_failed(&e)),
    };

    let outcome = UploadOrchestrator::from_config(&client, config).run(archive);
    let code = exit_code_for(&outcome);
    info!(
        exit_code = code,
        archive = %outcome.archive().display(),
        local_deleted = outcome.local_deleted(),
        "backup cycle finished"
    );
    Ok(ExitCode::from(code))
}

fn run_prune(config: &BackupConfig, local_only: bool) -> Result<ExitCode> {
    let client = if local_only {
        None
    } else {
        let api_key = match ApiKey::from_env() {
            Ok(key) => key,
            Err(e) => return Ok(precondition_failed(&e)),
        };
        Some(
            UploadThingClient::new(&config.remote, api_key)
                .context("creating remote store client")?,
        )
    };

    let mut engine: RetentionEngine<'_, UploadThingClient> =
        RetentionEngine::new(config.retention, &config.archive_dir, config.naming());
    if let Some(client) = client.as_ref() {
        engine = engine.with_remote(client);
    }
    let report = engine.run();

    let remote = match &report.remote {
        None => "skipped".to_string(),
        Some(RemoteRetentionOutcome::Deleted { key, .. }) => format!("deleted {key}"),
        Some(RemoteRetentionOutcome::WithinWindow { count }) => format!("{count} within window"),
        Some(other) => format!("{other:?}"),
    };
    info!(
        local_deleted = report.local.deleted.len(),
        local_failed = report.local.failed.len(),
        remote = %remote,
        "retention pass finished"
    );
    Ok(ExitCode::from(EXIT_OK))
}

fn run_list(config: &BackupConfig, json: bool) -> Result<ExitCode> {
    let api_key = match ApiKey::from_env() {
        Ok(key) => key,
        Err(e) => return Ok(precondition_failed(&e)),
    };
    let client =
        UploadThingClient::new(&config.remote, api_key).context("creating remote store client")?;

    let mut files = match client.list_files() {
        Ok(files) => files,
        Err(e) => {
            error!(error = %e, "could not list remote files");
            return Ok(ExitCode::from(EXIT_FAILED));
        }
    };
    sort_oldest_first(&mut files);

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        print!("{}", render_listing(&files));
    }
    Ok(ExitCode::from(EXIT_OK))
}

/// Oldest first; files without an upload time go last.
pub fn sort_oldest_first(files: &mut [RemoteFile]) {
    files.sort_by(|a, b| match (a.uploaded_at, b.uploaded_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.key.cmp(&b.key)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.key.cmp(&b.key),
    });
}

/// Plain-text table of remote files with local-time upload stamps.
pub fn render_listing(files: &[RemoteFile]) -> String {
    let mut out = format!("{:<20}  {:<40}  {}\n", "UPLOADED", "KEY", "NAME");
    for file in files {
        let uploaded = file
            .uploaded_at
            .and_then(|ms| Local.timestamp_millis_opt(ms).single())
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("{uploaded:<20}  {:<40}  {}\n", file.key, file.name));
    }
    out.push_str(&format!("{} file(s)\n", files.len()));
    out
}

fn run_schedule(
    config: &BackupConfig,
    config_path: Option<&Path>,
    action: ScheduleAction,
) -> Result<ExitCode> {
    let executable = std::env::current_exe().context("locating the offsite executable")?;
    let config_path = config_path
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()));

    let jobs = [
        CronJob::new(JobKind::Backup, &config.schedule.backup, &executable, config_path.clone()),
        CronJob::new(JobKind::Prune, &config.schedule.prune, &executable, config_path),
    ];
    let jobs = match jobs.into_iter().collect::<Result<Vec<_>, _>>() {
        Ok(jobs) => jobs,
        Err(e) => return Ok(precondition_failed(&e)),
    };

    match action {
        ScheduleAction::Show => {
            for job in &jobs {
                println!("{}", job.render());
            }
        }
        ScheduleAction::Install => {
            let existing = schedule::read_crontab()?;
            schedule::write_crontab(&schedule::merge_crontab(&existing, &jobs))?;
            for job in &jobs {
                info!(entry = %job.render(), "cron entry installed");
            }
        }
        ScheduleAction::Remove => {
            let existing = schedule::read_crontab()?;
            schedule::write_crontab(&schedule::strip_managed(&existing))?;
            info!("managed cron entries removed");
        }
    }
    Ok(ExitCode::from(EXIT_OK))
}
