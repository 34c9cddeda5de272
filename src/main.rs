// src/main.rs

mod app_logic;
mod core;

use crate::app_logic::{AdminCommand, AdminLogic, AdminSettings};
use crate::core::{CoreConfigManager, RepoConfig, path_utils};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Prepare, run and inspect the batch operations of an ingest repository.
#[derive(Parser, Debug)]
#[command(name = "repo-admin", version, about)]
struct Cli {
    /// Configuration file; defaults to repo-admin.json in the user config dir.
    #[arg(long, global = true, env = "REPO_ADMIN_CONFIG")]
    config: Option<PathBuf>,

    /// Repository to administer when the configuration holds several.
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Dated instance of the repository.
    #[arg(long, global = true, env = "REPO_ADMIN_DATE")]
    date: Option<String>,

    /// Directory receiving the debug log file.
    #[arg(long, global = true, default_value = ".")]
    log_path: PathBuf,

    /// Validate and log what would happen without changing anything.
    #[arg(short = 'n', long, global = true)]
    dry_run: bool,

    /// Parallelism hint handed to the ingest collaborator.
    #[arg(short = 'j', long, global = true, default_value_t = 1)]
    jobs: usize,

    /// Also log progress to the terminal.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the status of an operation and everything below it.
    Status { name: Option<String> },
    /// Do the expensive preparation work of an operation.
    Prep { name: Option<String> },
    /// Run an operation, resuming where a previous run stopped.
    Run { name: Option<String> },
    /// Forget the progress of an operation.
    Cleanup { name: Option<String> },
    /// List every operation name of the repository.
    List,
}

impl From<Cmd> for AdminCommand {
    fn from(cmd: Cmd) -> Self {
        match cmd {
            Cmd::Status { name } => AdminCommand::Status(name),
            Cmd::Prep { name } => AdminCommand::Prep(name),
            Cmd::Run { name } => AdminCommand::Run(name),
            Cmd::Cleanup { name } => AdminCommand::Cleanup(name),
            Cmd::List => AdminCommand::List,
        }
    }
}

/*
 * Sets up logging for tests. Safe to call from every test; only the first call
 * installs the logger.
 */
#[cfg(test)]
pub fn initialize_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = simplelog::TestLogger::init(LevelFilter::Debug, simplelog::Config::default());
    });
}

/*
 * Terminal output is kept to warnings unless `verbose` is set. The full debug
 * log of a repository instance goes to `{log_path}/{repo}_{date}.log`.
 */
fn init_cli_logging(cli: &Cli, repo: &RepoConfig) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_format_custom(time::macros::format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();
    let term_level = if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    let file = path_utils::open_log_file(&cli.log_path, &repo.name, &repo.date).with_context(|| {
        format!(
            "Cannot open log file {:?}",
            path_utils::log_file_path(&cli.log_path, &repo.name, &repo.date)
        )
    })?;

    CombinedLogger::init(vec![
        TermLogger::new(
            term_level,
            config.clone(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug, config, file),
    ])
    .context("Cannot install logger")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = AdminSettings {
        config_path: cli.config.clone(),
        repo: cli.repo.clone(),
        date: cli.date.clone(),
        dry_run: cli.dry_run,
        jobs: cli.jobs.max(1),
    };

    let logic = AdminLogic::new(Arc::new(CoreConfigManager::new()));
    let repo = logic
        .load_repo(&settings)
        .context("Cannot load the repository configuration")?;
    init_cli_logging(&cli, &repo)?;

    let command = AdminCommand::from(cli.cmd);
    let target = match &command {
        AdminCommand::Status(Some(name))
        | AdminCommand::Prep(Some(name))
        | AdminCommand::Run(Some(name))
        | AdminCommand::Cleanup(Some(name)) => name.clone(),
        _ => repo.name.clone(),
    };
    let mut stdout = std::io::stdout().lock();
    logic
        .execute(&repo, &settings, &command, &mut stdout)
        .with_context(|| format!("{} {target} failed", command.verb()))?;
    log::info!("Main: {} {target} finished.", command.verb());
    Ok(())
}
