use crate::core::{
    AdminConfig, ConfigError, ConfigManagerOperations, ExternalStoreOperations,
    IngestTaskOperations, Operation, OperationContext, OperationError, OperationRegistry,
    RepoConfig,
};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

const APP_NAME: &str = "repo-admin";

/// What the user asked for; `None` targets the repository's root operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status(Option<String>),
    Prep(Option<String>),
    Run(Option<String>),
    Cleanup(Option<String>),
    List,
}

impl AdminCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            AdminCommand::Status(_) => "status",
            AdminCommand::Prep(_) => "prep",
            AdminCommand::Run(_) => "run",
            AdminCommand::Cleanup(_) => "cleanup",
            AdminCommand::List => "list",
        }
    }

    fn target(&self) -> Option<&str> {
        match self {
            AdminCommand::Status(name)
            | AdminCommand::Prep(name)
            | AdminCommand::Run(name)
            | AdminCommand::Cleanup(name) => name.as_deref(),
            AdminCommand::List => None,
        }
    }
}

/// Options that select and drive a repository, as given on the command line.
#[derive(Debug, Clone, Default)]
pub struct AdminSettings {
    pub config_path: Option<PathBuf>,
    pub repo: Option<String>,
    pub date: Option<String>,
    pub dry_run: bool,
    pub jobs: usize,
}

#[derive(Debug)]
pub enum AdminError {
    Config(ConfigError),
    Operation(OperationError),
    Io(io::Error),
}

impl From<ConfigError> for AdminError {
    fn from(err: ConfigError) -> Self {
        AdminError::Config(err)
    }
}

impl From<OperationError> for AdminError {
    fn from(err: OperationError) -> Self {
        AdminError::Operation(err)
    }
}

impl From<io::Error> for AdminError {
    fn from(err: io::Error) -> Self {
        AdminError::Io(err)
    }
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminError::Config(e) => write!(f, "{e}"),
            AdminError::Operation(e) => write!(f, "{e}"),
            AdminError::Io(e) => write!(f, "Output error: {e}"),
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdminError::Config(e) => Some(e),
            AdminError::Operation(e) => Some(e),
            AdminError::Io(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, AdminError>;

/*
 * Front-end logic of the administration tool. It locates and loads the
 * configuration through a `ConfigManagerOperations`, builds the selected
 * repository's operation tree, resolves the target operation by name and
 * invokes the requested method on it. The external collaborators default to
 * the repository's ledger and can be injected instead.
 */
pub struct AdminLogic {
    pub(crate) config_manager: Arc<dyn ConfigManagerOperations>,
    pub(crate) collaborators: Option<(
        Arc<dyn ExternalStoreOperations>,
        Arc<dyn IngestTaskOperations>,
    )>,
}

impl AdminLogic {
    pub fn new(config_manager: Arc<dyn ConfigManagerOperations>) -> Self {
        AdminLogic {
            config_manager,
            collaborators: None,
        }
    }

    pub fn with_collaborators(
        mut self,
        store: Arc<dyn ExternalStoreOperations>,
        ingest_task: Arc<dyn IngestTaskOperations>,
    ) -> Self {
        self.collaborators = Some((store, ingest_task));
        self
    }

    /*
     * Loads the configuration (explicit path, else the platform default) and
     * selects the repository named by the settings.
     */
    pub fn load_repo(&self, settings: &AdminSettings) -> Result<RepoConfig> {
        let path = match &settings.config_path {
            Some(path) => path.clone(),
            None => self
                .config_manager
                .default_config_path(APP_NAME)
                .ok_or(ConfigError::NoConfigFile)?,
        };
        log::debug!("AdminLogic: Using configuration {path:?}.");
        let config: AdminConfig = self.config_manager.load_config(&path)?;
        let repo = config.select_repo(settings.repo.as_deref(), settings.date.as_deref())?;
        log::info!(
            "AdminLogic: Administering repository {} ({}) in {:?}.",
            repo.name,
            repo.date,
            repo.work_dir()
        );
        Ok(repo.clone())
    }

    fn context(&self, repo: &RepoConfig, settings: &AdminSettings) -> Result<OperationContext> {
        let (store, ingest_task) = match &self.collaborators {
            Some((store, task)) => (store.clone(), task.clone()),
            None => {
                let ledger = Arc::new(repo.build_ledger()?);
                let store: Arc<dyn ExternalStoreOperations> = ledger.clone();
                let task: Arc<dyn IngestTaskOperations> = ledger;
                (store, task)
            }
        };
        Ok(OperationContext::new(repo.work_dir(), store, ingest_task)
            .with_dry_run(settings.dry_run)
            .with_jobs(settings.jobs))
    }

    /*
     * Executes `command` against `repo`, writing listings and status reports
     * to `out`. Errors from the operation are returned unchanged.
     */
    pub fn execute(
        &self,
        repo: &RepoConfig,
        settings: &AdminSettings,
        command: &AdminCommand,
        out: &mut dyn Write,
    ) -> Result<()> {
        let root = repo.build_operations()?;
        let registry = OperationRegistry::build(&root)?;
        if *command == AdminCommand::List {
            for name in registry.names() {
                writeln!(out, "{name}")?;
            }
            return Ok(());
        }

        let target_name = command.target().unwrap_or(&repo.name);
        let target = registry.get(target_name)?;
        let ctx = self.context(repo, settings)?;
        if !ctx.dry_run && matches!(command, AdminCommand::Prep(_) | AdminCommand::Run(_)) {
            fs::create_dir_all(&ctx.work_dir)?;
        }
        log::info!(
            "AdminLogic: {} {target_name}{}.",
            command.verb(),
            if ctx.dry_run { " (dry run)" } else { "" }
        );
        match command {
            AdminCommand::Status(_) => Self::print_status(target, &ctx, out),
            AdminCommand::Prep(_) => Ok(target.prep(&ctx)?),
            AdminCommand::Run(_) => Ok(target.run(&ctx)?),
            AdminCommand::Cleanup(_) => Ok(target.cleanup(&ctx)?),
            AdminCommand::List => Ok(()),
        }
    }

    /*
     * A target that is itself blocked is reported the way a group reports a
     * blocked child, rather than as a failure.
     */
    fn print_status(target: &dyn Operation, ctx: &OperationContext, out: &mut dyn Write) -> Result<()> {
        match target.print_status(ctx, 0, out) {
            Ok(()) => Ok(()),
            Err(OperationError::NotReady(reason)) => {
                writeln!(out, "{}: blocked; {reason}", target.name())?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
