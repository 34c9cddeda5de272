/*
 * This module defines the unit of administrative work: the `Operation` trait,
 * the shared `OperationContext` every operation receives, the error type used
 * across the engine, and the flat name-to-operation registry that the command
 * line front end resolves names against.
 *
 * Operations form a forest. Composite operations expose their children through
 * `Operation::nested`, and `flatten` walks the tree lazily in declaration order.
 */
use super::exposure_finder::ExposureId;
use super::external::{ExternalError, ExternalStoreOperations, IngestTaskOperations};
use super::file_system::FileSystemError;
use super::status_store::CoreStatusStore;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/*
 * Error type shared by every operation.
 * The variants fall in three families: precondition failures that status
 * reporting converts into "blocked" (`NotReady`), states that need a human
 * (`IncompleteOperation`, `IngestLogic`), and per-exposure failures that the
 * ingest loop may skip (see `is_fatal`).
 */
#[derive(Debug)]
pub enum OperationError {
    NotReady(String),
    IncompleteOperation(String),
    IngestLogic(String),
    MissingFile {
        exposure_id: ExposureId,
        path: PathBuf,
    },
    UnknownExposure(ExposureId),
    InvalidExposureId {
        path: PathBuf,
        text: String,
    },
    DuplicateExposure {
        exposure_id: ExposureId,
        first: PathBuf,
        second: PathBuf,
    },
    UnknownOperation(String),
    DuplicateOperationName(String),
    External(ExternalError),
    FileSystem(FileSystemError),
    Io(io::Error),
    Serde(serde_json::Error),
}

impl OperationError {
    /*
     * Returns true for errors that must abort the current run.
     * Everything else is scoped to a single exposure and is skipped by the
     * ingest loop, leaving that exposure for the next invocation.
     */
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            OperationError::MissingFile { .. }
                | OperationError::UnknownExposure(_)
                | OperationError::InvalidExposureId { .. }
                | OperationError::External(_)
                | OperationError::FileSystem(_)
                | OperationError::Io(_)
        )
    }
}

impl From<io::Error> for OperationError {
    fn from(err: io::Error) -> Self {
        OperationError::Io(err)
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(err: serde_json::Error) -> Self {
        OperationError::Serde(err)
    }
}

impl From<ExternalError> for OperationError {
    fn from(err: ExternalError) -> Self {
        OperationError::External(err)
    }
}

impl From<FileSystemError> for OperationError {
    fn from(err: FileSystemError) -> Self {
        OperationError::FileSystem(err)
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationError::NotReady(reason) => write!(f, "not ready: {reason}"),
            OperationError::IncompleteOperation(reason) => {
                write!(f, "incomplete operation, manual intervention required: {reason}")
            }
            OperationError::IngestLogic(reason) => write!(f, "ingest logic error: {reason}"),
            OperationError::MissingFile { exposure_id, path } => {
                write!(f, "missing file {path:?} for exposure {exposure_id}")
            }
            OperationError::UnknownExposure(id) => {
                write!(f, "exposure {id} is not present in the found exposures")
            }
            OperationError::InvalidExposureId { path, text } => {
                write!(f, "cannot derive an exposure ID from {text:?} ({path:?})")
            }
            OperationError::DuplicateExposure {
                exposure_id,
                first,
                second,
            } => write!(
                f,
                "found multiple directory paths ({first:?}, {second:?}) for exposure {exposure_id}"
            ),
            OperationError::UnknownOperation(name) => write!(f, "no operation named {name:?}"),
            OperationError::DuplicateOperationName(name) => {
                write!(f, "operation name {name:?} is used by more than one operation")
            }
            OperationError::External(e) => write!(f, "external collaborator error: {e}"),
            OperationError::FileSystem(e) => write!(f, "file system error: {e}"),
            OperationError::Io(e) => write!(f, "I/O error: {e}"),
            OperationError::Serde(e) => write!(f, "Serialization/Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for OperationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OperationError::External(e) => Some(e),
            OperationError::FileSystem(e) => Some(e),
            OperationError::Io(e) => Some(e),
            OperationError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

/*
 * Shared state handed to every operation call: where checkpoint and status
 * files live, whether mutations are suppressed, and the external collaborators.
 */
pub struct OperationContext {
    pub work_dir: PathBuf,
    pub dry_run: bool,
    pub jobs: usize,
    pub store: Arc<dyn ExternalStoreOperations>,
    pub ingest_task: Arc<dyn IngestTaskOperations>,
}

impl OperationContext {
    pub fn new(
        work_dir: PathBuf,
        store: Arc<dyn ExternalStoreOperations>,
        ingest_task: Arc<dyn IngestTaskOperations>,
    ) -> Self {
        OperationContext {
            work_dir,
            dry_run: false,
            jobs: 1,
            store,
            ingest_task,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn status_store(&self) -> CoreStatusStore {
        CoreStatusStore::new(self.work_dir.clone(), self.dry_run)
    }
}

/*
 * A named, idempotent unit of administrative work.
 *
 * `prep` may inspect files and write plans into the work directory but must
 * never modify the external store. `run` does the work. `print_status` reports
 * without side effects and may fail with `NotReady` when an upstream step has
 * not happened yet. `cleanup` removes whatever state the operation persisted.
 */
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    /*
     * Operations nested directly inside this one, in declaration order.
     * Leaf operations keep the default.
     */
    fn nested(&self) -> Vec<&dyn Operation> {
        Vec::new()
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()>;

    fn prep(&self, _ctx: &OperationContext) -> Result<()> {
        Ok(())
    }

    fn run(&self, ctx: &OperationContext) -> Result<()>;

    fn cleanup(&self, _ctx: &OperationContext) -> Result<()> {
        Ok(())
    }
}

/// Lazy pre-order walk over an operation and everything nested in it.
pub struct Flatten<'a> {
    stack: Vec<&'a dyn Operation>,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = &'a dyn Operation;

    fn next(&mut self) -> Option<Self::Item> {
        let op = self.stack.pop()?;
        for child in op.nested().into_iter().rev() {
            self.stack.push(child);
        }
        Some(op)
    }
}

/*
 * Iterates over `op` and then its descendants in declaration order.
 * Calling it again starts a fresh walk.
 */
pub fn flatten(op: &dyn Operation) -> Flatten<'_> {
    Flatten { stack: vec![op] }
}

/*
 * Flat index of every operation in a tree, keyed by name.
 * The same operation reached through two paths is accepted (a shared finder
 * cache, for example); two different operations with one name are rejected.
 */
pub struct OperationRegistry<'a> {
    ordered: Vec<&'a dyn Operation>,
    by_name: BTreeMap<String, &'a dyn Operation>,
}

impl<'a> OperationRegistry<'a> {
    pub fn build(root: &'a dyn Operation) -> Result<Self> {
        let mut ordered = Vec::new();
        let mut by_name: BTreeMap<String, &'a dyn Operation> = BTreeMap::new();
        for op in flatten(root) {
            match by_name.get(op.name()) {
                Some(existing) => {
                    if !std::ptr::addr_eq(*existing, op) {
                        return Err(OperationError::DuplicateOperationName(op.name().to_string()));
                    }
                }
                None => {
                    by_name.insert(op.name().to_string(), op);
                    ordered.push(op);
                }
            }
        }
        log::debug!(
            "OperationRegistry: Registered {} operations under {:?}.",
            ordered.len(),
            root.name()
        );
        Ok(OperationRegistry { ordered, by_name })
    }

    pub fn get(&self, name: &str) -> Result<&'a dyn Operation> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.ordered.iter().map(|op| op.name())
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }
}
