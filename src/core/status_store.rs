/*
 * Durable per-operation status, kept as zero-size marker files in the working
 * directory. A name has at most one marker, `{name}.in_progress`,
 * `{name}.interrupted` or `{name}.done`; no marker means the operation has not
 * started. The only state transition primitive is a rename of the marker.
 */
use super::operation::{OperationError, Result};
use std::fs::{self, File};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotStarted,
    InProgress,
    Interrupted,
    Done,
}

impl Status {
    /*
     * File extension used for the status marker, or `None` for `NotStarted`
     * which is represented by the absence of any marker.
     */
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Status::NotStarted => None,
            Status::InProgress => Some("in_progress"),
            Status::Interrupted => Some("interrupted"),
            Status::Done => Some("done"),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::NotStarted => write!(f, "not started"),
            Status::InProgress => write!(f, "in progress"),
            Status::Interrupted => write!(f, "interrupted"),
            Status::Done => write!(f, "done"),
        }
    }
}

pub trait StatusStoreOperations: Send + Sync {
    fn check(&self, name: &str) -> Status;

    /*
     * Runs `body` with the IN_PROGRESS marker held. On return the marker
     * becomes DONE if `body` succeeded and INTERRUPTED if it returned an error
     * or panicked; the error or panic is then propagated unchanged.
     */
    fn run_context(&self, name: &str, body: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn cleanup(&self, name: &str) -> Result<()>;
}

pub struct CoreStatusStore {
    work_dir: PathBuf,
    dry_run: bool,
}

impl CoreStatusStore {
    pub fn new(work_dir: PathBuf, dry_run: bool) -> Self {
        CoreStatusStore { work_dir, dry_run }
    }

    fn marker_path(&self, name: &str, label: &str) -> PathBuf {
        self.work_dir.join(format!("{name}.{label}"))
    }

    fn remove_if_present(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl StatusStoreOperations for CoreStatusStore {
    fn check(&self, name: &str) -> Status {
        [Status::Done, Status::InProgress, Status::Interrupted]
            .into_iter()
            .find(|status| {
                status
                    .label()
                    .is_some_and(|label| self.marker_path(name, label).exists())
            })
            .unwrap_or(Status::NotStarted)
    }

    fn run_context(&self, name: &str, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        if self.dry_run {
            log::debug!("StatusStore: Dry run of {name:?}, status markers untouched.");
            return body();
        }
        let in_progress = self.marker_path(name, "in_progress");
        let interrupted = self.marker_path(name, "interrupted");
        let done = self.marker_path(name, "done");
        if in_progress.exists() {
            return Err(OperationError::IncompleteOperation(format!(
                "{name} is already marked in progress ({in_progress:?}); \
                 another process may be running it, or a previous run crashed"
            )));
        }

        fs::create_dir_all(&self.work_dir)?;
        Self::remove_if_present(&done)?;
        Self::remove_if_present(&interrupted)?;
        File::create(&in_progress)?;
        log::debug!("StatusStore: {name:?} entered in progress.");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body()));
        match outcome {
            Ok(Ok(())) => {
                fs::rename(&in_progress, &done)?;
                log::debug!("StatusStore: {name:?} is done.");
                Ok(())
            }
            Ok(Err(e)) => {
                if let Err(rename_err) = fs::rename(&in_progress, &interrupted) {
                    log::error!(
                        "StatusStore: Failed to mark {name:?} interrupted: {rename_err}"
                    );
                }
                log::debug!("StatusStore: {name:?} interrupted by error: {e}");
                Err(e)
            }
            Err(payload) => {
                if let Err(rename_err) = fs::rename(&in_progress, &interrupted) {
                    log::error!(
                        "StatusStore: Failed to mark {name:?} interrupted: {rename_err}"
                    );
                }
                log::debug!("StatusStore: {name:?} interrupted by panic.");
                panic::resume_unwind(payload)
            }
        }
    }

    fn cleanup(&self, name: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        for label in ["in_progress", "interrupted", "done"] {
            Self::remove_if_present(&self.marker_path(name, label))?;
        }
        log::debug!("StatusStore: Cleared status markers for {name:?}.");
        Ok(())
    }
}
