/*
 * Interfaces to the data repository that raw files are ingested into. The
 * engine never talks to a repository directly: it asks an
 * `ExternalStoreOperations` which exposures are already present, and hands
 * file lists to an `IngestTaskOperations` which validates or commits them.
 */
use super::exposure_finder::ExposureId;
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ExternalError {
    Io(io::Error),
    Serde(serde_json::Error),
    /// The task refused the files, e.g. unreadable headers.
    Rejected(String),
    /// A file is already recorded in the store.
    Conflict(PathBuf),
    UnknownInstrument(String),
}

impl From<io::Error> for ExternalError {
    fn from(err: io::Error) -> Self {
        ExternalError::Io(err)
    }
}

impl From<serde_json::Error> for ExternalError {
    fn from(err: serde_json::Error) -> Self {
        ExternalError::Serde(err)
    }
}

impl std::fmt::Display for ExternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExternalError::Io(e) => write!(f, "I/O error: {e}"),
            ExternalError::Serde(e) => write!(f, "Serialization/Deserialization error: {e}"),
            ExternalError::Rejected(reason) => write!(f, "ingest rejected: {reason}"),
            ExternalError::Conflict(path) => write!(f, "{path:?} is already ingested"),
            ExternalError::UnknownInstrument(name) => write!(f, "unknown instrument {name:?}"),
        }
    }
}

impl std::error::Error for ExternalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExternalError::Io(e) => Some(e),
            ExternalError::Serde(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExternalError>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DatasetRef {
    pub dataset_type: String,
    pub instrument: String,
    pub exposure: ExposureId,
}

/// One file as reported by the ingest task, with the datasets it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataset {
    pub path: PathBuf,
    pub refs: Vec<DatasetRef>,
}

impl FileDataset {
    pub fn exposure_ids(datasets: &[FileDataset]) -> BTreeSet<ExposureId> {
        datasets
            .iter()
            .flat_map(|d| d.refs.iter().map(|r| r.exposure))
            .collect()
    }

    pub fn paths(datasets: &[FileDataset]) -> BTreeSet<PathBuf> {
        datasets.iter().map(|d| d.path.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestRequest<'a> {
    pub instrument: &'a str,
    pub collection: Option<&'a str>,
    pub paths: &'a [PathBuf],
    pub jobs: usize,
}

pub trait ExternalStoreOperations: Send + Sync {
    fn query_ingested_exposures(&self, instrument: &str) -> Result<BTreeSet<ExposureId>>;
}

pub trait IngestTaskOperations: Send + Sync {
    /*
     * Validates the files and reports the datasets an ingest would create,
     * without modifying the store.
     */
    fn prep(&self, request: &IngestRequest<'_>) -> Result<Vec<FileDataset>>;

    /*
     * Commits the files and reports one `FileDataset` per committed file.
     */
    fn ingest(&self, request: &IngestRequest<'_>) -> Result<Vec<FileDataset>>;
}
