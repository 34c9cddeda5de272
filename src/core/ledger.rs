/*
 * A file-backed stand-in for a data repository. The ledger is a JSON document
 * mapping instrument name to exposure ID to the set of raw files ingested for
 * that exposure:
 *
 *   { "HSC": { "102": ["/raw/HSCA00010200.fits", ...] } }
 *
 * `LedgerStore` answers "which exposures are in" and plays the ingest task:
 * `prep` validates files without touching the ledger, `ingest` records them.
 * A file may only be recorded once, mirroring the uniqueness constraint a
 * real repository enforces. Every update replaces the file through a rename.
 */
use super::exposure_finder::{ExposureId, ExposureIdRule};
use super::external::{
    DatasetRef, ExternalError, ExternalStoreOperations, FileDataset, IngestRequest,
    IngestTaskOperations, Result,
};
use super::file_system::{FileSystemError, anchored_regex};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

type Ledger = BTreeMap<String, BTreeMap<ExposureId, BTreeSet<PathBuf>>>;

const RAW_DATASET_TYPE: &str = "raw";

/*
 * Derives the exposure a raw file belongs to: from its file name when the
 * regex matches, otherwise from a numeric parent directory name.
 */
#[derive(Debug, Clone)]
pub struct ExposureIdentifier {
    file_regex: Option<Regex>,
    rule: ExposureIdRule,
}

impl ExposureIdentifier {
    pub fn new(
        file_regex: Option<&str>,
        rule: ExposureIdRule,
    ) -> std::result::Result<Self, FileSystemError> {
        Ok(ExposureIdentifier {
            file_regex: file_regex.map(anchored_regex).transpose()?,
            rule,
        })
    }

    pub fn identify(&self, path: &Path) -> Option<ExposureId> {
        let name = path.file_name()?.to_str()?;
        if let Some(caps) = self.file_regex.as_ref().and_then(|re| re.captures(name)) {
            let text = caps.get(self.rule.group)?.as_str();
            return self.rule.apply(text, path).ok();
        }
        path.parent()?.file_name()?.to_str()?.parse().ok()
    }
}

pub struct LedgerStore {
    path: PathBuf,
    identifiers: BTreeMap<String, ExposureIdentifier>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>, identifiers: BTreeMap<String, ExposureIdentifier>) -> Self {
        LedgerStore {
            path: path.into(),
            identifiers,
        }
    }

    fn load(&self) -> Result<Ledger> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("LedgerStore: {:?} does not exist yet; starting empty.", self.path);
                return Ok(Ledger::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, ledger)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /*
     * Reads nothing but file metadata and names; returns one dataset per file
     * or the first reason the batch cannot be ingested.
     */
    fn describe(&self, request: &IngestRequest<'_>) -> Result<Vec<FileDataset>> {
        let identifier = self
            .identifiers
            .get(request.instrument)
            .ok_or_else(|| ExternalError::UnknownInstrument(request.instrument.to_string()))?;
        request
            .paths
            .iter()
            .map(|path| {
                let metadata = fs::metadata(path)
                    .map_err(|e| ExternalError::Rejected(format!("cannot read {path:?}: {e}")))?;
                if !metadata.is_file() {
                    return Err(ExternalError::Rejected(format!("{path:?} is not a file")));
                }
                let exposure = identifier.identify(path).ok_or_else(|| {
                    ExternalError::Rejected(format!("cannot determine the exposure of {path:?}"))
                })?;
                Ok(FileDataset {
                    path: path.clone(),
                    refs: vec![DatasetRef {
                        dataset_type: RAW_DATASET_TYPE.to_string(),
                        instrument: request.instrument.to_string(),
                        exposure,
                    }],
                })
            })
            .collect()
    }
}

impl ExternalStoreOperations for LedgerStore {
    fn query_ingested_exposures(&self, instrument: &str) -> Result<BTreeSet<ExposureId>> {
        let ledger = self.load()?;
        Ok(ledger
            .get(instrument)
            .map(|exposures| exposures.keys().copied().collect())
            .unwrap_or_default())
    }
}

impl IngestTaskOperations for LedgerStore {
    fn prep(&self, request: &IngestRequest<'_>) -> Result<Vec<FileDataset>> {
        let datasets = self.describe(request)?;
        let ledger = self.load()?;
        if let Some(exposures) = ledger.get(request.instrument) {
            if let Some(path) = request
                .paths
                .iter()
                .find(|p| exposures.values().any(|files| files.contains(*p)))
            {
                return Err(ExternalError::Conflict(path.clone()));
            }
        }
        Ok(datasets)
    }

    fn ingest(&self, request: &IngestRequest<'_>) -> Result<Vec<FileDataset>> {
        let datasets = self.describe(request)?;
        let mut ledger = self.load()?;
        let exposures = ledger.entry(request.instrument.to_string()).or_default();
        if let Some(path) = request
            .paths
            .iter()
            .find(|p| exposures.values().any(|files| files.contains(*p)))
        {
            return Err(ExternalError::Conflict(path.clone()));
        }
        for dataset in &datasets {
            for dataset_ref in &dataset.refs {
                exposures
                    .entry(dataset_ref.exposure)
                    .or_default()
                    .insert(dataset.path.clone());
            }
        }
        self.save(&ledger)?;
        log::debug!(
            "LedgerStore: Recorded {} files of {} (collection {:?}, {} jobs).",
            datasets.len(),
            request.instrument,
            request.collection,
            request.jobs
        );
        Ok(datasets)
    }
}
