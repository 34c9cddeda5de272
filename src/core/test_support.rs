/*
 * Test doubles shared by the unit tests of the core modules: a scripted
 * exposure finder, an in-memory external store, an ingest task that records
 * every call, and a leaf operation that logs what was invoked on it.
 */
use super::exposure_finder::{ExposureFinder, ExposureId, FoundExposures};
use super::external::{
    DatasetRef, ExternalError, ExternalStoreOperations, FileDataset, IngestRequest,
    IngestTaskOperations,
};
use super::operation::{Operation, OperationContext, OperationError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    File::create(path).unwrap();
}

/// Name of detector `n` of exposure `id` as produced by `FakeFinder`.
pub fn fake_file(dir: &Path, id: ExposureId, n: usize) -> PathBuf {
    dir.join(format!("exp{id}_det{n}.fits"))
}

/*
 * Recovers the exposure ID from a `fake_file` name, falling back to a numeric
 * parent directory name.
 */
pub fn exposure_of(path: &Path) -> Option<ExposureId> {
    let name = path.file_name()?.to_str()?;
    if let Some(rest) = name.strip_prefix("exp") {
        if let Some((id, _)) = rest.split_once('_') {
            return id.parse().ok();
        }
    }
    path.parent()?.file_name()?.to_str()?.parse().ok()
}

pub struct TestHarness {
    pub ctx: OperationContext,
    pub store: Arc<MockStore>,
    pub task: Arc<MockIngestTask>,
}

pub fn test_harness(work_dir: &Path) -> TestHarness {
    crate::initialize_logging();
    let store = Arc::new(MockStore::default());
    let task = Arc::new(MockIngestTask::new(store.clone()));
    let ctx = OperationContext::new(work_dir.to_path_buf(), store.clone(), task.clone());
    TestHarness { ctx, store, task }
}

pub fn test_context(work_dir: &Path) -> OperationContext {
    test_harness(work_dir).ctx
}

pub struct FakeFinder {
    found: FoundExposures,
    detectors: usize,
    explicit: BTreeMap<ExposureId, BTreeSet<PathBuf>>,
    failing_expand: BTreeSet<ExposureId>,
    find_calls: Arc<Mutex<usize>>,
}

impl FakeFinder {
    pub fn new(found: FoundExposures) -> Self {
        FakeFinder {
            found,
            detectors: 2,
            explicit: BTreeMap::new(),
            failing_expand: BTreeSet::new(),
            find_calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_detectors(mut self, detectors: usize) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn with_files(mut self, exposure_id: ExposureId, files: &[PathBuf]) -> Self {
        self.explicit
            .insert(exposure_id, files.iter().cloned().collect());
        self
    }

    pub fn with_failing_expand(mut self, exposure_id: ExposureId) -> Self {
        self.failing_expand.insert(exposure_id);
        self
    }

    pub fn find_calls(&self) -> Arc<Mutex<usize>> {
        self.find_calls.clone()
    }
}

impl ExposureFinder for FakeFinder {
    fn find(&self, _ctx: &OperationContext) -> Result<FoundExposures> {
        *self.find_calls.lock().unwrap() += 1;
        Ok(self.found.clone())
    }

    fn expand(
        &self,
        _ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        let dir = found
            .get(&exposure_id)
            .ok_or(OperationError::UnknownExposure(exposure_id))?;
        if self.failing_expand.contains(&exposure_id) {
            return Err(OperationError::MissingFile {
                exposure_id,
                path: fake_file(dir, exposure_id, 0),
            });
        }
        if let Some(files) = self.explicit.get(&exposure_id) {
            return Ok(files.clone());
        }
        Ok((0..self.detectors)
            .map(|n| fake_file(dir, exposure_id, n))
            .collect())
    }
}

#[derive(Default)]
pub struct MockStore {
    ingested: Mutex<BTreeMap<String, BTreeSet<ExposureId>>>,
}

impl MockStore {
    pub fn mark_ingested(&self, instrument: &str, ids: &[ExposureId]) {
        self.ingested
            .lock()
            .unwrap()
            .entry(instrument.to_string())
            .or_default()
            .extend(ids.iter().copied());
    }

    pub fn ingested(&self, instrument: &str) -> BTreeSet<ExposureId> {
        self.ingested
            .lock()
            .unwrap()
            .get(instrument)
            .cloned()
            .unwrap_or_default()
    }
}

impl ExternalStoreOperations for MockStore {
    fn query_ingested_exposures(
        &self,
        instrument: &str,
    ) -> std::result::Result<BTreeSet<ExposureId>, ExternalError> {
        Ok(self.ingested(instrument))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    Prep,
    Ingest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestCall {
    pub kind: CallKind,
    pub collection: Option<String>,
    pub paths: BTreeSet<PathBuf>,
}

/*
 * Ingest task that "commits" by marking exposures in a `MockStore`. It can be
 * told to reject some exposures, to misreport the exposure of some files, or
 * to panic on the n-th ingest call (simulating a killed process).
 */
pub struct MockIngestTask {
    store: Arc<MockStore>,
    calls: Mutex<Vec<IngestCall>>,
    rejected: Mutex<BTreeSet<ExposureId>>,
    misreported: Mutex<BTreeSet<ExposureId>>,
    dropped_path: Mutex<BTreeSet<ExposureId>>,
    panic_on_ingest: Mutex<Option<usize>>,
}

impl MockIngestTask {
    pub fn new(store: Arc<MockStore>) -> Self {
        MockIngestTask {
            store,
            calls: Mutex::new(Vec::new()),
            rejected: Mutex::new(BTreeSet::new()),
            misreported: Mutex::new(BTreeSet::new()),
            dropped_path: Mutex::new(BTreeSet::new()),
            panic_on_ingest: Mutex::new(None),
        }
    }

    pub fn reject(&self, exposure_id: ExposureId) {
        self.rejected.lock().unwrap().insert(exposure_id);
    }

    pub fn misreport(&self, exposure_id: ExposureId) {
        self.misreported.lock().unwrap().insert(exposure_id);
    }

    pub fn drop_a_path(&self, exposure_id: ExposureId) {
        self.dropped_path.lock().unwrap().insert(exposure_id);
    }

    /// Panics instead of committing on the `n`-th (0-based) ingest call from now.
    pub fn panic_on_ingest(&self, n: usize) {
        let already = self.ingest_calls().len();
        *self.panic_on_ingest.lock().unwrap() = Some(already + n);
    }

    pub fn calls(&self) -> Vec<IngestCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ingest_calls(&self) -> Vec<IngestCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == CallKind::Ingest)
            .collect()
    }

    pub fn ingested_paths(&self) -> BTreeSet<PathBuf> {
        self.ingest_calls()
            .into_iter()
            .flat_map(|c| c.paths.into_iter())
            .collect()
    }

    fn report(&self, request: &IngestRequest<'_>) -> Vec<FileDataset> {
        let misreported = self.misreported.lock().unwrap().clone();
        let dropped = self.dropped_path.lock().unwrap().clone();
        let mut datasets: Vec<FileDataset> = request
            .paths
            .iter()
            .map(|path| {
                let mut exposure = exposure_of(path).unwrap_or_default();
                if misreported.contains(&exposure) {
                    exposure += 1;
                }
                FileDataset {
                    path: path.clone(),
                    refs: vec![DatasetRef {
                        dataset_type: "raw".to_string(),
                        instrument: request.instrument.to_string(),
                        exposure,
                    }],
                }
            })
            .collect();
        let drop_one = request
            .paths
            .iter()
            .filter_map(|p| exposure_of(p))
            .any(|id| dropped.contains(&id));
        if drop_one {
            datasets.pop();
        }
        datasets
    }

    fn record(&self, kind: CallKind, request: &IngestRequest<'_>) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(IngestCall {
            kind: kind.clone(),
            collection: request.collection.map(str::to_string),
            paths: request.paths.iter().cloned().collect(),
        });
        calls.iter().filter(|c| c.kind == kind).count() - 1
    }
}

impl IngestTaskOperations for MockIngestTask {
    fn prep(
        &self,
        request: &IngestRequest<'_>,
    ) -> std::result::Result<Vec<FileDataset>, ExternalError> {
        self.record(CallKind::Prep, request);
        Ok(self.report(request))
    }

    fn ingest(
        &self,
        request: &IngestRequest<'_>,
    ) -> std::result::Result<Vec<FileDataset>, ExternalError> {
        let index = self.record(CallKind::Ingest, request);
        if *self.panic_on_ingest.lock().unwrap() == Some(index) {
            panic!("simulated kill during ingest call {index}");
        }
        let ids: BTreeSet<ExposureId> = request.paths.iter().filter_map(|p| exposure_of(p)).collect();
        let rejected = self.rejected.lock().unwrap().clone();
        if let Some(id) = ids.iter().find(|id| rejected.contains(*id)) {
            return Err(ExternalError::Rejected(format!("bad header in exposure {id}")));
        }
        let ids: Vec<ExposureId> = ids.into_iter().collect();
        self.store.mark_ingested(request.instrument, &ids);
        Ok(self.report(request))
    }
}

type ErrorFactory = Box<dyn Fn() -> OperationError + Send + Sync>;

/*
 * Leaf operation that appends `"{method} {name}"` to a shared log. It can be
 * made to fail on `run` or to report itself as blocked from `print_status`.
 */
pub struct RecordingOperation {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    failure: Option<ErrorFactory>,
    blocked: Option<String>,
}

impl RecordingOperation {
    pub fn new(name: &str) -> Self {
        RecordingOperation {
            name: name.to_string(),
            log: Arc::new(Mutex::new(Vec::new())),
            failure: None,
            blocked: None,
        }
    }

    pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
        self.log = log;
        self
    }

    pub fn failing_with(
        mut self,
        failure: impl Fn() -> OperationError + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Box::new(failure));
        self
    }

    pub fn blocked_on_status(mut self, reason: &str) -> Self {
        self.blocked = Some(reason.to_string());
        self
    }

    fn note(&self, method: &str) {
        self.log.lock().unwrap().push(format!("{method} {}", self.name));
    }
}

impl Operation for RecordingOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn print_status(
        &self,
        _ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        if let Some(reason) = &self.blocked {
            return Err(OperationError::NotReady(reason.clone()));
        }
        writeln!(out, "{:indent$}{}: not started", "", self.name)?;
        Ok(())
    }

    fn prep(&self, _ctx: &OperationContext) -> Result<()> {
        self.note("prep");
        Ok(())
    }

    fn run(&self, _ctx: &OperationContext) -> Result<()> {
        self.note("run");
        match &self.failure {
            Some(failure) => Err(failure()),
            None => Ok(()),
        }
    }

    fn cleanup(&self, _ctx: &OperationContext) -> Result<()> {
        self.note("cleanup");
        Ok(())
    }
}
