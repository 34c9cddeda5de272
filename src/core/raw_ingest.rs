/*
 * Resumable ingestion of raw files. A `RawIngest` discovers exposures with an
 * `ExposureFinder`, drops the ones the external store already has, and hands
 * the rest to the ingest task one exposure at a time, in chunks of
 * `chunk_size` exposures. Every chunk is bracketed by checkpoint files (see
 * `checkpoint`) so that an interrupted run can continue without replaying
 * committed work, and the whole run is bracketed by status markers.
 *
 * Per-exposure failures (missing files, rejected headers) are logged and the
 * exposure is left for the next run. A task report that does not match what
 * was requested is an `IngestLogic` error and stops the run: the commit has
 * already happened and needs a human.
 */
use super::checkpoint::{CheckpointFiles, ChunkLog};
use super::exposure_finder::{ExposureFinder, ExposureId, FoundExposures};
use super::external::{FileDataset, IngestRequest};
use super::finder_adapters::{PartitionedExposureFinder, SavedExposureFinder};
use super::group::{cleanup_all, prep_all, print_group_status, run_all};
use super::operation::{Operation, OperationContext, OperationError, Result};
use super::status_store::StatusStoreOperations;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

/*
 * Source of file names that other operations have claimed, and which this
 * ingest must therefore leave alone. Fails with `NotReady` while the
 * information needed to decide is not yet on disk.
 */
pub trait FileClaimFilter: Send + Sync {
    fn claimed_elsewhere(&self, ctx: &OperationContext) -> Result<BTreeSet<String>>;
}

pub struct RawIngest {
    name: String,
    finder: Box<dyn ExposureFinder>,
    instrument: String,
    collection: Option<String>,
    chunk_size: usize,
    claim_filter: Option<Box<dyn FileClaimFilter>>,
    require_prep: bool,
}

/// Everything a run needs to decide which files of an exposure to ingest.
struct IngestPlan {
    found: FoundExposures,
    allowed: Option<BTreeSet<PathBuf>>,
    claimed: BTreeSet<String>,
    completed: BTreeSet<PathBuf>,
}

#[derive(Default)]
struct ChunkTally {
    exposures: usize,
    files: usize,
    skipped: usize,
}

impl RawIngest {
    pub fn new(
        name: impl Into<String>,
        finder: Box<dyn ExposureFinder>,
        instrument: impl Into<String>,
    ) -> Self {
        RawIngest {
            name: name.into(),
            finder,
            instrument: instrument.into(),
            collection: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            claim_filter: None,
            require_prep: false,
        }
    }

    pub fn with_collection(mut self, collection: Option<String>) -> Self {
        self.collection = collection;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub(crate) fn set_claim_filter(&mut self, filter: Box<dyn FileClaimFilter>) {
        self.claim_filter = Some(filter);
    }

    /// Makes `run` fail with `NotReady` until `prep` has written the to-do list.
    pub(crate) fn set_require_prep(&mut self, require_prep: bool) {
        self.require_prep = require_prep;
    }

    /*
     * Splits this ingest into `n` children named `{name}-{i}`, each responsible
     * for one contiguous slice of the found exposures.
     */
    pub fn split_into(self, n: usize) -> RawIngestGroup {
        let n = n.max(1);
        let shared: Arc<dyn ExposureFinder> = Arc::from(self.finder);
        let children = (0..n)
            .map(|i| {
                RawIngest::new(
                    format!("{}-{i}", self.name),
                    Box::new(PartitionedExposureFinder::new(shared.clone(), i, n)),
                    self.instrument.clone(),
                )
                .with_collection(self.collection.clone())
                .with_chunk_size(self.chunk_size)
            })
            .collect();
        RawIngestGroup {
            name: self.name,
            children,
            shared,
        }
    }

    /*
     * Returns the same ingest with its finder results cached by a nested
     * operation named `{name}-{suffix}`, which must be run first.
     */
    pub fn save_found(self, suffix: &str) -> RawIngest {
        let cache_name = format!("{}-{suffix}", self.name);
        RawIngest {
            finder: Box::new(SavedExposureFinder::new(cache_name, self.finder)),
            ..self
        }
    }

    pub fn checkpoint(&self, ctx: &OperationContext) -> CheckpointFiles {
        CheckpointFiles::new(&ctx.work_dir, &self.name)
    }

    fn todo_exposures(
        &self,
        ctx: &OperationContext,
        found: &FoundExposures,
    ) -> Result<Vec<ExposureId>> {
        let already_done = ctx.store.query_ingested_exposures(&self.instrument)?;
        Ok(found
            .keys()
            .filter(|id| !already_done.contains(id))
            .copied()
            .collect())
    }

    fn claimed(&self, ctx: &OperationContext) -> Result<BTreeSet<String>> {
        match &self.claim_filter {
            Some(filter) => filter.claimed_elsewhere(ctx),
            None => Ok(BTreeSet::new()),
        }
    }

    fn allowed_paths(&self, checkpoint: &CheckpointFiles) -> Result<Option<BTreeSet<PathBuf>>> {
        let todo = checkpoint.read_todo()?;
        if todo.is_none() && self.require_prep {
            return Err(OperationError::NotReady(format!(
                "{} has not been prepped",
                self.name
            )));
        }
        Ok(todo)
    }

    fn paths_for(
        &self,
        ctx: &OperationContext,
        plan: &IngestPlan,
        exposure_id: ExposureId,
    ) -> Result<BTreeSet<PathBuf>> {
        let expanded = self.finder.expand(ctx, exposure_id, &plan.found)?;
        Ok(expanded
            .into_iter()
            .filter(|p| plan.allowed.as_ref().is_none_or(|allowed| allowed.contains(p)))
            .filter(|p| !plan.completed.contains(p))
            .filter(|p| !is_claimed(&plan.claimed, p))
            .collect())
    }

    /*
     * Ingests (or in a dry run, validates) the remaining files of one exposure
     * and returns how many files were committed.
     */
    fn ingest_exposure(
        &self,
        ctx: &OperationContext,
        plan: &IngestPlan,
        exposure_id: ExposureId,
        chunk_log: Option<&mut ChunkLog>,
    ) -> Result<usize> {
        let paths = self.paths_for(ctx, plan, exposure_id)?;
        if paths.is_empty() {
            log::debug!("RawIngest: {}: nothing left to ingest for exposure {exposure_id}.", self.name);
            return Ok(0);
        }
        let path_list: Vec<PathBuf> = paths.iter().cloned().collect();
        let request = IngestRequest {
            instrument: &self.instrument,
            collection: self.collection.as_deref(),
            paths: &path_list,
            jobs: ctx.jobs,
        };
        if ctx.dry_run {
            let datasets = ctx.ingest_task.prep(&request)?;
            log::info!(
                "RawIngest: {}: would ingest {} files ({} datasets) for exposure {exposure_id}.",
                self.name,
                path_list.len(),
                datasets.len()
            );
            return Ok(0);
        }

        log::debug!(
            "RawIngest: {}: ingesting {} files for exposure {exposure_id}.",
            self.name,
            path_list.len()
        );
        let datasets = ctx.ingest_task.ingest(&request)?;
        let committed: Vec<PathBuf> = datasets.iter().map(|d| d.path.clone()).collect();
        if let Some(chunk_log) = chunk_log {
            chunk_log.record(&committed)?;
        }
        verify_report(exposure_id, &paths, &datasets)?;
        Ok(committed.len())
    }

    fn ingest_chunk(
        &self,
        ctx: &OperationContext,
        plan: &IngestPlan,
        chunk: &[ExposureId],
        mut chunk_log: Option<&mut ChunkLog>,
    ) -> Result<ChunkTally> {
        let mut tally = ChunkTally::default();
        for &exposure_id in chunk {
            match self.ingest_exposure(ctx, plan, exposure_id, chunk_log.as_deref_mut()) {
                Ok(files) => {
                    tally.exposures += 1;
                    tally.files += files;
                }
                Err(e) if !e.is_fatal() => {
                    tally.skipped += 1;
                    log::warn!(
                        "RawIngest: {}: skipping exposure {exposure_id}: {e}",
                        self.name
                    );
                }
                Err(e) => {
                    log::error!(
                        "RawIngest: {}: aborting at exposure {exposure_id}: {e}",
                        self.name
                    );
                    return Err(e);
                }
            }
        }
        Ok(tally)
    }

    fn run_chunks(&self, ctx: &OperationContext) -> Result<()> {
        let checkpoint = self.checkpoint(ctx);
        if !ctx.dry_run && checkpoint.has_stale_marker() {
            return Err(OperationError::IncompleteOperation(format!(
                "{:?} exists from an interrupted chunk of {}",
                checkpoint.in_progress_path(),
                self.name
            )));
        }
        let found = self.finder.find(ctx)?;
        if found.is_empty() {
            log::info!("RawIngest: {}: no exposures found; nothing to do.", self.name);
            return Ok(());
        }
        let todo = self.todo_exposures(ctx, &found)?;
        let plan = IngestPlan {
            allowed: self.allowed_paths(&checkpoint)?,
            claimed: self.claimed(ctx)?,
            completed: checkpoint.read_completed()?,
            found,
        };
        let chunk_count = todo.len().div_ceil(self.chunk_size);
        log::info!(
            "RawIngest: {}: {} of {} exposures to ingest in {chunk_count} chunks.",
            self.name,
            todo.len(),
            plan.found.len()
        );

        let mut total = ChunkTally::default();
        for (index, chunk) in todo.chunks(self.chunk_size).enumerate() {
            log::info!(
                "RawIngest: {}: chunk {}/{chunk_count} ({} exposures).",
                self.name,
                index + 1,
                chunk.len()
            );
            let tally = if ctx.dry_run {
                self.ingest_chunk(ctx, &plan, chunk, None)?
            } else {
                let mut chunk_log = checkpoint.begin_chunk()?;
                let outcome = self.ingest_chunk(ctx, &plan, chunk, Some(&mut chunk_log));
                let finished = checkpoint.finish_chunk(chunk_log);
                let tally = outcome?;
                finished?;
                tally
            };
            total.exposures += tally.exposures;
            total.files += tally.files;
            total.skipped += tally.skipped;
        }
        log::info!(
            "RawIngest: {}: processed {} exposures, committed {} files, skipped {} exposures.",
            self.name,
            total.exposures,
            total.files,
            total.skipped
        );
        Ok(())
    }
}

fn is_claimed(claimed: &BTreeSet<String>, path: &std::path::Path) -> bool {
    path.file_name()
        .is_some_and(|name| claimed.contains(&*name.to_string_lossy()))
}

/*
 * Checks that the task committed exactly the requested files, and all of them
 * as `exposure_id`.
 */
fn verify_report(
    exposure_id: ExposureId,
    expected: &BTreeSet<PathBuf>,
    datasets: &[FileDataset],
) -> Result<()> {
    let reported = FileDataset::paths(datasets);
    if reported != *expected {
        let unexpected: Vec<&PathBuf> = reported.difference(expected).collect();
        let missing: Vec<&PathBuf> = expected.difference(&reported).collect();
        return Err(OperationError::IngestLogic(format!(
            "mismatch between ingested path(s) {unexpected:?} and expected path(s) {missing:?} \
             for exposure {exposure_id}"
        )));
    }
    let ids = FileDataset::exposure_ids(datasets);
    if ids.len() != 1 || !ids.contains(&exposure_id) {
        let bad: Vec<&ExposureId> = ids.iter().filter(|id| **id != exposure_id).collect();
        return Err(OperationError::IngestLogic(format!(
            "file(s) thought to be for exposure {exposure_id} actually ingested as {bad:?}: {reported:?}"
        )));
    }
    Ok(())
}

impl Operation for RawIngest {
    fn name(&self) -> &str {
        &self.name
    }

    fn nested(&self) -> Vec<&dyn Operation> {
        self.finder.operations()
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        for op in self.finder.operations() {
            op.print_status(ctx, indent, out)?;
        }
        let status = ctx.status_store().check(&self.name);
        let found = self.finder.find(ctx)?;
        let checkpoint = self.checkpoint(ctx);
        if found.is_empty() {
            writeln!(out, "{:indent$}{}: {status}; nothing to do", "", self.name)?;
        } else {
            let remaining = self.todo_exposures(ctx, &found)?.len();
            let completed = checkpoint.read_completed()?.len();
            writeln!(
                out,
                "{:indent$}{}: {status}; {remaining} exposures remaining, {completed} files completed",
                "",
                self.name
            )?;
        }
        if checkpoint.has_stale_marker() {
            writeln!(
                out,
                "{:indent$}{}: WARNING: {:?} exists; an interrupted chunk needs manual reconciliation",
                "",
                self.name,
                checkpoint.in_progress_path()
            )?;
        }
        Ok(())
    }

    /*
     * Writes the to-do list: the files of every not-yet-ingested exposure,
     * minus files claimed elsewhere. Does nothing once the list exists.
     */
    fn prep(&self, ctx: &OperationContext) -> Result<()> {
        let checkpoint = self.checkpoint(ctx);
        if checkpoint.read_todo()?.is_some() {
            log::info!("RawIngest: {}: already prepped.", self.name);
            return Ok(());
        }
        let found = self.finder.find(ctx)?;
        let todo = self.todo_exposures(ctx, &found)?;
        let claimed = self.claimed(ctx)?;
        let mut files = BTreeSet::new();
        for exposure_id in todo {
            match self.finder.expand(ctx, exposure_id, &found) {
                Ok(paths) => files.extend(paths.into_iter().filter(|p| !is_claimed(&claimed, p))),
                Err(e) if !e.is_fatal() => {
                    log::warn!(
                        "RawIngest: {}: leaving exposure {exposure_id} out of the to-do list: {e}",
                        self.name
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if ctx.dry_run {
            log::info!(
                "RawIngest: {}: dry run; the to-do list would hold {} files.",
                self.name,
                files.len()
            );
            return Ok(());
        }
        checkpoint.write_todo(&files)?;
        log::info!("RawIngest: {}: prepped {} files.", self.name, files.len());
        Ok(())
    }

    fn run(&self, ctx: &OperationContext) -> Result<()> {
        ctx.status_store()
            .run_context(&self.name, &mut || self.run_chunks(ctx))
    }

    /*
     * Forgets all persisted progress, including finder caches owned by this
     * ingest. A cache shared with sibling partitions is left to the group.
     * Refuses while an interrupted chunk awaits reconciliation.
     */
    fn cleanup(&self, ctx: &OperationContext) -> Result<()> {
        let checkpoint = self.checkpoint(ctx);
        if checkpoint.has_stale_marker() {
            return Err(OperationError::IncompleteOperation(format!(
                "{:?} exists; reconcile it before cleaning up {}",
                checkpoint.in_progress_path(),
                self.name
            )));
        }
        if ctx.dry_run {
            log::info!("RawIngest: {}: dry run; nothing removed.", self.name);
            return Ok(());
        }
        checkpoint.remove_all()?;
        ctx.status_store().cleanup(&self.name)?;
        cleanup_all(self.finder.owned_operations(), ctx)
    }
}

/*
 * Group whose children are all `RawIngest`s, as produced by `split_into`.
 * `shared` is the finder the partitions slice; its operations are cleaned up
 * with the group, never with a single partition.
 */
pub struct RawIngestGroup {
    name: String,
    children: Vec<RawIngest>,
    shared: Arc<dyn ExposureFinder>,
}

impl RawIngestGroup {
    /// Caches the finder results of every child (see `RawIngest::save_found`).
    pub fn save_found(self, suffix: &str) -> RawIngestGroup {
        RawIngestGroup {
            name: self.name,
            children: self
                .children
                .into_iter()
                .map(|c| c.save_found(suffix))
                .collect(),
            shared: self.shared,
        }
    }

    fn child_ops(&self) -> impl Iterator<Item = &dyn Operation> {
        self.children.iter().map(|c| c as &dyn Operation)
    }
}

impl Operation for RawIngestGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn nested(&self) -> Vec<&dyn Operation> {
        self.child_ops().collect()
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        print_group_status(&self.name, self.child_ops(), ctx, indent, out)
    }

    fn prep(&self, ctx: &OperationContext) -> Result<()> {
        prep_all(self.child_ops(), ctx)
    }

    fn run(&self, ctx: &OperationContext) -> Result<()> {
        run_all(self.child_ops(), ctx)
    }

    fn cleanup(&self, ctx: &OperationContext) -> Result<()> {
        cleanup_all(self.child_ops(), ctx)?;
        cleanup_all(self.shared.operations(), ctx)
    }
}
