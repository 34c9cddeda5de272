/*
 * Adapters that wrap an `ExposureFinder` and change how `find` behaves while
 * delegating `expand` unchanged:
 *
 * - `SavedExposureFinder` is also an `Operation`. Running it performs the
 *   (slow) inner `find` once and saves the result as `{name}.json` in the
 *   working directory; its own `find` only reads that file.
 * - `PartitionedExposureFinder` selects one contiguous slice of the sorted
 *   exposure IDs, so that one large ingest can be split into several
 *   independently resumable ones.
 */
use super::exposure_finder::{ExposureFinder, ExposureId, FoundExposures};
use super::operation::{Operation, OperationContext, OperationError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

pub struct SavedExposureFinder {
    name: String,
    adapted: Box<dyn ExposureFinder>,
}

impl SavedExposureFinder {
    pub fn new(name: impl Into<String>, adapted: Box<dyn ExposureFinder>) -> Self {
        SavedExposureFinder {
            name: name.into(),
            adapted,
        }
    }

    fn cache_path(&self, ctx: &OperationContext) -> PathBuf {
        ctx.work_dir.join(format!("{}.json", self.name))
    }

    fn save(&self, ctx: &OperationContext, found: &FoundExposures) -> Result<()> {
        let target = self.cache_path(ctx);
        let tmp = ctx.work_dir.join(format!("{}.json.tmp", self.name));
        fs::create_dir_all(&ctx.work_dir)?;
        let as_strings: BTreeMap<String, String> = found
            .iter()
            .map(|(id, path)| (id.to_string(), path.to_string_lossy().into_owned()))
            .collect();
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &as_strings)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &target)?;
        log::debug!(
            "SavedExposureFinder: Saved {} exposures to {target:?}.",
            found.len()
        );
        Ok(())
    }
}

impl ExposureFinder for SavedExposureFinder {
    fn find(&self, ctx: &OperationContext) -> Result<FoundExposures> {
        let path = self.cache_path(ctx);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(OperationError::NotReady(format!(
                    "{} has not yet been run",
                    self.name
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let loaded: BTreeMap<String, String> = serde_json::from_reader(BufReader::new(file))?;
        let mut found = FoundExposures::new();
        for (key, dir) in loaded {
            let dir = PathBuf::from(dir);
            let exposure_id: ExposureId =
                key.parse()
                    .map_err(|_| OperationError::InvalidExposureId {
                        path: dir.clone(),
                        text: key.clone(),
                    })?;
            found.insert(exposure_id, dir);
        }
        Ok(found)
    }

    fn expand(
        &self,
        ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        self.adapted.expand(ctx, exposure_id, found)
    }

    fn operations(&self) -> Vec<&dyn Operation> {
        let mut ops = self.adapted.operations();
        ops.push(self);
        ops
    }

    fn owned_operations(&self) -> Vec<&dyn Operation> {
        let mut ops = self.adapted.owned_operations();
        ops.push(self);
        ops
    }
}

impl Operation for SavedExposureFinder {
    fn name(&self) -> &str {
        &self.name
    }

    fn print_status(
        &self,
        ctx: &OperationContext,
        indent: usize,
        out: &mut dyn Write,
    ) -> Result<()> {
        if self.cache_path(ctx).exists() {
            let found = self.find(ctx)?;
            writeln!(
                out,
                "{:indent$}{}: found {} exposures",
                "",
                self.name,
                found.len()
            )?;
        } else {
            writeln!(out, "{:indent$}{}: not started", "", self.name)?;
        }
        Ok(())
    }

    fn run(&self, ctx: &OperationContext) -> Result<()> {
        if self.cache_path(ctx).exists() {
            log::info!(
                "SavedExposureFinder: {} already saved; not scanning again.",
                self.name
            );
            return Ok(());
        }
        log::info!("SavedExposureFinder: Scanning for exposures for {}.", self.name);
        let found = self.adapted.find(ctx)?;
        if ctx.dry_run {
            log::info!(
                "SavedExposureFinder: Dry run found {} exposures for {}; nothing saved.",
                found.len(),
                self.name
            );
            return Ok(());
        }
        self.save(ctx, &found)
    }

    fn cleanup(&self, ctx: &OperationContext) -> Result<()> {
        if ctx.dry_run {
            return Ok(());
        }
        match fs::remove_file(self.cache_path(ctx)) {
            Ok(()) => {
                log::debug!("SavedExposureFinder: Removed cache of {}.", self.name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/*
 * Returns slice `index` of `count` near-equal contiguous slices of the
 * exposures, by ascending ID. Slices may be empty when there are fewer
 * exposures than slices.
 */
pub fn apportion(found: &FoundExposures, index: usize, count: usize) -> FoundExposures {
    let total = found.len();
    let size = total.div_ceil(count.max(1));
    let start = (index * size).min(total);
    let stop = (start + size).min(total);
    found
        .iter()
        .skip(start)
        .take(stop - start)
        .map(|(id, dir)| (*id, dir.clone()))
        .collect()
}

pub struct PartitionedExposureFinder {
    adapted: Arc<dyn ExposureFinder>,
    index: usize,
    count: usize,
}

impl PartitionedExposureFinder {
    pub fn new(adapted: Arc<dyn ExposureFinder>, index: usize, count: usize) -> Self {
        PartitionedExposureFinder {
            adapted,
            index,
            count,
        }
    }
}

impl ExposureFinder for PartitionedExposureFinder {
    fn find(&self, ctx: &OperationContext) -> Result<FoundExposures> {
        let found = self.adapted.find(ctx)?;
        Ok(apportion(&found, self.index, self.count))
    }

    fn expand(
        &self,
        ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        self.adapted.expand(ctx, exposure_id, found)
    }

    /*
     * The wrapped finder is shared by every partition; only the first one
     * reports its operations so they appear once in the tree.
     */
    fn operations(&self) -> Vec<&dyn Operation> {
        if self.index == 0 {
            self.adapted.operations()
        } else {
            Vec::new()
        }
    }

    fn owned_operations(&self) -> Vec<&dyn Operation> {
        Vec::new()
    }
}
