/*
 * Two-phase discovery of raw files. `find` groups files on disk into exposures,
 * mapping each integer exposure ID to one directory; `expand` turns a single
 * found exposure into its exact file set. The two phases are independent so
 * that `find` results can be cached or partitioned (see `finder_adapters`)
 * while `expand` stays deterministic.
 *
 * Three concrete finders are provided: one subdirectory per exposure
 * (`StructuredExposureFinder`), a recursive file-name match with IDs taken
 * from the name (`UnstructuredExposureFinder`), and an explicit list of
 * exposure directories (`ListedExposureFinder`).
 */
use super::file_system::{
    CoreFileSystemScanner, FileSystemScannerOperations, ScanMatch, anchored_regex,
};
use super::operation::{Operation, OperationContext, OperationError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type ExposureId = u64;

pub type FoundExposures = BTreeMap<ExposureId, PathBuf>;

pub trait ExposureFinder: Send + Sync {
    fn find(&self, ctx: &OperationContext) -> Result<FoundExposures>;

    /*
     * Returns every raw file of `exposure_id`. `found` is the result of `find`
     * or any subset of it that contains `exposure_id`.
     */
    fn expand(
        &self,
        ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>>;

    /*
     * Operations owned by this finder (for example a cache that must be run
     * before `find` works), in the order they should be run.
     */
    fn operations(&self) -> Vec<&dyn Operation> {
        Vec::new()
    }

    /*
     * The subset of `operations` whose state belongs to this finder alone and
     * may be cleaned up along with the ingest using it. Operations of a finder
     * shared between partitions are excluded.
     */
    fn owned_operations(&self) -> Vec<&dyn Operation> {
        self.operations()
    }
}

fn found_dir(exposure_id: ExposureId, found: &FoundExposures) -> Result<&Path> {
    found
        .get(&exposure_id)
        .map(PathBuf::as_path)
        .ok_or(OperationError::UnknownExposure(exposure_id))
}

/*
 * What to do when one exposure ID is discovered in two different directories.
 */
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DuplicateResolution {
    #[default]
    Fail,
    /// Prefer the directory whose path does not contain the substring.
    RejectSubstring(String),
}

impl DuplicateResolution {
    pub fn resolve(&self, a: &Path, b: &Path) -> Option<PathBuf> {
        match self {
            DuplicateResolution::Fail => None,
            DuplicateResolution::RejectSubstring(needle) => {
                let a_has = a.to_string_lossy().contains(needle.as_str());
                let b_has = b.to_string_lossy().contains(needle.as_str());
                match (a_has, b_has) {
                    (true, false) => Some(b.to_path_buf()),
                    (false, true) => Some(a.to_path_buf()),
                    _ => None,
                }
            }
        }
    }
}

fn insert_resolving(
    found: &mut FoundExposures,
    resolution: &DuplicateResolution,
    exposure_id: ExposureId,
    dir: PathBuf,
) -> Result<()> {
    match found.get(&exposure_id) {
        None => {
            found.insert(exposure_id, dir);
        }
        Some(previous) if *previous == dir => {}
        Some(previous) => match resolution.resolve(previous, &dir) {
            Some(best) => {
                log::debug!(
                    "ExposureFinder: Exposure {exposure_id} found in {previous:?} and {dir:?}; keeping {best:?}."
                );
                found.insert(exposure_id, best);
            }
            None => {
                return Err(OperationError::DuplicateExposure {
                    exposure_id,
                    first: previous.clone(),
                    second: dir,
                });
            }
        },
    }
    Ok(())
}

/*
 * Derives an exposure ID from a regex capture group: parse the group as an
 * integer, divide by `divisor`, and optionally round down to an even number.
 * Hyper Suprime-Cam names, for example, encode `exposure * 100 + detector`
 * and only use even exposure numbers.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureIdRule {
    pub group: usize,
    pub divisor: u64,
    pub round_to_even: bool,
}

impl Default for ExposureIdRule {
    fn default() -> Self {
        ExposureIdRule {
            group: 1,
            divisor: 1,
            round_to_even: false,
        }
    }
}

impl ExposureIdRule {
    pub fn hsc() -> Self {
        ExposureIdRule {
            group: 1,
            divisor: 100,
            round_to_even: true,
        }
    }

    pub fn apply(&self, text: &str, path: &Path) -> Result<ExposureId> {
        let raw: u64 = text
            .parse()
            .map_err(|_| OperationError::InvalidExposureId {
                path: path.to_path_buf(),
                text: text.to_string(),
            })?;
        let mut id = raw / self.divisor.max(1);
        if self.round_to_even {
            id -= id % 2;
        }
        Ok(id)
    }

    pub fn extract(&self, found: &ScanMatch) -> Result<ExposureId> {
        let text = found
            .group(self.group)
            .ok_or_else(|| OperationError::InvalidExposureId {
                path: found.path.clone(),
                text: String::new(),
            })?;
        self.apply(text, &found.path)
    }
}

/*
 * Predicted file names for one exposure.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingScheme {
    /// `{prefix}{id * multiplier + detector:0width}{suffix}` per detector.
    DetectorNumbers {
        prefix: String,
        multiplier: u64,
        width: usize,
        detectors: Vec<u64>,
        suffix: String,
    },
    /// `{prefix}{id}_{detector}{suffix}`, or `{prefix}{id}_{detector}_{band}{suffix}`
    /// when `bands` is non-empty. The band is detected once per exposure.
    DetectorNames {
        prefix: String,
        detectors: Vec<String>,
        bands: Vec<String>,
        suffix: String,
    },
}

impl NamingScheme {
    pub fn hsc() -> Self {
        let detectors = (0..49).chain(51..58).chain(100..149).chain(151..158).collect();
        NamingScheme::DetectorNumbers {
            prefix: "HSCA".to_string(),
            multiplier: 100,
            width: 8,
            detectors,
            suffix: ".fits".to_string(),
        }
    }

    /// The 189 science sensors of LSSTCam, as named by the imSim simulator.
    pub fn imsim(has_band_suffix: bool) -> Self {
        let corners = [(0, 0), (0, 4), (4, 0), (4, 4)];
        let mut detectors = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                if corners.contains(&(i, j)) {
                    continue;
                }
                for s in 0..3 {
                    for t in 0..3 {
                        detectors.push(format!("R{i}{j}_S{s}{t}"));
                    }
                }
            }
        }
        let bands = if has_band_suffix {
            "ugrizy".chars().map(String::from).collect()
        } else {
            Vec::new()
        };
        NamingScheme::DetectorNames {
            prefix: "lsst_a_".to_string(),
            detectors,
            bands,
            suffix: ".fits".to_string(),
        }
    }

    pub fn expand(
        &self,
        exposure_id: ExposureId,
        dir: &Path,
        allow_incomplete: bool,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut result = BTreeSet::new();
        let require = |path: PathBuf, result: &mut BTreeSet<PathBuf>| -> Result<()> {
            if path.exists() {
                result.insert(path);
                Ok(())
            } else if allow_incomplete {
                log::trace!("NamingScheme: Tolerating missing {path:?} for {exposure_id}.");
                Ok(())
            } else {
                Err(OperationError::MissingFile { exposure_id, path })
            }
        };
        match self {
            NamingScheme::DetectorNumbers {
                prefix,
                multiplier,
                width,
                detectors,
                suffix,
            } => {
                let width = *width;
                for detector in detectors {
                    let number = exposure_id
                        .checked_mul(*multiplier)
                        .and_then(|n| n.checked_add(*detector))
                        .ok_or_else(|| OperationError::InvalidExposureId {
                            path: dir.to_path_buf(),
                            text: exposure_id.to_string(),
                        })?;
                    let path = dir.join(format!("{prefix}{number:0width$}{suffix}"));
                    require(path, &mut result)?;
                }
            }
            NamingScheme::DetectorNames {
                prefix,
                detectors,
                bands,
                suffix,
            } if bands.is_empty() => {
                for detector in detectors {
                    let path = dir.join(format!("{prefix}{exposure_id}_{detector}{suffix}"));
                    require(path, &mut result)?;
                }
            }
            NamingScheme::DetectorNames {
                prefix,
                detectors,
                bands,
                suffix,
            } => {
                let mut band: Option<&str> = None;
                for detector in detectors {
                    match band {
                        Some(band) => {
                            let path =
                                dir.join(format!("{prefix}{exposure_id}_{detector}_{band}{suffix}"));
                            require(path, &mut result)?;
                        }
                        None => {
                            let detected = bands.iter().find_map(|trial| {
                                let path = dir.join(format!(
                                    "{prefix}{exposure_id}_{detector}_{trial}{suffix}"
                                ));
                                path.exists().then_some((trial.as_str(), path))
                            });
                            match detected {
                                Some((trial, path)) => {
                                    band = Some(trial);
                                    result.insert(path);
                                }
                                None if allow_incomplete => {}
                                None => {
                                    return Err(OperationError::MissingFile {
                                        exposure_id,
                                        path: dir.join(format!(
                                            "{prefix}{exposure_id}_{detector}_*{suffix}"
                                        )),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(result)
    }
}

/// How an unstructured finder turns a found exposure into files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionRule {
    /// Rescan the exposure directory (non-recursively) for matching names with the same ID.
    RescanMatching,
    Naming {
        scheme: NamingScheme,
        allow_incomplete: bool,
    },
}

/*
 * Finder for roots that directly contain one subdirectory per exposure, named
 * by the exposure ID. Expansion is a recursive glob of that subdirectory.
 * Symbolic links are always followed.
 */
pub struct StructuredExposureFinder {
    root: PathBuf,
    file_pattern: glob::Pattern,
    scanner: Arc<dyn FileSystemScannerOperations>,
}

impl StructuredExposureFinder {
    pub fn new(root: impl Into<PathBuf>, file_pattern: &str) -> Result<Self> {
        let file_pattern =
            glob::Pattern::new(file_pattern).map_err(super::file_system::FileSystemError::from)?;
        Ok(StructuredExposureFinder {
            root: root.into(),
            file_pattern,
            scanner: Arc::new(CoreFileSystemScanner::new()),
        })
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn FileSystemScannerOperations>) -> Self {
        self.scanner = scanner;
        self
    }
}

fn directory_exposure_id(dir: &Path) -> Result<ExposureId> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.parse().map_err(|_| OperationError::InvalidExposureId {
        path: dir.to_path_buf(),
        text: name,
    })
}

impl ExposureFinder for StructuredExposureFinder {
    fn find(&self, _ctx: &OperationContext) -> Result<FoundExposures> {
        let mut found = FoundExposures::new();
        for dir in self.scanner.list_subdirectories(&self.root, true)? {
            found.insert(directory_exposure_id(&dir)?, dir);
        }
        log::debug!(
            "StructuredExposureFinder: Found {} exposures below {:?}.",
            found.len(),
            self.root
        );
        Ok(found)
    }

    fn expand(
        &self,
        _ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        let dir = found_dir(exposure_id, found)?;
        Ok(self
            .scanner
            .scan_glob(dir, &self.file_pattern, true)?
            .into_iter()
            .collect())
    }
}

/*
 * Finder that makes no assumption about directory layout: every file below
 * `root` whose name matches `file_regex` is attributed to the exposure its
 * name encodes, and the exposure maps to the file's parent directory.
 */
pub struct UnstructuredExposureFinder {
    root: PathBuf,
    file_regex: Regex,
    id_rule: ExposureIdRule,
    expansion: ExpansionRule,
    resolution: DuplicateResolution,
    follow_symlinks: bool,
    scanner: Arc<dyn FileSystemScannerOperations>,
}

impl UnstructuredExposureFinder {
    pub fn new(root: impl Into<PathBuf>, file_regex: &str, id_rule: ExposureIdRule) -> Result<Self> {
        Ok(UnstructuredExposureFinder {
            root: root.into(),
            file_regex: anchored_regex(file_regex)?,
            id_rule,
            expansion: ExpansionRule::RescanMatching,
            resolution: DuplicateResolution::Fail,
            follow_symlinks: false,
            scanner: Arc::new(CoreFileSystemScanner::new()),
        })
    }

    pub fn with_expansion(mut self, expansion: ExpansionRule) -> Self {
        self.expansion = expansion;
        self
    }

    pub fn with_resolution(mut self, resolution: DuplicateResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn FileSystemScannerOperations>) -> Self {
        self.scanner = scanner;
        self
    }
}

impl ExposureFinder for UnstructuredExposureFinder {
    fn find(&self, _ctx: &OperationContext) -> Result<FoundExposures> {
        let mut found = FoundExposures::new();
        let matches = self
            .scanner
            .scan_regex(&self.root, &self.file_regex, self.follow_symlinks)?;
        for m in &matches {
            let exposure_id = self.id_rule.extract(m)?;
            let Some(parent) = m.path.parent() else {
                continue;
            };
            insert_resolving(&mut found, &self.resolution, exposure_id, parent.to_path_buf())?;
        }
        log::debug!(
            "UnstructuredExposureFinder: {} matching files below {:?} form {} exposures.",
            matches.len(),
            self.root,
            found.len()
        );
        Ok(found)
    }

    fn expand(
        &self,
        _ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        let dir = found_dir(exposure_id, found)?;
        match &self.expansion {
            ExpansionRule::Naming {
                scheme,
                allow_incomplete,
            } => scheme.expand(exposure_id, dir, *allow_incomplete),
            ExpansionRule::RescanMatching => {
                let mut result = BTreeSet::new();
                for m in self
                    .scanner
                    .list_matching(dir, &self.file_regex, self.follow_symlinks)?
                {
                    if self.id_rule.extract(&m)? == exposure_id {
                        result.insert(m.path);
                    }
                }
                Ok(result)
            }
        }
    }
}

/*
 * Finder over an explicit list of exposure directories, each named by its
 * exposure ID. Expansion is a recursive glob of the directory.
 */
pub struct ListedExposureFinder {
    directories: Vec<PathBuf>,
    file_pattern: glob::Pattern,
    resolution: DuplicateResolution,
    follow_symlinks: bool,
    scanner: Arc<dyn FileSystemScannerOperations>,
}

impl ListedExposureFinder {
    pub fn new(directories: Vec<PathBuf>, file_pattern: &str) -> Result<Self> {
        let file_pattern =
            glob::Pattern::new(file_pattern).map_err(super::file_system::FileSystemError::from)?;
        Ok(ListedExposureFinder {
            directories,
            file_pattern,
            resolution: DuplicateResolution::Fail,
            follow_symlinks: false,
            scanner: Arc::new(CoreFileSystemScanner::new()),
        })
    }

    pub fn with_resolution(mut self, resolution: DuplicateResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_follow_symlinks(mut self, follow_symlinks: bool) -> Self {
        self.follow_symlinks = follow_symlinks;
        self
    }
}

impl ExposureFinder for ListedExposureFinder {
    fn find(&self, _ctx: &OperationContext) -> Result<FoundExposures> {
        let mut found = FoundExposures::new();
        for dir in &self.directories {
            if !dir.is_dir() {
                log::warn!("ListedExposureFinder: Listed directory {dir:?} does not exist.");
                continue;
            }
            let exposure_id = directory_exposure_id(dir)?;
            insert_resolving(&mut found, &self.resolution, exposure_id, dir.clone())?;
        }
        Ok(found)
    }

    fn expand(
        &self,
        _ctx: &OperationContext,
        exposure_id: ExposureId,
        found: &FoundExposures,
    ) -> Result<BTreeSet<PathBuf>> {
        let dir = found_dir(exposure_id, found)?;
        Ok(self
            .scanner
            .scan_glob(dir, &self.file_pattern, self.follow_symlinks)?
            .into_iter()
            .collect())
    }
}
