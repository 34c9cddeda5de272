use regex::Regex;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/*
 * This module provides functionalities for interacting with the file system,
 * primarily recursive discovery of raw files below a top-level directory. Files
 * are matched on their *names* (never on the full path) by either an anchored
 * regular expression or a glob pattern. It defines errors specific to these
 * operations, a trait `FileSystemScannerOperations` for abstracting scanning
 * logic, and a concrete implementation `CoreFileSystemScanner`.
 */

/*
 * Defines custom error types for file system operations.
 * This enum centralizes error handling for directory scanning, I/O issues,
 * pattern compilation and path validity.
 */
#[derive(Debug)]
pub enum FileSystemError {
    Io(io::Error),
    Walk(walkdir::Error),
    Regex(regex::Error),
    Pattern(glob::PatternError),
    InvalidPath(PathBuf),
}

impl From<io::Error> for FileSystemError {
    fn from(err: io::Error) -> Self {
        FileSystemError::Io(err)
    }
}

impl From<walkdir::Error> for FileSystemError {
    fn from(err: walkdir::Error) -> Self {
        FileSystemError::Walk(err)
    }
}

impl From<regex::Error> for FileSystemError {
    fn from(err: regex::Error) -> Self {
        FileSystemError::Regex(err)
    }
}

impl From<glob::PatternError> for FileSystemError {
    fn from(err: glob::PatternError) -> Self {
        FileSystemError::Pattern(err)
    }
}

impl std::fmt::Display for FileSystemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSystemError::Io(e) => write!(f, "I/O error: {e}"),
            FileSystemError::Walk(e) => write!(f, "Directory walk error: {e}"),
            FileSystemError::Regex(e) => write!(f, "Invalid file name regex: {e}"),
            FileSystemError::Pattern(e) => write!(f, "Invalid file name glob: {e}"),
            FileSystemError::InvalidPath(p) => write!(f, "Invalid path: {p:?}"),
        }
    }
}

impl std::error::Error for FileSystemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileSystemError::Io(e) => Some(e),
            FileSystemError::Walk(e) => Some(e),
            FileSystemError::Regex(e) => Some(e),
            FileSystemError::Pattern(e) => Some(e),
            FileSystemError::InvalidPath(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FileSystemError>;

/*
 * Compiles `pattern` so that it must match an entire file name.
 */
pub fn anchored_regex(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

/// A file whose name matched a scan regex, with the regex's capture groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    pub path: PathBuf,
    /// Capture groups 1.., `None` for groups that did not participate.
    pub captures: Vec<Option<String>>,
}

impl ScanMatch {
    pub fn group(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.captures.get(i))
            .and_then(|c| c.as_deref())
    }
}

/*
 * Defines the operations for scanning file systems.
 * With `follow_symlinks == false` every symbolic link (to a file or a
 * directory) is ignored. With `true` links are followed and the canonical
 * target path is reported. Results are sorted by path.
 */
pub trait FileSystemScannerOperations: Send + Sync {
    fn scan_regex(&self, top: &Path, regex: &Regex, follow_symlinks: bool)
    -> Result<Vec<ScanMatch>>;

    fn list_matching(&self, top: &Path, regex: &Regex, follow_symlinks: bool)
    -> Result<Vec<ScanMatch>>;

    fn scan_glob(
        &self,
        top: &Path,
        pattern: &glob::Pattern,
        follow_symlinks: bool,
    ) -> Result<Vec<PathBuf>>;

    /*
     * Lists the immediate subdirectories of `top` (not recursive).
     */
    fn list_subdirectories(&self, top: &Path, follow_symlinks: bool) -> Result<Vec<PathBuf>>;
}

/*
 * The core implementation of `FileSystemScannerOperations`, built on
 * `walkdir`. Unreadable entries below the top directory are logged and
 * skipped; an unreadable top directory is an error.
 */
pub struct CoreFileSystemScanner {}

impl CoreFileSystemScanner {
    pub fn new() -> Self {
        CoreFileSystemScanner {}
    }

    fn walk_files(
        top: &Path,
        follow_symlinks: bool,
        max_depth: Option<usize>,
        mut visit: impl FnMut(&str, PathBuf) -> Result<()>,
    ) -> Result<()> {
        if !top.is_dir() {
            return Err(FileSystemError::InvalidPath(top.to_path_buf()));
        }
        let mut walker = WalkDir::new(top).follow_links(follow_symlinks);
        if let Some(depth) = max_depth {
            walker = walker.max_depth(depth);
        }
        for entry_result in walker.sort_by_file_name() {
            let entry = match entry_result {
                Ok(entry) => entry,
                Err(e) if e.depth() > 0 => {
                    log::warn!("FileSystemScanner: Skipping unreadable entry below {top:?}: {e}");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !follow_symlinks && entry.path_is_symlink() {
                log::trace!("FileSystemScanner: Ignoring symlink {:?}.", entry.path());
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                log::warn!(
                    "FileSystemScanner: Skipping non UTF-8 file name {:?}.",
                    entry.path()
                );
                continue;
            };
            let path = if follow_symlinks {
                entry.path().canonicalize()?
            } else {
                entry.path().to_path_buf()
            };
            visit(name, path)?;
        }
        Ok(())
    }

    fn regex_matches(
        top: &Path,
        regex: &Regex,
        follow_symlinks: bool,
        max_depth: Option<usize>,
    ) -> Result<Vec<ScanMatch>> {
        let mut matches = Vec::new();
        Self::walk_files(top, follow_symlinks, max_depth, |name, path| {
            if let Some(caps) = regex.captures(name) {
                let captures = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map(|m| m.as_str().to_string()))
                    .collect();
                matches.push(ScanMatch { path, captures });
            }
            Ok(())
        })?;
        matches.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(matches)
    }
}

impl Default for CoreFileSystemScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystemScannerOperations for CoreFileSystemScanner {
    fn scan_regex(
        &self,
        top: &Path,
        regex: &Regex,
        follow_symlinks: bool,
    ) -> Result<Vec<ScanMatch>> {
        log::debug!("FileSystemScanner: Scanning {top:?} for file names matching {regex}.");
        let matches = Self::regex_matches(top, regex, follow_symlinks, None)?;
        log::debug!(
            "FileSystemScanner: Scan of {top:?} complete, {} matching files.",
            matches.len()
        );
        Ok(matches)
    }

    fn list_matching(
        &self,
        top: &Path,
        regex: &Regex,
        follow_symlinks: bool,
    ) -> Result<Vec<ScanMatch>> {
        let matches = Self::regex_matches(top, regex, follow_symlinks, Some(1))?;
        log::trace!(
            "FileSystemScanner: {} files directly in {top:?} match {regex}.",
            matches.len()
        );
        Ok(matches)
    }

    fn scan_glob(
        &self,
        top: &Path,
        pattern: &glob::Pattern,
        follow_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        Self::walk_files(top, follow_symlinks, None, |name, path| {
            if pattern.matches(name) {
                paths.push(path);
            }
            Ok(())
        })?;
        paths.sort();
        log::trace!(
            "FileSystemScanner: Glob {} below {top:?} matched {} files.",
            pattern.as_str(),
            paths.len()
        );
        Ok(paths)
    }

    fn list_subdirectories(&self, top: &Path, follow_symlinks: bool) -> Result<Vec<PathBuf>> {
        if !top.is_dir() {
            return Err(FileSystemError::InvalidPath(top.to_path_buf()));
        }
        let walker = WalkDir::new(top)
            .min_depth(1)
            .max_depth(1)
            .follow_links(follow_symlinks)
            .sort_by_file_name();
        let mut dirs = Vec::new();
        for entry_result in walker {
            let entry = entry_result?;
            if !follow_symlinks && entry.path_is_symlink() {
                continue;
            }
            if entry.file_type().is_dir() {
                dirs.push(entry.path().to_path_buf());
            }
        }
        Ok(dirs)
    }
}
