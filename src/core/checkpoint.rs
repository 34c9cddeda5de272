/*
 * Crash-safe progress files of a single raw ingest, all newline-delimited path
 * lists in the working directory:
 *
 *   {name}_files.txt           to-do list, written once (via {name}_files.tmp.txt)
 *   {name}_completed.txt       every path committed so far, only ever grows
 *   {name}_in_progress.txt     exists only while a chunk runs; lists what the
 *                              chunk has committed so far
 *   {name}_last_completed.txt  the in-progress file of the last finished chunk
 *
 * Whole-file rewrites go through a temporary file and a rename so readers never
 * observe a partial list.
 */
use super::operation::{OperationError, Result};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct CheckpointFiles {
    work_dir: PathBuf,
    name: String,
}

/*
 * Append-only record of the paths committed by the running chunk. Each
 * record is flushed to disk before the call returns, so after a crash the
 * in-progress file lists exactly what the interrupted chunk committed.
 *
 * The paths are already in the store when they are recorded, so a failed
 * write is never skippable: it is reported as `IncompleteOperation`.
 */
pub struct ChunkLog {
    path: PathBuf,
    writer: BufWriter<File>,
    committed: Vec<PathBuf>,
}

impl ChunkLog {
    pub fn record(&mut self, paths: &[PathBuf]) -> Result<()> {
        self.committed.extend(paths.iter().cloned());
        self.append(paths).map_err(|e| {
            OperationError::IncompleteOperation(format!(
                "cannot record {} committed paths in {:?}: {e}",
                paths.len(),
                self.path
            ))
        })
    }

    fn append(&mut self, paths: &[PathBuf]) -> io::Result<()> {
        for path in paths {
            writeln!(self.writer, "{}", path.to_string_lossy())?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

impl CheckpointFiles {
    pub fn new(work_dir: &Path, name: &str) -> Self {
        CheckpointFiles {
            work_dir: work_dir.to_path_buf(),
            name: name.to_string(),
        }
    }

    fn file(&self, suffix: &str) -> PathBuf {
        self.work_dir.join(format!("{}_{suffix}", self.name))
    }

    pub fn todo_path(&self) -> PathBuf {
        self.file("files.txt")
    }

    pub fn completed_path(&self) -> PathBuf {
        self.file("completed.txt")
    }

    pub fn in_progress_path(&self) -> PathBuf {
        self.file("in_progress.txt")
    }

    pub fn last_completed_path(&self) -> PathBuf {
        self.file("last_completed.txt")
    }

    /*
     * Reads the to-do list. `None` means prep has not written one yet, which is
     * different from an empty list.
     */
    pub fn read_todo(&self) -> Result<Option<BTreeSet<PathBuf>>> {
        read_path_list(&self.todo_path())
    }

    pub fn write_todo(&self, paths: &BTreeSet<PathBuf>) -> Result<()> {
        let tmp = self.file("files.tmp.txt");
        write_path_list_atomically(&tmp, &self.todo_path(), paths.iter())?;
        log::debug!(
            "Checkpoint: Wrote {} paths to the to-do list of {:?}.",
            paths.len(),
            self.name
        );
        Ok(())
    }

    pub fn read_completed(&self) -> Result<BTreeSet<PathBuf>> {
        Ok(read_path_list(&self.completed_path())?.unwrap_or_default())
    }

    pub fn has_stale_marker(&self) -> bool {
        self.in_progress_path().exists()
    }

    /*
     * Creates the in-progress file for a new chunk. A pre-existing file means a
     * previous chunk died without reconciling; that needs a human.
     */
    pub fn begin_chunk(&self) -> Result<ChunkLog> {
        let marker = self.in_progress_path();
        if marker.exists() {
            return Err(OperationError::IncompleteOperation(format!(
                "{marker:?} exists; reconcile the paths it lists with {:?} and remove it",
                self.completed_path()
            )));
        }
        fs::create_dir_all(&self.work_dir)?;
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&marker)?;
        Ok(ChunkLog {
            path: marker,
            writer: BufWriter::new(file),
            committed: Vec::new(),
        })
    }

    /*
     * Merges the chunk's committed paths into the completed list and retires
     * the in-progress file to `{name}_last_completed.txt`.
     */
    pub fn finish_chunk(&self, log: ChunkLog) -> Result<()> {
        let ChunkLog {
            writer, committed, ..
        } = log;
        drop(writer);
        let mut completed = self.read_completed()?;
        let before = completed.len();
        completed.extend(committed);
        let tmp = self.file("completed.tmp.txt");
        write_path_list_atomically(&tmp, &self.completed_path(), completed.iter())?;
        fs::rename(self.in_progress_path(), self.last_completed_path())?;
        log::debug!(
            "Checkpoint: Chunk of {:?} finished, {} newly completed paths ({} total).",
            self.name,
            completed.len() - before,
            completed.len()
        );
        Ok(())
    }

    /*
     * Removes the to-do, completed and last-completed lists. The in-progress
     * file is left alone; callers refuse to clean up while it exists.
     */
    pub fn remove_all(&self) -> Result<()> {
        for path in [
            self.todo_path(),
            self.file("files.tmp.txt"),
            self.completed_path(),
            self.file("completed.tmp.txt"),
            self.last_completed_path(),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("Checkpoint: Removed {path:?}."),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn read_path_list(path: &Path) -> Result<Option<BTreeSet<PathBuf>>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut paths = BTreeSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            paths.insert(PathBuf::from(trimmed));
        }
    }
    Ok(Some(paths))
}

fn write_path_list_atomically<'a>(
    tmp: &Path,
    target: &Path,
    paths: impl Iterator<Item = &'a PathBuf>,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(tmp)?;
    let mut writer = BufWriter::new(file);
    for path in paths {
        writeln!(writer, "{}", path.to_string_lossy())?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(tmp, target)?;
    Ok(())
}

/// File names of a path list, the unit deduplication works on.
pub fn file_names(paths: &BTreeSet<PathBuf>) -> BTreeSet<String> {
    paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn paths(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_todo_list_absent_until_written() {
        let dir = tempdir().unwrap();
        let files = CheckpointFiles::new(dir.path(), "hsc");
        assert!(files.read_todo().unwrap().is_none());

        files.write_todo(&BTreeSet::new()).unwrap();
        assert_eq!(files.read_todo().unwrap(), Some(BTreeSet::new()));

        let todo = paths(&["/raw/b.fits", "/raw/a.fits"]);
        files.write_todo(&todo).unwrap();
        assert_eq!(files.read_todo().unwrap(), Some(todo));
        assert!(!dir.path().join("hsc_files.tmp.txt").exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("hsc_files.txt")).unwrap(),
            "/raw/a.fits\n/raw/b.fits\n"
        );
    }

    #[test]
    fn test_chunk_merges_into_completed_and_retires_marker() {
        let dir = tempdir().unwrap();
        let files = CheckpointFiles::new(dir.path(), "hsc");

        let mut log = files.begin_chunk().unwrap();
        assert!(files.has_stale_marker());
        log.record(&[PathBuf::from("/raw/a.fits")]).unwrap();
        log.record(&[PathBuf::from("/raw/b.fits")]).unwrap();
        files.finish_chunk(log).unwrap();

        let mut log = files.begin_chunk().unwrap();
        log.record(&[PathBuf::from("/raw/c.fits")]).unwrap();
        files.finish_chunk(log).unwrap();

        assert!(!files.has_stale_marker());
        assert_eq!(
            files.read_completed().unwrap(),
            paths(&["/raw/a.fits", "/raw/b.fits", "/raw/c.fits"])
        );
        assert_eq!(
            fs::read_to_string(files.last_completed_path()).unwrap(),
            "/raw/c.fits\n"
        );
    }

    #[test]
    fn test_marker_lists_committed_paths_while_chunk_is_open() {
        let dir = tempdir().unwrap();
        let files = CheckpointFiles::new(dir.path(), "hsc");
        let mut log = files.begin_chunk().unwrap();
        log.record(&[PathBuf::from("/raw/a.fits")]).unwrap();

        // Simulated crash: the log is dropped without finishing.
        drop(log);

        assert_eq!(
            fs::read_to_string(files.in_progress_path()).unwrap(),
            "/raw/a.fits\n"
        );
        assert!(matches!(
            files.begin_chunk(),
            Err(OperationError::IncompleteOperation(_))
        ));
        assert!(files.read_completed().unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_record_is_fatal_and_keeps_paths_for_merge() {
        let file = OpenOptions::new().write(true).open("/dev/full").unwrap();
        let mut log = ChunkLog {
            path: PathBuf::from("/dev/full"),
            writer: BufWriter::new(file),
            committed: Vec::new(),
        };

        let result = log.record(&[PathBuf::from("/raw/a.fits")]);

        match result {
            Err(e @ OperationError::IncompleteOperation(_)) => assert!(e.is_fatal()),
            other => panic!("expected IncompleteOperation, got {other:?}"),
        }
        assert_eq!(log.committed, vec![PathBuf::from("/raw/a.fits")]);
    }

    #[test]
    fn test_remove_all_is_idempotent_and_keeps_marker() {
        let dir = tempdir().unwrap();
        let files = CheckpointFiles::new(dir.path(), "hsc");
        files.write_todo(&paths(&["/raw/a.fits"])).unwrap();
        let log = files.begin_chunk().unwrap();
        drop(log);

        files.remove_all().unwrap();
        files.remove_all().unwrap();

        assert!(files.read_todo().unwrap().is_none());
        assert!(files.has_stale_marker());
    }

    #[test]
    fn test_file_names_drop_directories() {
        let names = file_names(&paths(&["/n1/a.fits", "/n2/a.fits", "/n2/b.fits"]));
        let expected: BTreeSet<String> = ["a.fits", "b.fits"].iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);
    }
}
