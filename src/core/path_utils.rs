/*
 * Path conventions shared by the configuration layer and the front end: where
 * the default configuration file lives, and how working directories and log
 * files of a dated repository are named.
 */
use directories::ProjectDirs;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/*
 * Retrieves the application's local configuration directory, creating it if
 * necessary. Returns `None` if no home directory can be determined or the
 * directory cannot be created.
 */
pub fn get_base_app_config_local_dir(app_name: &str) -> Option<PathBuf> {
    log::trace!("PathUtils: Attempting to get base app config local dir for '{app_name}'");
    ProjectDirs::from("", "", app_name).and_then(|proj_dirs| {
        let config_path = proj_dirs.config_local_dir();
        if !config_path.exists() {
            if let Err(e) = fs::create_dir_all(config_path) {
                log::error!(
                    "PathUtils: Failed to create base app config directory {config_path:?}: {e}"
                );
                return None;
            }
            log::debug!("PathUtils: Created base app config directory: {config_path:?}");
        }
        Some(config_path.to_path_buf())
    })
}

/// `{work_root}/{repo}_{date}`.
pub fn repo_work_dir(work_root: &Path, repo: &str, date: &str) -> PathBuf {
    work_root.join(format!("{repo}_{date}"))
}

/// `{log_dir}/{repo}_{date}.log`.
pub fn log_file_path(log_dir: &Path, repo: &str, date: &str) -> PathBuf {
    log_dir.join(format!("{repo}_{date}.log"))
}

/*
 * Opens the log file of a repository instance for appending, creating the log
 * directory and file as needed. Earlier runs against the same instance stay in
 * the file.
 */
pub fn open_log_file(log_dir: &Path, repo: &str, date: &str) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(log_dir, repo, date))
}
