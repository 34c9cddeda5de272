/*
 * Loads the administration configuration and turns it into operation trees.
 * The configuration is a JSON document listing repositories; each repository
 * has a name, a date (one configuration may describe several dated
 * incarnations of the same repository), a root under which working
 * directories are created, the instruments whose file names encode exposure
 * IDs, and the operations to administer:
 *
 *   {
 *     "repos": [{
 *       "name": "main", "date": "20240501", "work_root": "/scratch/admin",
 *       "instruments": { "HSC": { "file_regex": "HSCA(\\d{8})\\.fits",
 *                                 "id_rule": { "divisor": 100, "round_to_even": true } } },
 *       "operations": [
 *         { "kind": "raw_ingest", "name": "hsc-raws", "instrument": "HSC",
 *           "finder": { "kind": "unstructured", "root": "/data/hsc",
 *                       "file_regex": "HSCA(\\d{8})\\.fits",
 *                       "id_rule": { "divisor": 100, "round_to_even": true } },
 *           "save_found": "find", "split_into": 4 }
 *       ]
 *     }]
 *   }
 *
 * `ConfigManagerOperations` abstracts where the document comes from so that
 * the front end can be tested with in-memory configurations.
 */
use super::dedup_group::DeduplicatingGroup;
use super::exposure_finder::{
    DuplicateResolution, ExpansionRule, ExposureFinder, ExposureIdRule, ListedExposureFinder,
    NamingScheme, StructuredExposureFinder, UnstructuredExposureFinder,
};
use super::file_system::FileSystemError;
use super::group::Group;
use super::ledger::{ExposureIdentifier, LedgerStore};
use super::operation::{Operation, OperationError, OperationRegistry};
use super::path_utils;
use super::raw_ingest::{DEFAULT_CHUNK_SIZE, RawIngest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "repo-admin.json";
const LEDGER_FILENAME: &str = "ledger.json";

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Serde(serde_json::Error),
    NoConfigFile,
    UnknownRepo(String),
    AmbiguousRepo(String),
    Invalid(String),
    Operation(OperationError),
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Serde(err)
    }
}

impl From<OperationError> for ConfigError {
    fn from(err: OperationError) -> Self {
        ConfigError::Operation(err)
    }
}

impl From<FileSystemError> for ConfigError {
    fn from(err: FileSystemError) -> Self {
        ConfigError::Operation(OperationError::FileSystem(err))
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Configuration I/O error: {e}"),
            ConfigError::Serde(e) => write!(f, "Configuration format error: {e}"),
            ConfigError::NoConfigFile => {
                write!(f, "No configuration file given and no default location found")
            }
            ConfigError::UnknownRepo(what) => write!(f, "No repository matches {what}"),
            ConfigError::AmbiguousRepo(what) => {
                write!(f, "Several repositories match {what}; give --repo and --date")
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
            ConfigError::Operation(e) => write!(f, "Invalid operation tree: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Serde(e) => Some(e),
            ConfigError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminConfig {
    pub repos: Vec<RepoConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub date: String,
    pub work_root: PathBuf,
    /// Ledger file; defaults to `ledger.json` in the working directory.
    #[serde(default)]
    pub ledger: Option<PathBuf>,
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentConfig>,
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    #[serde(default)]
    pub file_regex: Option<String>,
    #[serde(default)]
    pub id_rule: IdRuleConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdRuleConfig {
    pub group: usize,
    pub divisor: u64,
    pub round_to_even: bool,
}

impl Default for IdRuleConfig {
    fn default() -> Self {
        let rule = ExposureIdRule::default();
        IdRuleConfig {
            group: rule.group,
            divisor: rule.divisor,
            round_to_even: rule.round_to_even,
        }
    }
}

impl IdRuleConfig {
    pub fn to_rule(&self) -> ExposureIdRule {
        ExposureIdRule {
            group: self.group,
            divisor: self.divisor,
            round_to_even: self.round_to_even,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationConfig {
    Group {
        name: String,
        operations: Vec<OperationConfig>,
    },
    RawIngest(RawIngestConfig),
    DedupGroup {
        name: String,
        children: Vec<RawIngestConfig>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIngestConfig {
    pub name: String,
    pub instrument: String,
    #[serde(default)]
    pub collection: Option<String>,
    pub finder: FinderConfig,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Suffix of a cache operation for the finder results.
    #[serde(default)]
    pub save_found: Option<String>,
    #[serde(default)]
    pub split_into: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FinderConfig {
    Structured {
        root: PathBuf,
        #[serde(default = "default_file_pattern")]
        file_pattern: String,
    },
    Unstructured {
        root: PathBuf,
        file_regex: String,
        #[serde(default)]
        id_rule: IdRuleConfig,
        #[serde(default)]
        expansion: ExpansionConfig,
        #[serde(default)]
        reject_duplicates_containing: Option<String>,
        #[serde(default)]
        follow_symlinks: bool,
    },
    Listed {
        directories: Vec<PathBuf>,
        #[serde(default = "default_file_pattern")]
        file_pattern: String,
        #[serde(default)]
        reject_duplicates_containing: Option<String>,
        #[serde(default)]
        follow_symlinks: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpansionConfig {
    #[default]
    Rescan,
    Hsc {
        #[serde(default)]
        allow_incomplete: bool,
    },
    Imsim {
        #[serde(default)]
        band_suffix: bool,
        #[serde(default)]
        allow_incomplete: bool,
    },
}

fn default_file_pattern() -> String {
    "*.fits".to_string()
}

fn resolution(reject_containing: &Option<String>) -> DuplicateResolution {
    match reject_containing {
        Some(substring) => DuplicateResolution::RejectSubstring(substring.clone()),
        None => DuplicateResolution::Fail,
    }
}

impl ExpansionConfig {
    fn to_rule(&self) -> ExpansionRule {
        match self {
            ExpansionConfig::Rescan => ExpansionRule::RescanMatching,
            ExpansionConfig::Hsc { allow_incomplete } => ExpansionRule::Naming {
                scheme: NamingScheme::hsc(),
                allow_incomplete: *allow_incomplete,
            },
            ExpansionConfig::Imsim {
                band_suffix,
                allow_incomplete,
            } => ExpansionRule::Naming {
                scheme: NamingScheme::imsim(*band_suffix),
                allow_incomplete: *allow_incomplete,
            },
        }
    }
}

impl FinderConfig {
    pub fn build(&self) -> Result<Box<dyn ExposureFinder>> {
        let finder: Box<dyn ExposureFinder> = match self {
            FinderConfig::Structured { root, file_pattern } => {
                Box::new(StructuredExposureFinder::new(root.clone(), file_pattern)?)
            }
            FinderConfig::Unstructured {
                root,
                file_regex,
                id_rule,
                expansion,
                reject_duplicates_containing,
                follow_symlinks,
            } => Box::new(
                UnstructuredExposureFinder::new(root.clone(), file_regex, id_rule.to_rule())?
                    .with_expansion(expansion.to_rule())
                    .with_resolution(resolution(reject_duplicates_containing))
                    .with_follow_symlinks(*follow_symlinks),
            ),
            FinderConfig::Listed {
                directories,
                file_pattern,
                reject_duplicates_containing,
                follow_symlinks,
            } => Box::new(
                ListedExposureFinder::new(directories.clone(), file_pattern)?
                    .with_resolution(resolution(reject_duplicates_containing))
                    .with_follow_symlinks(*follow_symlinks),
            ),
        };
        Ok(finder)
    }
}

impl RawIngestConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{}: chunk_size must be positive",
                self.name
            )));
        }
        if self.split_into == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{}: split_into must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Builds the ingest without splitting; a requested cache is applied.
    pub fn build_ingest(&self) -> Result<RawIngest> {
        self.validate()?;
        let ingest = RawIngest::new(self.name.clone(), self.finder.build()?, self.instrument.clone())
            .with_collection(self.collection.clone())
            .with_chunk_size(self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE));
        Ok(match &self.save_found {
            Some(suffix) => ingest.save_found(suffix),
            None => ingest,
        })
    }

    /*
     * Builds the configured operation. With both a cache and a split, the
     * partitions share one cache named `{name}-{suffix}`.
     */
    pub fn build(&self) -> Result<Box<dyn Operation>> {
        let ingest = self.build_ingest()?;
        let op: Box<dyn Operation> = match self.split_into {
            Some(n) => Box::new(ingest.split_into(n)),
            None => Box::new(ingest),
        };
        Ok(op)
    }
}

impl OperationConfig {
    pub fn build(&self) -> Result<Box<dyn Operation>> {
        match self {
            OperationConfig::Group { name, operations } => {
                let children = operations
                    .iter()
                    .map(OperationConfig::build)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Box::new(Group::new(name.clone(), children)))
            }
            OperationConfig::RawIngest(ingest) => ingest.build(),
            OperationConfig::DedupGroup { name, children } => {
                let mut ingests = Vec::new();
                for child in children {
                    if child.split_into.is_some() {
                        return Err(ConfigError::Invalid(format!(
                            "{}: children of the deduplicating group {name} cannot be split",
                            child.name
                        )));
                    }
                    ingests.push(child.build_ingest()?);
                }
                Ok(Box::new(DeduplicatingGroup::new(name.clone(), ingests)))
            }
        }
    }
}

impl RepoConfig {
    /// `{work_root}/{name}_{date}`, where all status and checkpoint files live.
    pub fn work_dir(&self) -> PathBuf {
        path_utils::repo_work_dir(&self.work_root, &self.name, &self.date)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .clone()
            .unwrap_or_else(|| self.work_dir().join(LEDGER_FILENAME))
    }

    /*
     * Builds the repository's operation tree: a group named after the
     * repository holding the configured operations. Fails on duplicate
     * operation names anywhere in the tree.
     */
    pub fn build_operations(&self) -> Result<Group> {
        let children = self
            .operations
            .iter()
            .map(OperationConfig::build)
            .collect::<Result<Vec<_>>>()?;
        let root = Group::new(self.name.clone(), children);
        let registered = OperationRegistry::build(&root)?.len();
        log::debug!(
            "Config: Built {registered} operations for repository {} ({}).",
            self.name,
            self.date
        );
        Ok(root)
    }

    pub fn build_ledger(&self) -> Result<LedgerStore> {
        let mut identifiers = BTreeMap::new();
        for (instrument, config) in &self.instruments {
            let identifier =
                ExposureIdentifier::new(config.file_regex.as_deref(), config.id_rule.to_rule())?;
            identifiers.insert(instrument.clone(), identifier);
        }
        Ok(LedgerStore::new(self.ledger_path(), identifiers))
    }
}

impl AdminConfig {
    /*
     * Picks the repository to administer. Either filter may be omitted as long
     * as exactly one repository remains.
     */
    pub fn select_repo(&self, name: Option<&str>, date: Option<&str>) -> Result<&RepoConfig> {
        let matching: Vec<&RepoConfig> = self
            .repos
            .iter()
            .filter(|r| name.is_none_or(|n| r.name == n))
            .filter(|r| date.is_none_or(|d| r.date == d))
            .collect();
        let what = format!(
            "name {} and date {}",
            name.unwrap_or("(any)"),
            date.unwrap_or("(any)")
        );
        match matching.as_slice() {
            [repo] => Ok(*repo),
            [] => Err(ConfigError::UnknownRepo(what)),
            _ => Err(ConfigError::AmbiguousRepo(what)),
        }
    }
}

pub trait ConfigManagerOperations: Send + Sync {
    fn load_config(&self, path: &Path) -> Result<AdminConfig>;

    /*
     * Location used when neither `--config` nor `REPO_ADMIN_CONFIG` is given.
     */
    fn default_config_path(&self, app_name: &str) -> Option<PathBuf>;
}

pub struct CoreConfigManager {}

impl CoreConfigManager {
    pub fn new() -> Self {
        CoreConfigManager {}
    }
}

impl Default for CoreConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManagerOperations for CoreConfigManager {
    fn load_config(&self, path: &Path) -> Result<AdminConfig> {
        log::trace!("CoreConfigManager: Loading configuration from {path:?}");
        let file = File::open(path)?;
        let config: AdminConfig = serde_json::from_reader(BufReader::new(file))?;
        log::debug!(
            "CoreConfigManager: Loaded {} repositories from {path:?}.",
            config.repos.len()
        );
        Ok(config)
    }

    fn default_config_path(&self, app_name: &str) -> Option<PathBuf> {
        path_utils::get_base_app_config_local_dir(app_name).map(|dir| dir.join(CONFIG_FILENAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
      "repos": [
        {
          "name": "main",
          "date": "20240501",
          "work_root": "/scratch/admin",
          "instruments": {
            "HSC": {
              "file_regex": "HSCA(\\d{8})\\.fits",
              "id_rule": { "divisor": 100, "round_to_even": true }
            }
          },
          "operations": [
            {
              "kind": "group",
              "name": "main-raws",
              "operations": [
                {
                  "kind": "raw_ingest",
                  "name": "main-raws-hsc",
                  "instrument": "HSC",
                  "collection": "HSC/raw/all",
                  "finder": {
                    "kind": "unstructured",
                    "root": "/data/hsc",
                    "file_regex": "HSCA(\\d{8})\\.fits",
                    "id_rule": { "divisor": 100, "round_to_even": true },
                    "expansion": { "kind": "hsc", "allow_incomplete": true }
                  },
                  "save_found": "find",
                  "split_into": 2
                },
                {
                  "kind": "dedup_group",
                  "name": "main-raws-imsim",
                  "children": [
                    {
                      "name": "main-raws-imsim-n1",
                      "instrument": "LSSTCam-imSim",
                      "finder": { "kind": "structured", "root": "/n1/imsim" }
                    },
                    {
                      "name": "main-raws-imsim-n2",
                      "instrument": "LSSTCam-imSim",
                      "finder": {
                        "kind": "listed",
                        "directories": ["/n2/imsim/00001", "/n2/imsim/00002"],
                        "reject_duplicates_containing": "_bad"
                      },
                      "chunk_size": 10
                    }
                  ]
                }
              ]
            }
          ]
        },
        { "name": "main", "date": "20230101", "work_root": "/old", "operations": [] },
        { "name": "test", "date": "20240501", "work_root": "/tmp", "operations": [] }
      ]
    }"#;

    fn sample() -> AdminConfig {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_applies_defaults() {
        let config = sample();
        let repo = &config.repos[0];
        assert_eq!(repo.instruments["HSC"].id_rule.group, 1);
        assert_eq!(repo.instruments["HSC"].id_rule.divisor, 100);

        let OperationConfig::Group { operations, .. } = &repo.operations[0] else {
            panic!("Expected a group, got {:?}", repo.operations[0]);
        };
        let OperationConfig::DedupGroup { children, .. } = &operations[1] else {
            panic!("Expected a dedup group, got {:?}", operations[1]);
        };
        assert_eq!(
            children[0].finder,
            FinderConfig::Structured {
                root: PathBuf::from("/n1/imsim"),
                file_pattern: "*.fits".to_string(),
            }
        );
        assert_eq!(children[0].chunk_size, None);
        assert_eq!(config.repos[1].ledger, None);
    }

    #[test]
    fn test_select_repo_by_name_and_date() {
        let config = sample();
        assert_eq!(
            config.select_repo(Some("main"), Some("20230101")).unwrap().work_root,
            PathBuf::from("/old")
        );
        assert_eq!(config.select_repo(Some("test"), None).unwrap().name, "test");
        assert!(matches!(
            config.select_repo(Some("main"), None),
            Err(ConfigError::AmbiguousRepo(_))
        ));
        assert!(matches!(
            config.select_repo(Some("main"), Some("19990101")),
            Err(ConfigError::UnknownRepo(_))
        ));
    }

    #[test]
    fn test_work_dir_and_ledger_paths() {
        let config = sample();
        let repo = config.select_repo(Some("main"), Some("20240501")).unwrap();
        assert_eq!(repo.work_dir(), PathBuf::from("/scratch/admin/main_20240501"));
        assert_eq!(
            repo.ledger_path(),
            PathBuf::from("/scratch/admin/main_20240501/ledger.json")
        );
    }

    #[test]
    fn test_build_operations_registers_the_whole_tree() {
        let config = sample();
        let repo = config.select_repo(Some("main"), Some("20240501")).unwrap();

        let root = repo.build_operations().unwrap();
        let registry = OperationRegistry::build(&root).unwrap();

        let names: Vec<&str> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "main",
                "main-raws",
                "main-raws-hsc",
                "main-raws-hsc-0",
                "main-raws-hsc-find",
                "main-raws-hsc-1",
                "main-raws-imsim",
                "main-raws-imsim-n1",
                "main-raws-imsim-n2",
            ]
        );
    }

    #[test]
    fn test_build_rejects_invalid_trees() {
        let mut config = sample();
        let repo = &mut config.repos[2];
        let ingest = RawIngestConfig {
            name: "dup".to_string(),
            instrument: "HSC".to_string(),
            collection: None,
            finder: FinderConfig::Structured {
                root: PathBuf::from("/raw"),
                file_pattern: default_file_pattern(),
            },
            chunk_size: None,
            save_found: None,
            split_into: None,
        };
        repo.operations = vec![
            OperationConfig::RawIngest(ingest.clone()),
            OperationConfig::RawIngest(ingest.clone()),
        ];
        assert!(matches!(
            repo.build_operations(),
            Err(ConfigError::Operation(OperationError::DuplicateOperationName(_)))
        ));

        repo.operations = vec![OperationConfig::RawIngest(RawIngestConfig {
            chunk_size: Some(0),
            ..ingest.clone()
        })];
        assert!(matches!(repo.build_operations(), Err(ConfigError::Invalid(_))));

        repo.operations = vec![OperationConfig::RawIngest(RawIngestConfig {
            finder: FinderConfig::Unstructured {
                root: PathBuf::from("/raw"),
                file_regex: "HSCA(".to_string(),
                id_rule: IdRuleConfig::default(),
                expansion: ExpansionConfig::default(),
                reject_duplicates_containing: None,
                follow_symlinks: false,
            },
            ..ingest.clone()
        })];
        assert!(matches!(
            repo.build_operations(),
            Err(ConfigError::Operation(OperationError::FileSystem(_)))
        ));

        repo.operations = vec![OperationConfig::DedupGroup {
            name: "dedup".to_string(),
            children: vec![RawIngestConfig {
                split_into: Some(2),
                ..ingest
            }],
        }];
        assert!(matches!(repo.build_operations(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_core_config_manager_loads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, SAMPLE).unwrap();
        let manager = CoreConfigManager::new();

        let config = manager.load_config(&path).unwrap();

        assert_eq!(config, sample());
        assert!(matches!(
            manager.load_config(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
        fs::write(&path, "{ \"repos\": [ { \"name\": 3 } ] }").unwrap();
        assert!(matches!(manager.load_config(&path), Err(ConfigError::Serde(_))));
    }

    #[test]
    fn test_default_config_path_ends_in_file_name() {
        let unique_app_name = format!("TestApp_RepoAdmin_{}", rand::random::<u64>());
        let manager = CoreConfigManager::new();
        if let Some(path) = manager.default_config_path(&unique_app_name) {
            assert!(path.ends_with(CONFIG_FILENAME));
            if let Some(dir) = path.parent() {
                let _ = fs::remove_dir_all(dir);
            }
        }
    }
}
