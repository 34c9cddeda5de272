/*
 * This module consolidates the engine behind the administration tool: durable
 * operation status, the `Operation` tree and its groups, exposure discovery
 * and its adapters, checkpointed raw ingestion with sibling deduplication,
 * the file-backed ledger collaborator, and the configuration that builds
 * operation trees. Key types are re-exported for the front end.
 */
pub mod checkpoint;
pub mod config;
pub mod dedup_group;
pub mod exposure_finder;
pub mod external;
pub mod file_system;
pub mod finder_adapters;
pub mod group;
pub mod ledger;
pub mod operation;
pub mod path_utils;
pub mod raw_ingest;
pub mod status_store;

#[cfg(test)]
pub mod test_support;


// Re-export the operation model
pub use group::Group;
pub use operation::{Operation, OperationContext, OperationError, OperationRegistry};
pub use status_store::{CoreStatusStore, Status, StatusStoreOperations};

// Re-export collaborator interfaces and the ledger implementing them
pub use external::{ExternalStoreOperations, IngestTaskOperations};
pub use ledger::LedgerStore;

// Re-export config related items
pub use config::{AdminConfig, ConfigError, ConfigManagerOperations, CoreConfigManager, RepoConfig};
