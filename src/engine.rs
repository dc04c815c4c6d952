//! Engine wiring
//!
//! Opens every store on one database file (or privately in memory) and
//! builds the services and the processor on top of them.

use crate::action::ActionRegistry;
use crate::bulk::BulkService;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::log::{PartitionedLog, SqliteLog, BUCKET_TOPIC};
use crate::migration::{MigrationDescriptor, MigrationService};
use crate::processor::BulkProcessor;
use crate::selection::{SelectionEngine, SqliteRepository};
use crate::store::{CommandStore, MigrationStore};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully wired engine
pub struct Engine {
    config: EngineConfig,
    repository: SqliteRepository,
    log: Arc<dyn PartitionedLog>,
    commands: Arc<CommandStore>,
    migration_store: Arc<MigrationStore>,
    bulk: Arc<BulkService>,
    processor: BulkProcessor,
}

impl Engine {
    /// Open an engine with the built-in actions
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_actions(config, ActionRegistry::with_builtins)
    }

    /// Open an engine; `actions` builds the registry from the repository
    pub fn open_with_actions<F>(mut config: EngineConfig, actions: F) -> Result<Self>
    where
        F: FnOnce(SqliteRepository) -> ActionRegistry,
    {
        config.validate()?;

        let (repository, log, commands, migration_store) = match &config.database {
            Some(path) => (
                SqliteRepository::open(path)?,
                SqliteLog::open(path)?,
                CommandStore::open(path)?,
                MigrationStore::open(path)?,
            ),
            None => (
                SqliteRepository::open_in_memory()?,
                SqliteLog::open_in_memory()?,
                CommandStore::open_in_memory()?,
                MigrationStore::open_in_memory()?,
            ),
        };

        // The bucket topic keeps the partition count it was created with
        if let Ok(existing) = log.partitions(BUCKET_TOPIC) {
            if existing != config.partitions {
                warn!(
                    existing,
                    requested = config.partitions,
                    "Bucket topic already exists, keeping its partition count"
                );
                config.partitions = existing;
            }
        }

        let log: Arc<dyn PartitionedLog> = Arc::new(log);
        let commands = Arc::new(commands);
        let actions = Arc::new(actions(repository.clone()));
        let selection: Arc<dyn SelectionEngine> = Arc::new(repository.clone());

        let bulk = Arc::new(BulkService::new(
            commands.clone(),
            log.clone(),
            actions.clone(),
            config.poll_interval,
        ));
        let processor = BulkProcessor::new(
            log.clone(),
            commands.clone(),
            selection,
            actions.clone(),
            config.clone(),
        );

        info!(
            database = ?config.database,
            partitions = config.partitions,
            workers = config.workers,
            actions = ?actions.names(),
            "Engine opened"
        );

        Ok(Self {
            config,
            repository,
            log,
            commands,
            migration_store: Arc::new(migration_store),
            bulk,
            processor,
        })
    }

    /// Migration service over `descriptors`, sharing this engine's stores
    pub fn migrations(
        &self,
        descriptors: BTreeMap<String, MigrationDescriptor>,
    ) -> MigrationService {
        MigrationService::new(
            descriptors,
            self.migration_store.clone(),
            self.bulk.clone(),
            Arc::new(self.repository.clone()),
            self.config.poll_interval,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> &SqliteRepository {
        &self.repository
    }

    pub fn log(&self) -> &Arc<dyn PartitionedLog> {
        &self.log
    }

    pub fn commands(&self) -> &Arc<CommandStore> {
        &self.commands
    }

    pub fn bulk(&self) -> &Arc<BulkService> {
        &self.bulk
    }

    pub fn processor(&self) -> &BulkProcessor {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkCommand;
    use crate::error::BulkError;

    #[test]
    fn test_open_in_memory() {
        let engine = Engine::open(EngineConfig::in_memory().with_workers(2)).unwrap();
        assert!(!engine.processor().is_running());

        let id = engine
            .bulk()
            .submit(BulkCommand::builder("setProperties", "*").build())
            .unwrap();
        assert!(engine.commands().get_command(&id).unwrap().is_some());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::in_memory().with_workers(0);
        assert!(matches!(Engine::open(config), Err(BulkError::Config(_))));
    }

    #[test]
    fn test_existing_partition_count_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let engine = Engine::open(
            EngineConfig::in_memory()
                .with_database(path.clone())
                .with_partitions(3),
        )
        .unwrap();
        crate::log::create_engine_topics(engine.log().as_ref(), 3).unwrap();
        drop(engine);

        let engine = Engine::open(
            EngineConfig::in_memory()
                .with_database(path)
                .with_partitions(8),
        )
        .unwrap();
        assert_eq!(engine.config().partitions, 3);
    }
}
