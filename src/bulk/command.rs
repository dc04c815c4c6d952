//! Bulk command types
//!
//! A BulkCommand is the immutable request to apply a named action to every
//! record matched by a query. It is created once at submission and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default number of record ids per bucket
pub const DEFAULT_BUCKET_SIZE: usize = 100;

/// Default scroll page size
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default repository (namespace) name
pub const DEFAULT_REPOSITORY: &str = "default";

/// Default submitting user
pub const SYSTEM_USERNAME: &str = "system";

/// Action parameters, string-keyed
pub type Parameters = BTreeMap<String, String>;

/// Parameter keys bound by the migration engine
pub mod param_keys {
    /// Id of the migration that submitted the command
    pub const MIGRATION_ID: &str = "migrationId";

    /// Name of the migration step being executed
    pub const STEP_NAME: &str = "stepName";

    /// Keys the engine reserves; actions must not treat them as payload
    pub const RESERVED: &[&str] = &[MIGRATION_ID, STEP_NAME];
}

/// An immutable bulk command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkCommand {
    /// Unique command identifier
    pub id: String,
    /// Name of a registered action
    pub action: String,
    /// Selection expression, opaque to the engine
    pub query: String,
    /// Submitting user
    pub username: String,
    /// Repository or namespace the query runs against
    pub repository: String,
    /// Action parameters
    pub parameters: Parameters,
    /// Record ids per bucket
    pub bucket_size: usize,
    /// Scroll page size
    pub batch_size: usize,
    /// Submission time
    pub submitted_at: DateTime<Utc>,
}

impl BulkCommand {
    /// Start building a command for `action` over `query`
    pub fn builder(action: &str, query: &str) -> BulkCommandBuilder {
        BulkCommandBuilder::new(action, query)
    }

    /// Get a parameter value
    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Builder for bulk commands
#[derive(Debug, Clone)]
pub struct BulkCommandBuilder {
    action: String,
    query: String,
    username: String,
    repository: String,
    parameters: Parameters,
    bucket_size: usize,
    batch_size: usize,
}

impl BulkCommandBuilder {
    /// Create a new builder with default sizes
    pub fn new(action: &str, query: &str) -> Self {
        Self {
            action: action.to_string(),
            query: query.to_string(),
            username: SYSTEM_USERNAME.to_string(),
            repository: DEFAULT_REPOSITORY.to_string(),
            parameters: Parameters::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the submitting user
    pub fn user(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Set the repository
    pub fn repository(mut self, repository: &str) -> Self {
        self.repository = repository.to_string();
        self
    }

    /// Add a parameter
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// Merge a parameter map (later values win)
    pub fn params(mut self, parameters: &Parameters) -> Self {
        self.parameters
            .extend(parameters.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Set the bucket size
    pub fn bucket_size(mut self, size: usize) -> Self {
        self.bucket_size = size;
        self
    }

    /// Set the scroll page size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Build the command, assigning a fresh id and submission time
    pub fn build(self) -> BulkCommand {
        BulkCommand {
            id: Uuid::new_v4().to_string(),
            action: self.action,
            query: self.query,
            username: self.username,
            repository: self.repository,
            parameters: self.parameters,
            bucket_size: self.bucket_size,
            batch_size: self.batch_size,
            submitted_at: Utc::now(),
        }
    }
}
