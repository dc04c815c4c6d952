//! Migration descriptors
//!
//! A descriptor file is a JSON array:
//!
//! ```json
//! [{
//!   "id": "title-migration",
//!   "description": "Rename legacy titles",
//!   "states": [
//!     { "name": "before", "probe": "title = 'Content to migrate'" },
//!     { "name": "after" }
//!   ],
//!   "steps": [{
//!     "name": "before-to-after",
//!     "fromState": "before",
//!     "toState": "after",
//!     "command": {
//!       "action": "setProperties",
//!       "query": "title = 'Content to migrate'",
//!       "parameters": { "title": "Content migrated" }
//!     }
//!   }]
//! }]
//! ```

use crate::bulk::{BulkCommand, BulkCommandBuilder, Parameters, param_keys, SYSTEM_USERNAME};
use crate::error::{ConfigError, MigrationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// A state of a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStateDef {
    /// State name
    pub name: String,
    /// Query matching at least one record while the data is in this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<String>,
}

/// Bulk command run by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTemplate {
    pub action: String,
    pub query: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// A transition between two states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    pub name: String,
    pub from_state: String,
    pub to_state: String,
    pub command: CommandTemplate,
}

impl MigrationStep {
    /// Bulk command for this step with the migration bindings
    pub fn to_command(&self, migration_id: &str) -> BulkCommand {
        let mut builder: BulkCommandBuilder =
            BulkCommand::builder(&self.command.action, &self.command.query)
                .user(SYSTEM_USERNAME)
                .params(&self.command.parameters)
                .param(param_keys::MIGRATION_ID, migration_id)
                .param(param_keys::STEP_NAME, &self.name);
        if let Some(size) = self.command.bucket_size {
            builder = builder.bucket_size(size);
        }
        if let Some(size) = self.command.batch_size {
            builder = builder.batch_size(size);
        }
        builder.build()
    }
}

/// Static definition of one migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub states: Vec<MigrationStateDef>,
    pub steps: Vec<MigrationStep>,
}

impl MigrationDescriptor {
    /// Look up a step
    pub fn step(&self, name: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// First declared step leaving `state`
    pub fn first_step_from(&self, state: &str) -> Option<&MigrationStep> {
        self.steps.iter().find(|s| s.from_state == state)
    }

    /// First state without a probe
    pub fn fallback_state(&self) -> Option<&str> {
        self.states
            .iter()
            .find(|s| s.probe.is_none())
            .map(|s| s.name.as_str())
    }

    /// Check names and references
    pub fn validate(&self) -> Result<(), MigrationError> {
        let illegal = |reason: String| {
            MigrationError::IllegalArgument(format!("migration '{}': {}", self.id, reason))
        };

        if self.id.trim().is_empty() {
            return Err(MigrationError::IllegalArgument(
                "migration id must not be empty".into(),
            ));
        }
        if self.states.is_empty() {
            return Err(illegal("declares no state".into()));
        }

        let mut states = HashSet::new();
        for state in &self.states {
            if !states.insert(state.name.as_str()) {
                return Err(illegal(format!("duplicate state '{}'", state.name)));
            }
        }

        let mut steps = HashSet::new();
        for step in &self.steps {
            if !steps.insert(step.name.as_str()) {
                return Err(illegal(format!("duplicate step '{}'", step.name)));
            }
            for state in [&step.from_state, &step.to_state] {
                if !states.contains(state.as_str()) {
                    return Err(illegal(format!(
                        "step '{}' references unknown state '{}'",
                        step.name, state
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parse and validate descriptors from JSON
pub fn parse_descriptors(
    json: &str,
) -> Result<BTreeMap<String, MigrationDescriptor>, MigrationError> {
    let list: Vec<MigrationDescriptor> = serde_json::from_str(json)
        .map_err(|e| MigrationError::IllegalArgument(format!("invalid descriptor JSON: {}", e)))?;

    let mut descriptors = BTreeMap::new();
    for descriptor in list {
        descriptor.validate()?;
        let id = descriptor.id.clone();
        if descriptors.insert(id.clone(), descriptor).is_some() {
            return Err(MigrationError::IllegalArgument(format!(
                "duplicate migration '{}'",
                id
            )));
        }
    }
    Ok(descriptors)
}

/// Load descriptors from a JSON file
pub fn load_descriptors(
    path: &Path,
) -> Result<BTreeMap<String, MigrationDescriptor>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidMigrations {
        path: path.to_path_buf(),
        reason,
    };
    let json = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    parse_descriptors(&json).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE_MIGRATION: &str = r#"[{
        "id": "title-migration",
        "states": [
            { "name": "before", "probe": "title = 'Content to migrate'" },
            { "name": "after" }
        ],
        "steps": [{
            "name": "before-to-after",
            "fromState": "before",
            "toState": "after",
            "command": {
                "action": "setProperties",
                "query": "title = 'Content to migrate'",
                "parameters": { "title": "Content migrated" },
                "bucketSize": 5
            }
        }]
    }]"#;

    #[test]
    fn test_parse() {
        let descriptors = parse_descriptors(TITLE_MIGRATION).unwrap();
        let descriptor = &descriptors["title-migration"];

        assert_eq!(descriptor.fallback_state(), Some("after"));
        assert_eq!(
            descriptor.first_step_from("before").map(|s| s.name.as_str()),
            Some("before-to-after")
        );
        assert!(descriptor.first_step_from("after").is_none());
        assert!(descriptor.step("missing").is_none());
    }

    #[test]
    fn test_step_command_bindings() {
        let descriptors = parse_descriptors(TITLE_MIGRATION).unwrap();
        let step = descriptors["title-migration"].step("before-to-after").unwrap();

        let command = step.to_command("title-migration");
        assert_eq!(command.action, "setProperties");
        assert_eq!(command.bucket_size, 5);
        assert_eq!(command.param("title"), Some("Content migrated"));
        assert_eq!(command.param(param_keys::MIGRATION_ID), Some("title-migration"));
        assert_eq!(command.param(param_keys::STEP_NAME), Some("before-to-after"));
    }

    #[test]
    fn test_invalid_descriptors() {
        assert!(parse_descriptors("{").is_err());
        assert!(parse_descriptors(r#"[{"id": "m", "states": [], "steps": []}]"#).is_err());

        let unknown_state = r#"[{"id": "m", "states": [{"name": "a"}], "steps": [
            {"name": "s", "fromState": "a", "toState": "b",
             "command": {"action": "noop", "query": "*"}}]}]"#;
        let err = parse_descriptors(unknown_state).unwrap_err();
        assert!(err.to_string().contains("unknown state 'b'"));

        let duplicate = r#"[{"id": "m", "states": [{"name": "a"}], "steps": []},
                            {"id": "m", "states": [{"name": "a"}], "steps": []}]"#;
        assert!(parse_descriptors(duplicate).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_descriptors(Path::new("/nonexistent/migrations.json")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMigrations { .. }));
    }
}
