//! Built-in actions over the document repository

use crate::action::ActionHandler;
use crate::bulk::{param_keys, Parameters};
use crate::error::{ActionError, ActionResult};
use crate::selection::SqliteRepository;

/// Name of the do-nothing action
pub const NOOP_ACTION: &str = "noop";

/// Name of the property setter action
pub const SET_PROPERTIES_ACTION: &str = "setProperties";

/// Parameter that sets the document title instead of a property
const TITLE_PARAM: &str = "title";

/// Accepts every record without touching it
pub struct NoopAction;

impl ActionHandler for NoopAction {
    fn apply(&self, _record_id: &str, _parameters: &Parameters) -> ActionResult<()> {
        Ok(())
    }
}

/// Sets every non-reserved parameter as a document property
///
/// The `title` parameter sets the document title.
pub struct SetPropertiesAction {
    repository: SqliteRepository,
}

impl SetPropertiesAction {
    pub fn new(repository: SqliteRepository) -> Self {
        Self { repository }
    }
}

impl ActionHandler for SetPropertiesAction {
    fn apply(&self, record_id: &str, parameters: &Parameters) -> ActionResult<()> {
        let failed = |e: crate::error::StoreError| ActionError::Failed {
            record_id: record_id.to_string(),
            reason: e.to_string(),
        };

        let mut doc = self
            .repository
            .get(record_id)
            .map_err(failed)?
            .ok_or_else(|| ActionError::RecordNotFound(record_id.to_string()))?;

        for (key, value) in parameters {
            if param_keys::RESERVED.contains(&key.as_str()) {
                continue;
            }
            if key == TITLE_PARAM {
                doc.title = value.clone();
            } else {
                doc.properties.insert(key.clone(), value.clone());
            }
        }

        self.repository.save(&doc).map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Document;

    #[test]
    fn test_set_properties() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.save(&Document::new("d1", "File", "Content to migrate"))
            .unwrap();

        let mut params = Parameters::new();
        params.insert("title".into(), "Content migrated".into());
        params.insert("status".into(), "done".into());
        params.insert(param_keys::MIGRATION_ID.into(), "m1".into());

        SetPropertiesAction::new(repo.clone())
            .apply("d1", &params)
            .unwrap();

        let doc = repo.get("d1").unwrap().unwrap();
        assert_eq!(doc.title, "Content migrated");
        assert_eq!(doc.properties.get("status").map(String::as_str), Some("done"));
        assert!(!doc.properties.contains_key(param_keys::MIGRATION_ID));
    }

    #[test]
    fn test_missing_record() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let result = SetPropertiesAction::new(repo).apply("gone", &Parameters::new());
        assert!(matches!(result, Err(ActionError::RecordNotFound(_))));
    }

    #[test]
    fn test_noop() {
        assert!(NoopAction.apply("any", &Parameters::new()).is_ok());
    }
}
