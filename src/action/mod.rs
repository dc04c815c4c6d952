//! Per-record actions
//!
//! An action is a named transformation applied to one record at a time. The
//! registry is built once at startup and shared by the bulk service (which
//! rejects unknown actions at submission) and the worker pool.

mod builtin;

pub use builtin::{NoopAction, SetPropertiesAction, NOOP_ACTION, SET_PROPERTIES_ACTION};

use crate::bulk::Parameters;
use crate::error::ActionResult;
use crate::selection::SqliteRepository;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handler applied to each record of a bucket
pub trait ActionHandler: Send + Sync {
    /// Apply the action to one record
    fn apply(&self, record_id: &str, parameters: &Parameters) -> ActionResult<()>;
}

/// Registry of actions by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop` and `setProperties` bound to a repository
    pub fn with_builtins(repository: SqliteRepository) -> Self {
        Self::new()
            .with(NOOP_ACTION, NoopAction)
            .with(SET_PROPERTIES_ACTION, SetPropertiesAction::new(repository))
    }

    /// Register a handler, replacing any handler with the same name
    pub fn register(&mut self, name: &str, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Builder-style [`ActionRegistry::register`]
    pub fn with<H: ActionHandler + 'static>(mut self, name: &str, handler: H) -> Self {
        self.register(name, Arc::new(handler));
        self
    }

    /// Look up a handler
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Whether an action is registered
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ActionError;

    struct Reject;

    impl ActionHandler for Reject {
        fn apply(&self, record_id: &str, _parameters: &Parameters) -> ActionResult<()> {
            Err(ActionError::Failed {
                record_id: record_id.to_string(),
                reason: "rejected".into(),
            })
        }
    }

    #[test]
    fn test_registry_lookup() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let registry = ActionRegistry::with_builtins(repo).with("reject", Reject);

        assert_eq!(registry.names(), vec!["noop", "reject", "setProperties"]);
        assert!(registry.contains("noop"));
        assert!(!registry.contains("missing"));
        assert!(registry.get("missing").is_none());

        let reject = registry.get("reject").unwrap();
        assert!(reject.apply("r1", &Parameters::new()).is_err());
    }
}
