use crate::action::{Action, ActionDescriptor};
use crate::builtins::{FinishAction, InvalidAction, NoAction};
use arbor_core::{ArborError, ArborResult};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// Collects actions before the registry is frozen.
///
/// `finish`, `invalid_action` and `no_action` are always present.
pub struct ActionRegistryBuilder {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistryBuilder {
    /// Builder pre-loaded with the sentinel actions.
    pub fn new() -> Self {
        let mut actions: BTreeMap<String, Arc<dyn Action>> = BTreeMap::new();
        let sentinels: [Arc<dyn Action>; 3] = [
            Arc::new(FinishAction::new()),
            Arc::new(InvalidAction::new()),
            Arc::new(NoAction::new()),
        ];
        for action in sentinels {
            actions.insert(action.descriptor().name.clone(), action);
        }
        Self { actions }
    }

    /// Add an action. A name that is already taken is an error.
    pub fn register(mut self, action: Arc<dyn Action>) -> ArborResult<Self> {
        let name = action.descriptor().name.clone();
        if name.trim().is_empty() {
            return Err(ArborError::Validation(
                "action name must not be empty".to_string(),
            ));
        }
        if self.actions.contains_key(&name) {
            return Err(ArborError::DuplicateAction(name));
        }
        info!(action = %name, "Registered action");
        self.actions.insert(name, action);
        Ok(self)
    }

    /// Add several actions, stopping at the first duplicate.
    pub fn register_all(
        self,
        actions: impl IntoIterator<Item = Arc<dyn Action>>,
    ) -> ArborResult<Self> {
        actions
            .into_iter()
            .try_fold(self, |builder, action| builder.register(action))
    }

    /// Freeze the registry.
    pub fn build(self) -> ActionRegistry {
        info!(action_count = self.actions.len(), "Action registry built");
        ActionRegistry {
            actions: self.actions,
        }
    }
}

impl Default for ActionRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable, name-keyed catalog of actions.
///
/// Shared behind an `Arc` once built; no locking is needed.
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Start a builder.
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    /// Registry holding only the sentinel actions.
    pub fn with_builtins() -> Self {
        ActionRegistryBuilder::new().build()
    }

    /// Look up an action by name.
    pub fn get(&self, name: &str) -> ArborResult<&Arc<dyn Action>> {
        self.actions
            .get(name)
            .ok_or_else(|| ArborError::ActionNotFound(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Always false: the sentinels are always registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Descriptors sorted by name.
    pub fn catalog(&self) -> Vec<ActionDescriptor> {
        self.actions
            .values()
            .map(|a| a.descriptor().clone())
            .collect()
    }

    /// Text rendering of the catalog for planning prompts.
    ///
    /// Actions are sorted by name and parameters keep declaration order, so
    /// the output is identical for identical registries.
    pub fn render_catalog(&self) -> String {
        let mut out = String::from("Available Actions:\n");
        for action in self.actions.values() {
            let d = action.descriptor();
            let _ = writeln!(out, "- Action: {}", d.name);
            let _ = writeln!(out, "  Description: {}", d.description);
            if d.parameters.is_empty() {
                out.push_str("  Parameters: None\n");
            } else {
                out.push_str("  Parameters:\n");
                for p in &d.parameters {
                    let _ = write!(
                        out,
                        "    - {} (type: {}, required: {}): {}",
                        p.name, p.param_type, p.required, p.description
                    );
                    if let Some(default) = &p.default {
                        let _ = write!(out, " [default: {default}]");
                    }
                    out.push('\n');
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::builtins::EchoAction;

    #[test]
    fn test_sentinels_always_present() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["finish", "invalid_action", "no_action"]);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = ActionRegistry::builder()
            .register(Arc::new(EchoAction::new()))
            .unwrap()
            .register(Arc::new(EchoAction::new()));
        match result {
            Err(ArborError::DuplicateAction(name)) => assert_eq!(name, "echo"),
            _ => panic!("expected duplicate error"),
        }
    }

    #[test]
    fn test_sentinel_cannot_be_replaced() {
        let result = ActionRegistry::builder().register(Arc::new(FinishAction::new()));
        assert!(matches!(result, Err(ArborError::DuplicateAction(_))));
    }

    #[test]
    fn test_unknown_lookup_is_not_found() {
        let registry = ActionRegistry::with_builtins();
        match registry.get("teleport") {
            Err(ArborError::ActionNotFound(name)) => assert_eq!(name, "teleport"),
            _ => panic!("expected not found"),
        }
    }

    #[test]
    fn test_render_catalog_is_deterministic() {
        let build = || {
            ActionRegistry::builder()
                .register(Arc::new(EchoAction::new()))
                .unwrap()
                .build()
        };
        let a = build().render_catalog();
        let b = build().render_catalog();
        assert_eq!(a, b);
        assert!(a.starts_with("Available Actions:\n- Action: echo\n"));
        assert!(a.contains("    - message (type: string, required: true): "));
        assert!(a.contains("    - repeat (type: integer, required: false): "));
        assert!(a.contains("[default: 1]"));
        assert!(a.contains("- Action: no_action\n"));
        assert!(a.contains("  Parameters: None\n"));
    }

    #[test]
    fn test_catalog_sorted() {
        let registry = ActionRegistry::builder()
            .register(Arc::new(EchoAction::new()))
            .unwrap()
            .build();
        let names: Vec<String> = registry.catalog().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "finish", "invalid_action", "no_action"]);
    }
}
