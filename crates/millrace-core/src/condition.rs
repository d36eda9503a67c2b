//! Edge condition predicates.
//!
//! A condition decides whether an edge fires once all of its source nodes
//! have finished. Conditions read upstream task results through a
//! [`StorageView`] and see the flow's current `node_args`; they must be
//! side-effect-free.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::storage::StorageView;

/// Predicate evaluated over upstream storage and the flow arguments.
pub trait Condition: Send + Sync {
    fn evaluate(&self, storage: &StorageView<'_>, node_args: Option<&Value>) -> Result<bool>;
}

/// Adapter turning a plain function or closure into a [`Condition`].
pub struct FnCondition<F>(F);

impl<F> Condition for FnCondition<F>
where
    F: Fn(&StorageView<'_>, Option<&Value>) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, storage: &StorageView<'_>, node_args: Option<&Value>) -> Result<bool> {
        (self.0)(storage, node_args)
    }
}

/// Wrap a function or closure as a condition.
pub fn from_fn<F>(f: F) -> FnCondition<F>
where
    F: Fn(&StorageView<'_>, Option<&Value>) -> Result<bool> + Send + Sync,
{
    FnCondition(f)
}

/// Fires unconditionally. The default condition in flow definitions.
#[derive(Debug, Clone, Copy)]
pub struct Always;

impl Condition for Always {
    fn evaluate(&self, _storage: &StorageView<'_>, _node_args: Option<&Value>) -> Result<bool> {
        Ok(true)
    }
}

/// Never fires. Used to cut recursive edges off in definitions under test.
#[derive(Debug, Clone, Copy)]
pub struct Never;

impl Condition for Never {
    fn evaluate(&self, _storage: &StorageView<'_>, _node_args: Option<&Value>) -> Result<bool> {
        Ok(false)
    }
}

/// Fires iff the flow has non-null `node_args`.
#[derive(Debug, Clone, Copy)]
pub struct ArgsSet;

impl Condition for ArgsSet {
    fn evaluate(&self, _storage: &StorageView<'_>, node_args: Option<&Value>) -> Result<bool> {
        Ok(node_args.is_some_and(|args| !args.is_null()))
    }
}

/// Named collection of condition predicates, consulted by the flow
/// definition compiler when resolving the `condition` field of an edge.
#[derive(Default)]
pub struct ConditionRegistry {
    conditions: HashMap<String, Arc<dyn Condition>>,
}

impl ConditionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the built-in conditions:
    /// `always`, `never`, and `args_set`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("always", Arc::new(Always));
        registry.register("never", Arc::new(Never));
        registry.register("args_set", Arc::new(ArgsSet));
        registry
    }

    /// Register a condition under a name. Replaces and returns any
    /// previously registered condition with the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        condition: Arc<dyn Condition>,
    ) -> Option<Arc<dyn Condition>> {
        self.conditions.insert(name.into(), condition)
    }

    /// Look up a condition by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Condition>> {
        self.conditions.get(name).cloned()
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionRegistry")
            .field("conditions", &self.conditions.keys().collect::<Vec<_>>())
            .finish()
    }
}
