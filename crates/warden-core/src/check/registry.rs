use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::RuleError;

use super::{AllowAll, Check, CheckRef, DenyAll, OperationCheck, UserCheck};

pub type CheckFactory = Arc<dyn Fn() -> Check + Send + Sync>;

/// Name → constructor table consulted when rules are compiled.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    factories: HashMap<String, CheckFactory>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `allow all` and `deny all`.
    pub fn with_prefab_checks() -> Self {
        let mut registry = Self::new();
        registry.register_user("allow all", || AllowAll);
        registry.register_user("deny all", || DenyAll);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Check + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_user<C, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        C: UserCheck + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.register(name, move || Check::user(factory()))
    }

    pub fn register_operation<C, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        C: OperationCheck + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.register(name, move || Check::operation(factory()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<CheckRef, RuleError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RuleError::UnknownCheck(name.to_string()))?;
        Ok(CheckRef::new(name, factory()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckRegistry")
            .field("checks", &self.names())
            .finish()
    }
}
