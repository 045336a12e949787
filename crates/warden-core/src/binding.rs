use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::check::CheckRegistry;
use crate::error::{PermissionError, RuleError};
use crate::expression::{Expression, ExpressionBuilder, RuleSpec};
use crate::model::Operation;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationRules {
    pub create: Option<RuleSpec>,
    pub read: Option<RuleSpec>,
    pub update: Option<RuleSpec>,
    pub delete: Option<RuleSpec>,
}

impl OperationRules {
    pub fn get(&self, operation: Operation) -> Option<&RuleSpec> {
        match operation {
            Operation::Create => self.create.as_ref(),
            Operation::Read => self.read.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
        }
    }

    pub fn set(&mut self, operation: Operation, rule: RuleSpec) -> &mut Self {
        let slot = match operation {
            Operation::Create => &mut self.create,
            Operation::Read => &mut self.read,
            Operation::Update => &mut self.update,
            Operation::Delete => &mut self.delete,
        };
        *slot = Some(rule);
        self
    }
}

/// Rules declared for one entity type: entity-level rules plus per-field rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPolicy {
    #[serde(flatten)]
    pub rules: OperationRules,
    #[serde(default)]
    pub fields: BTreeMap<String, OperationRules>,
}

impl EntityPolicy {
    pub fn with_rule(mut self, operation: Operation, rule: RuleSpec) -> Self {
        self.rules.set(operation, rule);
        self
    }

    pub fn with_field_rule(
        mut self,
        field: impl Into<String>,
        operation: Operation,
        rule: RuleSpec,
    ) -> Self {
        self.fields
            .entry(field.into())
            .or_default()
            .set(operation, rule);
        self
    }
}

/// Source of declared rules, keyed by entity type.
pub trait EntityDictionary: Send + Sync {
    fn policy(&self, entity_type: &str) -> Option<EntityPolicy>;

    fn entity_types(&self) -> Vec<String>;
}

impl EntityDictionary for HashMap<String, EntityPolicy> {
    fn policy(&self, entity_type: &str) -> Option<EntityPolicy> {
        self.get(entity_type).cloned()
    }

    fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Compiled rules of one entity type.
#[derive(Debug, Default)]
pub struct EntityBindings {
    entity: HashMap<Operation, Arc<Expression>>,
    fields: HashMap<String, HashMap<Operation, Arc<Expression>>>,
}

impl EntityBindings {
    pub fn compile(policy: &EntityPolicy, registry: &CheckRegistry) -> Result<Self, RuleError> {
        let builder = ExpressionBuilder::new(registry);
        let compile = |rules: &OperationRules| -> Result<HashMap<_, _>, RuleError> {
            let mut compiled = HashMap::new();
            for operation in Operation::ALL {
                if let Some(rule) = rules.get(operation) {
                    compiled.insert(operation, Arc::new(builder.build(rule)?));
                }
            }
            Ok(compiled)
        };

        let entity = compile(&policy.rules)?;
        let mut fields = HashMap::new();
        for (field, rules) in &policy.fields {
            fields.insert(field.clone(), compile(rules)?);
        }
        Ok(Self { entity, fields })
    }

    pub fn entity_rule(&self, operation: Operation) -> Option<&Arc<Expression>> {
        self.entity.get(&operation)
    }

    pub fn field_rule(&self, field: &str, operation: Operation) -> Option<&Arc<Expression>> {
        self.fields.get(field)?.get(&operation)
    }

    pub fn bound_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        fields.sort_unstable();
        fields
    }
}

type Resolution = Result<Arc<EntityBindings>, RuleError>;

/// Process-wide binding cache. Each entity type is compiled on first use and
/// the outcome, success or failure, is kept for the life of the registry.
pub struct BindingRegistry {
    dictionary: Arc<dyn EntityDictionary>,
    checks: CheckRegistry,
    resolved: RwLock<HashMap<String, Resolution>>,
}

impl BindingRegistry {
    pub fn new(dictionary: Arc<dyn EntityDictionary>, checks: CheckRegistry) -> Self {
        Self {
            dictionary,
            checks,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    pub fn bindings(&self, entity_type: &str) -> Result<Arc<EntityBindings>, PermissionError> {
        let cached = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_type)
            .cloned();
        let resolution = match cached {
            Some(resolution) => resolution,
            None => self.resolve(entity_type)?,
        };
        resolution.map_err(|source| PermissionError::InvalidRuleSpecification {
            entity_type: entity_type.to_string(),
            source,
        })
    }

    /// Compiles every entity type the dictionary knows, failing on the first
    /// invalid one.
    pub fn resolve_all(&self) -> Result<Vec<String>, PermissionError> {
        let entity_types = self.dictionary.entity_types();
        for entity_type in &entity_types {
            self.bindings(entity_type)?;
        }
        Ok(entity_types)
    }

    fn resolve(&self, entity_type: &str) -> Result<Resolution, PermissionError> {
        let policy = self
            .dictionary
            .policy(entity_type)
            .ok_or_else(|| PermissionError::UnknownEntity(entity_type.to_string()))?;

        let resolution = EntityBindings::compile(&policy, &self.checks).map(Arc::new);
        match &resolution {
            Ok(_) => tracing::debug!(entity_type, "permission bindings resolved"),
            Err(e) => tracing::error!(entity_type, error = %e, "invalid permission rules"),
        }

        let mut resolved = self
            .resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(resolved
            .entry(entity_type.to_string())
            .or_insert(resolution)
            .clone())
    }
}
