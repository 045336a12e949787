use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::binding::{EntityDictionary, EntityPolicy};
use crate::check::{
    AllowAll, CheckRegistry, CollectionLimit, DenyAll, FieldEquals, HasRole, OwnerMatches,
    PrincipalIs, Transition,
};
use crate::error::RuleError;

/// Named check instance declared in a policy document.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum CheckDefinition {
    Allow,
    Deny,
    Role {
        role: String,
    },
    Principal {
        id: String,
    },
    Owner {
        field: String,
    },
    FieldEquals {
        field: String,
        value: Value,
    },
    Transition {
        field: String,
        allow: Vec<(Value, Value)>,
    },
    CollectionLimit {
        field: String,
        max_added: usize,
    },
}

impl CheckDefinition {
    fn validate(&self, name: &str) -> Result<(), RuleError> {
        let invalid = |message: &str| RuleError::InvalidCheckDefinition {
            name: name.to_string(),
            message: message.to_string(),
        };
        match self {
            CheckDefinition::Role { role } if role.is_empty() => Err(invalid("role is empty")),
            CheckDefinition::Principal { id } if id.is_empty() => Err(invalid("id is empty")),
            CheckDefinition::Owner { field }
            | CheckDefinition::FieldEquals { field, .. }
            | CheckDefinition::CollectionLimit { field, .. }
                if field.is_empty() =>
            {
                Err(invalid("field is empty"))
            }
            CheckDefinition::Transition { field, allow } => {
                if field.is_empty() {
                    return Err(invalid("field is empty"));
                }
                if allow.is_empty() {
                    return Err(invalid("transition allows no edges"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn register(self, name: &str, registry: &mut CheckRegistry) {
        match self {
            CheckDefinition::Allow => registry.register_user(name, || AllowAll),
            CheckDefinition::Deny => registry.register_user(name, || DenyAll),
            CheckDefinition::Role { role } => {
                registry.register_user(name, move || HasRole::new(role.clone()))
            }
            CheckDefinition::Principal { id } => {
                registry.register_user(name, move || PrincipalIs::new(id.clone()))
            }
            CheckDefinition::Owner { field } => {
                registry.register_operation(name, move || OwnerMatches::new(field.clone()))
            }
            CheckDefinition::FieldEquals { field, value } => registry
                .register_operation(name, move || FieldEquals::new(field.clone(), value.clone())),
            CheckDefinition::Transition { field, allow } => {
                registry.register_operation(name, move || {
                    allow
                        .iter()
                        .fold(Transition::new(field.clone()), |t, (from, to)| {
                            t.allow(from.clone(), to.clone())
                        })
                })
            }
            CheckDefinition::CollectionLimit { field, max_added } => registry
                .register_operation(name, move || CollectionLimit::new(field.clone(), max_added)),
        };
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("failed to parse policy: {0}")]
    Parse(String),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Check declarations plus per-entity rules, read from TOML.
///
/// ```toml
/// [checks."is editor"]
/// kind = "role"
/// role = "editor"
///
/// [entities.book]
/// read = { any = ["allow all"] }
/// update = { expression = "is editor AND NOT deny all" }
///
/// [entities.book.fields.royalty]
/// read = { all = ["is editor"] }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyDocument {
    pub checks: BTreeMap<String, CheckDefinition>,
    pub entities: BTreeMap<String, EntityPolicy>,
}

impl PolicyDocument {
    pub fn from_toml_str(input: &str) -> Result<Self, PolicyError> {
        let document: Self = toml::from_str(input).map_err(|e| PolicyError::Parse(e.to_string()))?;
        for (name, definition) in &document.checks {
            definition.validate(name)?;
        }
        Ok(document)
    }

    /// Prefab checks plus every check the document declares. Declared names
    /// shadow prefab ones.
    pub fn check_registry(&self) -> CheckRegistry {
        let mut registry = CheckRegistry::with_prefab_checks();
        self.extend_registry(&mut registry);
        registry
    }

    pub fn extend_registry(&self, registry: &mut CheckRegistry) {
        for (name, definition) in &self.checks {
            definition.clone().register(name, registry);
        }
    }
}

impl EntityDictionary for PolicyDocument {
    fn policy(&self, entity_type: &str) -> Option<EntityPolicy> {
        self.entities.get(entity_type).cloned()
    }

    fn entity_types(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::RuleSpec;
    use crate::model::Operation;

    const POLICY: &str = r#"
        [checks."is editor"]
        kind = "role"
        role = "editor"

        [checks."is owner"]
        kind = "owner"
        field = "owner"

        [checks."publish flow"]
        kind = "transition"
        field = "status"
        allow = [["DRAFT", "PUBLISHED"]]

        [checks."few tags"]
        kind = "collection_limit"
        field = "tags"
        max_added = 2

        [entities.book]
        read = { any = ["allow all"] }
        update = { expression = "is editor AND publish flow" }
        delete = { all = ["is owner"] }

        [entities.book.fields.royalty]
        read = { any = ["is editor", "is owner"] }
    "#;

    #[test]
    fn parses_checks_and_entities() {
        let document = PolicyDocument::from_toml_str(POLICY).unwrap();

        assert_eq!(document.checks.len(), 4);
        assert_eq!(
            document.checks["is editor"],
            CheckDefinition::Role {
                role: "editor".to_string()
            }
        );

        let book = document.policy("book").unwrap();
        assert_eq!(
            book.rules.get(Operation::Read),
            Some(&RuleSpec::Any(vec!["allow all".to_string()]))
        );
        assert_eq!(
            book.rules.get(Operation::Update),
            Some(&RuleSpec::Expression("is editor AND publish flow".to_string()))
        );
        assert!(book.rules.get(Operation::Create).is_none());
        assert_eq!(
            book.fields["royalty"].get(Operation::Read),
            Some(&RuleSpec::Any(vec![
                "is editor".to_string(),
                "is owner".to_string()
            ]))
        );
    }

    #[test]
    fn registry_holds_prefab_and_declared_checks() {
        let document = PolicyDocument::from_toml_str(POLICY).unwrap();
        let registry = document.check_registry();

        assert_eq!(
            registry.names(),
            vec![
                "allow all",
                "deny all",
                "few tags",
                "is editor",
                "is owner",
                "publish flow"
            ]
        );
    }

    #[test]
    fn unknown_check_kind_is_rejected() {
        let err = PolicyDocument::from_toml_str(
            r#"
            [checks.weird]
            kind = "astrology"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, PolicyError::Parse(_)), "expected Parse, got: {err}");
    }

    #[test]
    fn transition_without_edges_is_rejected() {
        let err = PolicyDocument::from_toml_str(
            r#"
            [checks."frozen"]
            kind = "transition"
            field = "status"
            allow = []
            "#,
        )
        .unwrap_err();

        assert!(
            matches!(
                err,
                PolicyError::Rule(RuleError::InvalidCheckDefinition { ref name, .. }) if name == "frozen"
            ),
            "expected InvalidCheckDefinition, got: {err}"
        );
    }

    #[test]
    fn empty_document_is_valid() {
        let document = PolicyDocument::from_toml_str("").unwrap();
        assert!(document.entity_types().is_empty());
        assert_eq!(document.check_registry().names(), vec!["allow all", "deny all"]);
    }
}
