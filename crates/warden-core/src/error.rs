use std::fmt;

use crate::model::Operation;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("syntax error in rule '{rule}': {message}")]
    Syntax { rule: String, message: String },

    #[error("unknown check: '{0}'")]
    UnknownCheck(String),

    #[error("rule must name at least one check")]
    EmptyCheckList,

    #[error("invalid definition for check '{name}': {message}")]
    InvalidCheckDefinition { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("check '{0}' requires a resource but none was supplied")]
    MissingResource(String),

    #[error("check '{check}' failed: {message}")]
    Failed { check: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionError {
    #[error("invalid rule specification for '{entity_type}': {source}")]
    InvalidRuleSpecification {
        entity_type: String,
        source: RuleError,
    },

    #[error("check invocation error: {0}")]
    CheckInvocation(#[from] CheckError),

    #[error("forbidden: {}", describe(.operation, .entity_type, .field))]
    Forbidden {
        operation: Operation,
        entity_type: String,
        field: Option<String>,
    },

    #[error("deferred check never resolved: {}", describe(.operation, .entity_type, .field))]
    DeferredResolution {
        operation: Operation,
        entity_type: String,
        field: Option<String>,
    },

    #[error("permission evaluation timed out: {operation} on '{entity_type}'")]
    Timeout {
        operation: Operation,
        entity_type: String,
    },

    #[error("entity type not bound: {0}")]
    UnknownEntity(String),
}

impl PermissionError {
    pub fn forbidden(operation: Operation, entity_type: &str, field: Option<&str>) -> Self {
        PermissionError::Forbidden {
            operation,
            entity_type: entity_type.to_string(),
            field: field.map(str::to_string),
        }
    }

    /// A user-facing authorization outcome, as opposed to a defect or an
    /// undetermined evaluation.
    pub fn is_denial(&self) -> bool {
        matches!(self, PermissionError::Forbidden { .. })
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            PermissionError::InvalidRuleSpecification { .. }
                | PermissionError::CheckInvocation(_)
                | PermissionError::DeferredResolution { .. }
        )
    }
}

fn describe<'a>(
    operation: &Operation,
    entity_type: &'a str,
    field: &'a Option<String>,
) -> impl fmt::Display + 'a {
    struct Target<'a>(Operation, &'a str, Option<&'a str>);

    impl fmt::Display for Target<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} on '{}'", self.0, self.1)?;
            if let Some(field) = self.2 {
                write!(f, " field '{field}'")?;
            }
            Ok(())
        }
    }

    Target(*operation, entity_type, field.as_deref())
}
