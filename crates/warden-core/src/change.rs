use serde_json::Value;

/// Pending mutation of a single field, as seen by the checks guarding it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ChangeSpec {
    #[default]
    NoChange,
    Field {
        field: String,
        prior: Value,
        proposed: Value,
    },
    Collection {
        field: String,
        added: Vec<Value>,
        removed: Vec<Value>,
    },
}

impl ChangeSpec {
    pub fn field(field: impl Into<String>, prior: Value, proposed: Value) -> Self {
        ChangeSpec::Field {
            field: field.into(),
            prior,
            proposed,
        }
    }

    /// Builds the membership differential between two states of a to-many field.
    /// Membership is compared by value; duplicates count once.
    pub fn collection(field: impl Into<String>, before: &[Value], after: &[Value]) -> Self {
        let mut added = Vec::new();
        for value in after {
            if !before.contains(value) && !added.contains(value) {
                added.push(value.clone());
            }
        }
        let mut removed = Vec::new();
        for value in before {
            if !after.contains(value) && !removed.contains(value) {
                removed.push(value.clone());
            }
        }
        ChangeSpec::Collection {
            field: field.into(),
            added,
            removed,
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeSpec::NoChange)
    }

    pub fn field_name(&self) -> Option<&str> {
        match self {
            ChangeSpec::NoChange => None,
            ChangeSpec::Field { field, .. } | ChangeSpec::Collection { field, .. } => Some(field),
        }
    }

    /// `(prior, proposed)` for a scalar change.
    pub fn transition(&self) -> Option<(&Value, &Value)> {
        match self {
            ChangeSpec::Field {
                prior, proposed, ..
            } => Some((prior, proposed)),
            _ => None,
        }
    }

    pub fn added(&self) -> &[Value] {
        match self {
            ChangeSpec::Collection { added, .. } => added,
            _ => &[],
        }
    }

    pub fn removed(&self) -> &[Value] {
        match self {
            ChangeSpec::Collection { removed, .. } => removed,
            _ => &[],
        }
    }
}
