use async_trait::async_trait;
use serde_json::Value;

use crate::error::CheckError;
use crate::model::Principal;

use super::{CheckInput, OperationCheck, UserCheck};

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl UserCheck for AllowAll {
    fn ok(&self, _principal: &Principal) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl UserCheck for DenyAll {
    fn ok(&self, _principal: &Principal) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct HasRole {
    role: String,
}

impl HasRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl UserCheck for HasRole {
    fn ok(&self, principal: &Principal) -> bool {
        principal.has_role(&self.role)
    }
}

#[derive(Debug, Clone)]
pub struct PrincipalIs {
    id: String,
}

impl PrincipalIs {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl UserCheck for PrincipalIs {
    fn ok(&self, principal: &Principal) -> bool {
        principal.id == self.id
    }
}

/// Grants when `field` on the resource holds the principal's id. The owner is
/// only meaningful once the resource is committed.
#[derive(Debug, Clone)]
pub struct OwnerMatches {
    field: String,
}

impl OwnerMatches {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

#[async_trait]
impl OperationCheck for OwnerMatches {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError> {
        let resource = input.resource()?;
        Ok(match resource.get(&self.field) {
            Some(Value::String(owner)) => owner == input.principal.id,
            Some(Value::Number(owner)) => owner.to_string() == input.principal.id,
            _ => false,
        })
    }

    fn requires_persisted(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct FieldEquals {
    field: String,
    value: Value,
}

impl FieldEquals {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl OperationCheck for FieldEquals {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError> {
        let resource = input.resource()?;
        Ok(resource.get(&self.field).as_ref() == Some(&self.value))
    }
}

/// Allows a scalar change of `field` only along the listed `(from, to)` edges.
/// Changes to other fields pass through untouched.
#[derive(Debug, Clone)]
pub struct Transition {
    field: String,
    allowed: Vec<(Value, Value)>,
}

impl Transition {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            allowed: Vec::new(),
        }
    }

    pub fn allow(mut self, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        self.allowed.push((from.into(), to.into()));
        self
    }
}

#[async_trait]
impl OperationCheck for Transition {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError> {
        if input.change.field_name() != Some(self.field.as_str()) {
            return Ok(true);
        }
        let Some((prior, proposed)) = input.change.transition() else {
            return Err(input.fail(format!("'{}' is not a scalar field", self.field)));
        };
        if prior == proposed {
            return Ok(true);
        }
        Ok(self
            .allowed
            .iter()
            .any(|(from, to)| from == prior && to == proposed))
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn requires_change(&self) -> bool {
        true
    }
}

/// Caps how many members a single update may add to a to-many field.
#[derive(Debug, Clone)]
pub struct CollectionLimit {
    field: String,
    max_added: usize,
}

impl CollectionLimit {
    pub fn new(field: impl Into<String>, max_added: usize) -> Self {
        Self {
            field: field.into(),
            max_added,
        }
    }
}

#[async_trait]
impl OperationCheck for CollectionLimit {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError> {
        if input.change.field_name() != Some(self.field.as_str()) {
            return Ok(true);
        }
        Ok(input.change.added().len() <= self.max_added)
    }

    fn cacheable(&self) -> bool {
        false
    }

    fn requires_change(&self) -> bool {
        true
    }
}
