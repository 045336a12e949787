mod prefab;
mod registry;

pub use prefab::{
    AllowAll, CollectionLimit, DenyAll, FieldEquals, HasRole, OwnerMatches, PrincipalIs,
    Transition,
};
pub use registry::{CheckFactory, CheckRegistry};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::change::ChangeSpec;
use crate::error::CheckError;
use crate::model::{Principal, Resource};

/// Answers from the principal alone. Must be pure: results are cached for
/// the lifetime of the request scope.
pub trait UserCheck: Send + Sync {
    fn ok(&self, principal: &Principal) -> bool;
}

impl<F> UserCheck for F
where
    F: Fn(&Principal) -> bool + Send + Sync,
{
    fn ok(&self, principal: &Principal) -> bool {
        self(principal)
    }
}

pub struct CheckInput<'a> {
    pub check: &'a str,
    pub principal: &'a Principal,
    pub resource: Option<&'a Resource>,
    pub change: &'a ChangeSpec,
}

impl<'a> CheckInput<'a> {
    pub fn resource(&self) -> Result<&'a Resource, CheckError> {
        self.resource
            .ok_or_else(|| CheckError::MissingResource(self.check.to_string()))
    }

    pub fn fail(&self, message: impl Into<String>) -> CheckError {
        CheckError::Failed {
            check: self.check.to_string(),
            message: message.into(),
        }
    }
}

/// Answers from the principal, the target resource and the pending change.
///
/// `Ok(false)` is a denial; `Err` is reserved for defects such as being
/// invoked without the resource the check needs.
#[async_trait]
pub trait OperationCheck: Send + Sync {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError>;

    fn cacheable(&self) -> bool {
        true
    }

    /// Needs a populated `ChangeSpec`; evaluates to DEFER until one exists.
    fn requires_change(&self) -> bool {
        false
    }

    /// Needs committed state; evaluates to DEFER while the resource is under
    /// construction.
    fn requires_persisted(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub enum Check {
    User(Arc<dyn UserCheck>),
    Operation(Arc<dyn OperationCheck>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    User,
    Operation,
}

impl Check {
    pub fn user(check: impl UserCheck + 'static) -> Self {
        Check::User(Arc::new(check))
    }

    pub fn operation(check: impl OperationCheck + 'static) -> Self {
        Check::Operation(Arc::new(check))
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            Check::User(_) => CheckKind::User,
            Check::Operation(_) => CheckKind::Operation,
        }
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::User(_) => f.write_str("Check::User"),
            Check::Operation(_) => f.write_str("Check::Operation"),
        }
    }
}

/// A check bound to the name rules refer to it by. The name doubles as the
/// check's identity in the request cache.
#[derive(Debug, Clone)]
pub struct CheckRef {
    name: Arc<str>,
    check: Check,
}

impl CheckRef {
    pub fn new(name: impl Into<Arc<str>>, check: Check) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self) -> &Check {
        &self.check
    }
}

type OperationFnBody = dyn Fn(&CheckInput<'_>) -> Result<bool, CheckError> + Send + Sync;

/// Adapts a synchronous closure into an [`OperationCheck`].
pub struct OperationFn {
    body: Box<OperationFnBody>,
    cacheable: bool,
    requires_change: bool,
    requires_persisted: bool,
}

impl OperationFn {
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&CheckInput<'_>) -> Result<bool, CheckError> + Send + Sync + 'static,
    {
        Self {
            body: Box::new(body),
            cacheable: true,
            requires_change: false,
            requires_persisted: false,
        }
    }

    pub fn non_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Also disables caching: cache entries are keyed without the change.
    pub fn requiring_change(mut self) -> Self {
        self.requires_change = true;
        self.cacheable = false;
        self
    }

    pub fn requiring_persisted(mut self) -> Self {
        self.requires_persisted = true;
        self
    }
}

#[async_trait]
impl OperationCheck for OperationFn {
    async fn ok(&self, input: &CheckInput<'_>) -> Result<bool, CheckError> {
        (self.body)(input)
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    fn requires_change(&self) -> bool {
        self.requires_change
    }

    fn requires_persisted(&self) -> bool {
        self.requires_persisted
    }
}
