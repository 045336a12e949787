use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::audit;
use crate::binding::{BindingRegistry, EntityBindings};
use crate::change::ChangeSpec;
use crate::error::PermissionError;
use crate::expression::{EvaluationContext, Expression, Verdict};
use crate::metrics::Metrics;
use crate::model::{Operation, Resource};
use crate::scope::{DeferredCheck, RequestScope};

/// Lifecycle of one permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Evaluating,
    Deferred,
    Allowed,
    Denied,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationState::Pending => "pending",
            OperationState::Evaluating => "evaluating",
            OperationState::Deferred => "deferred",
            OperationState::Allowed => "allowed",
            OperationState::Denied => "denied",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Visible,
    Filtered,
}

static NO_CHANGE: ChangeSpec = ChangeSpec::NoChange;

/// One operation on one entity, optionally narrowed to a field.
#[derive(Debug, Clone, Copy)]
pub struct PermissionRequest<'a> {
    pub operation: Operation,
    pub entity_type: &'a str,
    pub resource: Option<&'a Resource>,
    pub field: Option<&'a str>,
    pub change: &'a ChangeSpec,
}

impl<'a> PermissionRequest<'a> {
    pub fn new(operation: Operation, entity_type: &'a str) -> Self {
        Self {
            operation,
            entity_type,
            resource: None,
            field: None,
            change: &NO_CHANGE,
        }
    }

    pub fn on(mut self, resource: &'a Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn field(mut self, field: &'a str) -> Self {
        self.field = Some(field);
        self
    }

    pub fn change(mut self, change: &'a ChangeSpec) -> Self {
        self.change = change;
        self
    }

    fn entity_level(self) -> Self {
        Self {
            field: None,
            ..self
        }
    }
}

/// Looks up compiled rules, evaluates them in a request scope and enforces
/// the verdict.
pub struct PermissionExecutor {
    bindings: Arc<BindingRegistry>,
    metrics: Arc<Metrics>,
}

impl PermissionExecutor {
    pub fn new(bindings: Arc<BindingRegistry>) -> Self {
        Self {
            bindings,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }

    /// Evaluates the most specific rule bound to the request: the field rule
    /// when one exists, otherwise the entity rule. No rule means allowed.
    pub async fn check_permission(
        &self,
        scope: &RequestScope,
        request: PermissionRequest<'_>,
    ) -> Result<(), PermissionError> {
        let bindings = self.bindings.bindings(request.entity_type)?;
        let expression = request
            .field
            .and_then(|field| bindings.field_rule(field, request.operation))
            .or_else(|| bindings.entity_rule(request.operation));

        let Some(expression) = expression else {
            log_transition(scope, &request, OperationState::Pending, OperationState::Allowed);
            return Ok(());
        };
        let verdict = self.evaluate(scope, &request, expression).await?;
        self.settle(scope, &request, verdict, expression)
    }

    /// Entity rule first, then the field rule. A field denied on READ is
    /// reported as filtered rather than failing the request.
    pub async fn check_field_aware_permission(
        &self,
        scope: &RequestScope,
        request: PermissionRequest<'_>,
    ) -> Result<FieldAccess, PermissionError> {
        self.check_permission(scope, request.entity_level()).await?;
        let Some(field) = request.field else {
            return Ok(FieldAccess::Visible);
        };
        let bindings = self.bindings.bindings(request.entity_type)?;
        self.field_access(scope, &request, field, &bindings).await
    }

    /// Removes every field the principal may not read from `representation`
    /// and returns the names removed. Fails if the entity itself is not
    /// readable.
    pub async fn filter_fields(
        &self,
        scope: &RequestScope,
        entity_type: &str,
        resource: &Resource,
        representation: &mut Map<String, Value>,
    ) -> Result<Vec<String>, PermissionError> {
        let read = PermissionRequest::new(Operation::Read, entity_type).on(resource);
        self.check_permission(scope, read).await?;

        let bindings = self.bindings.bindings(entity_type)?;
        let mut omitted = Vec::new();
        for field in bindings.bound_fields() {
            if !representation.contains_key(field) {
                continue;
            }
            let access = self
                .field_access(scope, &read.field(field), field, &bindings)
                .await?;
            if access == FieldAccess::Filtered {
                representation.remove(field);
                omitted.push(field.to_string());
            }
        }
        Ok(omitted)
    }

    pub async fn is_field_readable(
        &self,
        scope: &RequestScope,
        entity_type: &str,
        resource: &Resource,
        field: &str,
    ) -> Result<bool, PermissionError> {
        let request = PermissionRequest::new(Operation::Read, entity_type)
            .on(resource)
            .field(field);
        match self.check_field_aware_permission(scope, request).await {
            Ok(access) => Ok(access == FieldAccess::Visible),
            Err(e) if e.is_denial() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sets a scalar field under UPDATE permission. The rule is checked
    /// against the current state, the value is applied, and the rule is
    /// checked again with the change; a denial restores the prior value.
    pub async fn update_field(
        &self,
        scope: &RequestScope,
        entity_type: &str,
        resource: &Resource,
        field: &str,
        proposed: Value,
    ) -> Result<ChangeSpec, PermissionError> {
        let prior = resource.get(field);
        let change = ChangeSpec::field(field, prior.clone().unwrap_or(Value::Null), proposed.clone());
        self.guarded_update(scope, entity_type, resource, field, prior, proposed, change)
            .await
    }

    /// Replaces the members of a to-many field under UPDATE permission, with
    /// the same protocol as [`update_field`](Self::update_field).
    pub async fn update_collection(
        &self,
        scope: &RequestScope,
        entity_type: &str,
        resource: &Resource,
        field: &str,
        members: Vec<Value>,
    ) -> Result<ChangeSpec, PermissionError> {
        let prior = resource.get(field);
        let before = match &prior {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };
        let change = ChangeSpec::collection(field, &before, &members);
        self.guarded_update(
            scope,
            entity_type,
            resource,
            field,
            prior,
            Value::Array(members),
            change,
        )
        .await
    }

    /// Re-evaluates every check deferred during the request. Called by the
    /// store after keys are assigned and before anything is published.
    pub async fn execute_commit_checks(&self, scope: &RequestScope) -> Result<(), PermissionError> {
        let deferred = scope.take_deferred();
        tracing::debug!(
            request_id = %scope.request_id(),
            count = deferred.len(),
            "executing commit checks"
        );
        for check in &deferred {
            let request = PermissionRequest {
                operation: check.operation,
                entity_type: &check.entity_type,
                resource: Some(&check.resource),
                field: check.field.as_deref(),
                change: &check.change,
            };
            log_transition(scope, &request, OperationState::Deferred, OperationState::Evaluating);
            match self.evaluate(scope, &request, &check.expression).await? {
                Verdict::Allow => {
                    self.metrics.record_allowed();
                    log_transition(scope, &request, OperationState::Evaluating, OperationState::Allowed);
                }
                Verdict::Deny => return Err(self.deny(scope, &request)),
                Verdict::Defer => {
                    audit::audit_deferred_unresolved(
                        &scope.request_id(),
                        check.operation,
                        &check.entity_type,
                        deferred.len(),
                    );
                    return Err(PermissionError::DeferredResolution {
                        operation: check.operation,
                        entity_type: check.entity_type.clone(),
                        field: check.field.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Entity UPDATE rule, then the field UPDATE rule, before and after the
    /// mutation. Any DENY or error after the mutation restores the prior value.
    #[allow(clippy::too_many_arguments)]
    async fn guarded_update(
        &self,
        scope: &RequestScope,
        entity_type: &str,
        resource: &Resource,
        field: &str,
        prior: Option<Value>,
        next: Value,
        change: ChangeSpec,
    ) -> Result<ChangeSpec, PermissionError> {
        let bindings = self.bindings.bindings(entity_type)?;
        let request = PermissionRequest::new(Operation::Update, entity_type).on(resource);
        let field_request = request.field(field);
        let rules = [
            (request, bindings.entity_rule(Operation::Update)),
            (field_request, bindings.field_rule(field, Operation::Update)),
        ];

        for (request, expression) in &rules {
            if let Some(expression) = expression
                && self.evaluate(scope, request, expression).await? == Verdict::Deny
            {
                return Err(self.deny(scope, request));
            }
        }

        resource.set(field, next);

        for (request, expression) in &rules {
            let Some(expression) = expression else {
                continue;
            };
            let post = request.change(&change);
            let outcome = match self.evaluate(scope, &post, expression).await {
                Ok(verdict) => self.settle(scope, &post, verdict, expression),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                match prior {
                    Some(value) => resource.set(field, value),
                    None => resource.remove(field),
                };
                tracing::debug!(resource = %resource, field, "update reverted");
                return Err(e);
            }
        }
        Ok(change)
    }

    async fn field_access(
        &self,
        scope: &RequestScope,
        request: &PermissionRequest<'_>,
        field: &str,
        bindings: &EntityBindings,
    ) -> Result<FieldAccess, PermissionError> {
        let Some(expression) = bindings.field_rule(field, request.operation) else {
            return Ok(FieldAccess::Visible);
        };
        let verdict = self.evaluate(scope, request, expression).await?;
        if verdict == Verdict::Deny && request.operation == Operation::Read {
            self.metrics.record_filtered();
            audit::audit_field_filtered(
                &scope.request_id(),
                &scope.principal().id,
                request.entity_type,
                field,
            );
            return Ok(FieldAccess::Filtered);
        }
        self.settle(scope, request, verdict, expression)?;
        Ok(FieldAccess::Visible)
    }

    async fn evaluate(
        &self,
        scope: &RequestScope,
        request: &PermissionRequest<'_>,
        expression: &Expression,
    ) -> Result<Verdict, PermissionError> {
        self.metrics.record_evaluation();
        log_transition(scope, request, OperationState::Pending, OperationState::Evaluating);

        let ctx = EvaluationContext::new(scope)
            .with_resource(request.resource)
            .with_field(request.field)
            .with_change(request.change);
        let evaluation = expression.evaluate(&ctx);
        let verdict = match scope.deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, evaluation).await {
                Ok(result) => result?,
                Err(_) => {
                    self.metrics.record_timeout();
                    tracing::warn!(
                        request_id = %scope.request_id(),
                        operation = %request.operation,
                        entity_type = request.entity_type,
                        "permission evaluation exceeded deadline"
                    );
                    return Err(PermissionError::Timeout {
                        operation: request.operation,
                        entity_type: request.entity_type.to_string(),
                    });
                }
            },
            None => evaluation.await?,
        };
        tracing::debug!(
            request_id = %scope.request_id(),
            expression = %expression,
            %verdict,
            "expression evaluated"
        );
        Ok(verdict)
    }

    fn settle(
        &self,
        scope: &RequestScope,
        request: &PermissionRequest<'_>,
        verdict: Verdict,
        expression: &Arc<Expression>,
    ) -> Result<(), PermissionError> {
        match verdict {
            Verdict::Allow => {
                self.metrics.record_allowed();
                log_transition(scope, request, OperationState::Evaluating, OperationState::Allowed);
                Ok(())
            }
            Verdict::Deny => Err(self.deny(scope, request)),
            Verdict::Defer => {
                if matches!(request.operation, Operation::Create | Operation::Update)
                    && let Some(resource) = request.resource
                    && scope.is_under_construction(resource.id())
                {
                    self.metrics.record_deferred();
                    log_transition(scope, request, OperationState::Evaluating, OperationState::Deferred);
                    scope.defer(DeferredCheck {
                        operation: request.operation,
                        entity_type: request.entity_type.to_string(),
                        resource: resource.clone(),
                        field: request.field.map(str::to_string),
                        change: request.change.clone(),
                        expression: Arc::clone(expression),
                    });
                    return Ok(());
                }
                Err(PermissionError::DeferredResolution {
                    operation: request.operation,
                    entity_type: request.entity_type.to_string(),
                    field: request.field.map(str::to_string),
                })
            }
        }
    }

    fn deny(&self, scope: &RequestScope, request: &PermissionRequest<'_>) -> PermissionError {
        self.metrics.record_denied();
        log_transition(scope, request, OperationState::Evaluating, OperationState::Denied);
        audit::audit_permission_denied(
            &scope.request_id(),
            &scope.principal().id,
            request.operation,
            request.entity_type,
            request.field,
        );
        PermissionError::forbidden(request.operation, request.entity_type, request.field)
    }
}

fn log_transition(
    scope: &RequestScope,
    request: &PermissionRequest<'_>,
    from: OperationState,
    to: OperationState,
) {
    tracing::debug!(
        request_id = %scope.request_id(),
        operation = %request.operation,
        entity_type = request.entity_type,
        field = request.field.unwrap_or(""),
        %from,
        %to,
        "operation state"
    );
}
