use std::future::Future;
use std::pin::Pin;

use crate::change::ChangeSpec;
use crate::check::{Check, CheckInput, CheckRef};
use crate::error::CheckError;
use crate::model::Resource;
use crate::scope::{CacheKey, RequestScope};

use super::{Expression, Verdict};

/// What one evaluation of an expression sees: the scope it runs in, the
/// resource and field under decision, and the pending change, if any.
pub struct EvaluationContext<'a> {
    pub scope: &'a RequestScope,
    pub resource: Option<&'a Resource>,
    pub field: Option<&'a str>,
    pub change: &'a ChangeSpec,
}

static NO_CHANGE: ChangeSpec = ChangeSpec::NoChange;

impl<'a> EvaluationContext<'a> {
    pub fn new(scope: &'a RequestScope) -> Self {
        Self {
            scope,
            resource: None,
            field: None,
            change: &NO_CHANGE,
        }
    }

    pub fn with_resource(mut self, resource: Option<&'a Resource>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_field(mut self, field: Option<&'a str>) -> Self {
        self.field = field;
        self
    }

    pub fn with_change(mut self, change: &'a ChangeSpec) -> Self {
        self.change = change;
        self
    }
}

impl Expression {
    /// Evaluates left to right. AND stops at the first DENY and OR at the
    /// first ALLOW; an error from any check that ran aborts the evaluation.
    pub fn evaluate<'a>(
        &'a self,
        ctx: &'a EvaluationContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<Verdict, CheckError>> + Send + 'a>> {
        Box::pin(async move {
            match self {
                Expression::Check(check) => evaluate_check(check, ctx).await,
                Expression::And(left, right) => {
                    let left = left.evaluate(ctx).await?;
                    if left == Verdict::Deny {
                        return Ok(Verdict::Deny);
                    }
                    let right = right.evaluate(ctx).await?;
                    Ok(left.and(right))
                }
                Expression::Or(left, right) => {
                    let left = left.evaluate(ctx).await?;
                    if left == Verdict::Allow {
                        return Ok(Verdict::Allow);
                    }
                    let right = right.evaluate(ctx).await?;
                    Ok(left.or(right))
                }
                Expression::Not(inner) => Ok(inner.evaluate(ctx).await?.negate()),
            }
        })
    }
}

async fn evaluate_check(
    check: &CheckRef,
    ctx: &EvaluationContext<'_>,
) -> Result<Verdict, CheckError> {
    let scope = ctx.scope;
    match check.check() {
        Check::User(user) => {
            let key = CacheKey::new(check.name(), None, None);
            let allowed = scope
                .get_or_compute(key, || async {
                    Ok::<bool, CheckError>(user.ok(scope.principal()))
                })
                .await?;
            Ok(Verdict::from(allowed))
        }
        Check::Operation(operation) => {
            if operation.requires_change() && !ctx.change.is_change() {
                tracing::trace!(check = check.name(), "deferred: no change available");
                return Ok(Verdict::Defer);
            }
            if operation.requires_persisted()
                && let Some(resource) = ctx.resource
                && scope.is_under_construction(resource.id())
            {
                tracing::trace!(
                    check = check.name(),
                    resource = %resource,
                    "deferred: resource under construction"
                );
                return Ok(Verdict::Defer);
            }

            let input = CheckInput {
                check: check.name(),
                principal: scope.principal(),
                resource: ctx.resource,
                change: ctx.change,
            };
            let allowed = if operation.cacheable() {
                let key = CacheKey::new(check.name(), ctx.resource.map(Resource::id), ctx.field);
                scope.get_or_compute(key, || operation.ok(&input)).await?
            } else {
                operation.ok(&input).await?
            };
            tracing::trace!(check = check.name(), allowed, "operation check evaluated");
            Ok(Verdict::from(allowed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{CheckRef, DenyAll, OperationFn};
    use crate::model::Principal;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed(name: &str, allowed: bool) -> Expression {
        Expression::check(CheckRef::new(
            name,
            Check::user(move |_: &Principal| allowed),
        ))
    }

    fn exploding(name: &str) -> Expression {
        Expression::check(CheckRef::new(
            name,
            Check::operation(OperationFn::new(|input| Err(input.fail("must not run")))),
        ))
    }

    fn counting(name: &str, calls: Arc<AtomicUsize>, cacheable: bool) -> Expression {
        let check = OperationFn::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        });
        let check = if cacheable { check } else { check.non_cacheable() };
        Expression::check(CheckRef::new(name, Check::operation(check)))
    }

    fn deferring(name: &str) -> Expression {
        Expression::check(CheckRef::new(
            name,
            Check::operation(OperationFn::new(|_| Ok(true)).requiring_change()),
        ))
    }

    async fn eval(expr: &Expression, scope: &RequestScope) -> Result<Verdict, CheckError> {
        let ctx = EvaluationContext::new(scope);
        expr.evaluate(&ctx).await
    }

    fn scope() -> RequestScope {
        RequestScope::new(Principal::new("alice"))
    }

    #[tokio::test]
    async fn boolean_combinators_over_stub_checks() {
        for a in [true, false] {
            for b in [true, false] {
                let and = Expression::and(fixed("a", a), fixed("b", b));
                let or = Expression::or(fixed("a", a), fixed("b", b));
                let not = Expression::not(fixed("a", a));

                assert_eq!(eval(&and, &scope()).await.unwrap(), Verdict::from(a && b));
                assert_eq!(eval(&or, &scope()).await.unwrap(), Verdict::from(a || b));
                assert_eq!(eval(&not, &scope()).await.unwrap(), Verdict::from(!a));
            }
        }
    }

    #[tokio::test]
    async fn and_short_circuits_before_failing_check() {
        let expr = Expression::and(fixed("deny", false), exploding("boom"));

        assert_eq!(eval(&expr, &scope()).await.unwrap(), Verdict::Deny);
    }

    #[tokio::test]
    async fn or_short_circuits_before_failing_check() {
        let expr = Expression::or(fixed("allow", true), exploding("boom"));

        assert_eq!(eval(&expr, &scope()).await.unwrap(), Verdict::Allow);
    }

    #[tokio::test]
    async fn error_from_evaluated_check_overrides_pending_allow() {
        let expr = Expression::or(exploding("boom"), fixed("allow", true));

        let err = eval(&expr, &scope()).await.unwrap_err();
        assert!(
            matches!(err, CheckError::Failed { ref check, .. } if check == "boom"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn not_leaves_defer_unchanged() {
        let scope = scope();

        assert_eq!(
            eval(&Expression::not(deferring("later")), &scope).await.unwrap(),
            Verdict::Defer
        );
    }

    #[tokio::test]
    async fn defer_combines_with_decided_verdicts() {
        let scope = scope();

        let and_allow = Expression::and(deferring("later"), fixed("yes", true));
        let and_deny = Expression::and(deferring("later"), fixed("no", false));
        let or_allow = Expression::or(deferring("later"), fixed("yes", true));
        let or_deny = Expression::or(deferring("later"), fixed("no", false));

        assert_eq!(eval(&and_allow, &scope).await.unwrap(), Verdict::Defer);
        assert_eq!(eval(&and_deny, &scope).await.unwrap(), Verdict::Deny);
        assert_eq!(eval(&or_allow, &scope).await.unwrap(), Verdict::Allow);
        assert_eq!(eval(&or_deny, &scope).await.unwrap(), Verdict::Defer);
    }

    #[tokio::test]
    async fn change_requiring_check_runs_once_change_is_present() {
        let scope = scope();
        let expr = deferring("later");
        let change = ChangeSpec::field("status", json!("DRAFT"), json!("PUBLISHED"));
        let ctx = EvaluationContext::new(&scope).with_change(&change);

        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);
    }

    #[tokio::test]
    async fn change_requiring_closure_sees_each_change() {
        let scope = scope();
        let expr = Expression::check(CheckRef::new(
            "publishes",
            Check::operation(
                OperationFn::new(|input| {
                    Ok(input.change.transition().map(|(_, to)| to) == Some(&json!("PUBLISHED")))
                })
                .requiring_change(),
            ),
        ));
        let book = Resource::new("book");
        let publish = ChangeSpec::field("status", json!("DRAFT"), json!("PUBLISHED"));
        let unpublish = ChangeSpec::field("status", json!("PUBLISHED"), json!("DRAFT"));

        let ctx = EvaluationContext::new(&scope)
            .with_resource(Some(&book))
            .with_change(&publish);
        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);

        let ctx = EvaluationContext::new(&scope)
            .with_resource(Some(&book))
            .with_change(&unpublish);
        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Deny);
    }

    #[tokio::test]
    async fn cacheable_check_executes_at_most_once_per_identity_and_field() {
        let scope = scope();
        let calls = Arc::new(AtomicUsize::new(0));
        let expr = counting("should cache", Arc::clone(&calls), true);
        let book = Resource::new("book");
        let ctx = EvaluationContext::new(&scope)
            .with_resource(Some(&book))
            .with_field(Some("title"));

        for _ in 0..3 {
            assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other = Resource::new("book");
        let ctx = EvaluationContext::new(&scope).with_resource(Some(&other));
        expr.evaluate(&ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_cacheable_check_executes_every_time() {
        let scope = scope();
        let calls = Arc::new(AtomicUsize::new(0));
        let expr = counting("no cache", Arc::clone(&calls), false);
        let book = Resource::new("book");
        let ctx = EvaluationContext::new(&scope).with_resource(Some(&book));

        for _ in 0..3 {
            expr.evaluate(&ctx).await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cached_result_survives_mutation_of_the_same_identity() {
        let scope = scope();
        let expr = Expression::check(CheckRef::new(
            "is draft",
            Check::operation(OperationFn::new(|input| {
                Ok(input.resource()?.get("status") == Some(json!("DRAFT")))
            })),
        ));
        let book = Resource::new("book").with_attribute("status", "DRAFT");
        let ctx = EvaluationContext::new(&scope).with_resource(Some(&book));

        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);

        book.set("status", "PUBLISHED");

        // keyed by identity: the stale ALLOW is returned
        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);

        let fresh = RequestScope::new(Principal::new("alice"));
        let ctx = EvaluationContext::new(&fresh).with_resource(Some(&book));
        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Deny);
    }

    #[tokio::test]
    async fn persisted_state_check_defers_while_under_construction() {
        let scope = scope();
        let expr = Expression::check(CheckRef::new(
            "committed",
            Check::operation(OperationFn::new(|_| Ok(true)).requiring_persisted()),
        ));
        let draft = Resource::new("book");
        scope.mark_under_construction(&draft);
        let ctx = EvaluationContext::new(&scope).with_resource(Some(&draft));

        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Defer);

        scope.mark_persisted(&draft);
        assert_eq!(expr.evaluate(&ctx).await.unwrap(), Verdict::Allow);
    }

    #[tokio::test]
    async fn user_checks_are_cached_for_the_scope() {
        let scope = scope();
        let expr = Expression::check(CheckRef::new("deny all", Check::user(DenyAll)));

        eval(&expr, &scope).await.unwrap();
        eval(&expr, &scope).await.unwrap();

        assert_eq!(
            scope.cached(&CacheKey::new("deny all", None, None)),
            Some(false)
        );
        assert_eq!(scope.cache_stats().hits, 1);
    }
}
