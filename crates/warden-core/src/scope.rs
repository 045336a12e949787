use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::audit;
use crate::change::ChangeSpec;
use crate::error::{CheckError, PermissionError};
use crate::expression::Expression;
use crate::model::{Operation, Principal, Resource, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    check: String,
    resource: Option<ResourceId>,
    field: Option<String>,
}

impl CacheKey {
    pub fn new(check: &str, resource: Option<ResourceId>, field: Option<&str>) -> Self {
        Self {
            check: check.to_string(),
            resource,
            field: field.map(str::to_string),
        }
    }
}

/// An expression that could not be decided before commit, held until the
/// commit-time re-check.
#[derive(Debug, Clone)]
pub struct DeferredCheck {
    pub operation: Operation,
    pub entity_type: String,
    pub resource: Resource,
    pub field: Option<String>,
    pub change: ChangeSpec,
    pub expression: Arc<Expression>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Per-operation evaluation context: the acting principal, check results
/// cached for this operation, and resources whose create checks wait on commit.
#[derive(Debug)]
pub struct RequestScope {
    request_id: Uuid,
    principal: Principal,
    deadline: Option<Instant>,
    cache: Mutex<HashMap<CacheKey, bool>>,
    under_construction: Mutex<HashSet<ResourceId>>,
    deferred: Mutex<Vec<DeferredCheck>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl RequestScope {
    pub fn new(principal: Principal) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal,
            deadline: None,
            cache: Mutex::new(HashMap::new()),
            under_construction: Mutex::new(HashSet::new()),
            deferred: Mutex::new(Vec::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the cached result for `key`, or runs `compute` and caches what it
    /// returns. Keys on resources under construction are never cached, and
    /// errors are never cached.
    pub async fn get_or_compute<F, Fut>(&self, key: CacheKey, compute: F) -> Result<bool, CheckError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, CheckError>>,
    {
        let cacheable = key
            .resource
            .is_none_or(|id| !self.is_under_construction(id));

        if cacheable {
            let cached = lock(&self.cache).get(&key).copied();
            if let Some(value) = cached {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(check = %key.check, value, "check cache hit");
                return Ok(value);
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let value = compute().await?;
        if cacheable {
            lock(&self.cache).insert(key, value);
        }
        Ok(value)
    }

    pub fn cached(&self, key: &CacheKey) -> Option<bool> {
        lock(&self.cache).get(key).copied()
    }

    pub fn mark_under_construction(&self, resource: &Resource) {
        lock(&self.under_construction).insert(resource.id());
    }

    pub fn mark_persisted(&self, resource: &Resource) {
        lock(&self.under_construction).remove(&resource.id());
    }

    pub fn is_under_construction(&self, id: ResourceId) -> bool {
        lock(&self.under_construction).contains(&id)
    }

    pub fn defer(&self, check: DeferredCheck) {
        audit::audit_deferred_check(
            &self.request_id,
            check.operation,
            &check.entity_type,
            check.field.as_deref(),
        );
        lock(&self.deferred).push(check);
    }

    pub fn take_deferred(&self) -> Vec<DeferredCheck> {
        std::mem::take(&mut *lock(&self.deferred))
    }

    pub fn pending_deferred(&self) -> usize {
        lock(&self.deferred).len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Ends the operation. Deferred checks still pending here mean the
    /// commit-time re-check was skipped.
    pub fn finish(self) -> Result<CacheStats, PermissionError> {
        let stats = self.cache_stats();
        let pending = self.take_deferred();
        if let Some(first) = pending.first() {
            audit::audit_deferred_unresolved(
                &self.request_id,
                first.operation,
                &first.entity_type,
                pending.len(),
            );
            return Err(PermissionError::DeferredResolution {
                operation: first.operation,
                entity_type: first.entity_type.clone(),
                field: first.field.clone(),
            });
        }
        tracing::debug!(
            request_id = %self.request_id,
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            "request scope finished"
        );
        Ok(stats)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::{AllowAll, Check, CheckRef};
    use std::sync::atomic::AtomicUsize;

    fn scope() -> RequestScope {
        RequestScope::new(Principal::new("alice"))
    }

    #[tokio::test]
    async fn get_or_compute_runs_once_per_key() {
        let scope = scope();
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("is owner", None, None);

        for _ in 0..3 {
            let value = scope
                .get_or_compute(key.clone(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })
                .await
                .unwrap();
            assert!(value);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scope.cache_stats(), CacheStats { hits: 2, misses: 1 });
    }

    #[tokio::test]
    async fn keys_differ_by_resource_and_field() {
        let scope = scope();
        let a = Resource::new("book");
        let b = Resource::new("book");

        scope
            .get_or_compute(CacheKey::new("c", Some(a.id()), None), || async { Ok(true) })
            .await
            .unwrap();
        scope
            .get_or_compute(CacheKey::new("c", Some(b.id()), None), || async { Ok(false) })
            .await
            .unwrap();
        scope
            .get_or_compute(CacheKey::new("c", Some(a.id()), Some("title")), || async {
                Ok(false)
            })
            .await
            .unwrap();

        assert_eq!(scope.cached(&CacheKey::new("c", Some(a.id()), None)), Some(true));
        assert_eq!(scope.cached(&CacheKey::new("c", Some(b.id()), None)), Some(false));
        assert_eq!(
            scope.cached(&CacheKey::new("c", Some(a.id()), Some("title"))),
            Some(false)
        );
    }

    #[tokio::test]
    async fn resources_under_construction_bypass_the_cache() {
        let scope = scope();
        let draft = Resource::new("book");
        scope.mark_under_construction(&draft);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("c", Some(draft.id()), None);

        for _ in 0..2 {
            scope
                .get_or_compute(key.clone(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scope.cached(&key), None);

        scope.mark_persisted(&draft);
        assert!(!scope.is_under_construction(draft.id()));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let scope = scope();
        let key = CacheKey::new("flaky", None, None);

        let err = scope
            .get_or_compute(key.clone(), || async {
                Err(CheckError::Failed {
                    check: "flaky".to_string(),
                    message: "boom".to_string(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::Failed { .. }));
        assert_eq!(scope.cached(&key), None);
    }

    #[test]
    fn finish_fails_while_deferred_checks_are_pending() {
        let scope = scope();
        let draft = Resource::new("book");
        scope.defer(DeferredCheck {
            operation: Operation::Create,
            entity_type: "book".to_string(),
            resource: draft,
            field: None,
            change: ChangeSpec::NoChange,
            expression: Arc::new(Expression::check(CheckRef::new(
                "allow all",
                Check::user(AllowAll),
            ))),
        });
        assert_eq!(scope.pending_deferred(), 1);

        let err = scope.finish().unwrap_err();
        assert!(
            matches!(
                err,
                PermissionError::DeferredResolution { operation: Operation::Create, ref entity_type, .. }
                    if entity_type == "book"
            ),
            "expected DeferredResolution, got: {err}"
        );
    }

    #[test]
    fn finish_reports_cache_stats() {
        let stats = scope().finish().unwrap();

        assert_eq!(stats, CacheStats::default());
    }

    #[tokio::test]
    async fn with_timeout_sets_deadline() {
        let scope = scope().with_timeout(Duration::from_secs(5));

        assert!(scope.deadline().is_some());
        assert_ne!(scope.request_id(), RequestScope::new(Principal::default()).request_id());
    }
}
