use warden_core::{PermissionError, PermissionExecutor, RequestScope, Resource};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("{entity_type} '{key}' not found")]
    NotFound { entity_type: String, key: String },
    #[error("resource {0} is not persisted")]
    NotPersisted(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

pub trait DataStore: Send + Sync {
    type Transaction: Transaction;

    fn begin(&self) -> Self::Transaction;
}

/// Unit of work whose changes become visible only when `commit` succeeds.
pub trait Transaction: Send {
    /// Stages a new resource and marks it under construction in `scope`.
    fn create(&mut self, scope: &RequestScope, resource: &Resource);

    /// Stages the current state of a persisted resource.
    fn save(&mut self, resource: &Resource) -> Result<(), StorageError>;

    fn delete(&mut self, entity_type: &str, key: &str);

    fn read(
        &self,
        entity_type: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Resource>, StorageError>> + Send;

    /// Assigns keys to created resources, runs the deferred permission
    /// checks, and publishes staged changes only if all of them pass.
    /// Returns the keys assigned to created resources.
    fn commit(
        self,
        scope: &RequestScope,
        executor: &PermissionExecutor,
    ) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;

    fn rollback(self);
}
