use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use warden_core::{PermissionExecutor, RequestScope, Resource};

use crate::traits::{DataStore, StorageError, Transaction};

type RowKey = (String, String);

#[derive(Debug, Default)]
struct InnerState {
    next_key: HashMap<String, u64>,
    rows: HashMap<RowKey, Map<String, Value>>,
}

impl InnerState {
    fn allocate_key(&mut self, entity_type: &str) -> String {
        let next = self.next_key.entry(entity_type.to_string()).or_insert(0);
        *next += 1;
        next.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of published rows of `entity_type`.
    pub fn count(&self, entity_type: &str) -> usize {
        lock(&self.state)
            .rows
            .keys()
            .filter(|(t, _)| t == entity_type)
            .count()
    }
}

impl DataStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            state: Arc::clone(&self.state),
            created: Vec::new(),
            saved: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct InMemoryTransaction {
    state: Arc<Mutex<InnerState>>,
    created: Vec<Resource>,
    saved: Vec<(RowKey, Map<String, Value>)>,
    deleted: Vec<RowKey>,
}

impl Transaction for InMemoryTransaction {
    fn create(&mut self, scope: &RequestScope, resource: &Resource) {
        scope.mark_under_construction(resource);
        tracing::debug!(resource = %resource, "resource staged for create");
        self.created.push(resource.clone());
    }

    fn save(&mut self, resource: &Resource) -> Result<(), StorageError> {
        let key = resource
            .key()
            .ok_or_else(|| StorageError::NotPersisted(resource.to_string()))?;
        self.saved.push((
            (resource.entity_type().to_string(), key),
            resource.to_json(),
        ));
        Ok(())
    }

    fn delete(&mut self, entity_type: &str, key: &str) {
        self.deleted.push((entity_type.to_string(), key.to_string()));
    }

    async fn read(&self, entity_type: &str, key: &str) -> Result<Option<Resource>, StorageError> {
        let row = lock(&self.state)
            .rows
            .get(&(entity_type.to_string(), key.to_string()))
            .cloned();
        Ok(row.map(|attributes| {
            attributes
                .into_iter()
                .fold(Resource::persisted(entity_type, key), |resource, (field, value)| {
                    resource.with_attribute(field, value)
                })
        }))
    }

    async fn commit(
        self,
        scope: &RequestScope,
        executor: &PermissionExecutor,
    ) -> Result<Vec<String>, StorageError> {
        let keys: Vec<String> = {
            let mut state = lock(&self.state);
            self.created
                .iter()
                .map(|resource| {
                    let key = state.allocate_key(resource.entity_type());
                    resource.assign_key(key.clone());
                    key
                })
                .collect()
        };
        for resource in &self.created {
            scope.mark_persisted(resource);
        }

        if let Err(e) = executor.execute_commit_checks(scope).await {
            tracing::info!(
                request_id = %scope.request_id(),
                error = %e,
                discarded = self.created.len() + self.saved.len() + self.deleted.len(),
                "transaction discarded"
            );
            return Err(e.into());
        }

        let mut state = lock(&self.state);
        for resource in &self.created {
            if let Some(key) = resource.key() {
                state
                    .rows
                    .insert((resource.entity_type().to_string(), key), resource.to_json());
            }
        }
        for (row, attributes) in self.saved {
            state.rows.insert(row, attributes);
        }
        for row in &self.deleted {
            state.rows.remove(row);
        }
        tracing::debug!(
            request_id = %scope.request_id(),
            created = keys.len(),
            "transaction committed"
        );
        Ok(keys)
    }

    fn rollback(self) {
        tracing::debug!(
            staged = self.created.len() + self.saved.len() + self.deleted.len(),
            "transaction rolled back"
        );
    }
}

fn lock(state: &Mutex<InnerState>) -> MutexGuard<'_, InnerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
