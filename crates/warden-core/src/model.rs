use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "read" => Ok(Operation::Read),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// The acting user of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Process-unique identity of an in-flight resource. Stable for the life of the
/// handle regardless of how its attributes change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct ResourceState {
    key: Option<String>,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct ResourceInner {
    id: ResourceId,
    entity_type: String,
    state: RwLock<ResourceState>,
}

/// Shared handle to an entity instance taking part in a request.
///
/// Clones refer to the same instance: a mutation made through one handle is
/// observed by every check holding another.
#[derive(Debug, Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                id: ResourceId::next(),
                entity_type: entity_type.into(),
                state: RwLock::new(ResourceState {
                    key: None,
                    attributes: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn persisted(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        let resource = Self::new(entity_type);
        resource.assign_key(key);
        resource
    }

    pub fn with_attribute(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn entity_type(&self) -> &str {
        &self.inner.entity_type
    }

    pub fn key(&self) -> Option<String> {
        self.read_state().key.clone()
    }

    pub fn assign_key(&self, key: impl Into<String>) {
        self.write_state().key = Some(key.into());
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.read_state().attributes.get(field).cloned()
    }

    /// Sets a field, returning the value it replaced.
    pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.write_state()
            .attributes
            .insert(field.into(), value.into())
    }

    pub fn remove(&self, field: &str) -> Option<Value> {
        self.write_state().attributes.remove(field)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.read_state().attributes.keys().cloned().collect()
    }

    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        self.read_state()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ResourceState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ResourceState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{}:{}", self.entity_type(), key),
            None => write!(f, "{}{}", self.entity_type(), self.id()),
        }
    }
}
