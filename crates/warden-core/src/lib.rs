pub mod audit;
pub mod binding;
pub mod change;
pub mod check;
pub mod error;
pub mod executor;
pub mod expression;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod scope;

pub use binding::{BindingRegistry, EntityBindings, EntityDictionary, EntityPolicy, OperationRules};
pub use change::ChangeSpec;
pub use error::{CheckError, PermissionError, RuleError};
pub use executor::{FieldAccess, OperationState, PermissionExecutor, PermissionRequest};
pub use expression::{Expression, ExpressionBuilder, RuleSpec, Verdict};
pub use metrics::Metrics;
pub use model::{Operation, Principal, Resource, ResourceId};
pub use policy::{CheckDefinition, PolicyDocument, PolicyError};
pub use scope::RequestScope;
