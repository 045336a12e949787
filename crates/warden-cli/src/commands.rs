use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use warden_core::{
    BindingRegistry, EntityDictionary, FieldAccess, Operation, PermissionExecutor,
    PermissionRequest, PolicyDocument, Principal, RequestScope, Resource,
};

use crate::cli::CheckArgs;
use crate::error::CliError;

/// Outcome of `warden check`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allowed { representation: Option<Value> },
    Filtered,
    Denied(String),
}

pub fn load_policy(path: &Path) -> Result<PolicyDocument, CliError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CliError::ReadPolicy(path.display().to_string(), e.to_string()))?;
    PolicyDocument::from_toml_str(&contents).map_err(|source| CliError::Policy {
        path: path.display().to_string(),
        source,
    })
}

pub fn build_executor(document: PolicyDocument) -> PermissionExecutor {
    let checks = document.check_registry();
    let dictionary: Arc<dyn EntityDictionary> = Arc::new(document);
    PermissionExecutor::new(Arc::new(BindingRegistry::new(dictionary, checks)))
}

/// Resolves every entity type, returning the ones that compiled.
pub fn validate(executor: &PermissionExecutor) -> Result<Vec<String>, CliError> {
    Ok(executor.bindings().resolve_all()?)
}

pub fn explain(executor: &PermissionExecutor, entity_type: &str) -> Result<String, CliError> {
    let bindings = executor.bindings().bindings(entity_type)?;
    let mut output = String::new();
    let _ = writeln!(output, "{entity_type}");
    for operation in Operation::ALL {
        match bindings.entity_rule(operation) {
            Some(expression) => {
                let _ = writeln!(output, "  {operation}: {expression}");
            }
            None => {
                let _ = writeln!(output, "  {operation}: (unbound, allowed)");
            }
        }
    }
    for field in bindings.bound_fields() {
        for operation in Operation::ALL {
            if let Some(expression) = bindings.field_rule(field, operation) {
                let _ = writeln!(output, "  {field}.{operation}: {expression}");
            }
        }
    }
    Ok(output)
}

pub async fn check(
    executor: &PermissionExecutor,
    args: &CheckArgs,
    deadline: Duration,
) -> Result<Decision, CliError> {
    let principal = args
        .roles
        .iter()
        .fold(Principal::new(args.principal.clone()), |p, role| {
            p.with_role(role.clone())
        });
    let scope = RequestScope::new(principal).with_timeout(deadline);
    let resource = args
        .object
        .as_deref()
        .map(|json| parse_object(&args.entity, json))
        .transpose()?;

    let mut request = PermissionRequest::new(args.operation, &args.entity);
    if let Some(resource) = &resource {
        request = request.on(resource);
    }
    if let Some(field) = &args.field {
        request = request.field(field);
    }

    let outcome = match (&args.field, &resource, args.operation) {
        (Some(_), _, _) => executor
            .check_field_aware_permission(&scope, request)
            .await
            .map(|access| match access {
                FieldAccess::Visible => Decision::Allowed {
                    representation: None,
                },
                FieldAccess::Filtered => Decision::Filtered,
            }),
        (None, Some(resource), Operation::Read) => {
            let mut representation = resource.to_json();
            executor
                .filter_fields(&scope, &args.entity, resource, &mut representation)
                .await
                .map(|_| Decision::Allowed {
                    representation: Some(Value::Object(representation)),
                })
        }
        (None, _, _) => executor
            .check_permission(&scope, request)
            .await
            .map(|()| Decision::Allowed {
                representation: None,
            }),
    };

    let decision = match outcome {
        Ok(decision) => decision,
        Err(e) if e.is_denial() => Decision::Denied(e.to_string()),
        Err(e) => return Err(e.into()),
    };
    executor.metrics().record_cache_stats(scope.finish()?);
    Ok(decision)
}

fn parse_object(entity_type: &str, json: &str) -> Result<Resource, CliError> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| CliError::InvalidObject(e.to_string()))?;
    let Value::Object(attributes) = value else {
        return Err(CliError::InvalidObject(format!("got {value}")));
    };
    Ok(attributes
        .into_iter()
        .fold(Resource::persisted(entity_type, "cli"), |resource, (field, value)| {
            resource.with_attribute(field, value)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
        [checks."is admin"]
        kind = "role"
        role = "admin"

        [checks."is owner"]
        kind = "owner"
        field = "owner"

        [entities.employee]
        read = { any = ["allow all"] }
        delete = { all = ["is admin"] }

        [entities.employee.fields.salary]
        read = { expression = "is admin OR is owner" }
    "#;

    fn executor() -> PermissionExecutor {
        build_executor(PolicyDocument::from_toml_str(POLICY).unwrap())
    }

    fn args(operation: Operation, principal: &str) -> CheckArgs {
        CheckArgs {
            entity: "employee".to_string(),
            operation,
            principal: principal.to_string(),
            roles: Vec::new(),
            field: None,
            object: None,
            metrics: false,
        }
    }

    #[test]
    fn load_policy_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_policy(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, CliError::ReadPolicy(..)), "got: {err}");
    }

    #[test]
    fn load_policy_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, POLICY).unwrap();

        let document = load_policy(&path).unwrap();
        assert_eq!(document.entity_types(), vec!["employee".to_string()]);
    }

    #[test]
    fn validate_lists_compiled_entities() {
        assert_eq!(validate(&executor()).unwrap(), vec!["employee".to_string()]);
    }

    #[test]
    fn validate_fails_on_malformed_rule() {
        let document =
            PolicyDocument::from_toml_str("[entities.book]\nread = { expression = \"(a AND b\" }")
                .unwrap();
        let err = validate(&build_executor(document)).unwrap_err();
        assert!(err.to_string().contains("book"), "got: {err}");
    }

    #[test]
    fn explain_renders_entity_and_field_rules() {
        let output = explain(&executor(), "employee").unwrap();

        assert!(output.contains("read: allow all"), "got: {output}");
        assert!(output.contains("create: (unbound, allowed)"), "got: {output}");
        assert!(output.contains("delete: is admin"), "got: {output}");
        assert!(output.contains("salary.read: (is admin OR is owner)"), "got: {output}");
    }

    #[tokio::test]
    async fn check_denies_delete_for_non_admin() {
        let decision = check(&executor(), &args(Operation::Delete, "bob"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Denied(ref msg) if msg.contains("delete")));
    }

    #[tokio::test]
    async fn check_allows_delete_for_admin() {
        let mut args = args(Operation::Delete, "bob");
        args.roles.push("admin".to_string());

        let decision = check(&executor(), &args, Duration::from_secs(1)).await.unwrap();
        assert_eq!(decision, Decision::Allowed { representation: None });
    }

    #[tokio::test]
    async fn check_read_filters_object_fields() {
        let mut args = args(Operation::Read, "bob");
        args.object = Some(r#"{"name": "Ada", "owner": "ada", "salary": 10}"#.to_string());

        let decision = check(&executor(), &args, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Allowed {
                representation: Some(serde_json::json!({"name": "Ada", "owner": "ada"}))
            }
        );
    }

    #[tokio::test]
    async fn check_field_reports_filtered() {
        let mut args = args(Operation::Read, "bob");
        args.field = Some("salary".to_string());
        args.object = Some(r#"{"owner": "ada"}"#.to_string());

        let decision = check(&executor(), &args, Duration::from_secs(1)).await.unwrap();
        assert_eq!(decision, Decision::Filtered);
    }

    #[tokio::test]
    async fn check_rejects_non_object_json() {
        let mut args = args(Operation::Read, "bob");
        args.object = Some("[1, 2]".to_string());

        let err = check(&executor(), &args, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CliError::InvalidObject(_)), "got: {err}");
    }
}
