use uuid::Uuid;

use crate::model::Operation;

pub fn audit_permission_denied(
    request_id: &Uuid,
    principal: &str,
    operation: Operation,
    entity_type: &str,
    field: Option<&str>,
) {
    tracing::warn!(
        target: "audit",
        event = "permission_denied",
        request_id = %request_id,
        principal = principal,
        operation = operation.as_str(),
        entity_type = entity_type,
        field = field.unwrap_or(""),
        "permission denied"
    );
}

pub fn audit_field_filtered(request_id: &Uuid, principal: &str, entity_type: &str, field: &str) {
    tracing::info!(
        target: "audit",
        event = "field_filtered",
        request_id = %request_id,
        principal = principal,
        entity_type = entity_type,
        field = field,
        "field omitted from read"
    );
}

pub fn audit_deferred_check(
    request_id: &Uuid,
    operation: Operation,
    entity_type: &str,
    field: Option<&str>,
) {
    tracing::info!(
        target: "audit",
        event = "deferred_check_recorded",
        request_id = %request_id,
        operation = operation.as_str(),
        entity_type = entity_type,
        field = field.unwrap_or(""),
        "check deferred until commit"
    );
}

pub fn audit_deferred_unresolved(
    request_id: &Uuid,
    operation: Operation,
    entity_type: &str,
    pending: usize,
) {
    tracing::warn!(
        target: "audit",
        event = "deferred_resolution_failed",
        request_id = %request_id,
        operation = operation.as_str(),
        entity_type = entity_type,
        pending = pending,
        "deferred checks left unresolved"
    );
}
