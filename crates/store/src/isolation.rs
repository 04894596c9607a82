//! Tenant isolation for document queries and writes.
//!
//! Every filter is pinned to the caller's organization, every read result is
//! checked against it, and every write is stamped with it.

use serde_json::Value;

use marketops_core::{Document, Error, OrganizationId, Result, ViolationKind, ORGANIZATION_FIELD};

/// Scope `query` to `org`.
///
/// A top-level `organization_id` must already equal `org` as a plain string;
/// occurrences nested under logical operators are held to the same rule.
/// When absent at the top level the field is injected.
pub fn enforce_tenant_filter(query: &Document, org: &OrganizationId) -> Result<Document> {
    check_filter_scope(query, org)?;

    let mut scoped = query.clone();
    scoped
        .entry(ORGANIZATION_FIELD)
        .or_insert_with(|| Value::String(org.as_str().to_string()));
    Ok(scoped)
}

fn check_filter_scope(filter: &Document, org: &OrganizationId) -> Result<()> {
    for (key, value) in filter {
        if key == ORGANIZATION_FIELD {
            match value.as_str() {
                Some(found) if found == org.as_str() => {}
                Some(found) => {
                    return Err(Error::security(
                        ViolationKind::TenantMismatch,
                        format!("query organization '{}' does not match caller scope", found),
                    ))
                }
                None => {
                    return Err(Error::security(
                        ViolationKind::TenantMismatch,
                        "organization_id in a query must be a plain string",
                    ))
                }
            }
        } else if is_org_subpath(key) {
            return Err(Error::security(
                ViolationKind::TenantMismatch,
                format!("querying '{}' is not allowed", key),
            ));
        } else if matches!(key.as_str(), "$and" | "$or" | "$nor") {
            for clause in value.as_array().into_iter().flatten() {
                if let Some(clause) = clause.as_object() {
                    check_filter_scope(clause, org)?;
                }
            }
        } else if key == "$not" {
            if let Some(inner) = value.as_object() {
                check_filter_scope(inner, org)?;
            }
        }
    }
    Ok(())
}

/// Check that a document read from storage belongs to `org`.
pub fn validate_tenant_access(document: &Document, org: &OrganizationId) -> Result<()> {
    match document.get(ORGANIZATION_FIELD).and_then(Value::as_str) {
        Some(owner) if owner == org.as_str() => Ok(()),
        Some(_) => Err(Error::security(
            ViolationKind::TenantMismatch,
            "document belongs to another organization",
        )),
        None => Err(Error::security(
            ViolationKind::TenantMismatch,
            "document has no organization scope",
        )),
    }
}

/// Set `organization_id` on a document about to be written.
///
/// A payload naming a different organization is overwritten, not rejected.
pub fn stamp_document(mut document: Document, org: &OrganizationId) -> Document {
    if let Some(previous) = document.get(ORGANIZATION_FIELD) {
        if previous.as_str() != Some(org.as_str()) {
            tracing::warn!(
                organization = %org,
                "Overwriting foreign organization_id on document before write"
            );
        }
    }
    document.insert(
        ORGANIZATION_FIELD.to_string(),
        Value::String(org.as_str().to_string()),
    );
    document
}

/// Reject any update that would touch the organization field.
pub fn guard_update(update: &Document) -> Result<()> {
    for (key, value) in update {
        if key == ORGANIZATION_FIELD || is_org_subpath(key) {
            return Err(reassignment(key));
        }
        if let Some(fields) = value.as_object() {
            if let Some(field) = fields
                .keys()
                .find(|field| *field == ORGANIZATION_FIELD || is_org_subpath(field))
            {
                return Err(reassignment(field));
            }
        }
    }
    Ok(())
}

fn is_org_subpath(key: &str) -> bool {
    key.strip_prefix(ORGANIZATION_FIELD)
        .is_some_and(|rest| rest.starts_with('.'))
}

fn reassignment(field: &str) -> Error {
    Error::security(
        ViolationKind::TenantReassignment,
        format!("updates may not modify '{}'", field),
    )
}
