//! Organization (tenant) scope.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, ViolationKind};

/// Field every tenant-scoped document carries.
pub const ORGANIZATION_FIELD: &str = "organization_id";

/// Validated organization identifier.
///
/// The only way to obtain one is through [`OrganizationId::parse`] (or the
/// `TryFrom` impls), so any API that takes an `&OrganizationId` is guaranteed
/// a non-empty scope. There is no "global" scope value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrganizationId(String);

impl OrganizationId {
    /// Parse an optional raw identifier. Absent, empty or whitespace-only
    /// values are rejected.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            Some(value) if !value.is_empty() => Ok(Self(value.to_string())),
            _ => Err(Error::security(
                ViolationKind::MissingTenant,
                "organization_id is required for tenant-scoped access",
            )),
        }
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrganizationId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(Some(&value))
    }
}

impl TryFrom<&str> for OrganizationId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(Some(value))
    }
}

impl From<OrganizationId> for String {
    fn from(value: OrganizationId) -> Self {
        value.0
    }
}

impl std::fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_missing_and_blank() {
        for raw in [None, Some(""), Some("   ")] {
            let err = OrganizationId::parse(raw).unwrap_err();
            assert_eq!(err.violation(), Some(ViolationKind::MissingTenant));
        }
    }

    #[test]
    fn test_parse_trims() {
        let org = OrganizationId::parse(Some(" org_a ")).unwrap();
        assert_eq!(org.as_str(), "org_a");
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: OrganizationId = serde_json::from_str("\"org_a\"").unwrap();
        assert_eq!(ok.to_string(), "org_a");
        assert!(serde_json::from_str::<OrganizationId>("\"\"").is_err());
    }
}
