//! Document-store value types.

use serde::{Deserialize, Serialize};

/// A document or query: a JSON object of field name to value.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Identifier field assigned by the store on insert.
pub const ID_FIELD: &str = "_id";

/// Outcome of an update call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Documents matching the filter.
    pub matched: u64,
    /// Documents actually changed.
    pub modified: u64,
}

/// Convert a `json!({...})` literal into a [`Document`].
///
/// Non-object values yield an empty document.
pub fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}
