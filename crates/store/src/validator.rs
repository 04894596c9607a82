//! Query validation against operator injection.
//!
//! Every key that starts with `$` is an operator and must be allow-listed;
//! every other key must look like a plain (optionally dotted) field path.
//! Validation is a gate only: accepted documents are returned unchanged.

use regex::Regex;
use serde_json::Value;

use marketops_core::{Document, Error, Result, ViolationKind};

/// Operators accepted in filters.
pub const QUERY_OPERATORS: &[&str] = &[
    "$and", "$or", "$not", "$nor", "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin",
    "$exists",
];

/// Operators accepted at the top level of an update document.
pub const UPDATE_OPERATORS: &[&str] = &["$set", "$unset", "$inc", "$push", "$pull", "$addToSet"];

pub const DEFAULT_MAX_DEPTH: usize = 16;

const FIELD_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$";

/// Rejects filters and updates that could smuggle server-side evaluation.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    field: Regex,
    max_depth: usize,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryValidator {
    pub fn new() -> Self {
        Self {
            field: Regex::new(FIELD_PATTERN).expect("field pattern is a valid regex"),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Validate a filter document.
    pub fn validate_query<'a>(&self, query: &'a Document) -> Result<&'a Document> {
        self.check_filter(query, 1)?;
        Ok(query)
    }

    /// Validate an update document.
    ///
    /// The top level must consist solely of allow-listed update operators,
    /// each mapping field paths to values. Only `$pull` conditions may carry
    /// (query) operators; every other value is checked like a stored document.
    pub fn validate_update<'a>(&self, update: &'a Document) -> Result<&'a Document> {
        if update.is_empty() {
            return Err(Error::security(ViolationKind::MalformedQuery, "update document is empty"));
        }

        for (operator, fields) in update {
            if !operator.starts_with('$') {
                return Err(Error::security(
                    ViolationKind::MalformedQuery,
                    format!("update key '{}' is not an operator; replacement updates are not allowed", operator),
                ));
            }
            if !UPDATE_OPERATORS.contains(&operator.as_str()) {
                return Err(disallowed(operator));
            }
            let fields = fields.as_object().ok_or_else(|| {
                Error::security(
                    ViolationKind::MalformedQuery,
                    format!("'{}' requires an object of field paths", operator),
                )
            })?;
            for (field, value) in fields {
                self.check_field(field)?;
                if operator == "$pull" {
                    self.check_value(value, 2)?;
                } else {
                    self.check_stored_value(value, 2)?;
                }
            }
        }
        Ok(update)
    }

    /// Validate a document about to be stored. Keys at every depth must be
    /// plain field names; no operator is ever persisted.
    pub fn validate_document<'a>(&self, document: &'a Document) -> Result<&'a Document> {
        self.check_stored(document, 1)?;
        Ok(document)
    }

    fn check_stored(&self, map: &Document, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::security(
                ViolationKind::MalformedQuery,
                format!("document nesting exceeds {} levels", self.max_depth),
            ));
        }
        for (key, value) in map {
            if key.starts_with('$') {
                return Err(Error::security(
                    ViolationKind::DisallowedOperator,
                    format!("document key '{}' is an operator", key),
                ));
            }
            self.check_field(key)?;
            self.check_stored_value(value, depth + 1)?;
        }
        Ok(())
    }

    fn check_stored_value(&self, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::Object(map) => self.check_stored(map, depth),
            Value::Array(items) => {
                if depth > self.max_depth {
                    return Err(Error::security(
                        ViolationKind::MalformedQuery,
                        format!("document nesting exceeds {} levels", self.max_depth),
                    ));
                }
                items.iter().try_for_each(|item| self.check_stored_value(item, depth + 1))
            }
            _ => Ok(()),
        }
    }

    fn check_filter(&self, filter: &Document, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::security(
                ViolationKind::MalformedQuery,
                format!("query nesting exceeds {} levels", self.max_depth),
            ));
        }

        for (key, value) in filter {
            if key.starts_with('$') {
                self.check_operator(key, value, depth)?;
            } else {
                self.check_field(key)?;
                self.check_value(value, depth + 1)?;
            }
        }
        Ok(())
    }

    fn check_operator(&self, operator: &str, operand: &Value, depth: usize) -> Result<()> {
        if !QUERY_OPERATORS.contains(&operator) {
            return Err(disallowed(operator));
        }

        match operator {
            "$and" | "$or" | "$nor" => {
                let clauses = operand
                    .as_array()
                    .filter(|clauses| !clauses.is_empty())
                    .ok_or_else(|| malformed(operator, "a non-empty array"))?;
                for clause in clauses {
                    let clause = clause
                        .as_object()
                        .ok_or_else(|| malformed(operator, "an array of objects"))?;
                    self.check_filter(clause, depth + 1)?;
                }
                Ok(())
            }
            "$not" => {
                let inner = operand.as_object().ok_or_else(|| malformed(operator, "an object"))?;
                self.check_filter(inner, depth + 1)
            }
            "$in" | "$nin" => {
                if !operand.is_array() {
                    return Err(malformed(operator, "an array"));
                }
                self.check_value(operand, depth + 1)
            }
            _ => self.check_value(operand, depth + 1),
        }
    }

    /// Objects nested anywhere inside a value are validated as filters.
    fn check_value(&self, value: &Value, depth: usize) -> Result<()> {
        match value {
            Value::Object(map) => self.check_filter(map, depth),
            Value::Array(items) => {
                if depth > self.max_depth {
                    return Err(Error::security(
                        ViolationKind::MalformedQuery,
                        format!("query nesting exceeds {} levels", self.max_depth),
                    ));
                }
                items.iter().try_for_each(|item| self.check_value(item, depth + 1))
            }
            _ => Ok(()),
        }
    }

    fn check_field(&self, field: &str) -> Result<()> {
        if self.field.is_match(field) {
            Ok(())
        } else {
            Err(Error::security(
                ViolationKind::InvalidField,
                format!("invalid field name '{}'", field),
            ))
        }
    }
}

fn disallowed(operator: &str) -> Error {
    Error::security(
        ViolationKind::DisallowedOperator,
        format!("operator '{}' is not allowed", operator),
    )
}

fn malformed(operator: &str, expected: &str) -> Error {
    Error::security(
        ViolationKind::MalformedQuery,
        format!("'{}' requires {}", operator, expected),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketops_core::doc;
    use serde_json::json;

    fn violation(result: Result<&Document>) -> ViolationKind {
        result.err().and_then(|e| e.violation()).expect("expected a security violation")
    }

    #[test]
    fn test_accepts_allowed_operators_unchanged() {
        let query = doc(json!({
            "status": "active",
            "budget": {"$gte": 100, "$lt": 5000},
            "$or": [{"channel": {"$in": ["email", "sms"]}}, {"metrics.ctr": {"$exists": true}}],
            "tags": {"$not": {"$eq": "archived"}}
        }));
        let validator = QueryValidator::new();
        let accepted = validator.validate_query(&query).unwrap();
        assert!(std::ptr::eq(accepted, &query));
    }

    #[test]
    fn test_rejects_server_side_evaluation_operators() {
        let validator = QueryValidator::new();
        for operator in ["$where", "$expr", "$function", "$regex", "$accumulator"] {
            let query = doc(json!({ operator: "sleep(1000)" }));
            assert_eq!(violation(validator.validate_query(&query)), ViolationKind::DisallowedOperator);
        }
    }

    #[test]
    fn test_rejects_operator_nested_under_logical_clause() {
        let query = doc(json!({"$and": [{"name": "x"}, {"$or": [{"$where": "true"}]}]}));
        assert_eq!(
            violation(QueryValidator::new().validate_query(&query)),
            ViolationKind::DisallowedOperator
        );
    }

    #[test]
    fn test_rejects_operator_inside_in_list() {
        let query = doc(json!({"owner": {"$in": [{"$regex": ".*"}]}}));
        assert_eq!(
            violation(QueryValidator::new().validate_query(&query)),
            ViolationKind::DisallowedOperator
        );
    }

    #[test]
    fn test_rejects_bad_field_names() {
        let validator = QueryValidator::new();
        for field in ["", "1abc", "a..b", "a.", "na me", "a;drop"] {
            let query = doc(json!({ field: 1 }));
            assert_eq!(violation(validator.validate_query(&query)), ViolationKind::InvalidField, "{field}");
        }
        assert!(validator.validate_query(&doc(json!({"metrics.daily.0": 1}))).is_ok());
    }

    #[test]
    fn test_structural_checks() {
        let validator = QueryValidator::new();
        for query in [
            json!({"$and": []}),
            json!({"$or": {"a": 1}}),
            json!({"$nor": [1, 2]}),
            json!({"a": {"$in": "x"}}),
            json!({"a": {"$not": 3}}),
        ] {
            assert_eq!(violation(validator.validate_query(&doc(query))), ViolationKind::MalformedQuery);
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut query = json!({"leaf": 1});
        for _ in 0..20 {
            query = json!({"$and": [query]});
        }
        assert_eq!(
            violation(QueryValidator::new().validate_query(&doc(query.clone()))),
            ViolationKind::MalformedQuery
        );
        assert!(QueryValidator::new()
            .with_max_depth(64)
            .validate_query(&doc(query))
            .is_ok());
    }

    #[test]
    fn test_update_allow_list() {
        let validator = QueryValidator::new();
        let update = doc(json!({"$set": {"status": "paused"}, "$inc": {"metrics.clicks": 1}}));
        assert!(validator.validate_update(&update).is_ok());

        let update = doc(json!({"$rename": {"a": "b"}}));
        assert_eq!(violation(validator.validate_update(&update)), ViolationKind::DisallowedOperator);

        let update = doc(json!({"status": "paused"}));
        assert_eq!(violation(validator.validate_update(&update)), ViolationKind::MalformedQuery);

        let update = doc(json!({"$set": {"$where": 1}}));
        assert_eq!(violation(validator.validate_update(&update)), ViolationKind::InvalidField);

        let update = doc(json!({"$pull": {"tags": {"$in": ["old"]}}}));
        assert!(validator.validate_update(&update).is_ok());

        let update = doc(json!({"$set": {"meta": {"$eq": 1}}}));
        assert_eq!(violation(validator.validate_update(&update)), ViolationKind::DisallowedOperator);
    }

    #[test]
    fn test_stored_documents_reject_nested_operators() {
        let validator = QueryValidator::new();
        let nested = doc(json!({"name": "Spring", "meta": {"$where": "sleep(100)"}}));
        assert_eq!(violation(validator.validate_document(&nested)), ViolationKind::DisallowedOperator);

        let in_array = doc(json!({"tags": [{"label": "a"}, {"$gt": 1}]}));
        assert_eq!(violation(validator.validate_document(&in_array)), ViolationKind::DisallowedOperator);

        let bad_key = doc(json!({"meta": {"bad key": 1}}));
        assert_eq!(violation(validator.validate_document(&bad_key)), ViolationKind::InvalidField);

        let plain = doc(json!({"name": "Spring", "meta": {"owner": "ops", "tags": ["q2", {"label": "a"}]}}));
        assert!(validator.validate_document(&plain).is_ok());
    }
}
