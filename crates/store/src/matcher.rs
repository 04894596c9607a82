//! Filter evaluation and update application shared by the store backends.
//!
//! Implements exactly the allow-listed query and update operators. Inputs
//! are expected to have passed [`crate::QueryValidator`]; unknown operators
//! here simply fail to match.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use marketops_core::{Document, Error, Result, ID_FIELD};

/// Whether `document` satisfies `filter`.
pub fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => clauses(condition).all(|clause| matches(document, clause)),
        "$or" => clauses(condition).any(|clause| matches(document, clause)),
        "$nor" => !clauses(condition).any(|clause| matches(document, clause)),
        "$not" => condition
            .as_object()
            .is_some_and(|inner| !matches(document, inner)),
        field => matches_condition(lookup(document, field), condition),
    })
}

fn clauses(value: &Value) -> impl Iterator<Item = &Document> {
    value
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_operator_object(value: &Value) -> Option<&Map<String, Value>> {
    value
        .as_object()
        .filter(|map| !map.is_empty() && map.keys().all(|k| k.starts_with('$')))
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    match is_operator_object(condition) {
        Some(operators) => operators
            .iter()
            .all(|(operator, operand)| apply_operator(value, operator, operand)),
        None => equals(value, condition),
    }
}

fn apply_operator(value: Option<&Value>, operator: &str, operand: &Value) -> bool {
    match operator {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => compares(value, operand, |o| o == Ordering::Greater),
        "$gte" => compares(value, operand, |o| o != Ordering::Less),
        "$lt" => compares(value, operand, |o| o == Ordering::Less),
        "$lte" => compares(value, operand, |o| o != Ordering::Greater),
        "$in" => operand
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| equals(value, c))),
        "$nin" => operand
            .as_array()
            .is_some_and(|candidates| !candidates.iter().any(|c| equals(value, c))),
        "$exists" => truthy(operand) == value.is_some(),
        "$not" => !matches_condition(value, operand),
        _ => false,
    }
}

/// Equality with array membership; a missing field equals `null`.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) if values_equal(actual, expected) => true,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
        Some(_) => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compares(value: Option<&Value>, operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare(item, operand).is_some_and(&accept)),
        Some(actual) => compare(actual, operand).is_some_and(accept),
        None => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

/// Apply an update document in place. Returns whether anything changed.
///
/// The document is left untouched when the update fails.
pub fn apply_update(document: &mut Document, update: &Document) -> Result<bool> {
    let mut updated = document.clone();

    for (operator, fields) in update {
        let fields = fields
            .as_object()
            .ok_or_else(|| Error::invalid_request(format!("'{}' requires an object", operator)))?;

        for (path, operand) in fields {
            if path == ID_FIELD || path.starts_with("_id.") {
                return Err(Error::invalid_request("the _id field is immutable"));
            }
            match operator.as_str() {
                "$set" => *slot(&mut updated, path)? = operand.clone(),
                "$unset" => unset(&mut updated, path),
                "$inc" => increment(&mut updated, path, operand)?,
                "$push" => array_at(&mut updated, path)?.push(operand.clone()),
                "$addToSet" => {
                    let items = array_at(&mut updated, path)?;
                    if !items.iter().any(|item| values_equal(item, operand)) {
                        items.push(operand.clone());
                    }
                }
                "$pull" => array_at(&mut updated, path)?
                    .retain(|item| !matches_condition(Some(item), operand)),
                other => {
                    return Err(Error::invalid_request(format!(
                        "unsupported update operator '{}'",
                        other
                    )))
                }
            }
        }
    }

    let changed = updated != *document;
    *document = updated;
    Ok(changed)
}

/// Mutable slot at `path`, creating intermediate objects and a `null` leaf.
fn slot<'a>(document: &'a mut Document, path: &str) -> Result<&'a mut Value> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };

    let mut map = document;
    for segment in parents.into_iter().flat_map(|p| p.split('.')) {
        let next = map
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
        map = next.as_object_mut().ok_or_else(|| {
            Error::invalid_request(format!("cannot traverse non-object at '{}' in '{}'", segment, path))
        })?;
    }
    Ok(map.entry(leaf).or_insert(Value::Null))
}

fn unset(document: &mut Document, path: &str) {
    match path.rsplit_once('.') {
        None => {
            document.remove(path);
        }
        Some((parents, leaf)) => {
            let mut map = Some(document);
            for segment in parents.split('.') {
                map = map.and_then(|m| m.get_mut(segment)).and_then(Value::as_object_mut);
            }
            if let Some(map) = map {
                map.remove(leaf);
            }
        }
    }
}

fn increment(document: &mut Document, path: &str, by: &Value) -> Result<()> {
    let by = match by {
        Value::Number(n) => n.clone(),
        _ => {
            return Err(Error::invalid_request(format!(
                "$inc on '{}' requires a number",
                path
            )))
        }
    };
    let current = slot(document, path)?;

    let sum = match &*current {
        Value::Null => Value::Number(by),
        Value::Number(existing) => match (existing.as_i64(), by.as_i64()) {
            (Some(a), Some(b)) => a
                .checked_add(b)
                .map(Number::from)
                .or_else(|| Number::from_f64(a as f64 + b as f64))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => existing
                .as_f64()
                .zip(by.as_f64())
                .and_then(|(a, b)| Number::from_f64(a + b))
                .map(Value::Number)
                .unwrap_or(Value::Null),
        },
        _ => {
            return Err(Error::invalid_request(format!(
                "$inc on '{}' requires a numeric field",
                path
            )))
        }
    };
    *current = sum;
    Ok(())
}

fn array_at<'a>(document: &'a mut Document, path: &str) -> Result<&'a mut Vec<Value>> {
    let value = slot(document, path)?;
    if value.is_null() {
        *value = Value::Array(Vec::new());
    }
    value
        .as_array_mut()
        .ok_or_else(|| Error::invalid_request(format!("'{}' is not an array", path)))
}
