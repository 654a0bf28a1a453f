//! File-level and per-record validation.
//!
//! Record validators return a list of human-readable field errors; an empty
//! list means the record is valid.

use serde_json::Value;

use crate::error::{ImportError, Result};

/// Parses an uploaded file into record documents. The file must be valid
/// JSON whose top level is a non-empty array.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.is_empty() {
        return Err(ImportError::Validation(vec![
            "Uploaded file is empty".to_string(),
        ]));
    }

    let parsed: Value = serde_json::from_slice(bytes)
        .map_err(|err| ImportError::Validation(vec![format!("File is not valid JSON: {err}")]))?;

    let Value::Array(records) = parsed else {
        return Err(ImportError::Validation(vec![
            "Expected a top-level JSON array of records".to_string(),
        ]));
    };

    if records.is_empty() {
        return Err(ImportError::Validation(vec![
            "No entities found in JSON file".to_string(),
        ]));
    }

    Ok(records)
}

/// Field errors for one ticket document.
pub fn validate_ticket(record: &Value) -> Vec<String> {
    let mut errors = Vec::new();

    let Some(object) = record.as_object() else {
        return vec!["Record is not a JSON object".to_string()];
    };

    match object.get("name").and_then(Value::as_str) {
        Some(name) if !name.trim().is_empty() => {}
        Some(_) => errors.push("Ticket name must not be blank".to_string()),
        None => errors.push("Ticket name is required".to_string()),
    }

    match object.get("price").and_then(Value::as_i64) {
        Some(price) if price > 0 => {}
        Some(_) => errors.push("Ticket price must be greater than zero".to_string()),
        None => errors.push("Ticket price is required".to_string()),
    }

    match object.get("number").and_then(Value::as_f64) {
        Some(number) if number > 0.0 => {}
        Some(_) => errors.push("Ticket number must be greater than zero".to_string()),
        None => errors.push("Ticket number is required".to_string()),
    }

    if object.get("refundable").and_then(Value::as_bool).is_none() {
        errors.push("Ticket refundable flag is required".to_string());
    }

    if let Some(discount) = object.get("discount").filter(|v| !v.is_null()) {
        match discount.as_f64() {
            Some(value) if value > 0.0 && value <= 100.0 => {}
            _ => errors.push("Ticket discount must be in (0, 100]".to_string()),
        }
    }

    if !has_reference(object, "coordinatesId", "coordinates") {
        errors.push("Coordinates are required".to_string());
    }

    if !has_reference(object, "venueId", "venue") {
        errors.push("Venue is required".to_string());
    }

    if let Some(venue) = object.get("venue").and_then(Value::as_object) {
        match venue.get("capacity").and_then(Value::as_i64) {
            Some(capacity) if capacity > 0 => {}
            Some(_) => errors.push("Venue capacity must be greater than zero".to_string()),
            None => errors.push("Venue capacity is required".to_string()),
        }
        if venue.get("name").and_then(Value::as_str).is_none() {
            errors.push("Venue name is required".to_string());
        }
    }

    errors
}

fn has_reference(
    object: &serde_json::Map<String, Value>,
    id_field: &str,
    inline_field: &str,
) -> bool {
    let has_id = object.get(id_field).is_some_and(|v| !v.is_null());
    let has_inline = object.get(inline_field).is_some_and(|v| !v.is_null());
    has_id || has_inline
}
