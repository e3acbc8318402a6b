// SPDX-License-Identifier: MIT

//! Raw state payloads as stored or received from outside the engine

use serde_json::{Map, Value};

use crate::engine::error::MalformedStateError;

/// A JSON object carrying a workflow state of some declared schema version.
///
/// Construction guarantees the payload is an object with a readable
/// `schema_version`; everything else is left to the validators.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePayload {
    fields: Map<String, Value>,
    version: u32,
}

impl StatePayload {
    /// Wrap an arbitrary JSON value
    pub fn from_value(value: Value) -> Result<Self, MalformedStateError> {
        match value {
            Value::Object(fields) => Self::from_fields(fields),
            other => Err(MalformedStateError::NotAnObject(json_type_name(&other))),
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(content: &str) -> Result<Self, MalformedStateError> {
        let value: Value = serde_json::from_str(content)?;
        Self::from_value(value)
    }

    /// Wrap an object, reading its declared version
    pub fn from_fields(fields: Map<String, Value>) -> Result<Self, MalformedStateError> {
        let version = read_version(&fields)?;
        Ok(Self { fields, version })
    }

    /// Used by the migration chain after a transform has run; the version
    /// key is overwritten so the stored fields always agree with `version`.
    pub(crate) fn with_version(mut fields: Map<String, Value>, version: u32) -> Self {
        fields.insert("schema_version".to_string(), Value::from(version));
        Self { fields, version }
    }

    /// Declared schema version
    pub fn schema_version(&self) -> u32 {
        self.version
    }

    /// Session id, when present and a string
    pub fn session_id(&self) -> Option<&str> {
        self.fields.get("session_id").and_then(Value::as_str)
    }

    /// Checksum recorded at snapshot time, if any
    pub fn checksum(&self) -> Option<&str> {
        self.fields.get("checksum").and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

fn read_version(fields: &Map<String, Value>) -> Result<u32, MalformedStateError> {
    let raw = fields
        .get("schema_version")
        .ok_or(MalformedStateError::MissingVersion)?;
    raw.as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| MalformedStateError::InvalidVersion(raw.to_string()))
}

/// Human-readable JSON type name used in error messages and violations
pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_u64() || n.is_i64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reads_declared_version() {
        let payload = StatePayload::from_value(json!({"schema_version": 2, "session_id": "abc"}))
            .unwrap();
        assert_eq!(payload.schema_version(), 2);
        assert_eq!(payload.session_id(), Some("abc"));
        assert_eq!(payload.checksum(), None);
    }

    #[test]
    fn test_rejects_non_objects() {
        let err = StatePayload::from_value(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, MalformedStateError::NotAnObject("array")));
    }

    #[test]
    fn test_rejects_missing_or_bad_version() {
        let err = StatePayload::from_value(json!({"session_id": "abc"})).unwrap_err();
        assert!(matches!(err, MalformedStateError::MissingVersion));

        let err = StatePayload::from_value(json!({"schema_version": "3"})).unwrap_err();
        assert!(matches!(err, MalformedStateError::InvalidVersion(_)));

        let err = StatePayload::from_value(json!({"schema_version": -1})).unwrap_err();
        assert!(matches!(err, MalformedStateError::InvalidVersion(_)));

        let err = StatePayload::from_value(json!({"schema_version": 1.5})).unwrap_err();
        assert!(matches!(err, MalformedStateError::InvalidVersion(_)));
    }

    #[test]
    fn test_unparseable_json_is_malformed() {
        let err = StatePayload::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, MalformedStateError::Parse(_)));
    }

    #[test]
    fn test_with_version_overwrites_key() {
        let mut fields = Map::new();
        fields.insert("schema_version".to_string(), json!(1));
        let payload = StatePayload::with_version(fields, 2);
        assert_eq!(payload.schema_version(), 2);
        assert_eq!(payload.fields()["schema_version"], json!(2));
    }
}
