// SPDX-License-Identifier: MIT

//! Per-version state validators
//!
//! Validation never fails on an unexpected shape: every problem becomes a
//! `FieldViolation` in the returned `ValidationResult`. Only input that is
//! not a state payload at all surfaces as `MalformedStateError`.

use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use super::payload::{json_type_name, StatePayload};
use super::schema::WorkflowState;
use super::CURRENT_SCHEMA_VERSION;
use crate::engine::error::MalformedStateError;
use crate::engine::snapshot::compute_checksum;

const ROLES: [&str; 3] = ["user", "assistant", "system"];

/// One field-level problem, addressed by a dotted path such as
/// `conversation.messages[2].role`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub path: String,
    #[serde(flatten)]
    pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    Missing,
    WrongType {
        expected: &'static str,
        found: &'static str,
    },
    InvalidValue {
        reason: String,
    },
    UnsupportedVersion {
        expected: u32,
        found: u32,
    },
}

impl FieldViolation {
    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ViolationKind::Missing,
        }
    }

    pub fn wrong_type(path: impl Into<String>, expected: &'static str, found: &Value) -> Self {
        Self {
            path: path.into(),
            kind: ViolationKind::WrongType {
                expected,
                found: json_type_name(found),
            },
        }
    }

    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ViolationKind::InvalidValue {
                reason: reason.into(),
            },
        }
    }

    pub fn unsupported_version(expected: u32, found: u32) -> Self {
        Self {
            path: "schema_version".to_string(),
            kind: ViolationKind::UnsupportedVersion { expected, found },
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViolationKind::Missing => write!(f, "{}: missing", self.path),
            ViolationKind::WrongType { expected, found } => {
                write!(f, "{}: expected {}, found {}", self.path, expected, found)
            }
            ViolationKind::InvalidValue { reason } => write!(f, "{}: {}", self.path, reason),
            ViolationKind::UnsupportedVersion { expected, found } => write!(
                f,
                "{}: version {} is not supported here (expected {})",
                self.path, found, expected
            ),
        }
    }
}

/// Outcome of validating one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub schema_version: u32,
    pub violations: Vec<FieldViolation>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[FieldViolation] {
        &self.violations
    }

    pub fn into_violations(self) -> Vec<FieldViolation> {
        self.violations
    }
}

/// Validate an untyped state against the current schema version.
///
/// Fails only when `value` is not an object with a readable `schema_version`.
pub fn validate_state_version(value: &Value) -> Result<ValidationResult, MalformedStateError> {
    let payload = StatePayload::from_value(value.clone())?;
    Ok(validate_payload(&payload))
}

/// Validate a payload against the current schema version.
///
/// An older payload fails with an `UnsupportedVersion` violation; the
/// validator of its declared version still runs so the result also lists
/// what is wrong with it on its own terms.
pub fn validate_payload(payload: &StatePayload) -> ValidationResult {
    let version = payload.schema_version();
    let mut violations = Vec::new();
    if version != CURRENT_SCHEMA_VERSION {
        violations.push(FieldViolation::unsupported_version(
            CURRENT_SCHEMA_VERSION,
            version,
        ));
    }
    if let Some(validator) = validator_for(version) {
        violations.extend(validator(payload.fields()));
    }
    ValidationResult {
        schema_version: version,
        violations,
    }
}

/// Validate a payload against the schema it declares, whatever its version
pub fn validate_declared_version(payload: &StatePayload) -> ValidationResult {
    let version = payload.schema_version();
    let violations = match validator_for(version) {
        Some(validator) => validator(payload.fields()),
        None => vec![FieldViolation::unsupported_version(
            CURRENT_SCHEMA_VERSION,
            version,
        )],
    };
    ValidationResult {
        schema_version: version,
        violations,
    }
}

/// Validate a typed state against the current schema version
pub fn validate_state(state: &WorkflowState) -> ValidationResult {
    match state.to_payload() {
        Ok(payload) => validate_payload(&payload),
        Err(e) => ValidationResult {
            schema_version: state.schema_version,
            violations: vec![FieldViolation::invalid("", e.to_string())],
        },
    }
}

/// `validate_state`, plus a check that a recorded checksum still matches
/// the state's content
pub fn validate_with_checksum(state: &WorkflowState) -> ValidationResult {
    let mut result = validate_state(state);
    if let Some(recorded) = &state.checksum {
        match compute_checksum(state) {
            Ok(actual) if &actual == recorded => {}
            Ok(_) => result.violations.push(FieldViolation::invalid(
                "checksum",
                "does not match the state content",
            )),
            Err(e) => result
                .violations
                .push(FieldViolation::invalid("checksum", e.to_string())),
        }
    }
    result
}

type Validator = fn(&Map<String, Value>) -> Vec<FieldViolation>;

fn validator_for(version: u32) -> Option<Validator> {
    match version {
        1 => Some(validate_v1),
        2 => Some(validate_v2),
        3 => Some(validate_v3),
        _ => None,
    }
}

fn validate_v1(fields: &Map<String, Value>) -> Vec<FieldViolation> {
    let mut c = Checker::default();
    check_common(&mut c, fields);

    if let Some(conversation) = c.object(fields, "", "conversation") {
        check_messages(&mut c, conversation);
    }
    if let Some(query) = c.object(fields, "", "query_context") {
        for key in ["question", "sql", "datasource"] {
            c.optional_string(query, "query_context", key);
        }
    }
    if let Some(charts) = c.array(fields, "", "charts") {
        check_charts(&mut c, charts, "charts");
    }
    if let Some(records) = c.array(fields, "", "audit_log") {
        check_records(&mut c, records, "audit_log");
    }
    c.finish()
}

fn validate_v2(fields: &Map<String, Value>) -> Vec<FieldViolation> {
    validate_grouped(fields, false)
}

fn validate_v3(fields: &Map<String, Value>) -> Vec<FieldViolation> {
    validate_grouped(fields, true)
}

/// v2 and v3 share a layout; v3 adds intent, row limit and chart selection.
fn validate_grouped(fields: &Map<String, Value>, v3: bool) -> Vec<FieldViolation> {
    let mut c = Checker::default();
    check_common(&mut c, fields);

    if let Some(conversation) = c.object(fields, "", "conversation") {
        check_messages(&mut c, conversation);
        if v3 {
            c.optional_string(conversation, "conversation", "user_intent");
        }
    }

    if let Some(data) = c.object(fields, "", "data_context") {
        for key in ["query", "generated_sql", "datasource_id"] {
            c.optional_string(data, "data_context", key);
        }
        if let Some(columns) = c.array(data, "data_context", "columns") {
            c.strings(columns, "data_context.columns");
        }
        if v3 {
            c.integer(data, "data_context", "row_limit", 1);
        }
    }

    if let Some(artifacts) = c.object(fields, "", "artifacts") {
        let chart_ids = match c.array(artifacts, "artifacts", "charts") {
            Some(charts) => check_charts(&mut c, charts, "artifacts.charts"),
            None => Vec::new(),
        };
        if v3 {
            if let Some(selected) = c.optional_string(artifacts, "artifacts", "selected_chart_id") {
                if !chart_ids.contains(&selected) {
                    c.invalid(
                        "artifacts.selected_chart_id",
                        format!("no chart with id '{}'", selected),
                    );
                }
            }
        }
    }

    if let Some(audit) = c.object(fields, "", "audit") {
        if let Some(records) = c.array(audit, "audit", "records") {
            check_records(&mut c, records, "audit.records");
        }
    }
    c.finish()
}

fn check_common(c: &mut Checker, fields: &Map<String, Value>) {
    c.non_empty_string(fields, "", "session_id");
    c.optional_string(fields, "", "checksum");
}

fn check_messages(c: &mut Checker, conversation: &Map<String, Value>) {
    let Some(messages) = c.array(conversation, "conversation", "messages") else {
        return;
    };
    for (path, message) in c.objects(messages, "conversation.messages") {
        if let Some(role) = c.string(message, &path, "role") {
            if !ROLES.contains(&role) {
                c.invalid(join(&path, "role"), format!("unknown role '{}'", role));
            }
        }
        c.string(message, &path, "content");
    }
}

fn check_charts<'v>(c: &mut Checker, charts: &'v [Value], list_path: &str) -> Vec<&'v str> {
    let mut ids: Vec<&str> = Vec::new();
    for (path, chart) in c.objects(charts, list_path) {
        if let Some(id) = c.non_empty_string(chart, &path, "chart_id") {
            if ids.contains(&id) {
                c.invalid(join(&path, "chart_id"), format!("duplicate chart id '{}'", id));
            } else {
                ids.push(id);
            }
        }
        c.non_empty_string(chart, &path, "chart_type");
        c.optional_string(chart, &path, "title");
        c.object(chart, &path, "spec");
    }
    ids
}

fn check_records(c: &mut Checker, records: &[Value], list_path: &str) {
    for (path, record) in c.objects(records, list_path) {
        c.non_empty_string(record, &path, "node_name");
        c.integer(record, &path, "attempt_number", 1);
        for key in ["started_at", "completed_at"] {
            if let Some(ts) = c.string(record, &path, key) {
                if DateTime::parse_from_rfc3339(ts).is_err() {
                    c.invalid(join(&path, key), "not an RFC 3339 timestamp");
                }
            }
        }
        let status = c.string(record, &path, "status");
        let detail = c.optional_string(record, &path, "error_detail");
        match status {
            Some("success") if detail.is_some() => c.invalid(
                join(&path, "error_detail"),
                "must be absent on a successful attempt",
            ),
            Some("failed") | Some("retried") if detail.is_none() => {
                c.missing(join(&path, "error_detail"))
            }
            Some("success") | Some("failed") | Some("retried") | None => {}
            Some(other) => c.invalid(join(&path, "status"), format!("unknown status '{}'", other)),
        }
    }
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Accumulates violations while walking a payload
#[derive(Default)]
struct Checker {
    violations: Vec<FieldViolation>,
}

impl Checker {
    fn finish(self) -> Vec<FieldViolation> {
        self.violations
    }

    fn missing(&mut self, path: String) {
        self.violations.push(FieldViolation::missing(path));
    }

    fn invalid(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.violations.push(FieldViolation::invalid(path, reason));
    }

    fn field<'v>(&mut self, obj: &'v Map<String, Value>, parent: &str, key: &str) -> Option<&'v Value> {
        let value = obj.get(key);
        if value.is_none() {
            self.missing(join(parent, key));
        }
        value
    }

    fn object<'v>(
        &mut self,
        obj: &'v Map<String, Value>,
        parent: &str,
        key: &str,
    ) -> Option<&'v Map<String, Value>> {
        match self.field(obj, parent, key)? {
            Value::Object(map) => Some(map),
            other => {
                self.violations
                    .push(FieldViolation::wrong_type(join(parent, key), "object", other));
                None
            }
        }
    }

    fn array<'v>(&mut self, obj: &'v Map<String, Value>, parent: &str, key: &str) -> Option<&'v Vec<Value>> {
        match self.field(obj, parent, key)? {
            Value::Array(items) => Some(items),
            other => {
                self.violations
                    .push(FieldViolation::wrong_type(join(parent, key), "array", other));
                None
            }
        }
    }

    fn string<'v>(&mut self, obj: &'v Map<String, Value>, parent: &str, key: &str) -> Option<&'v str> {
        match self.field(obj, parent, key)? {
            Value::String(s) => Some(s),
            other => {
                self.violations
                    .push(FieldViolation::wrong_type(join(parent, key), "string", other));
                None
            }
        }
    }

    fn non_empty_string<'v>(
        &mut self,
        obj: &'v Map<String, Value>,
        parent: &str,
        key: &str,
    ) -> Option<&'v str> {
        let s = self.string(obj, parent, key)?;
        if s.trim().is_empty() {
            self.invalid(join(parent, key), "must not be empty");
            return None;
        }
        Some(s)
    }

    /// Absent, null or a string; returns the string when there is one
    fn optional_string<'v>(
        &mut self,
        obj: &'v Map<String, Value>,
        parent: &str,
        key: &str,
    ) -> Option<&'v str> {
        match obj.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                self.violations.push(FieldViolation::wrong_type(
                    join(parent, key),
                    "string or null",
                    other,
                ));
                None
            }
        }
    }

    fn integer(&mut self, obj: &Map<String, Value>, parent: &str, key: &str, min: u64) -> Option<u32> {
        let value = self.field(obj, parent, key)?;
        let Some(n) = value.as_u64() else {
            self.violations
                .push(FieldViolation::wrong_type(join(parent, key), "integer", value));
            return None;
        };
        if n < min {
            self.invalid(join(parent, key), format!("must be at least {}", min));
            return None;
        }
        match u32::try_from(n) {
            Ok(n) => Some(n),
            Err(_) => {
                self.invalid(join(parent, key), "does not fit in 32 bits");
                None
            }
        }
    }

    fn strings(&mut self, items: &[Value], list_path: &str) {
        for (i, item) in items.iter().enumerate() {
            if !item.is_string() {
                self.violations.push(FieldViolation::wrong_type(
                    format!("{}[{}]", list_path, i),
                    "string",
                    item,
                ));
            }
        }
    }

    /// Items of an array that are objects, paired with their paths
    fn objects<'v>(&mut self, items: &'v [Value], list_path: &str) -> Vec<(String, &'v Map<String, Value>)> {
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let path = format!("{}[{}]", list_path, i);
            match item {
                Value::Object(map) => out.push((path, map)),
                other => self
                    .violations
                    .push(FieldViolation::wrong_type(path, "object", other)),
            }
        }
        out
    }
}
