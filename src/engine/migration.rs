// SPDX-License-Identifier: MIT

//! State migration service
//!
//! Stored payloads are upgraded through a linear chain of single-version
//! transforms. A payload at version N passes through every step between N
//! and the target; there are no shortcuts.

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::engine::error::{MigrationRegistrationError, UnsupportedMigrationError, WorkflowError};
use crate::engine::state::{
    validate_declared_version, StatePayload, WorkflowState, CURRENT_SCHEMA_VERSION,
    DEFAULT_ROW_LIMIT,
};

/// Pure function upgrading the fields of a payload by one schema version
pub type Transform = fn(Map<String, Value>) -> Map<String, Value>;

#[derive(Clone)]
struct MigrationStep {
    from: u32,
    description: &'static str,
    transform: Transform,
}

/// Ordered registry of single-increment migrations, keyed by source version
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationStep>,
}

static DEFAULT_REGISTRY: Lazy<MigrationRegistry> = Lazy::new(MigrationRegistry::with_defaults);

impl MigrationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every migration shipped with this build (1 -> 2 -> 3)
    pub fn with_defaults() -> Self {
        let mut steps = BTreeMap::new();
        for step in [
            MigrationStep {
                from: 1,
                description: "group query context, charts and audit log into sub-states",
                transform: v1_to_v2,
            },
            MigrationStep {
                from: 2,
                description: "add user intent, row limit and chart selection",
                transform: v2_to_v3,
            },
        ] {
            steps.insert(step.from, step);
        }
        Self { steps }
    }

    /// Register the transform upgrading `from` to `to`.
    ///
    /// `to` must be `from + 1` and no other transform may start at `from`.
    pub fn register(
        &mut self,
        from: u32,
        to: u32,
        description: &'static str,
        transform: Transform,
    ) -> Result<(), MigrationRegistrationError> {
        if from.checked_add(1) != Some(to) {
            return Err(MigrationRegistrationError::NotSingleStep { from, to });
        }
        if self.steps.contains_key(&from) {
            return Err(MigrationRegistrationError::Duplicate(from));
        }
        log::debug!("Registered migration {} -> {}: {}", from, to, description);
        self.steps.insert(
            from,
            MigrationStep {
                from,
                description,
                transform,
            },
        );
        Ok(())
    }

    /// Builder-style `register`
    pub fn with_step(
        mut self,
        from: u32,
        to: u32,
        description: &'static str,
        transform: Transform,
    ) -> Result<Self, MigrationRegistrationError> {
        self.register(from, to, description, transform)?;
        Ok(self)
    }

    /// Number of registered steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when a complete chain connects `from` to `to`
    pub fn can_migrate(&self, from: u32, to: u32) -> bool {
        from <= to && self.first_gap(from, to).is_none()
    }

    fn first_gap(&self, from: u32, to: u32) -> Option<u32> {
        (from..to).find(|version| !self.steps.contains_key(version))
    }

    /// Upgrade `payload` to `target_version`.
    ///
    /// A payload already at the target is returned untouched. Otherwise
    /// every step is applied in order and the stale checksum is dropped.
    pub fn migrate(
        &self,
        payload: StatePayload,
        target_version: u32,
    ) -> Result<StatePayload, UnsupportedMigrationError> {
        let from = payload.schema_version();
        if from == target_version {
            return Ok(payload);
        }
        if target_version < from {
            return Err(UnsupportedMigrationError::Downgrade {
                from,
                to: target_version,
            });
        }
        if let Some(missing) = self.first_gap(from, target_version) {
            return Err(UnsupportedMigrationError::MissingStep {
                from,
                to: target_version,
                missing,
            });
        }

        let session = payload.session_id().unwrap_or("<unknown>").to_string();
        let mut fields = payload.into_fields();
        fields.remove("checksum");

        for (version, step) in self.steps.range(from..target_version) {
            fields = (step.transform)(fields);
            fields.insert("schema_version".to_string(), Value::from(version + 1));
            log::info!(
                "Migrated session {} from schema version {} to {}: {}",
                session,
                step.from,
                version + 1,
                step.description
            );
        }

        Ok(StatePayload::with_version(fields, target_version))
    }

    /// Validate a stored payload at its declared version, migrate it to the
    /// current version and decode it
    pub fn upgrade(&self, payload: StatePayload) -> Result<WorkflowState, WorkflowError> {
        let declared = validate_declared_version(&payload);
        if !declared.is_valid() {
            return Err(WorkflowError::InvalidState {
                violations: declared.into_violations(),
            });
        }
        let migrated = self.migrate(payload, CURRENT_SCHEMA_VERSION)?;
        WorkflowState::from_payload(&migrated)
    }
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.steps
                    .values()
                    .map(|s| format!("{} -> {}: {}", s.from, s.from + 1, s.description)),
            )
            .finish()
    }
}

/// The registry shipped with this build
pub fn default_registry() -> &'static MigrationRegistry {
    &DEFAULT_REGISTRY
}

/// Migrate with the default registry
pub fn migrate_state(
    payload: StatePayload,
    target_version: u32,
) -> Result<StatePayload, UnsupportedMigrationError> {
    DEFAULT_REGISTRY.migrate(payload, target_version)
}

/// Migrate with the default registry, validate and decode
pub fn upgrade_to_current(payload: StatePayload) -> Result<WorkflowState, WorkflowError> {
    DEFAULT_REGISTRY.upgrade(payload)
}

fn take_object(fields: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match fields.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn take_array(fields: &mut Map<String, Value>, key: &str) -> Value {
    match fields.remove(key) {
        Some(value @ Value::Array(_)) => value,
        _ => Value::Array(Vec::new()),
    }
}

fn v1_to_v2(mut fields: Map<String, Value>) -> Map<String, Value> {
    let mut query_context = take_object(&mut fields, "query_context");
    let mut data_context = Map::new();
    for (old, new) in [
        ("question", "query"),
        ("sql", "generated_sql"),
        ("datasource", "datasource_id"),
    ] {
        data_context.insert(
            new.to_string(),
            query_context.remove(old).unwrap_or(Value::Null),
        );
    }
    data_context.insert("columns".to_string(), Value::Array(Vec::new()));
    fields.insert("data_context".to_string(), Value::Object(data_context));

    let mut artifacts = Map::new();
    artifacts.insert("charts".to_string(), take_array(&mut fields, "charts"));
    fields.insert("artifacts".to_string(), Value::Object(artifacts));

    let mut audit = Map::new();
    audit.insert("records".to_string(), take_array(&mut fields, "audit_log"));
    fields.insert("audit".to_string(), Value::Object(audit));
    fields
}

fn v2_to_v3(mut fields: Map<String, Value>) -> Map<String, Value> {
    for (parent, key, default) in [
        ("conversation", "user_intent", Value::Null),
        ("data_context", "row_limit", Value::from(DEFAULT_ROW_LIMIT)),
        ("artifacts", "selected_chart_id", Value::Null),
    ] {
        if let Some(Value::Object(sub)) = fields.get_mut(parent) {
            sub.entry(key).or_insert(default);
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::{validate_payload, CURRENT_SCHEMA_VERSION};
    use serde_json::json;

    fn v1_payload() -> StatePayload {
        StatePayload::from_value(json!({
            "schema_version": 1,
            "session_id": "abc",
            "conversation": {"messages": [{"role": "user", "content": "revenue by region"}]},
            "query_context": {
                "question": "revenue by region",
                "sql": "SELECT region, sum(amount) FROM sales GROUP BY region",
                "datasource": "sales"
            },
            "charts": [{"chart_id": "c1", "chart_type": "bar", "spec": {"mark": "bar"}}],
            "audit_log": [{
                "node_name": "generate_sql",
                "started_at": "2024-03-01T10:00:00Z",
                "completed_at": "2024-03-01T10:00:01Z",
                "status": "success",
                "attempt_number": 1
            }],
            "checksum": "stale"
        }))
        .unwrap()
    }

    #[test]
    fn test_noop_when_already_at_target() {
        let payload = v1_payload();
        let migrated = migrate_state(payload.clone(), 1).unwrap();
        assert_eq!(migrated, payload);
        assert_eq!(migrated.checksum(), Some("stale"));
    }

    #[test]
    fn test_v1_to_current() {
        let migrated = migrate_state(v1_payload(), CURRENT_SCHEMA_VERSION).unwrap();
        assert_eq!(migrated.schema_version(), 3);
        assert!(migrated.checksum().is_none());
        assert!(validate_payload(&migrated).is_valid());

        let fields = migrated.fields();
        assert_eq!(fields["data_context"]["query"], "revenue by region");
        assert_eq!(fields["data_context"]["datasource_id"], "sales");
        assert_eq!(fields["data_context"]["row_limit"], 1000);
        assert_eq!(fields["artifacts"]["charts"][0]["chart_id"], "c1");
        assert_eq!(fields["artifacts"]["selected_chart_id"], Value::Null);
        assert_eq!(fields["audit"]["records"].as_array().unwrap().len(), 1);
        assert!(fields.get("query_context").is_none());
        assert!(fields.get("audit_log").is_none());
    }

    #[test]
    fn test_chain_equals_stepwise() {
        let direct = migrate_state(v1_payload(), 3).unwrap();
        let v2 = migrate_state(v1_payload(), 2).unwrap();
        assert_eq!(v2.schema_version(), 2);
        let stepwise = migrate_state(v2, 3).unwrap();
        assert_eq!(direct, stepwise);
    }

    #[test]
    fn test_v2_to_v3_keeps_existing_values() {
        let payload = StatePayload::from_value(json!({
            "schema_version": 2,
            "session_id": "abc",
            "conversation": {"messages": [], "user_intent": "compare"},
            "data_context": {"columns": ["a"], "row_limit": 50},
            "artifacts": {"charts": []},
            "audit": {"records": []}
        }))
        .unwrap();
        let migrated = migrate_state(payload, 3).unwrap();
        assert_eq!(migrated.fields()["conversation"]["user_intent"], "compare");
        assert_eq!(migrated.fields()["data_context"]["row_limit"], 50);
    }

    #[test]
    fn test_downgrade_is_rejected() {
        let state = WorkflowState::new("abc").to_payload().unwrap();
        let err = migrate_state(state, 1).unwrap_err();
        assert_eq!(err, UnsupportedMigrationError::Downgrade { from: 3, to: 1 });
    }

    #[test]
    fn test_gap_is_rejected() {
        let registry = MigrationRegistry::new()
            .with_step(2, 3, "add defaults", v2_to_v3)
            .unwrap();
        let err = registry.migrate(v1_payload(), 3).unwrap_err();
        assert_eq!(
            err,
            UnsupportedMigrationError::MissingStep {
                from: 1,
                to: 3,
                missing: 1
            }
        );
        assert!(!registry.can_migrate(1, 3));
        assert!(registry.can_migrate(2, 3));
    }

    #[test]
    fn test_target_beyond_chain_is_rejected() {
        let err = migrate_state(v1_payload(), 4).unwrap_err();
        assert!(matches!(
            err,
            UnsupportedMigrationError::MissingStep { missing: 3, .. }
        ));
    }

    #[test]
    fn test_registration_rules() {
        let mut registry = MigrationRegistry::new();
        assert_eq!(
            registry.register(1, 3, "skip", v1_to_v2),
            Err(MigrationRegistrationError::NotSingleStep { from: 1, to: 3 })
        );
        registry.register(1, 2, "first", v1_to_v2).unwrap();
        assert_eq!(
            registry.register(1, 2, "again", v1_to_v2),
            Err(MigrationRegistrationError::Duplicate(1))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upgrade_decodes_current_state() {
        let state = upgrade_to_current(v1_payload()).unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.session_id, "abc");
        assert_eq!(state.audit.len(), 1);
        assert_eq!(state.checksum, None);
    }

    #[test]
    fn test_upgrade_rejects_invalid_source() {
        let mut fields = v1_payload().into_fields();
        fields.remove("query_context");
        let payload = StatePayload::from_fields(fields).unwrap();
        let err = upgrade_to_current(payload).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidState { .. }));
        assert_eq!(err.violations()[0].path, "query_context");
    }

    #[test]
    fn test_upgrade_reports_unknown_version() {
        let payload =
            StatePayload::from_value(json!({"schema_version": 7, "session_id": "abc"})).unwrap();
        assert!(upgrade_to_current(payload).is_err());
    }
}
