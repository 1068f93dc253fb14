use chrono::NaiveDate;
use jsonschema::{Draft, JSONSchema};
use pf_core::export_contracts::SchemaViolation;
use pf_core::graph_contracts::{
    clamp_sentiment, clamp_trait, GraphDocument, ANNOTATION_CATEGORICAL_FIELDS,
    ANNOTATION_LIST_FIELDS, UNKNOWN_CATEGORY,
};
use pf_core::{canonical_speaker, SessionKey};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Draft-07 schema shipped with the crate; `pf init` installs it at the
/// configured schema path.
pub const DEFAULT_GRAPH_SCHEMA: &str = include_str!("../schemas/graph_schema.json");

const INPUT_DATE_FORMATS: [&str; 2] = ["%d/%m/%Y", "%d-%m-%y"];
const IDENTITY_FIELDS: [&str; 3] = ["patient_id", "session_type", "session_date"];

#[derive(Debug, Error)]
pub enum GraphValidationError {
    #[error("graph schema {path} unavailable: {reason}")]
    SchemaUnavailable { path: PathBuf, reason: String },
    #[error("graph document failed validation: {}", summarize(.violations))]
    Invalid { violations: Vec<SchemaViolation> },
}

impl GraphValidationError {
    fn single(pointer: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            violations: vec![SchemaViolation {
                pointer: pointer.to_string(),
                message: message.into(),
            }],
        }
    }
}

fn summarize(violations: &[SchemaViolation]) -> String {
    match violations.first() {
        Some(first) if violations.len() > 1 => format!(
            "{} ({} more)",
            describe(first),
            violations.len() - 1
        ),
        Some(first) => describe(first),
        None => "no details".to_string(),
    }
}

fn describe(violation: &SchemaViolation) -> String {
    if violation.pointer.is_empty() {
        violation.message.clone()
    } else {
        format!("{}: {}", violation.pointer, violation.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedGraph {
    /// Normalized payload exactly as it will be persisted.
    pub value: Value,
    pub document: GraphDocument,
    pub warnings: Vec<String>,
}

/// Schema gate for Graph-JSON. The schema file is re-read on every call so
/// edits take effect without a restart.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    schema_path: PathBuf,
}

impl SchemaValidator {
    pub fn new(schema_path: impl Into<PathBuf>) -> Self {
        Self {
            schema_path: schema_path.into(),
        }
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }

    pub fn normalize_and_validate(
        &self,
        document: Value,
        chunk_id: u64,
        key: &SessionKey,
    ) -> Result<ValidatedGraph, GraphValidationError> {
        let schema = self.load_schema()?;
        let (value, warnings) = normalize_graph(document, chunk_id, key)?;
        validate_against(&schema, &self.schema_path, &value)?;

        let document = serde_json::from_value::<GraphDocument>(value.clone())
            .map_err(|err| GraphValidationError::single("", err.to_string()))?;
        Ok(ValidatedGraph {
            value,
            document,
            warnings,
        })
    }

    fn load_schema(&self) -> Result<Value, GraphValidationError> {
        let unavailable = |reason: String| GraphValidationError::SchemaUnavailable {
            path: self.schema_path.clone(),
            reason,
        };
        let raw = fs::read_to_string(&self.schema_path).map_err(|err| unavailable(err.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| unavailable(format!("invalid JSON: {err}")))
    }
}

fn validate_against(
    schema: &Value,
    schema_path: &Path,
    instance: &Value,
) -> Result<(), GraphValidationError> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|err| GraphValidationError::SchemaUnavailable {
            path: schema_path.to_path_buf(),
            reason: err.to_string(),
        })?;

    let violations = match compiled.validate(instance) {
        Ok(()) => return Ok(()),
        Err(errors) => errors
            .map(|err| SchemaViolation {
                pointer: err.instance_path.to_string(),
                message: err.to_string(),
            })
            .collect::<Vec<_>>(),
    };
    Err(GraphValidationError::Invalid { violations })
}

/// Best-effort cleanup applied before validation. Running it twice gives the
/// same result as running it once.
pub fn normalize_graph(
    document: Value,
    chunk_id: u64,
    key: &SessionKey,
) -> Result<(Value, Vec<String>), GraphValidationError> {
    let Value::Object(mut root) = document else {
        return Err(GraphValidationError::single(
            "",
            "graph document must be a JSON object",
        ));
    };
    let mut warnings = Vec::new();

    let expected = [key.patient_id(), key.session_type(), key.session_date()];
    for (field, expected) in IDENTITY_FIELDS.into_iter().zip(expected) {
        let current = root
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        match current {
            None if root.get(field).map_or(true, is_blank) => {
                root.insert(field.to_string(), Value::String(expected.to_string()));
            }
            Some(current) => {
                let current = if field == "session_date" {
                    coerce_date(&current)
                } else {
                    current
                };
                if current != expected {
                    warnings.push(format!(
                        "{field} {current:?} differs from session value {expected:?}"
                    ));
                }
                root.insert(field.to_string(), Value::String(current));
            }
            None => {}
        }
    }

    // chunk_index always equals the id in the file name.
    if let Some(existing) = root.get("chunk_index").filter(|value| !value.is_null()) {
        if existing.as_u64() != Some(chunk_id) {
            warnings.push(format!(
                "chunk_index {existing} replaced by allocated chunk {chunk_id}"
            ));
        }
    }
    root.insert("chunk_index".to_string(), Value::from(chunk_id));

    if let Some(Value::Array(utterances)) = root.get_mut("utterances") {
        for utterance in utterances.iter_mut() {
            if let Value::Object(utterance) = utterance {
                normalize_utterance(utterance);
            }
        }
    }

    for warning in &warnings {
        warn!(event = "graph_identity_mismatch", session = %key, chunk_id, detail = %warning);
    }

    Ok((Value::Object(root), warnings))
}

fn normalize_utterance(utterance: &mut Map<String, Value>) {
    if let Some(Value::String(speaker)) = utterance.get_mut("speaker") {
        if let Some(canonical) = canonical_speaker(speaker) {
            *speaker = canonical.to_string();
        }
    }

    let annotations = utterance
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if annotations.is_null() {
        *annotations = Value::Object(Map::new());
    }
    let Value::Object(annotations) = annotations else {
        return;
    };

    for field in ANNOTATION_LIST_FIELDS {
        let slot = annotations
            .entry(field)
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Null => *slot = Value::Array(Vec::new()),
            Value::String(single) => {
                let single = std::mem::take(single);
                *slot = if single.trim().is_empty() {
                    Value::Array(Vec::new())
                } else {
                    Value::Array(vec![Value::String(single)])
                };
            }
            _ => {}
        }
    }

    if let Some(Value::Object(sentiment)) = annotations.get_mut("sentiment2d") {
        for axis in ["valence", "arousal"] {
            clamp_number(sentiment.get_mut(axis), clamp_sentiment);
        }
    }

    if let Some(Value::Object(traits)) = annotations.get_mut("big5") {
        for value in traits.values_mut() {
            clamp_number(Some(value), clamp_trait);
        }
    }

    for field in ANNOTATION_CATEGORICAL_FIELDS {
        let slot = annotations
            .entry(field)
            .or_insert_with(|| Value::String(UNKNOWN_CATEGORY.to_string()));
        if is_blank(slot) {
            *slot = Value::String(UNKNOWN_CATEGORY.to_string());
        }
    }
}

fn clamp_number(slot: Option<&mut Value>, clamp: fn(f64) -> f64) {
    let Some(slot) = slot else {
        return;
    };
    let Some(number) = slot.as_f64() else {
        return;
    };
    let clamped = clamp(number);
    if clamped != number {
        *slot = Value::from(clamped);
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

/// `DD/MM/YYYY` and `DD-MM-YY` become `YYYY-MM-DD`; anything else is
/// returned unchanged.
pub fn coerce_date(raw: &str) -> String {
    let trimmed = raw.trim();
    INPUT_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn key() -> SessionKey {
        SessionKey::new("p1", "therapy", "2025-01-01").expect("key")
    }

    fn validator_with_default_schema(dir: &Path) -> SchemaValidator {
        let path = dir.join("graph_schema.json");
        fs::write(&path, DEFAULT_GRAPH_SCHEMA).expect("write schema");
        SchemaValidator::new(path)
    }

    #[test]
    fn coerce_date_handles_known_formats_only() {
        assert_eq!(coerce_date("31/12/2024"), "2024-12-31");
        assert_eq!(coerce_date("05-03-25"), "2025-03-05");
        assert_eq!(coerce_date("2025-01-01"), "2025-01-01");
        assert_eq!(coerce_date("next tuesday"), "next tuesday");
    }

    #[test]
    fn normalization_fills_identity_and_defaults() {
        let (value, warnings) = normalize_graph(
            json!({
                "utterances": [{
                    "turn_id": 1,
                    "speaker": "the therapist",
                    "text": "How are you?",
                    "annotations": {
                        "distortions": "Catastrophising",
                        "emotions_primary": null,
                        "sentiment2d": {"valence": 5.0, "arousal": -2},
                        "big5": {"O": 1.4, "N": null},
                        "attachment_style": ""
                    }
                }, {
                    "turn_id": 2,
                    "speaker": "Patient",
                    "text": "Fine."
                }]
            }),
            3,
            &key(),
        )
        .expect("normalize");

        assert!(warnings.is_empty());
        assert_eq!(value["patient_id"], json!("p1"));
        assert_eq!(value["session_date"], json!("2025-01-01"));
        assert_eq!(value["chunk_index"], json!(3));

        let first = &value["utterances"][0];
        assert_eq!(first["speaker"], json!("Therapist"));
        let annotations = &first["annotations"];
        assert_eq!(annotations["distortions"], json!(["Catastrophising"]));
        assert_eq!(annotations["emotions_primary"], json!([]));
        assert_eq!(annotations["schemas"], json!([]));
        assert_eq!(annotations["sentiment2d"]["valence"], json!(1.0));
        assert_eq!(annotations["sentiment2d"]["arousal"], json!(-1.0));
        assert_eq!(annotations["big5"]["O"], json!(1.0));
        assert_eq!(annotations["big5"]["N"], Value::Null);
        assert_eq!(annotations["attachment_style"], json!("Unknown"));
        assert_eq!(annotations["erikson_stage"], json!("Unknown"));

        let second = &value["utterances"][1];
        assert_eq!(second["speaker"], json!("Client"));
        assert_eq!(second["annotations"]["defense_mechanisms"], json!([]));
    }

    #[test]
    fn normalization_is_idempotent() {
        let input = json!({
            "session_date": "01/01/2025",
            "utterances": [{
                "turn_id": 1,
                "speaker": "client",
                "text": "x",
                "annotations": {"sentiment2d": {"valence": -9, "arousal": 0.2}}
            }]
        });
        let (once, _) = normalize_graph(input, 0, &key()).expect("first pass");
        let (twice, _) = normalize_graph(once.clone(), 0, &key()).expect("second pass");
        assert_eq!(once, twice);
        assert_eq!(once["session_date"], json!("2025-01-01"));
    }

    #[test]
    fn mismatched_identity_warns_and_chunk_index_follows_the_allocation() {
        let (value, warnings) = normalize_graph(
            json!({"patient_id": "p9", "chunk_index": 7, "utterances": []}),
            2,
            &key(),
        )
        .expect("normalize");
        assert_eq!(value["patient_id"], json!("p9"));
        assert_eq!(value["chunk_index"], json!(2));
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1].contains("chunk_index 7"));
    }

    #[test]
    fn non_object_document_is_rejected() {
        let err = normalize_graph(json!([1, 2]), 0, &key()).expect_err("array root");
        assert!(matches!(err, GraphValidationError::Invalid { .. }));
    }

    #[test]
    fn missing_utterances_fails_schema_with_pointer() {
        let dir = tempdir().expect("temp dir");
        let validator = validator_with_default_schema(dir.path());

        let err = validator
            .normalize_and_validate(json!({"patient_id": "p1"}), 0, &key())
            .expect_err("utterances required");
        let GraphValidationError::Invalid { violations } = err else {
            panic!("expected validation failure");
        };
        assert_eq!(violations[0].pointer, "");
        assert!(violations[0].message.contains("utterances"));
    }

    #[test]
    fn nested_violation_reports_instance_path() {
        let dir = tempdir().expect("temp dir");
        let validator = validator_with_default_schema(dir.path());

        let err = validator
            .normalize_and_validate(
                json!({"utterances": [{"turn_id": "one", "speaker": "Client", "text": "x"}]}),
                0,
                &key(),
            )
            .expect_err("turn_id must be integer");
        let GraphValidationError::Invalid { violations } = err else {
            panic!("expected validation failure");
        };
        assert_eq!(violations[0].pointer, "/utterances/0/turn_id");
    }

    #[test]
    fn valid_document_parses_into_typed_graph() {
        let dir = tempdir().expect("temp dir");
        let validator = validator_with_default_schema(dir.path());

        let validated = validator
            .normalize_and_validate(
                json!({"utterances": [{"turn_id": 1, "speaker": "T", "text": "Hello",
                    "annotations": {"sentiment2d": {"valence": 5.0, "arousal": 0.1}}}]}),
                4,
                &key(),
            )
            .expect("valid");
        assert_eq!(validated.document.chunk_index, 4);
        let sentiment = validated.document.utterances[0]
            .annotations
            .sentiment2d
            .expect("sentiment");
        assert_eq!(sentiment.valence, 1.0);
    }

    #[test]
    fn unreadable_schema_is_a_configuration_problem() {
        let dir = tempdir().expect("temp dir");
        let validator = SchemaValidator::new(dir.path().join("missing.json"));
        let err = validator
            .normalize_and_validate(json!({"utterances": []}), 0, &key())
            .expect_err("no schema");
        assert!(matches!(err, GraphValidationError::SchemaUnavailable { .. }));
    }
}
