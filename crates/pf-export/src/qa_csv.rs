use pf_core::{QaRow, SessionKey, QA_REQUIRED_COLUMNS};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QaInputError {
    #[error("provide exactly one of csv text or records")]
    AmbiguousInput,
    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("malformed csv: {0}")]
    Malformed(String),
    #[error("record {index}: {reason}")]
    InvalidRecord { index: usize, reason: String },
}

/// The two shapes an agent may hand over for a QA chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum CsvInput {
    Text(String),
    Records {
        records: Vec<Map<String, Value>>,
        columns: Option<Vec<String>>,
    },
}

impl CsvInput {
    pub fn from_parts(
        csv_text: Option<String>,
        records: Option<Vec<Map<String, Value>>>,
        columns: Option<Vec<String>>,
    ) -> Result<Self, QaInputError> {
        match (csv_text, records) {
            (Some(text), None) => Ok(Self::Text(text)),
            (None, Some(records)) => Ok(Self::Records { records, columns }),
            _ => Err(QaInputError::AmbiguousInput),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCsv {
    pub text: String,
    pub columns: Vec<String>,
    pub rows: usize,
}

/// Checks the header against the required columns and renders the final
/// file contents. Raw text is kept verbatim apart from a trailing newline.
pub fn prepare_csv(input: CsvInput) -> Result<PreparedCsv, QaInputError> {
    match input {
        CsvInput::Text(text) => prepare_text(text),
        CsvInput::Records { records, columns } => prepare_records(records, columns),
    }
}

fn prepare_text(mut text: String) -> Result<PreparedCsv, QaInputError> {
    let (columns, rows) = inspect_text(&text)?;

    if !text.ends_with('\n') {
        text.push('\n');
    }
    Ok(PreparedCsv {
        text,
        columns,
        rows,
    })
}

fn inspect_text(text: &str) -> Result<(Vec<String>, usize), QaInputError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let columns = reader
        .headers()
        .map_err(|err| QaInputError::Malformed(err.to_string()))?
        .iter()
        .map(|column| column.trim().to_string())
        .collect::<Vec<_>>();
    check_required(&columns)?;

    let mut rows = 0;
    for record in reader.records() {
        record.map_err(|err| QaInputError::Malformed(err.to_string()))?;
        rows += 1;
    }
    Ok((columns, rows))
}

fn prepare_records(
    records: Vec<Map<String, Value>>,
    columns: Option<Vec<String>>,
) -> Result<PreparedCsv, QaInputError> {
    let columns = columns.unwrap_or_else(|| {
        let mut seen = Vec::<String>::new();
        for record in &records {
            for name in record.keys() {
                if !seen.iter().any(|existing| existing == name) {
                    seen.push(name.clone());
                }
            }
        }
        seen
    });
    check_required(&columns)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .map_err(|err| QaInputError::Malformed(err.to_string()))?;
    for record in &records {
        let cells = columns
            .iter()
            .map(|column| cell_text(record.get(column)))
            .collect::<Vec<_>>();
        writer
            .write_record(&cells)
            .map_err(|err| QaInputError::Malformed(err.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| QaInputError::Malformed(err.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|err| QaInputError::Malformed(err.to_string()))?;

    Ok(PreparedCsv {
        text,
        columns,
        rows: records.len(),
    })
}

fn check_required(columns: &[String]) -> Result<(), QaInputError> {
    let missing = QA_REQUIRED_COLUMNS
        .iter()
        .filter(|required| !columns.iter().any(|column| column == *required))
        .map(|required| required.to_string())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(QaInputError::MissingColumns(missing))
    }
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Turns loosely typed records into rows keyed by `key`. Identity columns
/// absent from a record come from the session; every other required column
/// must be present in every record before any row is produced.
pub fn qa_rows_from_records(
    key: &SessionKey,
    records: &[Map<String, Value>],
) -> Result<Vec<QaRow>, QaInputError> {
    let missing = absent_record_columns(records);
    if !missing.is_empty() {
        return Err(QaInputError::MissingColumns(missing));
    }

    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            let turn_id = record
                .get("turn_id")
                .and_then(parse_turn_id)
                .ok_or_else(|| QaInputError::InvalidRecord {
                    index,
                    reason: "turn_id must be an integer".to_string(),
                })?;
            let text = |name: &str| cell_text(record.get(name)).trim().to_string();
            let identity = |name: &str, fallback: &str| {
                let value = text(name);
                if value.is_empty() {
                    fallback.to_string()
                } else {
                    value
                }
            };

            Ok(QaRow {
                patient_id: identity("patient_id", key.patient_id()),
                session_type: identity("session_type", key.session_type()),
                session_date: identity("session_date", key.session_date()),
                turn_id,
                speaker: text("speaker"),
                text_raw: cell_text(record.get("text_raw")),
                text_clean: cell_text(record.get("text_clean")),
            })
        })
        .collect()
}

/// Required non-identity columns that at least one record lacks or holds as
/// null, in header order.
fn absent_record_columns(records: &[Map<String, Value>]) -> Vec<String> {
    QA_REQUIRED_COLUMNS
        .iter()
        .filter(|column| !SESSION_DEFAULTED_COLUMNS.contains(column))
        .filter(|column| {
            records
                .iter()
                .any(|record| matches!(record.get(**column), None | Some(Value::Null)))
        })
        .map(|column| column.to_string())
        .collect()
}

const SESSION_DEFAULTED_COLUMNS: [&str; 2] = ["session_date", "session_type"];

fn parse_turn_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("p1", "therapy", "2025-01-01").expect("key")
    }

    const HEADER: &str = "session_date,session_type,turn_id,speaker,text_raw,text_clean";

    #[test]
    fn input_requires_exactly_one_form() {
        assert_eq!(
            CsvInput::from_parts(None, None, None),
            Err(QaInputError::AmbiguousInput)
        );
        assert_eq!(
            CsvInput::from_parts(Some("a".into()), Some(Vec::new()), None),
            Err(QaInputError::AmbiguousInput)
        );
    }

    #[test]
    fn text_input_counts_rows_and_terminates_newline() {
        let text = format!(
            "{HEADER}\n2025-01-01,therapy,1,Client,hi,Hi.\n2025-01-01,therapy,2,Therapist,\"so, why\",\"So, why?\""
        );
        let prepared = prepare_csv(CsvInput::Text(text.clone())).expect("prepare");
        assert_eq!(prepared.rows, 2);
        assert_eq!(prepared.text, format!("{text}\n"));
    }

    #[test]
    fn text_input_reports_missing_columns() {
        let err = prepare_csv(CsvInput::Text("turn_id,speaker\n1,Client\n".into()))
            .expect_err("missing columns");
        assert_eq!(
            err,
            QaInputError::MissingColumns(vec![
                "session_date".to_string(),
                "session_type".to_string(),
                "text_raw".to_string(),
                "text_clean".to_string(),
            ])
        );
    }

    #[test]
    fn records_follow_explicit_column_order_and_fill_gaps() {
        let columns = HEADER.split(',').map(str::to_string).collect::<Vec<_>>();
        let prepared = prepare_csv(CsvInput::Records {
            records: vec![
                record(json!({"turn_id": 1, "speaker": "Client", "text_clean": "Hi.",
                    "session_date": "2025-01-01", "session_type": "therapy"})),
                record(json!({"turn_id": 2, "speaker": "Therapist", "text_raw": "a, b",
                    "text_clean": "A, b.", "session_date": "2025-01-01", "session_type": "therapy"})),
            ],
            columns: Some(columns),
        })
        .expect("prepare");

        assert_eq!(prepared.rows, 2);
        let lines = prepared.text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "2025-01-01,therapy,1,Client,,Hi.");
        assert_eq!(lines[2], "2025-01-01,therapy,2,Therapist,\"a, b\",\"A, b.\"");
    }

    #[test]
    fn records_become_rows_with_session_defaults() {
        let rows = qa_rows_from_records(
            &key(),
            &[
                record(json!({"turn_id": "7", "speaker": "Client", "text_raw": "x", "text_clean": "X."})),
                record(json!({"turn_id": 8, "patient_id": "p2", "speaker": "Therapist",
                    "text_raw": "", "text_clean": ""})),
            ],
        )
        .expect("rows");

        assert_eq!(rows[0].turn_id, 7);
        assert_eq!(rows[0].patient_id, "p1");
        assert_eq!(rows[0].session_date, "2025-01-01");
        assert_eq!(rows[1].patient_id, "p2");
        assert_eq!(rows[1].text_clean, "");

        let err = qa_rows_from_records(
            &key(),
            &[record(json!({"turn_id": "seven", "speaker": "Client", "text_raw": "x", "text_clean": "X."}))],
        )
        .expect_err("bad turn id");
        assert!(matches!(err, QaInputError::InvalidRecord { index: 0, .. }));
    }

    #[test]
    fn records_missing_required_columns_reject_the_whole_batch() {
        let err = qa_rows_from_records(
            &key(),
            &[
                record(json!({"turn_id": 1, "speaker": "Client", "text_raw": "hi", "text_clean": "Hi."})),
                record(json!({"turn_id": 2, "speaker": null})),
            ],
        )
        .expect_err("incomplete record");
        assert_eq!(
            err,
            QaInputError::MissingColumns(vec![
                "speaker".to_string(),
                "text_raw".to_string(),
                "text_clean".to_string(),
            ])
        );

        let err = qa_rows_from_records(&key(), &[record(json!({"speaker": "Client",
            "text_raw": "hi", "text_clean": "Hi."}))])
        .expect_err("no turn id");
        assert_eq!(err, QaInputError::MissingColumns(vec!["turn_id".to_string()]));
    }
}
