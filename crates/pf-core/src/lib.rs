use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

pub mod export_contracts;
pub mod graph_contracts;

/// Columns every cleaned QA chunk must carry, in canonical CSV order.
pub const QA_REQUIRED_COLUMNS: [&str; 6] = [
    "session_date",
    "session_type",
    "turn_id",
    "speaker",
    "text_raw",
    "text_clean",
];

pub const SPEAKER_THERAPIST: &str = "Therapist";
pub const SPEAKER_CLIENT: &str = "Client";

const SESSION_KEY_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("missing session field: {field}")]
    MissingSessionField { field: &'static str },
    #[error("invalid session field {field}={value:?}: {reason}")]
    InvalidSessionField {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("invalid setting {name}={value:?}: {reason}")]
    InvalidSetting {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Identity of one therapy session. Every component is a single, non-empty
/// path segment, so the key maps injectively onto both the export directory
/// tree and the `chunks.session_key` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    patient_id: String,
    session_type: String,
    session_date: String,
}

impl SessionKey {
    pub fn new(
        patient_id: impl Into<String>,
        session_type: impl Into<String>,
        session_date: impl Into<String>,
    ) -> Result<Self, ContractError> {
        Ok(Self {
            patient_id: validate_segment("patient_id", patient_id.into())?,
            session_type: validate_segment("session_type", session_type.into())?,
            session_date: validate_segment("session_date", session_date.into())?,
        })
    }

    /// Builds a key from optional parts, typically environment or CLI input.
    /// Unset identity fields are never defaulted.
    pub fn from_parts(
        patient_id: Option<&str>,
        session_type: Option<&str>,
        session_date: Option<&str>,
    ) -> Result<Self, ContractError> {
        let patient_id = required_part("patient_id", patient_id)?;
        let session_type = required_part("session_type", session_type)?;
        let session_date = required_part("session_date", session_date)?;
        Self::new(patient_id, session_type, session_date)
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn session_type(&self) -> &str {
        &self.session_type
    }

    pub fn session_date(&self) -> &str {
        &self.session_date
    }

    /// Flat form used as the sequencing key, e.g. `p1|therapy|2025-01-01`.
    pub fn storage_key(&self) -> String {
        format!(
            "{}{SESSION_KEY_SEPARATOR}{}{SESSION_KEY_SEPARATOR}{}",
            self.patient_id, self.session_type, self.session_date
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.patient_id, self.session_type, self.session_date
        )
    }
}

fn required_part<'a>(field: &'static str, value: Option<&'a str>) -> Result<&'a str, ContractError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ContractError::MissingSessionField { field })
}

fn validate_segment(field: &'static str, value: String) -> Result<String, ContractError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ContractError::MissingSessionField { field });
    }
    let reason = if trimmed == "." || trimmed == ".." {
        Some("relative path segment")
    } else if trimmed
        .chars()
        .any(|ch| matches!(ch, '/' | '\\' | '\0') || ch == SESSION_KEY_SEPARATOR)
    {
        Some("contains a path or key separator")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ContractError::InvalidSessionField {
            field,
            value,
            reason,
        }),
        None => Ok(trimmed.to_string()),
    }
}

/// One cleaned transcript turn as stored in `qa_pairs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRow {
    pub patient_id: String,
    pub session_type: String,
    pub session_date: String,
    pub turn_id: i64,
    pub speaker: String,
    pub text_raw: String,
    pub text_clean: String,
}

impl QaRow {
    pub fn for_session(
        key: &SessionKey,
        turn_id: i64,
        speaker: impl Into<String>,
        text_raw: impl Into<String>,
        text_clean: impl Into<String>,
    ) -> Self {
        Self {
            patient_id: key.patient_id().to_string(),
            session_type: key.session_type().to_string(),
            session_date: key.session_date().to_string(),
            turn_id,
            speaker: speaker.into(),
            text_raw: text_raw.into(),
            text_clean: text_clean.into(),
        }
    }

    /// Names of identity columns that are blank; the store rejects such rows.
    pub fn blank_key_columns(&self) -> Vec<&'static str> {
        let mut blank = Vec::new();
        if self.patient_id.trim().is_empty() {
            blank.push("patient_id");
        }
        if self.session_type.trim().is_empty() {
            blank.push("session_type");
        }
        if self.session_date.trim().is_empty() {
            blank.push("session_date");
        }
        blank
    }
}

/// Maps free-text speaker labels onto `Therapist`/`Client`. Returns `None`
/// when no heuristic matches so callers can keep the original text.
pub fn canonical_speaker(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_lowercase();
    if lowered.contains("therap") {
        Some(SPEAKER_THERAPIST)
    } else if lowered.contains("client") || lowered.contains("patient") {
        Some(SPEAKER_CLIENT)
    } else {
        None
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_trims_and_formats_storage_key() {
        let key = SessionKey::new(" p1 ", "therapy", "2025-01-01").expect("valid key");
        assert_eq!(key.patient_id(), "p1");
        assert_eq!(key.storage_key(), "p1|therapy|2025-01-01");
        assert_eq!(key.to_string(), "p1/therapy/2025-01-01");
    }

    #[test]
    fn session_key_rejects_separators_and_relative_segments() {
        let err = SessionKey::new("p1/../x", "therapy", "2025-01-01").expect_err("slash");
        assert!(matches!(
            err,
            ContractError::InvalidSessionField {
                field: "patient_id",
                ..
            }
        ));
        assert!(SessionKey::new("p1", "..", "2025-01-01").is_err());
        assert!(SessionKey::new("p1", "therapy", "2025|01").is_err());
    }

    #[test]
    fn from_parts_reports_first_missing_identity_field() {
        let err = SessionKey::from_parts(Some("p1"), None, Some("2025-01-01"))
            .expect_err("missing session type");
        assert_eq!(
            err,
            ContractError::MissingSessionField {
                field: "session_type"
            }
        );

        let err = SessionKey::from_parts(Some("  "), Some("therapy"), Some("2025-01-01"))
            .expect_err("blank patient");
        assert_eq!(
            err,
            ContractError::MissingSessionField {
                field: "patient_id"
            }
        );
    }

    #[test]
    fn canonical_speaker_uses_substring_heuristics() {
        assert_eq!(canonical_speaker("THERAPIST (Carl)"), Some(SPEAKER_THERAPIST));
        assert_eq!(canonical_speaker("the therapist"), Some(SPEAKER_THERAPIST));
        assert_eq!(canonical_speaker("Patient A"), Some(SPEAKER_CLIENT));
        assert_eq!(canonical_speaker("client"), Some(SPEAKER_CLIENT));
        assert_eq!(canonical_speaker("Narrator"), None);
    }

    #[test]
    fn blank_key_columns_lists_empty_identity_fields() {
        let key = SessionKey::new("p1", "therapy", "2025-01-01").expect("key");
        let mut row = QaRow::for_session(&key, 1, "Client", "hi", "Hi.");
        assert!(row.blank_key_columns().is_empty());
        row.session_date = " ".to_string();
        assert_eq!(row.blank_key_columns(), vec!["session_date"]);
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
