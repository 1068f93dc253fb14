use crate::SessionKey;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// Annotation fields that always hold a list after normalization.
pub const ANNOTATION_LIST_FIELDS: [&str; 4] = [
    "distortions",
    "emotions_primary",
    "schemas",
    "defense_mechanisms",
];

/// Annotation fields that fall back to [`UNKNOWN_CATEGORY`] when unset.
pub const ANNOTATION_CATEGORICAL_FIELDS: [&str; 2] = ["attachment_style", "erikson_stage"];

pub const SENTIMENT_MIN: f64 = -1.0;
pub const SENTIMENT_MAX: f64 = 1.0;
pub const TRAIT_MIN: f64 = 0.0;
pub const TRAIT_MAX: f64 = 1.0;

/// Graph-JSON payload for one chunk of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub patient_id: String,
    pub session_date: String,
    pub session_type: String,
    pub chunk_index: u64,
    pub utterances: Vec<Utterance>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl GraphDocument {
    pub fn for_chunk(key: &SessionKey, chunk_index: u64, utterances: Vec<Utterance>) -> Self {
        Self {
            patient_id: key.patient_id().to_string(),
            session_date: key.session_date().to_string(),
            session_type: key.session_type().to_string(),
            chunk_index,
            utterances,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    pub turn_id: i64,
    pub speaker: String,
    pub text: String,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Utterance {
    pub fn new(turn_id: i64, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            turn_id,
            speaker: speaker.into(),
            text: text.into(),
            annotations: Annotations::default(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub distortions: Vec<String>,
    #[serde(default)]
    pub emotions_primary: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment2d: Option<Sentiment2d>,
    #[serde(default = "unknown_category")]
    pub erikson_stage: String,
    #[serde(default = "unknown_category")]
    pub attachment_style: String,
    /// Big Five trait scores keyed by `O`, `C`, `E`, `A`, `N`; `None` when not inferable.
    #[serde(default)]
    pub big5: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    pub schemas: Vec<String>,
    #[serde(default)]
    pub defense_mechanisms: Vec<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            distortions: Vec::new(),
            emotions_primary: Vec::new(),
            sentiment2d: None,
            erikson_stage: unknown_category(),
            attachment_style: unknown_category(),
            big5: BTreeMap::new(),
            schemas: Vec::new(),
            defense_mechanisms: Vec::new(),
            extra: Map::new(),
        }
    }
}

fn unknown_category() -> String {
    UNKNOWN_CATEGORY.to_string()
}

/// Russell circumplex point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sentiment2d {
    pub valence: f64,
    pub arousal: f64,
}

impl Sentiment2d {
    pub fn clamped(self) -> Self {
        Self {
            valence: clamp_sentiment(self.valence),
            arousal: clamp_sentiment(self.arousal),
        }
    }
}

pub fn clamp_sentiment(value: f64) -> f64 {
    value.clamp(SENTIMENT_MIN, SENTIMENT_MAX)
}

pub fn clamp_trait(value: f64) -> f64 {
    value.clamp(TRAIT_MIN, TRAIT_MAX)
}

/// Free-form analysis note persisted next to a chunk's artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightNote {
    pub title: String,
    pub notes_markdown: String,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

pub const DEFAULT_NOTE_TITLE: &str = "Analysis Insights";

impl InsightNote {
    pub fn new(title: impl Into<String>, notes_markdown: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            title: if title.trim().is_empty() {
                DEFAULT_NOTE_TITLE.to_string()
            } else {
                title
            },
            notes_markdown: notes_markdown.into(),
            metadata: empty_object(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = if metadata.is_null() {
            empty_object()
        } else {
            metadata
        };
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp_utc(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn render_markdown(&self, chunk_id: u64) -> String {
        format!(
            "## {} - Chunk {chunk_id}\n_Time:_ {}\n\n{}\n",
            self.title,
            self.timestamp_utc(),
            self.notes_markdown.trim()
        )
    }

    pub fn sidecar_json(&self, key: &SessionKey, chunk_id: u64) -> Value {
        json!({
            "patient_id": key.patient_id(),
            "session_type": key.session_type(),
            "session_date": key.session_date(),
            "chunk_id": chunk_id,
            "title": self.title,
            "timestamp_utc": self.timestamp_utc(),
            "metadata": self.metadata,
        })
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> SessionKey {
        SessionKey::new("p1", "therapy", "2025-01-01").expect("key")
    }

    #[test]
    fn sparse_annotations_deserialize_with_defaults() {
        let utterance: Utterance = serde_json::from_value(json!({
            "turn_id": 3,
            "speaker": "Client",
            "text": "I always mess up.",
            "annotations": {"distortions": ["Overgeneralisation"], "mood": "low"}
        }))
        .expect("utterance");

        assert_eq!(utterance.annotations.distortions, vec!["Overgeneralisation"]);
        assert!(utterance.annotations.schemas.is_empty());
        assert_eq!(utterance.annotations.attachment_style, UNKNOWN_CATEGORY);
        assert_eq!(utterance.annotations.extra.get("mood"), Some(&json!("low")));
    }

    #[test]
    fn sentiment_clamps_both_axes() {
        let point = Sentiment2d {
            valence: 5.0,
            arousal: -3.5,
        }
        .clamped();
        assert_eq!(point.valence, 1.0);
        assert_eq!(point.arousal, -1.0);
        assert_eq!(clamp_trait(1.7), 1.0);
        assert_eq!(clamp_trait(-0.2), 0.0);
    }

    #[test]
    fn insight_note_renders_markdown_and_sidecar() {
        let ts = Utc
            .with_ymd_and_hms(2025, 1, 1, 9, 30, 0)
            .single()
            .expect("ts");
        let note = InsightNote::new("", "  - avoidance spikes after turn 12\n")
            .with_metadata(json!({"tags": ["avoidance"]}))
            .with_timestamp(ts);

        let markdown = note.render_markdown(4);
        assert!(markdown.starts_with("## Analysis Insights - Chunk 4\n"));
        assert!(markdown.contains("_Time:_ 2025-01-01T09:30:00.000Z"));
        assert!(markdown.ends_with("- avoidance spikes after turn 12\n"));

        let sidecar = note.sidecar_json(&key(), 4);
        assert_eq!(sidecar["chunk_id"], json!(4));
        assert_eq!(sidecar["patient_id"], json!("p1"));
        assert_eq!(sidecar["metadata"]["tags"][0], json!("avoidance"));
    }
}
