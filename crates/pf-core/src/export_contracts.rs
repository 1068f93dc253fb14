use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    QaCsv,
    Graph,
    Cypher,
    InsightMarkdown,
    InsightJson,
    Database,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QaCsv => "qa_csv",
            Self::Graph => "graph",
            Self::Cypher => "cypher",
            Self::InsightMarkdown => "insight_markdown",
            Self::InsightJson => "insight_json",
            Self::Database => "database",
        }
    }
}

/// Lifecycle of one chunk inside a single export call. Graph documents pass
/// through `Validated`; other artifacts go straight to `Persisted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStage {
    Allocated,
    Validated,
    Persisted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorStatus {
    Written {
        path: PathBuf,
    },
    Unavailable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
        reason: String,
    },
    Disabled,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Written { .. } => "written",
            Self::Unavailable { .. } => "unavailable",
            Self::Disabled => "disabled",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Written { path } => Some(path),
            Self::Unavailable { path, .. } => path.as_ref(),
            Self::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub kind: ArtifactKind,
    pub primary_path: PathBuf,
    pub mirror: MirrorStatus,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportCounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utterances: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
}

/// Successful outcome of one facade call: where things landed and how much.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<ChunkStage>,
    #[serde(default)]
    pub artifacts: Vec<WrittenArtifact>,
    #[serde(default)]
    pub counts: ExportCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExportSummary {
    pub fn new(chunk_id: Option<u64>) -> Self {
        Self {
            chunk_id,
            stage: chunk_id.map(|_| ChunkStage::Allocated),
            artifacts: Vec::new(),
            counts: ExportCounts::default(),
            preview: None,
            warnings: Vec::new(),
        }
    }

    pub fn mirror_unavailable(&self) -> bool {
        self.artifacts
            .iter()
            .any(|artifact| artifact.mirror.is_unavailable())
    }

    pub fn primary_path(&self, kind: ArtifactKind) -> Option<&PathBuf> {
        self.artifacts
            .iter()
            .find(|artifact| artifact.kind == kind)
            .map(|artifact| &artifact.primary_path)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Validation,
    Storage,
    Sequencing,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Storage => "storage",
            Self::Sequencing => "sequencing",
        }
    }
}

/// One schema violation; `pointer` is a JSON pointer into the instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaViolation {
    pub pointer: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryReport {
    pub db_path: PathBuf,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rowcount: usize,
    #[serde(default)]
    pub truncated: bool,
}
