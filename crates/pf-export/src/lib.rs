pub mod config;
pub mod dual_write;
pub mod mirror;
pub mod paths;
pub mod qa_csv;
pub mod response;
pub mod schema;
pub mod sequencer;

use crate::config::{ExportConfig, SequencerBackend};
use crate::dual_write::{ArtifactRead, DualWriteStore, WriteError};
use crate::mirror::{LocalDirMirror, NoMirror, OptionalMirror};
use crate::paths::{artifact_file, cypher_file, graph_file, qa_csv_file, PathNamespace};
use crate::qa_csv::{prepare_csv, qa_rows_from_records, CsvInput, QaInputError};
use crate::schema::{GraphValidationError, SchemaValidator, DEFAULT_GRAPH_SCHEMA};
use crate::sequencer::{
    ChunkSequencer, CounterFileSequencer, SequencingError, SqliteChunkSequencer,
};
use pf_core::export_contracts::{
    ArtifactKind, ChunkStage, ExportSummary, FailureKind, MirrorStatus, QueryReport,
    SchemaViolation, WrittenArtifact,
};
use pf_core::graph_contracts::InsightNote;
use pf_core::{sha256_hex, ContractError, QaRow, SessionKey};
use pf_storage::{SessionStore, StorageError};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

pub use crate::response::ToolResponse;

pub const CYPHER_PREVIEW_LINES: usize = 15;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("configuration error: {0}")]
    Contract(#[from] ContractError),
    #[error("graph schema {path} unavailable: {reason}")]
    SchemaUnavailable { path: PathBuf, reason: String },
    #[error("validation error: {message}")]
    Validation {
        message: String,
        violations: Vec<SchemaViolation>,
        missing_columns: Vec<String>,
    },
    #[error("storage error: {0}")]
    Write(#[from] WriteError),
    #[error("storage error: {0}")]
    Database(#[from] StorageError),
    #[error("sequencing error: {0}")]
    Sequencing(#[from] SequencingError),
}

impl ExportError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            violations: Vec::new(),
            missing_columns: Vec::new(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Contract(_) | Self::SchemaUnavailable { .. } => FailureKind::Configuration,
            Self::Validation { .. } => FailureKind::Validation,
            Self::Write(WriteError::InvalidRelativePath { .. }) => FailureKind::Validation,
            Self::Database(
                StorageError::ReadOnlyViolation
                | StorageError::BlankKeyColumns { .. }
                | StorageError::InvalidParameter { .. },
            ) => FailureKind::Validation,
            Self::Write(_) | Self::Database(_) => FailureKind::Storage,
            Self::Sequencing(_) => FailureKind::Sequencing,
        }
    }

    pub fn detail(&self) -> Value {
        match self {
            Self::SchemaUnavailable { path, .. } => json!({ "schema_path": path }),
            Self::Validation {
                violations,
                missing_columns,
                ..
            } => {
                let mut detail = Map::new();
                if let Some(first) = violations.first() {
                    detail.insert("pointer".to_string(), json!(first.pointer));
                }
                if !violations.is_empty() {
                    detail.insert("violations".to_string(), json!(violations));
                }
                if !missing_columns.is_empty() {
                    detail.insert("missing_columns".to_string(), json!(missing_columns));
                }
                Value::Object(detail)
            }
            Self::Database(StorageError::BlankKeyColumns { index, columns }) => {
                json!({ "row": index, "blank_columns": columns })
            }
            _ => json!({}),
        }
    }
}

impl From<GraphValidationError> for ExportError {
    fn from(err: GraphValidationError) -> Self {
        let message = err.to_string();
        match err {
            GraphValidationError::SchemaUnavailable { path, reason } => {
                Self::SchemaUnavailable { path, reason }
            }
            GraphValidationError::Invalid { violations } => Self::Validation {
                message,
                violations,
                missing_columns: Vec::new(),
            },
        }
    }
}

impl From<QaInputError> for ExportError {
    fn from(err: QaInputError) -> Self {
        let message = err.to_string();
        match err {
            QaInputError::MissingColumns(missing_columns) => Self::Validation {
                message,
                violations: Vec::new(),
                missing_columns,
            },
            _ => Self::validation(message),
        }
    }
}

/// An [`ExportError`] plus how far the chunk got before it happened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExportFailure {
    pub error: ExportError,
    pub chunk_id: Option<u64>,
    pub stage: Option<ChunkStage>,
}

impl From<ExportError> for ExportFailure {
    fn from(error: ExportError) -> Self {
        Self {
            error,
            chunk_id: None,
            stage: None,
        }
    }
}

fn fail<E: Into<ExportError>>(
    chunk_id: Option<u64>,
    stage: Option<ChunkStage>,
) -> impl FnOnce(E) -> ExportFailure {
    move |err| ExportFailure {
        error: err.into(),
        chunk_id,
        stage,
    }
}

/// External similarity store for insight notes. Indexing is advisory.
pub trait NoteIndexer {
    fn index_note(
        &self,
        key: &SessionKey,
        chunk_id: u64,
        note: &InsightNote,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InitReport {
    pub export_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_root: Option<PathBuf>,
    pub schema_path: PathBuf,
    pub schema_installed: bool,
    pub db_path: PathBuf,
}

/// Creates the export (and mirror) roots, installs the bundled graph schema
/// when none exists, and bootstraps the database.
pub fn init_layout(config: &ExportConfig) -> Result<InitReport, ExportError> {
    let io_error = |path: &PathBuf, source| WriteError::Primary {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(&config.export_root).map_err(|err| io_error(&config.export_root, err))?;
    if let Some(mirror_root) = &config.mirror_root {
        if let Err(err) = fs::create_dir_all(mirror_root) {
            warn!(event = "mirror_unavailable", path = %mirror_root.display(), error = %err);
        }
    }

    let schema_installed = !config.schema_path.exists();
    if schema_installed {
        if let Some(parent) = config.schema_path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error(&config.schema_path, err))?;
        }
        fs::write(&config.schema_path, DEFAULT_GRAPH_SCHEMA)
            .map_err(|err| io_error(&config.schema_path, err))?;
    }

    let db_path = config.db_path();
    SessionStore::open(&db_path)?;
    info!(
        event = "layout_ready",
        export_root = %config.export_root.display(),
        schema_installed
    );

    Ok(InitReport {
        export_root: config.export_root.clone(),
        mirror_root: config.mirror_root.clone(),
        schema_path: config.schema_path.clone(),
        schema_installed,
        db_path,
    })
}

/// Single entry point for persisting session artifacts. Every method either
/// returns a summary of what landed where or an [`ExportFailure`].
pub struct SessionExporter {
    config: ExportConfig,
    key: SessionKey,
    files: DualWriteStore,
    sequencer: Box<dyn ChunkSequencer>,
    validator: SchemaValidator,
    indexer: Option<Box<dyn NoteIndexer>>,
}

impl SessionExporter {
    pub fn new(config: ExportConfig) -> Result<Self, ExportFailure> {
        let mirror: Box<dyn OptionalMirror> = match &config.mirror_root {
            Some(root) => Box::new(LocalDirMirror::new(root)),
            None => Box::new(NoMirror),
        };
        Self::with_mirror(config, mirror)
    }

    pub fn with_mirror(
        config: ExportConfig,
        mirror: Box<dyn OptionalMirror>,
    ) -> Result<Self, ExportFailure> {
        let key = config.session_key().map_err(fail(None, None))?;
        let sequencer: Box<dyn ChunkSequencer> = match config.sequencer {
            SequencerBackend::Sqlite => Box::new(SqliteChunkSequencer::new(config.db_path())),
            SequencerBackend::CounterFile => {
                Box::new(CounterFileSequencer::new(config.counter_path()))
            }
        };
        let namespace = PathNamespace::new(&config.export_root, config.mirror_root.clone());

        Ok(Self {
            files: DualWriteStore::new(namespace, mirror),
            validator: SchemaValidator::new(&config.schema_path),
            sequencer,
            key,
            config,
            indexer: None,
        })
    }

    pub fn with_note_indexer(mut self, indexer: Box<dyn NoteIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Allocates the next chunk id. With the SQLite ledger the database is
    /// re-mirrored afterwards; a failed copy is only logged since the id is
    /// already durable in the primary.
    pub fn next_chunk(&mut self) -> Result<u64, ExportFailure> {
        let chunk_id = self.sequencer.next(&self.key).map_err(fail(None, None))?;
        if self.config.sequencer == SequencerBackend::Sqlite && self.config.mirror_root.is_some() {
            if let Err(err) = self.mirror_database() {
                warn!(event = "db_mirror_failed", session = %self.key, chunk_id, error = %err);
            }
        }
        Ok(chunk_id)
    }

    fn mirror_database(&self) -> Result<WrittenArtifact, WriteError> {
        let db_path = self.config.db_path();
        let bytes = fs::read(&db_path).map_err(|source| WriteError::Read {
            path: db_path.clone(),
            source,
        })?;
        let mirror = self.files.mirror_file(&db_path, &bytes);
        Ok(WrittenArtifact {
            kind: ArtifactKind::Database,
            primary_path: db_path,
            mirror,
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
        })
    }

    fn resolve_chunk(&mut self, chunk_id: Option<u64>) -> Result<u64, ExportFailure> {
        match chunk_id {
            Some(chunk_id) => Ok(chunk_id),
            None => self.next_chunk(),
        }
    }

    pub fn write_csv(
        &mut self,
        chunk_id: Option<u64>,
        input: CsvInput,
    ) -> Result<ExportSummary, ExportFailure> {
        let prepared = prepare_csv(input).map_err(fail(chunk_id, None))?;
        let chunk_id = self.resolve_chunk(chunk_id)?;

        let artifact = self
            .files
            .write_text(
                &self.key,
                chunk_id,
                ArtifactKind::QaCsv,
                &qa_csv_file(chunk_id),
                &prepared.text,
            )
            .map_err(fail(Some(chunk_id), Some(ChunkStage::Allocated)))?;

        let mut summary = persisted(chunk_id, vec![artifact]);
        summary.counts.rows = Some(prepared.rows);
        info!(event = "csv_persisted", session = %self.key, chunk_id, rows = prepared.rows);
        Ok(summary)
    }

    pub fn write_graph(
        &mut self,
        chunk_id: Option<u64>,
        graph: Value,
    ) -> Result<ExportSummary, ExportFailure> {
        let chunk_id = self.resolve_chunk(chunk_id)?;
        let validated = self
            .validator
            .normalize_and_validate(graph, chunk_id, &self.key)
            .map_err(fail(Some(chunk_id), Some(ChunkStage::Allocated)))?;

        let mut payload = serde_json::to_string_pretty(&validated.value)
            .map_err(|err| ExportError::validation(err.to_string()))
            .map_err(fail(Some(chunk_id), Some(ChunkStage::Validated)))?;
        payload.push('\n');
        let artifact = self
            .files
            .write_text(
                &self.key,
                chunk_id,
                ArtifactKind::Graph,
                &graph_file(chunk_id),
                &payload,
            )
            .map_err(fail(Some(chunk_id), Some(ChunkStage::Validated)))?;

        let utterances = validated.document.utterances.len();
        let mut summary = persisted(chunk_id, vec![artifact]);
        summary.counts.utterances = Some(utterances);
        summary.warnings.extend(validated.warnings);
        info!(event = "graph_persisted", session = %self.key, chunk_id, utterances);
        Ok(summary)
    }

    pub fn write_cypher(
        &mut self,
        chunk_id: Option<u64>,
        cypher_text: &str,
    ) -> Result<ExportSummary, ExportFailure> {
        if cypher_text.trim().is_empty() {
            return Err(ExportFailure {
                error: ExportError::validation("cypher text is empty"),
                chunk_id,
                stage: None,
            });
        }
        let chunk_id = self.resolve_chunk(chunk_id)?;

        let mut content = cypher_text.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        let artifact = self
            .files
            .write_text(
                &self.key,
                chunk_id,
                ArtifactKind::Cypher,
                &cypher_file(chunk_id),
                &content,
            )
            .map_err(fail(Some(chunk_id), Some(ChunkStage::Allocated)))?;

        let lines = content.lines().count();
        let mut summary = persisted(chunk_id, vec![artifact]);
        summary.counts.lines = Some(lines);
        summary.preview = Some(
            content
                .lines()
                .take(CYPHER_PREVIEW_LINES)
                .collect::<Vec<_>>()
                .join("\n"),
        );
        info!(event = "cypher_persisted", session = %self.key, chunk_id, lines);
        Ok(summary)
    }

    /// Writes the note as Markdown plus a JSON sidecar under a freshly
    /// allocated chunk id, then offers it to the indexer if one is attached.
    pub fn write_note(&mut self, note: &InsightNote) -> Result<ExportSummary, ExportFailure> {
        let chunk_id = self.next_chunk()?;
        let (at, stage) = (Some(chunk_id), Some(ChunkStage::Allocated));

        let markdown = self
            .files
            .write_text(
                &self.key,
                chunk_id,
                ArtifactKind::InsightMarkdown,
                &paths::insights_markdown_file(chunk_id),
                &note.render_markdown(chunk_id),
            )
            .map_err(fail(at, stage))?;
        let mut sidecar = serde_json::to_string_pretty(&note.sidecar_json(&self.key, chunk_id))
            .map_err(|err| ExportError::validation(err.to_string()))
            .map_err(fail(at, stage))?;
        sidecar.push('\n');
        let json = self
            .files
            .write_text(
                &self.key,
                chunk_id,
                ArtifactKind::InsightJson,
                &paths::insights_json_file(chunk_id),
                &sidecar,
            )
            .map_err(fail(at, stage))?;

        let mut summary = persisted(chunk_id, vec![markdown, json]);
        if let Some(indexer) = &self.indexer {
            if let Err(err) = indexer.index_note(&self.key, chunk_id, note) {
                warn!(event = "note_index_failed", session = %self.key, chunk_id, error = %err);
                summary.warnings.push(format!("note indexing failed: {err}"));
            }
        }
        info!(event = "note_persisted", session = %self.key, chunk_id, title = %note.title);
        Ok(summary)
    }

    /// Record form used by agent tools: identity columns default to the
    /// session and `turn_id` may be a numeric string.
    pub fn upsert_qa_rows(
        &mut self,
        records: &[Map<String, Value>],
    ) -> Result<ExportSummary, ExportFailure> {
        let rows = qa_rows_from_records(&self.key, records).map_err(fail(None, None))?;
        self.upsert_rows(&rows)
    }

    pub fn upsert_rows(&mut self, rows: &[QaRow]) -> Result<ExportSummary, ExportFailure> {
        let upserted = {
            let mut store = SessionStore::open(self.config.db_path()).map_err(fail(None, None))?;
            store.upsert_qa_rows(rows).map_err(fail(None, None))?
        };

        let artifact = self.mirror_database().map_err(fail(None, None))?;

        let mut summary = ExportSummary::new(None);
        summary.artifacts.push(artifact);
        summary.counts.rows = Some(rows.len());
        summary.counts.upserted = Some(upserted);
        summary.warnings.extend(mirror_warnings(&summary.artifacts));
        info!(event = "qa_rows_upserted", session = %self.key, upserted);
        Ok(summary)
    }

    pub fn query(
        &self,
        sql: &str,
        params: &[Value],
        limit: Option<usize>,
    ) -> Result<QueryReport, ExportFailure> {
        let db_path = self.config.db_path();
        let store = SessionStore::open(&db_path).map_err(fail(None, None))?;
        let result = store.query(sql, params, limit).map_err(fail(None, None))?;

        Ok(QueryReport {
            db_path,
            columns: result.columns,
            rowcount: result.rows.len(),
            rows: result.rows,
            truncated: result.truncated,
        })
    }

    pub fn read_artifact(
        &self,
        kind: ArtifactKind,
        chunk_id: u64,
    ) -> Result<ArtifactRead, ExportFailure> {
        let relative = artifact_file(kind, chunk_id).ok_or_else(|| {
            ExportFailure::from(ExportError::validation(format!(
                "{} is not a chunk artifact",
                kind.as_str()
            )))
        })?;
        self.files
            .read_bytes(&self.key, chunk_id, &relative)
            .map_err(fail(Some(chunk_id), None))
    }

    pub fn graph_chunks(&self) -> Result<Vec<u64>, ExportFailure> {
        self.files.graph_chunks(&self.key).map_err(fail(None, None))
    }
}

fn persisted(chunk_id: u64, artifacts: Vec<WrittenArtifact>) -> ExportSummary {
    let mut summary = ExportSummary::new(Some(chunk_id));
    summary.stage = Some(ChunkStage::Persisted);
    summary.warnings = mirror_warnings(&artifacts);
    summary.artifacts = artifacts;
    summary
}

fn mirror_warnings(artifacts: &[WrittenArtifact]) -> Vec<String> {
    artifacts
        .iter()
        .filter_map(|artifact| match &artifact.mirror {
            MirrorStatus::Unavailable { reason, .. } => Some(format!(
                "mirror unavailable for {}: {reason}",
                artifact.kind.as_str()
            )),
            _ => None,
        })
        .collect()
}
