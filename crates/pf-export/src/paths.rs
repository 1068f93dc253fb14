//! Canonical artifact locations. Nothing here touches the filesystem.

use pf_core::export_contracts::ArtifactKind;
use pf_core::SessionKey;
use std::path::{Path, PathBuf};

pub const CYPHER_DIR: &str = "cypher";

pub fn qa_csv_file(chunk_id: u64) -> String {
    format!("qa_chunk_{chunk_id}.csv")
}

pub fn graph_file(chunk_id: u64) -> String {
    format!("graph_chunk_{chunk_id}.json")
}

pub fn cypher_file(chunk_id: u64) -> String {
    format!("{CYPHER_DIR}/chunk_{chunk_id}.cypher")
}

pub fn insights_markdown_file(chunk_id: u64) -> String {
    format!("insights_chunk_{chunk_id}.md")
}

pub fn insights_json_file(chunk_id: u64) -> String {
    format!("insights_chunk_{chunk_id}.json")
}

/// Session-relative file name for a chunk artifact. The database is not
/// chunk scoped and has no entry here.
pub fn artifact_file(kind: ArtifactKind, chunk_id: u64) -> Option<String> {
    match kind {
        ArtifactKind::QaCsv => Some(qa_csv_file(chunk_id)),
        ArtifactKind::Graph => Some(graph_file(chunk_id)),
        ArtifactKind::Cypher => Some(cypher_file(chunk_id)),
        ArtifactKind::InsightMarkdown => Some(insights_markdown_file(chunk_id)),
        ArtifactKind::InsightJson => Some(insights_json_file(chunk_id)),
        ArtifactKind::Database => None,
    }
}

/// Parses `graph_chunk_{k}.json` back into `k`.
pub fn parse_graph_file(name: &str) -> Option<u64> {
    name.strip_prefix("graph_chunk_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNamespace {
    export_root: PathBuf,
    mirror_root: Option<PathBuf>,
}

impl PathNamespace {
    pub fn new(export_root: impl Into<PathBuf>, mirror_root: Option<PathBuf>) -> Self {
        Self {
            export_root: export_root.into(),
            mirror_root,
        }
    }

    pub fn export_root(&self) -> &Path {
        &self.export_root
    }

    pub fn mirror_root(&self) -> Option<&Path> {
        self.mirror_root.as_deref()
    }

    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        session_dir_under(&self.export_root, key)
    }

    pub fn locations_for(&self, key: &SessionKey, chunk_id: u64) -> ExportLocation {
        ExportLocation {
            primary_base: session_dir_under(&self.export_root, key),
            mirror_base: self
                .mirror_root
                .as_deref()
                .map(|root| session_dir_under(root, key)),
            chunk_id,
        }
    }

    /// Rewrites a path under the export root onto the mirror root. Paths
    /// outside the export root have no mirror counterpart.
    pub fn mirror_path_for(&self, primary: &Path) -> Option<PathBuf> {
        let mirror_root = self.mirror_root.as_deref()?;
        let relative = primary.strip_prefix(&self.export_root).ok()?;
        Some(mirror_root.join(relative))
    }

    pub fn database_location(&self, db_file_name: &str) -> (PathBuf, Option<PathBuf>) {
        let primary = self.export_root.join(db_file_name);
        let mirror = self.mirror_path_for(&primary);
        (primary, mirror)
    }
}

fn session_dir_under(root: &Path, key: &SessionKey) -> PathBuf {
    root.join(key.patient_id())
        .join(key.session_type())
        .join(key.session_date())
}

/// Resolved directories for one `(session, chunk)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLocation {
    pub primary_base: PathBuf,
    pub mirror_base: Option<PathBuf>,
    pub chunk_id: u64,
}

impl ExportLocation {
    pub fn primary(&self, relative: &str) -> PathBuf {
        self.primary_base.join(relative)
    }

    pub fn mirror(&self, relative: &str) -> Option<PathBuf> {
        self.mirror_base.as_ref().map(|base| base.join(relative))
    }

    pub fn qa_csv(&self) -> PathBuf {
        self.primary(&qa_csv_file(self.chunk_id))
    }

    pub fn graph(&self) -> PathBuf {
        self.primary(&graph_file(self.chunk_id))
    }

    pub fn cypher(&self) -> PathBuf {
        self.primary(&cypher_file(self.chunk_id))
    }

    pub fn insights_markdown(&self) -> PathBuf {
        self.primary(&insights_markdown_file(self.chunk_id))
    }

    pub fn insights_json(&self) -> PathBuf {
        self.primary(&insights_json_file(self.chunk_id))
    }
}
