use crate::mirror::OptionalMirror;
use crate::paths::{parse_graph_file, ExportLocation, PathNamespace};
use pf_core::export_contracts::{ArtifactKind, MirrorStatus, WrittenArtifact};
use pf_core::{sha256_hex, SessionKey};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const MIRROR_OFFLINE: &str = "mirror root is not reachable";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("invalid artifact path {relative:?}: {reason}")]
    InvalidRelativePath {
        relative: String,
        reason: &'static str,
    },
    #[error("failed to write {path}: {source}")]
    Primary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {path} not found in primary or mirror root")]
    NotFound { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Primary,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRead {
    pub path: PathBuf,
    pub source: ReadSource,
    pub bytes: Vec<u8>,
}

/// Writes every artifact under the export root and copies the same bytes to
/// the mirror when one is reachable. The primary write decides success.
pub struct DualWriteStore {
    namespace: PathNamespace,
    mirror: Box<dyn OptionalMirror>,
}

impl DualWriteStore {
    pub fn new(namespace: PathNamespace, mirror: Box<dyn OptionalMirror>) -> Self {
        Self { namespace, mirror }
    }

    pub fn namespace(&self) -> &PathNamespace {
        &self.namespace
    }

    pub fn location(&self, key: &SessionKey, chunk_id: u64) -> ExportLocation {
        self.namespace.locations_for(key, chunk_id)
    }

    pub fn write_text(
        &self,
        key: &SessionKey,
        chunk_id: u64,
        kind: ArtifactKind,
        relative: &str,
        content: &str,
    ) -> Result<WrittenArtifact, WriteError> {
        self.write_bytes(key, chunk_id, kind, relative, content.as_bytes())
    }

    pub fn write_bytes(
        &self,
        key: &SessionKey,
        chunk_id: u64,
        kind: ArtifactKind,
        relative: &str,
        bytes: &[u8],
    ) -> Result<WrittenArtifact, WriteError> {
        check_relative(relative)?;
        let location = self.location(key, chunk_id);
        let primary_path = location.primary(relative);
        write_atomic(&primary_path, bytes).map_err(|source| WriteError::Primary {
            path: primary_path.clone(),
            source,
        })?;

        let mirror = self.mirror_bytes(location.mirror(relative), bytes);
        info!(
            event = "artifact_written",
            session = %key,
            chunk_id,
            kind = kind.as_str(),
            path = %primary_path.display(),
            bytes = bytes.len(),
            mirror = mirror.as_str()
        );

        Ok(WrittenArtifact {
            kind,
            primary_path,
            mirror,
            bytes: bytes.len() as u64,
            sha256: sha256_hex(bytes),
        })
    }

    /// Copies the bytes of a file that lives directly under the export root
    /// (the SQLite database) to its mirror counterpart.
    pub fn mirror_file(&self, primary: &Path, bytes: &[u8]) -> MirrorStatus {
        self.mirror_bytes(self.namespace.mirror_path_for(primary), bytes)
    }

    fn mirror_bytes(&self, target: Option<PathBuf>, bytes: &[u8]) -> MirrorStatus {
        let Some(target) = target else {
            return MirrorStatus::Disabled;
        };
        if !self.mirror.is_available() {
            warn!(event = "mirror_unavailable", path = %target.display(), reason = MIRROR_OFFLINE);
            return MirrorStatus::Unavailable {
                path: Some(target),
                reason: MIRROR_OFFLINE.to_string(),
            };
        }

        let result = match target.parent() {
            Some(parent) => self.mirror.mkdir(parent),
            None => Ok(()),
        }
        .and_then(|_| self.mirror.write(&target, bytes));

        match result {
            Ok(()) => MirrorStatus::Written { path: target },
            Err(err) => {
                warn!(event = "mirror_write_failed", path = %target.display(), error = %err);
                MirrorStatus::Unavailable {
                    path: Some(target),
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Reads an artifact from the primary root, falling back to the mirror
    /// when the primary copy is missing.
    pub fn read_bytes(
        &self,
        key: &SessionKey,
        chunk_id: u64,
        relative: &str,
    ) -> Result<ArtifactRead, WriteError> {
        check_relative(relative)?;
        let location = self.location(key, chunk_id);
        let primary_path = location.primary(relative);
        match fs::read(&primary_path) {
            Ok(bytes) => {
                return Ok(ArtifactRead {
                    path: primary_path,
                    source: ReadSource::Primary,
                    bytes,
                })
            }
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                return Err(WriteError::Read {
                    path: primary_path,
                    source: err,
                })
            }
            Err(_) => {}
        }

        if let Some(mirror_path) = location.mirror(relative) {
            if self.mirror.is_available() {
                if let Ok(bytes) = self.mirror.read(&mirror_path) {
                    return Ok(ArtifactRead {
                        path: mirror_path,
                        source: ReadSource::Mirror,
                        bytes,
                    });
                }
            }
        }

        Err(WriteError::NotFound { path: primary_path })
    }

    /// Chunk ids that have a graph document, ascending.
    pub fn graph_chunks(&self, key: &SessionKey) -> Result<Vec<u64>, WriteError> {
        let session_dir = self.namespace.session_dir(key);
        let names = match fs::read_dir(&session_dir) {
            Ok(entries) => {
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|source| WriteError::Read {
                        path: session_dir.clone(),
                        source,
                    })?;
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => self.mirror_listing(key),
            Err(source) => {
                return Err(WriteError::Read {
                    path: session_dir,
                    source,
                })
            }
        };

        let mut chunk_ids = names
            .iter()
            .filter_map(|name| parse_graph_file(name))
            .collect::<Vec<_>>();
        chunk_ids.sort_unstable();
        chunk_ids.dedup();
        Ok(chunk_ids)
    }

    fn mirror_listing(&self, key: &SessionKey) -> Vec<String> {
        let Some(mirror_dir) = self.location(key, 0).mirror_base else {
            return Vec::new();
        };
        if !self.mirror.is_available() {
            return Vec::new();
        }
        match self.mirror.list(&mirror_dir) {
            Ok(entries) => entries
                .into_iter()
                .filter(|entry| !entry.is_dir)
                .map(|entry| entry.name)
                .collect(),
            Err(err) => {
                warn!(event = "mirror_list_failed", path = %mirror_dir.display(), error = %err);
                Vec::new()
            }
        }
    }
}

fn check_relative(relative: &str) -> Result<(), WriteError> {
    let invalid = |reason| WriteError::InvalidRelativePath {
        relative: relative.to_string(),
        reason,
    };
    if relative.trim().is_empty() {
        return Err(invalid("empty path"));
    }
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory segment")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
        }
    }
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!(".{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{LocalDirMirror, NoMirror};
    use tempfile::tempdir;

    fn key() -> SessionKey {
        SessionKey::new("p1", "therapy", "2025-01-01").expect("key")
    }

    #[test]
    fn write_without_mirror_reports_disabled() {
        let dir = tempdir().expect("temp dir");
        let store = DualWriteStore::new(PathNamespace::new(dir.path(), None), Box::new(NoMirror));

        let written = store
            .write_text(&key(), 0, ArtifactKind::Cypher, "cypher/chunk_0.cypher", "MERGE (n);\n")
            .expect("write");

        assert_eq!(written.mirror, MirrorStatus::Disabled);
        assert_eq!(written.bytes, 11);
        assert_eq!(
            fs::read_to_string(dir.path().join("p1/therapy/2025-01-01/cypher/chunk_0.cypher"))
                .expect("read back"),
            "MERGE (n);\n"
        );
    }

    #[test]
    fn write_copies_bytes_to_reachable_mirror_and_overwrites() {
        let primary = tempdir().expect("primary");
        let mirror = tempdir().expect("mirror");
        let store = DualWriteStore::new(
            PathNamespace::new(primary.path(), Some(mirror.path().to_path_buf())),
            Box::new(LocalDirMirror::new(mirror.path())),
        );

        store
            .write_text(&key(), 1, ArtifactKind::QaCsv, "qa_chunk_1.csv", "old")
            .expect("first write");
        let written = store
            .write_text(&key(), 1, ArtifactKind::QaCsv, "qa_chunk_1.csv", "new")
            .expect("second write");

        let mirror_path = mirror.path().join("p1/therapy/2025-01-01/qa_chunk_1.csv");
        assert_eq!(
            written.mirror,
            MirrorStatus::Written {
                path: mirror_path.clone()
            }
        );
        assert_eq!(fs::read_to_string(mirror_path).expect("mirror copy"), "new");
        assert_eq!(written.sha256, sha256_hex(b"new"));
    }

    #[test]
    fn relative_paths_cannot_escape_session_dir() {
        let dir = tempdir().expect("temp dir");
        let store = DualWriteStore::new(PathNamespace::new(dir.path(), None), Box::new(NoMirror));

        for relative in ["../escape.csv", "/etc/passwd", "  "] {
            let err = store
                .write_text(&key(), 0, ArtifactKind::QaCsv, relative, "x")
                .expect_err("rejected");
            assert!(matches!(err, WriteError::InvalidRelativePath { .. }));
        }
    }

    #[test]
    fn reads_fall_back_to_mirror_when_primary_missing() {
        let primary = tempdir().expect("primary");
        let mirror = tempdir().expect("mirror");
        let mirror_dir = mirror.path().join("p1/therapy/2025-01-01");
        fs::create_dir_all(&mirror_dir).expect("mirror dir");
        fs::write(mirror_dir.join("graph_chunk_4.json"), "{}").expect("seed mirror");

        let store = DualWriteStore::new(
            PathNamespace::new(primary.path(), Some(mirror.path().to_path_buf())),
            Box::new(LocalDirMirror::new(mirror.path())),
        );

        let read = store
            .read_bytes(&key(), 4, "graph_chunk_4.json")
            .expect("mirror read");
        assert_eq!(read.source, ReadSource::Mirror);
        assert_eq!(read.bytes, b"{}");

        assert_eq!(store.graph_chunks(&key()).expect("listing"), vec![4]);

        let err = store
            .read_bytes(&key(), 5, "graph_chunk_5.json")
            .expect_err("missing everywhere");
        assert!(matches!(err, WriteError::NotFound { .. }));
    }

    #[test]
    fn graph_chunks_lists_primary_graph_files_in_order() {
        let dir = tempdir().expect("temp dir");
        let store = DualWriteStore::new(PathNamespace::new(dir.path(), None), Box::new(NoMirror));
        assert!(store.graph_chunks(&key()).expect("empty").is_empty());

        for chunk_id in [10, 2, 0] {
            store
                .write_text(
                    &key(),
                    chunk_id,
                    ArtifactKind::Graph,
                    &crate::paths::graph_file(chunk_id),
                    "{}",
                )
                .expect("write graph");
        }
        store
            .write_text(&key(), 3, ArtifactKind::QaCsv, "qa_chunk_3.csv", "x")
            .expect("write csv");

        assert_eq!(store.graph_chunks(&key()).expect("listing"), vec![0, 2, 10]);
    }
}
