use fs2::FileExt;
use pf_core::SessionKey;
use pf_storage::{SessionStore, StorageError};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SequencingError {
    #[error("chunk ledger error: {0}")]
    Storage(#[from] StorageError),
    #[error("counter file {path}: {source}")]
    CounterIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("counter file {path} is corrupt: {reason}")]
    CorruptCounter { path: PathBuf, reason: String },
    #[error("chunk counter exhausted for {session}")]
    Exhausted { session: String },
}

/// Hands out chunk ids per session. An id is durable before it is returned;
/// implementations fail rather than invent one.
pub trait ChunkSequencer {
    fn next(&mut self, key: &SessionKey) -> Result<u64, SequencingError>;
}

/// Ledger in the `chunks` table of the session database.
pub struct SqliteChunkSequencer {
    db_path: PathBuf,
}

impl SqliteChunkSequencer {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

impl ChunkSequencer for SqliteChunkSequencer {
    fn next(&mut self, key: &SessionKey) -> Result<u64, SequencingError> {
        let mut store = SessionStore::open(&self.db_path)?;
        let chunk_id = store.next_chunk_id(key)?;
        info!(event = "chunk_allocated", backend = "sqlite", session = %key, chunk_id);
        Ok(chunk_id)
    }
}

/// JSON map of `session_key -> last issued id`, rewritten under an exclusive
/// lock on a sidecar `.lock` file.
pub struct CounterFileSequencer {
    path: PathBuf,
}

impl CounterFileSequencer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> SequencingError {
        SequencingError::CounterIo {
            path: self.path.clone(),
            source,
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chunk_counters".to_string());
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn read_counters(&self) -> Result<BTreeMap<String, u64>, SequencingError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(self.io_error(err)),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|err| SequencingError::CorruptCounter {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }

    fn write_counters(&self, counters: &BTreeMap<String, u64>) -> Result<(), SequencingError> {
        let payload = serde_json::to_vec_pretty(counters).map_err(|err| {
            SequencingError::CorruptCounter {
                path: self.path.clone(),
                reason: err.to_string(),
            }
        })?;
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path).map_err(|err| self.io_error(err))?;
        file.write_all(&payload).map_err(|err| self.io_error(err))?;
        file.sync_all().map_err(|err| self.io_error(err))?;
        fs::rename(&temp_path, &self.path).map_err(|err| self.io_error(err))
    }
}

impl ChunkSequencer for CounterFileSequencer {
    fn next(&mut self, key: &SessionKey) -> Result<u64, SequencingError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .map_err(|err| self.io_error(err))?;
        lock_file
            .lock_exclusive()
            .map_err(|err| self.io_error(err))?;

        let result = self.read_counters().and_then(|mut counters| {
            let session = key.storage_key();
            let chunk_id = match counters.get(&session) {
                Some(last) => last
                    .checked_add(1)
                    .ok_or_else(|| SequencingError::Exhausted {
                        session: session.clone(),
                    })?,
                None => 0,
            };
            counters.insert(session, chunk_id);
            self.write_counters(&counters)?;
            Ok(chunk_id)
        });

        let _ = lock_file.unlock();
        let chunk_id = result?;
        info!(event = "chunk_allocated", backend = "counter_file", session = %key, chunk_id);
        Ok(chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(patient: &str) -> SessionKey {
        SessionKey::new(patient, "therapy", "2025-01-01").expect("key")
    }

    #[test]
    fn sqlite_sequencer_starts_at_zero_and_persists() {
        let dir = tempdir().expect("temp dir");
        let db_path = dir.path().join("therapy.db");

        let mut sequencer = SqliteChunkSequencer::new(&db_path);
        let ids = (0..3)
            .map(|_| sequencer.next(&key("p1")).expect("next"))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2]);

        let mut restarted = SqliteChunkSequencer::new(&db_path);
        assert_eq!(restarted.next(&key("p1")).expect("after restart"), 3);
    }

    #[test]
    fn counter_file_sequencer_tracks_sessions_independently() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("exports").join("chunk_counters.json");
        let mut sequencer = CounterFileSequencer::new(&path);

        assert_eq!(sequencer.next(&key("p1")).expect("p1"), 0);
        assert_eq!(sequencer.next(&key("p1")).expect("p1"), 1);
        assert_eq!(sequencer.next(&key("p2")).expect("p2"), 0);

        let mut restarted = CounterFileSequencer::new(&path);
        assert_eq!(restarted.next(&key("p1")).expect("after restart"), 2);

        let stored: BTreeMap<String, u64> =
            serde_json::from_str(&fs::read_to_string(&path).expect("counter file"))
                .expect("counter json");
        assert_eq!(stored.get("p1|therapy|2025-01-01"), Some(&2));
    }

    #[test]
    fn corrupt_counter_file_fails_loudly() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("chunk_counters.json");
        fs::write(&path, "not json").expect("seed");

        let mut sequencer = CounterFileSequencer::new(&path);
        let err = sequencer.next(&key("p1")).expect_err("corrupt");
        assert!(matches!(err, SequencingError::CorruptCounter { .. }));
        assert_eq!(fs::read_to_string(&path).expect("untouched"), "not json");
    }

    #[test]
    fn counter_file_waits_for_external_lock_holder() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("chunk_counters.json");
        let mut sequencer = CounterFileSequencer::new(&path);
        sequencer.next(&key("p1")).expect("seed");

        let external = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sequencer.lock_path())
            .expect("open lock");
        external.lock_exclusive().expect("hold lock");

        let handle = std::thread::spawn(move || sequencer.next(&key("p1")).expect("next"));
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        external.unlock().expect("release");

        assert_eq!(handle.join().expect("join"), 1);
    }
}
