use pf_core::{ContractError, SessionKey};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_DB_FILE_NAME: &str = "therapy.db";
pub const COUNTER_FILE_NAME: &str = "chunk_counters.json";
pub const DEFAULT_SCHEMA_PATH: &str = "./data/psych_metadata/graph_schema.json";

pub const ENV_EXPORT_ROOT: &str = "PF_EXPORT_ROOT";
pub const ENV_MIRROR_ROOT: &str = "PF_MIRROR_ROOT";
pub const ENV_GRAPH_SCHEMA: &str = "PF_GRAPH_SCHEMA";
pub const ENV_SEQUENCER: &str = "PF_SEQUENCER";
pub const ENV_PATIENT_ID: &str = "PF_PATIENT_ID";
pub const ENV_SESSION_TYPE: &str = "PF_SESSION_TYPE";
pub const ENV_SESSION_DATE: &str = "PF_SESSION_DATE";

const DEFAULT_EXPORT_ROOT: &str = "./data/exports";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencerBackend {
    #[default]
    Sqlite,
    CounterFile,
}

impl SequencerBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Some(Self::Sqlite),
            "counter-file" | "counter_file" | "file" => Some(Self::CounterFile),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::CounterFile => "counter-file",
        }
    }
}

/// Everything the export layer needs to know about where things live.
/// Built once by the caller and handed to [`crate::SessionExporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub export_root: PathBuf,
    pub mirror_root: Option<PathBuf>,
    pub schema_path: PathBuf,
    pub db_file_name: String,
    pub sequencer: SequencerBackend,
    pub patient_id: Option<String>,
    pub session_type: Option<String>,
    pub session_date: Option<String>,
}

impl ExportConfig {
    pub fn new(export_root: impl Into<PathBuf>) -> Self {
        Self {
            export_root: export_root.into(),
            mirror_root: None,
            schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH),
            db_file_name: DEFAULT_DB_FILE_NAME.to_string(),
            sequencer: SequencerBackend::default(),
            patient_id: None,
            session_type: None,
            session_date: None,
        }
    }

    /// Reads the `PF_*` variables. Unknown sequencer names are rejected
    /// rather than silently mapped to the default.
    pub fn from_env() -> Result<Self, ContractError> {
        let export_root =
            env_value(ENV_EXPORT_ROOT).unwrap_or_else(|| DEFAULT_EXPORT_ROOT.to_string());
        let mut config = Self::new(export_root);
        config.mirror_root = env_value(ENV_MIRROR_ROOT).map(PathBuf::from);
        if let Some(schema) = env_value(ENV_GRAPH_SCHEMA) {
            config.schema_path = PathBuf::from(schema);
        }
        if let Some(raw) = env_value(ENV_SEQUENCER) {
            config.sequencer =
                SequencerBackend::parse(&raw).ok_or(ContractError::InvalidSetting {
                    name: ENV_SEQUENCER,
                    value: raw,
                    reason: "expected sqlite or counter-file",
                })?;
        }
        config.patient_id = env_value(ENV_PATIENT_ID);
        config.session_type = env_value(ENV_SESSION_TYPE);
        config.session_date = env_value(ENV_SESSION_DATE);
        Ok(config)
    }

    pub fn with_mirror_root(mut self, mirror_root: impl Into<PathBuf>) -> Self {
        self.mirror_root = Some(mirror_root.into());
        self
    }

    pub fn with_schema_path(mut self, schema_path: impl Into<PathBuf>) -> Self {
        self.schema_path = schema_path.into();
        self
    }

    pub fn with_sequencer(mut self, sequencer: SequencerBackend) -> Self {
        self.sequencer = sequencer;
        self
    }

    pub fn with_session(
        mut self,
        patient_id: impl Into<String>,
        session_type: impl Into<String>,
        session_date: impl Into<String>,
    ) -> Self {
        self.patient_id = Some(patient_id.into());
        self.session_type = Some(session_type.into());
        self.session_date = Some(session_date.into());
        self
    }

    pub fn session_key(&self) -> Result<SessionKey, ContractError> {
        SessionKey::from_parts(
            self.patient_id.as_deref(),
            self.session_type.as_deref(),
            self.session_date.as_deref(),
        )
    }

    pub fn db_path(&self) -> PathBuf {
        self.export_root.join(&self.db_file_name)
    }

    pub fn counter_path(&self) -> PathBuf {
        self.export_root.join(COUNTER_FILE_NAME)
    }

    pub fn schema_path(&self) -> &Path {
        &self.schema_path
    }
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
