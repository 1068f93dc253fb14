use pf_core::SessionKey;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_LEVEL: &str = "PF_LOG_LEVEL";

/// Where log lines go: always stderr (stdout carries tool JSON), plus an
/// append-only per-session file when a log directory is configured.
#[derive(Clone, Default)]
pub struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl LogSink {
    pub fn open(log_dir: &Path, session: Option<&SessionKey>) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(log_file_name(session));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            stderr: io::stderr().lock(),
            file: self.file.as_ref().and_then(|file| file.lock().ok()),
        }
    }
}

/// One event's worth of output; holds both locks until the line is written.
pub struct SinkWriter<'a> {
    stderr: io::StderrLock<'static>,
    file: Option<MutexGuard<'a, File>>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = self.file.as_mut() {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `--debug`, which
/// wins over `PF_LOG_LEVEL`.
pub fn init(debug: bool, log_dir: Option<&Path>, session: Option<&SessionKey>) {
    let directive = level_directive(debug, std::env::var(ENV_LOG_LEVEL).ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let (sink, open_error) = match log_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        Some(dir) => match LogSink::open(dir, session) {
            Ok(sink) => (sink, None),
            Err(err) => (LogSink::default(), Some((dir.to_path_buf(), err))),
        },
        None => (LogSink::default(), None),
    };
    let path = sink.path().map(Path::to_path_buf);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }

    if let Some((dir, err)) = open_error {
        warn!(event = "log_file_unavailable", log_dir = %dir.display(), error = %err);
    } else if let Some(path) = path {
        info!(event = "log_file_opened", path = %path.display());
    }
}

fn level_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn log_file_name(session: Option<&SessionKey>) -> String {
    match session {
        Some(key) => format!(
            "pf-{}-{}-{}.log",
            sanitize_component(key.patient_id()),
            sanitize_component(key.session_type()),
            sanitize_component(key.session_date())
        ),
        None => "pf.log".to_string(),
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn debug_flag_beats_environment_level() {
        assert_eq!(level_directive(true, Some("warn".to_string())), "debug");
        assert_eq!(level_directive(false, Some(" warn ".to_string())), "warn");
        assert_eq!(level_directive(false, Some("  ".to_string())), "info");
        assert_eq!(level_directive(false, None), "info");
    }

    #[test]
    fn log_file_is_named_per_session() {
        let key = SessionKey::new("p 1", "therapy", "2025-01-01").expect("key");
        assert_eq!(log_file_name(Some(&key)), "pf-p_1-therapy-2025-01-01.log");
        assert_eq!(log_file_name(None), "pf.log");
        assert_eq!(sanitize_component("a/b|c"), "a_b_c");
    }

    #[test]
    fn sink_appends_to_the_session_file() {
        let dir = tempdir().expect("temp dir");
        let log_dir = dir.path().join("logs");
        let key = SessionKey::new("p1", "therapy", "2025-01-01").expect("key");

        let sink = LogSink::open(&log_dir, Some(&key)).expect("open sink");
        let path = sink.path().expect("file path").to_path_buf();
        sink.make_writer().write_all(b"first\n").expect("write");
        drop(sink);

        let reopened = LogSink::open(&log_dir, Some(&key)).expect("reopen sink");
        reopened.make_writer().write_all(b"second\n").expect("write");

        assert_eq!(path, log_dir.join("pf-p1-therapy-2025-01-01.log"));
        assert_eq!(fs::read_to_string(&path).expect("log"), "first\nsecond\n");
        assert!(LogSink::default().path().is_none());
    }
}
