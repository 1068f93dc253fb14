use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntry {
    pub name: String,
    pub is_dir: bool,
}

/// File API of the secondary execution root. Paths are absolute paths in the
/// mirror's own namespace, as produced by [`crate::paths::PathNamespace`].
pub trait OptionalMirror {
    fn is_available(&self) -> bool;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn mkdir(&self, path: &Path) -> io::Result<()>;
    fn list(&self, path: &Path) -> io::Result<Vec<MirrorEntry>>;
}

/// Used when no secondary root is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMirror;

impl OptionalMirror for NoMirror {
    fn is_available(&self) -> bool {
        false
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        Err(disabled(path))
    }

    fn write(&self, path: &Path, _bytes: &[u8]) -> io::Result<()> {
        Err(disabled(path))
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        Err(disabled(path))
    }

    fn list(&self, path: &Path) -> io::Result<Vec<MirrorEntry>> {
        Err(disabled(path))
    }
}

fn disabled(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no mirror configured for {}", path.display()),
    )
}

/// Mirror backed by a directory that is bind-mounted into the sandbox. It is
/// available only while that directory exists.
#[derive(Debug, Clone)]
pub struct LocalDirMirror {
    root: PathBuf,
}

impl LocalDirMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl OptionalMirror for LocalDirMirror {
    fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        fs::write(path, bytes)
    }

    fn mkdir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn list(&self, path: &Path) -> io::Result<Vec<MirrorEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            entries.push(MirrorEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(entries)
    }
}
