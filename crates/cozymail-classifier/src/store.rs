use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use cozymail_core::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Vectorizer,
    Model,
}

impl ArtifactKind {
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Vectorizer => "spam_vectorizer.json",
            ArtifactKind::Model => "spam_model.json",
        }
    }
}

/// Opaque per-user artifact storage. A `put` replaces the previous blob.
pub trait ModelStore: Send + Sync {
    fn get(&self, user: UserId, kind: ArtifactKind) -> Result<Option<Vec<u8>>>;
    fn put(&self, user: UserId, kind: ArtifactKind, bytes: &[u8]) -> Result<()>;
}

/// `<root>/<user_id>/<artifact>.json`
pub struct FsModelStore {
    root: PathBuf,
}

impl FsModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, user: UserId, kind: ArtifactKind) -> PathBuf {
        self.root.join(user.to_string()).join(kind.file_name())
    }
}

impl ModelStore for FsModelStore {
    fn get(&self, user: UserId, kind: ArtifactKind) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(user, kind);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, user: UserId, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.path_for(user, kind), bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Default)]
pub struct MemoryModelStore {
    blobs: Mutex<HashMap<(UserId, ArtifactKind), Vec<u8>>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for MemoryModelStore {
    fn get(&self, user: UserId, kind: ArtifactKind) -> Result<Option<Vec<u8>>> {
        let blobs = self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(blobs.get(&(user, kind)).cloned())
    }

    fn put(&self, user: UserId, kind: ArtifactKind, bytes: &[u8]) -> Result<()> {
        let mut blobs = self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        blobs.insert((user, kind), bytes.to_vec());
        Ok(())
    }
}
