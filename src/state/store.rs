//! Snapshot Store - durable run state for resume and branching
//!
//! One checksummed file per run id. Writes go to a temporary sibling first and
//! are renamed into place, so a crash never leaves a half-written snapshot.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{codec, fork, StateSnapshot};
use crate::error::StateError;

const SNAPSHOT_SUFFIX: &str = ".state.json";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", run_id, SNAPSHOT_SUFFIX))
    }

    pub async fn save(&self, snapshot: &StateSnapshot) -> Result<PathBuf, StateError> {
        fs::create_dir_all(&self.dir).await?;
        let bytes = codec::serialize(snapshot)?;
        let path = self.path_for(&snapshot.run_id);
        write_atomic(&path, &bytes).await?;
        debug!(run_id = %snapshot.run_id, turn = snapshot.turn, path = %path.display(), "Snapshot saved");
        Ok(path)
    }

    pub async fn load(&self, run_id: &str) -> Result<StateSnapshot, StateError> {
        load_path(&self.path_for(run_id)).await
    }

    /// `Ok(None)` when no snapshot was ever written for `run_id`.
    pub async fn try_load(&self, run_id: &str) -> Result<Option<StateSnapshot>, StateError> {
        match self.load(run_id).await {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Forks the stored run at `at_turn` and saves the branch beside it. The
    /// source snapshot is left untouched.
    pub async fn branch(&self, run_id: &str, at_turn: u32) -> Result<StateSnapshot, StateError> {
        let source = self.load(run_id).await?;
        let branch = fork(&source, at_turn)?;
        self.save(&branch).await?;
        debug!(from = %run_id, to = %branch.run_id, at_turn, "Run branched");
        Ok(branch)
    }

    pub async fn remove(&self, run_id: &str) -> Result<(), StateError> {
        let path = self.path_for(run_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

pub async fn load_path(path: &Path) -> Result<StateSnapshot, StateError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StateError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    codec::deserialize(&bytes)
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await
}
