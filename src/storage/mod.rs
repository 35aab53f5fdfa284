//! Persisted membership snapshot.
//!
//! `state.json` in a node's working directory records the member list as of
//! the last membership change or bootstrap. Its presence at startup means the
//! node never left the cluster cleanly and has to rejoin; a clean shutdown
//! removes it.

mod error;

pub use self::error::StorageError;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::membership::Member;

pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub members: Vec<Member>,
}

impl PersistedState {
    /// Addresses of every recorded member other than `own_id`.
    pub fn peer_addresses(&self, own_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.id != own_id)
            .map(|m| m.address.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `Ok(None)` when no snapshot has been written.
    pub fn load(&self) -> Result<Option<PersistedState>, StorageError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Replaces the snapshot atomically: write to a sibling temp file, then rename.
    pub fn save(&self, members: &[Member]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = PersistedState {
            members: members.to_vec(),
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Removing a snapshot that does not exist is not an error.
    pub fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn members() -> Vec<Member> {
        vec![
            Member::new("n1", "127.0.0.1:7001"),
            Member::new("n2", "127.0.0.1:7002"),
        ]
    }

    #[test]
    fn save_then_load_returns_same_members() {
        let tmp = tempdir().expect("tempdir");
        let file = StateFile::new(tmp.path());
        assert_eq!(file.load().unwrap(), None);

        file.save(&members()).expect("save");
        assert!(file.exists());
        let state = file.load().expect("load").expect("state present");
        assert_eq!(state.members, members());
        assert_eq!(state.peer_addresses("n1"), vec!["127.0.0.1:7002".to_string()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempdir().expect("tempdir");
        let file = StateFile::new(tmp.path());
        file.save(&members()).unwrap();

        file.delete().expect("first delete");
        assert!(!file.exists());
        file.delete().expect("second delete");
    }

    #[test]
    fn corrupt_snapshot_is_reported() {
        let tmp = tempdir().expect("tempdir");
        fs::write(tmp.path().join(STATE_FILE), b"{not json").unwrap();
        assert!(matches!(
            StateFile::new(tmp.path()).load(),
            Err(StorageError::SerializationError(_))
        ));
    }
}
