//! On-disk layout of the node's data folder and the exclusive lock
//! over it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::NodeError;

/// The node data folder:
///
/// ```text
/// <root>/
///   peers.json       address book snapshot
///   mempool.dat      mempool snapshot
///   blocks/          block bodies by hash
///   chain/           header tree and stake chain
///   coinview/        UTXO entries and rewind window
///   common/          small singletons
///   provenheaders/   proven headers
///   lockfile         PID of the owning process
/// ```
#[derive(Debug, Clone)]
pub struct DataFolder {
    root: PathBuf,
}

impl DataFolder {
    /// Ensure the folder and its subdirectories exist.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, NodeError> {
        let root = root.into();

        for sub in ["blocks", "chain", "coinview", "common", "provenheaders"] {
            fs::create_dir_all(root.join(sub))?;
        }

        debug!(root = %root.display(), "data folder ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn peers_json(&self) -> PathBuf {
        self.root.join("peers.json")
    }

    pub fn mempool_dat(&self) -> PathBuf {
        self.root.join("mempool.dat")
    }

    pub fn lockfile(&self) -> PathBuf {
        self.root.join("lockfile")
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    pub fn chain_dir(&self) -> PathBuf {
        self.root.join("chain")
    }

    pub fn coinview_dir(&self) -> PathBuf {
        self.root.join("coinview")
    }

    pub fn common_dir(&self) -> PathBuf {
        self.root.join("common")
    }

    pub fn provenheaders_dir(&self) -> PathBuf {
        self.root.join("provenheaders")
    }
}

/// Exclusive ownership of a data folder for the process lifetime.
///
/// A PID lockfile is created with `create_new`; a second process
/// fails fast. The file is removed on drop.
pub struct FolderLock {
    path: PathBuf,
}

impl FolderLock {
    pub fn acquire(folder: &DataFolder) -> Result<Self, NodeError> {
        let path = folder.lockfile();

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "folder lock acquired");
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&path).unwrap_or_else(|_| "unknown".into());
                Err(NodeError::FolderLocked(owner))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for FolderLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::warn!(?err, "failed to remove lockfile");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_created() {
        let dir = tempfile::tempdir().unwrap();
        let folder = DataFolder::create(dir.path()).unwrap();

        for sub in ["blocks", "chain", "coinview", "common", "provenheaders"] {
            assert!(folder.root().join(sub).is_dir());
        }
    }

    #[test]
    fn second_lock_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let folder = DataFolder::create(dir.path()).unwrap();

        let lock = FolderLock::acquire(&folder).unwrap();
        assert!(matches!(
            FolderLock::acquire(&folder),
            Err(NodeError::FolderLocked(_))
        ));

        drop(lock);
        let _relock = FolderLock::acquire(&folder).unwrap();
    }
}
