//! Write-once backups of pre-hardening artifacts
//!
//! The first time hostguard is about to change an artifact, its original
//! bytes (or the fact that it did not exist) are recorded here. Later runs
//! find the existing entry and leave it alone, so the store always holds
//! the state from before hostguard ever touched the host.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::BackupError;
use crate::host::Host;
use crate::types::unix_now;

const MANIFEST_EXT: &str = "json";
const DATA_EXT: &str = "orig";

/// Manifest of one backed-up artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Absolute host path of the artifact
    pub artifact: PathBuf,
    /// Whether the artifact existed before the first change
    pub existed: bool,
    /// SHA-256 of the original bytes, hex encoded
    pub sha256: Option<String>,
    pub size: u64,
    /// Unix seconds
    pub created_at: u64,
}

/// Result of `BackupStore::ensure`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// This call recorded the original state
    Created(BackupEntry),
    /// An earlier run already did; nothing was written
    AlreadyPresent(BackupEntry),
}

impl BackupOutcome {
    pub fn entry(&self) -> &BackupEntry {
        match self {
            BackupOutcome::Created(entry) | BackupOutcome::AlreadyPresent(entry) => entry,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, BackupOutcome::Created(_))
    }
}

/// Directory of backup entries, keyed by artifact path
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Store rooted at a real filesystem directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<state_dir>/backups` on `host`
    pub fn for_host(host: &Host, state_dir: &Path) -> Self {
        Self::new(host.path(state_dir).join("backups"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `/etc/ssh/sshd_config.d/x.conf` -> `etc_ssh_sshd_config.d_x.conf`
    fn key(artifact: &Path) -> String {
        artifact
            .to_string_lossy()
            .trim_start_matches('/')
            .replace('/', "_")
    }

    /// Where the original bytes of `artifact` are kept
    pub fn data_path(&self, artifact: &Path) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::key(artifact), DATA_EXT))
    }

    fn manifest_path(&self, artifact: &Path) -> PathBuf {
        self.dir.join(format!("{}.{}", Self::key(artifact), MANIFEST_EXT))
    }

    /// Record the original state of `artifact` unless already recorded.
    ///
    /// The manifest is claimed with `create_new`, so the existence check and
    /// the creation are one filesystem operation: two callers can never both
    /// create a backup for the same artifact.
    pub fn ensure(&self, host: &Host, artifact: &Path) -> Result<BackupOutcome, BackupError> {
        fs::create_dir_all(&self.dir)?;
        let manifest_path = self.manifest_path(artifact);

        let mut manifest = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&manifest_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let entry = self.read_manifest(&manifest_path)?;
                tracing::debug!("Backup of {:?} already present", artifact);
                return Ok(BackupOutcome::AlreadyPresent(entry));
            }
            Err(e) => return Err(e.into()),
        };

        let entry = match self.record(host, artifact, &mut manifest, &manifest_path) {
            Ok(entry) => entry,
            Err(e) => {
                // release the claim so the next run starts over; only a
                // crash mid-write leaves an empty manifest behind
                drop(manifest);
                self.release(artifact, &manifest_path);
                return Err(e);
            }
        };

        tracing::info!(
            "Backed up {:?} (existed: {}) to {:?}",
            artifact,
            entry.existed,
            self.dir
        );
        Ok(BackupOutcome::Created(entry))
    }

    fn record(
        &self,
        host: &Host,
        artifact: &Path,
        manifest: &mut fs::File,
        manifest_path: &Path,
    ) -> Result<BackupEntry, BackupError> {
        let original = host.read_optional(artifact)?;
        let entry = match &original {
            Some(bytes) => {
                write_replace(&self.data_path(artifact), bytes)?;
                BackupEntry {
                    artifact: artifact.to_path_buf(),
                    existed: true,
                    sha256: Some(sha256_hex(bytes)),
                    size: bytes.len() as u64,
                    created_at: unix_now(),
                }
            }
            None => BackupEntry {
                artifact: artifact.to_path_buf(),
                existed: false,
                sha256: None,
                size: 0,
                created_at: unix_now(),
            },
        };

        let json = serde_json::to_vec_pretty(&entry).map_err(|e| BackupError::Manifest {
            path: manifest_path.to_path_buf(),
            message: e.to_string(),
        })?;
        manifest.write_all(&json)?;
        manifest.sync_all()?;
        Ok(entry)
    }

    /// Undo a claimed but unfinished backup
    fn release(&self, artifact: &Path, manifest_path: &Path) {
        for path in [manifest_path.to_path_buf(), self.data_path(artifact)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Cannot remove unfinished backup {:?}: {}", path, e),
            }
        }
    }

    /// Entry for `artifact`, if one was recorded
    pub fn get(&self, artifact: &Path) -> Result<Option<BackupEntry>, BackupError> {
        let path = self.manifest_path(artifact);
        if !path.exists() {
            return Ok(None);
        }
        self.read_manifest(&path).map(Some)
    }

    /// Every recorded entry, ordered by artifact path
    pub fn list(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXT) {
                entries.push(self.read_manifest(&path)?);
            }
        }
        entries.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        Ok(entries)
    }

    /// Check stored bytes against the recorded checksum
    pub fn verify(&self, entry: &BackupEntry) -> Result<(), BackupError> {
        let Some(expected) = &entry.sha256 else {
            return Ok(());
        };
        let bytes = fs::read(self.data_path(&entry.artifact))?;
        let actual = sha256_hex(&bytes);
        if &actual != expected {
            return Err(BackupError::Corrupt {
                artifact: entry.artifact.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Put the original state back: rewrite the bytes, or remove the
    /// artifact when it did not exist before hostguard created it.
    /// The owning service is not reloaded.
    pub fn restore(&self, host: &Host, entry: &BackupEntry) -> Result<(), BackupError> {
        self.verify(entry)?;
        let target = host.path(&entry.artifact);
        if entry.existed {
            let bytes = fs::read(self.data_path(&entry.artifact))?;
            write_replace(&target, &bytes)?;
            tracing::info!("Restored {:?} from backup", entry.artifact);
        } else {
            match fs::remove_file(&target) {
                Ok(()) => tracing::info!("Removed {:?}, which did not exist originally", entry.artifact),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn read_manifest(&self, path: &Path) -> Result<BackupEntry, BackupError> {
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(BackupError::Manifest {
                path: path.to_path_buf(),
                message: "incomplete backup from an interrupted run; inspect manually".into(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| BackupError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Replace `path` with `bytes` via a sibling temp file and rename
fn write_replace(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("hostguard-tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
