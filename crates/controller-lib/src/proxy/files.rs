//! Config file handling
//!
//! - candidates are rendered into a staging directory, never in place
//! - differences are detected with SHA-256 content hashes
//! - replacing the active file first copies it into a timestamped backup,
//!   keeping only the newest `backups_to_keep`
//! - writes go to a temp file that is renamed over the target
//! - after a failed reload the file saved by the last replace is restored

use crate::error::ProxyError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Where the configuration of one proxy lives on disk
#[derive(Debug, Clone)]
pub struct FileLayout {
    /// Active configuration file read by the proxy
    pub config_path: PathBuf,
    /// Directory for rendered candidates
    pub staging_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub backups_to_keep: usize,
}

impl FileLayout {
    pub fn new(config_path: impl Into<PathBuf>, work_dir: impl AsRef<Path>) -> Self {
        let work_dir = work_dir.as_ref();
        Self {
            config_path: config_path.into(),
            staging_dir: work_dir.join("staging"),
            backup_dir: work_dir.join("backup"),
            backups_to_keep: 5,
        }
    }
}

/// A rendered candidate configuration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    pub path: PathBuf,
    pub checksum: String,
}

/// Operations on the active config file and its backups
pub struct ConfigFiles {
    layout: FileLayout,
    /// Backup taken by the last replace; `None` inside means there was no file
    last_backup: Mutex<Option<Option<PathBuf>>>,
    sequence: AtomicU64,
}

impl ConfigFiles {
    pub fn new(layout: FileLayout) -> Self {
        Self {
            layout,
            last_backup: Mutex::new(None),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn active_path(&self) -> &Path {
        &self.layout.config_path
    }

    fn file_name(&self) -> String {
        self.layout
            .config_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "proxy.cfg".to_string())
    }

    /// Write a candidate into the staging directory
    pub async fn write_candidate(&self, content: &str) -> Result<RenderedConfig, ProxyError> {
        let dir = &self.layout.staging_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProxyError::file(dir, e))?;

        let path = dir.join(format!("{}.new", self.file_name()));
        write_atomic(&path, content.as_bytes()).await?;

        let checksum = compute_checksum(content.as_bytes());
        debug!(path = %path.display(), checksum = %checksum, "Candidate configuration written");
        Ok(RenderedConfig { path, checksum })
    }

    /// Hash of the active file, `None` when it does not exist
    pub async fn active_checksum(&self) -> Result<Option<String>, ProxyError> {
        let path = &self.layout.config_path;
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(compute_checksum(&data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProxyError::file(path, e)),
        }
    }

    /// Whether the candidate differs from the active file
    pub async fn differs(&self, candidate: &RenderedConfig) -> Result<bool, ProxyError> {
        let active = self.active_checksum().await?;
        Ok(active.as_deref() != Some(candidate.checksum.as_str()))
    }

    /// Back up the active file, then move the candidate into place
    pub async fn replace(&self, candidate: &RenderedConfig) -> Result<(), ProxyError> {
        let content = tokio::fs::read(&candidate.path)
            .await
            .map_err(|e| ProxyError::file(&candidate.path, e))?;

        let backup = self.backup_active().await?;
        write_atomic(&self.layout.config_path, &content).await?;
        *self.lock_backup() = Some(backup);

        info!(
            path = %self.layout.config_path.display(),
            checksum = %candidate.checksum,
            "Active configuration replaced"
        );
        Ok(())
    }

    /// Undo the last replace; returns false if there was nothing to undo
    pub async fn restore_previous(&self) -> Result<bool, ProxyError> {
        let Some(backup) = self.lock_backup().take() else {
            return Ok(false);
        };
        let active = &self.layout.config_path;

        match backup {
            Some(backup) => {
                let content = tokio::fs::read(&backup)
                    .await
                    .map_err(|e| ProxyError::file(&backup, e))?;
                write_atomic(active, &content).await?;
                info!(backup = %backup.display(), "Previous configuration restored");
            }
            None => {
                // There was no file before; removing it makes the next pass re-apply
                match tokio::fs::remove_file(active).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(ProxyError::file(active, e)),
                }
                info!(path = %active.display(), "Removed configuration with no predecessor");
            }
        }
        Ok(true)
    }

    /// Backups of the active file, oldest first
    pub async fn backups(&self) -> Result<Vec<PathBuf>, ProxyError> {
        let dir = &self.layout.backup_dir;
        let prefix = format!("{}.", self.file_name());

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ProxyError::file(dir, e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ProxyError::file(dir, e))?
        {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                backups.push(entry.path());
            }
        }
        backups.sort();
        Ok(backups)
    }

    async fn backup_active(&self) -> Result<Option<PathBuf>, ProxyError> {
        let active = &self.layout.config_path;
        let content = match tokio::fs::read(active).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ProxyError::file(active, e)),
        };

        let dir = &self.layout.backup_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ProxyError::file(dir, e))?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}.{}.{:06}",
            self.file_name(),
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            sequence
        );
        let path = dir.join(name);
        write_atomic(&path, &content).await?;
        debug!(backup = %path.display(), "Active configuration backed up");

        self.prune_backups(&path).await;
        Ok(Some(path))
    }

    async fn prune_backups(&self, keep: &Path) {
        let backups = match self.backups().await {
            Ok(backups) => backups,
            Err(e) => {
                warn!(error = %e, "Failed to list configuration backups");
                return;
            }
        };

        let keep_count = self.layout.backups_to_keep.max(1);
        if backups.len() <= keep_count {
            return;
        }
        for old in &backups[..backups.len() - keep_count] {
            if old == keep {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(old).await {
                warn!(path = %old.display(), error = %e, "Failed to remove old backup");
            }
        }
    }

    fn lock_backup(&self) -> std::sync::MutexGuard<'_, Option<Option<PathBuf>>> {
        self.last_backup.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Write to a sibling temp file, sync, then rename over `path`
async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), ProxyError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::file(parent, e))?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| ProxyError::file(&temp_path, e))?;
    file.write_all(content)
        .await
        .map_err(|e| ProxyError::file(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| ProxyError::file(&temp_path, e))?;
    drop(file);

    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| ProxyError::file(path, e))
}

/// SHA-256 hex digest of a file's content
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
