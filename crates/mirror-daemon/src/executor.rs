//! Local filesystem operations.
//!
//! Every operation is idempotent and safe to re-run: `ensure_file` and
//! `ensure_dir` bring an entry into the desired state and download only
//! when content actually differs. Downloads are atomic — bytes stream into
//! a temp file beside the target and the rename happens within one
//! directory, so readers never observe a partial file.

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use mirror_core::ByteReader;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Executes filesystem mutations for the mirror. Stateless; all paths are
/// absolute or rooted at the caller's sync directory.
#[derive(Debug, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Bring the entry at `path` up to date with the remote file.
    ///
    /// Decision order: missing entry downloads; a directory in the way is
    /// removed and downloads; an equal modtime is trusted as up to date; a
    /// matching hash only reconciles the modtime; anything else downloads.
    pub async fn ensure_file<F, Fut>(
        &self,
        path: &Path,
        modtime: SystemTime,
        hash: &str,
        open_reader: F,
    ) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ByteReader>>,
    {
        match fs::metadata(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e).context(format!("stat {}", path.display())),
            Ok(meta) => {
                if meta.is_dir() {
                    info!(path = %path.display(), "removing directory to download file");
                    self.remove_path(path).await?;
                } else {
                    let disk_modtime = meta
                        .modified()
                        .context(format!("read modtime of {}", path.display()))?;
                    if disk_modtime == modtime {
                        return Ok(());
                    }
                    if self.calculate_hash(path).await? == hash {
                        return self.chtimes(path, modtime).await;
                    }
                }
            }
        }

        info!(path = %path.display(), "downloading file");
        let reader = open_reader().await.context("open download reader")?;
        self.download_to_path(path, modtime, reader).await
    }

    /// Make `path` a directory, removing a file in the way if needed.
    pub async fn ensure_dir(&self, path: &Path) -> Result<()> {
        match fs::metadata(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "creating directory");
                self.mkdir_all(path).await
            }
            Err(e) => Err(e).context(format!("stat {}", path.display())),
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => {
                info!(path = %path.display(), "replacing file with directory");
                self.remove_path(path).await?;
                self.mkdir_all(path).await
            }
        }
    }

    /// Stream `reader` into a temp file next to `target`, then rename it
    /// over the target and set the modtime. The temp file is removed on
    /// every failure path.
    async fn download_to_path(
        &self,
        target: &Path,
        modtime: SystemTime,
        mut reader: ByteReader,
    ) -> Result<()> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.mkdir_all(dir).await?;

        // Dropping the handle without persisting removes the temp file.
        let temp = tempfile::Builder::new()
            .prefix(&format!("{file_name}-download-"))
            .suffix(".tmp")
            .tempfile_in(dir)
            .context("create temp file")?;

        let mut out = fs::OpenOptions::new()
            .write(true)
            .open(temp.path())
            .await
            .context("open temp file")?;
        tokio::io::copy(&mut reader, &mut out)
            .await
            .context("download file")?;
        out.flush().await.context("flush temp file")?;
        drop(out);

        // Same-directory rename keeps the replace atomic.
        temp.persist(target)
            .map_err(|e| e.error)
            .context(format!("rename temp file onto {}", target.display()))?;
        self.chtimes(target, modtime).await
    }

    /// Lowercase-hex SHA-256 of the file's content, streamed.
    pub async fn calculate_hash(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path)
            .await
            .context(format!("open {} for hashing", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await.context("read file for hashing")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Set access and modification time.
    pub async fn chtimes(&self, path: &Path, modtime: SystemTime) -> Result<()> {
        let ft = FileTime::from_system_time(modtime);
        filetime::set_file_times(path, ft, ft)
            .context(format!("set modtime of {}", path.display()))
    }

    pub async fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        fs::rename(old, new)
            .await
            .context(format!("rename {} to {}", old.display(), new.display()))
    }

    pub async fn mkdir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .context(format!("create directory {}", path.display()))
    }

    /// Remove a file or directory tree. A missing entry counts as success.
    pub async fn remove_path(&self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(format!("stat {}", path.display())),
            Ok(meta) => meta,
        };
        let result = if meta.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove path");
                Err(e).context(format!("remove {}", path.display()))
            }
        }
    }
}
