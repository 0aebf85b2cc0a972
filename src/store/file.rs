use crate::error::CheckpointError;
use crate::record::{CheckpointRecord, SequenceNumber};
use crate::store::{ensure_advances, CheckpointStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

/// Checkpoint store backed by one JSON file per shard in a local directory.
///
/// A save writes a temporary file, syncs it, renames it over the previous
/// checkpoint and syncs the directory, so a checkpoint that was acknowledged
/// survives a crash of the process or the host.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Opened file checkpoint store");
        Ok(Self {
            dir,
            locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_for(&self, shard_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(shard_id.to_string()).or_default())
    }

    fn path_for(&self, shard_id: &str) -> PathBuf {
        let file_name: String = shard_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.checkpoint.json", file_name))
    }
}

fn read_checkpoint(path: &Path) -> Result<Option<CheckpointRecord>, CheckpointError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn write_checkpoint(path: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
    let tmp_path = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(record)?;

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    sync_dir(path)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), CheckpointError> {
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, CheckpointError>
where
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointError::StoreUnavailable(format!("checkpoint I/O task failed: {}", e)))?
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn get_checkpoint(
        &self,
        shard_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(shard_id);
        let lock = self.lock_for(shard_id);
        let _guard = lock.lock().await;

        let checkpoint = blocking(move || read_checkpoint(&path)).await?;

        debug!(
            shard_id = %shard_id,
            checkpoint = ?checkpoint.as_ref().map(|cp| cp.sequence_number.as_str()),
            "Retrieved checkpoint from file"
        );
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn save_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &SequenceNumber,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.path_for(shard_id);
        let lock = self.lock_for(shard_id);
        let _guard = lock.lock().await;

        let record = CheckpointRecord::new(shard_id, sequence_number.clone());
        let to_write = record.clone();
        let shard = shard_id.to_string();

        blocking(move || {
            let current = read_checkpoint(&path)?;
            ensure_advances(&shard, current.as_ref(), &to_write.sequence_number)?;
            write_checkpoint(&path, &to_write)
        })
        .await?;

        trace!(
            shard_id = %shard_id,
            sequence_number = %sequence_number,
            "Checkpoint synced to disk"
        );
        Ok(record)
    }
}
