use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ragline_core::{
    Checkpoint, CheckpointMetadata, CheckpointStore, FailureMark, StoreError, WriteDecision,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Checkpoints as one JSON file per step under `<base>/runs/<run>/`, a pointer
/// file per conversation under `<base>/conversations/` and failure marks under
/// `<base>/failures/`.
///
/// Files are written to a temporary name, synced, renamed into place and the
/// directory synced, so a crash never leaves a partially written step behind.
#[derive(Debug)]
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Keeps readable characters and appends a stable hash so distinct ids never share a path.
    fn path_key(id: &str) -> String {
        let mut readable = String::with_capacity(id.len());
        for ch in id.chars() {
            match ch {
                c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => readable.push(c),
                _ => readable.push('_'),
            }
        }
        readable.truncate(64);
        format!("{readable}-{:016x}", fnv1a(id.as_bytes()))
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join("runs").join(Self::path_key(run_id))
    }

    fn step_path(&self, run_id: &str, step: u64) -> PathBuf {
        self.run_dir(run_id).join(format!("{step:020}.json"))
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.base_dir
            .join("conversations")
            .join(format!("{}.json", Self::path_key(conversation_id)))
    }

    fn failure_path(&self, run_id: &str) -> PathBuf {
        self.base_dir
            .join("failures")
            .join(format!("{}.json", Self::path_key(run_id)))
    }

    async fn steps(&self, run_id: &str) -> Result<Vec<u64>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.run_dir(run_id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(err)),
        };
        let mut steps = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            steps.push(step);
        }
        steps.sort_unstable();
        Ok(steps)
    }

    async fn read_step(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        match tokio::fs::read(self.step_path(run_id, step)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err)),
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.read_step(&checkpoint.run_id, checkpoint.step).await?;
        let latest = self.steps(&checkpoint.run_id).await?.last().copied();
        if WriteDecision::check(checkpoint, existing.as_ref(), latest)?
            == WriteDecision::AlreadyCommitted
        {
            return Ok(());
        }

        let path = self.step_path(&checkpoint.run_id, checkpoint.step);
        write_atomic(&path, &serde_json::to_vec(checkpoint)?).await?;
        if checkpoint.step == 1 {
            write_atomic(
                &self.conversation_path(&checkpoint.conversation_id),
                checkpoint.run_id.as_bytes(),
            )
            .await?;
        }
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        match self.steps(run_id).await?.last() {
            Some(step) => self.read_step(run_id, *step).await,
            None => Ok(None),
        }
    }

    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        self.read_step(run_id, step).await
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        match tokio::fs::read_to_string(self.conversation_path(conversation_id)).await {
            Ok(run_id) => self.load_latest(run_id.trim()).await,
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err)),
        }
    }

    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        let mut history = Vec::new();
        for step in self.steps(run_id).await? {
            if let Some(checkpoint) = self.read_step(run_id, step).await? {
                history.push(checkpoint.metadata());
            }
        }
        Ok(history)
    }

    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_atomic(&self.failure_path(&mark.run_id), &serde_json::to_vec(mark)?).await
    }

    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        match tokio::fs::read(self.failure_path(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(err)),
        }
    }

    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.failure_path(run_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => sync_parent(&path).await,
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(err)),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error)?;
    file.write_all(bytes).await.map_err(io_error)?;
    file.sync_all().await.map_err(io_error)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(io_error)?;
    sync_parent(path).await
}

/// Makes a rename or removal inside the parent directory durable.
#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let dir = tokio::fs::File::open(parent).await.map_err(io_error)?;
    dir.sync_all().await.map_err(io_error)
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn io_error(err: std::io::Error) -> StoreError {
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidData => StoreError::Backend(err.to_string()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
