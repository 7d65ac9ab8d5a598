use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llm_flow_core::async_task::AsyncStepState;
use llm_flow_core::instance::{InstanceStatus, WorkflowInstance};
use llm_flow_core::store::{
    AsyncStateStore, AsyncStateStoreRef, InstanceStore, InstanceStoreRef, Result, StoreError,
    SuspensionStore, SuspensionStoreRef,
};
use llm_flow_core::suspend::Suspension;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// One-JSON-document-per-key directory.
struct DocumentDir {
    root: PathBuf,
}

impl DocumentDir {
    fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Keys become file names; anything outside `[A-Za-z0-9._-]` is
    /// percent-encoded so session ids with odd characters stay safe.
    fn encode_key(key: &str) -> String {
        let mut encoded = String::with_capacity(key.len());
        for byte in key.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                    encoded.push(byte as char)
                }
                other => encoded.push_str(&format!("%{:02X}", other)),
            }
        }
        encoded
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::encode_key(key)))
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads every document, skipping (and logging) ones that fail to
    /// parse.
    fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            match serde_json::from_str::<T>(&content) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable state document"
                    );
                }
            }
        }
        Ok(records)
    }

    fn remove_path(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

/// File-backed [`InstanceStore`].
pub struct FileInstanceStore {
    dir: DocumentDir,
}

impl FileInstanceStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: DocumentDir::open(root)?,
        })
    }
}

#[async_trait]
impl InstanceStore for FileInstanceStore {
    async fn get(&self, instance_id: &str) -> Result<Option<WorkflowInstance>> {
        self.dir.read(instance_id)
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        if let Some(existing) = self.dir.read::<WorkflowInstance>(&instance.instance_id)? {
            if existing.revision >= instance.revision {
                return Err(StoreError::RevisionConflict {
                    key: instance.instance_id.clone(),
                    stored: existing.revision,
                    incoming: instance.revision,
                });
            }
        }
        self.dir.write(&instance.instance_id, instance)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        self.dir.remove(instance_id)
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>> {
        let mut instances: Vec<WorkflowInstance> = self.dir.read_all()?;
        instances.retain(|instance| instance.status == status);
        Ok(instances)
    }
}

/// File-backed [`AsyncStateStore`].
pub struct FileAsyncStateStore {
    dir: DocumentDir,
}

impl FileAsyncStateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: DocumentDir::open(root)?,
        })
    }
}

#[async_trait]
impl AsyncStateStore for FileAsyncStateStore {
    async fn save(&self, state: &AsyncStepState) -> Result<()> {
        self.dir.write(&state.message_id, state)
    }

    async fn get(&self, message_id: &str) -> Result<Option<AsyncStepState>> {
        self.dir.read(message_id)
    }

    async fn delete(&self, message_id: &str) -> Result<bool> {
        self.dir.remove(message_id)
    }

    async fn update_progress(
        &self,
        message_id: &str,
        percent: u8,
        message: Option<String>,
    ) -> Result<()> {
        let mut state: AsyncStepState = self.dir.read(message_id)?.ok_or_else(|| {
            StoreError::Backend(format!("no async state for message `{}`", message_id))
        })?;
        state.progress_percent = percent;
        if message.is_some() {
            state.status_message = message;
        }
        self.dir.write(message_id, &state)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0;
        for state in self.dir.read_all::<AsyncStepState>()? {
            if state.retention_timestamp() < cutoff {
                let path = self.dir.path_for(&state.message_id);
                self.dir.remove_path(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// File-backed [`SuspensionStore`].
pub struct FileSuspensionStore {
    dir: DocumentDir,
}

impl FileSuspensionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: DocumentDir::open(root)?,
        })
    }
}

#[async_trait]
impl SuspensionStore for FileSuspensionStore {
    async fn save(&self, suspension: &Suspension) -> Result<()> {
        self.dir.write(&suspension.instance_id, suspension)
    }

    async fn get(&self, instance_id: &str) -> Result<Option<Suspension>> {
        self.dir.read(instance_id)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        self.dir.remove(instance_id)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0;
        for suspension in self.dir.read_all::<Suspension>()? {
            if suspension.created_at < cutoff {
                let path = self.dir.path_for(&suspension.instance_id);
                self.dir.remove_path(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// The three file stores rooted under one state directory.
pub struct FileStores {
    pub instances: InstanceStoreRef,
    pub async_states: AsyncStateStoreRef,
    pub suspensions: SuspensionStoreRef,
}

impl FileStores {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        Ok(Self {
            instances: Arc::new(FileInstanceStore::open(root.join("instances"))?),
            async_states: Arc::new(FileAsyncStateStore::open(root.join("async_state"))?),
            suspensions: Arc::new(FileSuspensionStore::open(root.join("suspensions"))?),
        })
    }
}
