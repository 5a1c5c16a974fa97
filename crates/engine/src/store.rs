//! Durable task records, one JSON file per task.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cloudxfer_protocol::TransferTask;

use crate::EngineError;

/// Stores [`TransferTask`] records under `{state_dir}/tasks/{id}.json`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("tasks"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes the record for `task`, replacing any previous one.
    pub async fn save(&self, task: &TransferTask) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(task)?;
        let path = self.record_path(&task.id);
        let tmp = self.dir.join(format!("{}.json.tmp", task.id));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(task = %task.id, status = %task.status, "task record saved");
        Ok(())
    }

    /// Loads one record. A missing record is `Ok(None)`.
    pub async fn load(&self, id: &str) -> Result<Option<TransferTask>, EngineError> {
        match tokio::fs::read(self.record_path(id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads every readable record. Unparsable files are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<TransferTask>, EngineError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable task record skipped");
                    continue;
                }
            };
            match serde_json::from_slice::<TransferTask>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt task record skipped");
                }
            }
        }
        debug!(count = tasks.len(), dir = %self.dir.display(), "task records loaded");
        Ok(tasks)
    }

    /// Deletes the record for `id`. Deleting a missing record is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudxfer_protocol::{PartResult, TaskStatus, TransferDirection};
    use tempfile::TempDir;

    fn task() -> TransferTask {
        TransferTask::new(
            TransferDirection::Download,
            PathBuf::from("/tmp/out.bin"),
            "bucket",
            "a/b.bin",
            300,
            100,
            2,
        )
    }

    #[tokio::test]
    async fn save_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());

        let mut t = task();
        t.parts.push(PartResult {
            part_number: 1,
            tag: "abc".into(),
            length: 100,
            succeeded: true,
            degraded: false,
        });
        store.save(&t).await.unwrap();
        assert_eq!(store.load(&t.id).await.unwrap(), Some(t.clone()));

        t.set_status(TaskStatus::Paused);
        store.save(&t).await.unwrap();
        let loaded = store.load(&t.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Paused);

        store.delete(&t.id).await.unwrap();
        assert!(store.load(&t.id).await.unwrap().is_none());
        store.delete(&t.id).await.unwrap();
    }

    #[tokio::test]
    async fn load_all_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        assert!(store.load_all().await.unwrap().is_empty());

        let a = task();
        let b = task();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        std::fs::write(store.dir().join("broken.json"), b"{not json").unwrap();
        std::fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();

        let mut ids: Vec<String> = store
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let t = task();
        store.save(&t).await.unwrap();
        let names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", t.id)]);
    }
}
