//! File-backed task records: one `<task_store_root>/<task_id>.json` per task.
//!
//! The file is authoritative. Every mutation re-reads the record under its
//! lock, so tasks seeded by other processes are always picked up and two
//! writers never interleave on the same task.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fleet_common::fs::{read_json, write_json_atomic, RecordLock};
use fleet_common::task::Task;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("task '{0}' already exists")]
    AlreadyExists(String),
    #[error("task id '{0}' is not a valid record name")]
    InvalidId(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Io { .. } => "E_STORE_IO",
            StoreError::AlreadyExists(_) => "E_TASK_EXISTS",
            StoreError::InvalidId(_) => "E_INVALID_REQUEST",
        }
    }
}

pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| StoreError::io(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !task_id.is_empty()
            && !task_id.starts_with('.')
            && !task_id.contains(['/', '\\'])
            && task_id != "..";
        if !valid {
            return Err(StoreError::InvalidId(task_id.to_string()));
        }
        Ok(self.root.join(format!("{task_id}.json")))
    }

    pub fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let path = self.path_for(task_id)?;
        read_json(&path).map_err(|err| StoreError::io(&path, err))
    }

    /// Every readable task, sorted by id. Corrupt records are logged and
    /// skipped so one bad file cannot stall assignment.
    pub fn list(&self) -> Result<Vec<Task>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|err| StoreError::io(&self.root, err))?;
        let mut tasks = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Task>(&path) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), "Skipping unreadable task record: {}", err)
                }
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Insert a new record; fails if the id is taken.
    pub fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path_for(&task.id)?;
        let lock = RecordLock::acquire(&path).map_err(|err| StoreError::io(&path, err))?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(task.id.clone()));
        }
        lock.write_json(task).map_err(|err| StoreError::io(&path, err))
    }

    pub fn save(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path_for(&task.id)?;
        write_json_atomic(&path, task).map_err(|err| StoreError::io(&path, err))
    }

    /// Read-modify-write one task under its record lock. `Ok(None)` when the
    /// task does not exist; the closure's error aborts without writing.
    pub fn modify<T, E, F>(
        &self,
        task_id: &str,
        apply: F,
    ) -> Result<Option<Result<T, E>>, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<T, E>,
    {
        let path = self.path_for(task_id)?;
        let lock = RecordLock::acquire(&path).map_err(|err| StoreError::io(&path, err))?;
        let Some(mut task) = read_json::<Task>(&path).map_err(|err| StoreError::io(&path, err))?
        else {
            return Ok(None);
        };

        match apply(&mut task) {
            Ok(value) => {
                lock.write_json(&task).map_err(|err| StoreError::io(&path, err))?;
                Ok(Some(Ok(value)))
            }
            Err(err) => Ok(Some(Err(err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::task::TaskState;
    use tempfile::TempDir;

    #[test]
    fn insert_get_list() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.insert(&Task::queued("T2", "r", "second")).unwrap();
        store.insert(&Task::queued("T1", "r", "first")).unwrap();

        assert!(matches!(
            store.insert(&Task::queued("T1", "r", "dup")),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(store.get("T1").unwrap().unwrap().intent, "first");
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["T1", "T2"]);
    }

    #[test]
    fn list_skips_corrupt_records_and_side_files() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.insert(&Task::queued("T1", "r", "ok")).unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();

        let tasks = store.list().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(dir.path().join("T1.json.lock").exists());
    }

    #[test]
    fn modify_applies_or_aborts() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        store.insert(&Task::queued("T1", "r", "x")).unwrap();

        let applied: Option<Result<(), ()>> = store
            .modify("T1", |task| {
                task.priority = 5;
                Ok(())
            })
            .unwrap();
        assert!(matches!(applied, Some(Ok(()))));

        let aborted: Option<Result<(), &str>> = store
            .modify("T1", |task| {
                task.state = TaskState::Done;
                Err("nope")
            })
            .unwrap();
        assert!(matches!(aborted, Some(Err("nope"))));

        let task = store.get("T1").unwrap().unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.state, TaskState::Queued);

        let missing: Option<Result<(), ()>> = store.modify("T9", |_| Ok(())).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        assert!(matches!(store.get("../x"), Err(StoreError::InvalidId(_))));
    }
}
