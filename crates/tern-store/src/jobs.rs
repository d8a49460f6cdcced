//! On-disk mirror of job records so another process can inspect them.
//!
//! Each job is stored as `<jobs_dir>/<id>.json` (replaced atomically on
//! every status change) with its output lines in `<id>.log`.

use std::fs;
use std::io;
use std::path::PathBuf;

use uuid::Uuid;

use crate::atomic::{append_line, remove_if_exists, write_atomic};
use crate::config::StoreConfig;
use crate::models::JobRecord;
use crate::StoreError;

#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            dir: config.jobs_dir(),
        }
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn log_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }

    pub fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        let path = self.record_path(record.id);
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Serialize {
            what: "job record",
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))
    }

    pub fn get(&self, id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    /// All readable job records, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<JobRecord>(&b).map_err(|e| e.to_string()))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn append_log(&self, id: Uuid, line: &str) -> Result<(), StoreError> {
        let path = self.log_path(id);
        append_line(&path, line).map_err(|e| StoreError::io(&path, e))
    }

    pub fn read_log(&self, id: Uuid) -> Result<Vec<String>, StoreError> {
        let path = self.log_path(id);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents.lines().map(str::to_owned).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        for path in [self.record_path(id), self.log_path(id)] {
            remove_if_exists(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    /// Remove every record in a terminal status. Returns how many were removed.
    pub fn clear_finished(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for record in self.list()? {
            if record.status.is_terminal() {
                self.remove(record.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
