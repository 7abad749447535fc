//! Persistence of per-VM configuration records.
//!
//! Each VM's record lives at `<base_dir>/<name>.json`, a sibling of the VM
//! directory `<base_dir>/<name>/`. The record file is the source of truth
//! for whether a VM exists; the directory may lag behind it during a
//! partially-failed destroy.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::vm::VmRecord;

pub struct RecordStore {
    base_dir: PathBuf,
}

impl RecordStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Persist a record, creating the base directory if needed. Concurrent
    /// writers for the same name race at the filesystem level; no lock is
    /// held across read-modify-write cycles.
    pub async fn save(&self, record: &VmRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| SandboxError::operation_failed("create config directory", e))?;

        let data = serde_json::to_vec_pretty(record)
            .map_err(|e| SandboxError::operation_failed("serialize VM config", e))?;
        let path = self.record_path(&record.name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| SandboxError::operation_failed("write VM config", e))?;
        debug!(vm = %record.name, path = %path.display(), "VM config persisted");
        Ok(())
    }

    pub async fn load(&self, name: &str) -> Result<VmRecord> {
        let path = self.record_path(name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::not_found("VM config", name));
            }
            Err(e) => return Err(SandboxError::operation_failed("read VM config", e)),
        };
        serde_json::from_slice(&data).map_err(|e| {
            SandboxError::parse("VM config", format!("{}: {}", path.display(), e))
        })
    }

    /// Remove a record. Removing an absent record is not an error.
    pub async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.record_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::operation_failed("remove VM config", e)),
        }
    }

    /// Names of all persisted records, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(SandboxError::operation_failed("list VM configs", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::operation_failed("list VM configs", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMethod;

    fn record(name: &str) -> VmRecord {
        VmRecord {
            name: name.to_string(),
            box_image: "ubuntu/focal64".into(),
            cpus: 2,
            memory_mb: 2048,
            project_path: PathBuf::from("/srv/project"),
            sync_method: SyncMethod::Rsync,
            host_path: None,
            guest_path: None,
            exclude_patterns: vec![".git".into()],
            ports: Vec::new(),
            environment: Vec::new(),
            provisioners: Vec::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());

        store.save(&record("alpha")).await.unwrap();
        let loaded = store.load("alpha").await.unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.box_image, "ubuntu/focal64");
        assert_eq!(loaded.sync_method, SyncMethod::Rsync);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let err = store.load("ghost").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
    }

    #[tokio::test]
    async fn exists_tracks_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        assert!(!store.exists("alpha"));
        store.save(&record("alpha")).await.unwrap();
        assert!(store.exists("alpha"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&record("alpha")).await.unwrap();
        store.remove("alpha").await.unwrap();
        assert!(!store.exists("alpha"));
        // Second remove of the same name succeeds.
        store.remove("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_sorted_names_ignoring_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&record("beta")).await.unwrap();
        store.save(&record("alpha")).await.unwrap();
        // A VM directory and a stray file must not show up.
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn list_on_missing_base_dir_is_empty() {
        let store = RecordStore::new("/nonexistent/devsandbox-test-base");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        std::fs::write(store.record_path("bad"), b"{not json").unwrap();
        let err = store.load("bad").await.unwrap_err();
        assert!(matches!(err, SandboxError::Parse { .. }));
    }
}
