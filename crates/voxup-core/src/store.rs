//! Process-identity persistence
//!
//! One JSON record per managed unit under `<data>/units/`, so a later CLI
//! invocation (`stop`, `status`) can locate running processes without any
//! in-memory state. Writes go through a temp file and `rename` so a
//! concurrent reader never observes a torn record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SupervisorError;
use crate::unit::UnitStatus;

/// Persisted identity of one managed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    /// Pid of the live process, cleared on stop or crash detection
    pub pid: Option<u32>,
    pub status: UnitStatus,
    /// Command line the process was launched with, used as its
    /// process-table signature
    pub signature: Vec<String>,
    /// Last discovered public URL (tunnels only)
    pub public_url: Option<String>,
    /// URLs injected into the process environment at launch, keyed by env
    /// var (services only). URLs are bound at start time, never
    /// hot-reloaded, so this is what the running process actually sees.
    #[serde(default)]
    pub env_urls: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn new(name: &str, signature: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            pid: None,
            status: UnitStatus::Stopped,
            signature,
            public_url: None,
            env_urls: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Unit record store
pub struct UnitStore {
    base_dir: PathBuf,
}

impl UnitStore {
    /// Open (creating if needed) the record directory under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, SupervisorError> {
        let base_dir = data_dir.join("units");
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", name))
    }

    /// Validate unit name (alphanumeric, hyphens, underscores only)
    fn validate_name(name: &str) -> Result<(), SupervisorError> {
        if name.is_empty() {
            return Err(SupervisorError::ConfigValidation(
                "unit name cannot be empty".to_string(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SupervisorError::ConfigValidation(format!(
                "unit name '{}' must contain only alphanumeric characters, hyphens, and underscores",
                name
            )));
        }
        Ok(())
    }

    /// Persist a record atomically (write-new-then-rename).
    pub fn save(&self, record: &UnitRecord) -> Result<(), SupervisorError> {
        Self::validate_name(&record.name)?;

        let path = self.record_path(&record.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load a record by unit name, if one exists.
    pub fn load(&self, name: &str) -> Result<Option<UnitRecord>, SupervisorError> {
        Self::validate_name(name)?;

        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let record: UnitRecord = serde_json::from_str(&json)?;
        Ok(Some(record))
    }

    /// All records, sorted by name for stable output.
    pub fn list(&self) -> Result<Vec<UnitRecord>, SupervisorError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                let json = fs::read_to_string(&path)?;
                records.push(serde_json::from_str(&json)?);
            }
        }
        records.sort_by(|a: &UnitRecord, b: &UnitRecord| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Update a record's status and timestamp in place.
    pub fn set_status(&self, name: &str, status: UnitStatus) -> Result<(), SupervisorError> {
        if let Some(mut record) = self.load(name)? {
            record.status = status;
            record.updated_at = Utc::now();
            self.save(&record)?;
        }
        Ok(())
    }

    /// Drop the pid from a record after a stop or crash, keeping the last
    /// known URL for the next restart.
    pub fn clear_pid(&self, name: &str, status: UnitStatus) -> Result<(), SupervisorError> {
        if let Some(mut record) = self.load(name)? {
            record.pid = None;
            record.status = status;
            record.updated_at = Utc::now();
            self.save(&record)?;
        }
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), SupervisorError> {
        Self::validate_name(name)?;
        let path = self.record_path(name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (UnitStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = UnitStore::open(temp.path()).unwrap();
        (store, temp)
    }

    #[test]
    fn test_validate_name() {
        assert!(UnitStore::validate_name("voice-agent").is_ok());
        assert!(UnitStore::validate_name("twiml_2").is_ok());
        assert!(UnitStore::validate_name("").is_err());
        assert!(UnitStore::validate_name("../escape").is_err());
        assert!(UnitStore::validate_name("a/b").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut record = UnitRecord::new(
            "voice-agent",
            vec!["python3".to_string(), "main.py".to_string()],
        );
        record.pid = Some(4242);
        record.status = UnitStatus::Running;
        record.public_url = Some("wss://abc.ngrok.app".to_string());
        store.save(&record).unwrap();

        let loaded = store.load("voice-agent").unwrap().unwrap();
        assert_eq!(loaded.pid, Some(4242));
        assert_eq!(loaded.status, UnitStatus::Running);
        assert_eq!(loaded.public_url.as_deref(), Some("wss://abc.ngrok.app"));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let (store, _temp) = create_test_store();
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let (store, temp) = create_test_store();
        store
            .save(&UnitRecord::new("twiml", vec!["python3".to_string()]))
            .unwrap();

        let leftovers: Vec<_> = fs::read_dir(temp.path().join("units"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_clear_pid_keeps_url() {
        let (store, _temp) = create_test_store();

        let mut record = UnitRecord::new("twiml-tunnel", vec!["ngrok".to_string()]);
        record.pid = Some(100);
        record.status = UnitStatus::Running;
        record.public_url = Some("https://foo.ngrok.app".to_string());
        store.save(&record).unwrap();

        store.clear_pid("twiml-tunnel", UnitStatus::Failed).unwrap();

        let loaded = store.load("twiml-tunnel").unwrap().unwrap();
        assert_eq!(loaded.pid, None);
        assert_eq!(loaded.status, UnitStatus::Failed);
        assert_eq!(loaded.public_url.as_deref(), Some("https://foo.ngrok.app"));
    }

    #[test]
    fn test_list_sorted() {
        let (store, _temp) = create_test_store();
        store
            .save(&UnitRecord::new("twiml", vec!["b".to_string()]))
            .unwrap();
        store
            .save(&UnitRecord::new("voice-agent", vec!["a".to_string()]))
            .unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["twiml", "voice-agent"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (store, _temp) = create_test_store();
        store
            .save(&UnitRecord::new("twiml", vec!["x".to_string()]))
            .unwrap();

        store.remove("twiml").unwrap();
        store.remove("twiml").unwrap();
        assert!(store.load("twiml").unwrap().is_none());
    }
}
