//! Durable claim metadata
//!
//! Holds only what cannot be reconstructed from the provider and gateway:
//! display name, instructions, invite URL, conversation id, claim timestamps,
//! and the golden checkpoint id. One JSON document per instance id under a
//! data directory. Rows are written only on successful claim and deleted on
//! recycle, destroy, or dismiss. Status is never stored; it is derived.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable record of a successful claim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Instance id, primary key
    pub id: String,
    /// Provider service id backing the instance
    pub service_id: String,
    /// Display name of the claimed agent
    pub agent_name: String,
    /// Conversation id; absent while a join waits for acceptance
    pub conversation_id: Option<String>,
    /// Invite URL handed back to the claimer
    pub invite_url: Option<String>,
    /// Instructions text written into the instance workspace
    pub instructions: String,
    /// Golden checkpoint id, when the provider supports checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// When the instance was provisioned
    pub created_at: DateTime<Utc>,
    /// When the claim completed
    pub claimed_at: DateTime<Utc>,
}

/// Metadata storage keyed by instance id
pub struct MetadataStore {
    base_dir: PathBuf,
}

impl MetadataStore {
    /// Create a new store rooted at the given directory
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Write a record, replacing any previous one for the same instance
    pub fn save(&self, record: &MetadataRecord) -> std::io::Result<()> {
        let path = self.record_path(&record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load the record for an instance, if one exists
    pub fn load(&self, instance_id: &str) -> std::io::Result<Option<MetadataRecord>> {
        let path = self.record_path(instance_id);
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load every record in the store
    ///
    /// Unreadable documents are skipped with a warning rather than failing
    /// the whole scan.
    pub fn load_all(&self) -> std::io::Result<Vec<MetadataRecord>> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()))
                {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable metadata document");
                    }
                }
            }
        }
        Ok(records)
    }

    /// Load all records, indexed by provider service id
    pub fn index_by_service(&self) -> std::io::Result<HashMap<String, MetadataRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .map(|r| (r.service_id.clone(), r))
            .collect())
    }

    /// Delete the record for an instance; deleting a missing record is Ok
    pub fn delete(&self, instance_id: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.record_path(instance_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn record_path(&self, instance_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, service_id: &str) -> MetadataRecord {
        MetadataRecord {
            id: id.to_string(),
            service_id: service_id.to_string(),
            agent_name: "tokyo".to_string(),
            conversation_id: Some("conv-1".to_string()),
            invite_url: Some("https://convos.test/i=xyz".to_string()),
            instructions: "plan trips".to_string(),
            checkpoint_id: Some("cp-1".to_string()),
            created_at: Utc::now(),
            claimed_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();

        store.save(&record("ab12", "svc-A")).unwrap();
        let loaded = store.load("ab12").unwrap().unwrap();
        assert_eq!(loaded.service_id, "svc-A");
        assert_eq!(loaded.agent_name, "tokyo");
        assert_eq!(loaded.conversation_id.as_deref(), Some("conv-1"));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();

        store.save(&record("ab12", "svc-A")).unwrap();
        store.delete("ab12").unwrap();
        store.delete("ab12").unwrap();
        assert!(store.load("ab12").unwrap().is_none());
    }

    #[test]
    fn test_index_by_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path()).unwrap();

        store.save(&record("ab12", "svc-A")).unwrap();
        store.save(&record("cd34", "svc-B")).unwrap();

        let index = store.index_by_service().unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("svc-A").map(|r| r.id.as_str()), Some("ab12"));
        assert_eq!(index.get("svc-B").map(|r| r.id.as_str()), Some("cd34"));
    }
}
