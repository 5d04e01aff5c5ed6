use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::devops::WorkItem;

/// The on-disk snapshot of the most recently fetched work items.
///
/// `getazzureIssuesid` is the only writer and `get-issues-by-state` the only
/// reader.  There is no locking: the server assumes one interactive session
/// at a time, so an overlapping fetch and read simply observes the last
/// completed write.
#[derive(Debug, Clone)]
pub struct IssueStore {
    path: PathBuf,
}

impl IssueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the snapshot with `items` as a pretty-printed JSON array.
    pub async fn save(&self, items: &[WorkItem]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(items).context("Failed to serialise work items")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        tracing::info!(path = %self.path.display(), count = items.len(), "Saved issue snapshot");
        Ok(())
    }

    /// Read the snapshot back.  A missing or malformed file is an error.
    pub async fn load(&self) -> Result<Vec<WorkItem>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(id: i64, state: &str) -> WorkItem {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        WorkItem {
            id,
            title: format!("Issue {id}"),
            state: state.into(),
            assigned_to: None,
            created_date: at,
            changed_date: at,
            tags: String::new(),
        }
    }

    #[tokio::test]
    async fn save_creates_directories_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = IssueStore::new(dir.path().join("data/azzureissues.json"));

        let items = vec![item(1, "To Do"), item(2, "Done")];
        store.save(&items).await.unwrap();

        assert_eq!(store.load().await.unwrap(), items);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"assignedTo\": null"), "snapshot uses camelCase keys: {raw}");
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = IssueStore::new(dir.path().join("issues.json"));

        store.save(&[item(1, "To Do"), item(2, "Doing")]).await.unwrap();
        store.save(&[item(3, "Done")]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 3);
    }

    #[tokio::test]
    async fn load_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = IssueStore::new(dir.path().join("absent.json"));
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to read"));

        std::fs::write(store.path(), "[{\"id\":").unwrap();
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
    }
}
