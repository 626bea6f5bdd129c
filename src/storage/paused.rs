use anyhow::{Result, Context};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::crawler::task::{PausedTask, WebsiteId};

/// Paused task states, one JSON file per site
#[derive(Debug, Clone)]
pub struct PausedStore {
    dir: PathBuf,
}

impl PausedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, website_id: WebsiteId) -> PathBuf {
        self.dir.join(format!("{}.json", website_id))
    }

    /// Persist a paused task, replacing any earlier state of the same site
    pub async fn save(&self, task: &PausedTask) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context(format!("Failed to create paused directory: {}", self.dir.display()))?;

        let path = self.path(task.website_id);
        let staging = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(task)
            .context("Failed to serialize paused task")?;

        tokio::fs::write(&staging, contents)
            .await
            .context(format!("Failed to write paused task: {}", staging.display()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .context(format!("Failed to move paused task into place: {}", path.display()))?;

        debug!("Saved paused task {} to {}", task.website_id, path.display());

        Ok(path)
    }

    /// Load the paused state of a site, if any
    pub async fn load(&self, website_id: WebsiteId) -> Result<Option<PausedTask>> {
        let path = self.path(website_id);
        match tokio::fs::read(&path).await {
            Ok(contents) => {
                let task = serde_json::from_slice(&contents)
                    .context(format!("Failed to parse paused task: {}", path.display()))?;
                Ok(Some(task))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read paused task: {}", path.display())),
        }
    }

    /// All paused tasks, ordered by site
    pub async fn list(&self) -> Result<Vec<PausedTask>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context(format!("Failed to list {}", self.dir.display())),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .context(format!("Failed to stat {}", path.display()))?
                .is_file();
            if !is_file || !has_state_extension(&path) {
                continue;
            }
            let contents = tokio::fs::read(&path).await?;
            let task: PausedTask = serde_json::from_slice(&contents)
                .context(format!("Failed to parse paused task: {}", path.display()))?;
            tasks.push(task);
        }

        tasks.sort_by_key(|task| task.website_id);
        Ok(tasks)
    }

    /// Forget the paused state of a site
    pub async fn remove(&self, website_id: WebsiteId) -> Result<()> {
        match tokio::fs::remove_file(self.path(website_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove paused task"),
        }
    }
}

fn has_state_extension(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::TaskResult;
    use chrono::Utc;
    use url::Url;

    fn paused(website_id: WebsiteId) -> PausedTask {
        PausedTask {
            website_id,
            base_url: Url::parse("http://example.com/pub/").unwrap(),
            result: TaskResult::started(website_id),
            queue_path: PathBuf::from(format!("queue/{}", website_id)),
            record_path: PathBuf::from(format!("crawled/{}.json", website_id)),
            paused_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = PausedStore::new(dir.path().join("paused"));

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(3).await.unwrap().is_none());

        let third = paused(3);
        store.save(&third).await.unwrap();
        store.save(&paused(1)).await.unwrap();

        assert_eq!(store.load(3).await.unwrap(), Some(third));
        let ids: Vec<_> = store.list().await.unwrap().iter().map(|t| t.website_id).collect();
        assert_eq!(ids, vec![1, 3]);

        store.remove(3).await.unwrap();
        store.remove(3).await.unwrap();
        assert!(store.load(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("paused");
        let store = PausedStore::new(&root);
        store.save(&paused(4)).await.unwrap();

        std::fs::create_dir_all(root.join("nested.json")).unwrap();
        std::fs::write(root.join("notes.txt"), "not a task").unwrap();
        std::fs::write(root.join("4.json.tmp"), "{").unwrap();

        let ids: Vec<_> = store.list().await.unwrap().iter().map(|t| t.website_id).collect();
        assert_eq!(ids, vec![4]);
    }
}
