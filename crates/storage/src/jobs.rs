use anyhow::{Context, Result};
use bytes::Bytes;
use codebus_core::models::Job;

use crate::{Bus, Metadata};

/// Persists job state as JSON documents, keyed by project, topic and id.
#[derive(Clone)]
pub struct JobStore {
    bus: Bus,
}

impl JobStore {
    pub fn new(bus: Bus) -> Self { Self { bus } }

    fn key(owner: &str, repo: &str, topic: &str, id: &str) -> String {
        format!("{owner}/{repo}/{topic}/{id}.json")
    }

    /// Save the job state. Transient jobs are never written.
    pub async fn save(&self, job: &Job) -> Result<()> {
        if job.transient {
            return Ok(());
        }
        let data = job.data();
        let key = Self::key(&data.owner, &data.repo, &job.topic, &job.id);
        let body = Bytes::from(serde_json::to_vec(job).context("Failed to serialize job")?);
        self.bus.put(&key, body, "application/json", &Metadata::new(), false).await?;
        tracing::debug!(key, phase = %job.state.phase, "Saved job state");
        Ok(())
    }

    pub async fn load(&self, owner: &str, repo: &str, topic: &str, id: &str) -> Result<Option<Job>> {
        let key = Self::key(owner, repo, topic, id);
        let Some(object) = self.bus.get(&key).await? else {
            return Ok(None);
        };
        let job = serde_json::from_slice(&object.body)
            .with_context(|| format!("Failed to parse job state {key}"))?;
        Ok(Some(job))
    }

    /// Flag a job as cancelled. Returns `false` if the job does not exist.
    pub async fn cancel(&self, owner: &str, repo: &str, topic: &str, id: &str) -> Result<bool> {
        let Some(mut job) = self.load(owner, repo, topic, id).await? else {
            return Ok(false);
        };
        job.state.cancelled = true;
        self.save(&job).await?;
        tracing::info!(owner, repo, topic, id, "Cancelled job");
        Ok(true)
    }

    pub async fn is_cancelled(&self, job: &Job) -> Result<bool> {
        if job.transient {
            return Ok(job.state.cancelled);
        }
        let data = job.data();
        Ok(self
            .load(&data.owner, &data.repo, &job.topic, &job.id)
            .await?
            .is_some_and(|stored| stored.state.cancelled))
    }

    /// Ids of all stored jobs of a topic.
    pub async fn list(&self, owner: &str, repo: &str, topic: &str) -> Result<Vec<String>> {
        let entries = self.bus.list(&format!("{owner}/{repo}/{topic}/")).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| e.path.strip_suffix(".json").map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use codebus_core::models::{EventKind, JobData, Phase};

    use super::*;

    fn job(id: &str) -> Job {
        Job::new(id.to_string(), JobData::new(EventKind::Push, "owner", "repo", "main"))
    }

    #[tokio::test]
    async fn test_save_load_cancel() {
        let store = JobStore::new(Bus::memory());
        let mut job = job("job-1");
        job.state.phase = Phase::Sync;
        store.save(&job).await.unwrap();

        let loaded = store.load("owner", "repo", "code", "job-1").await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(!store.is_cancelled(&job).await.unwrap());

        assert!(store.cancel("owner", "repo", "code", "job-1").await.unwrap());
        assert!(store.is_cancelled(&job).await.unwrap());
        assert!(!store.cancel("owner", "repo", "code", "missing").await.unwrap());
        assert_eq!(store.list("owner", "repo", "code").await.unwrap(), vec!["job-1"]);
    }

    #[tokio::test]
    async fn test_transient_not_saved() {
        let store = JobStore::new(Bus::memory());
        let mut job = job("job-2");
        job.transient = true;
        store.save(&job).await.unwrap();
        assert!(store.load("owner", "repo", "code", "job-2").await.unwrap().is_none());
    }
}
