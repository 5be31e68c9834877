use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use codebus_core::{
    config::{Config, SyncConfig},
    models::{Job, JobData},
};
use codebus_github::{CodeSource, GitHub};
use codebus_storage::{Bus, jobs::JobStore};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::{
    JobContext,
    collect::CollectStrategy,
    effects::{Downstream, HttpDownstream},
    error::JobError,
    job,
    retry::run_with_retry,
};

/// Opens an authenticated source-control session for a job.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn source(&self, installation_id: Option<u64>) -> Result<Arc<dyn CodeSource>>;
}

#[async_trait]
impl SessionProvider for GitHub {
    async fn source(&self, installation_id: Option<u64>) -> Result<Arc<dyn CodeSource>> {
        Ok(Arc::new(self.session(installation_id).await?))
    }
}

/// Accepts code events, persists them as jobs and runs them in the background.
///
/// Jobs for the same branch are serialized through an in-process lock.
pub struct JobRunner {
    sessions: Arc<dyn SessionProvider>,
    config: Arc<SyncConfig>,
    code_bus: Bus,
    content_bus: Bus,
    jobs: JobStore,
    downstream: Arc<dyn Downstream>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobRunner {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        config: SyncConfig,
        code_bus: Bus,
        content_bus: Bus,
        jobs: JobStore,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        Self {
            sessions,
            config: Arc::new(config),
            code_bus,
            content_bus,
            jobs,
            downstream,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(github: Arc<GitHub>, config: &Config) -> Result<Self> {
        Ok(Self::new(
            github,
            config.sync.clone(),
            Bus::from_config(&config.storage.code_bus)?,
            Bus::from_config(&config.storage.content_bus)?,
            JobStore::new(Bus::from_config(&config.storage.jobs)?),
            Arc::new(HttpDownstream::new(config.downstream.clone())?),
        ))
    }

    pub fn jobs(&self) -> &JobStore { &self.jobs }

    /// Validate an event, persist it as a new job and start running it.
    pub async fn submit(self: &Arc<Self>, mut data: JobData) -> Result<Job, JobError> {
        data.normalize();
        CollectStrategy::select(&data, &self.config.default_branch)?;
        let job = Job::new(new_job_id(), data);
        self.jobs.save(&job).await?;
        tracing::info!(
            "Submitted job {} for {}/{}/{}",
            job.id,
            job.data().owner,
            job.data().repo,
            job.data().ref_name
        );
        self.spawn(job.clone());
        Ok(job)
    }

    /// Re-invoke a persisted job. Returns `None` if the job does not exist.
    pub async fn resume(
        self: &Arc<Self>,
        owner: &str,
        repo: &str,
        id: &str,
    ) -> Result<Option<Job>, JobError> {
        let Some(job) = self.jobs.load(owner, repo, Job::CODE_TOPIC, id).await? else {
            return Ok(None);
        };
        if job.is_completed() {
            return Err(JobError::fatal(format!("job {id} is already completed")));
        }
        job::check_resume(&job)?;
        self.spawn(job.clone());
        Ok(Some(job))
    }

    fn spawn(self: &Arc<Self>, job: Job) {
        let runner = self.clone();
        tokio::spawn(async move {
            // Outcome is logged by `execute`.
            let _ = runner.execute(job).await;
        });
    }

    /// Run a job to completion while holding the lock of its branch.
    pub async fn execute(&self, mut job: Job) -> Result<Job, JobError> {
        let data = job.data();
        let key = format!("{}/{}/{}", data.owner, data.repo, data.ref_name);
        let span = tracing::info_span!(
            "job",
            topic = %job.topic,
            id = %job.id,
            owner = %data.owner,
            repo = %data.repo,
            git_ref = %data.ref_name
        );
        async move {
            let result = {
                let _guard = self.branch_lock(&key).await.lock_owned().await;
                match self.context(&job).await {
                    Ok(ctx) => run_with_retry(&mut job, &ctx).await,
                    Err(e) => Err(e),
                }
            };
            self.release_locks().await;
            match &result {
                Ok(()) if job.is_completed() => {
                    tracing::info!(progress = ?job.state.progress, "Job completed")
                }
                Ok(()) => tracing::info!(phase = %job.state.phase, "Job stopped"),
                Err(e @ JobError::RateLimited { .. }) => {
                    tracing::warn!(phase = %job.state.phase, "Job left for a later resume: {e}")
                }
                Err(e) => tracing::error!(phase = %job.state.phase, "Job failed: {e:#}"),
            }
            result.map(|()| job)
        }
        .instrument(span)
        .await
    }

    async fn context(&self, job: &Job) -> Result<JobContext, JobError> {
        let source = self.sessions.source(job.data().installation_id).await?;
        Ok(JobContext {
            config: self.config.clone(),
            source,
            code_bus: self.code_bus.clone(),
            content_bus: self.content_bus.clone(),
            jobs: Some(self.jobs.clone()),
            downstream: self.downstream.clone(),
        })
    }

    async fn branch_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(key.to_string()).or_default().clone()
    }

    /// Drop locks no job holds or waits for.
    async fn release_locks(&self) {
        self.locks.lock().await.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

fn new_job_id() -> String {
    let now = OffsetDateTime::now_utc();
    format!("{}-{:08x}", now.unix_timestamp(), rand::random::<u32>())
}
