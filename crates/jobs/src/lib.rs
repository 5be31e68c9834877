pub mod collect;
pub mod effects;
pub mod error;
pub mod fstab;
pub mod job;
pub mod postprocess;
pub mod retry;
pub mod runner;
pub mod sync;
pub mod tree;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use codebus_core::{config::SyncConfig, models::JobData, util::code_prefix};
use codebus_github::{CodeSource, RepoRef};
use codebus_storage::{Bus, jobs::JobStore};

pub use crate::{effects::Downstream, error::JobError, runner::JobRunner};

/// Shared context available to every phase of a job.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<SyncConfig>,
    pub source: Arc<dyn CodeSource>,
    pub code_bus: Bus,
    pub content_bus: Bus,
    /// Absent for transient jobs.
    pub jobs: Option<JobStore>,
    pub downstream: Arc<dyn Downstream>,
}

/// Repository the code of a project is fetched from.
pub fn code_repo(data: &JobData) -> RepoRef { RepoRef::new(&data.code_owner, &data.code_repo) }

/// Code-bus prefix of the branch a job synchronizes, with a trailing slash.
pub fn branch_prefix(data: &JobData) -> String {
    code_prefix(&data.code_owner, &data.code_repo, &data.ref_name)
}
