use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use codebus_core::{
    AppError,
    models::{Change, EventKind, JobData},
};
use codebus_jobs::JobRunner;
use serde::Deserialize;

use crate::handlers::job_error;

/// Optional overrides of a manual sync request.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CodeRequest {
    kind: Option<EventKind>,
    code_owner: Option<String>,
    code_repo: Option<String>,
    sha: Option<String>,
    base_ref: Option<String>,
    installation_id: Option<u64>,
    whole_branch: bool,
    changes: Vec<Change>,
    headers: BTreeMap<String, String>,
}

impl CodeRequest {
    fn into_job_data(self, owner: &str, repo: &str, git_ref: &str) -> JobData {
        let mut data = JobData::new(self.kind.unwrap_or(EventKind::Manual), owner, repo, git_ref);
        if let Some(code_owner) = self.code_owner {
            data.code_owner = code_owner;
        }
        if let Some(code_repo) = self.code_repo {
            data.code_repo = code_repo;
        }
        data.sha = self.sha;
        data.base_ref = self.base_ref;
        data.installation_id = self.installation_id;
        data.whole_branch = self.whole_branch;
        data.changes = self.changes;
        data.headers = self.headers;
        data
    }
}

/// Start a code job for a branch or tag.
pub async fn sync(
    State(runner): State<Arc<JobRunner>>,
    Path((owner, repo, git_ref)): Path<(String, String, String)>,
    request: Option<Json<CodeRequest>>,
) -> Result<Response, AppError> {
    let request = request.map(|Json(request)| request).unwrap_or_default();
    let data = request.into_job_data(&owner, &repo, &git_ref);
    let job = runner.submit(data).await.map_err(|e| job_error(e, StatusCode::BAD_REQUEST))?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}
