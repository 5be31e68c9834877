use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use codebus_core::{
    config::Config,
    models::{Change, ChangeType, EventKind, JobData},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Verify and extract GitHub Event Payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: String,
    pub body: Bytes,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err("X-GitHub-Event header missing"))?
            .to_string();
        let config = <Arc<Config>>::from_ref(state);
        let body = if let Some(app_config) = &config.github.app {
            let signature_sha256 = req
                .headers()
                .get("X-Hub-Signature-256")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                .strip_prefix("sha256=")
                .ok_or_else(|| err("X-Hub-Signature-256 sha256= prefix missing"))?;
            let signature =
                hex::decode(signature_sha256).map_err(|_| err("X-Hub-Signature-256 malformed"))?;
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            if !verify_signature(app_config.webhook_secret.as_bytes(), &body, &signature) {
                return Err(err("signature mismatch"));
            }
            body
        } else {
            Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?
        };
        Ok(GitHubEvent { event, body })
    }
}

pub fn verify_signature(secret: &[u8], body: &[u8], signature: &[u8]) -> bool {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(signature).is_ok()
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    before: String,
    #[serde(default)]
    after: String,
    #[serde(default)]
    created: bool,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    forced: bool,
    #[serde(default)]
    commits: Vec<PushCommit>,
    repository: Repository,
    installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    id: String,
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    removed: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
}

/// Payload of `create` and `delete` events.
#[derive(Debug, Deserialize)]
struct RefPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    ref_type: String,
    repository: Repository,
    installation: Option<Installation>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: Owner,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
}

impl GitHubEvent {
    /// Convert a webhook delivery into the data of a code job.
    /// Returns `None` for events that do not affect the code bus.
    pub fn into_job_data(self) -> Result<Option<JobData>> {
        match self.event.as_str() {
            "push" => {
                let payload: PushPayload =
                    serde_json::from_slice(&self.body).context("Failed to parse push payload")?;
                Ok(push_job_data(payload))
            }
            "create" | "delete" => {
                let payload: RefPayload = serde_json::from_slice(&self.body)
                    .with_context(|| format!("Failed to parse {} payload", self.event))?;
                Ok(ref_job_data(payload, self.event == "delete"))
            }
            _ => Ok(None),
        }
    }
}

fn base_data(kind: EventKind, repository: &Repository, name: &str) -> JobData {
    JobData::new(kind, &repository.owner.login, &repository.name, name)
}

fn push_job_data(payload: PushPayload) -> Option<JobData> {
    let (name, is_tag) = if let Some(name) = payload.git_ref.strip_prefix("refs/heads/") {
        (name, false)
    } else if let Some(name) = payload.git_ref.strip_prefix("refs/tags/") {
        (name, true)
    } else {
        return None;
    };
    let kind = match (is_tag, payload.created, payload.deleted) {
        // Tag deletion leaves the stored tree in place.
        (true, _, true) => return None,
        (true, _, false) => EventKind::TagCreated,
        (false, _, true) => EventKind::BranchDeleted,
        (false, true, false) => EventKind::BranchCreated,
        (false, false, false) => EventKind::Push,
    };
    let mut data = base_data(kind, &payload.repository, name);
    data.installation_id = payload.installation.map(|i| i.id);
    data.report_deployment = data.installation_id.is_some();
    if payload.after != ZERO_SHA && !payload.after.is_empty() {
        data.sha = Some(payload.after.clone());
    }
    if kind == EventKind::Push {
        if payload.before != ZERO_SHA && !payload.before.is_empty() {
            data.base_ref = Some(payload.before.clone());
        }
        data.whole_branch = payload.forced;
        data.changes = flatten_commits(&payload.commits);
    }
    Some(data)
}

fn ref_job_data(payload: RefPayload, deleted: bool) -> Option<JobData> {
    let kind = match (payload.ref_type.as_str(), deleted) {
        ("branch", false) => EventKind::BranchCreated,
        ("branch", true) => EventKind::BranchDeleted,
        ("tag", false) => EventKind::TagCreated,
        _ => return None,
    };
    let mut data = base_data(kind, &payload.repository, &payload.git_ref);
    data.installation_id = payload.installation.map(|i| i.id);
    Some(data)
}

/// Flatten the commits of a push into one change per path. Later commits win.
fn flatten_commits(commits: &[PushCommit]) -> Vec<Change> {
    let mut changes = BTreeMap::<&str, Change>::new();
    for commit in commits {
        let entries = [
            (&commit.added, ChangeType::Added),
            (&commit.modified, ChangeType::Modified),
            (&commit.removed, ChangeType::Deleted),
        ];
        for (paths, kind) in entries {
            for path in paths {
                let sha = (kind != ChangeType::Deleted).then_some(commit.id.as_str());
                changes.insert(path.as_str(), Change::new(path, kind, sha));
            }
        }
    }
    changes.into_values().collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event(event: &str, body: serde_json::Value) -> GitHubEvent {
        GitHubEvent { event: event.to_string(), body: Bytes::from(body.to_string()) }
    }

    fn repository() -> serde_json::Value {
        json!({ "name": "site", "owner": { "login": "acme" }, "default_branch": "main" })
    }

    #[test]
    fn test_push() {
        let data = event("push", json!({
            "ref": "refs/heads/main",
            "before": "aaa",
            "after": "ccc",
            "created": false,
            "deleted": false,
            "forced": false,
            "commits": [
                { "id": "bbb", "added": ["foo/bar.md", "old.md"], "removed": [], "modified": [] },
                { "id": "ccc", "added": [], "removed": ["old.md"], "modified": ["foo/bar.md"] },
            ],
            "repository": repository(),
            "installation": { "id": 7 },
        }))
        .into_job_data()
        .unwrap()
        .unwrap();
        assert_eq!(data.kind, EventKind::Push);
        assert_eq!((data.owner.as_str(), data.repo.as_str(), data.ref_name.as_str()), (
            "acme", "site", "main"
        ));
        assert_eq!(data.sha.as_deref(), Some("ccc"));
        assert_eq!(data.base_ref.as_deref(), Some("aaa"));
        assert_eq!(data.installation_id, Some(7));
        assert_eq!(data.changes, vec![
            Change::modified("foo/bar.md", "ccc"),
            Change::deleted("old.md"),
        ]);
    }

    #[test]
    fn test_branch_events() {
        let data = event("push", json!({
            "ref": "refs/heads/Feature/X",
            "before": "aaa",
            "after": ZERO_SHA,
            "deleted": true,
            "repository": repository(),
        }))
        .into_job_data()
        .unwrap()
        .unwrap();
        assert_eq!(data.kind, EventKind::BranchDeleted);
        assert_eq!(data.ref_name, "feature-x");
        assert_eq!(data.code_ref, "Feature/X");
        assert!(data.sha.is_none());

        let data = event("create", json!({
            "ref": "v1.0",
            "ref_type": "tag",
            "repository": repository(),
        }))
        .into_job_data()
        .unwrap()
        .unwrap();
        assert_eq!(data.kind, EventKind::TagCreated);
        assert_eq!(data.ref_name, "v1-0");

        assert!(event("issues", json!({})).into_job_data().unwrap().is_none());
        assert!(event("push", json!({})).into_job_data().is_err());
    }

    #[test]
    fn test_verify_signature() {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(b"payload");
        let signature = mac.finalize().into_bytes();
        assert!(verify_signature(b"secret", b"payload", &signature));
        assert!(!verify_signature(b"other", b"payload", &signature));
    }
}
