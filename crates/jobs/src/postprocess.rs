use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use codebus_core::{
    models::{JobData, JobState, Resource},
    util::{config_key, head_key, sanitize_ref},
};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    JobContext, branch_prefix,
    effects::SideEffect,
    fstab::Fstab,
    tree::CONFIG_FILE,
};

pub const CONFIG_VERSION: u32 = 2;
/// Marker in the content bus naming the repository that owns a content partition.
pub const ORIGINAL_REPOSITORY_MARKER: &str = ".hlx.json";

/// Configuration aggregated from the distinguished files of a branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<HeadConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fstab: Option<Fstab>,
    /// Sections maintained by other services, kept verbatim.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentConfig {
    pub content_bus_id: String,
    pub source_url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OriginalRepository {
    #[serde(rename = "original-repository", default)]
    original_repository: Option<String>,
}

/// Distinguished files, by resource path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ConfigFile {
    Head,
    Fstab,
    Query,
    Sitemap,
    Robots,
    Sidekick,
}

impl ConfigFile {
    fn from_path(path: &str) -> Option<Self> {
        Some(match path {
            "/head.html" => Self::Head,
            "/fstab.yaml" => Self::Fstab,
            "/helix-query.yaml" => Self::Query,
            "/helix-sitemap.yaml" => Self::Sitemap,
            "/robots.txt" => Self::Robots,
            "/tools/sidekick/config.json" => Self::Sidekick,
            _ => return None,
        })
    }
}

/// Rebuild derived configuration for the distinguished files touched by the sync.
///
/// Each file is handled independently; a failure is logged and only skips that
/// file's update and side effects.
pub async fn post_process(state: &JobState, ctx: &JobContext) -> Vec<SideEffect> {
    let data = &state.data;
    if data.delete_tree {
        return vec![];
    }
    let is_default = data.ref_name == sanitize_ref(&ctx.config.default_branch);
    let mut effects = vec![];
    let mut config_purged = false;
    for resource in state.resources.iter().filter(|r| r.status == 200 && !r.skipped) {
        let Some(file) = ConfigFile::from_path(&resource.resource_path) else {
            continue;
        };
        let result = match file {
            ConfigFile::Head => update_head(data, resource, ctx).await,
            ConfigFile::Fstab if is_default => update_fstab(data, resource, ctx).await,
            ConfigFile::Query | ConfigFile::Sitemap if is_default => {
                update_artifact(data, resource, file, ctx).await
            }
            ConfigFile::Robots | ConfigFile::Sidekick if !config_purged => {
                config_purged = true;
                Ok(vec![purge_keys(data, vec![config_key(&data.owner, &data.repo, &data.ref_name)])])
            }
            _ => Ok(vec![]),
        };
        match result {
            Ok(mut file_effects) => effects.append(&mut file_effects),
            Err(e) => tracing::warn!("Failed to process {}: {:?}", resource.resource_path, e),
        }
    }
    effects
}

fn purge_keys(data: &JobData, keys: Vec<String>) -> SideEffect {
    SideEffect::Purge {
        owner: data.owner.clone(),
        repo: data.repo.clone(),
        ref_name: data.ref_name.clone(),
        paths: vec![],
        keys,
    }
}

fn now() -> String { OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default() }

fn config_path(data: &JobData) -> String { format!("{}{}", branch_prefix(data), CONFIG_FILE) }

async fn load_config(data: &JobData, ctx: &JobContext) -> Result<Option<AggregateConfig>> {
    let key = config_path(data);
    let Some(object) = ctx.code_bus.get(&key).await? else {
        return Ok(None);
    };
    let config = serde_json::from_slice(&object.body)
        .with_context(|| format!("Failed to parse {key}"))?;
    Ok(Some(config))
}

async fn save_config(data: &JobData, ctx: &JobContext, mut config: AggregateConfig) -> Result<()> {
    let now = now();
    config.version = config.version.max(CONFIG_VERSION);
    config.created.get_or_insert_with(|| now.clone());
    config.modified = Some(now);
    ctx.code_bus.put_json(&config_path(data), &serde_json::to_value(&config)?).await
}

async fn read_text(data: &JobData, resource: &Resource, ctx: &JobContext) -> Result<String> {
    let key = format!("{}{}", branch_prefix(data), resource.resource_path.trim_start_matches('/'));
    let object = ctx.code_bus.get(&key).await?.with_context(|| format!("{key} not found"))?;
    String::from_utf8(object.body.to_vec()).with_context(|| format!("{key} is not valid UTF-8"))
}

async fn update_head(
    data: &JobData,
    resource: &Resource,
    ctx: &JobContext,
) -> Result<Vec<SideEffect>> {
    let mut config = load_config(data, ctx).await?.unwrap_or_default();
    config.head = if resource.deleted {
        None
    } else {
        Some(HeadConfig { html: read_text(data, resource, ctx).await? })
    };
    save_config(data, ctx, config).await?;
    tracing::info!("Updated head of {}/{}/{}", data.owner, data.repo, data.ref_name);
    Ok(vec![purge_keys(data, vec![head_key(&data.owner, &data.repo, &data.ref_name)])])
}

async fn update_fstab(
    data: &JobData,
    resource: &Resource,
    ctx: &JobContext,
) -> Result<Vec<SideEffect>> {
    if resource.deleted {
        ctx.code_bus.remove(&config_path(data)).await?;
        tracing::info!("Removed configuration of {}/{}", data.owner, data.repo);
        return Ok(vec![]);
    }
    let fstab = Fstab::parse(&read_text(data, resource, ctx).await?)?;
    let (Some(root), Some(content_bus_id)) = (fstab.root(), fstab.content_bus_id()) else {
        bail!("Missing root mount point");
    };
    let source_url = root.url().to_string();
    // Claim the content partition before the configuration points at it.
    ensure_original_marker(data, &content_bus_id, ctx).await?;

    let mut config = load_config(data, ctx).await?.unwrap_or_default();
    let previous_id = config.content.as_ref().map(|c| c.content_bus_id.clone());
    config.content = Some(ContentConfig { content_bus_id: content_bus_id.clone(), source_url });
    config.fstab = Some(fstab.clone());
    save_config(data, ctx, config).await?;
    tracing::info!("Updated mount table of {}/{} ({})", data.owner, data.repo, content_bus_id);

    let mut keys = vec![content_bus_id];
    if let Some(previous) = previous_id
        && !keys.contains(&previous)
    {
        keys.push(previous);
    }
    let (owner, repo) = (data.owner.clone(), data.repo.clone());
    Ok(vec![
        SideEffect::DeployMountTable { owner: owner.clone(), repo: repo.clone(), fstab },
        SideEffect::MergeContentConfig { owner: owner.clone(), repo: repo.clone() },
        SideEffect::Reindex { owner, repo },
        purge_keys(data, keys),
    ])
}

fn project_coordinates(data: &JobData) -> String { format!("{}/{}", data.owner, data.repo) }

async fn ensure_original_marker(data: &JobData, content_bus_id: &str, ctx: &JobContext) -> Result<()> {
    let key = format!("{content_bus_id}/{ORIGINAL_REPOSITORY_MARKER}");
    if ctx.content_bus.head(&key).await?.is_some() {
        return Ok(());
    }
    let marker = serde_json::json!({ "original-repository": project_coordinates(data) });
    ctx.content_bus.put_json(&key, &marker).await
}

/// Whether the project owns the content partition, rather than being a fork sharing it.
async fn is_original(data: &JobData, content_bus_id: &str, ctx: &JobContext) -> Result<bool> {
    let key = format!("{content_bus_id}/{ORIGINAL_REPOSITORY_MARKER}");
    let Some(object) = ctx.content_bus.get(&key).await? else {
        return Ok(true);
    };
    let marker: OriginalRepository = serde_json::from_slice(&object.body)
        .with_context(|| format!("Failed to parse {key}"))?;
    Ok(marker.original_repository.is_none_or(|original| original == project_coordinates(data)))
}

async fn update_artifact(
    data: &JobData,
    resource: &Resource,
    file: ConfigFile,
    ctx: &JobContext,
) -> Result<Vec<SideEffect>> {
    let Some(content) = load_config(data, ctx).await?.and_then(|c| c.content) else {
        tracing::debug!("No mount table, skipping {}", resource.resource_path);
        return Ok(vec![]);
    };
    if !is_original(data, &content.content_bus_id, ctx).await? {
        tracing::info!("Not the original repository, skipping {}", resource.resource_path);
        return Ok(vec![]);
    }
    let name = if file == ConfigFile::Query { "query.yaml" } else { "sitemap.yaml" };
    let key = format!("{}/preview/.helix/{name}", content.content_bus_id);
    if resource.deleted {
        ctx.content_bus.remove(&key).await?;
        tracing::info!("Removed {key}");
    } else {
        let text = read_text(data, resource, ctx).await?;
        serde_yaml::from_str::<serde_yaml::Value>(&text)
            .with_context(|| format!("Invalid YAML in {}", resource.resource_path))?;
        let mut metadata = codebus_storage::Metadata::new();
        metadata.insert("x-source-location".to_string(), resource.resource_path.clone());
        ctx.content_bus.put(&key, text.into(), "text/yaml", &metadata, true).await?;
        tracing::info!("Updated {key}");
    }
    Ok(vec![])
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use codebus_core::{config::StoreConfig, models::EventKind};
    use codebus_storage::{Bus, Metadata};

    use super::*;
    use crate::testing::{FakeSource, context};

    const FSTAB: &str = "mountpoints:\n  /: https://drive.example.com/root\n";

    fn state(ref_name: &str, resources: Vec<Resource>) -> JobState {
        let mut state = JobState::new(JobData::new(EventKind::Push, "owner", "repo", ref_name));
        state.resources = resources;
        state
    }

    fn written(path: &str) -> Resource { Resource::written(path.to_string(), 1, "text/plain") }

    async fn put(ctx: &JobContext, key: &str, body: &'static str) {
        ctx.code_bus.put(key, Bytes::from_static(body.as_bytes()), "text/plain", &Metadata::new(), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_config_files() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        let effects = post_process(&state("main", vec![written("/foo/bar.md")]), &ctx).await;
        assert!(effects.is_empty());
        assert!(ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_head_preserves_other_sections() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        put(&ctx, "owner/repo/main/head.html", "<script src=\"/scripts.js\"></script>").await;
        put(
            &ctx,
            "owner/repo/main/helix-config.json",
            r#"{"version":1,"created":"2020-01-01T00:00:00Z","cdn":{"prod":{"host":"example.com"}}}"#,
        )
        .await;
        let effects = post_process(&state("main", vec![written("/head.html")]), &ctx).await;
        assert_eq!(effects, vec![SideEffect::Purge {
            owner: "owner".to_string(),
            repo: "repo".to_string(),
            ref_name: "main".to_string(),
            paths: vec![],
            keys: vec!["main--owner--repo_head".to_string()],
        }]);

        let object = ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().unwrap();
        let config: AggregateConfig = serde_json::from_slice(&object.body).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.created.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert!(config.modified.is_some());
        assert_eq!(config.head.unwrap().html, "<script src=\"/scripts.js\"></script>");
        assert!(config.other.contains_key("cdn"));
    }

    #[tokio::test]
    async fn test_fstab_on_default_branch() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        put(&ctx, "owner/repo/main/fstab.yaml", FSTAB).await;
        let effects = post_process(&state("main", vec![written("/fstab.yaml")]), &ctx).await;
        let id = crate::fstab::content_bus_id("https://drive.example.com/root");
        assert_eq!(effects.len(), 4);
        assert!(matches!(&effects[0], SideEffect::DeployMountTable { fstab, .. } if fstab.root().is_some()));
        assert!(matches!(&effects[1], SideEffect::MergeContentConfig { .. }));
        assert!(matches!(&effects[2], SideEffect::Reindex { .. }));
        assert!(matches!(&effects[3], SideEffect::Purge { keys, .. } if keys == &[id.clone()]));

        let marker = ctx.content_bus.get(&format!("{id}/.hlx.json")).await.unwrap().unwrap();
        let marker: serde_json::Value = serde_json::from_slice(&marker.body).unwrap();
        assert_eq!(marker["original-repository"], "owner/repo");

        // Not the default branch: ignored.
        put(&ctx, "owner/repo/dev/fstab.yaml", FSTAB).await;
        assert!(post_process(&state("dev", vec![written("/fstab.yaml")]), &ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_fstab_keeps_config() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        put(&ctx, "owner/repo/main/helix-config.json", r#"{"version":2,"fstab":null}"#).await;
        put(&ctx, "owner/repo/main/fstab.yaml", "mountpoints: [").await;
        let before = ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().unwrap();
        let effects = post_process(&state("main", vec![written("/fstab.yaml")]), &ctx).await;
        assert!(effects.is_empty());
        let after = ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().unwrap();
        assert_eq!(before.body, after.body);
    }

    #[tokio::test]
    async fn test_unwritable_content_bus_keeps_config() {
        let (mut ctx, downstream) = context(FakeSource::new("c1", &[]));
        // A regular file where the content bus expects a directory.
        let blocker = std::env::temp_dir().join(format!("codebus-content-{}", std::process::id()));
        std::fs::write(&blocker, b"x").unwrap();
        let url = format!("file://{}", blocker.display());
        ctx.content_bus = Bus::from_config(&StoreConfig { url, options: Default::default() }).unwrap();

        put(&ctx, "owner/repo/main/fstab.yaml", FSTAB).await;
        let effects = post_process(&state("main", vec![written("/fstab.yaml")]), &ctx).await;
        std::fs::remove_file(&blocker).unwrap();

        assert!(effects.is_empty());
        assert!(downstream.effects().is_empty());
        assert!(ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fstab_deleted() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        put(&ctx, "owner/repo/main/helix-config.json", r#"{"version":2}"#).await;
        let effects =
            post_process(&state("main", vec![Resource::deleted("/fstab.yaml".to_string())]), &ctx).await;
        assert!(effects.is_empty());
        assert!(ctx.code_bus.get("owner/repo/main/helix-config.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_artifact_fork_isolation() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        put(&ctx, "owner/repo/main/fstab.yaml", FSTAB).await;
        put(&ctx, "owner/repo/main/helix-query.yaml", "indices:\n  site: {}\n").await;
        let id = crate::fstab::content_bus_id("https://drive.example.com/root");
        let query_key = format!("{id}/preview/.helix/query.yaml");

        // A fork sharing the content partition of another project.
        ctx.content_bus
            .put_json(&format!("{id}/.hlx.json"), &serde_json::json!({"original-repository": "upstream/site"}))
            .await
            .unwrap();
        post_process(&state("main", vec![written("/fstab.yaml"), written("/helix-query.yaml")]), &ctx)
            .await;
        assert!(ctx.content_bus.get(&query_key).await.unwrap().is_none());

        // The original project publishes the artifact.
        ctx.content_bus
            .put_json(&format!("{id}/.hlx.json"), &serde_json::json!({"original-repository": "owner/repo"}))
            .await
            .unwrap();
        post_process(&state("main", vec![written("/helix-query.yaml")]), &ctx).await;
        let object = ctx.content_bus.get(&query_key).await.unwrap().unwrap();
        assert_eq!(object.body, Bytes::from_static(b"indices:\n  site: {}\n"));

        post_process(&state("main", vec![Resource::deleted("/helix-query.yaml".to_string())]), &ctx)
            .await;
        assert!(ctx.content_bus.get(&query_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_robots_and_sidekick_purge_config_once() {
        let (ctx, _) = context(FakeSource::new("c1", &[]));
        let resources = vec![written("/robots.txt"), written("/tools/sidekick/config.json")];
        let effects = post_process(&state("feature", resources), &ctx).await;
        assert!(matches!(
            effects.as_slice(),
            [SideEffect::Purge { keys, .. }] if keys == &["feature--owner--repo_config"]
        ));
        assert!(ctx.code_bus.get("owner/repo/feature/helix-config.json").await.unwrap().is_none());
    }
}
