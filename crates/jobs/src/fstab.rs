use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Parsed mount table (`fstab.yaml`).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fstab {
    pub mountpoints: BTreeMap<String, MountPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub folders: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MountPoint {
    Url(String),
    Detailed {
        url: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl MountPoint {
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Detailed { url, .. } => url,
        }
    }
}

impl Fstab {
    pub fn parse(text: &str) -> Result<Self> {
        let fstab: Self = serde_yaml::from_str(text).context("Failed to parse fstab.yaml")?;
        fstab.validate()?;
        Ok(fstab)
    }

    pub fn validate(&self) -> Result<()> {
        for (path, mount) in &self.mountpoints {
            if !path.starts_with('/') {
                bail!("Invalid mount point {path}: must start with /");
            }
            Url::parse(mount.url())
                .with_context(|| format!("Invalid URL for mount point {path}: {}", mount.url()))?;
        }
        for path in self.folders.keys() {
            if !path.starts_with('/') {
                bail!("Invalid folder mapping {path}: must start with /");
            }
        }
        if self.root().is_none() {
            bail!("Missing root mount point");
        }
        Ok(())
    }

    pub fn root(&self) -> Option<&MountPoint> { self.mountpoints.get("/") }

    pub fn content_bus_id(&self) -> Option<String> {
        self.root().map(|mount| content_bus_id(mount.url()))
    }
}

/// Content-bus partition of a project, derived from the URL of its root mount point.
pub fn content_bus_id(url: &str) -> String {
    let mut id = hex::encode(Sha256::digest(url.as_bytes()));
    id.truncate(59);
    id
}
