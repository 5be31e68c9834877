pub mod jobs;

use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::{Read, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use codebus_core::config::StoreConfig;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use futures_util::{StreamExt, TryStreamExt, stream};
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutOptions, PutPayload,
    memory::InMemory, path::Path, prefix::PrefixStore,
};
use url::Url;

/// Free-form metadata stored alongside an object.
pub type Metadata = BTreeMap<String, String>;

/// Attributes of a stored object, without its body.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ObjectInfo {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_length: u64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Decoded body.
    pub body: Bytes,
    pub info: ObjectInfo,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ListEntry {
    /// Full key in the bus.
    pub key: String,
    /// Key relative to the listed prefix.
    pub path: String,
    pub size: u64,
}

/// A key/value view over an object store, as used for the code and content buses.
#[derive(Clone)]
pub struct Bus {
    store: Arc<dyn ObjectStore>,
}

impl Bus {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self { Self { store } }

    pub fn memory() -> Self { Self::new(Arc::new(InMemory::new())) }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .with_context(|| format!("Invalid storage URL: {}", config.url))?;
        let (store, prefix) = object_store::parse_url_opts(&url, config.options.iter())
            .with_context(|| format!("Failed to open storage: {}", config.url))?;
        tracing::info!(url = %config.url, "Opened storage");
        if prefix.as_ref().is_empty() {
            Ok(Self::new(Arc::from(store)))
        } else {
            Ok(Self::new(Arc::new(PrefixStore::new(store, prefix))))
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<StoredObject>> {
        let result = match self.store.get(&location(key)?).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to get {key}")),
        };
        let mut info = object_info(&result.attributes, result.meta.size);
        let body = result.bytes().await.with_context(|| format!("Failed to read {key}"))?;
        let body = if info.content_encoding.as_deref() == Some("gzip") {
            let mut decoder = GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).with_context(|| format!("Failed to decompress {key}"))?;
            info.content_length = out.len() as u64;
            Bytes::from(out)
        } else {
            body
        };
        Ok(Some(StoredObject { body, info }))
    }

    pub async fn head(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let options = GetOptions { head: true, ..Default::default() };
        match self.store.get_opts(&location(key)?, options).await {
            Ok(result) => Ok(Some(object_info(&result.attributes, result.meta.size))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {key}")),
        }
    }

    /// Store an object. When `compress` is set the body is gzipped at rest
    /// and tagged with a `gzip` content encoding.
    pub async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        metadata: &Metadata,
        compress: bool,
    ) -> Result<()> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, AttributeValue::from(content_type.to_string()));
        for (k, v) in metadata {
            attributes.insert(Attribute::Metadata(Cow::Owned(k.clone())), v.clone().into());
        }
        let payload = if compress {
            attributes.insert(Attribute::ContentEncoding, AttributeValue::from("gzip"));
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            PutPayload::from(encoder.finish().with_context(|| format!("Failed to compress {key}"))?)
        } else {
            PutPayload::from(body)
        };
        let options = PutOptions { attributes, ..Default::default() };
        self.store
            .put_opts(&location(key)?, payload, options)
            .await
            .with_context(|| format!("Failed to put {key}"))?;
        Ok(())
    }

    pub async fn put_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let body = Bytes::from(serde_json::to_vec_pretty(value)?);
        self.put(key, body, "application/json", &Metadata::new(), false).await
    }

    /// Remove an object. Missing objects are not an error.
    pub async fn remove(&self, key: &str) -> Result<()> {
        match self.store.delete(&location(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {key}")),
        }
    }

    /// Recursively list all objects below `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
        let base = location(prefix)?;
        let strip = if base.as_ref().is_empty() { String::new() } else { format!("{base}/") };
        let objects: Vec<_> = self
            .store
            .list(Some(&base))
            .try_collect()
            .await
            .with_context(|| format!("Failed to list {prefix}"))?;
        let mut entries = objects
            .into_iter()
            .map(|meta| {
                let key = meta.location.to_string();
                let path = key.strip_prefix(&strip).unwrap_or(&key).to_string();
                ListEntry { key, path, size: meta.size }
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// List the immediate sub-folders of `prefix`, by name.
    pub async fn list_folders(&self, prefix: &str) -> Result<Vec<String>> {
        let base = location(prefix)?;
        let result = self
            .store
            .list_with_delimiter(Some(&base))
            .await
            .with_context(|| format!("Failed to list {prefix}"))?;
        let mut folders = result
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(str::to_string))
            .collect::<Vec<_>>();
        folders.sort();
        Ok(folders)
    }

    /// Copy every object below `src` to the same relative path below `dst`,
    /// skipping relative paths rejected by `filter`. Returns the number of copies.
    pub async fn copy_deep<F>(
        &self,
        src: &str,
        dst: &str,
        filter: F,
        concurrency: usize,
    ) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        let dst = dst.trim_end_matches('/');
        let entries = self.list(src).await?;
        let copies = entries
            .into_iter()
            .filter(|entry| filter(&entry.path))
            .map(|entry| {
                let store = self.store.clone();
                async move {
                    let from = location(&entry.key)?;
                    let to = location(&format!("{dst}/{}", entry.path))?;
                    store
                        .copy(&from, &to)
                        .await
                        .with_context(|| format!("Failed to copy {from} to {to}"))
                }
            })
            .collect::<Vec<_>>();
        let count = copies.len();
        stream::iter(copies).buffer_unordered(concurrency.max(1)).try_collect::<Vec<_>>().await?;
        tracing::debug!(src, dst, count, "Copied objects");
        Ok(count)
    }

    /// Remove every object below `prefix`. Returns the number of removed objects.
    pub async fn rmdir(&self, prefix: &str, concurrency: usize) -> Result<usize> {
        let entries = self.list(prefix).await?;
        let count = entries.len();
        stream::iter(entries)
            .map(|entry| async move { self.remove(&entry.key).await })
            .buffer_unordered(concurrency.max(1))
            .try_collect::<Vec<_>>()
            .await?;
        tracing::debug!(prefix, count, "Removed objects");
        Ok(count)
    }
}

fn location(key: &str) -> Result<Path> {
    Path::parse(key).with_context(|| format!("Invalid storage key: {key}"))
}

fn object_info(attributes: &Attributes, size: u64) -> ObjectInfo {
    let mut info = ObjectInfo { content_length: size, ..Default::default() };
    for (attribute, value) in attributes.iter() {
        let value: &str = value.as_ref();
        match attribute {
            Attribute::ContentType => info.content_type = Some(value.to_string()),
            Attribute::ContentEncoding => info.content_encoding = Some(value.to_string()),
            Attribute::Metadata(key) => {
                info.metadata.insert(key.to_string(), value.to_string());
            }
            _ => {}
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_put_get_head() {
        let bus = Bus::memory();
        let metadata = meta(&[("x-commit-id", "abc")]);
        bus.put("o/r/main/a.md", Bytes::from_static(b"# hello"), "text/markdown", &metadata, true)
            .await
            .unwrap();

        let object = bus.get("o/r/main/a.md").await.unwrap().unwrap();
        assert_eq!(object.body, Bytes::from_static(b"# hello"));
        assert_eq!(object.info.content_type.as_deref(), Some("text/markdown"));
        assert_eq!(object.info.content_encoding.as_deref(), Some("gzip"));
        assert_eq!(object.info.content_length, 7);

        let info = bus.head("o/r/main/a.md").await.unwrap().unwrap();
        assert_eq!(info.metadata.get("x-commit-id").map(String::as_str), Some("abc"));

        assert!(bus.get("o/r/main/missing").await.unwrap().is_none());
        assert!(bus.head("o/r/main/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_copy_rmdir() {
        let bus = Bus::memory();
        let empty = Metadata::new();
        for key in ["o/r/main/a.md", "o/r/main/dir/b.js", "o/r/main/helix-config.json", "o/r/dev/c"] {
            bus.put(key, Bytes::from_static(b"x"), "text/plain", &empty, false).await.unwrap();
        }

        let paths = bus
            .list("o/r/main/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["a.md", "dir/b.js", "helix-config.json"]);
        assert_eq!(bus.list_folders("o/r/").await.unwrap(), vec!["dev", "main"]);

        let copied = bus
            .copy_deep("o/r/main/", "o/r/feature/", |p| p != "helix-config.json", 4)
            .await
            .unwrap();
        assert_eq!(copied, 2);
        assert!(bus.head("o/r/feature/dir/b.js").await.unwrap().is_some());
        assert!(bus.head("o/r/feature/helix-config.json").await.unwrap().is_none());

        assert_eq!(bus.rmdir("o/r/main/", 2).await.unwrap(), 3);
        assert!(bus.list("o/r/main/").await.unwrap().is_empty());
        assert_eq!(bus.list("o/r/dev/").await.unwrap().len(), 1);
        bus.remove("o/r/main/a.md").await.unwrap();
    }
}
