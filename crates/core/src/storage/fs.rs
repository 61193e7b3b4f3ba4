use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error};
use walkdir::WalkDir;

use super::{
    BoxFuture, ByteProgress, DestinationAdapter, Namespace, ShardProgress, SourceAdapter,
    StoredUnit, Unit, UploadReceipt, content_id, manifest_for, plan_shards,
};
use crate::{Error, Result};

const CHUNK_SIZE: usize = 64 * 1024;
const SPACE_FILE: &str = "space.json";
const UPLOADS_FILE: &str = "uploads.json";

/// A local directory exposed as an object store. Keys are `/`-separated paths
/// relative to the root.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        let safe = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::InvalidConfig {
                message: format!("invalid object key: {key:?}"),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn key_for(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| Error::InvalidConfig {
        message: "path strip_prefix failed".to_string(),
    })?;
    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| Error::InvalidConfig {
            message: format!("non-utf8 path: {}", path.display()),
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

impl SourceAdapter for FsSource {
    fn provider(&self) -> &str {
        "fs"
    }

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(&self.root).await.map_err(|e| Error::Connection {
                message: format!("source root unavailable: {}: {e}", self.root.display()),
            })?;
            if !meta.is_dir() {
                return Err(Error::Connection {
                    message: format!("source root is not a directory: {}", self.root.display()),
                });
            }
            Ok(())
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            for entry in WalkDir::new(&self.root).follow_links(false) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let key = key_for(&self.root, entry.path())?;
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            debug!(
                event = "source.list",
                provider = "fs",
                prefix,
                keys = keys.len(),
                "source.list"
            );
            Ok(keys)
        })
    }

    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn fetch<'a>(&'a self, key: &'a str, progress: ByteProgress<'a>) -> BoxFuture<'a, Unit> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let mut file = match tokio::fs::File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::NotFound {
                        message: format!("object not found: {key}"),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            let total = file.metadata().await?.len();

            let mut bytes = Vec::with_capacity(total as usize);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                bytes.extend_from_slice(&buf[..n]);
                progress(bytes.len() as u64, total.max(bytes.len() as u64));
            }
            if bytes.is_empty() {
                progress(0, 0);
            }
            Ok(Unit::new(key, bytes))
        })
    }
}

/// A local content-addressed store.
///
/// Layout under `root`:
/// - `blobs/<blake3-hex>`: unit bytes and multi-unit manifests
/// - `spaces/<id>/space.json`: namespace record
/// - `spaces/<id>/uploads.json`: uploads made while the namespace was selected
#[derive(Debug)]
pub struct FsDestination {
    root: PathBuf,
    shard_size: u64,
    selected: Mutex<Option<String>>,
}

impl FsDestination {
    pub fn new(root: impl Into<PathBuf>, shard_size: u64) -> Self {
        Self {
            root: root.into(),
            shard_size: shard_size.max(1),
            selected: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn spaces_dir(&self) -> PathBuf {
        self.root.join("spaces")
    }

    fn space_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::InvalidConfig {
                message: format!("invalid space id: {id:?}"),
            });
        }
        Ok(self.spaces_dir().join(id))
    }

    fn locator(&self, id: &str) -> String {
        format!("file://{}", self.blobs_dir().join(id).display())
    }

    async fn write_blob(&self, bytes: &[u8], progress: Option<ByteProgress<'_>>) -> Result<String> {
        let id = content_id(bytes);
        let path = self.blobs_dir().join(&id);
        let total = bytes.len() as u64;

        if tokio::fs::try_exists(&path).await? {
            if let Some(progress) = progress {
                progress(total, total);
            }
            return Ok(id);
        }

        let tmp = self
            .blobs_dir()
            .join(format!("{id}.tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut written = 0u64;
        for chunk in bytes.chunks(CHUNK_SIZE) {
            file.write_all(chunk).await?;
            written += chunk.len() as u64;
            if let Some(progress) = progress {
                progress(written, total);
            }
        }
        if bytes.is_empty()
            && let Some(progress) = progress
        {
            progress(0, 0);
        }
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            error!(
                event = "io.blob.rename_failed",
                path = %path.display(),
                error = %e,
                "io.blob.rename_failed"
            );
            e
        })?;
        Ok(id)
    }

    async fn record_upload(&self, id: &str, size: u64) -> Result<()> {
        let selected = self.selected.lock().await;
        let Some(space_id) = selected.as_deref() else {
            return Ok(());
        };
        let path = self.space_dir(space_id)?.join(UPLOADS_FILE);
        let mut units = read_uploads(&path).await?;
        units.push(StoredUnit {
            id: id.to_string(),
            size,
        });
        write_json_atomic(&path, &units).await
    }
}

async fn read_uploads(path: &Path) -> Result<Vec<StoredUnit>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl DestinationAdapter for FsDestination {
    fn provider(&self) -> &str {
        "fs"
    }

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for dir in [self.blobs_dir(), self.spaces_dir()] {
                tokio::fs::create_dir_all(&dir).await.map_err(|e| Error::Connection {
                    message: format!("destination root unavailable: {}: {e}", dir.display()),
                })?;
            }
            Ok(())
        })
    }

    fn upload_one<'a>(
        &'a self,
        unit: Unit,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt> {
        Box::pin(async move {
            let id = self.write_blob(&unit.bytes, Some(progress)).await?;
            self.record_upload(&id, unit.size()).await?;
            debug!(
                event = "destination.upload_one",
                name = %unit.name,
                id = %id,
                bytes = unit.size(),
                "destination.upload_one"
            );
            Ok(UploadReceipt {
                locator: self.locator(&id),
                id,
            })
        })
    }

    fn upload_many<'a>(
        &'a self,
        units: Vec<Unit>,
        on_shard: ShardProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt> {
        Box::pin(async move {
            let shards = plan_shards(&units, self.shard_size);
            let total_shards = shards.len() as u32;
            for (i, shard) in shards.into_iter().enumerate() {
                for unit in &units[shard] {
                    self.write_blob(&unit.bytes, None).await?;
                }
                debug!(
                    event = "destination.shard_written",
                    shard_index = i + 1,
                    total_shards,
                    "destination.shard_written"
                );
                on_shard(i as u32 + 1, total_shards);
            }

            let manifest = serde_json::to_vec_pretty(&manifest_for(&units, total_shards))?;
            let id = self.write_blob(&manifest, None).await?;
            let size = units.iter().map(Unit::size).sum();
            self.record_upload(&id, size).await?;
            Ok(UploadReceipt {
                locator: self.locator(&id),
                id,
            })
        })
    }

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Namespace> {
        Box::pin(async move {
            let ns = Namespace {
                id: uuid::Uuid::new_v4().simple().to_string(),
                name: name.to_string(),
            };
            let dir = self.space_dir(&ns.id)?;
            tokio::fs::create_dir_all(&dir).await?;
            write_json_atomic(&dir.join(SPACE_FILE), &ns).await?;
            Ok(ns)
        })
    }

    fn select_namespace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let path = self.space_dir(id)?.join(SPACE_FILE);
            if !tokio::fs::try_exists(&path).await? {
                return Err(Error::NotFound {
                    message: format!("space not found: {id}"),
                });
            }
            *self.selected.lock().await = Some(id.to_string());
            Ok(())
        })
    }

    fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>> {
        Box::pin(async move {
            let mut spaces = Vec::new();
            let mut entries = match tokio::fs::read_dir(self.spaces_dir()).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(spaces),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path().join(SPACE_FILE);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => spaces.push(serde_json::from_slice::<Namespace>(&bytes)?),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            spaces.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(spaces)
        })
    }

    fn list_units<'a>(&'a self, namespace_id: &'a str) -> BoxFuture<'a, Vec<StoredUnit>> {
        Box::pin(async move {
            let dir = self.space_dir(namespace_id)?;
            if !tokio::fs::try_exists(dir.join(SPACE_FILE)).await? {
                return Err(Error::NotFound {
                    message: format!("space not found: {namespace_id}"),
                });
            }
            read_uploads(&dir.join(UPLOADS_FILE)).await
        })
    }
}
