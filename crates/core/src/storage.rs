use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

mod fs;
mod sqlite;

pub use fs::{FsDestination, FsSource};
pub use sqlite::SqliteCollectionSource;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// `(bytes_processed, total_bytes)`; `total_bytes == 0` when unknown.
pub type ByteProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// `(shard_index, total_shards)`, 1-based, called after each shard is written.
pub type ShardProgress<'a> = &'a (dyn Fn(u32, u32) + Send + Sync);

/// One transferable item: a file, or an exported collection.
///
/// The payload is held fully in memory. A directory or collection migration
/// keeps every fetched unit until its single `upload_many` call, so peak
/// memory is the size of the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Unit {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub id: String,
    pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUnit {
    pub id: String,
    pub size: u64,
}

pub trait SourceAdapter: Send + Sync {
    fn provider(&self) -> &str;

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Keys under `prefix`, in a stable order.
    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>>;

    /// Size of `key` without fetching it, when the source can tell.
    fn size<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async { Ok(None) })
    }

    /// Fetches `key`, calling `progress` at least once per chunk read.
    fn fetch<'a>(&'a self, key: &'a str, progress: ByteProgress<'a>) -> BoxFuture<'a, Unit>;
}

/// Document-store source: every collection exports to one self-contained unit.
pub trait CollectionSource: Send + Sync {
    fn provider(&self) -> &str;

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn list_collections(&self) -> BoxFuture<'_, Vec<String>>;

    fn export_collection<'a>(
        &'a self,
        name: &'a str,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, Unit>;
}

pub trait DestinationAdapter: Send + Sync {
    fn provider(&self) -> &str;

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn upload_one<'a>(
        &'a self,
        unit: Unit,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt>;

    /// Uploads `units` as one logical unit. Implementations that split the
    /// write into shards report each finished shard through `on_shard`.
    fn upload_many<'a>(
        &'a self,
        units: Vec<Unit>,
        on_shard: ShardProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt>;

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Namespace>;

    fn select_namespace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()>;

    fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>>;

    fn list_units<'a>(&'a self, namespace_id: &'a str) -> BoxFuture<'a, Vec<StoredUnit>>;
}

/// Splits `units` into consecutive shards of at most `shard_size` bytes. A
/// unit larger than `shard_size` gets a shard of its own.
pub fn plan_shards(units: &[Unit], shard_size: u64) -> Vec<Range<usize>> {
    let mut shards = Vec::new();
    let mut start = 0;
    let mut bytes = 0u64;
    for (i, unit) in units.iter().enumerate() {
        if i > start && bytes + unit.size() > shard_size {
            shards.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += unit.size();
    }
    if start < units.len() {
        shards.push(start..units.len());
    }
    shards
}

pub fn content_id(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManifestEntry {
    pub name: String,
    pub id: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Manifest {
    pub version: u32,
    pub shards: u32,
    pub entries: Vec<ManifestEntry>,
}

fn manifest_for(units: &[Unit], shards: u32) -> Manifest {
    Manifest {
        version: 1,
        shards,
        entries: units
            .iter()
            .map(|u| ManifestEntry {
                name: u.name.clone(),
                id: content_id(&u.bytes),
                size: u.size(),
            })
            .collect(),
    }
}

fn take_failure(failures: &Mutex<HashMap<String, u32>>, key: &str) -> bool {
    let mut failures = failures.lock().unwrap_or_else(|e| e.into_inner());
    match failures.get_mut(key) {
        Some(0) | None => false,
        Some(n) => {
            if *n != u32::MAX {
                *n -= 1;
            }
            true
        }
    }
}

#[derive(Debug)]
pub struct InMemorySource {
    pub fetch_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    chunk_size: usize,
    report_sizes: bool,
    failures: Mutex<HashMap<String, u32>>,
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySource {
    pub fn new() -> Self {
        Self {
            fetch_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            objects: Mutex::new(BTreeMap::new()),
            chunk_size: 64 * 1024,
            report_sizes: true,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_object(self, key: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(key, bytes);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Makes `size()` answer `None`, like a source without metadata lookups.
    pub fn without_sizes(mut self) -> Self {
        self.report_sizes = false;
        self
    }

    pub fn insert(&self, key: impl Into<String>, bytes: Vec<u8>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), bytes);
    }

    /// Fails the next `times` fetches of `key`; `u32::MAX` fails every fetch.
    pub fn fail_fetch(&self, key: impl Into<String>, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), times);
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

impl SourceAdapter for InMemorySource {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn list<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.list_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            if !self.report_sizes {
                return Ok(None);
            }
            Ok(self.get(key).map(|b| b.len() as u64))
        })
    }

    fn fetch<'a>(&'a self, key: &'a str, progress: ByteProgress<'a>) -> BoxFuture<'a, Unit> {
        Box::pin(async move {
            self.fetch_calls.fetch_add(1, Ordering::Relaxed);
            if take_failure(&self.failures, key) {
                return Err(Error::Transfer {
                    message: format!("injected fetch failure: {key}"),
                });
            }
            let bytes = self.get(key).ok_or_else(|| Error::NotFound {
                message: format!("object not found: {key}"),
            })?;

            let total = bytes.len() as u64;
            let mut done = 0u64;
            for chunk in bytes.chunks(self.chunk_size) {
                done += chunk.len() as u64;
                progress(done, total);
            }
            if bytes.is_empty() {
                progress(0, 0);
            }
            Ok(Unit::new(key, bytes))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub receipt: UploadReceipt,
    pub namespace: Option<String>,
    pub names: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Default)]
struct MemDestinationState {
    blobs: HashMap<String, Vec<u8>>,
    uploads: Vec<StoredUpload>,
    namespaces: Vec<Namespace>,
    selected: Option<String>,
}

#[derive(Debug)]
pub struct InMemoryDestination {
    pub upload_calls: AtomicUsize,
    pub connected: AtomicBool,
    pub closed: AtomicBool,
    shard_size: u64,
    fail_uploads: Mutex<u32>,
    fail_connects: Mutex<u32>,
    state: Mutex<MemDestinationState>,
}

impl Default for InMemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDestination {
    pub fn new() -> Self {
        Self {
            upload_calls: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shard_size: u64::MAX,
            fail_uploads: Mutex::new(0),
            fail_connects: Mutex::new(0),
            state: Mutex::new(MemDestinationState::default()),
        }
    }

    pub fn with_shard_size(mut self, shard_size: u64) -> Self {
        self.shard_size = shard_size.max(1);
        self
    }

    /// Fails the next `times` uploads; `u32::MAX` fails every upload.
    pub fn fail_uploads(&self, times: u32) {
        *self.fail_uploads.lock().unwrap_or_else(|e| e.into_inner()) = times;
    }

    pub fn fail_connects(&self, times: u32) {
        *self.fail_connects.lock().unwrap_or_else(|e| e.into_inner()) = times;
    }

    pub fn uploads(&self) -> Vec<StoredUpload> {
        self.state().uploads.clone()
    }

    pub fn blob(&self, id: &str) -> Option<Vec<u8>> {
        self.state().blobs.get(id).cloned()
    }

    pub fn selected_namespace(&self) -> Option<String> {
        self.state().selected.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemDestinationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(counter: &Mutex<u32>) -> bool {
        let mut n = counter.lock().unwrap_or_else(|e| e.into_inner());
        if *n == 0 {
            return false;
        }
        if *n != u32::MAX {
            *n -= 1;
        }
        true
    }

    fn record(&self, receipt: &UploadReceipt, names: Vec<String>, size: u64) {
        let mut state = self.state();
        let namespace = state.selected.clone();
        state.uploads.push(StoredUpload {
            receipt: receipt.clone(),
            namespace,
            names,
            size,
        });
    }
}

impl DestinationAdapter for InMemoryDestination {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn connect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if Self::take(&self.fail_connects) {
                return Err(Error::Connection {
                    message: "injected connect failure".to_string(),
                });
            }
            self.connected.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::Relaxed);
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        })
    }

    fn upload_one<'a>(
        &'a self,
        unit: Unit,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt> {
        Box::pin(async move {
            self.upload_calls.fetch_add(1, Ordering::Relaxed);
            if Self::take(&self.fail_uploads) {
                return Err(Error::Transfer {
                    message: format!("injected upload failure: {}", unit.name),
                });
            }
            let id = content_id(&unit.bytes);
            let size = unit.size();
            progress(size, size);
            let receipt = UploadReceipt {
                locator: format!("mem://{id}"),
                id: id.clone(),
            };
            self.state().blobs.insert(id, unit.bytes);
            self.record(&receipt, vec![unit.name], size);
            Ok(receipt)
        })
    }

    fn upload_many<'a>(
        &'a self,
        units: Vec<Unit>,
        on_shard: ShardProgress<'a>,
    ) -> BoxFuture<'a, UploadReceipt> {
        Box::pin(async move {
            self.upload_calls.fetch_add(1, Ordering::Relaxed);
            if Self::take(&self.fail_uploads) {
                return Err(Error::Transfer {
                    message: format!("injected upload failure ({} units)", units.len()),
                });
            }
            let shards = plan_shards(&units, self.shard_size);
            let total_shards = shards.len() as u32;
            for (i, shard) in shards.into_iter().enumerate() {
                {
                    let mut state = self.state();
                    for unit in &units[shard] {
                        state.blobs.insert(content_id(&unit.bytes), unit.bytes.clone());
                    }
                }
                on_shard(i as u32 + 1, total_shards);
            }

            let manifest = serde_json::to_vec(&manifest_for(&units, total_shards))?;
            let id = content_id(&manifest);
            let receipt = UploadReceipt {
                locator: format!("mem://{id}"),
                id: id.clone(),
            };
            let size = units.iter().map(Unit::size).sum();
            let names = units.iter().map(|u| u.name.clone()).collect();
            self.state().blobs.insert(id, manifest);
            self.record(&receipt, names, size);
            Ok(receipt)
        })
    }

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Namespace> {
        Box::pin(async move {
            let ns = Namespace {
                id: format!("mem:{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
            };
            self.state().namespaces.push(ns.clone());
            Ok(ns)
        })
    }

    fn select_namespace<'a>(&'a self, id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state();
            if !state.namespaces.iter().any(|ns| ns.id == id) {
                return Err(Error::NotFound {
                    message: format!("space not found: {id}"),
                });
            }
            state.selected = Some(id.to_string());
            Ok(())
        })
    }

    fn list_namespaces(&self) -> BoxFuture<'_, Vec<Namespace>> {
        Box::pin(async move { Ok(self.state().namespaces.clone()) })
    }

    fn list_units<'a>(&'a self, namespace_id: &'a str) -> BoxFuture<'a, Vec<StoredUnit>> {
        Box::pin(async move {
            Ok(self
                .state()
                .uploads
                .iter()
                .filter(|u| u.namespace.as_deref() == Some(namespace_id))
                .map(|u| StoredUnit {
                    id: u.receipt.id.clone(),
                    size: u.size,
                })
                .collect())
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCollections {
    pub export_calls: AtomicUsize,
    collections: Vec<(String, Vec<serde_json::Value>)>,
    failures: Mutex<HashMap<String, u32>>,
}

impl InMemoryCollections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(
        mut self,
        name: impl Into<String>,
        docs: Vec<serde_json::Value>,
    ) -> Self {
        self.collections.push((name.into(), docs));
        self
    }

    /// Fails the next `times` exports of `name`; `u32::MAX` fails every export.
    pub fn fail_export(&self, name: impl Into<String>, times: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), times);
    }
}

impl CollectionSource for InMemoryCollections {
    fn provider(&self) -> &str {
        "test.mem"
    }

    fn list_collections(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.collections.iter().map(|(n, _)| n.clone()).collect()) })
    }

    fn export_collection<'a>(
        &'a self,
        name: &'a str,
        progress: ByteProgress<'a>,
    ) -> BoxFuture<'a, Unit> {
        Box::pin(async move {
            self.export_calls.fetch_add(1, Ordering::Relaxed);
            if take_failure(&self.failures, name) {
                return Err(Error::Transfer {
                    message: format!("injected export failure: {name}"),
                });
            }
            let docs = self
                .collections
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, docs)| docs)
                .ok_or_else(|| Error::NotFound {
                    message: format!("collection not found: {name}"),
                })?;

            let lines = docs
                .iter()
                .map(serde_json::to_vec)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let total = lines.iter().map(|l| l.len() as u64 + 1).sum();
            let mut bytes = Vec::with_capacity(total as usize);
            for line in lines {
                bytes.extend_from_slice(&line);
                bytes.push(b'\n');
                progress(bytes.len() as u64, total);
            }
            if bytes.is_empty() {
                progress(0, 0);
            }
            Ok(Unit::new(format!("{name}.ndjson"), bytes))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, size: usize) -> Unit {
        Unit::new(name, vec![0u8; size])
    }

    #[test]
    fn shards_pack_units_up_to_the_limit() {
        let units = vec![unit("a", 40), unit("b", 40), unit("c", 40), unit("d", 10)];
        assert_eq!(plan_shards(&units, 100), vec![0..2, 2..4]);
    }

    #[test]
    fn oversized_unit_gets_its_own_shard() {
        let units = vec![unit("a", 10), unit("big", 500), unit("c", 10)];
        assert_eq!(plan_shards(&units, 100), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn no_units_means_no_shards() {
        assert!(plan_shards(&[], 100).is_empty());
    }

    #[tokio::test]
    async fn memory_source_reports_every_chunk() {
        let src = InMemorySource::new()
            .with_chunk_size(4)
            .with_object("dir/a", b"0123456789".to_vec());
        let seen = Mutex::new(Vec::new());
        let cb = |done: u64, total: u64| seen.lock().unwrap().push((done, total));
        let unit = src.fetch("dir/a", &cb).await.unwrap();
        assert_eq!(unit.bytes, b"0123456789");
        assert_eq!(seen.into_inner().unwrap(), vec![(4, 10), (8, 10), (10, 10)]);
    }

    #[tokio::test]
    async fn memory_destination_shards_and_records_namespace() {
        let dest = InMemoryDestination::new().with_shard_size(10);
        let ns = dest.create_namespace("space").await.unwrap();
        dest.select_namespace(&ns.id).await.unwrap();

        let shards = Mutex::new(Vec::new());
        let cb = |i: u32, n: u32| shards.lock().unwrap().push((i, n));
        let receipt = dest
            .upload_many(vec![unit("a", 8), unit("b", 8), unit("c", 8)], &cb)
            .await
            .unwrap();

        assert_eq!(shards.into_inner().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
        let units = dest.list_units(&ns.id).await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, receipt.id);
        assert_eq!(units[0].size, 24);
    }
}
