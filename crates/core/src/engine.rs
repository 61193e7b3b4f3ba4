//! Migration orchestration: sequences source reads and destination writes,
//! feeds the [`ProgressManager`], and turns every outcome into a structured
//! [`UploadResult`] or [`SpaceResponse`].
//!
//! Phases of one migration call are strictly ordered:
//! `preparing -> download -> upload -> completed | error`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MigrationConfig;
use crate::connections::Connections;
use crate::progress::{
    MigrationPhase, MigrationProgress, MigrationStatus, ProgressManager, ProgressUpdate,
};
use crate::retry::{RetryPolicy, with_retry};
use crate::space_name::SpaceNameGenerator;
use crate::storage::{
    CollectionSource, Namespace, ShardProgress, SourceAdapter, StoredUnit, Unit, UploadReceipt,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationOptions<'a> {
    pub cancel: Option<&'a CancellationToken>,
}

/// Terminal outcome of one migration call. `cid`/`url`/`size` are set only
/// on success, `error` only on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResult {
    fn uploaded(receipt: UploadReceipt, size: u64) -> Self {
        Self {
            success: true,
            cid: Some(receipt.id),
            url: Some(receipt.locator),
            size: Some(size),
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            cid: None,
            url: None,
            size: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceResponse {
    pub success: bool,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpaceResponse {
    fn failed(id: &str, err: &Error) -> Self {
        Self {
            success: false,
            id: id.to_string(),
            name: None,
            error: Some(err.to_string()),
        }
    }
}

pub struct MigrationEngine {
    config: MigrationConfig,
    policy: RetryPolicy,
    connections: Connections,
    progress: ProgressManager,
    names: Mutex<SpaceNameGenerator>,
    current_space: Mutex<Option<String>>,
}

impl MigrationEngine {
    pub fn new(config: MigrationConfig, connections: Connections) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: RetryPolicy::from_config(&config.retry),
            names: Mutex::new(SpaceNameGenerator::new(config.space_name_prefix.clone())),
            config,
            connections,
            progress: ProgressManager::new(),
            current_space: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub async fn initialize(&self) -> Result<()> {
        self.initialize_with(MigrationOptions::default()).await
    }

    pub async fn initialize_with(&self, options: MigrationOptions<'_>) -> Result<()> {
        self.connections.open(&self.policy, options.cancel).await?;
        info!(
            event = "engine.initialized",
            destination = self.connections.destination().provider(),
            "engine.initialized"
        );
        Ok(())
    }

    /// Releases every adapter. Call it even when a migration failed.
    pub async fn close(&self) -> Result<()> {
        self.connections.close().await
    }

    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&MigrationProgress) + Send + Sync + 'static,
    {
        self.progress.on_progress(callback);
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&str, Option<&str>) + Send + Sync + 'static,
    {
        self.progress.on_error(callback);
    }

    pub fn on_file_complete<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.progress.on_file_complete(callback);
    }

    pub fn progress(&self) -> MigrationProgress {
        self.progress.snapshot()
    }

    pub fn current_space(&self) -> Option<String> {
        self.current_space
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn migrate_file(&self, key: &str) -> UploadResult {
        self.migrate_file_with(key, MigrationOptions::default()).await
    }

    pub async fn migrate_file_with(
        &self,
        key: &str,
        options: MigrationOptions<'_>,
    ) -> UploadResult {
        self.begin("file", key, 1);
        let source = match self.ensure_open().and_then(|_| self.connections.source()) {
            Ok(source) => source,
            Err(e) => return self.fail(&e, None),
        };

        let context = format!("migrate file {key}");
        let cancel = options.cancel;
        let outcome = with_retry(&self.policy, &context, cancel, move || {
            self.transfer_file(source, key, cancel)
        })
        .await;

        match outcome {
            Ok((receipt, size)) => {
                self.progress.file_complete(key);
                self.finish("file", key, receipt, size)
            }
            Err(e) => self.fail(&e, Some(key)),
        }
    }

    pub async fn migrate_directory(&self, prefix: &str) -> UploadResult {
        self.migrate_directory_with(prefix, MigrationOptions::default())
            .await
    }

    pub async fn migrate_directory_with(
        &self,
        prefix: &str,
        options: MigrationOptions<'_>,
    ) -> UploadResult {
        self.begin("directory", prefix, 0);
        match self.run_directory(prefix, options.cancel).await {
            Ok(result) => result,
            Err(e) => self.fail(&e, None),
        }
    }

    pub async fn migrate_collection(&self, name: Option<&str>) -> UploadResult {
        self.migrate_collection_with(name, MigrationOptions::default())
            .await
    }

    pub async fn migrate_collection_with(
        &self,
        name: Option<&str>,
        options: MigrationOptions<'_>,
    ) -> UploadResult {
        let label = name.unwrap_or("*");
        self.begin("collection", label, 0);
        match self.run_collections(name, options.cancel).await {
            Ok(result) => result,
            Err(e) => self.fail(&e, None),
        }
    }

    pub async fn create_space(&self) -> SpaceResponse {
        self.create_space_with(MigrationOptions::default()).await
    }

    /// Creates a namespace with a generated name and selects it.
    pub async fn create_space_with(&self, options: MigrationOptions<'_>) -> SpaceResponse {
        if let Err(e) = self.ensure_open() {
            return SpaceResponse::failed("", &e);
        }
        let name = self
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_name();
        let dest = self.connections.destination();
        let name_ref = name.as_str();

        let created = with_retry(
            &self.policy,
            &format!("create space {name}"),
            options.cancel,
            move || dest.create_namespace(name_ref),
        )
        .await;
        let ns = match created {
            Ok(ns) => ns,
            Err(e) => {
                error!(
                    event = "space.create_failed",
                    name = %name,
                    error = %e,
                    "space.create_failed"
                );
                return SpaceResponse::failed("", &e);
            }
        };

        if let Err(e) = self.select_space(&ns.id, options.cancel).await {
            error!(event = "space.select_failed", id = %ns.id, error = %e, "space.select_failed");
            return SpaceResponse::failed(&ns.id, &e);
        }

        info!(event = "space.created", id = %ns.id, name = %ns.name, "space.created");
        SpaceResponse {
            success: true,
            id: ns.id,
            name: Some(ns.name),
            error: None,
        }
    }

    pub async fn set_space(&self, id: &str) -> SpaceResponse {
        self.set_space_with(id, MigrationOptions::default()).await
    }

    pub async fn set_space_with(&self, id: &str, options: MigrationOptions<'_>) -> SpaceResponse {
        let selected = match self.ensure_open() {
            Ok(()) => self.select_space(id, options.cancel).await,
            Err(e) => Err(e),
        };
        match selected {
            Ok(()) => {
                info!(event = "space.selected", id, "space.selected");
                SpaceResponse {
                    success: true,
                    id: id.to_string(),
                    name: None,
                    error: None,
                }
            }
            Err(e) => {
                error!(event = "space.select_failed", id, error = %e, "space.select_failed");
                SpaceResponse::failed(id, &e)
            }
        }
    }

    pub async fn list_spaces(&self) -> Result<Vec<Namespace>> {
        self.list_spaces_with(MigrationOptions::default()).await
    }

    pub async fn list_spaces_with(&self, options: MigrationOptions<'_>) -> Result<Vec<Namespace>> {
        self.ensure_open()?;
        let dest = self.connections.destination();
        with_retry(&self.policy, "list spaces", options.cancel, move || {
            dest.list_namespaces()
        })
        .await
    }

    /// Units uploaded into `space_id`, or into the selected space when `None`.
    pub async fn list_uploads(&self, space_id: Option<&str>) -> Result<Vec<StoredUnit>> {
        self.list_uploads_with(space_id, MigrationOptions::default())
            .await
    }

    pub async fn list_uploads_with(
        &self,
        space_id: Option<&str>,
        options: MigrationOptions<'_>,
    ) -> Result<Vec<StoredUnit>> {
        self.ensure_open()?;
        let space = match space_id {
            Some(id) => id.to_string(),
            None => self.current_space().ok_or_else(|| Error::InvalidConfig {
                message: "no space selected; pass a space id or call set_space first".to_string(),
            })?,
        };
        let dest = self.connections.destination();
        let space_ref = space.as_str();
        with_retry(
            &self.policy,
            &format!("list uploads in {space}"),
            options.cancel,
            move || dest.list_units(space_ref),
        )
        .await
    }

    async fn select_space(&self, id: &str, cancel: Option<&CancellationToken>) -> Result<()> {
        let dest = self.connections.destination();
        with_retry(&self.policy, &format!("select space {id}"), cancel, move || {
            dest.select_namespace(id)
        })
        .await?;
        *self.current_space.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connections.is_open() {
            return Ok(());
        }
        Err(Error::Connection {
            message: "engine not initialized; call initialize() first".to_string(),
        })
    }

    fn begin(&self, kind: &str, target: &str, total_files: u64) {
        self.progress.reset();
        info!(event = "migration.start", kind, target, "migration.start");
        debug!(event = "migration.phase", phase = "preparing", "migration.phase");
        self.progress.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Preparing),
            phase: Some(MigrationPhase::Preparing),
            total_files: Some(total_files),
            ..ProgressUpdate::default()
        });
    }

    fn finish(&self, kind: &str, target: &str, receipt: UploadReceipt, size: u64) -> UploadResult {
        if !self.progress.snapshot().status.is_terminal() {
            self.progress.update_progress(ProgressUpdate {
                status: Some(MigrationStatus::Completed),
                ..ProgressUpdate::default()
            });
        }
        let snapshot = self.progress.snapshot();
        info!(
            event = "migration.completed",
            kind,
            target,
            id = %receipt.id,
            bytes = size,
            completed_files = snapshot.completed_files,
            failed_files = snapshot.failed_files,
            "migration.completed"
        );
        UploadResult::uploaded(receipt, size)
    }

    /// Terminal failure. `unit` is counted as a failed unit unless the
    /// operation was cancelled.
    fn fail(&self, err: &Error, unit: Option<&str>) -> UploadResult {
        let message = err.to_string();
        error!(
            event = "migration.failed",
            unit = unit.unwrap_or_default(),
            error = %message,
            "migration.failed"
        );
        if let Some(unit) = unit
            && !matches!(err, Error::Cancelled)
        {
            self.progress.record_error(&message, Some(unit));
        }
        self.progress.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Error),
            ..ProgressUpdate::default()
        });
        UploadResult::failed(message)
    }

    async fn transfer_file(
        &self,
        source: &dyn SourceAdapter,
        key: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<(UploadReceipt, u64)> {
        debug!(event = "migration.phase", phase = "download", key, "migration.phase");
        let reported = AtomicU64::new(0);
        let on_download = |done: u64, total: u64| {
            reported.store(done, Ordering::Relaxed);
            self.progress.update_progress(ProgressUpdate {
                status: Some(MigrationStatus::Downloading),
                phase: Some(MigrationPhase::Download),
                current_file: Some(key.to_string()),
                downloaded_bytes: Some(done),
                total_download_bytes: Some(total),
                total_upload_bytes: Some(total),
                ..ProgressUpdate::default()
            });
        };
        let unit = source.fetch(key, &on_download).await?;
        let size = unit.size();
        if reported.load(Ordering::Relaxed) != size {
            on_download(size, size);
        }

        if let Some(cancel) = cancel
            && cancel.is_cancelled()
        {
            return Err(Error::Cancelled);
        }

        debug!(event = "migration.phase", phase = "upload", key, "migration.phase");
        let upload_done = AtomicBool::new(false);
        let on_upload = |done: u64, total: u64| {
            if done >= total {
                upload_done.store(true, Ordering::Relaxed);
            }
            self.progress
                .update_file_progress(key, done, total, MigrationPhase::Upload);
        };
        let receipt = self
            .connections
            .destination()
            .upload_one(unit, &on_upload)
            .await?;
        if !upload_done.load(Ordering::Relaxed) {
            on_upload(size, size);
        }
        Ok((receipt, size))
    }

    async fn run_directory(
        &self,
        prefix: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<UploadResult> {
        self.ensure_open()?;
        let source = self.connections.source()?;

        let keys = with_retry(
            &self.policy,
            &format!("list prefix '{prefix}'"),
            cancel,
            move || source.list(prefix),
        )
        .await?;
        if keys.is_empty() {
            return Err(Error::NotFound {
                message: format!("no files found under prefix '{prefix}'"),
            });
        }

        let batch_size = self.config.batch_size;
        let concurrency = self.config.concurrency;
        let total_batches = keys.len().div_ceil(batch_size);
        self.progress.update_progress(ProgressUpdate {
            total_files: Some(keys.len() as u64),
            ..ProgressUpdate::default()
        });

        let measured = self.measure(source, &keys).await;
        debug!(
            event = "migration.measured",
            files = keys.len(),
            total_batches,
            bytes = measured.unwrap_or_default(),
            complete = measured.is_some(),
            "migration.measured"
        );

        debug!(event = "migration.phase", phase = "download", prefix, "migration.phase");
        self.progress.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Downloading),
            phase: Some(MigrationPhase::Download),
            total_download_bytes: measured,
            total_upload_bytes: measured,
            ..ProgressUpdate::default()
        });

        let downloaded = AtomicU64::new(0);
        let downloaded = &downloaded;
        let mut fetched_keys = Vec::new();
        let mut fetched = Vec::new();
        for (batch_index, batch) in keys.chunks(batch_size).enumerate() {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                return Err(Error::Cancelled);
            }
            debug!(
                event = "migration.batch",
                batch = batch_index + 1,
                total_batches,
                files = batch.len(),
                "migration.batch"
            );

            let results: Vec<(&String, Result<Unit>)> = stream::iter(batch)
                .map(|key| async move {
                    (key, self.fetch_unit(source, key, downloaded, cancel).await)
                })
                .buffered(concurrency)
                .collect()
                .await;

            for (key, result) in results {
                match result {
                    Ok(unit) => {
                        fetched_keys.push(key.clone());
                        fetched.push(unit);
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        error!(
                            event = "migration.fetch_failed",
                            key = %key,
                            error = %e,
                            "migration.fetch_failed"
                        );
                        self.progress.record_error(&e.to_string(), Some(key));
                    }
                }
            }
        }

        if fetched.is_empty() {
            return Err(Error::Transfer {
                message: format!("no files could be fetched under prefix '{prefix}'"),
            });
        }

        let (receipt, size) = self
            .upload_batch(
                &format!("upload directory '{prefix}'"),
                prefix,
                fetched_keys,
                fetched,
                cancel,
            )
            .await?;
        Ok(self.finish("directory", prefix, receipt, size))
    }

    /// Two-pass measurement: sizes of every key before any transfer starts.
    /// `None` when the source cannot size at least one key.
    async fn measure(&self, source: &dyn SourceAdapter, keys: &[String]) -> Option<u64> {
        let sizes: Vec<Option<u64>> = stream::iter(keys)
            .map(|key| async move {
                match source.size(key).await {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(
                            event = "migration.measure_failed",
                            key = %key,
                            error = %e,
                            "migration.measure_failed"
                        );
                        None
                    }
                }
            })
            .buffered(self.config.concurrency)
            .collect()
            .await;
        sizes.into_iter().sum()
    }

    /// Fetches one key with retry, adding its bytes to the shared
    /// `downloaded` counter. A failed attempt takes its partial bytes back.
    async fn fetch_unit(
        &self,
        source: &dyn SourceAdapter,
        key: &str,
        downloaded: &AtomicU64,
        cancel: Option<&CancellationToken>,
    ) -> Result<Unit> {
        let last = AtomicU64::new(0);
        let last = &last;
        let result = with_retry(&self.policy, &format!("fetch {key}"), cancel, move || {
            self.fetch_attempt(source, key, downloaded, last)
        })
        .await;

        match result {
            Ok(unit) => {
                let prev = last.swap(unit.size(), Ordering::SeqCst);
                if unit.size() != prev {
                    add_delta(downloaded, prev, unit.size());
                    self.report_download(key, downloaded);
                }
                Ok(unit)
            }
            Err(e) => {
                downloaded.fetch_sub(last.swap(0, Ordering::SeqCst), Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn fetch_attempt(
        &self,
        source: &dyn SourceAdapter,
        key: &str,
        downloaded: &AtomicU64,
        last: &AtomicU64,
    ) -> Result<Unit> {
        downloaded.fetch_sub(last.swap(0, Ordering::SeqCst), Ordering::SeqCst);
        let on_chunk = |done: u64, _total: u64| {
            let prev = last.swap(done, Ordering::SeqCst);
            add_delta(downloaded, prev, done);
            self.report_download(key, downloaded);
        };
        source.fetch(key, &on_chunk).await
    }

    fn report_download(&self, key: &str, downloaded: &AtomicU64) {
        self.progress.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Downloading),
            phase: Some(MigrationPhase::Download),
            current_file: Some(key.to_string()),
            downloaded_bytes: Some(downloaded.load(Ordering::SeqCst)),
            ..ProgressUpdate::default()
        });
    }

    async fn run_collections(
        &self,
        name: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<UploadResult> {
        self.ensure_open()?;
        let collections = self.connections.collections()?;

        let names = match name {
            Some(name) => vec![name.to_string()],
            None => {
                with_retry(&self.policy, "list collections", cancel, move || {
                    collections.list_collections()
                })
                .await?
            }
        };
        if names.is_empty() {
            return Err(Error::NotFound {
                message: "no collections found".to_string(),
            });
        }
        self.progress.update_progress(ProgressUpdate {
            total_files: Some(names.len() as u64),
            ..ProgressUpdate::default()
        });

        debug!(
            event = "migration.phase",
            phase = "download",
            collections = names.len(),
            "migration.phase"
        );
        let mut exported_names = Vec::new();
        let mut exported = Vec::new();
        let mut base = 0u64;
        for name in &names {
            if let Some(cancel) = cancel
                && cancel.is_cancelled()
            {
                return Err(Error::Cancelled);
            }
            let name = name.as_str();
            let result = with_retry(
                &self.policy,
                &format!("export collection {name}"),
                cancel,
                move || self.export_attempt(collections, name, base),
            )
            .await;
            match result {
                Ok(unit) => {
                    base += unit.size();
                    exported_names.push(name.to_string());
                    exported.push(unit);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    error!(
                        event = "migration.export_failed",
                        collection = name,
                        error = %e,
                        "migration.export_failed"
                    );
                    self.progress.record_error(&e.to_string(), Some(name));
                }
            }
        }

        if exported.is_empty() {
            return Err(Error::Transfer {
                message: "no collections could be exported".to_string(),
            });
        }

        let label = name.unwrap_or("*");
        let (receipt, size) = self
            .upload_batch("upload collections", label, exported_names, exported, cancel)
            .await?;
        Ok(self.finish("collection", label, receipt, size))
    }

    /// Export progress counts as the download phase, offset by the bytes of
    /// collections already exported.
    async fn export_attempt(
        &self,
        collections: &dyn CollectionSource,
        name: &str,
        base: u64,
    ) -> Result<Unit> {
        let on_chunk = |done: u64, total: u64| {
            let total = base + total.max(done);
            self.progress.update_progress(ProgressUpdate {
                status: Some(MigrationStatus::Downloading),
                phase: Some(MigrationPhase::Download),
                current_file: Some(name.to_string()),
                downloaded_bytes: Some(base + done),
                total_download_bytes: Some(total),
                total_upload_bytes: Some(total),
                ..ProgressUpdate::default()
            });
        };
        collections.export_collection(name, &on_chunk).await
    }

    /// Uploads `units` as one atomic destination write. On failure every unit
    /// is recorded as failed.
    async fn upload_batch(
        &self,
        context: &str,
        label: &str,
        keys: Vec<String>,
        units: Vec<Unit>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(UploadReceipt, u64)> {
        let total: u64 = units.iter().map(Unit::size).sum();
        debug!(
            event = "migration.phase",
            phase = "upload",
            units = units.len(),
            bytes = total,
            "migration.phase"
        );
        self.progress.update_progress(ProgressUpdate {
            status: Some(MigrationStatus::Uploading),
            phase: Some(MigrationPhase::Upload),
            current_file: Some(label.to_string()),
            downloaded_bytes: Some(total),
            total_download_bytes: Some(total),
            uploaded_bytes: Some(0),
            total_upload_bytes: Some(total),
            ..ProgressUpdate::default()
        });

        let upload_done = AtomicBool::new(false);
        let on_shard_fn = |index: u32, shards: u32| {
            let shards = shards.max(1);
            if index >= shards {
                upload_done.store(true, Ordering::Relaxed);
            }
            let uploaded = (total as u128 * index as u128 / shards as u128) as u64;
            self.progress.update_progress(ProgressUpdate {
                status: Some(MigrationStatus::Uploading),
                phase: Some(MigrationPhase::Upload),
                uploaded_bytes: Some(uploaded),
                current_shard_index: Some(index),
                total_shards: Some(shards),
                ..ProgressUpdate::default()
            });
        };
        let on_shard: ShardProgress<'_> = &on_shard_fn;
        let dest = self.connections.destination();
        let units = &units;

        let receipt = match with_retry(&self.policy, context, cancel, move || {
            dest.upload_many(units.clone(), on_shard)
        })
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                if !matches!(e, Error::Cancelled) {
                    let message = e.to_string();
                    for key in &keys {
                        self.progress.record_error(&message, Some(key));
                    }
                }
                return Err(e);
            }
        };

        if !upload_done.load(Ordering::Relaxed) {
            self.progress.update_progress(ProgressUpdate {
                uploaded_bytes: Some(total),
                ..ProgressUpdate::default()
            });
        }
        for key in &keys {
            self.progress.file_complete(key);
        }
        Ok((receipt, total))
    }
}

fn add_delta(counter: &AtomicU64, prev: u64, now: u64) {
    if now >= prev {
        counter.fetch_add(now - prev, Ordering::SeqCst);
    } else {
        counter.fetch_sub(prev - now, Ordering::SeqCst);
    }
}
