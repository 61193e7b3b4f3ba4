use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::retry::{RetryPolicy, with_retry};
use crate::storage::{CollectionSource, DestinationAdapter, SourceAdapter};
use crate::{Error, Result};

/// Owns the adapters of one engine and their connection state.
pub struct Connections {
    destination: Arc<dyn DestinationAdapter>,
    source: Option<Arc<dyn SourceAdapter>>,
    collections: Option<Arc<dyn CollectionSource>>,
    open: AtomicBool,
}

impl Connections {
    pub fn new(destination: Arc<dyn DestinationAdapter>) -> Self {
        Self {
            destination,
            source: None,
            collections: None,
            open: AtomicBool::new(false),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_collections(mut self, collections: Arc<dyn CollectionSource>) -> Self {
        self.collections = Some(collections);
        self
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Connects every adapter, retrying each connect with `policy`.
    pub async fn open(
        &self,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        if let Some(source) = &self.source {
            let context = format!("connect source {}", source.provider());
            with_retry(policy, &context, cancel, || source.connect())
                .await
                .map_err(connection_error)?;
        }
        if let Some(collections) = &self.collections {
            let context = format!("connect collections {}", collections.provider());
            with_retry(policy, &context, cancel, || collections.connect())
                .await
                .map_err(connection_error)?;
        }
        let context = format!("connect destination {}", self.destination.provider());
        with_retry(policy, &context, cancel, || self.destination.connect())
            .await
            .map_err(connection_error)?;

        self.open.store(true, Ordering::Release);
        debug!(event = "connections.open", "connections.open");
        Ok(())
    }

    /// Closes every adapter, even when an earlier close fails, and reports
    /// the first failure. Safe to call repeatedly or without a prior `open`.
    pub async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        let mut first_err = None;

        if let Some(source) = &self.source
            && let Err(e) = source.close().await
        {
            error!(
                event = "connections.close_failed",
                adapter = "source",
                error = %e,
                "connections.close_failed"
            );
            first_err.get_or_insert(e);
        }
        if let Some(collections) = &self.collections
            && let Err(e) = collections.close().await
        {
            error!(
                event = "connections.close_failed",
                adapter = "collections",
                error = %e,
                "connections.close_failed"
            );
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.destination.close().await {
            error!(
                event = "connections.close_failed",
                adapter = "destination",
                error = %e,
                "connections.close_failed"
            );
            first_err.get_or_insert(e);
        }

        debug!(event = "connections.closed", "connections.closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn destination(&self) -> &dyn DestinationAdapter {
        self.destination.as_ref()
    }

    pub fn source(&self) -> Result<&dyn SourceAdapter> {
        self.source.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: "no source adapter configured".to_string(),
        })
    }

    pub fn collections(&self) -> Result<&dyn CollectionSource> {
        self.collections.as_deref().ok_or_else(|| Error::InvalidConfig {
            message: "no collection source configured".to_string(),
        })
    }
}

fn connection_error(e: Error) -> Error {
    match e {
        Error::InvalidConfig { .. } | Error::Cancelled | Error::Connection { .. } => e,
        other => Error::Connection {
            message: other.to_string(),
        },
    }
}
