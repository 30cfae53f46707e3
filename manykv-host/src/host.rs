//! The host: one store served to any number of guest streams.

use crate::error::HostError;
use crate::session::Session;
use manykv_protocol::BatchOp;
use manykv_storage::{Store, StoreError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

/// Default high-water mark of a stream's write buffer.
pub const DEFAULT_WRITE_HIGH_WATER_MARK: usize = 16 * 1024;

/// Buffer size of streams returned by [`Host::create_stream`].
const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Called before a put is applied. An error vetoes the write.
pub type PutHook = Arc<dyn Fn(&[u8], &[u8]) -> Result<(), StoreError> + Send + Sync>;

/// Called before a delete is applied. An error vetoes the write.
pub type DelHook = Arc<dyn Fn(&[u8]) -> Result<(), StoreError> + Send + Sync>;

/// Called before a batch is applied. An error vetoes the whole batch.
pub type BatchHook = Arc<dyn Fn(&[BatchOp]) -> Result<(), StoreError> + Send + Sync>;

/// Host options.
#[derive(Clone)]
pub struct HostOptions {
    /// Rejects put, delete, batch and clear with a `READONLY` error.
    pub readonly: bool,
    pub preput: Option<PutHook>,
    pub predel: Option<DelHook>,
    pub prebatch: Option<BatchHook>,
    /// Write buffer level at which iterators stop reading ahead.
    pub write_high_water_mark: usize,
}

impl std::fmt::Debug for HostOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostOptions")
            .field("readonly", &self.readonly)
            .field("preput", &self.preput.is_some())
            .field("predel", &self.predel.is_some())
            .field("prebatch", &self.prebatch.is_some())
            .field("write_high_water_mark", &self.write_high_water_mark)
            .finish()
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            preput: None,
            predel: None,
            prebatch: None,
            write_high_water_mark: DEFAULT_WRITE_HIGH_WATER_MARK,
        }
    }
}

impl HostOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_preput<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.preput = Some(Arc::new(hook));
        self
    }

    pub fn with_predel<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[u8]) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.predel = Some(Arc::new(hook));
        self
    }

    pub fn with_prebatch<F>(mut self, hook: F) -> Self
    where
        F: Fn(&[BatchOp]) -> Result<(), StoreError> + Send + Sync + 'static,
    {
        self.prebatch = Some(Arc::new(hook));
        self
    }

    pub fn with_write_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_high_water_mark = bytes.max(1);
        self
    }
}

struct HostInner {
    store: Arc<dyn Store>,
    options: HostOptions,
}

/// Serves a store to guests. Cloning is cheap; clones share the store.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Host {
    pub fn new(store: Arc<dyn Store>, options: HostOptions) -> Self {
        Self {
            inner: Arc::new(HostInner { store, options }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.options.readonly
    }

    /// Serves one guest stream until the guest closes it or a framing error
    /// ends it. Iterators opened on the stream are released either way.
    pub async fn serve<S>(&self, stream: S) -> Result<(), HostError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::run(self.clone(), stream).await
    }

    /// Returns the guest end of an in-memory stream served by this host.
    ///
    /// Must be called within a Tokio runtime.
    pub fn create_stream(&self) -> DuplexStream {
        let (guest_end, host_end) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let host = self.clone();
        tokio::spawn(async move {
            if let Err(e) = host.serve(host_end).await {
                tracing::warn!(error = %e, "In-memory stream failed");
            }
        });
        guest_end
    }

    pub(crate) fn check_put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match &self.inner.options.preput {
            Some(hook) => hook(key, value),
            None => Ok(()),
        }
    }

    pub(crate) fn check_del(&self, key: &[u8]) -> Result<(), StoreError> {
        match &self.inner.options.predel {
            Some(hook) => hook(key),
            None => Ok(()),
        }
    }

    pub(crate) fn check_batch(&self, ops: &[BatchOp]) -> Result<(), StoreError> {
        match &self.inner.options.prebatch {
            Some(hook) => hook(ops),
            None => Ok(()),
        }
    }
}
