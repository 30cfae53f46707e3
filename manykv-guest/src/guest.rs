//! Guest request engine.
//!
//! A [`Guest`] issues database operations against a host over whatever stream
//! is currently attached with [`Guest::connect`]. Operations issued while no
//! stream is attached wait in the correlation table and are written once one
//! is.

use crate::config::GuestConfig;
use crate::error::GuestError;
use crate::idmap::IdMap;
use crate::iterator::{GuestIterator, IteratorShared};
use bytes::Bytes;
use manykv_protocol::{
    BatchOp, Encoder, ErrorCode, Input, IteratorOptions, Output, RangeOptions,
};
use manykv_storage::{Store, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};

/// Handle to a remote (or forwarded local) database. Cheap to clone.
#[derive(Clone)]
pub struct Guest {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: GuestConfig,
    pub(crate) state: Mutex<State>,
    /// Signalled whenever both correlation tables become empty.
    pub(crate) flushed: Notify,
}

pub(crate) struct State {
    pub(crate) requests: IdMap<PendingRequest>,
    pub(crate) iterators: IdMap<Arc<IteratorShared>>,
    pub(crate) outbound: Option<Outbound>,
    pub(crate) forward: Option<Arc<dyn Store>>,
    pub(crate) closed: bool,
    pub(crate) generation: u64,
}

/// Sender side of the attached stream's write queue.
pub(crate) struct Outbound {
    pub(crate) tx: mpsc::UnboundedSender<Bytes>,
    pub(crate) generation: u64,
}

impl Outbound {
    pub(crate) fn send(&self, frame: Bytes) {
        // The writer only goes away during teardown, which replays or fails
        // everything still registered.
        let _ = self.tx.send(frame);
    }

    pub(crate) fn send_input(&self, input: &Input) {
        match Encoder::encode_input(input) {
            Ok(frame) => self.send(frame),
            Err(e) => tracing::warn!(id = input.id(), error = %e, "Failed to encode message"),
        }
    }
}

pub(crate) struct PendingRequest {
    /// Encoded request, kept for replay on a new stream.
    pub(crate) frame: Bytes,
    pub(crate) reply: oneshot::Sender<Result<Reply, GuestError>>,
}

#[derive(Debug)]
pub(crate) enum Reply {
    Callback {
        error: Option<ErrorCode>,
        value: Option<Bytes>,
    },
    GetMany {
        error: Option<ErrorCode>,
        values: Vec<Option<Bytes>>,
    },
}

impl State {
    pub(crate) fn is_flushed(&self) -> bool {
        self.requests.is_empty() && self.iterators.is_empty()
    }

    /// Fails everything registered with `error`, restarting id issuing.
    pub(crate) fn abort_all(&mut self, error: impl Fn() -> GuestError) {
        for (_, request) in self.requests.drain_all() {
            let _ = request.reply.send(Err(error()));
        }
        for (_, iterator) in self.iterators.drain_all() {
            iterator.fail(error());
        }
    }
}

impl Guest {
    pub fn new(config: GuestConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    requests: IdMap::new(),
                    iterators: IdMap::new(),
                    outbound: None,
                    forward: None,
                    closed: false,
                    generation: 0,
                }),
                flushed: Notify::new(),
            }),
        }
    }

    /// Returns the guest configuration.
    pub fn config(&self) -> &GuestConfig {
        &self.inner.config
    }

    /// Returns whether a stream is attached.
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().outbound.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Serves every subsequent operation, iterators included, directly from
    /// `store` instead of a host.
    pub fn forward(&self, store: Arc<dyn Store>) {
        tracing::debug!("Forwarding operations to local store");
        self.inner.state.lock().forward = Some(store);
    }

    /// Closes the guest. Everything pending fails with `DATABASE_NOT_OPEN`,
    /// the attached stream is dropped and further operations are rejected.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        tracing::info!(
            requests = state.requests.len(),
            iterators = state.iterators.len(),
            "Closing guest"
        );
        state.closed = true;
        state.outbound = None;
        state.forward = None;
        state.abort_all(|| GuestError::NotOpen);
        drop(state);
        self.inner.flushed.notify_waiters();
    }

    /// Returns whether no request or iterator is outstanding.
    pub fn is_flushed(&self) -> bool {
        self.inner.state.lock().is_flushed()
    }

    /// Waits until no request or iterator is outstanding.
    pub async fn flushed(&self) {
        loop {
            let notified = self.inner.flushed.notified();
            if self.is_flushed() {
                return;
            }
            notified.await;
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Gets the value stored under `key`.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>, GuestError> {
        let key = key.into();
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.get(&key)).await;
        }
        let reply = self.request(|id| Input::Get { id, key }).await?;
        callback("get", reply)
    }

    /// Gets the values of several keys, in order.
    pub async fn get_many(&self, keys: Vec<Bytes>) -> Result<Vec<Option<Bytes>>, GuestError> {
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.get_many(&keys)).await;
        }
        match self.request(|id| Input::GetMany { id, keys }).await? {
            Reply::GetMany {
                error: Some(code), ..
            } => Err(GuestError::Remote {
                op: "get_many",
                code,
            }),
            Reply::GetMany { values, .. } => Ok(values),
            Reply::Callback { .. } => Err(GuestError::UnexpectedReply { op: "get_many" }),
        }
    }

    pub async fn put(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<(), GuestError> {
        let (key, value) = (key.into(), value.into());
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.put(key, value)).await;
        }
        let reply = self.request(|id| Input::Put { id, key, value }).await?;
        callback("put", reply).map(drop)
    }

    pub async fn delete(&self, key: impl Into<Bytes>) -> Result<(), GuestError> {
        let key = key.into();
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.delete(&key)).await;
        }
        let reply = self.request(|id| Input::Delete { id, key }).await?;
        callback("delete", reply).map(drop)
    }

    /// Applies the operations atomically.
    pub async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), GuestError> {
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.batch(ops)).await;
        }
        let reply = self.request(|id| Input::Batch { id, ops }).await?;
        callback("batch", reply).map(drop)
    }

    /// Deletes every entry selected by `range`.
    pub async fn clear(&self, range: RangeOptions) -> Result<(), GuestError> {
        if let Some(store) = self.local()? {
            return run_local(store, move |s| s.clear(&range)).await;
        }
        let reply = self
            .request(|id| Input::Clear { id, options: range })
            .await?;
        callback("clear", reply).map(drop)
    }

    /// Opens an iterator. Entries are fetched lazily as the iterator is polled.
    pub fn iterator(&self, options: IteratorOptions) -> Result<GuestIterator, GuestError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(GuestError::NotOpen);
        }
        if let Some(store) = state.forward.clone() {
            return Ok(GuestIterator::local(store, options));
        }

        let shared = Arc::new(IteratorShared::new(options));
        let id = state.iterators.add(shared.clone());
        if let Some(outbound) = &state.outbound {
            outbound.send_input(&shared.descriptor(id));
        }
        tracing::debug!(id, "Opened iterator");
        Ok(GuestIterator::remote(self.clone(), id, shared))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Returns the forwarded store, if any, after checking the guest is open.
    fn local(&self) -> Result<Option<Arc<dyn Store>>, GuestError> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(GuestError::NotOpen);
        }
        Ok(state.forward.clone())
    }

    /// Registers a request and writes it to the attached stream, if any.
    async fn request(&self, build: impl FnOnce(u32) -> Input) -> Result<Reply, GuestError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(GuestError::NotOpen);
            }
            let id = state.requests.try_add_with(|id| {
                let frame = Encoder::encode_input(&build(id))?;
                Ok::<_, GuestError>(PendingRequest { frame, reply: tx })
            })?;

            let frame = state.requests.get(id).map(|r| r.frame.clone());
            if let (Some(outbound), Some(frame)) = (&state.outbound, frame) {
                tracing::trace!(id, "Sending request");
                outbound.send(frame);
            }
        }

        rx.await.map_err(|_| GuestError::ConnectionLost)?
    }

    /// Writes a message to the attached stream. Dropped when there is none;
    /// iterator state is replayed in full on the next connect.
    pub(crate) fn send(&self, input: &Input) {
        if let Some(outbound) = &self.inner.state.lock().outbound {
            outbound.send_input(input);
        }
    }

    /// Removes an iterator from the table, unless the id now belongs to
    /// another iterator.
    pub(crate) fn release_iterator(&self, id: u32, shared: &Arc<IteratorShared>) {
        let mut state = self.inner.state.lock();
        let owned = matches!(state.iterators.get(id), Some(s) if Arc::ptr_eq(s, shared));
        if !owned {
            return;
        }
        state.iterators.remove(id);
        if let Some(outbound) = &state.outbound {
            outbound.send_input(&Input::IteratorClose { id });
        }
        let flushed = state.is_flushed();
        drop(state);

        tracing::debug!(id, "Closed iterator");
        if flushed {
            self.inner.flushed.notify_waiters();
        }
    }

    /// Routes a host message to the request or iterator it belongs to.
    pub(crate) fn dispatch(&self, output: Output) {
        match output {
            Output::Callback { id, error, value } => {
                self.resolve(id, Reply::Callback { error, value });
            }
            Output::GetManyCallback { id, error, values } => {
                self.resolve(id, Reply::GetMany { error, values });
            }
            Output::IteratorData { id, seq, entries } => {
                if let Some(iterator) = self.find_iterator(id) {
                    iterator.on_data(id, seq, entries);
                }
            }
            Output::IteratorEnd { id, seq } => {
                if let Some(iterator) = self.find_iterator(id) {
                    iterator.on_end(id, seq);
                }
            }
            Output::IteratorError { id, seq, error } => {
                if let Some(iterator) = self.find_iterator(id) {
                    iterator.on_error(id, seq, error);
                }
            }
        }
    }

    fn resolve(&self, id: u32, reply: Reply) {
        let mut state = self.inner.state.lock();
        let pending = state.requests.remove(id);
        let flushed = state.is_flushed();
        drop(state);

        match pending {
            Some(request) => {
                let _ = request.reply.send(Ok(reply));
            }
            None => tracing::debug!(id, "Reply for unknown request"),
        }
        if flushed {
            self.inner.flushed.notify_waiters();
        }
    }

    fn find_iterator(&self, id: u32) -> Option<Arc<IteratorShared>> {
        let iterator = self.inner.state.lock().iterators.get(id).cloned();
        if iterator.is_none() {
            tracing::debug!(id, "Message for unknown iterator");
        }
        iterator
    }
}

impl Default for Guest {
    fn default() -> Self {
        Self::new(GuestConfig::default())
    }
}

fn callback(op: &'static str, reply: Reply) -> Result<Option<Bytes>, GuestError> {
    match reply {
        Reply::Callback {
            error: Some(code), ..
        } => Err(GuestError::Remote { op, code }),
        Reply::Callback { value, .. } => Ok(value),
        Reply::GetMany { .. } => Err(GuestError::UnexpectedReply { op }),
    }
}

/// Runs a call against a forwarded store on the blocking pool.
async fn run_local<T, F>(store: Arc<dyn Store>, call: F) -> Result<T, GuestError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(std::io::Error::from)?;
    Ok(result?)
}
