//! One served guest stream.
//!
//! A session reads guest messages, runs requests on the blocking pool and
//! drives the stream's iterators. Replies are written in completion order, not
//! request order; every reply carries the id of the request it answers.

use crate::error::HostError;
use crate::host::Host;
use crate::iterator::{resume_target, Completion, HostIterator, Read, SeekTarget};
use bytes::Bytes;
use manykv_protocol::{Decoder, Encoder, ErrorCode, Input, IteratorOptions, Output, ProtocolError};
use manykv_storage::{Cursor, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Result of an iterator read, sent back to the session.
struct ReadDone {
    id: u32,
    token: u64,
    /// The cursor the read took, if it took one.
    cursor: Option<Box<dyn Cursor>>,
    result: Result<Vec<(Bytes, Bytes)>, ErrorCode>,
}

/// Write side of a session. Tracks how many bytes are queued but not yet
/// written, which bounds iterator read-ahead.
#[derive(Clone)]
struct Outbound {
    tx: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
}

impl Outbound {
    fn send(&self, frame: Bytes) {
        let len = frame.len();
        self.queued.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(frame).is_err() {
            // Session already ended
            self.queued.fetch_sub(len, Ordering::Relaxed);
        }
    }

    /// Sends a reply. A reply too large for one frame is replaced by a
    /// `REMOTE_ERROR` reply to the same message.
    fn reply(&self, output: &Output) {
        let e = match Encoder::encode_output(output) {
            Ok(frame) => return self.send(frame),
            Err(e) => e,
        };
        tracing::warn!(id = output.id(), error = %e, "Reply too large to send");

        let error = Some(ErrorCode::RemoteError);
        let fallback = match output {
            Output::Callback { id, .. } => Output::Callback {
                id: *id,
                error,
                value: None,
            },
            Output::GetManyCallback { id, .. } => Output::GetManyCallback {
                id: *id,
                error,
                values: Vec::new(),
            },
            Output::IteratorData { id, seq, .. }
            | Output::IteratorError { id, seq, .. }
            | Output::IteratorEnd { id, seq } => Output::IteratorError {
                id: *id,
                seq: *seq,
                error: ErrorCode::RemoteError,
            },
        };
        if let Ok(frame) = Encoder::encode_output(&fallback) {
            self.send(frame);
        }
    }

    /// Free space below the high-water mark.
    fn room(&self, high_water_mark: usize) -> usize {
        high_water_mark.saturating_sub(self.queued.load(Ordering::Relaxed))
    }
}

pub(crate) struct Session {
    id: Uuid,
    host: Host,
    iterators: HashMap<u32, HostIterator>,
    next_token: u64,
    outbound: Outbound,
    events: mpsc::UnboundedSender<ReadDone>,
}

impl Session {
    /// Serves `stream` until the guest closes it, the transport fails or a
    /// framing error makes the byte stream unusable.
    pub(crate) async fn run<S>(host: Host, stream: S) -> Result<(), HostError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        let mut session = Session {
            id: Uuid::new_v4(),
            host,
            iterators: HashMap::new(),
            next_token: 0,
            outbound: Outbound {
                tx: out_tx,
                queued: queued.clone(),
            },
            events: events_tx,
        };
        tracing::info!(session = %session.id, "Session started");

        let (mut reader, writer) = tokio::io::split(stream);
        let writer = write_loop(writer, out_rx, queued);
        tokio::pin!(writer);

        let mut decoder = Decoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = loop {
            tokio::select! {
                result = &mut writer => break result,

                Some(done) = events_rx.recv() => session.on_read_done(done),

                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(session = %session.id, "Stream closed by guest");
                        break Ok(());
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        if let Err(e) = session.drain(&mut decoder) {
                            break Err(e.into());
                        }
                    }
                    Err(e) => break Err(e.into()),
                },
            }
        };

        if let Err(e) = &result {
            tracing::warn!(session = %session.id, error = %e, "Session failed");
        }
        result
    }

    fn drain(&mut self, decoder: &mut Decoder) -> Result<(), ProtocolError> {
        while let Some(input) = decoder.decode_input()? {
            self.dispatch(input);
        }
        Ok(())
    }

    fn dispatch(&mut self, input: Input) {
        tracing::trace!(session = %self.id, id = input.id(), tag = input.tag(), "Received message");

        match input {
            Input::Get { id, key } => {
                self.call(move |host| callback(id, "get", host.store().get(&key)));
            }
            Input::GetMany { id, keys } => {
                self.call(move |host| match host.store().get_many(&keys) {
                    Ok(values) => Output::GetManyCallback {
                        id,
                        error: None,
                        values,
                    },
                    Err(e) => {
                        tracing::debug!(id, error = %e, "get_many failed");
                        Output::GetManyCallback {
                            id,
                            error: Some(e.wire_code()),
                            values: Vec::new(),
                        }
                    }
                });
            }
            Input::Put { id, key, value } => {
                if self.reject_write(id) {
                    return;
                }
                self.call(move |host| {
                    let result = host
                        .check_put(&key, &value)
                        .and_then(|()| host.store().put(key, value));
                    callback(id, "put", result.map(|()| None))
                });
            }
            Input::Delete { id, key } => {
                if self.reject_write(id) {
                    return;
                }
                self.call(move |host| {
                    let result = host
                        .check_del(&key)
                        .and_then(|()| host.store().delete(&key));
                    callback(id, "delete", result.map(|()| None))
                });
            }
            Input::Batch { id, ops } => {
                if self.reject_write(id) {
                    return;
                }
                self.call(move |host| {
                    let result = host
                        .check_batch(&ops)
                        .and_then(|()| host.store().batch(ops));
                    callback(id, "batch", result.map(|()| None))
                });
            }
            Input::Clear { id, options } => {
                if self.reject_write(id) {
                    return;
                }
                self.call(move |host| callback(id, "clear", host.store().clear(&options).map(|()| None)));
            }
            Input::Iterator {
                id,
                seq,
                options,
                consumed,
                bookmark,
                seek,
            } => self.open_iterator(id, seq, options, consumed, bookmark, seek),
            Input::IteratorAck { id, seq, consumed } => {
                let room = self.room();
                let Some(it) = self.iterators.get_mut(&id) else {
                    return;
                };
                if !it.ack(seq, consumed) {
                    tracing::trace!(id, seq, current = it.seq, "Ignoring stale ack");
                    return;
                }
                if let Some(read) = it.next(false, room) {
                    spawn_read(&self.events, id, it.token, read);
                }
            }
            Input::IteratorSeek { id, seq, target } => {
                let Some(it) = self.iterators.get_mut(&id) else {
                    return;
                };
                if let Some(read) = it.seek(seq, SeekTarget::Key(target)) {
                    spawn_read(&self.events, id, it.token, read);
                }
            }
            Input::IteratorClose { id } => {
                if let Some(it) = self.iterators.remove(&id) {
                    tracing::debug!(session = %self.id, id, "Iterator closed");
                    it.close();
                }
            }
        }
    }

    /// Runs a request on the blocking pool and sends its reply.
    fn call<F>(&self, work: F)
    where
        F: FnOnce(&Host) -> Output + Send + 'static,
    {
        let host = self.host.clone();
        let outbound = self.outbound.clone();
        tokio::task::spawn_blocking(move || {
            let output = work(&host);
            outbound.reply(&output);
        });
    }

    /// Answers a write with `READONLY` if the host is read-only.
    fn reject_write(&self, id: u32) -> bool {
        if !self.host.is_readonly() {
            return false;
        }
        self.outbound.reply(&Output::Callback {
            id,
            error: Some(ErrorCode::Readonly),
            value: None,
        });
        true
    }

    fn room(&self) -> usize {
        self.outbound
            .room(self.host.options().write_high_water_mark)
    }

    fn open_iterator(
        &mut self,
        id: u32,
        seq: u32,
        options: IteratorOptions,
        consumed: u64,
        bookmark: Option<Bytes>,
        seek: Option<Bytes>,
    ) {
        if self.iterators.contains_key(&id) {
            tracing::debug!(session = %self.id, id, "Iterator id already open");
            return;
        }

        let cursor = match self.host.store().iterator(&options.range) {
            Ok(cursor) => Some(cursor),
            Err(e) => {
                tracing::debug!(session = %self.id, id, error = %e, "Failed to open cursor");
                self.outbound.reply(&Output::IteratorError {
                    id,
                    seq,
                    error: e.wire_code(),
                });
                None
            }
        };
        let opened = cursor.is_some();

        self.next_token += 1;
        let token = self.next_token;
        let mut it = HostIterator::new(id, token, seq, &options, consumed, cursor);
        tracing::debug!(
            session = %self.id,
            id,
            seq,
            consumed,
            resumed = bookmark.is_some() || seek.is_some(),
            "Iterator opened"
        );

        let read = if !opened {
            None
        } else if let Some(target) = seek {
            it.seek(seq, SeekTarget::Key(target))
        } else if let Some(bookmark) = bookmark {
            it.seek(seq, resume_target(&bookmark, options.range.reverse))
        } else {
            it.next(true, self.room())
        };

        self.iterators.insert(id, it);
        if let Some(read) = read {
            spawn_read(&self.events, id, token, read);
        }
    }

    fn on_read_done(&mut self, done: ReadDone) {
        let ReadDone {
            id,
            token,
            cursor,
            result,
        } = done;

        // The iterator was closed, or its id reused, while the read ran
        let Some(it) = self.iterators.get_mut(&id).filter(|it| it.token == token) else {
            if let Some(mut cursor) = cursor {
                cursor.close();
            }
            return;
        };

        match it.complete(cursor, result) {
            Completion::Reseek(read) => {
                if let Some(read) = read {
                    spawn_read(&self.events, id, token, read);
                }
            }
            Completion::Send { frame, read_ahead } => {
                self.outbound.send(frame);
                if read_ahead {
                    let room = self
                        .outbound
                        .room(self.host.options().write_high_water_mark);
                    if let Some(read) = it.next(false, room) {
                        spawn_read(&self.events, id, token, read);
                    }
                }
            }
        }
    }

    /// Releases every iterator. Cursors held by running reads are closed when
    /// those reads return. Runs on drop, so a cancelled session cleans up too.
    fn teardown(&mut self) {
        let count = self.iterators.len();
        for (_, it) in self.iterators.drain() {
            it.close();
        }
        tracing::info!(session = %self.id, iterators = count, "Session ended");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn callback(id: u32, op: &'static str, result: Result<Option<Bytes>, StoreError>) -> Output {
    match result {
        Ok(value) => Output::Callback {
            id,
            error: None,
            value,
        },
        Err(e) => {
            tracing::debug!(id, op, error = %e, "Request failed");
            Output::Callback {
                id,
                error: Some(e.wire_code()),
                value: None,
            }
        }
    }
}

fn spawn_read(events: &mpsc::UnboundedSender<ReadDone>, id: u32, token: u64, read: Read) {
    match read {
        Read::Empty => {
            let _ = events.send(ReadDone {
                id,
                token,
                cursor: None,
                result: Ok(Vec::new()),
            });
        }
        Read::Cursor { mut cursor, size } => {
            let events = events.clone();
            tokio::task::spawn_blocking(move || {
                let result = cursor.next_batch(size).map_err(|e| {
                    tracing::debug!(id, error = %e, "Iterator read failed");
                    e.wire_code()
                });
                let done = ReadDone {
                    id,
                    token,
                    cursor: Some(cursor),
                    result,
                };
                if let Err(mpsc::error::SendError(done)) = events.send(done) {
                    if let Some(mut cursor) = done.cursor {
                        cursor.close();
                    }
                }
            });
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        queued.fetch_sub(frame.len(), Ordering::Relaxed);
        while let Ok(frame) = rx.try_recv() {
            writer.write_all(&frame).await?;
            queued.fetch_sub(frame.len(), Ordering::Relaxed);
        }
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostOptions;
    use manykv_protocol::{BatchOp, Entry, RangeOptions};
    use manykv_storage::{MemoryStore, Store};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    /// Speaks the wire protocol directly, without the guest library.
    struct RawGuest {
        stream: DuplexStream,
        decoder: Decoder,
        buf: Vec<u8>,
    }

    impl RawGuest {
        fn new(host: &Host) -> Self {
            Self {
                stream: host.create_stream(),
                decoder: Decoder::new(),
                buf: vec![0u8; 8192],
            }
        }

        async fn send(&mut self, input: Input) {
            let frame = Encoder::encode_input(&input).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn read_output(&mut self) -> Option<Output> {
            loop {
                if let Some(output) = self.decoder.decode_output().unwrap() {
                    return Some(output);
                }
                let n = self.stream.read(&mut self.buf).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.decoder.extend(&self.buf[..n]);
            }
        }

        async fn recv(&mut self) -> Output {
            timeout(Duration::from_secs(5), self.read_output())
                .await
                .expect("timed out waiting for the host")
                .expect("host closed the stream")
        }

        async fn recv_within(&mut self, wait: Duration) -> Option<Output> {
            timeout(wait, self.read_output()).await.ok().flatten()
        }
    }

    fn store_with(n: usize, value_len: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            store
                .put(format!("{i:04}").into(), Bytes::from(vec![b'v'; value_len]))
                .unwrap();
        }
        store
    }

    fn open(id: u32, options: IteratorOptions) -> Input {
        Input::Iterator {
            id,
            seq: 0,
            options,
            consumed: 0,
            bookmark: None,
            seek: None,
        }
    }

    fn entries(output: Output) -> Vec<Entry> {
        match output {
            Output::IteratorData { entries, .. } => entries,
            other => panic!("expected iterator data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let host = Host::new(Arc::new(MemoryStore::new()), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest
            .send(Input::Put {
                id: 1,
                key: "hello".into(),
                value: "world".into(),
            })
            .await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 1,
                error: None,
                value: None
            }
        );

        guest.send(Input::Get { id: 2, key: "hello".into() }).await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 2,
                error: None,
                value: Some("world".into())
            }
        );

        guest.send(Input::Delete { id: 3, key: "hello".into() }).await;
        guest.recv().await;
        guest
            .send(Input::GetMany {
                id: 4,
                keys: vec!["hello".into(), "other".into()],
            })
            .await;
        assert_eq!(
            guest.recv().await,
            Output::GetManyCallback {
                id: 4,
                error: None,
                values: vec![None, None]
            }
        );
    }

    #[tokio::test]
    async fn test_readonly_rejects_writes() {
        let store = Arc::new(MemoryStore::new());
        store.put("hello".into(), "verden".into()).unwrap();
        let host = Host::new(store.clone(), HostOptions::new().with_readonly(true));
        let mut guest = RawGuest::new(&host);

        let writes = [
            Input::Put {
                id: 1,
                key: "hello".into(),
                value: "world".into(),
            },
            Input::Delete { id: 2, key: "hello".into() },
            Input::Batch {
                id: 3,
                ops: vec![BatchOp::del("hello")],
            },
            Input::Clear {
                id: 4,
                options: RangeOptions::new(),
            },
        ];
        for (i, write) in writes.into_iter().enumerate() {
            guest.send(write).await;
            assert_eq!(
                guest.recv().await,
                Output::Callback {
                    id: i as u32 + 1,
                    error: Some(ErrorCode::Readonly),
                    value: None
                }
            );
        }

        guest.send(Input::Get { id: 5, key: "hello".into() }).await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 5,
                error: None,
                value: Some("verden".into())
            }
        );
    }

    #[tokio::test]
    async fn test_hooks_veto_writes() {
        let store = Arc::new(MemoryStore::new());
        let options = HostOptions::new()
            .with_preput(|key, _| {
                if key == b"locked" {
                    Err(StoreError::coded(ErrorCode::NotSupported, "locked"))
                } else {
                    Ok(())
                }
            })
            .with_prebatch(|ops| {
                if ops.len() > 2 {
                    Err(StoreError::other("batch too big"))
                } else {
                    Ok(())
                }
            });
        let host = Host::new(store.clone(), options);
        let mut guest = RawGuest::new(&host);

        guest
            .send(Input::Put {
                id: 1,
                key: "locked".into(),
                value: "x".into(),
            })
            .await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 1,
                error: Some(ErrorCode::NotSupported),
                value: None
            }
        );

        guest
            .send(Input::Batch {
                id: 2,
                ops: vec![BatchOp::put("a", "1"), BatchOp::put("b", "2"), BatchOp::put("c", "3")],
            })
            .await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 2,
                error: Some(ErrorCode::RemoteError),
                value: None
            }
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_iterator_flow_control() {
        let host = Host::new(store_with(200, 1024), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest.send(open(1, IteratorOptions::new())).await;
        assert_eq!(entries(guest.recv().await).len(), 1);
        assert!(guest.recv_within(Duration::from_millis(200)).await.is_none());

        guest
            .send(Input::IteratorAck {
                id: 1,
                seq: 0,
                consumed: 1,
            })
            .await;
        let second = entries(guest.recv().await);
        let third = entries(guest.recv().await);
        assert!(!second.is_empty() && !third.is_empty());
        assert_eq!(second[0].key, Bytes::from("0001"));

        // Two batches unacknowledged: the host stops reading
        assert!(guest.recv_within(Duration::from_millis(300)).await.is_none());

        // An ack for an old sequence changes nothing
        guest
            .send(Input::IteratorAck {
                id: 1,
                seq: 9,
                consumed: 50,
            })
            .await;
        assert!(guest.recv_within(Duration::from_millis(200)).await.is_none());

        let consumed = 1 + second.len() as u64;
        guest
            .send(Input::IteratorAck {
                id: 1,
                seq: 0,
                consumed,
            })
            .await;
        let fourth = entries(guest.recv().await);
        assert_eq!(
            fourth[0].key,
            Bytes::from(format!("{:04}", consumed + third.len() as u64))
        );
    }

    #[tokio::test]
    async fn test_iterator_resume_and_limit() {
        let host = Host::new(store_with(20, 4), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest
            .send(Input::Iterator {
                id: 7,
                seq: 3,
                options: IteratorOptions::new().with_limit(5),
                consumed: 2,
                bookmark: Some("0009".into()),
                seek: None,
            })
            .await;

        let mut keys = Vec::new();
        let mut consumed = 2;
        loop {
            match guest.recv().await {
                Output::IteratorData { seq, entries, .. } => {
                    assert_eq!(seq, 3);
                    consumed += entries.len() as u64;
                    keys.extend(entries.into_iter().map(|e| e.key));
                    guest
                        .send(Input::IteratorAck { id: 7, seq: 3, consumed })
                        .await;
                }
                Output::IteratorEnd { id, seq } => {
                    assert_eq!((id, seq), (7, 3));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        let expected: Vec<Bytes> = ["0010", "0011", "0012"].map(Bytes::from).to_vec();
        assert_eq!(keys, expected);
    }

    #[tokio::test]
    async fn test_iterator_reverse_empty_bookmark_ends() {
        let host = Host::new(store_with(5, 4), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest
            .send(Input::Iterator {
                id: 1,
                seq: 0,
                options: IteratorOptions::new().with_reverse(true),
                consumed: 0,
                bookmark: Some(Bytes::new()),
                seek: None,
            })
            .await;
        assert_eq!(guest.recv().await, Output::IteratorEnd { id: 1, seq: 0 });
    }

    #[tokio::test]
    async fn test_seek_and_close() {
        let host = Host::new(store_with(100, 4), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest.send(open(1, IteratorOptions::new().keys_only())).await;
        guest.recv().await;

        guest
            .send(Input::IteratorSeek {
                id: 1,
                seq: 1,
                target: "0050".into(),
            })
            .await;
        match guest.recv().await {
            Output::IteratorData { seq, entries, .. } => {
                assert_eq!(seq, 1);
                assert_eq!(entries, vec![Entry::new("0050", None)]);
            }
            other => panic!("unexpected {other:?}"),
        }

        guest.send(Input::IteratorClose { id: 1 }).await;
        guest
            .send(Input::IteratorAck {
                id: 1,
                seq: 1,
                consumed: 1,
            })
            .await;
        guest
            .send(Input::IteratorSeek {
                id: 2,
                seq: 1,
                target: "0001".into(),
            })
            .await;
        assert!(guest.recv_within(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_skips_unknown_frames() {
        let host = Host::new(Arc::new(MemoryStore::new()), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        // An empty frame, then a frame with an unknown tag
        guest.stream.write_all(&[0x00, 0x02, 99, 0]).await.unwrap();
        guest.send(Input::Get { id: 1, key: "k".into() }).await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 1,
                error: None,
                value: None
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_prefix_ends_stream() {
        let host = Host::new(Arc::new(MemoryStore::new()), HostOptions::new());
        let mut guest = RawGuest::new(&host);

        guest.stream.write_all(&[0xff; 11]).await.unwrap();
        let closed = timeout(Duration::from_secs(5), guest.read_output())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    /// Fails every operation with the error it was built with.
    struct FailingStore(fn() -> StoreError);

    struct FailingCursor(fn() -> StoreError);

    impl Cursor for FailingCursor {
        fn next_batch(&mut self, _n: usize) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
            Err((self.0)())
        }

        fn seek(&mut self, _target: &[u8]) {}

        fn close(&mut self) {}
    }

    impl Store for FailingStore {
        fn get(&self, _key: &[u8]) -> Result<Option<Bytes>, StoreError> {
            Err((self.0)())
        }

        fn put(&self, _key: Bytes, _value: Bytes) -> Result<(), StoreError> {
            Err((self.0)())
        }

        fn delete(&self, _key: &[u8]) -> Result<(), StoreError> {
            Err((self.0)())
        }

        fn batch(&self, _ops: Vec<BatchOp>) -> Result<(), StoreError> {
            Err((self.0)())
        }

        fn clear(&self, _range: &RangeOptions) -> Result<(), StoreError> {
            Err((self.0)())
        }

        fn iterator(&self, _range: &RangeOptions) -> Result<Box<dyn Cursor>, StoreError> {
            Ok(Box::new(FailingCursor(self.0)))
        }
    }

    #[tokio::test]
    async fn test_error_codes_normalized() {
        let host = Host::new(
            Arc::new(FailingStore(|| StoreError::other("disk on fire"))),
            HostOptions::new(),
        );
        let mut guest = RawGuest::new(&host);

        guest.send(Input::Get { id: 1, key: "k".into() }).await;
        assert_eq!(
            guest.recv().await,
            Output::Callback {
                id: 1,
                error: Some(ErrorCode::RemoteError),
                value: None
            }
        );
        guest
            .send(Input::GetMany {
                id: 2,
                keys: vec!["k".into()],
            })
            .await;
        assert_eq!(
            guest.recv().await,
            Output::GetManyCallback {
                id: 2,
                error: Some(ErrorCode::RemoteError),
                values: Vec::new()
            }
        );

        let host = Host::new(
            Arc::new(FailingStore(|| {
                StoreError::coded(ErrorCode::Corruption, "bad block")
            })),
            HostOptions::new(),
        );
        let mut guest = RawGuest::new(&host);
        guest.send(open(3, IteratorOptions::new())).await;
        assert_eq!(
            guest.recv().await,
            Output::IteratorError {
                id: 3,
                seq: 0,
                error: ErrorCode::Corruption
            }
        );
    }
}
