//! Stream attachment.
//!
//! Each attached stream is driven by one task that reads host messages,
//! writes queued frames and tears the stream down when either side stops.

use crate::error::GuestError;
use crate::guest::{Guest, Outbound};
use bytes::Bytes;
use manykv_protocol::Decoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

/// Handle to an attached stream.
///
/// Dropping the handle leaves the stream attached.
pub struct Connection {
    shutdown: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

impl Connection {
    /// Tears the stream down as if the transport had failed.
    pub fn disconnect(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Waits until the stream is torn down and the guest has processed it.
    pub async fn closed(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }

    /// Returns whether the stream has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.done.borrow()
    }
}

impl Guest {
    /// Attaches a stream to the guest.
    ///
    /// Requests still waiting for a reply are written to the new stream in id
    /// order, followed by the registration of every live iterator.
    pub fn connect<S>(&self, stream: S) -> Result<Connection, GuestError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(GuestError::NotOpen);
            }
            if state.outbound.is_some() {
                return Err(GuestError::AlreadyConnected);
            }

            state.generation += 1;
            let outbound = Outbound {
                tx,
                generation: state.generation,
            };
            for (_, request) in state.requests.iter() {
                outbound.send(request.frame.clone());
            }
            for (id, iterator) in state.iterators.iter() {
                outbound.send_input(&iterator.descriptor(id));
            }
            tracing::info!(
                generation = outbound.generation,
                requests = state.requests.len(),
                iterators = state.iterators.len(),
                "Stream attached"
            );

            let generation = outbound.generation;
            state.outbound = Some(outbound);
            generation
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let guest = self.clone();
        let read_buffer_size = self.inner.config.read_buffer_size;

        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(stream);
            let result = tokio::select! {
                result = read_loop(&guest, reader, read_buffer_size) => result,
                result = write_loop(writer, rx) => result,
                Ok(()) = shutdown_rx => {
                    tracing::debug!(generation, "Disconnect requested");
                    Ok(())
                }
            };

            if let Err(e) = result {
                tracing::warn!(generation, error = %e, "Stream failed");
            }
            guest.teardown(generation);
            let _ = done_tx.send(true);
        });

        Ok(Connection {
            shutdown: Some(shutdown_tx),
            done: done_rx,
        })
    }

    /// Detaches the stream of `generation`, if it is still the attached one.
    fn teardown(&self, generation: u64) {
        let mut state = self.inner.state.lock();
        let attached = state
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.generation == generation);
        if !attached {
            return;
        }
        state.outbound = None;

        if self.inner.config.retry {
            tracing::info!(
                generation,
                requests = state.requests.len(),
                iterators = state.iterators.len(),
                "Stream detached, pending work waits for the next stream"
            );
            return;
        }

        tracing::info!(
            generation,
            requests = state.requests.len(),
            iterators = state.iterators.len(),
            "Stream detached, failing pending work"
        );
        state.abort_all(|| GuestError::ConnectionLost);
        drop(state);
        self.inner.flushed.notify_waiters();
    }
}

async fn read_loop<R>(guest: &Guest, mut reader: R, buffer_size: usize) -> Result<(), GuestError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; buffer_size];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("Stream closed by host");
            return Ok(());
        }

        decoder.extend(&buf[..n]);
        while let Some(output) = decoder.decode_output()? {
            tracing::trace!(id = output.id(), tag = output.tag(), "Received message");
            guest.dispatch(output);
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Bytes>) -> Result<(), GuestError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        writer.write_all(&frame).await?;
        while let Ok(frame) = rx.try_recv() {
            writer.write_all(&frame).await?;
        }
        writer.flush().await?;
    }

    // The guest dropped the sender: it was closed
    let _ = writer.shutdown().await;
    Ok(())
}
