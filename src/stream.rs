//! Per-call streaming state.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::message::Message;

/// Buffered frames per direction on one stream.
const STREAM_BUFFER: usize = 64;

/// State for one active streaming call, keyed by its request's sequence.
///
/// The session's read loop pushes inbound Stream frames into the input
/// channel; the handler drains them with [`recv`](Self::recv). The handler
/// queues outbound payloads with [`send`](Self::send); the session's
/// forwarder puts them on the wire. `done` fires when the peer closes the
/// stream or the handler side is torn down; the terminal-error slot carries
/// the reason when there is one.
///
/// Both `recv` and `send` observe the session's shutdown signal, so handlers
/// unblock when the session stops without any wiring of their own.
pub struct RpcStream {
    input_tx: mpsc::Sender<Message>,
    input_rx: AsyncMutex<mpsc::Receiver<Message>>,
    output_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    done: CancellationToken,
    shutdown: CancellationToken,
    err: Mutex<Option<RpcError>>,
}

impl RpcStream {
    pub(crate) fn new(shutdown: CancellationToken) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (input_tx, input_rx) = mpsc::channel(STREAM_BUFFER);
        let (output_tx, output_rx) = mpsc::channel(STREAM_BUFFER);
        let stream = Arc::new(Self {
            input_tx,
            input_rx: AsyncMutex::new(input_rx),
            output_tx: Mutex::new(Some(output_tx)),
            done: CancellationToken::new(),
            shutdown,
            err: Mutex::new(None),
        });
        (stream, output_rx)
    }

    /// Receive the next inbound frame from the peer.
    ///
    /// Returns `None` once the peer has closed the stream or the session is
    /// shutting down. Frames already queued are delivered first.
    pub async fn recv(&self) -> Option<Message> {
        let mut input = self.input_rx.lock().await;
        tokio::select! {
            biased;
            msg = input.recv() => msg,
            _ = self.done.cancelled() => None,
            _ = self.shutdown.cancelled() => {
                self.set_error(RpcError::StreamStopped);
                None
            }
        }
    }

    /// Queue one outbound payload for the peer.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), RpcError> {
        let tx = self.output_tx.lock().clone();
        let Some(tx) = tx else {
            return Err(RpcError::StreamStopped);
        };
        tokio::select! {
            res = tx.send(data.into()) => res.map_err(|_| RpcError::StreamStopped),
            _ = self.shutdown.cancelled() => {
                self.set_error(RpcError::StreamStopped);
                Err(RpcError::StreamStopped)
            }
        }
    }

    /// Take the terminal error recorded for this stream, if any.
    ///
    /// Set when the peer aborts with a StreamClose payload or when the
    /// session shuts down mid-stream.
    pub fn take_error(&self) -> Option<RpcError> {
        self.err.lock().take()
    }

    /// Record the terminal error; the first recorded reason wins.
    pub(crate) fn set_error(&self, err: RpcError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Deliver one inbound frame; dropped if the stream is being torn down.
    pub(crate) async fn push_input(&self, msg: Message) {
        tokio::select! {
            res = self.input_tx.send(msg) => {
                if res.is_err() {
                    tracing::debug!("stream input closed, frame dropped");
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }

    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Signal completion, as observed by the forwarder and `recv`.
    pub(crate) fn mark_done(&self) {
        self.done.cancel();
    }

    /// Close the handler's output; the forwarder drains what is queued and
    /// exits.
    pub(crate) fn close_output(&self) {
        self.output_tx.lock().take();
    }

    /// Close the input channel and fire the done signal. Called after the
    /// handler has returned and the forwarder has drained.
    pub(crate) async fn close(&self) {
        self.input_rx.lock().await.close();
        self.done.cancel();
    }
}
