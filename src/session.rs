//! Per-connection session: read loop, write loop, dispatch, shutdown.
//!
//! One session owns one hijacked connection. The read loop is the only
//! reader of the wire and routes each inbound frame by kind and sequence;
//! the write loop is the only writer and drains the response queue in FIFO
//! order. Every Request or Ping spawns a handler task, and every active
//! stream adds one forwarder task. All of them observe the session's
//! shutdown token, which is the sole cancellation mechanism.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, WireError};
use crate::message::{Message, MessageKind};
use crate::server::{Server, StreamHandler, UnaryHandler};
use crate::stream::RpcStream;
use crate::wire::{WireReader, WireWriter};

/// Outbound frames queued between handler tasks and the write loop. When the
/// queue is full, handlers block on enqueue; that is the only backpressure
/// applied to slow peers.
const RESPONSE_QUEUE: usize = 1024;

/// One server-side RPC session over an upgraded connection.
pub struct Session<R, W> {
    reader: WireReader<R>,
    writer: WireWriter<W>,
    responses_rx: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
}

/// State reachable from handler and forwarder tasks.
struct Shared {
    server: Arc<Server>,
    responses: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    streams: Mutex<HashMap<u32, Arc<RpcStream>>>,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(server: Arc<Server>, reader: R, writer: W) -> Self {
        let (responses, responses_rx) = mpsc::channel(RESPONSE_QUEUE);
        Self {
            reader: WireReader::new(reader),
            writer: WireWriter::new(writer),
            responses_rx,
            shared: Arc::new(Shared {
                server,
                responses,
                shutdown: CancellationToken::new(),
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The session's shutdown signal. Cancelling it stops the session:
    /// idempotent, never blocks, and observable by every worker.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Run the session until the peer disconnects or the session is stopped.
    ///
    /// Returns `Ok(())` on orderly close (peer EOF or an explicit stop) and
    /// the wire error otherwise. Before returning, the write loop drains
    /// queued replies best-effort and emits a final Close frame.
    pub async fn run(self) -> Result<(), RpcError> {
        let Session {
            mut reader,
            writer,
            responses_rx,
            shared,
        } = self;

        let write_task = tokio::spawn(write_loop(writer, responses_rx, shared.clone()));
        let result = read_loop(&mut reader, &shared).await;
        shared.shutdown.cancel();
        let _ = write_task.await;
        result
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut WireReader<R>,
    shared: &Arc<Shared>,
) -> Result<(), RpcError> {
    loop {
        let msg = tokio::select! {
            res = reader.read() => match res {
                Ok(msg) => msg,
                Err(WireError::UnknownKind(kind)) => {
                    tracing::warn!(kind, "dropping frame with unknown message type");
                    continue;
                }
                Err(WireError::Closed) => {
                    tracing::debug!("peer closed the connection");
                    shared.shutdown.cancel();
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "wire read failed");
                    shared.shutdown.cancel();
                    return Err(e.into());
                }
            },
            _ = shared.shutdown.cancelled() => {
                tracing::debug!("rpc session stopped");
                return Ok(());
            }
        };
        dispatch(shared, msg).await;
    }
}

async fn dispatch(shared: &Arc<Shared>, msg: Message) {
    // No new handlers once shutdown has fired.
    if shared.shutdown.is_cancelled() {
        return;
    }
    match msg.kind {
        MessageKind::Request => {
            if let Some(handler) = shared.server.unary_handler(&msg.cmd) {
                tracing::debug!(seq = msg.seq, cmd = %msg.cmd, "dispatching command");
                tokio::spawn(handle_unary(shared.clone(), handler, msg));
            } else if let Some(handler) = shared.server.stream_handler(&msg.cmd) {
                // The entry is installed here, in the read loop, so Stream
                // and StreamClose frames for this sequence always find it no
                // matter when the handler task first runs.
                let installed = {
                    let mut streams = shared.streams.lock();
                    match streams.entry(msg.seq) {
                        // A second Request for a live sequence is ignored.
                        Entry::Occupied(_) => None,
                        Entry::Vacant(slot) => {
                            let (stream, output_rx) = RpcStream::new(shared.shutdown.clone());
                            slot.insert(stream.clone());
                            Some((stream, output_rx))
                        }
                    }
                };
                match installed {
                    Some((stream, output_rx)) => {
                        tracing::debug!(seq = msg.seq, cmd = %msg.cmd, "dispatching stream command");
                        tokio::spawn(handle_stream(shared.clone(), handler, msg, stream, output_rx));
                    }
                    None => {
                        tracing::debug!(seq = msg.seq, "duplicate stream request");
                    }
                }
            } else {
                tracing::warn!(seq = msg.seq, cmd = %msg.cmd, "command not found");
                push_reply(shared, msg, Err(RpcError::CommandNotFound)).await;
            }
        }
        MessageKind::Stream => {
            let entry = shared.streams.lock().get(&msg.seq).cloned();
            match entry {
                Some(stream) => stream.push_input(msg).await,
                None => tracing::debug!(seq = msg.seq, "stream frame for unknown sequence"),
            }
        }
        MessageKind::StreamClose => {
            let entry = shared.streams.lock().get(&msg.seq).cloned();
            if let Some(stream) = entry {
                if !msg.data.is_empty() {
                    stream.set_error(RpcError::Remote(
                        String::from_utf8_lossy(&msg.data).into_owned(),
                    ));
                }
                stream.mark_done();
            }
        }
        MessageKind::Ping => {
            tracing::debug!(seq = msg.seq, "ping");
            let shared = shared.clone();
            tokio::spawn(async move {
                push_reply(&shared, msg, Ok(Bytes::new())).await;
            });
        }
        other => {
            tracing::warn!(kind = ?other, seq = msg.seq, "unexpected message type");
        }
    }
}

/// Run a unary handler and queue its terminal reply.
async fn handle_unary(shared: Arc<Shared>, handler: UnaryHandler, msg: Message) {
    let request = msg.clone();
    let result = match AssertUnwindSafe(handler.as_ref()(msg)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(
                seq = request.seq,
                cmd = %request.cmd,
                panic = panic_message(panic.as_ref()),
                "handler panicked"
            );
            Err(RpcError::Handler("handler panic".into()))
        }
    };
    push_reply(&shared, request, result).await;
}

/// Run a streaming handler against its installed entry, forward its output,
/// and queue its terminal reply once everything has drained.
async fn handle_stream(
    shared: Arc<Shared>,
    handler: StreamHandler,
    msg: Message,
    stream: Arc<RpcStream>,
    output_rx: mpsc::Receiver<Bytes>,
) {
    let forwarder = tokio::spawn(forward_stream(
        shared.clone(),
        stream.clone(),
        output_rx,
        msg.clone(),
    ));

    let result = match AssertUnwindSafe(handler.as_ref()(msg.clone(), stream.clone()))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            tracing::error!(
                seq = msg.seq,
                cmd = %msg.cmd,
                panic = panic_message(panic.as_ref()),
                "stream handler panicked"
            );
            Err(RpcError::Handler("handler panic".into()))
        }
    };

    // Close the output first and let the forwarder drain it, so every Stream
    // frame is queued ahead of the terminal reply.
    stream.close_output();
    let _ = forwarder.await;
    stream.close().await;
    shared.streams.lock().remove(&msg.seq);

    push_reply(&shared, msg, result.map(|()| Bytes::new())).await;
}

/// Forward a stream's output channel onto the response queue as Stream
/// frames, until the output closes, the stream is done, or the session shuts
/// down.
async fn forward_stream(
    shared: Arc<Shared>,
    stream: Arc<RpcStream>,
    mut output: mpsc::Receiver<Bytes>,
    template: Message,
) {
    let done = stream.done_token();
    loop {
        tokio::select! {
            value = output.recv() => match value {
                Some(data) => {
                    let frame = template.stream_frame(data);
                    if shared.responses.send(frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shared.shutdown.cancelled() => {
                stream.set_error(RpcError::StreamStopped);
                break;
            }
            _ = done.cancelled() => break,
        }
    }
}

/// Queue the terminal reply for a request, preserving its envelope. Dropped
/// silently if the session is already closing.
async fn push_reply(shared: &Shared, msg: Message, result: Result<Bytes, RpcError>) {
    let reply = msg.into_reply(result);
    if shared.responses.send(reply).await.is_err() {
        tracing::debug!("reply dropped, session is closing");
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut wire: WireWriter<W>,
    mut responses: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            msg = responses.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = wire.write(&msg).await {
                        tracing::error!(error = %e, "wire write failed");
                        shared.shutdown.cancel();
                        break;
                    }
                }
                None => return,
            },
            _ = shared.shutdown.cancelled() => break,
        }
    }

    // Best-effort drain of already-queued replies, then tell the peer the
    // session is over. A drain failure stops the drain but the Close frame
    // is still attempted.
    while let Ok(msg) = responses.try_recv() {
        if let Err(e) = wire.write(&msg).await {
            tracing::error!(error = %e, "wire write failed during drain");
            break;
        }
    }
    let _ = wire.write(&Message::close()).await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
