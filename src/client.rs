//! The connecting peer: handshake, demux, calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::command::Command;
use crate::error::{RpcError, WireError};
use crate::message::{Message, MessageKind};
use crate::wire::{WireReader, WireWriter};

const SEND_QUEUE: usize = 1024;
const STREAM_BUFFER: usize = 64;

enum StreamEvent {
    Data(Bytes),
    End(Result<(), RpcError>),
}

/// A connected RPC client.
///
/// One upgraded connection carries any number of concurrent calls; a demux
/// task owns the read half and correlates replies to callers by sequence
/// number, the way the server routes requests. There is no reconnection: a
/// broken connection fails every outstanding call and the client is done.
pub struct Client {
    outbound: mpsc::Sender<Message>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>>,
    seq: AtomicU32,
    shutdown: CancellationToken,
}

impl Client {
    /// Dial and upgrade.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, RpcError> {
        let socket = TcpStream::connect(addr).await?;
        Self::handshake(socket).await
    }

    /// Upgrade a raw byte stream with the `CONNECT` handshake and start the
    /// demux and write tasks.
    pub async fn handshake<S>(io: S) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(io);
        write_half.write_all(b"CONNECT / HTTP/1.0\n\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut status = String::new();
        reader.read_line(&mut status).await?;
        if !status.contains(" 200 ") {
            return Err(RpcError::Remote(format!(
                "upgrade refused: {}",
                status.trim()
            )));
        }
        // The reply head is the status line plus one blank line.
        let mut blank = String::new();
        reader.read_line(&mut blank).await?;

        let pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let streams: Arc<Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(SEND_QUEUE);

        tokio::spawn(demux_loop(
            WireReader::new(reader),
            pending.clone(),
            streams.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(send_loop(
            WireWriter::new(write_half),
            outbound_rx,
            shutdown.clone(),
        ));

        Ok(Self {
            outbound,
            pending,
            streams,
            seq: AtomicU32::new(1),
            shutdown,
        })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke a unary command and wait for its reply.
    pub async fn call(&self, cmd: &str, payload: impl Into<Bytes>) -> Result<Bytes, RpcError> {
        let cmd = Command::new(cmd)?;
        let seq = self.next_seq();
        let reply = self
            .round_trip(seq, Message::request(seq, cmd, payload.into()))
            .await?;
        match reply.kind {
            MessageKind::Response => Ok(reply.data),
            MessageKind::Error => Err(RpcError::Remote(
                String::from_utf8_lossy(&reply.data).into_owned(),
            )),
            other => Err(RpcError::Remote(format!("unexpected reply type {other:?}"))),
        }
    }

    /// Probe liveness.
    pub async fn ping(&self) -> Result<(), RpcError> {
        let seq = self.next_seq();
        self.round_trip(seq, Message::ping(seq)).await.map(|_| ())
    }

    /// Start a streaming call.
    pub async fn call_stream(
        &self,
        cmd: &str,
        payload: impl Into<Bytes>,
    ) -> Result<CallStream, RpcError> {
        let cmd = Command::new(cmd)?;
        let seq = self.next_seq();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.streams.lock().insert(seq, tx);
        let request = Message::request(seq, cmd.clone(), payload.into());
        if self.outbound.send(request).await.is_err() {
            self.streams.lock().remove(&seq);
            return Err(RpcError::Wire(WireError::Closed));
        }
        Ok(CallStream {
            seq,
            cmd,
            events: rx,
            outbound: self.outbound.clone(),
            finished: false,
        })
    }

    /// Stop the client. The write task exits, the connection closes, and the
    /// server observes EOF.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn round_trip(&self, seq: u32, msg: Message) -> Result<Message, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);
        if self.outbound.send(msg).await.is_err() {
            self.pending.lock().remove(&seq);
            return Err(RpcError::Wire(WireError::Closed));
        }
        tokio::select! {
            reply = rx => reply.map_err(|_| RpcError::Wire(WireError::Closed)),
            _ = self.shutdown.cancelled() => {
                self.pending.lock().remove(&seq);
                Err(RpcError::Wire(WireError::Closed))
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Client half of one streaming call.
///
/// Intermediate Stream frames arrive through [`next`](Self::next); the
/// terminal Response or Error ends the stream. The handler's input side is
/// fed with [`send`](Self::send) and finished with [`close`](Self::close).
pub struct CallStream {
    seq: u32,
    cmd: Command,
    events: mpsc::Receiver<StreamEvent>,
    outbound: mpsc::Sender<Message>,
    finished: bool,
}

impl CallStream {
    /// The next intermediate payload, or `None` after the terminal reply.
    /// A terminal Error is yielded once before the end.
    pub async fn next(&mut self) -> Option<Result<Bytes, RpcError>> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => Some(Ok(data)),
            Some(StreamEvent::End(Ok(()))) => {
                self.finished = true;
                None
            }
            Some(StreamEvent::End(Err(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Send one payload to the remote handler's input.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), RpcError> {
        let msg = Message {
            kind: MessageKind::Stream,
            seq: self.seq,
            cmd: self.cmd.clone(),
            data: data.into(),
        };
        self.outbound
            .send(msg)
            .await
            .map_err(|_| RpcError::Wire(WireError::Closed))
    }

    /// Tell the remote handler this stream is finished, with an error reason
    /// if there is one.
    pub async fn close(&self, reason: Option<&str>) -> Result<(), RpcError> {
        let msg = Message::stream_close(self.seq, self.cmd.clone(), reason);
        self.outbound
            .send(msg)
            .await
            .map_err(|_| RpcError::Wire(WireError::Closed))
    }
}

async fn demux_loop<R: AsyncRead + Unpin>(
    mut wire: WireReader<R>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<Message>>>>,
    streams: Arc<Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            res = wire.read() => match res {
                Ok(msg) => msg,
                Err(WireError::UnknownKind(kind)) => {
                    tracing::warn!(kind, "dropping frame with unknown message type");
                    continue;
                }
                Err(WireError::Closed) => break,
                Err(e) => {
                    tracing::error!(error = %e, "client read failed");
                    break;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        match msg.kind {
            MessageKind::Stream => {
                let tx = streams.lock().get(&msg.seq).cloned();
                match tx {
                    Some(tx) => {
                        // Receiver dropped means the caller lost interest;
                        // unregister so later frames are dropped cheaply.
                        if tx.send(StreamEvent::Data(msg.data)).await.is_err() {
                            streams.lock().remove(&msg.seq);
                        }
                    }
                    None => {
                        tracing::debug!(seq = msg.seq, "stream frame for unknown sequence")
                    }
                }
            }
            MessageKind::Response | MessageKind::Error => {
                // A terminal reply for an active stream ends that stream;
                // otherwise it answers a pending unary call.
                let stream_tx = streams.lock().remove(&msg.seq);
                if let Some(tx) = stream_tx {
                    let end = match msg.kind {
                        MessageKind::Error => Err(RpcError::Remote(
                            String::from_utf8_lossy(&msg.data).into_owned(),
                        )),
                        _ => Ok(()),
                    };
                    let _ = tx.send(StreamEvent::End(end)).await;
                } else if let Some(tx) = pending.lock().remove(&msg.seq) {
                    let _ = tx.send(msg);
                } else {
                    tracing::debug!(seq = msg.seq, "reply for unknown sequence");
                }
            }
            MessageKind::Close => {
                tracing::debug!("server closed the session");
                break;
            }
            other => tracing::warn!(kind = ?other, seq = msg.seq, "unexpected message type"),
        }
    }

    // Fail everything still outstanding so callers do not hang.
    shutdown.cancel();
    pending.lock().clear();
    let stale: Vec<_> = streams.lock().drain().map(|(_, tx)| tx).collect();
    for tx in stale {
        let _ = tx.try_send(StreamEvent::End(Err(RpcError::Wire(WireError::Closed))));
    }
}

async fn send_loop<W: AsyncWrite + Unpin>(
    mut wire: WireWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = wire.write(&msg).await {
                        tracing::error!(error = %e, "client write failed");
                        shutdown.cancel();
                        return;
                    }
                }
                None => return,
            },
            _ = shutdown.cancelled() => return,
        }
    }
}
