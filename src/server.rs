//! Command registry and the HTTP `CONNECT` upgrade.
//!
//! Registration happens once at startup and the registry is read-only from
//! then on; sessions look handlers up without locking. The upgrade adapter
//! takes ownership of the raw connection: it answers the request head itself
//! and then speaks the binary frame protocol on the same socket.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::command::Command;
use crate::error::RpcError;
use crate::message::Message;
use crate::session::Session;
use crate::stream::RpcStream;

/// Reply sent after a successful `CONNECT`, byte-exact: clients read these
/// bytes verbatim before the first frame.
const CONNECTED: &str = "HTTP/1.0 200 Connected to CC RPC\n\n";

const MUST_CONNECT: &str = "HTTP/1.0 405 Method Not Allowed\r\n\
     Content-Type: text/plain; charset=utf-8\r\n\
     Content-Length: 17\r\n\
     \r\n\
     405 must CONNECT\n";

type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type UnaryHandler =
    Arc<dyn Fn(Message) -> HandlerFuture<Result<Bytes, RpcError>> + Send + Sync>;

pub(crate) type StreamHandler =
    Arc<dyn Fn(Message, Arc<RpcStream>) -> HandlerFuture<Result<(), RpcError>> + Send + Sync>;

/// The RPC server: a process-lived registry of command handlers plus the
/// upgrade adapter that turns accepted connections into sessions.
#[derive(Default)]
pub struct Server {
    handlers: HashMap<Command, UnaryHandler>,
    stream_handlers: HashMap<Command, StreamHandler>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler: one Request in, one Response out.
    ///
    /// # Panics
    ///
    /// Panics on an invalid name, or a name already registered in either
    /// table. Both are configuration bugs caught at startup.
    pub fn handle<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, RpcError>> + Send + 'static,
    {
        let cmd = self.checked_name(name);
        self.handlers
            .insert(cmd, Arc::new(move |msg| Box::pin(f(msg))));
    }

    /// Register a streaming handler: one Request in, any number of Stream
    /// frames out, then a terminal Response.
    ///
    /// # Panics
    ///
    /// Same rules as [`handle`](Self::handle).
    pub fn handle_stream<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Message, Arc<RpcStream>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let cmd = self.checked_name(name);
        self.stream_handlers
            .insert(cmd, Arc::new(move |msg, stream| Box::pin(f(msg, stream))));
    }

    fn checked_name(&self, name: &str) -> Command {
        let cmd = match Command::new(name) {
            Ok(cmd) => cmd,
            Err(e) => panic!("command {name:?} invalid: {e}"),
        };
        if self.handlers.contains_key(&cmd) || self.stream_handlers.contains_key(&cmd) {
            panic!("command {name:?} registered twice");
        }
        cmd
    }

    pub(crate) fn unary_handler(&self, cmd: &Command) -> Option<UnaryHandler> {
        self.handlers.get(cmd).cloned()
    }

    pub(crate) fn stream_handler(&self, cmd: &Command) -> Option<StreamHandler> {
        self.stream_handlers.get(cmd).cloned()
    }

    /// Accept connections forever, one session per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            tracing::debug!(%peer, "rpc client connected");
            let server = self.clone();
            tokio::spawn(async move {
                match server.serve_connection(socket).await {
                    Ok(()) => tracing::debug!(%peer, "rpc client disconnected"),
                    Err(e) => tracing::error!(%peer, error = %e, "rpc session failed"),
                }
            });
        }
    }

    /// Upgrade one connection and run its session to completion.
    ///
    /// Only `CONNECT` upgrades; any other method is answered with a 405 and
    /// no session is constructed.
    pub async fn serve_connection<S>(self: Arc<Self>, io: S) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(io);
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let method = line.split_whitespace().next().unwrap_or("");
        if method != "CONNECT" {
            tracing::debug!(method, "rejecting non-CONNECT request");
            write_half.write_all(MUST_CONNECT.as_bytes()).await?;
            write_half.shutdown().await?;
            return Ok(());
        }

        // Swallow the rest of the request head.
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        write_half.write_all(CONNECTED.as_bytes()).await?;
        write_half.flush().await?;

        Session::new(self, reader, write_half).run().await
    }
}
