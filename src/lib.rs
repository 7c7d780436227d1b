//! ccrpc: bidirectional, multiplexed RPC over a hijacked HTTP `CONNECT`
//! tunnel.
//!
//! A client upgrades a plain connection once, then both sides speak a framed
//! binary protocol on the same socket. One connection carries any number of
//! concurrent unary calls, streaming calls, and liveness pings, correlated by
//! sequence number:
//!
//! ```text
//!  client ──── CONNECT / HTTP/1.0 ─────────────────▶ Server
//!         ◀─── HTTP/1.0 200 Connected to CC RPC ────
//!         ◀═══════════ framed protocol ════════════▶ Session
//!                                                       │
//!                    read loop ── dispatch ──▶ handler tasks
//!                                                       │
//!                    write loop ◀── response queue ◀────┘
//! ```
//!
//! A `Request` frame runs a registered unary or streaming handler;
//! `Stream`/`StreamClose` frames feed an active call's input; `Ping` is
//! answered unconditionally. Shutdown drains queued replies best-effort and
//! ends the connection with a `Close` frame.
//!
//! # Example
//!
//! ```ignore
//! let mut server = ccrpc::Server::new();
//! server.handle("echo", |msg: ccrpc::Message| async move { Ok(msg.data) });
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9090").await?;
//! std::sync::Arc::new(server).serve(listener).await?;
//! ```

mod client;
mod command;
mod error;
mod message;
mod server;
mod session;
mod stream;
mod wire;

pub use client::{CallStream, Client};
pub use command::{Command, MAX_COMMAND_LEN};
pub use error::{CommandError, RpcError, WireError};
pub use message::{Message, MessageKind};
pub use server::Server;
pub use session::Session;
pub use stream::RpcStream;
pub use wire::{WireReader, WireWriter, MAGIC_VERSION, MAX_PAYLOAD_LEN};

// Shutdown tokens are part of the session API.
pub use tokio_util::sync::CancellationToken;
