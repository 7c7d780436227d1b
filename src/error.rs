//! Error types for the wire and dispatch layers.

use core::fmt;

/// Command name validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    TooLong { len: usize, max: usize },
    Unprintable { byte: u8 },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command name"),
            Self::TooLong { len, max } => {
                write!(f, "command name {len} bytes exceeds max {max}")
            }
            Self::Unprintable { byte } => {
                write!(f, "unprintable byte {byte:#04x} in command name")
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Wire-level errors: everything that can go wrong framing messages onto or
/// off the byte stream.
#[derive(Debug)]
pub enum WireError {
    /// The peer closed the connection at a frame boundary.
    Closed,
    Io(std::io::Error),
    BadMagic { expected: u32, actual: u32 },
    /// The frame was consumed whole but its kind byte is not one we know.
    UnknownKind(u8),
    CommandTooLong { len: usize, max: usize },
    PayloadTooLarge { len: usize, max: usize },
    Command(CommandError),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BadMagic { expected, actual } => {
                write!(f, "bad magic: expected {expected:#010x}, got {actual:#010x}")
            }
            Self::UnknownKind(kind) => write!(f, "unknown message type: {kind}"),
            Self::CommandTooLong { len, max } => {
                write!(f, "command {len} bytes exceeds max {max}")
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds max {max}")
            }
            Self::Command(e) => write!(f, "invalid command: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Command(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CommandError> for WireError {
    fn from(e: CommandError) -> Self {
        Self::Command(e)
    }
}

/// Dispatch-level errors.
///
/// `CommandNotFound`, `StreamStopped`, and `Handler` travel to the peer as
/// the payload of an Error frame, so their `Display` text is the wire
/// representation.
#[derive(Debug)]
pub enum RpcError {
    Wire(WireError),
    /// A Request named a command with no registered handler.
    CommandNotFound,
    /// The session shut down while a stream was still active.
    StreamStopped,
    /// Failure reported by a local handler.
    Handler(String),
    /// Failure reported by the peer (Error frame or StreamClose payload).
    Remote(String),
}

impl RpcError {
    /// Shorthand for handler implementations reporting a failure.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "wire error: {e}"),
            Self::CommandNotFound => write!(f, "command not found"),
            Self::StreamStopped => write!(f, "stream stopped"),
            Self::Handler(msg) => write!(f, "{msg}"),
            Self::Remote(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Wire(WireError::Io(e))
    }
}

impl From<CommandError> for RpcError {
    fn from(e: CommandError) -> Self {
        Self::Wire(WireError::Command(e))
    }
}
