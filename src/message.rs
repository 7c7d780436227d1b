//! The framed message model.

use bytes::Bytes;

use crate::command::Command;
use crate::error::RpcError;

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    Error = 3,
    Stream = 4,
    StreamClose = 5,
    Ping = 6,
    Close = 7,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Error),
            4 => Some(Self::Stream),
            5 => Some(Self::StreamClose),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            _ => None,
        }
    }
}

/// One self-delimited unit on the wire: type, sequence, command, payload.
///
/// The sequence number is chosen by the originating direction and is only a
/// routing key here. Payload bytes mean whatever the handler for `cmd` says
/// they mean; the codec never looks inside them.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub seq: u32,
    pub cmd: Command,
    pub data: Bytes,
}

impl Message {
    pub fn request(seq: u32, cmd: Command, data: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Request,
            seq,
            cmd,
            data: data.into(),
        }
    }

    pub fn ping(seq: u32) -> Self {
        Self {
            kind: MessageKind::Ping,
            seq,
            cmd: Command::none(),
            data: Bytes::new(),
        }
    }

    pub(crate) fn close() -> Self {
        Self {
            kind: MessageKind::Close,
            seq: 0,
            cmd: Command::none(),
            data: Bytes::new(),
        }
    }

    pub(crate) fn stream_close(seq: u32, cmd: Command, reason: Option<&str>) -> Self {
        Self {
            kind: MessageKind::StreamClose,
            seq,
            cmd,
            data: reason.map(|r| Bytes::copy_from_slice(r.as_bytes())).unwrap_or_default(),
        }
    }

    /// An intermediate stream frame derived from this message's envelope.
    pub(crate) fn stream_frame(&self, data: Bytes) -> Self {
        Self {
            kind: MessageKind::Stream,
            seq: self.seq,
            cmd: self.cmd.clone(),
            data,
        }
    }

    /// Turn a request into its terminal reply, preserving seq and command.
    ///
    /// Errors become Error frames whose payload is the error's text.
    pub(crate) fn into_reply(mut self, result: Result<Bytes, RpcError>) -> Self {
        match result {
            Ok(data) => {
                self.kind = MessageKind::Response;
                self.data = data;
            }
            Err(err) => {
                self.kind = MessageKind::Error;
                self.data = Bytes::from(err.to_string());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Error,
            MessageKind::Stream,
            MessageKind::StreamClose,
            MessageKind::Ping,
            MessageKind::Close,
        ] {
            assert_eq!(MessageKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(8), None);
    }

    #[test]
    fn reply_preserves_envelope() {
        let cmd = Command::new("echo").unwrap();
        let req = Message::request(42, cmd.clone(), &b"in"[..]);
        let ok = req.clone().into_reply(Ok(Bytes::from_static(b"out")));
        assert_eq!(ok.kind, MessageKind::Response);
        assert_eq!(ok.seq, 42);
        assert_eq!(ok.cmd, cmd);
        assert_eq!(&ok.data[..], b"out");

        let err = req.into_reply(Err(RpcError::CommandNotFound));
        assert_eq!(err.kind, MessageKind::Error);
        assert_eq!(err.seq, 42);
        assert_eq!(&err.data[..], b"command not found");
    }
}
