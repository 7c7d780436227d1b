//! Binary wire codec: one message per read, one message per write.
//!
//! Frame layout, all integers little-endian, self-delimiting:
//!
//! ```text
//! magic+version  u32
//! kind           u8
//! seq            u32
//! cmd            u16 length prefix, then UTF-8 bytes
//! payload        u32 length prefix, then opaque bytes
//! ```
//!
//! The codec is strictly synchronous per direction: the session's read loop
//! owns the reader half, the write loop owns the writer half, and the two
//! never contend.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::{Command, MAX_COMMAND_LEN};
use crate::error::{CommandError, WireError};
use crate::message::{Message, MessageKind};

/// Fixed prefix every frame starts with: the magic bytes "CC" plus protocol
/// version 1. A mismatch means the stream is not speaking this protocol (or
/// framing has been lost) and the session cannot continue.
pub const MAGIC_VERSION: u32 = 0x4343_0001;

/// Upper bound on a single frame's payload.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Reading half of the codec.
pub struct WireReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read exactly one message.
    ///
    /// End-of-stream at a frame boundary is the orderly-close signal and is
    /// reported as [`WireError::Closed`]; EOF anywhere inside a frame is an
    /// I/O error like any other. A frame with an unknown kind byte is
    /// consumed whole before [`WireError::UnknownKind`] is returned, so the
    /// stream stays aligned on the next frame.
    pub async fn read(&mut self) -> Result<Message, WireError> {
        let mut magic = [0u8; 4];
        match self.inner.read_exact(&mut magic).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::Closed)
            }
            Err(e) => return Err(WireError::Io(e)),
        }
        let magic = u32::from_le_bytes(magic);
        if magic != MAGIC_VERSION {
            return Err(WireError::BadMagic {
                expected: MAGIC_VERSION,
                actual: magic,
            });
        }

        let kind = self.inner.read_u8().await?;
        let seq = self.inner.read_u32_le().await?;

        let cmd_len = self.inner.read_u16_le().await? as usize;
        if cmd_len > MAX_COMMAND_LEN {
            return Err(WireError::CommandTooLong {
                len: cmd_len,
                max: MAX_COMMAND_LEN,
            });
        }
        let mut cmd_buf = vec![0u8; cmd_len];
        self.inner.read_exact(&mut cmd_buf).await?;

        let data_len = self.inner.read_u32_le().await? as usize;
        if data_len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len: data_len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        let mut data = vec![0u8; data_len];
        self.inner.read_exact(&mut data).await?;

        let Some(kind) = MessageKind::from_u8(kind) else {
            return Err(WireError::UnknownKind(kind));
        };

        let cmd = if cmd_buf.is_empty() {
            Command::none()
        } else {
            let name = std::str::from_utf8(&cmd_buf).map_err(|e| {
                WireError::Command(CommandError::Unprintable {
                    byte: cmd_buf[e.valid_up_to()],
                })
            })?;
            Command::new(name)?
        };

        Ok(Message {
            kind,
            seq,
            cmd,
            data: Bytes::from(data),
        })
    }
}

/// Writing half of the codec.
pub struct WireWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write exactly one message and flush it.
    pub async fn write(&mut self, msg: &Message) -> Result<(), WireError> {
        let cmd = msg.cmd.as_str().as_bytes();
        if msg.data.len() > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge {
                len: msg.data.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        self.inner.write_u32_le(MAGIC_VERSION).await?;
        self.inner.write_u8(msg.kind as u8).await?;
        self.inner.write_u32_le(msg.seq).await?;
        self.inner.write_u16_le(cmd.len() as u16).await?;
        self.inner.write_all(cmd).await?;
        self.inner.write_u32_le(msg.data.len() as u32).await?;
        if !msg.data.is_empty() {
            self.inner.write_all(&msg.data).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trips_every_kind() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = WireWriter::new(a);
        let mut reader = WireReader::new(b);

        let cmd = Command::new("search").unwrap();
        let frames = vec![
            Message::request(1, cmd.clone(), &b"hello"[..]),
            Message::ping(7),
            Message {
                kind: MessageKind::Stream,
                seq: 9,
                cmd: cmd.clone(),
                data: Bytes::from_static(b"chunk"),
            },
            Message::stream_close(9, cmd, Some("gone")),
            Message::close(),
        ];
        for frame in &frames {
            writer.write(frame).await.unwrap();
        }
        for expected in &frames {
            let got = reader.read().await.unwrap();
            assert_eq!(got.kind, expected.kind);
            assert_eq!(got.seq, expected.seq);
            assert_eq!(got.cmd, expected.cmd);
            assert_eq!(got.data, expected.data);
        }
    }

    #[tokio::test]
    async fn clean_eof_reads_as_closed() {
        let (a, b) = tokio::io::duplex(1024);
        let mut reader = WireReader::new(b);
        drop(a);
        assert!(matches!(reader.read().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = WireReader::new(b);

        a.write_all(&0xdead_beefu32.to_le_bytes()).await.unwrap();
        a.write_all(&[0u8; 16]).await.unwrap();
        assert!(matches!(
            reader.read().await,
            Err(WireError::BadMagic { actual: 0xdead_beef, .. })
        ));
    }

    #[tokio::test]
    async fn unknown_kind_consumes_one_frame() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = WireReader::new(b);

        // A frame with kind 9, then a valid ping.
        a.write_all(&MAGIC_VERSION.to_le_bytes()).await.unwrap();
        a.write_all(&[9]).await.unwrap();
        a.write_all(&3u32.to_le_bytes()).await.unwrap();
        a.write_all(&0u16.to_le_bytes()).await.unwrap();
        a.write_all(&2u32.to_le_bytes()).await.unwrap();
        a.write_all(b"xy").await.unwrap();

        let mut writer = WireWriter::new(a);
        writer.write(&Message::ping(4)).await.unwrap();

        assert!(matches!(reader.read().await, Err(WireError::UnknownKind(9))));
        let ping = reader.read().await.unwrap();
        assert_eq!(ping.kind, MessageKind::Ping);
        assert_eq!(ping.seq, 4);
    }

    #[tokio::test]
    async fn rejects_oversized_command_length() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = WireReader::new(b);

        a.write_all(&MAGIC_VERSION.to_le_bytes()).await.unwrap();
        a.write_all(&[1]).await.unwrap();
        a.write_all(&1u32.to_le_bytes()).await.unwrap();
        a.write_all(&1000u16.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.read().await,
            Err(WireError::CommandTooLong { len: 1000, .. })
        ));
    }
}
