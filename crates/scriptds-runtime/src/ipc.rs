//! IPC protocol between the datasource and a `scriptds-host` process.
//!
//! Format: `[length: 4 bytes BE][msg_type: 1 byte][payload: length-1 bytes]`,
//! with JSON payloads. The parent writes to the child's stdin and reads its
//! stdout; the child logs to stderr.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::CallId;
use crate::error::EngineError;

/// Upper bound on a single frame, guarding against a corrupted length prefix.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Message types for IPC protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Parent → Host
    Load = 1,
    Resolve = 2,
    Call = 3,
    Shutdown = 4,

    // Host → Parent
    Ready = 10,
    Loaded = 11,
    Resolved = 12,
    Result = 13,
    Error = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, io::Error> {
        match value {
            1 => Ok(MessageType::Load),
            2 => Ok(MessageType::Resolve),
            3 => Ok(MessageType::Call),
            4 => Ok(MessageType::Shutdown),
            10 => Ok(MessageType::Ready),
            11 => Ok(MessageType::Loaded),
            12 => Ok(MessageType::Resolved),
            13 => Ok(MessageType::Result),
            14 => Ok(MessageType::Error),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown message type: {}", value),
            )),
        }
    }
}

/// A message received from or sent to a host process
#[derive(Debug, Clone)]
pub struct HostMessage {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl HostMessage {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn empty(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            payload: Vec::new(),
        }
    }

    /// Build a message with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> serde_json::Result<Self> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse payload as JSON
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Payload of [`MessageType::Load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub settle_ms: u64,
}

/// Payload of [`MessageType::Resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub name: String,
}

/// Payload of [`MessageType::Call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub id: CallId,
    pub request: String,
    pub timeout_ms: u64,
}

/// Payload of [`MessageType::Result`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub id: CallId,
    pub outcome: Result<String, EngineError>,
}

/// Writes frames to a byte sink.
pub struct IpcWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> IpcWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a message
    pub async fn send(&mut self, msg: &HostMessage) -> io::Result<()> {
        let len = (1 + msg.payload.len()) as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&[msg.msg_type as u8]).await?;
        self.inner.write_all(&msg.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a message with JSON payload
    pub async fn send_json<T: Serialize>(&mut self, msg_type: MessageType, data: &T) -> io::Result<()> {
        let msg = HostMessage::json(msg_type, data)?;
        self.send(&msg).await
    }
}

/// Reads frames from a byte source.
pub struct IpcReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> IpcReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a message; `None` on a clean end of stream.
    pub async fn recv(&mut self) -> io::Result<Option<HostMessage>> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 || len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid frame length: {}", len),
            ));
        }

        // Read message type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let msg_type = MessageType::try_from(type_buf[0])?;

        // Read payload
        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(HostMessage::new(msg_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_a_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = IpcWriter::new(client);
        let mut reader = IpcReader::new(server);

        writer.send(&HostMessage::empty(MessageType::Ready)).await.unwrap();
        writer
            .send_json(
                MessageType::Call,
                &CallRequest {
                    id: 7,
                    request: "{}".into(),
                    timeout_ms: 100,
                },
            )
            .await
            .unwrap();
        drop(writer);

        let ready = reader.recv().await.unwrap().unwrap();
        assert_eq!(ready.msg_type, MessageType::Ready);
        assert!(ready.payload.is_empty());

        let call = reader.recv().await.unwrap().unwrap();
        assert_eq!(call.msg_type, MessageType::Call);
        let call: CallRequest = call.parse_json().unwrap();
        assert_eq!(call.id, 7);
        assert_eq!(call.timeout_ms, 100);

        assert!(reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_unknown_type_and_bad_length() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = IpcReader::new(server);
        client.write_all(&[0, 0, 0, 1, 99]).await.unwrap();
        assert!(reader.recv().await.is_err());

        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = IpcReader::new(server);
        client.write_all(&[0, 0, 0, 0]).await.unwrap();
        assert!(reader.recv().await.is_err());
    }

    #[test]
    fn test_call_response_carries_engine_errors() {
        let response = CallResponse {
            id: 3,
            outcome: Err(EngineError::Rejected("Error: boom".into())),
        };
        let bytes = serde_json::to_vec(&response).unwrap();
        let back: CallResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.outcome, Err(EngineError::Rejected("Error: boom".into())));
    }
}
