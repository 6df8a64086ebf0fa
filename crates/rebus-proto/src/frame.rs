// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed frames for socket transports.
//!
//! Each frame is a big-endian `u32` length followed by that many payload
//! bytes. The length cap protects both sides from hostile or corrupted
//! peers; descriptor payloads can legitimately reach hundreds of
//! megabytes, so the default cap is generous.

use crate::wire::{Wire, WireError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max: usize,
) -> Result<(), WireError> {
    if payload.len() > max {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max,
        });
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, enforcing the length cap before allocating.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: usize,
) -> Result<Vec<u8>, WireError> {
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(WireError::FrameTooLarge { len, max });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Encode a message and write it as one frame.
pub async fn send_msg<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    wire: Wire,
    message: &T,
    max: usize,
) -> Result<(), WireError> {
    let payload = wire.encode(message)?;
    write_frame(writer, &payload, max).await
}

/// Read one frame and decode it.
pub async fn recv_msg<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
    wire: Wire,
    max: usize,
) -> Result<T, WireError> {
    let payload = read_frame(reader, max).await?;
    wire.decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RpcRequest, ServerFrame, Signal};
    use uuid::Uuid;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"hello", MAX_FRAME_LEN).await.unwrap();
        write_frame(&mut a, b"", MAX_FRAME_LEN).await.unwrap();
        assert_eq!(read_frame(&mut b, MAX_FRAME_LEN).await.unwrap(), b"hello");
        assert_eq!(read_frame(&mut b, MAX_FRAME_LEN).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn oversized_writes_are_refused() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let err = write_frame(&mut a, &[0u8; 64], 16).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { len: 64, max: 16 }));
    }

    #[tokio::test]
    async fn oversized_reads_are_refused_before_allocation() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Hand-written header announcing a frame far beyond the cap.
        tokio::io::AsyncWriteExt::write_u32(&mut a, u32::MAX)
            .await
            .unwrap();
        let err = read_frame(&mut b, 1024).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn typed_messages_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = ServerFrame::Signal(Signal::NewDescriptor {
            sender_id: "inject-0".into(),
            domain: "default".into(),
            uuid: Uuid::new_v4(),
            selector: format!("/raw/%{}", "a".repeat(64)),
        });
        send_msg(&mut a, Wire::Bin, &msg, MAX_FRAME_LEN).await.unwrap();
        let back: ServerFrame = recv_msg(&mut b, Wire::Bin, MAX_FRAME_LEN).await.unwrap();
        match back {
            ServerFrame::Signal(Signal::NewDescriptor { sender_id, .. }) => {
                assert_eq!(sender_id, "inject-0");
            }
            _ => panic!("frame changed in transit"),
        }
    }

    #[tokio::test]
    async fn requests_survive_framing() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = RpcRequest::Find {
            agent_id: "ls-3".into(),
            domain: "default".into(),
            selector_regex: "^/binary".into(),
            limit: 10,
            offset: 0,
        };
        send_msg(&mut a, Wire::Bin, &req, MAX_FRAME_LEN).await.unwrap();
        let back: RpcRequest = recv_msg(&mut b, Wire::Bin, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(back.op_name(), "FIND");
    }
}
