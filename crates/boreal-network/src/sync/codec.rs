//! Varint-framed bincode codec for the sync sub-protocol, pluggable into
//! libp2p's request-response behaviour.

use async_trait::async_trait;
use boreal_primitives::wire::MAX_WIRE_MESSAGE;
use futures::prelude::*;
use libp2p::request_response;
use libp2p::StreamProtocol;
use std::io;

use super::messages::{SyncFrame, SyncRequest, SyncResponse};

#[derive(Clone, Debug, Default)]
pub struct SyncCodec;

#[async_trait]
impl request_response::Codec for SyncCodec {
    type Protocol = StreamProtocol;
    type Request = SyncFrame<SyncRequest>;
    type Response = SyncFrame<SyncResponse>;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_varint_frame(io).await
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_varint_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_varint_frame(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        response: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_varint_frame(io, &response).await
    }
}

/// Reads one unsigned-varint length prefix byte by byte, then the
/// payload, then decodes it.
pub(crate) async fn read_varint_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: serde::de::DeserializeOwned,
{
    let mut len: u64 = 0;
    for shift_index in 0..10 {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        len |= u64::from(byte[0] & 0x7f) << (7 * shift_index);
        if byte[0] & 0x80 == 0 {
            break;
        }
        if shift_index == 9 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unterminated varint"));
        }
    }

    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length overflows usize"))?;
    if len > MAX_WIRE_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_WIRE_MESSAGE}-byte limit"),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Length-prefixes and writes one message. Oversize fails at the sender
/// rather than wasting the wire.
pub(crate) async fn write_varint_frame<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: serde::Serialize,
{
    let data =
        bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_WIRE_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {MAX_WIRE_MESSAGE}-byte limit", data.len()),
        ));
    }

    let mut prefix = Vec::with_capacity(5);
    boreal_primitives::wire::put_uvarint(&mut prefix, data.len() as u64);
    io.write_all(&prefix).await?;
    io.write_all(&data).await?;
    io.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    #[tokio::test]
    async fn frame_roundtrip_through_cursor() {
        let frame = SyncFrame {
            request_id: 3,
            message: SyncRequest::BlockHeader { shard_id: 2, height: 77 },
        };

        let mut buf = futures::io::Cursor::new(Vec::new());
        write_varint_frame(&mut buf, &frame).await.unwrap();

        let mut reader = futures::io::Cursor::new(buf.into_inner());
        let decoded: SyncFrame<SyncRequest> = read_varint_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn response_roundtrip_through_cursor() {
        let frame = SyncFrame {
            request_id: 9,
            message: SyncResponse::BlockHeight {
                shard_id: 1,
                beacon_height: 5,
                beacon_hash: B256::repeat_byte(5),
                shard_height: 4,
                shard_hash: B256::repeat_byte(4),
            },
        };

        let mut buf = futures::io::Cursor::new(Vec::new());
        write_varint_frame(&mut buf, &frame).await.unwrap();
        let mut reader = futures::io::Cursor::new(buf.into_inner());
        let decoded: SyncFrame<SyncResponse> = read_varint_frame(&mut reader).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let mut forged = Vec::new();
        boreal_primitives::wire::put_uvarint(&mut forged, (MAX_WIRE_MESSAGE as u64) + 1);
        forged.extend_from_slice(&[0u8; 64]);

        let mut reader = futures::io::Cursor::new(forged);
        let result: io::Result<SyncFrame<SyncRequest>> = read_varint_frame(&mut reader).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_frame_rejected() {
        let frame = SyncFrame { request_id: 1, message: SyncRequest::BlockHeight };
        let mut buf = futures::io::Cursor::new(Vec::new());
        write_varint_frame(&mut buf, &frame).await.unwrap();
        let mut bytes = buf.into_inner();
        bytes.truncate(bytes.len() - 1);

        let mut reader = futures::io::Cursor::new(bytes);
        let result: io::Result<SyncFrame<SyncRequest>> = read_varint_frame(&mut reader).await;
        assert!(result.is_err());
    }
}
