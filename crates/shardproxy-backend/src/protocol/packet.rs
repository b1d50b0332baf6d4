//! Packet framing over a backend TCP stream

use super::{MAX_PAYLOAD_LEN, PACKET_HEADER_SIZE};
use crate::buffer_pool::{BufferPool, SizeClass};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Framed packet stream with sequence-id tracking.
///
/// Read and write buffers are borrowed from the runtime's [`BufferPool`] and
/// returned when the stream is dropped.
pub struct PacketStream {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    buffers: Arc<BufferPool>,
    sequence_id: u8,
    datasource: Arc<str>,
    frame_log: Option<String>,
}

impl std::fmt::Debug for PacketStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStream")
            .field("datasource", &self.datasource)
            .field("sequence_id", &self.sequence_id)
            .field("buffered", &self.read_buf.len())
            .field("frame_logging", &self.frame_log.is_some())
            .finish_non_exhaustive()
    }
}

impl PacketStream {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, buffers: Arc<BufferPool>, datasource: Arc<str>) -> Self {
        let read_buf = buffers.allocate(SizeClass::Small.size());
        let write_buf = buffers.allocate(SizeClass::Small.size());
        Self {
            stream,
            read_buf,
            write_buf,
            buffers,
            sequence_id: 0,
            datasource,
            frame_log: None,
        }
    }

    /// Trace every frame on this stream under `label`
    pub fn enable_frame_logging(&mut self, label: impl Into<String>) {
        self.frame_log = Some(label.into());
    }

    /// Whether frame tracing is enabled
    pub fn frame_logging(&self) -> bool {
        self.frame_log.is_some()
    }

    /// Start a new command: the client's first packet carries sequence 0
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> Error {
        Error::unreachable_with_source(
            self.datasource.as_ref(),
            format!("{action} failed: {e}"),
            e,
        )
    }

    async fn fill(&mut self, wanted: usize) -> Result<()> {
        while self.read_buf.len() < wanted {
            self.read_buf.reserve(wanted - self.read_buf.len());
            let read = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| self.io_error("read", e))?;
            if read == 0 {
                return Err(Error::unreachable(
                    self.datasource.as_ref(),
                    "connection closed by backend",
                ));
            }
        }
        Ok(())
    }

    /// Read one logical packet, joining continuation packets of a
    /// payload of 16MB or more
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut joined: Option<BytesMut> = None;
        loop {
            self.fill(PACKET_HEADER_SIZE).await?;
            let header = &self.read_buf[..PACKET_HEADER_SIZE];
            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let seq = header[3];
            if seq != self.sequence_id {
                return Err(Error::protocol(format!(
                    "packet out of order: expected sequence {}, got {seq}",
                    self.sequence_id
                )));
            }
            self.sequence_id = seq.wrapping_add(1);

            self.fill(PACKET_HEADER_SIZE + len).await?;
            self.read_buf.advance(PACKET_HEADER_SIZE);
            let chunk = &self.read_buf[..len];
            if let Some(label) = &self.frame_log {
                trace!(channel = %label, direction = "in", seq, len, "frame");
            }

            let last = len < MAX_PAYLOAD_LEN;
            let out = match joined.take() {
                Some(mut acc) => {
                    acc.extend_from_slice(chunk);
                    acc
                }
                None if last => {
                    let payload = Bytes::copy_from_slice(chunk);
                    self.read_buf.advance(len);
                    return Ok(payload);
                }
                None => BytesMut::from(chunk),
            };
            self.read_buf.advance(len);
            if last {
                return Ok(out.freeze());
            }
            joined = Some(out);
        }
    }

    /// Write one logical packet, splitting payloads of 16MB or more
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.write_buf.clear();
        let mut offset = 0;
        loop {
            let end = (offset + MAX_PAYLOAD_LEN).min(payload.len());
            let chunk = &payload[offset..end];
            self.write_buf.reserve(PACKET_HEADER_SIZE + chunk.len());
            self.write_buf.put_uint_le(chunk.len() as u64, 3);
            self.write_buf.put_u8(self.sequence_id);
            self.write_buf.put_slice(chunk);
            if let Some(label) = &self.frame_log {
                trace!(
                    channel = %label,
                    direction = "out",
                    seq = self.sequence_id,
                    len = chunk.len(),
                    "frame"
                );
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);
            offset = end;
            if chunk.len() < MAX_PAYLOAD_LEN {
                break;
            }
        }

        let result = self.stream.write_all(&self.write_buf).await;
        self.write_buf.clear();
        result.map_err(|e| self.io_error("write", e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| self.io_error("flush", e))
    }

    /// Reset the sequence and write a command packet
    pub async fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(payload).await
    }

    /// Half-close the write side
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| self.io_error("shutdown", e))
    }
}

impl Drop for PacketStream {
    fn drop(&mut self) {
        self.buffers.deallocate(std::mem::take(&mut self.read_buf));
        self.buffers.deallocate(std::mem::take(&mut self.write_buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (PacketStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = PacketStream::new(
            client.unwrap(),
            Arc::new(BufferPool::new(4)),
            Arc::from("ds_test"),
        );
        (stream, server.unwrap().0)
    }

    #[tokio::test]
    async fn test_write_frames_with_sequence() {
        let (mut stream, mut server) = pair().await;
        stream.write_command(&[0x0E]).await.unwrap();

        let mut frame = [0u8; 5];
        server.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [1, 0, 0, 0, 0x0E]);
    }

    #[tokio::test]
    async fn test_read_validates_sequence() {
        let (mut stream, mut server) = pair().await;
        server.write_all(&[1, 0, 0, 0, 0x00]).await.unwrap();
        server.write_all(&[1, 0, 0, 7, 0x00]).await.unwrap();

        assert_eq!(stream.read_packet().await.unwrap().as_ref(), &[0x00]);
        let err = stream.read_packet().await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_joins_continuation_packets() {
        let (mut stream, mut server) = pair().await;
        let writer = tokio::spawn(async move {
            let mut frame = Vec::with_capacity(MAX_PAYLOAD_LEN + 16);
            frame.extend_from_slice(&[0xFF, 0xFF, 0xFF, 0]);
            frame.resize(4 + MAX_PAYLOAD_LEN, b'a');
            frame.extend_from_slice(&[2, 0, 0, 1, b'b', b'c']);
            server.write_all(&frame).await.unwrap();
            server
        });

        let payload = stream.read_packet().await.unwrap();
        assert_eq!(payload.len(), MAX_PAYLOAD_LEN + 2);
        assert_eq!(&payload[MAX_PAYLOAD_LEN..], b"bc");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_peer_is_unreachable() {
        let (mut stream, server) = pair().await;
        drop(server);
        let err = stream.read_packet().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnreachable { .. }));
    }
}
