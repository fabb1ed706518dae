//! Wire codec.
//!
//! Every unit on the wire is a frame: a fixed 25-byte header followed by
//! exactly `content_length` payload bytes.
//!
//! ```text
//! +------+------------------+------------------------+---------------------+
//! | kind | correlation id   | content length         | payload             |
//! | 1 B  | 16 B             | 8 B unsigned BE        | content_length B    |
//! +------+------------------+------------------------+---------------------+
//! ```
//!
//! `kind`: 0 = Async, 1 = SyncRequest, 2 = SyncResponse.
//!
//! The header is self-delimiting, so framing never needs the payload in
//! memory: the payload can be handed to a consumer as a bounded stream view.
//! Decoding keeps no cross-frame state; as long as each connection has
//! exactly one reader loop, interleaved reads cannot corrupt framing.
//! A truncated header or a stream that ends before `content_length` bytes is
//! a protocol error that is fatal for that connection only.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MeshError, Result};

pub const HEADER_LEN: usize = 25;

/// Opaque token linking a sync request to its response. Generated fresh per
/// outstanding request; 16 random bytes.
pub type CorrelationId = [u8; 16];

pub fn new_correlation_id() -> std::io::Result<CorrelationId> {
    let mut id = [0u8; 16];
    getrandom::getrandom(&mut id).map_err(|e| std::io::Error::other(e.to_string()))?;
    Ok(id)
}

/// Correlation id used for frames that carry none (async traffic).
pub const NO_CORRELATION: CorrelationId = [0u8; 16];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Async = 0,
    SyncRequest = 1,
    SyncResponse = 2,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Async),
            1 => Some(FrameKind::SyncRequest),
            2 => Some(FrameKind::SyncResponse),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub correlation_id: CorrelationId,
    pub content_length: u64,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[1..17].copy_from_slice(&self.correlation_id);
        buf[17..25].copy_from_slice(&self.content_length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let kind = FrameKind::from_u8(buf[0])
            .ok_or_else(|| MeshError::protocol(format!("unknown frame kind {}", buf[0])))?;
        let mut correlation_id = [0u8; 16];
        correlation_id.copy_from_slice(&buf[1..17]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&buf[17..25]);
        Ok(Self {
            kind,
            correlation_id,
            content_length: u64::from_be_bytes(len_bytes),
        })
    }
}

/// Read the next frame header.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary (graceful
/// remote close). A stream that ends partway through a header is a protocol
/// error.
pub async fn read_header<R>(reader: &mut R) -> Result<Option<FrameHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(MeshError::protocol(format!(
                "stream ended inside frame header ({filled} of {HEADER_LEN} bytes)"
            )));
        }
        filled += n;
    }
    FrameHeader::decode(&buf).map(Some)
}

/// Write one complete frame. The caller serializes writers per connection;
/// this function assumes it is the only writer for the duration of the call.
pub async fn write_frame<W>(
    writer: &mut W,
    kind: FrameKind,
    correlation_id: CorrelationId,
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        kind,
        correlation_id,
        content_length: payload.len() as u64,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Bounded view over one frame's payload bytes.
///
/// Reads at most `content_length` bytes from the underlying connection and
/// reports end-of-payload as a zero-length chunk. The connection's read loop
/// must [`drain`](FrameBody::drain) whatever the consumer left unread, or
/// framing for the next frame would be lost.
pub struct FrameBody<'a> {
    reader: &'a mut (dyn AsyncRead + Send + Unpin),
    remaining: u64,
}

impl<'a> FrameBody<'a> {
    pub fn new(reader: &'a mut (dyn AsyncRead + Send + Unpin), content_length: u64) -> Self {
        Self {
            reader,
            remaining: content_length,
        }
    }

    /// Bytes of payload not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the next chunk into `buf`. Returns 0 once the payload is
    /// exhausted. A stream that ends early is a protocol error.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(MeshError::protocol(format!(
                "stream ended with {} payload bytes still expected",
                self.remaining
            )));
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Read the entire remaining payload, appending exactly the bytes each
    /// chunk produced.
    pub async fn read_to_end(&mut self, chunk_size: usize) -> Result<Vec<u8>> {
        // Capacity is capped at one chunk so a hostile length prefix cannot
        // force a huge allocation up front.
        let mut out = Vec::with_capacity(self.remaining.min(chunk_size as u64) as usize);
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = self.read_chunk(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Discard whatever the consumer left unread.
    pub async fn drain(&mut self, chunk_size: usize) -> Result<()> {
        let mut buf = vec![0u8; chunk_size.max(1)];
        while self.read_chunk(&mut buf).await? > 0 {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader {
            kind: FrameKind::SyncRequest,
            correlation_id: [0xAB; 16],
            content_length: 123456789,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(FrameHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let header = FrameHeader {
            kind: FrameKind::SyncResponse,
            correlation_id: [7u8; 16],
            content_length: 0x0102030405060708,
        };
        let encoded = header.encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..17], &[7u8; 16]);
        assert_eq!(&encoded[17..25], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 9;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(MeshError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn read_header_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(server.write_all(&[]).await); // nothing written
        drop(server);
        let mut reader = client;
        assert!(read_header(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_header_truncated_is_protocol_error() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(&[0u8; 10]).await.unwrap();
        drop(server);
        let mut reader = client;
        assert!(matches!(
            read_header(&mut reader).await,
            Err(MeshError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let corr = [3u8; 16];
        write_frame(&mut client, FrameKind::Async, corr, b"hello mesh")
            .await
            .unwrap();

        let header = read_header(&mut server).await.unwrap().unwrap();
        assert_eq!(header.kind, FrameKind::Async);
        assert_eq!(header.correlation_id, corr);
        assert_eq!(header.content_length, 10);

        let mut body = FrameBody::new(&mut server, header.content_length);
        let payload = body.read_to_end(4).await.unwrap();
        assert_eq!(payload, b"hello mesh");
        assert_eq!(body.remaining(), 0);
    }

    #[tokio::test]
    async fn declared_length_beyond_stream_end_is_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let header = FrameHeader {
            kind: FrameKind::Async,
            correlation_id: NO_CORRELATION,
            content_length: 100,
        };
        client.write_all(&header.encode()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);

        let decoded = read_header(&mut server).await.unwrap().unwrap();
        let mut body = FrameBody::new(&mut server, decoded.content_length);
        assert!(matches!(
            body.read_to_end(16).await,
            Err(MeshError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn drain_consumes_leftover_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, FrameKind::Async, NO_CORRELATION, &[1u8; 50])
            .await
            .unwrap();
        write_frame(&mut client, FrameKind::Async, NO_CORRELATION, b"next")
            .await
            .unwrap();

        let first = read_header(&mut server).await.unwrap().unwrap();
        let mut body = FrameBody::new(&mut server, first.content_length);
        let mut buf = [0u8; 10];
        body.read_chunk(&mut buf).await.unwrap(); // consumer reads a little
        body.drain(8).await.unwrap();

        // Framing survives: the next header parses.
        let second = read_header(&mut server).await.unwrap().unwrap();
        assert_eq!(second.content_length, 4);
    }
}
