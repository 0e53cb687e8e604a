//! Wire framing: `magic || command || length || checksum || payload`.

use byteorder::{ByteOrder, LittleEndian};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{error, trace};

use xds_crypto::Hasher;

use crate::error::NetworkError;

/// Frame header: 4-byte magic, 12-byte zero-padded ASCII command,
/// 4-byte LE payload length, 4-byte payload checksum.
pub const FRAME_HEADER_LEN: usize = 24;

/// Protocol ceiling on one payload.
pub const MAX_PAYLOAD_LEN: usize = 0x0200_0000;

const READ_BUFFER_LEN: usize = 1024 * 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub command: [u8; 12],
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn for_payload(magic: u32, command: &str, payload: &[u8]) -> Self {
        let mut cmd = [0u8; 12];
        cmd[..command.len()].copy_from_slice(command.as_bytes());

        let digest = Hasher::hash256(payload);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&digest.as_ref()[..4]);

        Self {
            magic,
            command: cmd,
            payload_len: payload.len() as u32,
            checksum,
        }
    }

    pub fn command_str(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.command.len());

        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut out[0..4], self.magic);
        out[4..16].copy_from_slice(&self.command);
        LittleEndian::write_u32(&mut out[16..20], self.payload_len);
        out[20..24].copy_from_slice(&self.checksum);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut command = [0u8; 12];
        command.copy_from_slice(&bytes[4..16]);

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);

        Self {
            magic: LittleEndian::read_u32(&bytes[0..4]),
            command,
            payload_len: LittleEndian::read_u32(&bytes[16..20]),
            checksum,
        }
    }

    fn checksum_matches(&self, payload: &[u8]) -> bool {
        let digest = Hasher::hash256(payload);
        digest.as_ref()[..4] == self.checksum
    }
}

/// A framed TCP connection.
///
/// Reads are cancel-safe: partial frames accumulate in the buffer and
/// survive a dropped `read_frame` future, so peer tasks can select on
/// the node lifetime without losing data.
pub struct FramedStream {
    stream: TcpStream,
    magic: u32,
    buffer: Vec<u8>,
}

impl FramedStream {
    pub fn new(stream: TcpStream, magic: u32) -> Self {
        Self {
            stream,
            magic,
            buffer: Vec::with_capacity(READ_BUFFER_LEN),
        }
    }

    /// Cancel-safe loop that fills the buffer up to `required` bytes.
    async fn buffer_exact(&mut self, required: usize) -> Result<(), NetworkError> {
        loop {
            if self.buffer.len() >= required {
                return Ok(());
            }

            self.stream.readable().await?;

            let remaining = required - self.buffer.len();
            let mut chunk = vec![0u8; remaining.min(READ_BUFFER_LEN)];

            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    trace!("connection closed by peer");
                    return Err(NetworkError::ConnectionClosed);
                }
                Ok(n) => {
                    trace!(n, "read bytes from peer");
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Err(ref e) if e.kind() == tokio::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    error!(?e, "socket read failed");
                    return Err(NetworkError::Io(e));
                }
            }
        }
    }

    /// Read one whole frame: command string plus payload bytes.
    pub async fn read_frame(&mut self) -> Result<(String, Vec<u8>), NetworkError> {
        self.buffer_exact(FRAME_HEADER_LEN).await?;
        let header = FrameHeader::from_bytes(&self.buffer[..FRAME_HEADER_LEN]);

        if header.magic != self.magic {
            return Err(NetworkError::WrongNetwork {
                expected: self.magic,
                found: header.magic,
            });
        }

        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(NetworkError::OversizedPayload(payload_len));
        }

        self.buffer_exact(FRAME_HEADER_LEN + payload_len).await?;

        let payload: Vec<u8> = self
            .buffer
            .drain(..FRAME_HEADER_LEN + payload_len)
            .skip(FRAME_HEADER_LEN)
            .collect();

        if !header.checksum_matches(&payload) {
            return Err(NetworkError::BadChecksum);
        }

        trace!(command = header.command_str(), len = payload_len, "frame in");
        Ok((header.command_str().to_string(), payload))
    }

    /// Write one frame and flush.
    pub async fn write_frame(&mut self, command: &str, payload: &[u8]) -> Result<(), NetworkError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(NetworkError::OversizedPayload(payload.len()));
        }

        let header = FrameHeader::for_payload(self.magic, command, payload);

        self.stream.write_all(&header.to_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;

        if tracing::event_enabled!(tracing::Level::TRACE) {
            trace!(command, data = hex::encode(payload), "frame out");
        }
        Ok(())
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const MAGIC: u32 = 0x5844_5331;

    async fn pair() -> (FramedStream, FramedStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr);
        let server = listener.accept();

        let (client, server) = tokio::join!(client, server);
        let (server, _) = server.unwrap();

        (
            FramedStream::new(client.unwrap(), MAGIC),
            FramedStream::new(server, MAGIC),
        )
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut a, mut b) = pair().await;

        a.write_frame("ping", &[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();
        let (command, payload) = b.read_frame().await.unwrap();

        assert_eq!(command, "ping");
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn empty_payload_frames() {
        let (mut a, mut b) = pair().await;

        a.write_frame("verack", &[]).await.unwrap();
        let (command, payload) = b.read_frame().await.unwrap();

        assert_eq!(command, "verack");
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn wrong_magic_aborts() {
        let (a, mut b) = pair().await;

        let mut foreign = FramedStream::new(a.into_inner(), 0xdead_beef);
        foreign.write_frame("ping", &[0; 8]).await.unwrap();

        assert!(matches!(
            b.read_frame().await,
            Err(NetworkError::WrongNetwork { .. })
        ));
    }

    #[tokio::test]
    async fn corrupted_checksum_detected() {
        let (mut a, mut b) = pair().await;

        // hand-build a frame with a bad checksum
        let mut header = FrameHeader::for_payload(MAGIC, "ping", &[9; 8]);
        header.checksum = [0; 4];

        a.stream.write_all(&header.to_bytes()).await.unwrap();
        a.stream.write_all(&[9; 8]).await.unwrap();
        a.stream.flush().await.unwrap();

        assert!(matches!(b.read_frame().await, Err(NetworkError::BadChecksum)));
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (mut a, mut b) = pair().await;

        for index in 0u8..5 {
            a.write_frame("inv", &[index; 36]).await.unwrap();
        }

        for index in 0u8..5 {
            let (command, payload) = b.read_frame().await.unwrap();
            assert_eq!(command, "inv");
            assert_eq!(payload, vec![index; 36]);
        }
    }
}
