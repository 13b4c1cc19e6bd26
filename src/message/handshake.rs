use std::io::{Error, ErrorKind, Result};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{AsyncDecoder, AsyncEncoder, PeerId, SHA1_LEN, Sha1, TransportMessage};

const PROTOCOL: &str = "BitTorrent protocol";
const RESERVED_LEN: usize = 8;
const PEER_ID_LEN: usize = 20;

/// Everything after the protocol string
const TAIL_LEN: usize = RESERVED_LEN + SHA1_LEN + PEER_ID_LEN;

/// Bit 20 from the right of the reserved bytes announces the extension protocol
const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// First message on a connection, in both directions:
/// `<pstrlen><pstr><reserved><info_hash><peer_id>`.
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub protocol: String,
    pub reserved: [u8; RESERVED_LEN],
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Handshake of this client, which supports the extension protocol.
    pub fn new(info_hash: Sha1, peer_id: PeerId) -> Self {
        let mut reserved = [0; RESERVED_LEN];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            protocol: PROTOCOL.to_string(),
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn is_standard_protocol(&self) -> bool {
        self.protocol == PROTOCOL
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }
}

impl AsyncDecoder for Handshake {
    async fn decode<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self> {
        let protocol_len = usize::from(stream.read_u8().await?);
        let mut buf = vec![0; protocol_len + TAIL_LEN];
        stream.read_exact(&mut buf).await?;

        let (protocol, tail) = buf.split_at(protocol_len);
        let (reserved, tail) = tail.split_at(RESERVED_LEN);
        let (info_hash, peer_id) = tail.split_at(SHA1_LEN);
        let protocol = std::str::from_utf8(protocol)
            .map_err(|err| Error::new(ErrorKind::InvalidData, err))?
            .to_string();
        let invalid = |_| Error::new(ErrorKind::InvalidData, "malformed handshake");
        Ok(Self {
            protocol,
            reserved: reserved.try_into().map_err(invalid)?,
            info_hash: Sha1(info_hash.try_into().map_err(invalid)?),
            peer_id: PeerId(peer_id.try_into().map_err(invalid)?),
        })
    }
}

impl AsyncEncoder for Handshake {
    async fn encode<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<()> {
        let protocol_len = u8::try_from(self.protocol.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "protocol string too long"))?;
        let mut buf = Vec::with_capacity(self.transport_bytes());
        buf.push(protocol_len);
        buf.extend_from_slice(self.protocol.as_bytes());
        buf.extend_from_slice(&self.reserved);
        buf.extend_from_slice(&self.info_hash.0);
        buf.extend_from_slice(&self.peer_id.0);
        stream.write_all(&buf).await?;
        stream.flush().await
    }
}

impl TransportMessage for Handshake {
    fn transport_bytes(&self) -> usize {
        1 + self.protocol.len() + TAIL_LEN
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn wire_layout() {
        let handshake = Handshake::new(Sha1([0xaa; 20]), PeerId([0xbb; 20]));
        let mut bytes = Vec::new();

        handshake.encode(&mut bytes).await.unwrap();

        assert_eq!(bytes.len(), 68);
        assert_eq!(handshake.transport_bytes(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8, 0, 0, 0, 0, 0x10, 0, 0]);
        assert_eq!(&bytes[28..48], &[0xaau8; 20]);
        assert_eq!(&bytes[48..68], &[0xbbu8; 20]);

        let decoded = Handshake::decode(&mut Cursor::new(bytes)).await.unwrap();
        assert_eq!(decoded, handshake);
        assert!(decoded.is_standard_protocol());
        assert!(decoded.supports_extensions());
    }

    #[tokio::test]
    async fn peer_without_extensions() {
        let mut bytes = vec![19];
        bytes.extend_from_slice(PROTOCOL.as_bytes());
        bytes.extend_from_slice(&[0; 8]);
        bytes.extend_from_slice(&[1; 20]);
        bytes.extend_from_slice(&[2; 20]);

        let handshake = Handshake::decode(&mut Cursor::new(bytes)).await.unwrap();

        assert!(!handshake.supports_extensions());
        assert_eq!(handshake.info_hash, Sha1([1; 20]));
    }

    #[tokio::test]
    async fn other_protocols_are_flagged() {
        let mut bytes = vec![4];
        bytes.extend_from_slice(b"HTTP");
        bytes.extend_from_slice(&[0; TAIL_LEN]);

        let handshake = Handshake::decode(&mut Cursor::new(bytes)).await.unwrap();

        assert!(!handshake.is_standard_protocol());
    }

    #[tokio::test]
    async fn truncated_handshake() {
        let bytes = vec![19, b'B', b'i', b't'];

        assert!(Handshake::decode(&mut Cursor::new(bytes)).await.is_err());
    }
}
