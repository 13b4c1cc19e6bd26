use anyhow::{Result, anyhow};

use crate::bencoding::Value;

/// Extended message id reserved for the extension handshake.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// Id under which we accept `ut_metadata` messages.
pub const UT_METADATA_ID: u8 = 1;

/// Metadata is exchanged in pieces of 16 KiB, the last one possibly shorter.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

const UT_METADATA: &str = "ut_metadata";

const MSG_REQUEST: i64 = 0;
const MSG_DATA: i64 = 1;
const MSG_REJECT: i64 = 2;

/// Extension protocol handshake: `{"m": {"ut_metadata": id}, "metadata_size": n}`.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct ExtendedHandshake {
    /// The id the remote peer wants `ut_metadata` messages sent with.
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<usize>,
}

impl ExtendedHandshake {
    pub fn new(metadata_size: Option<usize>) -> Self {
        Self {
            ut_metadata: Some(UT_METADATA_ID),
            metadata_size,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut extensions = Value::dictionary();
        if let Some(id) = self.ut_metadata {
            extensions = extensions.with_entry(UT_METADATA, Value::Integer(id.into()));
        }
        let mut value = Value::dictionary().with_entry("m", extensions);
        if let Some(size) = self.metadata_size {
            value = value.with_entry("metadata_size", Value::Integer(size as i64));
        }
        value.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut value = Value::from_bytes(payload)?;
        let ut_metadata = match value.try_remove_entry("m")? {
            Some(mut extensions) => match extensions.try_remove_entry(UT_METADATA)? {
                // An id of 0 means the extension is disabled.
                Some(id) => Some(u8::try_from(i64::try_from(id)?)?).filter(|id| *id != 0),
                None => None,
            },
            None => None,
        };
        let metadata_size = match value.try_remove_entry("metadata_size")? {
            Some(size) => Some(size.try_into()?),
            None => None,
        };
        Ok(Self {
            ut_metadata,
            metadata_size,
        })
    }
}

/// `ut_metadata` messages: a bencoded dictionary, followed by raw data for `Data`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MetadataMessage {
    Request(usize),
    Data {
        piece: usize,
        total_size: usize,
        data: Vec<u8>,
    },
    Reject(usize),
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let header = |msg_type: i64, piece: usize| {
            Value::dictionary()
                .with_entry("msg_type", Value::Integer(msg_type))
                .with_entry("piece", Value::Integer(piece as i64))
        };
        match self {
            Self::Request(piece) => header(MSG_REQUEST, *piece).to_bytes(),
            Self::Reject(piece) => header(MSG_REJECT, *piece).to_bytes(),
            Self::Data {
                piece,
                total_size,
                data,
            } => {
                let mut bytes = header(MSG_DATA, *piece)
                    .with_entry("total_size", Value::Integer(*total_size as i64))
                    .to_bytes();
                bytes.extend_from_slice(data);
                bytes
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (mut value, length) = Value::decode_prefix(payload)?;
        let msg_type: i64 = value.remove_entry("msg_type")?.try_into()?;
        let piece = value.remove_entry("piece")?.try_into()?;
        match msg_type {
            MSG_REQUEST => Ok(Self::Request(piece)),
            MSG_REJECT => Ok(Self::Reject(piece)),
            MSG_DATA => {
                let total_size = value.remove_entry("total_size")?.try_into()?;
                Ok(Self::Data {
                    piece,
                    total_size,
                    data: payload[length..].to_vec(),
                })
            }
            other => Err(anyhow!("unknown ut_metadata message type {}", other)),
        }
    }
}

/// Number of metadata pieces for metadata of `size` bytes.
pub fn metadata_pieces(size: usize) -> usize {
    size.div_ceil(METADATA_PIECE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_encoding() {
        let handshake = ExtendedHandshake::new(Some(1234));

        assert_eq!(
            handshake.encode(),
            b"d1:md11:ut_metadatai1ee13:metadata_sizei1234ee"
        );
        assert_eq!(
            ExtendedHandshake::decode(&handshake.encode()).unwrap(),
            handshake
        );
    }

    #[test]
    fn handshake_with_disabled_extension() {
        let handshake = ExtendedHandshake::decode(b"d1:md11:ut_metadatai0eee").unwrap();

        assert_eq!(handshake.ut_metadata, None);
        assert_eq!(handshake.metadata_size, None);
    }

    #[test]
    fn handshake_ignores_unknown_keys() {
        let handshake =
            ExtendedHandshake::decode(b"d1:md6:ut_pexi2e11:ut_metadatai3ee1:v4:teste").unwrap();

        assert_eq!(handshake.ut_metadata, Some(3));
    }

    #[test]
    fn data_message_carries_trailing_bytes() {
        let message = MetadataMessage::Data {
            piece: 1,
            total_size: 20000,
            data: b"raw bytes".to_vec(),
        };

        let encoded = message.encode();

        assert!(encoded.ends_with(b"eraw bytes"));
        assert_eq!(MetadataMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn request_and_reject() {
        assert_eq!(
            MetadataMessage::Request(3).encode(),
            b"d8:msg_typei0e5:piecei3ee"
        );
        assert_eq!(
            MetadataMessage::decode(b"d8:msg_typei2e5:piecei3ee").unwrap(),
            MetadataMessage::Reject(3)
        );
    }

    #[test]
    fn unknown_message_type() {
        assert!(MetadataMessage::decode(b"d8:msg_typei7e5:piecei0ee").is_err());
    }

    #[test]
    fn piece_count() {
        assert_eq!(metadata_pieces(0), 0);
        assert_eq!(metadata_pieces(16384), 1);
        assert_eq!(metadata_pieces(16385), 2);
    }
}
