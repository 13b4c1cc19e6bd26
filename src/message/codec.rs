use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind, Result};

use bit_set::BitSet;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::TransportMessage;
use crate::message::{Block, BlockData, Message};

/// Size of the big-endian length prefix of every frame
const PREFIX_LEN: usize = 4;

/// Message ids of the peer wire protocol
mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const EXTENDED: u8 = 20;
}

/// Framing of peer wire messages.
///
/// A frame announcing more than `max_length` bytes fails the stream as soon as its prefix
/// is read, so a peer cannot make the client buffer arbitrary amounts of data.
pub struct MessageCodec {
    max_length: usize,
}

impl MessageCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(id::CHOKE),
            Message::Unchoke => Some(id::UNCHOKE),
            Message::Interested => Some(id::INTERESTED),
            Message::NotInterested => Some(id::NOT_INTERESTED),
            Message::Have(_) => Some(id::HAVE),
            Message::Bitfield(_) => Some(id::BITFIELD),
            Message::Request(_) => Some(id::REQUEST),
            Message::Piece(_) => Some(id::PIECE),
            Message::Cancel(_) => Some(id::CANCEL),
            Message::Port(_) => Some(id::PORT),
            Message::Extended(..) => Some(id::EXTENDED),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<()> {
        let frame_len = message.transport_bytes();
        dst.reserve(frame_len);
        dst.put_u32((frame_len - PREFIX_LEN) as u32);
        if let Some(id) = message.id() {
            dst.put_u8(id);
        }
        match message {
            Message::Have(piece) => dst.put_u32(piece as u32),
            Message::Bitfield(pieces) => dst.extend_from_slice(&pieces.get_ref().to_bytes()),
            Message::Request(block) | Message::Cancel(block) => {
                dst.put_u32(block.piece as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.length as u32);
            }
            Message::Piece(block_data) => {
                dst.put_u32(block_data.piece as u32);
                dst.put_u32(block_data.offset as u32);
                dst.extend_from_slice(&block_data.data);
            }
            Message::Port(port) => dst.put_u16(port),
            Message::Extended(extended_id, payload) => {
                dst.put_u8(extended_id);
                dst.extend_from_slice(&payload);
            }
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => (),
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Error = Error;
    type Item = Message;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(prefix) = src.get(..PREFIX_LEN) else {
            return Ok(None);
        };
        let length = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if length > self.max_length {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame of {} bytes, limit is {}", length, self.max_length),
            ));
        }
        if src.len() < PREFIX_LEN + length {
            src.reserve(PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let mut frame = src.split_to(length);
        if frame.is_empty() {
            return Ok(Some(Message::KeepAlive));
        }
        let id = frame.get_u8();
        parse_payload(id, frame).map(Some)
    }
}

/// Builds the message from the frame, after its id. The payload size must fit the id.
fn parse_payload(message_id: u8, mut payload: BytesMut) -> Result<Message> {
    let message = match (message_id, payload.len()) {
        (id::CHOKE, 0) => Message::Choke,
        (id::UNCHOKE, 0) => Message::Unchoke,
        (id::INTERESTED, 0) => Message::Interested,
        (id::NOT_INTERESTED, 0) => Message::NotInterested,
        (id::HAVE, 4) => Message::Have(payload.get_u32() as usize),
        (id::BITFIELD, _) => Message::Bitfield(BitSet::from_bytes(&payload)),
        (id::REQUEST, 12) => Message::Request(parse_block(&mut payload)),
        (id::CANCEL, 12) => Message::Cancel(parse_block(&mut payload)),
        (id::PIECE, 8..) => {
            let piece = payload.get_u32() as usize;
            let offset = payload.get_u32() as usize;
            Message::Piece(BlockData::new(
                Block::new(piece, offset, payload.len()),
                payload.to_vec(),
            ))
        }
        (id::PORT, 2) => Message::Port(payload.get_u16()),
        (id::EXTENDED, 1..) => {
            let extended_id = payload.get_u8();
            Message::Extended(extended_id, payload.to_vec())
        }
        (message_id, size) => {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("message {} with {} byte payload", message_id, size),
            ));
        }
    };
    Ok(message)
}

fn parse_block(payload: &mut BytesMut) -> Block {
    let piece = payload.get_u32() as usize;
    let offset = payload.get_u32() as usize;
    let length = payload.get_u32() as usize;
    Block::new(piece, offset, length)
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "KeepAlive"),
            Message::Choke => write!(f, "Choke"),
            Message::Unchoke => write!(f, "Unchoke"),
            Message::Interested => write!(f, "Interested"),
            Message::NotInterested => write!(f, "NotInterested"),
            Message::Have(piece) => write!(f, "Have({})", piece),
            // Bitfields and block payloads are too noisy for the logs
            Message::Bitfield(pieces) => write!(f, "Bitfield({} pieces)", pieces.len()),
            Message::Request(block) => write!(f, "Request({:?})", block),
            Message::Piece(block_data) => write!(f, "Piece({:?})", block_data),
            Message::Cancel(block) => write!(f, "Cancel({:?})", block),
            Message::Port(port) => write!(f, "Port({})", port),
            Message::Extended(id, payload) => {
                write!(f, "Extended({}, {} bytes)", id, payload.len())
            }
        }
    }
}

impl TransportMessage for Message {
    fn transport_bytes(&self) -> usize {
        let payload = match self {
            Self::KeepAlive
            | Self::Choke
            | Self::Unchoke
            | Self::Interested
            | Self::NotInterested => 0,
            Self::Have(_) => 4,
            Self::Bitfield(pieces) => pieces.get_ref().len().div_ceil(8),
            Self::Request(_) | Self::Cancel(_) => 12,
            Self::Piece(block_data) => 8 + block_data.data.len(),
            Self::Port(_) => 2,
            Self::Extended(_, payload) => 1 + payload.len(),
        };
        let id = if self.id().is_some() { 1 } else { 0 };
        PREFIX_LEN + id + payload
    }
}
