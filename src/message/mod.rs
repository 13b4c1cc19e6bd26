mod block;
mod codec;
mod extension;
mod handshake;

use bit_set::BitSet;

pub use block::*;
pub use codec::*;
pub use extension::*;
pub use handshake::*;

/// Peer wire message, exchanged after the handshake as `<u32 length><u8 id><payload>`.
#[derive(PartialEq, Eq, Clone)]
pub enum Message {
    /// Empty frame, sent periodically so idle connections are not dropped
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The sender verified this piece
    Have(usize),
    /// Pieces the sender has, high bit of the first byte is piece 0. Only valid as the first
    /// message; its length must match the piece count and spare bits must be clear.
    Bitfield(BitSet),
    Request(Block),
    Piece(BlockData),
    /// Withdraws a request, mostly in endgame
    Cancel(Block),
    /// DHT port of the sender, ignored
    Port(u16),
    /// Extension protocol message with its extended id. Id 0 is the extension handshake.
    Extended(u8, Vec<u8>),
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use crate::core::TransportMessage;

    use super::*;

    async fn encode(message: Message) -> Vec<u8> {
        let mut framed = Framed::new(Cursor::new(Vec::new()), MessageCodec::new(64));
        framed.send(message).await.expect("unable to write");
        framed.into_inner().into_inner()
    }

    async fn decode_all(bytes: &[u8]) -> Vec<std::io::Result<Message>> {
        let framed = Framed::new(Cursor::new(bytes.to_vec()), MessageCodec::new(64));
        framed.collect().await
    }

    async fn decode(bytes: &[u8]) -> std::io::Result<Message> {
        decode_all(bytes).await.remove(0)
    }

    #[tokio::test]
    async fn encode_wire_format() {
        assert_eq!(encode(Message::KeepAlive).await, [0u8, 0, 0, 0]);
        assert_eq!(encode(Message::Interested).await, [0u8, 0, 0, 1, 2]);
        assert_eq!(encode(Message::Have(258)).await, [0u8, 0, 0, 5, 4, 0, 0, 1, 2]);
        assert_eq!(
            encode(Message::Request(Block::new(1, 16384, 16384))).await,
            [0u8, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );
        assert_eq!(
            encode(Message::Piece(BlockData::new(Block::new(2, 4, 3), vec![7, 8, 9]))).await,
            [0u8, 0, 0, 12, 7, 0, 0, 0, 2, 0, 0, 0, 4, 7, 8, 9]
        );
        assert_eq!(
            encode(Message::Extended(3, b"de".to_vec())).await,
            [0u8, 0, 0, 4, 20, 3, b'd', b'e']
        );
    }

    #[tokio::test]
    async fn bitfield_is_padded_to_whole_bytes() {
        let mut pieces = BitSet::with_capacity(10);
        pieces.insert(0);
        pieces.insert(9);
        let message = Message::Bitfield(pieces);
        assert_eq!(message.transport_bytes(), 7);

        let bytes = encode(message).await;

        assert_eq!(bytes, [0u8, 0, 0, 3, 5, 0b1000_0000, 0b0100_0000]);
        let Message::Bitfield(decoded) = decode(&bytes).await.unwrap() else {
            panic!("not a bitfield");
        };
        assert_eq!(decoded.iter().collect::<Vec<_>>(), vec![0, 9]);
        assert_eq!(decoded.get_ref().len(), 16);
    }

    #[tokio::test]
    async fn decode_consecutive_frames() {
        let bytes = [
            0, 0, 0, 0, // keep-alive
            0, 0, 0, 1, 1, // unchoke
            0, 0, 0, 5, 4, 0, 0, 0, 7, // have
            0, 0, 0, 3, 9, 0x1a, 0xe1, // port
            0, 0, 0, 13, 8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 8, // cancel
        ];

        let messages: Vec<Message> = decode_all(&bytes)
            .await
            .into_iter()
            .map(|message| message.unwrap())
            .collect();

        assert_eq!(
            messages,
            vec![
                Message::KeepAlive,
                Message::Unchoke,
                Message::Have(7),
                Message::Port(6881),
                Message::Cancel(Block::new(0, 0, 8)),
            ]
        );
    }

    #[tokio::test]
    async fn piece_length_comes_from_the_frame() {
        let message = decode(&[0, 0, 0, 9, 7, 0, 0, 0, 1, 0, 0, 0, 0]).await.unwrap();

        assert_eq!(message, Message::Piece(BlockData::new(Block::new(1, 0, 0), Vec::new())));
    }

    #[tokio::test]
    async fn reject_frames_over_the_limit() {
        let result = decode(&[0, 0, 1, 0, 7]).await;

        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn reject_payloads_of_the_wrong_size() {
        assert!(decode(&[0, 0, 0, 2, 0, 0]).await.is_err());
        assert!(decode(&[0, 0, 0, 4, 4, 0, 0, 0]).await.is_err());
        assert!(decode(&[0, 0, 0, 1, 20]).await.is_err());
    }

    #[tokio::test]
    async fn reject_unknown_ids() {
        assert!(decode(&[0, 0, 0, 1, 42]).await.is_err());
    }
}
