use std::collections::BTreeSet;
use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use bit_set::BitSet;

use crate::core::Sha1;
use crate::message::BlockData;
use crate::scheduler::Blocks;
use crate::torrent::Info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    /// Some blocks were received
    Downloading,
    /// Every block was received, the hash is being checked
    Verifying,
    Verified,
}

/// Assembles blocks into pieces and tracks which pieces are verified.
///
/// Blocks are buffered per piece until all of them arrived. The assembled piece is handed out
/// once for hashing; it becomes `Verified` or goes back to `Missing` depending on the result.
pub struct PieceStore {
    block_size: usize,
    pieces: Vec<Piece>,
    verified: BitSet,
}

struct Piece {
    state: PieceState,
    offset: usize,
    size: usize,
    blocks: Vec<Option<Vec<u8>>>,
    contributors: BTreeSet<SocketAddr>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Incomplete,
    /// Block was already received, or its piece is verified
    Duplicate,
    Assembled(AssembledPiece),
}

#[derive(Debug, PartialEq, Eq)]
pub struct AssembledPiece {
    pub piece: usize,
    /// Offset of the piece in the torrent content
    pub offset: usize,
    pub data: Vec<u8>,
    pub contributors: Vec<SocketAddr>,
}

impl AssembledPiece {
    pub fn matches(&self, expected: &Sha1) -> bool {
        Sha1::digest(&self.data) == *expected
    }
}

impl PieceStore {
    pub fn new(info: &Info, block_size: usize, has_pieces: &BitSet) -> Self {
        let mut verified = BitSet::with_capacity(info.total_pieces());
        let pieces = (0..info.total_pieces())
            .map(|piece| {
                let state = if has_pieces.contains(piece) {
                    verified.insert(piece);
                    PieceState::Verified
                } else {
                    PieceState::Missing
                };
                Piece {
                    state,
                    offset: info.piece_offset(piece),
                    size: info.piece_size(piece),
                    blocks: Vec::new(),
                    contributors: BTreeSet::new(),
                }
            })
            .collect();
        Self {
            block_size,
            pieces,
            verified,
        }
    }

    pub fn write_block(&mut self, block_data: BlockData, contributor: SocketAddr) -> Result<WriteOutcome> {
        let block_size = self.block_size;
        let piece = self
            .pieces
            .get_mut(block_data.piece)
            .ok_or_else(|| anyhow!("invalid piece {}", block_data.piece))?;
        if block_data.offset % block_size != 0 || block_data.offset >= piece.size {
            return Err(anyhow!("invalid block offset {}", block_data.offset));
        }
        let expected_length = block_size.min(piece.size - block_data.offset);
        if block_data.data.len() != expected_length {
            return Err(anyhow!(
                "invalid block length {}, expected {}",
                block_data.data.len(),
                expected_length
            ));
        }

        match piece.state {
            PieceState::Verified | PieceState::Verifying => return Ok(WriteOutcome::Duplicate),
            PieceState::Missing => {
                piece.blocks = vec![None; Blocks::count(piece.size, block_size)];
                piece.state = PieceState::Downloading;
            }
            PieceState::Downloading => (),
        }

        let slot = &mut piece.blocks[block_data.offset / block_size];
        if slot.is_some() {
            return Ok(WriteOutcome::Duplicate);
        }
        *slot = Some(block_data.data);
        piece.contributors.insert(contributor);

        if piece.blocks.iter().any(Option::is_none) {
            return Ok(WriteOutcome::Incomplete);
        }

        let mut data = Vec::with_capacity(piece.size);
        for block in piece.blocks.drain(..).flatten() {
            data.extend(block);
        }
        piece.state = PieceState::Verifying;
        Ok(WriteOutcome::Assembled(AssembledPiece {
            piece: block_data.piece,
            offset: piece.offset,
            data,
            contributors: std::mem::take(&mut piece.contributors).into_iter().collect(),
        }))
    }

    pub fn verified(&mut self, piece: usize) {
        if let Some(state) = self.pieces.get_mut(piece) {
            state.state = PieceState::Verified;
            self.verified.insert(piece);
        }
    }

    /// Discards an assembled piece that did not match its hash.
    pub fn failed(&mut self, piece: usize) {
        if let Some(state) = self.pieces.get_mut(piece) {
            state.state = PieceState::Missing;
            state.blocks.clear();
            state.contributors.clear();
        }
    }

    pub fn state(&self, piece: usize) -> Option<PieceState> {
        self.pieces.get(piece).map(|piece| piece.state)
    }

    pub fn is_verified(&self, piece: usize) -> bool {
        self.verified.contains(piece)
    }

    pub fn verified_pieces(&self) -> &BitSet {
        &self.verified
    }
}
