use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
};

use crate::scheduler::Suspects;

/// Pieces that at least one peer has, but which are not being downloaded yet.
///
/// Pieces are ordered by `(peer_count, index)`: rarest first, lowest index among equally
/// rare pieces.
pub struct AvailablePieces {
    pieces: HashMap<usize, AvailablePiece>,
    priorities: BTreeSet<(usize, usize)>,
}

impl AvailablePieces {
    pub fn new() -> Self {
        Self {
            pieces: HashMap::new(),
            priorities: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, piece: AvailablePiece) {
        self.priorities.insert(piece.priority());
        self.pieces.insert(piece.index, piece);
    }

    pub fn contains(&self, piece: usize) -> bool {
        self.pieces.contains_key(&piece)
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(piece) = self.pieces.remove(&index) {
            self.priorities.remove(&piece.priority());
        }
    }

    pub fn peer_has_piece(&mut self, index: usize, addr: SocketAddr) {
        if let Some(piece) = self.pieces.get_mut(&index) {
            self.priorities.remove(&piece.priority());
            piece.peers_with_piece.insert(addr);
            self.priorities.insert(piece.priority());
        }
    }

    /// Returns `true` if no other peer has the piece, in which case it is removed.
    pub fn peer_disconnected(&mut self, index: usize, addr: &SocketAddr) -> bool {
        let Some(piece) = self.pieces.get_mut(&index) else {
            return false;
        };
        self.priorities.remove(&piece.priority());
        piece.peers_with_piece.remove(addr);
        if piece.peers_with_piece.is_empty() {
            self.pieces.remove(&index);
            true
        } else {
            self.priorities.insert(piece.priority());
            false
        }
    }

    /// Takes the rarest piece `addr` can supply, skipping pieces it is suspected of corrupting.
    pub fn take_next(&mut self, addr: &SocketAddr, suspects: &Suspects) -> Option<AvailablePiece> {
        let index = self
            .priorities
            .iter()
            .map(|(_, index)| &self.pieces[index])
            .find(|piece| {
                piece.peers_with_piece.contains(addr)
                    && !suspects.avoid(piece.index, addr, &piece.peers_with_piece)
            })?
            .index;

        let piece = self.pieces.remove(&index)?;
        self.priorities.remove(&piece.priority());
        Some(piece)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailablePiece {
    pub index: usize,
    pub peers_with_piece: HashSet<SocketAddr>,
}

impl AvailablePiece {
    pub fn new(index: usize, peers_with_piece: HashSet<SocketAddr>) -> Self {
        Self {
            index,
            peers_with_piece,
        }
    }

    fn priority(&self) -> (usize, usize) {
        (self.peers_with_piece.len(), self.index)
    }
}
