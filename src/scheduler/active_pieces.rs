use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    net::SocketAddr,
};

use bit_set::BitSet;

use crate::message::Block;
use crate::scheduler::blocks::Blocks;

/// Pieces with at least one block requested, keyed by index so iteration is deterministic.
pub struct ActivePieces(BTreeMap<usize, ActivePiece>);

impl ActivePieces {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, piece: ActivePiece) {
        self.0.insert(piece.index, piece);
    }

    pub fn get_mut(&mut self, piece: usize) -> Option<&mut ActivePiece> {
        self.0.get_mut(&piece)
    }

    pub fn remove(&mut self, piece: usize) -> Option<ActivePiece> {
        self.0.remove(&piece)
    }

    pub fn peer_pieces<'a>(
        &'a mut self,
        addr: &'a SocketAddr,
    ) -> impl Iterator<Item = &'a mut ActivePiece> {
        self.0
            .values_mut()
            .filter(move |piece| piece.peers_with_piece.contains(addr))
    }
}

#[derive(Debug)]
pub struct ActivePiece {
    pub index: usize,
    block_size: usize,
    total_blocks: usize,
    received: BitSet,
    unassigned_blocks: Blocks,
    released_blocks: BTreeSet<Block>,
    /// Peers each outstanding block was requested from. More than one only in endgame.
    in_flight: BTreeMap<Block, BTreeSet<SocketAddr>>,
    pub peers_with_piece: HashSet<SocketAddr>,
}

impl ActivePiece {
    pub fn new(
        index: usize,
        piece_size: usize,
        block_size: usize,
        peers_with_piece: HashSet<SocketAddr>,
    ) -> Self {
        Self {
            index,
            block_size,
            total_blocks: Blocks::count(piece_size, block_size),
            received: BitSet::with_capacity(Blocks::count(piece_size, block_size)),
            unassigned_blocks: Blocks::new(index, piece_size, block_size),
            released_blocks: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            peers_with_piece,
        }
    }

    pub fn peer_has_piece(&mut self, addr: SocketAddr) {
        self.peers_with_piece.insert(addr);
    }

    /// Returns `true` if no more connected peers have this piece.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) -> bool {
        self.peers_with_piece.remove(addr);
        self.peers_with_piece.is_empty()
    }

    pub fn is_in_flight(&self, addr: &SocketAddr, block: &Block) -> bool {
        self.in_flight
            .get(block)
            .is_some_and(|peers| peers.contains(addr))
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.total_blocks
    }

    /// Records the first arrival of `block`. Returns the other peers it was requested from,
    /// which should be sent a cancel.
    pub fn block_received(&mut self, addr: &SocketAddr, block: &Block) -> Vec<SocketAddr> {
        self.received.insert(block.index(self.block_size));
        self.released_blocks.remove(block);
        self.in_flight
            .remove(block)
            .map(|peers| peers.into_iter().filter(|peer| peer != addr).collect())
            .unwrap_or_default()
    }

    /// Gives up on a request. The block returns to the pool unless another peer still has it
    /// in flight.
    pub fn unassign(&mut self, addr: &SocketAddr, block: Block) {
        if let Some(peers) = self.in_flight.get_mut(&block) {
            peers.remove(addr);
            if peers.is_empty() {
                self.in_flight.remove(&block);
                if !self.received.contains(block.index(self.block_size)) {
                    self.released_blocks.insert(block);
                }
            }
        }
    }

    /// Assigns up to `n` blocks nobody has requested yet, released blocks first.
    pub fn try_assign_n(&mut self, addr: SocketAddr, n: usize, dest: &mut Vec<Block>) -> usize {
        let mut assigned = 0;
        while assigned < n {
            let block = match self.released_blocks.pop_first() {
                Some(block) => block,
                None => match self.unassigned_blocks.next() {
                    Some(block) => block,
                    None => break,
                },
            };
            self.in_flight.entry(block).or_default().insert(addr);
            dest.push(block);
            assigned += 1;
        }
        assigned
    }

    /// Endgame: assigns up to `n` blocks already requested from other peers.
    pub fn assign_duplicates(&mut self, addr: SocketAddr, n: usize, dest: &mut Vec<Block>) -> usize {
        let mut assigned = 0;
        for (block, peers) in self.in_flight.iter_mut() {
            if assigned == n {
                break;
            }
            if peers.insert(addr) {
                dest.push(*block);
                assigned += 1;
            }
        }
        assigned
    }
}
