mod active_pieces;
mod available_pieces;
mod blocks;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
};

use bit_set::BitSet;

use crate::engine::Config;
use crate::message::Block;
use crate::torrent::Info;
use active_pieces::*;
use available_pieces::*;

pub use blocks::Blocks;

/// Decides which blocks to request from which peer.
///
/// Only pieces the client is still missing are tracked. Each missing piece is in exactly one
/// of these states:
/// - orphan: no connected peer has announced it
/// - available: some peers have it, none of its blocks were requested yet
/// - active: blocks are being requested
/// - verifying: every block arrived, waiting for the hash check
///
/// Pieces are picked rarest first; active pieces are completed before new ones are started.
/// Once fewer than `endgame_threshold` pieces remain, blocks already in flight may also be
/// requested from other peers.
pub struct Scheduler {
    info: Arc<Info>,
    block_size: usize,
    max_requests: usize,
    endgame_threshold: usize,

    /// Connected peers, ordered so that assignment across peers is deterministic
    peers: BTreeMap<SocketAddr, Peer>,

    /// Pieces not verified yet
    missing: BitSet,

    orphan_pieces: BitSet,
    available_pieces: AvailablePieces,
    active_pieces: ActivePieces,
    verifying: HashMap<usize, HashSet<SocketAddr>>,

    /// Peers that contributed to a piece that failed verification
    suspects: Suspects,

    /// No new requests are issued once draining
    draining: bool,
}

impl Scheduler {
    pub fn new(info: Arc<Info>, config: &Config, has_pieces: &BitSet) -> Self {
        let missing: BitSet = (0..info.total_pieces())
            .filter(|piece| !has_pieces.contains(*piece))
            .collect();
        Self {
            info,
            block_size: config.block_size_bytes(),
            max_requests: config.max_concurrent_requests_per_peer,
            endgame_threshold: config.endgame_threshold,
            peers: BTreeMap::new(),
            orphan_pieces: missing.clone(),
            missing,
            available_pieces: AvailablePieces::new(),
            active_pieces: ActivePieces::new(),
            verifying: HashMap::new(),
            suspects: Suspects::default(),
            draining: false,
        }
    }

    /// Number of pieces not verified yet.
    pub fn remaining(&self) -> usize {
        self.missing.len()
    }

    pub fn in_endgame(&self) -> bool {
        self.remaining() < self.endgame_threshold
    }

    pub fn is_interesting(&self, addr: &SocketAddr) -> bool {
        self.peers.get(addr).is_some_and(|peer| peer.interested)
    }

    pub fn peer_choked(&mut self, addr: SocketAddr) -> Vec<(SocketAddr, Block)> {
        let peer = self.peers.entry(addr).or_default();
        peer.choking = true;
        for block in std::mem::take(&mut peer.assigned_blocks) {
            if let Some(piece) = self.active_pieces.get_mut(block.piece) {
                piece.unassign(&addr, block);
            }
        }
        self.assign_all(Some(addr))
    }

    pub fn peer_unchoked(&mut self, addr: SocketAddr) -> Vec<Block> {
        let peer = self.peers.entry(addr).or_default();
        if !peer.choking {
            // Client was already unchoked, do nothing
            return Vec::new();
        }
        peer.choking = false;
        self.try_assign(&addr)
    }

    pub fn peer_has_piece(&mut self, addr: SocketAddr, piece: usize) -> PeerPieceResponse {
        if !self.missing.contains(piece) {
            // Client already has the piece (or the index is out of range)
            return PeerPieceResponse::NoAction;
        }

        let peer = self.peers.entry(addr).or_default();
        if !peer.has_pieces.insert(piece) {
            return PeerPieceResponse::NoAction;
        }
        let express_interest = !peer.interested;
        peer.interested = true;
        let choking = peer.choking;

        if self.orphan_pieces.remove(piece) {
            self.available_pieces
                .insert(AvailablePiece::new(piece, HashSet::from([addr])));
        } else if self.available_pieces.contains(piece) {
            self.available_pieces.peer_has_piece(piece, addr);
        } else if let Some(active_piece) = self.active_pieces.get_mut(piece) {
            active_piece.peer_has_piece(addr);
        } else if let Some(peers) = self.verifying.get_mut(&piece) {
            peers.insert(addr);
        }

        let blocks = if choking {
            Vec::new()
        } else {
            self.try_assign(&addr)
        };
        match (express_interest, blocks.is_empty()) {
            (true, true) => PeerPieceResponse::ExpressInterest,
            (true, false) => PeerPieceResponse::ExpressInterestAndRequest(blocks),
            (false, true) => PeerPieceResponse::NoAction,
            (false, false) => PeerPieceResponse::RequestBlocks(blocks),
        }
    }

    pub fn block_in_flight(&self, addr: &SocketAddr, block: &Block) -> bool {
        self.peers
            .get(addr)
            .is_some_and(|peer| peer.assigned_blocks.contains(block))
    }

    /// Handles the arrival of a requested block. Only the first arrival of a block is
    /// accepted; other peers it was requested from get cancelled.
    pub fn block_downloaded(&mut self, addr: &SocketAddr, block: &Block) -> BlockReceived {
        let mut received = BlockReceived::default();
        let assigned = self.peers.get_mut(addr);
        if !assigned.is_some_and(|peer| peer.assigned_blocks.remove(block)) {
            return received;
        }
        let Some(piece) = self.active_pieces.get_mut(block.piece) else {
            return received;
        };

        received.accepted = true;
        for other in piece.block_received(addr, block) {
            if let Some(peer) = self.peers.get_mut(&other) {
                peer.assigned_blocks.remove(block);
            }
            received.cancels.push((other, *block));
        }
        if piece.is_complete() {
            if let Some(piece) = self.active_pieces.remove(block.piece) {
                self.verifying.insert(piece.index, piece.peers_with_piece);
            }
        }

        let mut refill = vec![*addr];
        refill.extend(received.cancels.iter().map(|(other, _)| *other));
        for peer in refill {
            for next_block in self.try_assign(&peer) {
                received.requests.push((peer, next_block));
            }
        }
        received
    }

    /// Gives up on a block requested from `addr`. The block is offered to other peers
    /// before `addr`.
    pub fn release(&mut self, addr: &SocketAddr, block: Block) -> Vec<(SocketAddr, Block)> {
        let assigned = self.peers.get_mut(addr);
        if !assigned.is_some_and(|peer| peer.assigned_blocks.remove(&block)) {
            return Vec::new();
        }
        if let Some(piece) = self.active_pieces.get_mut(block.piece) {
            piece.unassign(addr, block);
        }
        self.assign_all(Some(*addr))
    }

    /// A piece failed verification. It becomes downloadable again, avoiding the peers that
    /// contributed to it while other peers have it.
    pub fn invalidate(
        &mut self,
        piece: usize,
        contributors: impl IntoIterator<Item = SocketAddr>,
    ) -> Vec<(SocketAddr, Block)> {
        let Some(peers_with_piece) = self.verifying.remove(&piece) else {
            return Vec::new();
        };
        self.suspects.insert(piece, contributors);
        if peers_with_piece.is_empty() {
            self.orphan_pieces.insert(piece);
        } else {
            self.available_pieces
                .insert(AvailablePiece::new(piece, peers_with_piece));
        }
        self.assign_all(None)
    }

    /// Returns peers that are no longer interesting (don't have any piece we don't already have)
    pub fn client_has_piece(&mut self, piece: usize) -> Vec<SocketAddr> {
        if !self.missing.remove(piece) {
            return Vec::new();
        }
        self.verifying.remove(&piece);
        self.active_pieces.remove(piece);
        self.orphan_pieces.remove(piece);
        self.available_pieces.remove(piece);
        self.suspects.remove(piece);

        let mut not_interesting = Vec::new();
        for (addr, peer) in self.peers.iter_mut() {
            if peer.has_pieces.remove(piece) && peer.has_pieces.is_empty() && peer.interested {
                peer.interested = false;
                not_interesting.push(*addr);
            }
        }
        not_interesting
    }

    /// Forgets the peer. Its outstanding blocks are offered to the remaining peers.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) -> Vec<(SocketAddr, Block)> {
        let Some(peer) = self.peers.remove(addr) else {
            return Vec::new();
        };

        for block in peer.assigned_blocks {
            if let Some(piece) = self.active_pieces.get_mut(block.piece) {
                piece.unassign(addr, block);
            }
        }

        for piece in &peer.has_pieces {
            if self.available_pieces.contains(piece) {
                if self.available_pieces.peer_disconnected(piece, addr) {
                    self.orphan_pieces.insert(piece);
                }
            } else if let Some(active_piece) = self.active_pieces.get_mut(piece) {
                active_piece.peer_disconnected(addr);
            } else if let Some(peers) = self.verifying.get_mut(&piece) {
                peers.remove(addr);
            }
        }

        self.assign_all(None)
    }

    /// Fills the free request slots of every unchoked peer.
    pub fn assign_idle_peers(&mut self) -> Vec<(SocketAddr, Block)> {
        self.assign_all(None)
    }

    /// Stops issuing requests. Outstanding requests may still complete.
    pub fn drain(&mut self) {
        self.draining = true;
    }

    pub fn outstanding(&self) -> Vec<(SocketAddr, Block)> {
        self.peers
            .iter()
            .flat_map(|(addr, peer)| peer.assigned_blocks.iter().map(|block| (*addr, *block)))
            .collect()
    }

    fn assign_all(&mut self, last: Option<SocketAddr>) -> Vec<(SocketAddr, Block)> {
        let mut addrs: Vec<SocketAddr> = self
            .peers
            .keys()
            .filter(|addr| Some(**addr) != last)
            .copied()
            .collect();
        addrs.extend(last.filter(|addr| self.peers.contains_key(addr)));

        let mut assignments = Vec::new();
        for addr in addrs {
            for block in self.try_assign(&addr) {
                assignments.push((addr, block));
            }
        }
        assignments
    }

    fn try_assign(&mut self, addr: &SocketAddr) -> Vec<Block> {
        if self.draining {
            return Vec::new();
        }
        let Some(peer) = self.peers.get(addr) else {
            return Vec::new();
        };
        if peer.choking {
            return Vec::new();
        }

        let mut blocks_to_request = self.max_requests.saturating_sub(peer.assigned_blocks.len());
        let mut blocks = Vec::with_capacity(blocks_to_request);
        let suspects = &self.suspects;

        // Continue pieces that already started downloading
        for piece in self.active_pieces.peer_pieces(addr) {
            if blocks_to_request == 0 {
                break;
            }
            if suspects.avoid(piece.index, addr, &piece.peers_with_piece) {
                continue;
            }
            blocks_to_request -= piece.try_assign_n(*addr, blocks_to_request, &mut blocks);
        }

        // Start the rarest pieces the peer has
        while blocks_to_request > 0 {
            let Some(available_piece) = self.available_pieces.take_next(addr, suspects) else {
                break;
            };
            let mut active_piece = ActivePiece::new(
                available_piece.index,
                self.info.piece_size(available_piece.index),
                self.block_size,
                available_piece.peers_with_piece,
            );
            blocks_to_request -= active_piece.try_assign_n(*addr, blocks_to_request, &mut blocks);
            self.active_pieces.insert(active_piece);
        }

        // Endgame: duplicate requests already in flight with other peers
        if blocks_to_request > 0 && self.missing.len() < self.endgame_threshold {
            for piece in self.active_pieces.peer_pieces(addr) {
                if blocks_to_request == 0 {
                    break;
                }
                if suspects.avoid(piece.index, addr, &piece.peers_with_piece) {
                    continue;
                }
                blocks_to_request -=
                    piece.assign_duplicates(*addr, blocks_to_request, &mut blocks);
            }
        }

        if let Some(peer) = self.peers.get_mut(addr) {
            peer.assigned_blocks.extend(&blocks);
        }
        blocks
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PeerPieceResponse {
    NoAction,
    ExpressInterest,
    ExpressInterestAndRequest(Vec<Block>),
    RequestBlocks(Vec<Block>),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockReceived {
    /// `false` for blocks that were not expected, or already received from another peer
    pub accepted: bool,
    /// Duplicate requests to withdraw
    pub cancels: Vec<(SocketAddr, Block)>,
    /// Follow-up requests for the freed slots
    pub requests: Vec<(SocketAddr, Block)>,
}

/// Peers suspected of sending corrupt data, per piece.
#[derive(Debug, Default)]
pub struct Suspects(HashMap<usize, HashSet<SocketAddr>>);

impl Suspects {
    pub fn insert(&mut self, piece: usize, peers: impl IntoIterator<Item = SocketAddr>) {
        self.0.entry(piece).or_default().extend(peers);
    }

    pub fn remove(&mut self, piece: usize) {
        self.0.remove(&piece);
    }

    /// A suspect is avoided for a piece as long as a non-suspect peer can supply it.
    pub fn avoid(&self, piece: usize, addr: &SocketAddr, peers_with_piece: &HashSet<SocketAddr>) -> bool {
        self.0.get(&piece).is_some_and(|suspects| {
            suspects.contains(addr) && peers_with_piece.iter().any(|peer| !suspects.contains(peer))
        })
    }
}

#[derive(Debug)]
struct Peer {
    /// If the peer is choking the client
    choking: bool,
    /// If the client told the peer it is interested
    interested: bool,
    /// Blocks requested from the peer and not received yet
    assigned_blocks: BTreeSet<Block>,
    /// Pieces the peer has and client doesn't
    has_pieces: BitSet,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            choking: true,
            interested: false,
            assigned_blocks: BTreeSet::new(),
            has_pieces: BitSet::new(),
        }
    }
}
