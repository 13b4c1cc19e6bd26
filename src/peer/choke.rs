use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;

use rand::seq::IteratorRandom;

use crate::core::TransferRate;

/// Decides which interested peers may download from the client.
///
/// Every round the `upload_slots` peers with the best transfer rate are unchoked. Every
/// `optimistic_cycle` rounds one more randomly selected interested peer is unchoked as well,
/// and stays unchoked until the next optimistic round.
pub struct Choker {
    upload_slots: usize,
    optimistic_cycle: usize,
    round: usize,
    interested: HashSet<SocketAddr>,
    unchoked: HashSet<SocketAddr>,
    optimistic: Option<SocketAddr>,
    transfer_rates: HashMap<SocketAddr, TransferRate>,
}

impl Choker {
    pub fn new(upload_slots: usize, optimistic_cycle: usize) -> Self {
        Self {
            upload_slots,
            optimistic_cycle: optimistic_cycle.max(1),
            round: 0,
            interested: HashSet::new(),
            unchoked: HashSet::new(),
            optimistic: None,
            transfer_rates: HashMap::new(),
        }
    }

    pub fn peer_interested(&mut self, addr: SocketAddr) {
        self.interested.insert(addr);
    }

    pub fn peer_not_interested(&mut self, addr: &SocketAddr) {
        self.interested.remove(addr);
    }

    pub fn update_peer_transfer_rate(&mut self, addr: SocketAddr, transfer_rate: TransferRate) {
        self.transfer_rates.insert(addr, transfer_rate);
    }

    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.interested.remove(addr);
        self.unchoked.remove(addr);
        self.transfer_rates.remove(addr);
        if self.optimistic == Some(*addr) {
            self.optimistic = None;
        }
    }

    pub fn is_unchoked(&self, addr: &SocketAddr) -> bool {
        self.unchoked.contains(addr)
    }

    pub fn run(&mut self) -> ChokeDecision {
        let optimistic_round = self.round % self.optimistic_cycle == 0;
        self.round += 1;

        let mut decision = choke(
            &self.interested,
            &self.unchoked,
            &self.transfer_rates,
            self.upload_slots,
        );

        if optimistic_round {
            let mut rng = rand::rng();
            self.optimistic = self
                .interested
                .iter()
                .filter(|peer| !decision.unchoke.contains(peer))
                .choose(&mut rng)
                .copied();
        }
        if let Some(peer) = self.optimistic.filter(|peer| self.interested.contains(peer)) {
            decision.unchoke.insert(peer);
            decision.choke.remove(&peer);
        }

        // Only changes need a message
        let newly_unchoked = decision
            .unchoke
            .difference(&self.unchoked)
            .copied()
            .collect();
        self.unchoked = decision.unchoke;
        ChokeDecision {
            choke: decision.choke,
            unchoke: newly_unchoked,
        }
    }
}

#[derive(Debug, Default)]
pub struct ChokeDecision {
    pub choke: HashSet<SocketAddr>,
    pub unchoke: HashSet<SocketAddr>,
}

fn choke(
    interested: &HashSet<SocketAddr>,
    unchoked: &HashSet<SocketAddr>,
    transfer_rates: &HashMap<SocketAddr, TransferRate>,
    top_peers: usize,
) -> ChokeDecision {
    let mut heap = BinaryHeap::with_capacity(top_peers + 1);
    for peer in interested {
        let transfer_rate = transfer_rates.get(peer).unwrap_or(&TransferRate::EMPTY);
        heap.push(Reverse(PeerByTransferRate(*peer, *transfer_rate)));
        if heap.len() > top_peers {
            heap.pop();
        }
    }

    let mut peers_to_choke = unchoked.clone();
    let mut peers_to_unchoke = HashSet::with_capacity(top_peers + 1);
    for Reverse(PeerByTransferRate(peer, _)) in heap {
        peers_to_choke.remove(&peer);
        peers_to_unchoke.insert(peer);
    }

    ChokeDecision {
        choke: peers_to_choke,
        unchoke: peers_to_unchoke,
    }
}

struct PeerByTransferRate(SocketAddr, TransferRate);

impl Eq for PeerByTransferRate {}

impl PartialEq for PeerByTransferRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for PeerByTransferRate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal rates are broken by address so the selection is stable
        self.1.cmp(&other.1).then_with(|| other.0.cmp(&self.0))
    }
}

impl PartialOrd for PeerByTransferRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
