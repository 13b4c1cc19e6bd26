use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::command::Command;
use crate::engine::Config;
use crate::error::Error;
use crate::message::{Handshake, Message};
use crate::peer::blacklist::Blacklist;
use crate::peer::connection::Socket;
use crate::peer::record::{PeerRecord, PeerState};

/// Addresses kept waiting for each peer slot
const CANDIDATES_PER_SLOT: usize = 4;

/// Peers of one session: known addresses, admission up to the per-session cap and the
/// blacklist of misbehaving peers.
///
/// Carried over from the metadata phase to the transfer phase.
pub struct Swarm {
    max_peers: usize,
    max_penalty: u32,
    peers: BTreeMap<SocketAddr, PeerRecord>,
    /// Addresses waiting for a free slot, oldest first
    candidates: VecDeque<SocketAddr>,
    blacklist: Blacklist,
}

impl Swarm {
    pub fn new(config: &Config) -> Self {
        Self {
            max_peers: config.max_peers_per_session,
            max_penalty: config.max_peer_penalty,
            peers: BTreeMap::new(),
            candidates: VecDeque::new(),
            blacklist: Blacklist::new(config.blacklist_cooldown),
        }
    }

    pub fn discovered(&mut self, addrs: Vec<SocketAddr>, now: Instant) -> Vec<Command> {
        for addr in addrs {
            if self.candidates.len() >= self.max_peers * CANDIDATES_PER_SLOT {
                debug!("enough candidates, ignoring the remaining addresses");
                break;
            }
            if self.peers.contains_key(&addr)
                || self.candidates.contains(&addr)
                || self.blacklist.contains(&addr, now)
            {
                continue;
            }
            self.candidates.push_back(addr);
        }
        self.connect_more()
    }

    /// Dials candidates while there are free slots.
    pub fn connect_more(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        while self.peers.len() < self.max_peers {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            self.peers
                .insert(addr, PeerRecord::new(addr, PeerState::Connecting));
            commands.push(Command::EstablishConnection(addr, Socket::Outbound));
        }
        commands
    }

    pub fn accepted(
        &mut self,
        addr: SocketAddr,
        socket: TcpStream,
        handshake: Handshake,
        now: Instant,
    ) -> Option<Command> {
        if self.blacklist.contains(&addr, now) {
            debug!("refusing blacklisted peer {}", addr);
            return None;
        }
        if self.peers.contains_key(&addr) {
            return None;
        }
        if self.peers.len() >= self.max_peers {
            debug!("refusing {}, session is full", addr);
            return None;
        }
        self.peers
            .insert(addr, PeerRecord::new(addr, PeerState::Handshaking));
        Some(Command::EstablishConnection(
            addr,
            Socket::Inbound(socket, handshake),
        ))
    }

    /// Returns `false` if the peer is not known (anymore).
    pub fn connected(&mut self, addr: SocketAddr, handshake: &Handshake) -> bool {
        let Some(record) = self.peers.get_mut(&addr) else {
            return false;
        };
        info!("connected to {}", addr);
        // Peers start out choking the client
        record.state = PeerState::Choked;
        record.peer_id = Some(handshake.peer_id);
        true
    }

    /// Forgets a peer whose connection ended. Peers at fault are blacklisted; peers refused
    /// for lack of a global connection slot are tried again later.
    pub fn disconnected(
        &mut self,
        addr: &SocketAddr,
        error: Option<&Error>,
        now: Instant,
    ) -> Option<PeerRecord> {
        let mut record = self.peers.remove(addr)?;
        match error {
            Some(err) if err.is_peer_fault() => self.blacklist.insert(*addr, now),
            Some(Error::ConnectionLimit) if record.state == PeerState::Connecting => {
                self.candidates.push_back(*addr);
            }
            _ => (),
        }
        record.state = PeerState::Disconnected;
        Some(record)
    }

    /// Drops a peer the client decided to disconnect, and refuses it for the cooldown.
    pub fn ban(&mut self, addr: &SocketAddr, now: Instant) -> Option<PeerRecord> {
        self.blacklist.insert(*addr, now);
        let mut record = self.peers.remove(addr)?;
        record.state = PeerState::Disconnected;
        Some(record)
    }

    /// Returns `true` once the peer reached the penalty limit.
    pub fn penalize(&mut self, addr: &SocketAddr, points: u32) -> bool {
        let Some(record) = self.peers.get_mut(addr) else {
            return false;
        };
        let penalty = record.penalize(points);
        if penalty >= self.max_penalty {
            warn!("peer {} reached penalty {}", addr, penalty);
            return true;
        }
        false
    }

    pub fn expire(&mut self, now: Instant) {
        self.blacklist.expire(now);
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.peers.get(addr).filter(|record| record.is_connected())
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerRecord> {
        self.peers
            .get_mut(addr)
            .filter(|record| record.is_connected())
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values().filter(|record| record.is_connected())
    }

    pub fn broadcast(&self, message: Message) -> Vec<Command> {
        self.connected_peers()
            .map(|record| Command::Send(record.addr, message.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}
