mod handler;
mod metadata;
mod swarm;

use std::net::SocketAddr;

use tokio::{net::TcpStream, time::Instant};

use crate::error::Error;
use crate::message::{Handshake, Message};
use crate::peer::stats::PeerStats;

pub use handler::*;
pub use metadata::*;
pub use swarm::*;

/// Events processed by a session
#[derive(Debug)]
pub enum Event {
    /// Periodic tick to send keep-alive messages to peers
    KeepAliveTicked,
    /// Periodic tick to run the choking algorithm, driven by the engine
    ChokeTicked,
    /// Periodic tick to aggregate and publish the session status
    StatsTicked,
    /// Periodic tick to sweep for idle peers and abandoned blocks, with current timestamp
    SweepTicked(Instant),
    /// New peer addresses from a tracker, a magnet link or the user
    PeersDiscovered(Vec<SocketAddr>),
    /// A peer dialed in; its handshake was read by the listener
    ConnectionAccepted(SocketAddr, TcpStream, Handshake),
    /// Handshakes were exchanged with a peer
    Connected(SocketAddr, Handshake),
    /// Received a BitTorrent protocol message from a peer
    MessageReceived(SocketAddr, Message),
    /// Traffic of a peer since its previous report
    StatsUpdated(SocketAddr, PeerStats),
    /// A peer connection was terminated, with the error that ended it
    Disconnected(SocketAddr, Option<Error>),
    /// A piece was successfully downloaded and verified
    PieceCompleted(usize),
    /// A downloaded piece failed hash verification
    PieceVerificationFailed {
        piece: usize,
        contributors: Vec<SocketAddr>,
    },
    /// Data could not be written or read, the session cannot continue
    StorageFailed(Error),
}
