mod executor;

use std::net::SocketAddr;

use crate::error::Error;
use crate::message::{Block, BlockData, Message};
use crate::peer::connection::Socket;
use crate::session::SessionStatus;
use crate::torrent::Info;

pub use executor::*;

/// Side effects requested by the event handlers
#[derive(Debug, PartialEq)]
pub enum Command {
    /// Dial a peer, or take over an accepted connection
    EstablishConnection(SocketAddr, Socket),
    Send(SocketAddr, Message),
    RemovePeer(SocketAddr),
    /// Read a block from storage and send it to the peer
    Upload(SocketAddr, Block),
    /// Hand a received block to storage
    IntegrateBlock(SocketAddr, BlockData),
    UpdateTracker {
        downloaded: u64,
        uploaded: u64,
        left: u64,
    },
    /// Tell the trackers the download finished
    AnnounceCompleted,
    PublishStatus(SessionStatus),
    /// The descriptor was fetched from peers and verified
    MetadataResolved(Info),
    /// Stop the session
    Fail(Error),
}
