use std::net::SocketAddr;

use thiserror::Error;

use crate::core::Sha1;

/// Errors surfaced by the engine and its sessions.
///
/// Peer-level variants are handled inside a session (the peer is dropped and possibly
/// blacklisted). Only `StorageError` is fatal to a session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to connect to {0}: {1}")]
    ConnectError(SocketAddr, String),

    #[error("handshake mismatch with {0}: {1}")]
    HandshakeMismatch(SocketAddr, String),

    #[error("protocol violation by {0}: {1}")]
    ProtocolViolation(SocketAddr, String),

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("request to {0} timed out")]
    RequestTimeout(SocketAddr),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("metadata fetch failed: {0}")]
    MetadataFetchFailed(String),

    #[error("invalid torrent descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("torrent {0} already added")]
    DuplicateTorrent(Sha1),

    #[error("unknown torrent {0}")]
    UnknownTorrent(Sha1),

    #[error("connection limit reached")]
    ConnectionLimit,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    Channel,
}

impl Error {
    /// Errors after which the peer should not be retried for a while.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            Self::ConnectError(..)
                | Self::HandshakeMismatch(..)
                | Self::ProtocolViolation(..)
                | Self::RequestTimeout(_)
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Self::ConnectError(addr, reason) => Self::ConnectError(*addr, reason.clone()),
            Self::HandshakeMismatch(addr, reason) => {
                Self::HandshakeMismatch(*addr, reason.clone())
            }
            Self::ProtocolViolation(addr, reason) => {
                Self::ProtocolViolation(*addr, reason.clone())
            }
            Self::HashMismatch(piece) => Self::HashMismatch(*piece),
            Self::RequestTimeout(addr) => Self::RequestTimeout(*addr),
            Self::StorageError(reason) => Self::StorageError(reason.clone()),
            Self::MetadataFetchFailed(reason) => Self::MetadataFetchFailed(reason.clone()),
            Self::InvalidDescriptor(reason) => Self::InvalidDescriptor(reason.clone()),
            Self::DuplicateTorrent(info_hash) => Self::DuplicateTorrent(*info_hash),
            Self::UnknownTorrent(info_hash) => Self::UnknownTorrent(*info_hash),
            Self::ConnectionLimit => Self::ConnectionLimit,
            Self::Io(err) => Self::Io(std::io::Error::new(err.kind(), err.to_string())),
            Self::Channel => Self::Channel,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
