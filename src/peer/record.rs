use std::net::SocketAddr;

use bit_set::BitSet;

use crate::core::{PeerId, RollingRate, TransferRate};
use crate::peer::stats::PeerStats;

/// Number of stats samples the throughput is averaged over.
const RATE_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Handshaking,
    Connected,
    /// Connected, but the peer is choking the client
    Choked,
    Disconnected,
}

/// What the session knows about one peer, from the connection attempt until it disconnects.
#[derive(Debug)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub state: PeerState,
    pub peer_id: Option<PeerId>,
    /// Pieces the peer claims to have
    pub claimed: BitSet,
    /// Extended message id the peer assigned to `ut_metadata`, if any
    pub ut_metadata: Option<u8>,
    /// Client told the peer it is interested
    pub am_interested: bool,
    download: RollingRate,
    upload: RollingRate,
    pub penalty: u32,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr, state: PeerState) -> Self {
        Self {
            addr,
            state,
            peer_id: None,
            claimed: BitSet::new(),
            ut_metadata: None,
            am_interested: false,
            download: RollingRate::new(RATE_WINDOW),
            upload: RollingRate::new(RATE_WINDOW),
            penalty: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, PeerState::Connected | PeerState::Choked)
    }

    pub fn is_seed(&self, total_pieces: usize) -> bool {
        total_pieces > 0 && self.claimed.len() == total_pieces
    }

    pub fn record_stats(&mut self, stats: PeerStats) {
        self.download.record(stats.download);
        self.upload.record(stats.upload);
    }

    /// Recent rate at which the peer sends data to the client.
    pub fn download_rate(&self) -> TransferRate {
        self.download.rate()
    }

    /// Recent rate at which the client sends data to the peer.
    pub fn upload_rate(&self) -> TransferRate {
        self.upload.rate()
    }

    /// Returns the new penalty score.
    pub fn penalize(&mut self, points: u32) -> u32 {
        self.penalty = self.penalty.saturating_add(points);
        self.penalty
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use size::Size;

    use super::*;

    #[test]
    fn seed_claims_every_piece() {
        let mut record = PeerRecord::new("127.0.0.1:6881".parse().unwrap(), PeerState::Connected);

        record.claimed.extend([0, 1, 2]);
        assert!(!record.is_seed(4));

        record.claimed.insert(3);
        assert!(record.is_seed(4));
    }

    #[test]
    fn rates_average_recent_samples() {
        let mut record = PeerRecord::new("127.0.0.1:6881".parse().unwrap(), PeerState::Connected);
        let sec = Duration::from_secs(1);

        record.record_stats(PeerStats {
            upload: TransferRate(Size::from_bytes(0), sec),
            download: TransferRate(Size::from_kibibytes(10), sec),
            blocks_sent: 0,
        });
        record.record_stats(PeerStats {
            upload: TransferRate(Size::from_kibibytes(4), sec),
            download: TransferRate(Size::from_kibibytes(30), sec),
            blocks_sent: 4096,
        });

        assert_eq!(record.download_rate().bytes_per_second(), 20.0 * 1024.0);
        assert_eq!(record.upload_rate().bytes_per_second(), 2.0 * 1024.0);
    }
}
