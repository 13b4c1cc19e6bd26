use std::ops::AddAssign;

use crate::core::TransferRate;

/// Traffic of one connection since the previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub upload: TransferRate,
    pub download: TransferRate,
    /// Block payload bytes written to the socket
    pub blocks_sent: u64,
}

impl PeerStats {
    pub fn is_empty(&self) -> bool {
        self.upload == TransferRate::EMPTY
            && self.download == TransferRate::EMPTY
            && self.blocks_sent == 0
    }
}

impl AddAssign for PeerStats {
    fn add_assign(&mut self, rhs: Self) {
        self.upload += rhs.upload;
        self.download += rhs.download;
        self.blocks_sent += rhs.blocks_sent;
    }
}
