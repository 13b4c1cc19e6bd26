use std::fmt::Display;
use std::time::Duration;

use crate::core::{Sha1, TransferRate};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the torrent descriptor from peers
    MetadataPending,
    Downloading,
    /// Every piece is verified, only uploading
    Seeding,
    Stopped,
}

/// Snapshot of a session, published every stats tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub info_hash: Sha1,
    /// Known once the descriptor is
    pub name: Option<String>,
    pub state: SessionState,
    /// Bytes of verified pieces
    pub bytes_done: u64,
    pub total_bytes: Option<u64>,
    /// Payload received from peers and accepted, counted once per block
    pub downloaded: u64,
    /// Payload sent to peers
    pub uploaded: u64,
    pub download_rate: TransferRate,
    pub upload_rate: TransferRate,
    pub peers: usize,
    pub seeds: usize,
    pub last_error: Option<Error>,
}

impl SessionStatus {
    pub fn new(info_hash: Sha1, state: SessionState) -> Self {
        Self {
            info_hash,
            name: None,
            state,
            bytes_done: 0,
            total_bytes: None,
            downloaded: 0,
            uploaded: 0,
            download_rate: TransferRate::EMPTY,
            upload_rate: TransferRate::EMPTY,
            peers: 0,
            seeds: 0,
            last_error: None,
        }
    }

    /// Percentage of verified bytes.
    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(0) => 100.0,
            Some(total) => 100.0 * (self.bytes_done as f64) / (total as f64),
            None => 0.0,
        }
    }

    pub fn eta(&self) -> Eta {
        let rate = self.download_rate.bytes_per_second();
        match self.total_bytes {
            Some(total) if rate > 0.0 => {
                let remaining = total.saturating_sub(self.bytes_done) as f64;
                Eta(Some(Duration::from_secs_f64(remaining / rate)))
            }
            _ => Eta(None),
        }
    }
}

/// Estimated time to completion, `None` when nothing is being downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eta(pub Option<Duration>);

impl Display for Eta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(duration) = self.0 else {
            return write!(f, "∞");
        };
        let seconds = duration.as_secs();
        let (hours, rem) = (seconds / 3600, seconds % 3600);
        let (minutes, seconds) = (rem / 60, rem % 60);
        if hours > 0 {
            write!(f, "{}:{:02}:{:02}", hours, minutes, seconds)
        } else {
            write!(f, "{:02}:{:02}", minutes, seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use size::Size;

    use super::*;

    #[test]
    fn format_eta() {
        assert_eq!(Eta(None).to_string(), "∞");
        assert_eq!(Eta(Some(Duration::from_secs(0))).to_string(), "00:00");
        assert_eq!(Eta(Some(Duration::from_secs(65))).to_string(), "01:05");
        assert_eq!(Eta(Some(Duration::from_secs(3725))).to_string(), "1:02:05");
        assert_eq!(Eta(Some(Duration::from_millis(59_900))).to_string(), "00:59");
    }

    #[test]
    fn eta_is_remaining_bytes_over_download_rate() {
        let mut status = SessionStatus::new(Sha1([0; 20]), SessionState::Downloading);
        status.total_bytes = Some(10_000);
        status.bytes_done = 4_000;

        assert_eq!(status.eta(), Eta(None));

        status.download_rate = TransferRate(Size::from_bytes(1_000), Duration::from_secs(1));
        assert_eq!(status.eta(), Eta(Some(Duration::from_secs(6))));
        assert_eq!(status.progress(), 40.0);
    }
}
