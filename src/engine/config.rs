use std::ops::RangeInclusive;
use std::{path::PathBuf, time::Duration};

use log::warn;
use size::Size;

use crate::core::PeerId;
use crate::message::METADATA_PIECE_SIZE;

const SAVE_PATH_VAR: &str = "TORRENT_SAVE_PATH";
const DOWNLOAD_LIMIT_VAR: &str = "TORRENT_DOWNLOAD_LIMIT";
const UPLOAD_LIMIT_VAR: &str = "TORRENT_UPLOAD_LIMIT";

/// Room for the `piece` header, or the bencoded header of a `ut_metadata` data message
const MESSAGE_HEADER_ALLOWANCE: usize = 256;

/// Engine configuration, shared by all sessions.
#[derive(Clone, Debug)]
pub struct Config {
    // Identity and Network Settings
    /// Unique identifier for this client in the swarm
    pub client_id: PeerId,
    /// Root directory where downloaded files are stored
    pub download_path: PathBuf,
    /// Ports to try, in order, for the incoming connection listener
    pub listen_ports: RangeInclusive<u16>,

    // Admission Settings
    /// Maximum number of connected peers per session
    pub max_peers_per_session: usize,
    /// Maximum number of peer connections across all sessions
    pub max_connections: usize,
    /// Maximum number of sessions running at the same time
    pub max_active_sessions: usize,

    // Rate Limits (zero means unlimited)
    pub download_rate_limit: Size,
    pub upload_rate_limit: Size,

    // Scheduler Settings
    /// Maximum number of concurrent block requests per peer
    pub max_concurrent_requests_per_peer: usize,
    /// Size of data blocks for piece transfers
    pub block_size: Size,
    /// Endgame starts once fewer pieces than this remain unverified
    pub endgame_threshold: usize,

    // Choker Settings
    /// Interval between choking algorithm runs
    pub choking_interval: Duration,
    /// Number of choking cycles between optimistic unchoking attempts
    pub optimistic_choking_cycle: usize,
    /// Number of peers unchoked by upload rate
    pub upload_slots: usize,

    // Sweeper Settings
    /// Interval between sweeps for idle peers and abandoned blocks
    pub sweep_interval: Duration,
    /// Time after which an idle peer is disconnected
    pub idle_peer_timeout: Duration,
    /// Time after which a block request is considered abandoned
    pub block_timeout: Duration,

    // Peer Penalties
    /// Time a misbehaving peer is refused for
    pub blacklist_cooldown: Duration,
    /// Penalty score at which a peer is disconnected and blacklisted
    pub max_peer_penalty: u32,

    // Event System Settings
    /// Interval between keep-alive messages
    pub keep_alive_interval: Duration,
    /// Interval between statistics updates
    pub update_stats_interval: Duration,
    /// Size of the event queue buffer
    pub events_buffer: usize,
    /// Size of the channel buffer for peer communication
    pub channel_buffer: usize,

    // Connection Settings
    /// Timeout for establishing new connections, including the handshake
    pub connect_timeout: Duration,

    // Session Lifecycle
    /// Time a magnet session waits for metadata before reporting failure
    pub metadata_timeout: Duration,
    /// Time in-flight requests are given to complete when stopping
    pub shutdown_grace: Duration,

    // Storage Settings
    /// Number of concurrent hashing / disk tasks across all sessions
    pub disk_workers: usize,
}

#[allow(dead_code)]
impl Config {
    pub fn with_listen_ports(mut self, ports: RangeInclusive<u16>) -> Self {
        self.listen_ports = ports;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_unchoking_interval(mut self, interval: Duration) -> Self {
        self.choking_interval = interval;
        self
    }

    pub fn with_optimistic_unchoking_cycle(mut self, n: usize) -> Self {
        self.optimistic_choking_cycle = n;
        self
    }

    pub fn with_upload_slots(mut self, n: usize) -> Self {
        self.upload_slots = n;
        self
    }

    pub fn with_block_size(mut self, size: Size) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_max_concurrent_requests_per_peer(mut self, n: usize) -> Self {
        self.max_concurrent_requests_per_peer = n;
        self
    }

    pub fn with_endgame_threshold(mut self, n: usize) -> Self {
        self.endgame_threshold = n;
        self
    }

    pub fn with_max_peers_per_session(mut self, n: usize) -> Self {
        self.max_peers_per_session = n;
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_max_active_sessions(mut self, n: usize) -> Self {
        self.max_active_sessions = n;
        self
    }

    pub fn with_download_rate_limit(mut self, limit: Size) -> Self {
        self.download_rate_limit = limit;
        self
    }

    pub fn with_upload_rate_limit(mut self, limit: Size) -> Self {
        self.upload_rate_limit = limit;
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_blacklist_cooldown(mut self, cooldown: Duration) -> Self {
        self.blacklist_cooldown = cooldown;
        self
    }

    pub fn with_max_peer_penalty(mut self, penalty: u32) -> Self {
        self.max_peer_penalty = penalty;
        self
    }
}

impl Config {
    pub fn new(download_path: PathBuf) -> Self {
        let keep_alive_interval = Duration::from_secs(120);
        Self {
            client_id: PeerId::random(),
            download_path,
            listen_ports: 6881..=6891,
            max_peers_per_session: 50,
            max_connections: 500,
            max_active_sessions: 100,
            download_rate_limit: Size::from_bytes(0),
            upload_rate_limit: Size::from_bytes(0),
            max_concurrent_requests_per_peer: 10,
            block_size: Size::from_kibibytes(16),
            endgame_threshold: 4,
            choking_interval: Duration::from_secs(10),
            optimistic_choking_cycle: 3,
            upload_slots: 4,
            sweep_interval: Duration::from_secs(1),
            idle_peer_timeout: keep_alive_interval * 2,
            block_timeout: Duration::from_secs(10),
            blacklist_cooldown: Duration::from_secs(300),
            max_peer_penalty: 5,
            keep_alive_interval,
            update_stats_interval: Duration::from_secs(1),
            events_buffer: 128,
            channel_buffer: 64,
            connect_timeout: Duration::from_secs(5),
            metadata_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(2),
            disk_workers: 4,
        }
    }

    /// Reads `TORRENT_SAVE_PATH` (falling back to `./Torrents`) and the optional
    /// `TORRENT_DOWNLOAD_LIMIT` / `TORRENT_UPLOAD_LIMIT` caps in bytes per second.
    pub fn from_env() -> Self {
        let download_path = match std::env::var_os(SAVE_PATH_VAR) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => std::env::current_dir()
                .unwrap_or_else(|_| std::env::temp_dir())
                .join("Torrents"),
        };
        let mut config = Self::new(download_path);
        if let Some(limit) = rate_limit_from_env(DOWNLOAD_LIMIT_VAR) {
            config.download_rate_limit = limit;
        }
        if let Some(limit) = rate_limit_from_env(UPLOAD_LIMIT_VAR) {
            config.upload_rate_limit = limit;
        }
        config
    }

    pub fn block_size_bytes(&self) -> usize {
        self.block_size.bytes() as usize
    }

    /// Largest frame accepted from peers: a full block or metadata piece plus message headers.
    pub fn max_message_length(&self) -> usize {
        self.block_size_bytes().max(METADATA_PIECE_SIZE) + MESSAGE_HEADER_ALLOWANCE
    }
}

fn rate_limit_from_env(var: &str) -> Option<Size> {
    let value = std::env::var(var).ok()?;
    match value.trim().parse::<u64>() {
        Ok(bytes) => Some(Size::from_bytes(bytes)),
        Err(err) => {
            warn!("ignoring invalid {}={}: {}", var, value, err);
            None
        }
    }
}
