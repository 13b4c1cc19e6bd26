use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bit_set::BitSet;
use log::{debug, info, warn};
use size::Size;
use tokio::time::Instant;

use crate::command::Command;
use crate::core::TransferRate;
use crate::engine::Config;
use crate::error::Error;
use crate::event::{Event, Swarm};
use crate::message::{
    Block, EXTENDED_HANDSHAKE_ID, ExtendedHandshake, METADATA_PIECE_SIZE, Message,
    MetadataMessage, UT_METADATA_ID,
};
use crate::peer::choke::Choker;
use crate::peer::record::PeerState;
use crate::peer::sweeper::Sweeper;
use crate::scheduler::{PeerPieceResponse, Scheduler};
use crate::session::{SessionState, SessionStatus};
use crate::torrent::Info;

/// Penalty for a block request that was not answered in time
const TIMEOUT_PENALTY: u32 = 1;

/// Penalty for contributing to a piece that failed verification
const HASH_FAILURE_PENALTY: u32 = 3;

/// Handles the events of a session once its descriptor is known.
///
/// The `EventHandler` is responsible for:
/// - Admitting peers and dropping misbehaving ones through the `Swarm`
/// - Managing peer choking/unchoking decisions through the `Choker`
/// - Scheduling piece downloads and tracking piece availability via the `Scheduler`
/// - Handling timeouts for idle peers and stalled block requests with the `Sweeper`
/// - Aggregating the session status
pub struct EventHandler {
    info: Arc<Info>,
    block_size: usize,
    swarm: Swarm,
    choker: Choker,
    scheduler: Scheduler,
    sweeper: Sweeper,

    /// Verified pieces
    has_pieces: BitSet,

    status: SessionStatus,

    /// Trackers only hear about completion if the session had something to download
    started_complete: bool,
}

impl EventHandler {
    pub fn new(info: Arc<Info>, config: &Config, has_pieces: BitSet, swarm: Swarm) -> Self {
        let scheduler = Scheduler::new(Arc::clone(&info), config, &has_pieces);
        let choker = Choker::new(config.upload_slots, config.optimistic_choking_cycle);
        let sweeper = Sweeper::new(config.idle_peer_timeout, config.block_timeout);
        let started_complete = has_pieces.len() == info.total_pieces();

        let mut status = SessionStatus::new(
            info.info_hash,
            if started_complete {
                SessionState::Seeding
            } else {
                SessionState::Downloading
            },
        );
        status.name = Some(info.name().to_string());
        status.total_bytes = Some(info.total_size() as u64);
        status.bytes_done = has_pieces
            .iter()
            .map(|piece| info.piece_size(piece) as u64)
            .sum();

        Self {
            block_size: config.block_size_bytes(),
            info,
            swarm,
            choker,
            scheduler,
            sweeper,
            has_pieces,
            status,
            started_complete,
        }
    }

    pub fn is_seeding(&self) -> bool {
        self.status.state == SessionState::Seeding
    }

    /// Takes over peers that connected before the descriptor was known. They are told which
    /// pieces the client has, then the messages they sent so far are replayed.
    pub fn resume(&mut self, buffered: Vec<(SocketAddr, Vec<Message>)>) -> Vec<Command> {
        let now = Instant::now();
        let mut commands = Vec::new();
        let addrs: Vec<SocketAddr> = self.swarm.connected_peers().map(|record| record.addr).collect();
        for addr in addrs {
            self.sweeper.update_peer_activity(addr, now);
            for piece in &self.has_pieces {
                commands.push(Command::Send(addr, Message::Have(piece)));
            }
        }
        for (addr, messages) in buffered {
            for message in messages {
                commands.extend(self.handle_message(addr, message, now));
            }
        }
        commands
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        let now = Instant::now();
        match event {
            Event::KeepAliveTicked => self.swarm.broadcast(Message::KeepAlive),

            Event::StatsTicked => {
                let status = self.status();
                vec![
                    Command::UpdateTracker {
                        downloaded: status.downloaded,
                        uploaded: status.uploaded,
                        left: self.left(),
                    },
                    Command::PublishStatus(status),
                ]
            }

            Event::ChokeTicked => {
                let decision = self.choker.run();
                let choke = decision
                    .choke
                    .into_iter()
                    .map(|addr| Command::Send(addr, Message::Choke));
                let unchoke = decision
                    .unchoke
                    .into_iter()
                    .map(|addr| Command::Send(addr, Message::Unchoke));
                choke.chain(unchoke).collect()
            }

            Event::SweepTicked(instant) => {
                self.swarm.expire(instant);
                let result = self.sweeper.sweep(instant);
                let mut commands = Vec::new();
                for addr in result.peers {
                    warn!("peer {} has been idle for too long", &addr);
                    commands.extend(self.ban(addr, now));
                }
                for (addr, block) in result.blocks {
                    if !self.scheduler.block_in_flight(&addr, &block) {
                        continue;
                    }
                    warn!("{}: {:?}", Error::RequestTimeout(addr), &block);
                    for (peer, next_block) in self.scheduler.release(&addr, block) {
                        commands.push(self.request(peer, next_block, now));
                    }
                    if self.swarm.penalize(&addr, TIMEOUT_PENALTY) {
                        commands.extend(self.ban(addr, now));
                    }
                }
                commands.extend(self.swarm.connect_more());
                commands
            }

            Event::PeersDiscovered(addrs) => self.swarm.discovered(addrs, now),

            Event::ConnectionAccepted(addr, socket, handshake) => self
                .swarm
                .accepted(addr, socket, handshake, now)
                .into_iter()
                .collect(),

            Event::Connected(addr, handshake) => {
                if !self.swarm.connected(addr, &handshake) {
                    return vec![Command::RemovePeer(addr)];
                }
                self.sweeper.update_peer_activity(addr, now);
                let mut commands = Vec::with_capacity(2);
                // Bitfield must be the first message after the handshake
                if !self.has_pieces.is_empty() {
                    let pieces = self.has_pieces.clone();
                    commands.push(Command::Send(addr, Message::Bitfield(pieces)));
                }
                if handshake.supports_extensions() {
                    let ours = ExtendedHandshake::new(Some(self.info.raw.len()));
                    commands.push(Command::Send(
                        addr,
                        Message::Extended(EXTENDED_HANDSHAKE_ID, ours.encode()),
                    ));
                }
                commands
            }

            Event::MessageReceived(addr, message) => {
                if self.swarm.get(&addr).is_none() {
                    debug!("ignoring message from unknown peer {}", addr);
                    return Vec::new();
                }
                self.sweeper.update_peer_activity(addr, now);
                self.handle_message(addr, message, now)
            }

            Event::StatsUpdated(addr, stats) => {
                self.status.uploaded += stats.blocks_sent;
                let seeding = self.is_seeding();
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.record_stats(stats);
                    let rate = if seeding {
                        record.upload_rate()
                    } else {
                        record.download_rate()
                    };
                    self.choker.update_peer_transfer_rate(addr, rate);
                }
                Vec::new()
            }

            Event::Disconnected(addr, error) => {
                let limited = matches!(error, Some(Error::ConnectionLimit));
                let mut commands = vec![Command::RemovePeer(addr)];
                if self.swarm.disconnected(&addr, error.as_ref(), now).is_some() {
                    commands.extend(self.forget(addr, now));
                }
                // Slots freed by other sessions are picked up on the next sweep
                if !limited {
                    commands.extend(self.swarm.connect_more());
                }
                commands
            }

            Event::PieceCompleted(piece) => self.piece_completed(piece, now),

            Event::PieceVerificationFailed {
                piece,
                contributors,
            } => {
                warn!("{}", Error::HashMismatch(piece));
                let mut commands = Vec::new();
                for (peer, block) in self.scheduler.invalidate(piece, contributors.clone()) {
                    commands.push(self.request(peer, block, now));
                }
                for addr in contributors {
                    if self.swarm.penalize(&addr, HASH_FAILURE_PENALTY) {
                        commands.extend(self.ban(addr, now));
                    }
                }
                commands
            }

            Event::StorageFailed(err) => {
                self.status.last_error = Some(err.clone());
                vec![Command::PublishStatus(self.status()), Command::Fail(err)]
            }
        }
    }

    /// Stops issuing new requests.
    pub fn drain(&mut self) {
        self.scheduler.drain();
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !self.scheduler.outstanding().is_empty()
    }

    /// Withdraws every request still in flight.
    pub fn cancel_outstanding(&mut self) -> Vec<Command> {
        self.scheduler
            .outstanding()
            .into_iter()
            .map(|(addr, block)| Command::Send(addr, Message::Cancel(block)))
            .collect()
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.clone();
        let (mut download, mut upload) = (0.0, 0.0);
        for record in self.swarm.connected_peers() {
            download += record.download_rate().bytes_per_second();
            upload += record.upload_rate().bytes_per_second();
            status.peers += 1;
            if record.is_seed(self.info.total_pieces()) {
                status.seeds += 1;
            }
        }
        status.download_rate = per_second(download);
        status.upload_rate = per_second(upload);
        status
    }

    fn left(&self) -> u64 {
        (self.info.total_size() as u64).saturating_sub(self.status.bytes_done)
    }

    fn piece_completed(&mut self, piece: usize, now: Instant) -> Vec<Command> {
        if !self.has_pieces.insert(piece) {
            return Vec::new();
        }
        self.status.bytes_done += self.info.piece_size(piece) as u64;

        let mut commands = self.swarm.broadcast(Message::Have(piece));
        for addr in self.scheduler.client_has_piece(piece) {
            if let Some(record) = self.swarm.get_mut(&addr) {
                record.am_interested = false;
            }
            commands.push(Command::Send(addr, Message::NotInterested));
        }
        for (addr, block) in self.scheduler.assign_idle_peers() {
            commands.push(self.request(addr, block, now));
        }

        if self.has_pieces.len() == self.info.total_pieces() && !self.is_seeding() {
            info!("download of {} complete, seeding", self.info.name());
            self.status.state = SessionState::Seeding;
            if !self.started_complete {
                commands.push(Command::AnnounceCompleted);
            }
            commands.push(Command::PublishStatus(self.status()));
        }
        commands
    }

    fn request(&mut self, addr: SocketAddr, block: Block, now: Instant) -> Command {
        self.sweeper.block_requested(addr, block, now);
        Command::Send(addr, Message::Request(block))
    }

    /// Disconnects a peer and refuses it for the blacklist cooldown.
    fn ban(&mut self, addr: SocketAddr, now: Instant) -> Vec<Command> {
        let mut commands = vec![Command::RemovePeer(addr)];
        if self.swarm.ban(&addr, now).is_some() {
            commands.extend(self.forget(addr, now));
        }
        commands
    }

    fn violation(&mut self, addr: SocketAddr, reason: String, now: Instant) -> Vec<Command> {
        warn!("{}", Error::ProtocolViolation(addr, reason));
        self.ban(addr, now)
    }

    /// Clears the state of a peer that is gone. Its requests go to other peers.
    fn forget(&mut self, addr: SocketAddr, now: Instant) -> Vec<Command> {
        self.choker.peer_disconnected(&addr);
        self.sweeper.peer_disconnected(&addr);
        let mut commands = Vec::new();
        for (peer, block) in self.scheduler.peer_disconnected(&addr) {
            commands.push(self.request(peer, block, now));
        }
        commands
    }

    fn have(&mut self, addr: SocketAddr, piece: usize, now: Instant) -> Vec<Command> {
        if let Some(record) = self.swarm.get_mut(&addr) {
            record.claimed.insert(piece);
        }
        match self.scheduler.peer_has_piece(addr, piece) {
            PeerPieceResponse::NoAction => Vec::new(),
            PeerPieceResponse::ExpressInterest => {
                self.interested(addr);
                vec![Command::Send(addr, Message::Interested)]
            }
            PeerPieceResponse::ExpressInterestAndRequest(blocks) => {
                self.interested(addr);
                let mut commands = Vec::with_capacity(blocks.len() + 1);
                commands.push(Command::Send(addr, Message::Interested));
                for block in blocks {
                    commands.push(self.request(addr, block, now));
                }
                commands
            }
            PeerPieceResponse::RequestBlocks(blocks) => blocks
                .into_iter()
                .map(|block| self.request(addr, block, now))
                .collect(),
        }
    }

    fn interested(&mut self, addr: SocketAddr) {
        if let Some(record) = self.swarm.get_mut(&addr) {
            record.am_interested = true;
        }
    }

    fn handle_message(&mut self, addr: SocketAddr, message: Message, now: Instant) -> Vec<Command> {
        let total_pieces = self.info.total_pieces();
        match message {
            Message::KeepAlive => Vec::new(),

            Message::Choke => {
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.state = PeerState::Choked;
                }
                self.scheduler
                    .peer_choked(addr)
                    .into_iter()
                    .map(|(peer, block)| self.request(peer, block, now))
                    .collect()
            }

            Message::Unchoke => {
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.state = PeerState::Connected;
                }
                self.scheduler
                    .peer_unchoked(addr)
                    .into_iter()
                    .map(|block| self.request(addr, block, now))
                    .collect()
            }

            Message::Interested => {
                self.choker.peer_interested(addr);
                Vec::new()
            }

            Message::NotInterested => {
                self.choker.peer_not_interested(&addr);
                Vec::new()
            }

            Message::Have(piece) if piece >= total_pieces => {
                self.violation(addr, format!("have for invalid piece {}", piece), now)
            }

            Message::Have(piece) => self.have(addr, piece, now),

            Message::Bitfield(pieces) => {
                let expected_bits = total_pieces.div_ceil(8) * 8;
                if pieces.get_ref().len() != expected_bits {
                    let reason = format!("bitfield of {} bits", pieces.get_ref().len());
                    return self.violation(addr, reason, now);
                }
                if pieces.iter().any(|piece| piece >= total_pieces) {
                    return self.violation(addr, "bitfield spare bits set".to_string(), now);
                }
                pieces
                    .iter()
                    .flat_map(|piece| self.have(addr, piece, now))
                    .collect()
            }

            Message::Request(block) => {
                if !self.valid_request(&block) {
                    return self.violation(addr, format!("invalid request {:?}", block), now);
                }
                if !self.choker.is_unchoked(&addr) {
                    warn!("{} requested block while being choked", addr);
                    return Vec::new();
                }
                if !self.has_pieces.contains(block.piece) {
                    warn!("{} requested block which is not available", addr);
                    return Vec::new();
                }
                vec![Command::Upload(addr, block)]
            }

            Message::Piece(block_data) => {
                let block = Block::from(&block_data);
                if !self.scheduler.block_in_flight(&addr, &block) {
                    debug!("{} sent block {:?} which was not requested", &addr, &block);
                    return Vec::new();
                }
                self.sweeper.block_done(addr, block);
                let received = self.scheduler.block_downloaded(&addr, &block);
                let mut commands = Vec::with_capacity(received.cancels.len() + 2);
                if received.accepted {
                    self.status.downloaded += block.length as u64;
                    commands.push(Command::IntegrateBlock(addr, block_data));
                }
                for (peer, cancelled) in received.cancels {
                    self.sweeper.block_done(peer, cancelled);
                    commands.push(Command::Send(peer, Message::Cancel(cancelled)));
                }
                for (peer, next_block) in received.requests {
                    commands.push(self.request(peer, next_block, now));
                }
                commands
            }

            // Blocks are handed to storage as soon as they are requested
            Message::Cancel(_) | Message::Port(_) => Vec::new(),

            Message::Extended(EXTENDED_HANDSHAKE_ID, payload) => {
                match ExtendedHandshake::decode(&payload) {
                    Ok(handshake) => {
                        if let Some(record) = self.swarm.get_mut(&addr) {
                            record.ut_metadata = handshake.ut_metadata;
                        }
                        Vec::new()
                    }
                    Err(err) => self.violation(addr, err.to_string(), now),
                }
            }

            Message::Extended(UT_METADATA_ID, payload) => match MetadataMessage::decode(&payload) {
                Ok(MetadataMessage::Request(piece)) => self.serve_metadata(addr, piece),
                Ok(_) => Vec::new(),
                Err(err) => self.violation(addr, err.to_string(), now),
            },

            Message::Extended(id, _) => {
                debug!("ignoring extended message {} from {}", id, addr);
                Vec::new()
            }
        }
    }

    fn valid_request(&self, block: &Block) -> bool {
        block.piece < self.info.total_pieces()
            && block.length > 0
            && block.length <= self.block_size
            && block.offset + block.length <= self.info.piece_size(block.piece)
    }

    fn serve_metadata(&self, addr: SocketAddr, piece: usize) -> Vec<Command> {
        let Some(id) = self.swarm.get(&addr).and_then(|record| record.ut_metadata) else {
            return Vec::new();
        };
        let raw = &self.info.raw;
        // Indexes past the end, however large, are rejected without computing an offset
        let message = match raw.chunks(METADATA_PIECE_SIZE).nth(piece) {
            Some(data) => MetadataMessage::Data {
                piece,
                total_size: raw.len(),
                data: data.to_vec(),
            },
            _ => MetadataMessage::Reject(piece),
        };
        vec![Command::Send(addr, Message::Extended(id, message.encode()))]
    }
}

fn per_second(bytes: f64) -> TransferRate {
    TransferRate(Size::from_bytes(bytes), Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use size::Size;

    use crate::engine::config::tests::test_config;
    use crate::event::swarm::tests::handshake;
    use crate::message::BlockData;
    use crate::peer::connection::Socket;
    use crate::peer::stats::PeerStats;
    use crate::torrent::tests::test_info;

    use super::*;

    /// Three pieces of 8, 8 and 4 bytes; blocks of 4 bytes.
    fn create_event_handler(config: Config, has_pieces: BitSet) -> EventHandler {
        let info = Arc::new(test_info(8, &(0..20).collect::<Vec<u8>>()));
        let swarm = Swarm::new(&config);
        EventHandler::new(info, &config, has_pieces, swarm)
    }

    fn config() -> Config {
        test_config("/tmp")
            .with_block_size(Size::from_bytes(4))
            .with_max_concurrent_requests_per_peer(2)
            .with_endgame_threshold(0)
    }

    fn connect(handler: &mut EventHandler, addr: SocketAddr) {
        handler.handle(Event::PeersDiscovered(vec![addr]));
        handler.handle(Event::Connected(addr, handshake()));
    }

    fn message(addr: SocketAddr, message: Message) -> Event {
        Event::MessageReceived(addr, message)
    }

    fn piece(piece: usize, offset: usize) -> BlockData {
        BlockData::new(Block::new(piece, offset, 4), vec![0; 4])
    }

    #[test]
    fn keep_alive() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        let pending = "127.0.0.2:6881".parse().unwrap();
        connect(&mut handler, addr);
        handler.handle(Event::PeersDiscovered(vec![pending]));

        assert_eq!(
            handler.handle(Event::KeepAliveTicked),
            vec![Command::Send(addr, Message::KeepAlive)]
        );
    }

    #[test]
    fn sequence() {
        let _ = env_logger::try_init();

        let mut handler = create_event_handler(config(), BitSet::new());

        let addr = "127.0.0.1:6881".parse().unwrap();

        assert_eq!(
            handler.handle(Event::PeersDiscovered(vec![addr])),
            vec![Command::EstablishConnection(addr, Socket::Outbound)]
        );

        let extended = ExtendedHandshake::new(Some(handler.info.raw.len())).encode();
        assert_eq!(
            handler.handle(Event::Connected(addr, handshake())),
            vec![Command::Send(addr, Message::Extended(0, extended))]
        );

        assert_eq!(
            handler.handle(message(addr, Message::Have(0))),
            vec![Command::Send(addr, Message::Interested)]
        );

        assert_eq!(
            handler.handle(message(addr, Message::Unchoke)),
            vec![
                Command::Send(addr, Message::Request(Block::new(0, 0, 4))),
                Command::Send(addr, Message::Request(Block::new(0, 4, 4))),
            ]
        );

        assert_eq!(
            handler.handle(message(addr, Message::Piece(piece(0, 0)))),
            vec![Command::IntegrateBlock(addr, piece(0, 0))]
        );

        assert_eq!(
            handler.handle(message(addr, Message::Have(2))),
            vec![Command::Send(addr, Message::Request(Block::new(2, 0, 4)))]
        );

        assert_eq!(
            handler.handle(Event::Disconnected(addr, None)),
            vec![Command::RemovePeer(addr)]
        );
        assert_eq!(handler.status().peers, 0);
    }

    #[test]
    fn unrequested_blocks_are_not_counted() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);

        assert_eq!(
            handler.handle(message(addr, Message::Piece(piece(1, 0)))),
            vec![]
        );
        assert_eq!(handler.status().downloaded, 0);
    }

    #[test]
    fn bitfield_of_wrong_length_is_a_violation() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);

        assert_eq!(
            handler.handle(message(addr, Message::Bitfield(BitSet::from_bytes(&[0xe0, 0])))),
            vec![Command::RemovePeer(addr)]
        );
        // Blacklisted for the cooldown
        assert_eq!(handler.handle(Event::PeersDiscovered(vec![addr])), vec![]);
    }

    #[test]
    fn bitfield_with_spare_bits_is_a_violation() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);

        assert_eq!(
            handler.handle(message(addr, Message::Bitfield(BitSet::from_bytes(&[0xf0])))),
            vec![Command::RemovePeer(addr)]
        );
    }

    #[test]
    fn valid_bitfield() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);

        assert_eq!(
            handler.handle(message(addr, Message::Bitfield(BitSet::from_bytes(&[0xe0])))),
            vec![Command::Send(addr, Message::Interested)]
        );
        assert_eq!(handler.status().seeds, 1);
    }

    #[test]
    fn serve_requests_of_unchoked_peers() {
        let has_pieces = BitSet::from_iter([0, 1, 2]);
        let mut handler = create_event_handler(config(), has_pieces.clone());
        let addr = "127.0.0.1:6881".parse().unwrap();
        let block = Block::new(1, 4, 4);

        handler.handle(Event::PeersDiscovered(vec![addr]));
        assert_eq!(
            handler.handle(Event::Connected(addr, handshake())),
            vec![
                Command::Send(addr, Message::Bitfield(has_pieces)),
                Command::Send(
                    addr,
                    Message::Extended(
                        0,
                        ExtendedHandshake::new(Some(handler.info.raw.len())).encode()
                    )
                ),
            ]
        );

        assert_eq!(handler.handle(message(addr, Message::Request(block))), vec![]);

        handler.handle(message(addr, Message::Interested));
        assert_eq!(
            handler.handle(Event::ChokeTicked),
            vec![Command::Send(addr, Message::Unchoke)]
        );
        assert_eq!(
            handler.handle(message(addr, Message::Request(block))),
            vec![Command::Upload(addr, block)]
        );
        // Counted once the connection reports the block as sent
        assert_eq!(handler.status().uploaded, 0);
        let sent = PeerStats {
            upload: TransferRate(Size::from_bytes(17), Duration::from_secs(1)),
            download: TransferRate::EMPTY,
            blocks_sent: 4,
        };
        handler.handle(Event::StatsUpdated(addr, sent));
        assert_eq!(handler.status().uploaded, 4);

        // Past the end of the last piece
        assert_eq!(
            handler.handle(message(addr, Message::Request(Block::new(2, 2, 4)))),
            vec![Command::RemovePeer(addr)]
        );
    }

    #[test]
    fn endgame_cancels_duplicate_requests() {
        let config = config()
            .with_max_concurrent_requests_per_peer(1)
            .with_endgame_threshold(4);
        let mut handler = create_event_handler(config, BitSet::from_iter([0, 1]));
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();
        let block = Block::new(2, 0, 4);
        connect(&mut handler, addr1);
        connect(&mut handler, addr2);

        for addr in [addr1, addr2] {
            handler.handle(message(addr, Message::Have(2)));
            assert_eq!(
                handler.handle(message(addr, Message::Unchoke)),
                vec![Command::Send(addr, Message::Request(block))]
            );
        }

        let data = BlockData::new(block, vec![1; 4]);
        assert_eq!(
            handler.handle(message(addr2, Message::Piece(data.clone()))),
            vec![
                Command::IntegrateBlock(addr2, data.clone()),
                Command::Send(addr1, Message::Cancel(block)),
            ]
        );
        // Late arrival of the cancelled request
        assert_eq!(handler.handle(message(addr1, Message::Piece(data))), vec![]);
        assert_eq!(handler.status().downloaded, 4);
    }

    #[test]
    fn request_timeout_penalizes_and_reassigns() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();
        connect(&mut handler, addr1);
        connect(&mut handler, addr2);

        handler.handle(message(addr1, Message::Have(2)));
        handler.handle(message(addr1, Message::Unchoke));
        handler.handle(message(addr2, Message::Have(2)));
        handler.handle(message(addr2, Message::Unchoke));

        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(
            handler.handle(Event::SweepTicked(later)),
            vec![Command::Send(addr2, Message::Request(Block::new(2, 0, 4)))]
        );
        assert_eq!(handler.swarm.get(&addr1).unwrap().penalty, 1);
    }

    #[test]
    fn hash_failure_penalizes_contributors() {
        let config = config().with_max_peer_penalty(3);
        let mut handler = create_event_handler(config, BitSet::new());
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();
        connect(&mut handler, addr1);
        connect(&mut handler, addr2);

        handler.handle(message(addr1, Message::Have(2)));
        handler.handle(message(addr1, Message::Unchoke));
        handler.handle(message(addr1, Message::Piece(piece(2, 0))));
        handler.handle(message(addr2, Message::Have(2)));
        handler.handle(message(addr2, Message::Unchoke));

        assert_eq!(
            handler.handle(Event::PieceVerificationFailed {
                piece: 2,
                contributors: vec![addr1],
            }),
            vec![
                Command::Send(addr2, Message::Request(Block::new(2, 0, 4))),
                Command::RemovePeer(addr1),
            ]
        );
        assert!(handler.swarm.get(&addr1).is_none());
    }

    #[test]
    fn completing_every_piece_starts_seeding() {
        let mut handler = create_event_handler(config(), BitSet::from_iter([0, 1]));
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);
        handler.handle(message(addr, Message::Have(2)));

        let commands = handler.handle(Event::PieceCompleted(2));

        assert_eq!(
            commands[..3],
            [
                Command::Send(addr, Message::Have(2)),
                Command::Send(addr, Message::NotInterested),
                Command::AnnounceCompleted,
            ]
        );
        let status = handler.status();
        assert_eq!(status.state, SessionState::Seeding);
        assert_eq!(status.bytes_done, 20);
        assert_eq!(status.progress(), 100.0);
    }

    #[test]
    fn complete_at_start_does_not_announce_completion() {
        let handler = create_event_handler(config(), BitSet::from_iter([0, 1, 2]));

        assert!(handler.is_seeding());
        assert_eq!(handler.left(), 0);
    }

    #[test]
    fn storage_failure_stops_the_session() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let err = Error::StorageError("disk full".to_string());

        let commands = handler.handle(Event::StorageFailed(err.clone()));

        assert_eq!(commands.last(), Some(&Command::Fail(err.clone())));
        assert_eq!(handler.status().last_error, Some(err));
    }

    #[test]
    fn serve_metadata_to_peers() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);
        let raw = handler.info.raw.to_vec();

        handler.handle(message(
            addr,
            Message::Extended(0, ExtendedHandshake::new(None).encode()),
        ));

        assert_eq!(
            handler.handle(message(
                addr,
                Message::Extended(UT_METADATA_ID, MetadataMessage::Request(0).encode())
            )),
            vec![Command::Send(
                addr,
                Message::Extended(
                    UT_METADATA_ID,
                    MetadataMessage::Data {
                        piece: 0,
                        total_size: raw.len(),
                        data: raw,
                    }
                    .encode()
                )
            )]
        );
        assert_eq!(
            handler.handle(message(
                addr,
                Message::Extended(UT_METADATA_ID, MetadataMessage::Request(1).encode())
            )),
            vec![Command::Send(
                addr,
                Message::Extended(UT_METADATA_ID, MetadataMessage::Reject(1).encode())
            )]
        );
    }

    #[test]
    fn reject_metadata_requests_out_of_range() {
        let mut handler = create_event_handler(config(), BitSet::new());
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr);
        handler.handle(message(
            addr,
            Message::Extended(0, ExtendedHandshake::new(None).encode()),
        ));

        let commands = handler.handle(message(
            addr,
            Message::Extended(
                UT_METADATA_ID,
                b"d8:msg_typei0e5:piecei9223372036854775807ee".to_vec(),
            ),
        ));

        assert_eq!(
            commands,
            vec![Command::Send(
                addr,
                Message::Extended(
                    UT_METADATA_ID,
                    MetadataMessage::Reject(i64::MAX as usize).encode()
                )
            )]
        );
        assert!(handler.swarm.get(&addr).is_some());
    }
}
