use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bit_set::BitSet;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::command::Command;
use crate::core::{SHA1_LEN, Sha1};
use crate::engine::Config;
use crate::error::Error;
use crate::event::{Event, Swarm};
use crate::message::{
    EXTENDED_HANDSHAKE_ID, ExtendedHandshake, METADATA_PIECE_SIZE, Message, MetadataMessage,
    UT_METADATA_ID, metadata_pieces,
};
use crate::session::{SessionState, SessionStatus};
use crate::torrent::Info;

/// Largest info dictionary accepted from peers
const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// Pieces a descriptor of the largest accepted size could describe
const MAX_ANNOUNCED_PIECES: usize = MAX_METADATA_SIZE / SHA1_LEN;

/// Handles the events of a session started from a magnet link, until the descriptor is
/// fetched from peers.
///
/// Metadata pieces are requested with `ut_metadata` from the peers advertising the size being
/// assembled. That size is the one most peers agree on, and it is reconsidered whenever the
/// assembly has nothing to lose. Piece availability and choke state received meanwhile are
/// kept, to be replayed once the transfer starts.
pub struct MetadataHandler {
    info_hash: Sha1,
    swarm: Swarm,
    metadata: Option<Metadata>,
    request_timeout: Duration,
    metadata_timeout: Duration,
    /// Metadata size advertised by each peer
    sizes: HashMap<SocketAddr, usize>,
    /// Announcements kept per peer until the descriptor is known
    announced: HashMap<SocketAddr, Announced>,
    deadline: Instant,
    timeout_reported: bool,
    status: SessionStatus,
}

struct Metadata {
    size: usize,
    pieces: Vec<Option<Vec<u8>>>,
    /// Outstanding requests: piece -> (peer, requested at)
    requested: HashMap<usize, (SocketAddr, Instant)>,
    /// Peer each received piece came from
    sources: HashMap<usize, SocketAddr>,
}

impl Metadata {
    fn new(size: usize) -> Self {
        Self {
            size,
            pieces: vec![None; metadata_pieces(size)],
            requested: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    fn piece_length(&self, piece: usize) -> usize {
        METADATA_PIECE_SIZE.min(self.size - piece * METADATA_PIECE_SIZE)
    }

    fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    fn assemble(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size);
        for piece in self.pieces.iter().flatten() {
            bytes.extend_from_slice(piece);
        }
        bytes
    }

    fn is_untouched(&self) -> bool {
        self.pieces.iter().all(Option::is_none)
    }
}

/// Latest state a peer announced, replayed as messages once the transfer starts.
#[derive(Debug, Default)]
struct Announced {
    bitfield: Option<BitSet>,
    have: BitSet,
    choking: Option<bool>,
    interested: Option<bool>,
}

impl Announced {
    fn replay(self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.bitfield.into_iter().map(Message::Bitfield).collect();
        messages.extend(self.have.iter().map(Message::Have));
        match self.choking {
            Some(true) => messages.push(Message::Choke),
            Some(false) => messages.push(Message::Unchoke),
            None => (),
        }
        match self.interested {
            Some(true) => messages.push(Message::Interested),
            Some(false) => messages.push(Message::NotInterested),
            None => (),
        }
        messages
    }
}

impl MetadataHandler {
    pub fn new(info_hash: Sha1, name: Option<String>, config: &Config, swarm: Swarm) -> Self {
        let mut status = SessionStatus::new(info_hash, SessionState::MetadataPending);
        status.name = name;
        Self {
            info_hash,
            swarm,
            metadata: None,
            request_timeout: config.block_timeout,
            metadata_timeout: config.metadata_timeout,
            sizes: HashMap::new(),
            announced: HashMap::new(),
            deadline: Instant::now() + config.metadata_timeout,
            timeout_reported: false,
            status,
        }
    }

    /// Hands the peers and their buffered messages over to the transfer phase.
    pub fn into_parts(self) -> (Swarm, Vec<(SocketAddr, Vec<Message>)>) {
        let mut buffered: Vec<_> = self
            .announced
            .into_iter()
            .map(|(addr, announced)| (addr, announced.replay()))
            .collect();
        buffered.sort_by_key(|(addr, _)| *addr);
        (self.swarm, buffered)
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.clone();
        status.peers = self.swarm.connected_peers().count();
        status
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        let now = Instant::now();
        match event {
            Event::KeepAliveTicked => self.swarm.broadcast(Message::KeepAlive),

            Event::StatsTicked => vec![Command::PublishStatus(self.status())],

            Event::SweepTicked(instant) => {
                self.swarm.expire(instant);
                let mut commands = Vec::new();
                if instant >= self.deadline && !self.timeout_reported {
                    self.timeout_reported = true;
                    let err = Error::MetadataFetchFailed(format!(
                        "no metadata for {} within {:?}",
                        self.info_hash, self.metadata_timeout
                    ));
                    warn!("{}", err);
                    self.status.last_error = Some(err);
                    commands.push(Command::PublishStatus(self.status()));
                }
                if let Some(metadata) = &mut self.metadata {
                    let timeout = self.request_timeout;
                    let mut silent = Vec::new();
                    metadata.requested.retain(|_, (peer, requested_at)| {
                        let pending = *requested_at + timeout > instant;
                        if !pending {
                            silent.push(*peer);
                        }
                        pending
                    });
                    // Peers that do not answer no longer get a say in the size
                    for peer in silent {
                        self.sizes.remove(&peer);
                    }
                    self.settle_size();
                }
                commands.extend(self.swarm.connect_more());
                commands.extend(self.request_pieces(now));
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
                if !handshake.supports_extensions() {
                    debug!("{} does not support extensions", addr);
                    return Vec::new();
                }
                let ours = ExtendedHandshake::new(None);
                vec![Command::Send(
                    addr,
                    Message::Extended(EXTENDED_HANDSHAKE_ID, ours.encode()),
                )]
            }

            Event::MessageReceived(addr, message) => {
                if self.swarm.get(&addr).is_none() {
                    return Vec::new();
                }
                self.handle_message(addr, message, now)
            }

            Event::StatsUpdated(addr, stats) => {
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.record_stats(stats);
                }
                Vec::new()
            }

            Event::Disconnected(addr, error) => {
                let limited = matches!(error, Some(Error::ConnectionLimit));
                self.swarm.disconnected(&addr, error.as_ref(), now);
                self.forget(&addr);
                let mut commands = vec![Command::RemovePeer(addr)];
                if !limited {
                    commands.extend(self.swarm.connect_more());
                }
                commands.extend(self.request_pieces(now));
                commands
            }

            Event::StorageFailed(err) => vec![Command::Fail(err)],

            Event::ChokeTicked | Event::PieceCompleted(_) | Event::PieceVerificationFailed { .. } => {
                Vec::new()
            }
        }
    }

    fn handle_message(&mut self, addr: SocketAddr, message: Message, now: Instant) -> Vec<Command> {
        match message {
            Message::Extended(EXTENDED_HANDSHAKE_ID, payload) => {
                let handshake = match ExtendedHandshake::decode(&payload) {
                    Ok(handshake) => handshake,
                    Err(err) => return self.violation(addr, err.to_string(), now),
                };
                if let Some(record) = self.swarm.get_mut(&addr) {
                    record.ut_metadata = handshake.ut_metadata;
                }
                match handshake.metadata_size {
                    Some(size) if size == 0 || size > MAX_METADATA_SIZE => {
                        self.violation(addr, format!("metadata size {}", size), now)
                    }
                    Some(size) => {
                        self.sizes.insert(addr, size);
                        self.settle_size();
                        self.request_pieces(now)
                    }
                    None => Vec::new(),
                }
            }

            Message::Extended(UT_METADATA_ID, payload) => match MetadataMessage::decode(&payload) {
                Ok(MetadataMessage::Request(piece)) => {
                    // Nothing to serve yet
                    let Some(id) = self.swarm.get(&addr).and_then(|record| record.ut_metadata)
                    else {
                        return Vec::new();
                    };
                    let reject = MetadataMessage::Reject(piece).encode();
                    vec![Command::Send(addr, Message::Extended(id, reject))]
                }
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data,
                }) => self.metadata_received(addr, piece, total_size, data, now),
                Ok(MetadataMessage::Reject(piece)) => {
                    debug!("{} rejected metadata piece {}", addr, piece);
                    if let Some(metadata) = &mut self.metadata {
                        metadata.requested.remove(&piece);
                    }
                    Vec::new()
                }
                Err(err) => self.violation(addr, err.to_string(), now),
            },

            Message::Extended(..) | Message::KeepAlive => Vec::new(),

            Message::Have(_)
            | Message::Bitfield(_)
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => self.announce(addr, message, now),

            Message::Request(_) | Message::Piece(_) | Message::Cancel(_) | Message::Port(_) => {
                debug!("{} sent {:?} before metadata is known", addr, message);
                Vec::new()
            }
        }
    }

    fn metadata_received(
        &mut self,
        addr: SocketAddr,
        piece: usize,
        total_size: usize,
        data: Vec<u8>,
        now: Instant,
    ) -> Vec<Command> {
        if self.sizes.get(&addr).is_some_and(|size| *size != total_size) {
            let reason = format!("metadata of {} bytes, advertised otherwise", total_size);
            return self.violation(addr, reason, now);
        }
        let Some(metadata) = &mut self.metadata else {
            return Vec::new();
        };
        if total_size != metadata.size {
            debug!("{} sent metadata of another size, ignoring", addr);
            return Vec::new();
        }
        if piece >= metadata.pieces.len() {
            return self.violation(addr, format!("unexpected metadata piece {}", piece), now);
        }
        if data.len() != metadata.piece_length(piece) {
            let reason = format!("metadata piece {} of {} bytes", piece, data.len());
            return self.violation(addr, reason, now);
        }
        metadata.requested.remove(&piece);
        if metadata.pieces[piece].is_none() {
            metadata.pieces[piece] = Some(data);
            metadata.sources.insert(piece, addr);
        }
        if !metadata.is_complete() {
            return self.request_pieces(now);
        }

        match Info::from_metadata(self.info_hash, &metadata.assemble()) {
            Ok(info) => {
                info!("fetched metadata of {} ({})", info.name(), self.info_hash);
                vec![Command::MetadataResolved(info)]
            }
            Err(err) => {
                let sources: Vec<SocketAddr> = metadata.sources.values().copied().collect();
                self.metadata = None;
                warn!("rejecting metadata of {}: {}", self.info_hash, err);
                let mut commands = Vec::new();
                for source in sources {
                    if self.swarm.ban(&source, now).is_some() {
                        self.forget(&source);
                        commands.push(Command::RemovePeer(source));
                    }
                }
                self.settle_size();
                commands.extend(self.request_pieces(now));
                commands
            }
        }
    }

    /// Assembles the size most peers advertise, ties going to the size already chosen. A
    /// size is only switched while none of its pieces arrived.
    fn settle_size(&mut self) {
        if self.metadata.as_ref().is_some_and(|metadata| !metadata.is_untouched()) {
            return;
        }
        let current = self.metadata.as_ref().map(|metadata| metadata.size);
        let mut votes: HashMap<usize, usize> = HashMap::new();
        for size in self.sizes.values() {
            *votes.entry(*size).or_default() += 1;
        }
        let favourite = votes
            .into_iter()
            .max_by_key(|(size, count)| (*count, Some(*size) == current, std::cmp::Reverse(*size)))
            .map(|(size, _)| size);
        match favourite {
            Some(size) if Some(size) != current => {
                debug!("assembling metadata of {} as {} bytes", self.info_hash, size);
                self.metadata = Some(Metadata::new(size));
            }
            Some(_) => (),
            None => self.metadata = None,
        }
    }

    fn announce(&mut self, addr: SocketAddr, message: Message, now: Instant) -> Vec<Command> {
        if let Message::Have(piece) = message {
            if piece >= MAX_ANNOUNCED_PIECES {
                return self.violation(addr, format!("have for invalid piece {}", piece), now);
            }
        }
        let announced = self.announced.entry(addr).or_default();
        match message {
            Message::Have(piece) => {
                announced.have.insert(piece);
            }
            Message::Bitfield(pieces) => announced.bitfield = Some(pieces),
            Message::Choke => announced.choking = Some(true),
            Message::Unchoke => announced.choking = Some(false),
            Message::Interested => announced.interested = Some(true),
            Message::NotInterested => announced.interested = Some(false),
            _ => (),
        }
        Vec::new()
    }

    /// Requests missing metadata pieces, spreading them over the peers advertising the size
    /// being assembled.
    fn request_pieces(&mut self, now: Instant) -> Vec<Command> {
        let Some(metadata) = &mut self.metadata else {
            return Vec::new();
        };
        let size = metadata.size;
        let sizes = &self.sizes;
        let peers: Vec<(SocketAddr, u8)> = self
            .swarm
            .connected_peers()
            .filter(|record| sizes.get(&record.addr) == Some(&size))
            .filter_map(|record| record.ut_metadata.map(|id| (record.addr, id)))
            .collect();
        if peers.is_empty() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        let mut next_peer = peers.iter().cycle();
        for piece in 0..metadata.pieces.len() {
            if metadata.pieces[piece].is_some() || metadata.requested.contains_key(&piece) {
                continue;
            }
            let Some(&(addr, id)) = next_peer.next() else {
                break;
            };
            metadata.requested.insert(piece, (addr, now));
            let request = MetadataMessage::Request(piece).encode();
            commands.push(Command::Send(addr, Message::Extended(id, request)));
        }
        commands
    }

    fn violation(&mut self, addr: SocketAddr, reason: String, now: Instant) -> Vec<Command> {
        warn!("{}", Error::ProtocolViolation(addr, reason));
        self.swarm.ban(&addr, now);
        self.forget(&addr);
        let mut commands = vec![Command::RemovePeer(addr)];
        commands.extend(self.request_pieces(now));
        commands
    }

    fn forget(&mut self, addr: &SocketAddr) {
        self.announced.remove(addr);
        self.sizes.remove(addr);
        if let Some(metadata) = &mut self.metadata {
            metadata.requested.retain(|_, (peer, _)| peer != addr);
        }
        self.settle_size();
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::config::tests::test_config;
    use crate::event::swarm::tests::handshake;
    use crate::message::Block;
    use crate::torrent::tests::test_info;

    use super::*;

    /// Info dictionary of a bit over 20 KiB: two metadata pieces.
    fn large_info() -> Info {
        test_info(1, &[7; 1000])
    }

    fn create_handler(info_hash: Sha1) -> MetadataHandler {
        let config = test_config("/tmp");
        MetadataHandler::new(info_hash, Some("test".to_string()), &config, Swarm::new(&config))
    }

    fn connect(handler: &mut MetadataHandler, addr: SocketAddr, metadata_size: usize) -> Vec<Command> {
        handler.handle(Event::PeersDiscovered(vec![addr]));
        handler.handle(Event::Connected(addr, handshake()));
        let theirs = ExtendedHandshake {
            ut_metadata: Some(3),
            metadata_size: Some(metadata_size),
        };
        handler.handle(Event::MessageReceived(
            addr,
            Message::Extended(EXTENDED_HANDSHAKE_ID, theirs.encode()),
        ))
    }

    fn data(raw: &[u8], piece: usize) -> Message {
        let start = piece * METADATA_PIECE_SIZE;
        let end = raw.len().min(start + METADATA_PIECE_SIZE);
        let message = MetadataMessage::Data {
            piece,
            total_size: raw.len(),
            data: raw[start..end].to_vec(),
        };
        Message::Extended(UT_METADATA_ID, message.encode())
    }

    fn request(addr: SocketAddr, piece: usize) -> Command {
        Command::Send(
            addr,
            Message::Extended(3, MetadataMessage::Request(piece).encode()),
        )
    }

    #[test]
    fn send_extended_handshake_to_peers_supporting_it() {
        let mut handler = create_handler(Sha1([1; 20]));
        let addr = "127.0.0.1:6881".parse().unwrap();
        handler.handle(Event::PeersDiscovered(vec![addr]));

        assert_eq!(
            handler.handle(Event::Connected(addr, handshake())),
            vec![Command::Send(
                addr,
                Message::Extended(0, ExtendedHandshake::new(None).encode())
            )]
        );
    }

    #[test]
    fn fetch_metadata_from_peers() {
        let _ = env_logger::try_init();
        let info = large_info();
        let raw = info.raw.to_vec();
        assert_eq!(metadata_pieces(raw.len()), 2);
        let mut handler = create_handler(info.info_hash);
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();

        assert_eq!(
            connect(&mut handler, addr1, raw.len()),
            vec![request(addr1, 0), request(addr1, 1)]
        );
        assert_eq!(connect(&mut handler, addr2, raw.len()), vec![]);

        assert_eq!(
            handler.handle(Event::MessageReceived(addr1, data(&raw, 1))),
            vec![]
        );
        assert_eq!(
            handler.handle(Event::MessageReceived(addr1, data(&raw, 0))),
            vec![Command::MetadataResolved(info)]
        );
    }

    #[test]
    fn reject_wrong_metadata() {
        let info = large_info();
        let wrong = test_info(1, &[8; 1000]).raw.to_vec();
        let mut handler = create_handler(info.info_hash);
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();
        connect(&mut handler, addr1, wrong.len());
        connect(&mut handler, addr2, wrong.len());

        handler.handle(Event::MessageReceived(addr1, data(&wrong, 0)));
        assert_eq!(
            handler.handle(Event::MessageReceived(addr1, data(&wrong, 1))),
            vec![
                Command::RemovePeer(addr1),
                request(addr2, 0),
                request(addr2, 1)
            ]
        );
        // Banned for the cooldown
        assert_eq!(handler.handle(Event::PeersDiscovered(vec![addr1])), vec![]);
    }

    #[test]
    fn peer_advertising_another_size_does_not_ban_the_others() {
        let info = large_info();
        let raw = info.raw.to_vec();
        let mut handler = create_handler(info.info_hash);
        let liar = "127.0.0.1:6881".parse().unwrap();
        let honest = "127.0.0.2:6881".parse().unwrap();
        assert_eq!(connect(&mut handler, liar, 1), vec![request(liar, 0)]);
        assert_eq!(connect(&mut handler, honest, raw.len()), vec![]);

        // Not the size being assembled yet
        assert_eq!(
            handler.handle(Event::MessageReceived(honest, data(&raw, 0))),
            vec![]
        );
        assert_eq!(
            handler.handle(Event::MessageReceived(liar, data(b"x", 0))),
            vec![
                Command::RemovePeer(liar),
                request(honest, 0),
                request(honest, 1)
            ]
        );
        assert_eq!(
            handler.handle(Event::MessageReceived(honest, data(&raw, 0))),
            vec![]
        );
        assert_eq!(
            handler.handle(Event::MessageReceived(honest, data(&raw, 1))),
            vec![Command::MetadataResolved(info)]
        );
    }

    #[test]
    fn silent_peer_loses_its_say_in_the_size() {
        let info = large_info();
        let raw = info.raw.to_vec();
        let mut handler = create_handler(info.info_hash);
        let silent = "127.0.0.1:6881".parse().unwrap();
        let honest = "127.0.0.2:6881".parse().unwrap();
        connect(&mut handler, silent, 1);
        connect(&mut handler, honest, raw.len());

        let later = Instant::now() + Duration::from_secs(11);

        assert_eq!(
            handler.handle(Event::SweepTicked(later)),
            vec![request(honest, 0), request(honest, 1)]
        );
    }

    #[test]
    fn data_contradicting_the_advertised_size_is_a_violation() {
        let info = large_info();
        let raw = info.raw.to_vec();
        let mut handler = create_handler(info.info_hash);
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr, raw.len());

        assert_eq!(
            handler.handle(Event::MessageReceived(addr, data(b"x", 0))),
            vec![Command::RemovePeer(addr)]
        );
    }

    #[test]
    fn piece_of_wrong_length_is_a_violation() {
        let info = large_info();
        let raw = info.raw.to_vec();
        let mut handler = create_handler(info.info_hash);
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr, raw.len());

        let message = MetadataMessage::Data {
            piece: 1,
            total_size: raw.len(),
            data: vec![0; 10],
        };
        assert_eq!(
            handler.handle(Event::MessageReceived(
                addr,
                Message::Extended(UT_METADATA_ID, message.encode())
            )),
            vec![Command::RemovePeer(addr)]
        );
    }

    #[test]
    fn buffer_availability_until_metadata_is_known() {
        let mut handler = create_handler(Sha1([1; 20]));
        let addr1 = "127.0.0.1:6881".parse().unwrap();
        let addr2 = "127.0.0.2:6881".parse().unwrap();
        for addr in [addr1, addr2] {
            handler.handle(Event::PeersDiscovered(vec![addr]));
            handler.handle(Event::Connected(addr, handshake()));
        }

        let messages = [
            Message::Have(3),
            Message::Unchoke,
            Message::Request(Block::new(0, 0, 4)),
        ];
        for message in messages {
            handler.handle(Event::MessageReceived(addr2, message));
        }
        handler.handle(Event::MessageReceived(addr1, Message::Interested));

        let (swarm, buffered) = handler.into_parts();
        assert_eq!(swarm.connected_peers().count(), 2);
        assert_eq!(
            buffered,
            vec![
                (addr1, vec![Message::Interested]),
                (addr2, vec![Message::Have(3), Message::Unchoke]),
            ]
        );
    }

    #[test]
    fn repeated_announcements_are_collapsed() {
        let mut handler = create_handler(Sha1([1; 20]));
        let addr = "127.0.0.1:6881".parse().unwrap();
        handler.handle(Event::PeersDiscovered(vec![addr]));
        handler.handle(Event::Connected(addr, handshake()));

        for _ in 0..1000 {
            for message in [Message::Have(2), Message::Have(1), Message::Unchoke, Message::Choke] {
                handler.handle(Event::MessageReceived(addr, message));
            }
        }

        let (_, buffered) = handler.into_parts();
        assert_eq!(
            buffered,
            vec![(addr, vec![Message::Have(1), Message::Have(2), Message::Choke])]
        );
    }

    #[test]
    fn have_beyond_any_descriptor_is_a_violation() {
        let mut handler = create_handler(Sha1([1; 20]));
        let addr = "127.0.0.1:6881".parse().unwrap();
        handler.handle(Event::PeersDiscovered(vec![addr]));
        handler.handle(Event::Connected(addr, handshake()));

        assert_eq!(
            handler.handle(Event::MessageReceived(addr, Message::Have(u32::MAX as usize))),
            vec![Command::RemovePeer(addr)]
        );
        assert!(handler.into_parts().1.is_empty());
    }

    #[test]
    fn reject_metadata_requests_while_pending() {
        let mut handler = create_handler(Sha1([1; 20]));
        let addr = "127.0.0.1:6881".parse().unwrap();
        connect(&mut handler, addr, 100);

        assert_eq!(
            handler.handle(Event::MessageReceived(
                addr,
                Message::Extended(UT_METADATA_ID, MetadataMessage::Request(0).encode())
            )),
            vec![Command::Send(
                addr,
                Message::Extended(3, MetadataMessage::Reject(0).encode())
            )]
        );
    }

    #[test]
    fn report_timeout_once() {
        let mut handler = create_handler(Sha1([1; 20]));
        let later = Instant::now() + Duration::from_secs(121);

        let commands = handler.handle(Event::SweepTicked(later));

        let [Command::PublishStatus(status)] = commands.as_slice() else {
            panic!("unexpected commands {:?}", commands);
        };
        assert_eq!(status.state, SessionState::MetadataPending);
        assert!(matches!(
            status.last_error,
            Some(Error::MetadataFetchFailed(_))
        ));
        assert_eq!(handler.handle(Event::SweepTicked(later)), vec![]);
    }
}
