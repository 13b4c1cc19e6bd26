use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use log::{debug, info, warn};
use size::Size;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::core::{AsyncDecoder, AsyncEncoder, TransferRate, TransportMessage};
use crate::engine::RateLimiter;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::message::{Handshake, Message, MessageCodec};
use crate::peer::stats::PeerStats;

/// How long queued messages may take to leave once the connection is cancelled
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a connection task needs from its session.
pub struct ConnectionSettings {
    /// Handshake the client sends
    pub handshake: Handshake,
    pub events: Sender<Event>,
    pub download_limit: Arc<RateLimiter>,
    pub upload_limit: Arc<RateLimiter>,
    pub connect_timeout: Duration,
    pub max_message_length: usize,
    pub channel_buffer: usize,
    pub update_stats_interval: Duration,
}

/// How the transport of a new connection is obtained.
#[derive(Debug)]
pub enum Socket {
    /// Client dials the peer and sends its handshake first
    Outbound,
    /// Peer dialed in; its handshake was already read by the listener
    Inbound(TcpStream, Handshake),
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Outbound, Self::Outbound) => true,
            (Self::Inbound(a, ha), Self::Inbound(b, hb)) => {
                ha == hb && a.peer_addr().ok() == b.peer_addr().ok()
            }
            _ => false,
        }
    }
}

/// Handle to the task driving one peer connection.
///
/// The task reports `Connected` once handshakes are exchanged, then every message received,
/// periodic transfer stats and finally `Disconnected`, with the error that ended it.
pub struct Connection {
    tx: Sender<Message>,
    join_handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl Connection {
    pub fn spawn(
        addr: SocketAddr,
        socket: Socket,
        settings: Arc<ConnectionSettings>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.channel_buffer);
        let cancellation_token = CancellationToken::new();
        let token_clone = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            let result = run(addr, socket, &settings, rx, token_clone).await;
            let error = match result {
                Ok(()) => None,
                Err(err) => {
                    warn!("[{}] connection failed: {}", addr, err);
                    Some(err)
                }
            };
            info!("peer {} disconnected", addr);
            // Frees the connection slot before the session hears about it
            drop(permit);
            if settings
                .events
                .send(Event::Disconnected(addr, error))
                .await
                .is_err()
            {
                debug!("[{}] session already gone", addr);
            }
        });
        Self {
            tx,
            join_handle,
            cancellation_token,
        }
    }

    /// Queues a message without waiting. Fails if the peer does not keep up.
    pub fn send(&self, message: Message) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Channel),
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    pub fn sender(&self) -> Sender<Message> {
        self.tx.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(err) = self.join_handle.await {
            warn!("connection task failed: {}", err);
        }
    }
}

async fn run(
    addr: SocketAddr,
    socket: Socket,
    settings: &ConnectionSettings,
    mut rx: Receiver<Message>,
    cancellation_token: CancellationToken,
) -> Result<()> {
    let connect = async {
        let (socket, remote) = match socket {
            Socket::Outbound => {
                info!("connecting to {}...", addr);
                let mut socket = TcpStream::connect(addr)
                    .await
                    .map_err(|err| Error::ConnectError(addr, err.to_string()))?;
                settings.handshake.encode(&mut socket).await?;
                let remote = Handshake::decode(&mut socket)
                    .await
                    .map_err(|err| Error::HandshakeMismatch(addr, err.to_string()))?;
                (socket, remote)
            }
            Socket::Inbound(mut socket, remote) => {
                info!("accepted connection from {}", addr);
                settings.handshake.encode(&mut socket).await?;
                (socket, remote)
            }
        };
        verify_handshake(addr, &settings.handshake, &remote)?;
        Ok::<_, Error>((socket, remote))
    };
    let (socket, remote) = tokio::select! {
        result = timeout(settings.connect_timeout, connect) => result
            .map_err(|_| Error::ConnectError(addr, "timed out".to_string()))??,
        _ = cancellation_token.cancelled() => return Ok(()),
    };

    settings
        .events
        .send(Event::Connected(addr, remote))
        .await
        .map_err(|_| Error::Channel)?;

    let mut messages = Framed::new(socket, MessageCodec::new(settings.max_message_length));
    // Cancellation wins even while a write waits on a peer that stopped reading
    tokio::select! {
        result = exchange(addr, settings, &mut messages, &mut rx) => return result,
        _ = cancellation_token.cancelled() => info!("[{}] shutting down...", addr),
    }
    match timeout(FLUSH_TIMEOUT, messages.flush()).await {
        Ok(result) => result?,
        Err(_) => debug!("[{}] peer is not reading, closing", addr),
    }
    Ok(())
}

/// Moves messages between the socket and the session until either side is done.
async fn exchange(
    addr: SocketAddr,
    settings: &ConnectionSettings,
    messages: &mut Framed<TcpStream, MessageCodec>,
    rx: &mut Receiver<Message>,
) -> Result<()> {
    let mut last_report = Instant::now();
    let mut update_stats = interval_at(
        last_report + settings.update_stats_interval,
        settings.update_stats_interval,
    );
    let mut uploaded = 0;
    let mut downloaded = 0;
    let mut blocks_sent = 0;

    loop {
        tokio::select! {
            now = update_stats.tick() => {
                let elapsed = now - last_report;
                last_report = now;
                let stats = PeerStats {
                    upload: TransferRate(Size::from_bytes(uploaded), elapsed),
                    download: TransferRate(Size::from_bytes(downloaded), elapsed),
                    blocks_sent,
                };
                (uploaded, downloaded, blocks_sent) = (0, 0, 0);
                settings
                    .events
                    .send(Event::StatsUpdated(addr, stats))
                    .await
                    .map_err(|_| Error::Channel)?;
            }
            message = rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                let block_len = match &message {
                    Message::Piece(block_data) => block_data.data.len(),
                    _ => 0,
                };
                if block_len > 0 {
                    settings.upload_limit.acquire(block_len).await;
                }
                debug!("[{}] > sending {:?}", addr, &message);
                uploaded += message.transport_bytes();
                messages.send(message).await?;
                blocks_sent += block_len as u64;
            }
            message = messages.next() => match message {
                Some(Ok(message)) => {
                    debug!("[{}] < got {:?}", addr, message);
                    if let Message::Piece(block_data) = &message {
                        settings.download_limit.acquire(block_data.data.len()).await;
                    }
                    downloaded += message.transport_bytes();
                    settings
                        .events
                        .send(Event::MessageReceived(addr, message))
                        .await
                        .map_err(|_| Error::Channel)?;
                }
                Some(Err(err)) if err.kind() == ErrorKind::InvalidData => {
                    return Err(Error::ProtocolViolation(addr, err.to_string()));
                }
                Some(Err(err)) => return Err(err.into()),
                None => {
                    info!("[{}] socket closed", addr);
                    return Ok(());
                }
            },
        }
    }

    messages.flush().await?;
    Ok(())
}

fn verify_handshake(addr: SocketAddr, ours: &Handshake, theirs: &Handshake) -> Result<()> {
    if !theirs.is_standard_protocol() {
        return Err(Error::HandshakeMismatch(
            addr,
            format!("invalid protocol: {}", theirs.protocol),
        ));
    }
    if theirs.info_hash != ours.info_hash {
        return Err(Error::HandshakeMismatch(
            addr,
            format!("info hash {} does not match", theirs.info_hash),
        ));
    }
    if theirs.peer_id == ours.peer_id {
        return Err(Error::HandshakeMismatch(addr, "connected to self".to_string()));
    }
    Ok(())
}
