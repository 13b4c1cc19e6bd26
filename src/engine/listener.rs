use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::AsyncDecoder;
use crate::engine::Sessions;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::message::Handshake;

/// Accepts incoming peer connections for every session. The handshake is read here, to find
/// the session by info hash.
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Binds the first free port of the range.
    pub async fn bind(ports: &RangeInclusive<u16>) -> Result<Self> {
        let mut last_error = None;
        for port in ports.clone() {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(listener) => {
                    info!("listening on {}", listener.local_addr()?);
                    return Ok(Self { listener });
                }
                Err(err) => {
                    debug!("port {} unavailable: {}", port, err);
                    last_error = Some(err);
                }
            }
        }
        let err = last_error
            .unwrap_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, "empty port range"));
        Err(err.into())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(
        self,
        sessions: Sessions,
        handshake_timeout: Duration,
        cancellation_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let sessions = sessions.clone();
                        tokio::spawn(async move {
                            if let Err(err) = route(socket, addr, sessions, handshake_timeout).await {
                                debug!("dropping connection from {}: {}", addr, err);
                            }
                        });
                    }
                    Err(err) => warn!("error accepting connection: {}", err),
                },
                _ = cancellation_token.cancelled() => break,
            }
        }
        debug!("listener stopped");
    }
}

async fn route(
    mut socket: TcpStream,
    addr: SocketAddr,
    sessions: Sessions,
    handshake_timeout: Duration,
) -> Result<()> {
    let handshake = timeout(handshake_timeout, Handshake::decode(&mut socket))
        .await
        .map_err(|_| Error::ConnectError(addr, "handshake timed out".to_string()))?
        .map_err(|err| Error::HandshakeMismatch(addr, err.to_string()))?;
    let session = sessions
        .lock()
        .get(&handshake.info_hash)
        .filter(|session| !session.is_stopped())
        .cloned();
    match session {
        Some(session) => session.notify(Event::ConnectionAccepted(addr, socket, handshake)),
        None => Err(Error::UnknownTorrent(handshake.info_hash)),
    }
}
