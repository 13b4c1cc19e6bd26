pub mod config;
mod listener;
mod rate_limit;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::Sha1;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::session::{
    Session, SessionContext, SessionParams, SessionStatus, interval_with_delay,
};
use crate::storage::FileLayout;
use crate::torrent::{DescriptorSource, Torrent};

pub use config::Config;
pub use rate_limit::RateLimiter;

use self::listener::Listener;

/// Interval at which the rate limiter buckets are refilled
const REPLENISH_INTERVAL: Duration = Duration::from_millis(100);

type Sessions = Arc<Mutex<HashMap<Sha1, Session>>>;

/// Identifies a torrent added to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub Sha1);

impl SessionHandle {
    pub fn info_hash(&self) -> Sha1 {
        self.0
    }
}

/// Process-wide manager of torrent sessions.
///
/// Owns the incoming connection listener, the global rate limits and connection cap, and a
/// ticker that refills the rate limits and drives the choking algorithm of every session.
pub struct Engine {
    context: Arc<SessionContext>,
    sessions: Sessions,
    local_addr: SocketAddr,
    cancellation_token: CancellationToken,
    listener: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl Engine {
    pub async fn start(config: Config) -> Result<Self> {
        let listener = Listener::bind(&config.listen_ports).await?;
        let local_addr = listener.local_addr()?;
        let context = Arc::new(SessionContext {
            port: local_addr.port(),
            connection_permits: Arc::new(Semaphore::new(config.max_connections)),
            session_permits: Arc::new(Semaphore::new(config.max_active_sessions)),
            disk: Arc::new(Semaphore::new(config.disk_workers)),
            download_limit: Arc::new(RateLimiter::new(config.download_rate_limit)),
            upload_limit: Arc::new(RateLimiter::new(config.upload_rate_limit)),
            config: Arc::new(config),
        });
        let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
        let cancellation_token = CancellationToken::new();

        let listener = tokio::spawn(listener.run(
            Arc::clone(&sessions),
            context.config.connect_timeout,
            cancellation_token.clone(),
        ));
        let ticker = tokio::spawn(tick(
            Arc::clone(&context),
            Arc::clone(&sessions),
            cancellation_token.clone(),
        ));

        Ok(Self {
            context,
            sessions,
            local_addr,
            cancellation_token,
            listener,
            ticker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    /// Starts a session for the torrent. Returns as soon as the session is registered; magnet
    /// links resolve their descriptor in the background.
    pub async fn add_torrent(&self, source: DescriptorSource) -> Result<SessionHandle> {
        let params = match source {
            DescriptorSource::File(path) => {
                let torrent = Torrent::load(&path).await.map_err(|err| {
                    Error::InvalidDescriptor(format!("{}: {}", path.display(), err))
                })?;
                torrent_params(torrent)
            }
            DescriptorSource::Torrent(torrent) => torrent_params(torrent),
            DescriptorSource::Magnet(magnet) => SessionParams {
                info_hash: magnet.info_hash,
                name: magnet.display_name,
                info: None,
                trackers: magnet.trackers,
                peers: magnet.peers,
            },
        };

        let info_hash = params.info_hash;
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&info_hash) {
            if !existing.is_stopped() {
                return Err(Error::DuplicateTorrent(info_hash));
            }
        }
        info!("adding torrent {}", info_hash);
        let session = Session::spawn(params, Arc::clone(&self.context));
        sessions.insert(info_hash, session);
        Ok(SessionHandle(info_hash))
    }

    /// Connects the session to a peer, in addition to the ones trackers return.
    pub async fn add_peer(&self, handle: SessionHandle, addr: SocketAddr) -> Result<()> {
        let session = self.session(handle)?;
        session.send(Event::PeersDiscovered(vec![addr])).await
    }

    /// Stops the session, keeping it listed with its final status.
    pub async fn stop_torrent(&self, handle: SessionHandle) -> Result<()> {
        let session = self.session(handle)?;
        session.stop().await;
        Ok(())
    }

    /// Stops the session and forgets it, optionally deleting its files.
    pub async fn remove_torrent(&self, handle: SessionHandle, delete_files: bool) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .remove(&handle.info_hash())
            .ok_or(Error::UnknownTorrent(handle.info_hash()))?;
        session.stop().await;
        if delete_files {
            if let Some(info) = session.info() {
                let layout = FileLayout::new(&self.context.config.download_path, &info);
                layout.delete().await?;
                info!("deleted files of {}", info.name());
            }
        }
        Ok(())
    }

    /// Stops every session, then the listener and the ticker.
    pub async fn stop_all(&self) {
        let sessions: Vec<Session> = self.sessions.lock().values().cloned().collect();
        join_all(sessions.iter().map(Session::stop)).await;
        self.cancellation_token.cancel();
    }

    /// Waits for the listener and the ticker to exit, after `stop_all`.
    pub async fn shutdown(self) {
        self.stop_all().await;
        for handle in [self.listener, self.ticker] {
            if let Err(err) = handle.await {
                debug!("engine task failed: {}", err);
            }
        }
    }

    /// Snapshots of every session, by name.
    pub fn status(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .lock()
            .values()
            .map(Session::status)
            .collect();
        statuses.sort_by(|a, b| {
            (a.name.as_deref(), a.info_hash.0).cmp(&(b.name.as_deref(), b.info_hash.0))
        });
        statuses
    }

    pub fn session_status(&self, handle: SessionHandle) -> Result<SessionStatus> {
        Ok(self.session(handle)?.status())
    }

    pub fn subscribe(&self, handle: SessionHandle) -> Result<watch::Receiver<SessionStatus>> {
        Ok(self.session(handle)?.subscribe())
    }

    fn session(&self, handle: SessionHandle) -> Result<Session> {
        self.sessions
            .lock()
            .get(&handle.info_hash())
            .cloned()
            .ok_or(Error::UnknownTorrent(handle.info_hash()))
    }
}

fn torrent_params(torrent: Torrent) -> SessionParams {
    SessionParams {
        info_hash: torrent.info.info_hash,
        name: Some(torrent.info.name().to_string()),
        info: Some(torrent.info),
        trackers: torrent.trackers,
        peers: Vec::new(),
    }
}

/// Refills the rate limits and runs the choking algorithm of every session.
async fn tick(context: Arc<SessionContext>, sessions: Sessions, cancellation_token: CancellationToken) {
    let mut replenish = interval_with_delay(REPLENISH_INTERVAL);
    let mut choke = interval_with_delay(context.config.choking_interval);
    let mut last_replenish = Instant::now();
    loop {
        tokio::select! {
            now = replenish.tick() => {
                let elapsed = now - last_replenish;
                last_replenish = now;
                context.download_limit.replenish(elapsed);
                context.upload_limit.replenish(elapsed);
            }
            _ = choke.tick() => {
                for session in sessions.lock().values() {
                    if !session.is_stopped() && session.notify(Event::ChokeTicked).is_err() {
                        debug!("session {} missed a choke tick", session.info_hash());
                    }
                }
            }
            _ = cancellation_token.cancelled() => break,
        }
    }
}
