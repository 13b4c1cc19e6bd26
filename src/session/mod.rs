mod status;
mod timers;

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use bit_set::BitSet;
use log::{debug, error, info};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Semaphore, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::command::{Command, CommandExecutor, ExecutionResult};
use crate::core::Sha1;
use crate::engine::{Config, RateLimiter};
use crate::error::{Error, Result};
use crate::event::{Event, EventHandler, MetadataHandler, Swarm};
use crate::message::Handshake;
use crate::peer::connection::ConnectionSettings;
use crate::peer::connection_manager::ConnectionManager;
use crate::storage::{FileLayout, PieceStore, Storage};
use crate::torrent::Info;
use crate::tracker::{Progress, Tracker, TrackerClient, UNKNOWN_LEFT};

pub use status::*;
pub use timers::interval_with_delay;

use self::timers::Timers;

/// Engine-wide resources shared by every session.
pub struct SessionContext {
    pub config: Arc<Config>,
    /// Port of the incoming connection listener, announced to trackers
    pub port: u16,
    pub connection_permits: Arc<Semaphore>,
    pub session_permits: Arc<Semaphore>,
    pub disk: Arc<Semaphore>,
    pub download_limit: Arc<RateLimiter>,
    pub upload_limit: Arc<RateLimiter>,
}

/// What a session starts from.
#[derive(Debug)]
pub struct SessionParams {
    pub info_hash: Sha1,
    pub name: Option<String>,
    /// Unknown for magnet links until fetched from peers
    pub info: Option<Info>,
    pub trackers: Vec<Url>,
    pub peers: Vec<SocketAddr>,
}

/// Handle to the task of one torrent.
#[derive(Clone)]
pub struct Session {
    info_hash: Sha1,
    events: Sender<Event>,
    status: watch::Receiver<SessionStatus>,
    cancellation_token: CancellationToken,
    info: Arc<OnceLock<Arc<Info>>>,
}

impl Session {
    pub fn spawn(params: SessionParams, context: Arc<SessionContext>) -> Self {
        let info_hash = params.info_hash;
        let (events_tx, events_rx) = mpsc::channel(context.config.events_buffer);
        let initial_state = match params.info {
            Some(_) => SessionState::Downloading,
            None => SessionState::MetadataPending,
        };
        let mut initial = SessionStatus::new(params.info_hash, initial_state);
        initial.name = match &params.info {
            Some(info) => Some(info.name().to_string()),
            None => params.name.clone(),
        };
        initial.total_bytes = params.info.as_ref().map(|info| info.total_size() as u64);
        let (status_tx, status_rx) = watch::channel(initial);
        let cancellation_token = CancellationToken::new();
        let info = Arc::new(OnceLock::new());

        let task = SessionTask {
            info_hash,
            context,
            events_tx: events_tx.clone(),
            events_rx,
            cancellation_token: cancellation_token.clone(),
            info: Arc::clone(&info),
        };
        tokio::spawn(task.run(params, status_tx));

        Self {
            info_hash,
            events: events_tx,
            status: status_rx,
            cancellation_token,
            info,
        }
    }

    pub fn info_hash(&self) -> Sha1 {
        self.info_hash
    }

    /// Descriptor, once known.
    pub fn info(&self) -> Option<Arc<Info>> {
        self.info.get().cloned()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Queues an event without waiting. Ticks and routed connections are dropped if the
    /// session is not keeping up.
    pub fn notify(&self, event: Event) -> Result<()> {
        self.events.try_send(event).map_err(|_| Error::Channel)
    }

    pub async fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).await.map_err(|_| Error::Channel)
    }

    pub fn is_stopped(&self) -> bool {
        self.status.borrow().state == SessionState::Stopped
    }

    /// Stops the session and waits until its connections are closed and pending writes are
    /// flushed. Stopping a stopped session does nothing.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let mut status = self.status.clone();
        // The task is gone if the sender was dropped
        let _ = status
            .wait_for(|status| status.state == SessionState::Stopped)
            .await;
    }
}

enum Phase {
    Metadata(MetadataHandler),
    Transfer(EventHandler),
}

impl Phase {
    fn handle(&mut self, event: Event) -> Vec<Command> {
        match self {
            Phase::Metadata(handler) => handler.handle(event),
            Phase::Transfer(handler) => handler.handle(event),
        }
    }

    fn status(&self) -> SessionStatus {
        match self {
            Phase::Metadata(handler) => handler.status(),
            Phase::Transfer(handler) => handler.status(),
        }
    }

    /// Hands the peers of the metadata phase over to the transfer.
    fn resolve(
        self,
        storage: OpenedStorage,
        config: &Config,
        executor: &mut CommandExecutor,
    ) -> (Phase, Vec<Command>) {
        match self {
            Phase::Metadata(metadata) => {
                let (swarm, buffered) = metadata.into_parts();
                executor.attach_storage(storage.storage);
                let mut handler =
                    EventHandler::new(storage.info, config, storage.has_pieces, swarm);
                let commands = handler.resume(buffered);
                (Phase::Transfer(handler), commands)
            }
            transfer => (transfer, Vec::new()),
        }
    }
}

struct OpenedStorage {
    info: Arc<Info>,
    has_pieces: BitSet,
    storage: Storage,
}

/// How the event loop ended
enum Exit {
    Stopped,
    Failed(Error),
}

struct SessionTask {
    info_hash: Sha1,
    context: Arc<SessionContext>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    cancellation_token: CancellationToken,
    info: Arc<OnceLock<Arc<Info>>>,
}

impl SessionTask {
    async fn run(mut self, params: SessionParams, status: watch::Sender<SessionStatus>) {
        let config = Arc::clone(&self.context.config);
        let session_permits = Arc::clone(&self.context.session_permits);
        let permit = tokio::select! {
            permit = session_permits.acquire_owned() => permit.ok(),
            _ = self.cancellation_token.cancelled() => None,
        };
        let Some(_permit) = permit else {
            let mut last = status.borrow().clone();
            last.state = SessionState::Stopped;
            status.send_replace(last);
            return;
        };
        info!("starting session {}", self.info_hash);

        let settings = ConnectionSettings {
            handshake: Handshake::new(self.info_hash, config.client_id),
            events: self.events_tx.clone(),
            download_limit: Arc::clone(&self.context.download_limit),
            upload_limit: Arc::clone(&self.context.upload_limit),
            connect_timeout: config.connect_timeout,
            max_message_length: config.max_message_length(),
            channel_buffer: config.channel_buffer,
            update_stats_interval: config.update_stats_interval,
        };
        let connections = ConnectionManager::new(
            Arc::new(settings),
            Arc::clone(&self.context.connection_permits),
        );
        let client = TrackerClient::new(
            params.trackers,
            self.info_hash,
            config.client_id,
            self.context.port,
        );
        let tracker = (!client.is_empty()).then(|| {
            let left = match &params.info {
                Some(info) => info.total_size() as u64,
                None => UNKNOWN_LEFT,
            };
            let progress = Progress {
                left,
                ..Progress::default()
            };
            Tracker::spawn(client, progress, self.events_tx.clone())
        });
        let mut executor = CommandExecutor::new(connections, tracker, status, self.events_tx.clone());

        let swarm = Swarm::new(&config);
        let mut phase = match params.info {
            Some(info) => match self.open(info).await {
                Ok(opened) => {
                    executor.attach_storage(opened.storage);
                    Phase::Transfer(EventHandler::new(
                        opened.info,
                        &config,
                        opened.has_pieces,
                        swarm,
                    ))
                }
                Err(err) => {
                    self.finish(executor, None, Some(err)).await;
                    return;
                }
            },
            None => Phase::Metadata(MetadataHandler::new(
                self.info_hash,
                params.name,
                &config,
                swarm,
            )),
        };
        executor.publish(phase.status());
        let commands = phase.handle(Event::PeersDiscovered(params.peers));
        execute_all(&mut executor, commands).await;

        let mut timers = Timers::new(&config);
        let exit = loop {
            let event = tokio::select! {
                event = timers.tick() => event,
                Some(event) = self.events_rx.recv() => event,
                _ = self.cancellation_token.cancelled() => break Exit::Stopped,
            };
            match execute_all(&mut executor, phase.handle(event)).await {
                ExecutionResult::Continue => (),
                ExecutionResult::Stop => break Exit::Stopped,
                ExecutionResult::Resolved(info) => {
                    let opened = match self.open(info).await {
                        Ok(opened) => opened,
                        Err(err) => break Exit::Failed(err),
                    };
                    let (next, commands) = phase.resolve(opened, &config, &mut executor);
                    phase = next;
                    execute_all(&mut executor, commands).await;
                    executor.publish(phase.status());
                }
            }
        };

        let failure = match exit {
            Exit::Stopped => {
                self.drain(&mut phase, &mut executor).await;
                None
            }
            Exit::Failed(err) => Some(err),
        };
        self.finish(executor, Some(phase.status()), failure).await;
    }

    /// Checks the files already on disk and starts the storage task.
    async fn open(&self, info: Info) -> Result<OpenedStorage> {
        let info = Arc::new(info);
        let _ = self.info.set(Arc::clone(&info));
        let layout = FileLayout::new(&self.context.config.download_path, &info);
        let has_pieces = Storage::open(&info, &layout, &self.context.disk).await?;
        info!(
            "{}: {} of {} pieces on disk",
            info.name(),
            has_pieces.len(),
            info.total_pieces()
        );
        let store = PieceStore::new(
            &info,
            self.context.config.block_size_bytes(),
            &has_pieces,
        );
        let storage = Storage::spawn(
            Arc::clone(&info),
            layout,
            store,
            Arc::clone(&self.context.disk),
            self.events_tx.clone(),
            self.context.config.channel_buffer,
        );
        Ok(OpenedStorage {
            info,
            has_pieces,
            storage,
        })
    }

    /// Stops requesting, then gives requests in flight the grace period to complete.
    async fn drain(&mut self, phase: &mut Phase, executor: &mut CommandExecutor) {
        let Phase::Transfer(handler) = phase else {
            return;
        };
        handler.drain();
        let grace = sleep(self.context.config.shutdown_grace);
        tokio::pin!(grace);
        while handler.has_outstanding_requests() {
            let event = tokio::select! {
                _ = &mut grace => break,
                Some(event) = self.events_rx.recv() => event,
            };
            if execute_all(executor, handler.handle(event)).await == ExecutionResult::Stop {
                break;
            }
        }
        let cancels = handler.cancel_outstanding();
        if !cancels.is_empty() {
            debug!("cancelling {} requests", cancels.len());
        }
        execute_all(executor, cancels).await;
    }

    async fn finish(
        mut self,
        executor: CommandExecutor,
        status: Option<SessionStatus>,
        failure: Option<Error>,
    ) {
        let mut status =
            status.unwrap_or_else(|| SessionStatus::new(self.info_hash, SessionState::Stopped));
        status.state = SessionState::Stopped;
        if let Some(err) = failure {
            error!("session {} failed: {}", self.info_hash, err);
            status.last_error = Some(err);
        }

        // Keep receiving so the storage and connection tasks never block on a full queue
        let shutdown = executor.shutdown(status);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => {
                    debug!("dropping {:?} while stopping", event);
                }
            }
        }
        info!("session {} stopped", self.info_hash);
    }
}

async fn execute_all(executor: &mut CommandExecutor, commands: Vec<Command>) -> ExecutionResult {
    let mut outcome = ExecutionResult::Continue;
    for command in commands {
        match executor.execute(command).await {
            ExecutionResult::Continue => (),
            ExecutionResult::Stop => return ExecutionResult::Stop,
            resolved => outcome = resolved,
        }
    }
    outcome
}
