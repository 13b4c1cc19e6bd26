use log::{debug, warn};
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;

use crate::command::Command;
use crate::event::Event;
use crate::peer::connection_manager::ConnectionManager;
use crate::session::SessionStatus;
use crate::storage::Storage;
use crate::torrent::Info;
use crate::tracker::Tracker;

/// Executes commands for managing peer connections, file I/O, and tracker communication
/// of one session.
pub struct CommandExecutor {
    /// Active peer connections
    connections: ConnectionManager,
    /// Storage task, once the descriptor is known
    storage: Option<Storage>,
    /// Announce task, if the torrent has HTTP trackers
    tracker: Option<Tracker>,
    /// Latest status, read by the engine
    status: watch::Sender<SessionStatus>,
    events: Sender<Event>,
}

#[derive(Debug, PartialEq)]
pub enum ExecutionResult {
    Continue,
    Stop,
    /// The descriptor of a magnet link was fetched
    Resolved(Info),
}

impl CommandExecutor {
    pub fn new(
        connections: ConnectionManager,
        tracker: Option<Tracker>,
        status: watch::Sender<SessionStatus>,
        events: Sender<Event>,
    ) -> Self {
        Self {
            connections,
            storage: None,
            tracker,
            status,
            events,
        }
    }

    pub fn attach_storage(&mut self, storage: Storage) {
        self.storage = Some(storage);
    }

    /// Waits only when the storage queue is full.
    pub async fn execute(&mut self, command: Command) -> ExecutionResult {
        match command {
            Command::EstablishConnection(addr, socket) => {
                if let Err(err) = self.connections.start(addr, socket) {
                    debug!("not connecting to {}: {}", addr, err);
                    // Reported like any other failed connection
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        let _ = events.send(Event::Disconnected(addr, Some(err))).await;
                    });
                }
            }

            Command::Send(addr, message) => self.connections.send(&addr, message),

            Command::RemovePeer(addr) => self.connections.remove(&addr),

            Command::Upload(addr, block) => {
                match (&self.storage, self.connections.sender(&addr)) {
                    (Some(storage), Some(peer)) => storage.read(block, peer).await,
                    _ => debug!("dropping upload of {:?} to {}", block, addr),
                }
            }

            Command::IntegrateBlock(addr, block_data) => match &self.storage {
                Some(storage) => storage.write(addr, block_data).await,
                None => warn!("block from {} before storage is ready", addr),
            },

            Command::UpdateTracker {
                downloaded,
                uploaded,
                left,
            } => {
                if let Some(tracker) = &self.tracker {
                    tracker.update_progress(downloaded, uploaded, left);
                }
            }

            Command::AnnounceCompleted => {
                if let Some(tracker) = &self.tracker {
                    tracker.completed();
                }
            }

            Command::PublishStatus(status) => {
                self.status.send_replace(status);
            }

            Command::MetadataResolved(info) => return ExecutionResult::Resolved(info),

            Command::Fail(err) => {
                warn!("session failed: {}", err);
                return ExecutionResult::Stop;
            }
        }
        ExecutionResult::Continue
    }

    pub fn publish(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    /// Announces the stop, closes every connection and flushes pending writes, then publishes
    /// the final status.
    pub async fn shutdown(self, last: SessionStatus) {
        let Self {
            connections,
            storage,
            tracker,
            status,
            ..
        } = self;
        let tracker = async move {
            if let Some(tracker) = tracker {
                if let Err(err) = tracker.shutdown().await {
                    warn!("error encountered while shutting down tracker: {:?}", err);
                }
            }
        };
        tokio::join!(tracker, connections.shutdown());
        if let Some(storage) = storage {
            storage.shutdown().await;
        }
        status.send_replace(last);
    }
}
