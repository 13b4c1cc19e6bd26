use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::warn;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::peer::connection::{Connection, ConnectionSettings, Socket};

/// Connections of one session.
///
/// Every connection holds a permit of the engine-wide connection semaphore for as long as its
/// task runs.
pub struct ConnectionManager {
    peers: HashMap<SocketAddr, Connection>,
    settings: Arc<ConnectionSettings>,
    permits: Arc<Semaphore>,
}

impl ConnectionManager {
    pub fn new(settings: Arc<ConnectionSettings>, permits: Arc<Semaphore>) -> Self {
        Self {
            peers: HashMap::new(),
            settings,
            permits,
        }
    }

    pub fn start(&mut self, addr: SocketAddr, socket: Socket) -> Result<()> {
        if self.peers.contains_key(&addr) {
            return Ok(());
        }
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Error::ConnectionLimit)?;
        let conn = Connection::spawn(addr, socket, Arc::clone(&self.settings), permit);
        self.peers.insert(addr, conn);
        Ok(())
    }

    pub fn send(&self, addr: &SocketAddr, message: Message) {
        let Some(peer) = self.peers.get(addr) else {
            return;
        };
        if peer.send(message).is_err() {
            warn!("peer {} is not keeping up, disconnecting", addr);
            peer.cancel();
        }
    }

    pub fn sender(&self, addr: &SocketAddr) -> Option<Sender<Message>> {
        self.peers.get(addr).map(Connection::sender)
    }

    pub fn remove(&mut self, addr: &SocketAddr) {
        if let Some(peer) = self.peers.remove(addr) {
            peer.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub async fn shutdown(mut self) {
        let mut join_set = JoinSet::new();
        for (_, peer) in self.peers.drain() {
            join_set.spawn(peer.shutdown());
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                warn!("error encountered while shutting down: {:?}", err);
            }
        }
    }
}
