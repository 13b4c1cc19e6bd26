use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Peers refused for a cooldown after misbehaving.
pub struct Blacklist {
    cooldown: Duration,
    until: HashMap<SocketAddr, Instant>,
}

impl Blacklist {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            until: HashMap::new(),
        }
    }

    pub fn insert(&mut self, addr: SocketAddr, now: Instant) {
        self.until.insert(addr, now + self.cooldown);
    }

    pub fn contains(&self, addr: &SocketAddr, now: Instant) -> bool {
        self.until.get(addr).is_some_and(|until| now < *until)
    }

    /// Forgets peers whose cooldown is over.
    pub fn expire(&mut self, now: Instant) {
        self.until.retain(|_, until| now < *until);
    }
}
