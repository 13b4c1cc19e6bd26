use std::cmp::Reverse;
use std::hash::Hash;
use std::net::SocketAddr;
use std::time::Duration;

use priority_queue::PriorityQueue;
use tokio::time::Instant;

use crate::message::Block;

/// Keys ordered by deadline, earliest first.
struct Deadlines<K: Hash + Eq> {
    timeout: Duration,
    queue: PriorityQueue<K, Reverse<Instant>>,
}

impl<K: Hash + Eq> Deadlines<K> {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            queue: PriorityQueue::new(),
        }
    }

    /// Restarts the timeout of `key`, never moving its deadline earlier.
    fn extend(&mut self, key: K, now: Instant) {
        self.queue.push_decrease(key, Reverse(now + self.timeout));
    }

    /// Starts the timeout of `key` over.
    fn restart(&mut self, key: K, now: Instant) {
        self.queue.push(key, Reverse(now + self.timeout));
    }

    fn remove(&mut self, key: &K) {
        self.queue.remove(key);
    }

    fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.queue.retain(|key, _| keep(key));
    }

    fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some((key, _)) = self
            .queue
            .pop_if(|_, Reverse(deadline)| *deadline <= now)
        {
            expired.push(key);
        }
        expired
    }
}

/// Watches peers for silence and block requests for missing answers.
pub struct Sweeper {
    idle_peers: Deadlines<SocketAddr>,
    requests: Deadlines<(SocketAddr, Block)>,
}

impl Sweeper {
    pub fn new(idle_peer_timeout: Duration, block_timeout: Duration) -> Self {
        Self {
            idle_peers: Deadlines::new(idle_peer_timeout),
            requests: Deadlines::new(block_timeout),
        }
    }

    pub fn update_peer_activity(&mut self, addr: SocketAddr, now: Instant) {
        self.idle_peers.extend(addr, now);
    }

    pub fn block_requested(&mut self, addr: SocketAddr, block: Block, now: Instant) {
        self.requests.restart((addr, block), now);
    }

    /// The request was answered or cancelled.
    pub fn block_done(&mut self, addr: SocketAddr, block: Block) {
        self.requests.remove(&(addr, block));
    }

    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.idle_peers.remove(addr);
        self.requests.retain(|(peer, _)| peer != addr);
    }

    /// Removes and returns whatever is past its deadline.
    pub fn sweep(&mut self, now: Instant) -> SweepResult {
        SweepResult {
            peers: self.idle_peers.expired(now),
            blocks: self.requests.expired(now),
        }
    }
}

#[derive(Debug, Default)]
pub struct SweepResult {
    /// Silent for the idle timeout
    pub peers: Vec<SocketAddr>,
    /// Requested longer than the block timeout ago, oldest first
    pub blocks: Vec<(SocketAddr, Block)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(120);
    const BLOCK: Duration = Duration::from_secs(30);

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 6881))
    }

    #[test]
    fn peers_are_idle_after_the_timeout_since_their_last_message() {
        let mut sweeper = Sweeper::new(IDLE, BLOCK);
        let start = Instant::now();
        sweeper.update_peer_activity(addr(1), start);
        sweeper.update_peer_activity(addr(2), start);

        sweeper.update_peer_activity(addr(1), start + Duration::from_secs(60));

        assert!(sweeper.sweep(start + IDLE - Duration::from_secs(1)).peers.is_empty());
        assert_eq!(sweeper.sweep(start + IDLE).peers, vec![addr(2)]);
        assert_eq!(
            sweeper.sweep(start + Duration::from_secs(180)).peers,
            vec![addr(1)]
        );
    }

    #[test]
    fn stale_activity_does_not_shorten_the_deadline() {
        let mut sweeper = Sweeper::new(IDLE, BLOCK);
        let start = Instant::now();

        sweeper.update_peer_activity(addr(1), start + Duration::from_secs(10));
        sweeper.update_peer_activity(addr(1), start);

        assert!(sweeper.sweep(start + IDLE).peers.is_empty());
    }

    #[test]
    fn unanswered_requests_expire_oldest_first() {
        let mut sweeper = Sweeper::new(IDLE, BLOCK);
        let start = Instant::now();
        let first = Block::new(3, 0, 16384);
        let second = Block::new(3, 16384, 16384);
        sweeper.block_requested(addr(1), second, start + Duration::from_secs(1));
        sweeper.block_requested(addr(2), first, start);
        sweeper.block_requested(addr(1), Block::new(4, 0, 16384), start + Duration::from_secs(20));

        let result = sweeper.sweep(start + BLOCK + Duration::from_secs(1));

        assert!(result.peers.is_empty());
        assert_eq!(result.blocks, vec![(addr(2), first), (addr(1), second)]);
    }

    #[test]
    fn answered_requests_are_not_swept() {
        let mut sweeper = Sweeper::new(IDLE, BLOCK);
        let start = Instant::now();
        let block = Block::new(0, 0, 8);

        sweeper.block_requested(addr(1), block, start);
        sweeper.block_done(addr(1), block);
        sweeper.block_done(addr(1), block);

        assert!(sweeper.sweep(start + BLOCK).blocks.is_empty());
    }

    #[test]
    fn disconnected_peer_is_forgotten() {
        let mut sweeper = Sweeper::new(IDLE, BLOCK);
        let start = Instant::now();
        sweeper.update_peer_activity(addr(1), start);
        sweeper.block_requested(addr(1), Block::new(0, 0, 8), start);
        sweeper.block_requested(addr(2), Block::new(1, 0, 8), start);

        sweeper.peer_disconnected(&addr(1));

        let result = sweeper.sweep(start + IDLE);
        assert!(result.peers.is_empty());
        assert_eq!(result.blocks, vec![(addr(2), Block::new(1, 0, 8))]);
    }
}
