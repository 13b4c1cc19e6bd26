pub mod blacklist;
pub mod choke;
pub mod connection;
pub mod connection_manager;
pub mod record;
pub mod stats;
pub mod sweeper;
