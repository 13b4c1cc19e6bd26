pub mod bencoding;
pub mod command;
pub mod core;
pub mod engine;
pub mod error;
pub mod event;
pub mod message;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;
