//! Append-only block database: blocks are durably staged, indexed by a
//! background task into a head-prunable heap file, and served back by
//! height, hash, or log filter through collision-tolerant short-hash keys.

pub mod config;
pub mod db;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hash48;
pub mod heap;
pub mod indexer;
pub mod meta;
pub mod types;

pub use config::Config;
pub use db::ChainDb;
pub use error::{Error, Result};
pub use types::{Block, BlockIndex, LogEntry, Transaction};
