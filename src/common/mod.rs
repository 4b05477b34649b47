//! Common utilities and types shared across shardkv

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use config::{ClientConfig, Config, ServerConfig};
pub use error::{Error, Result};
pub use hash::{crc32, shard_for_key, N_SHARDS};
pub use utils::{random_client_id, Backoff};
