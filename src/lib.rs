//! # shardkv
//!
//! A sharded, replicated key/value store:
//! - Keys are split into a fixed number of shards
//! - Each shard is owned by one replica group at a time, as published by a
//!   configuration authority
//! - Every group serializes client operations, configuration changes and
//!   shard installs through its replicated log
//! - Shards move between groups by pull-based migration, carrying the
//!   duplicate-suppression sessions with them
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────────────────────┐
//!              │  Configuration authority   │
//!              │  (shard → group, numbered) │
//!              └──────┬──────────────┬──────┘
//!          query next │              │ query latest
//!   ┌─────────────────▼───┐      ┌───▼──────┐
//!   │ Group 1             │      │  Clerk   │
//!   │  replica 0 (leader) │◄─────┤ Get/Put/ │
//!   │  replica 1          │      │ Append   │
//!   │  replica 2          │      └───┬──────┘
//!   └─────────▲───────────┘          │
//!             │ PullShard            │
//!   ┌─────────┴───────────┐          │
//!   │ Group 2             │◄─────────┘
//!   └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Run an in-process cluster under a reconfiguring workload
//! shardkv-sim --groups 3 --replicas 3 --clients 5 --ops 200
//!
//! # Override settings from a file and the environment
//! SHARDKV__SERVER__REQUEST_TIMEOUT_MS=800 shardkv-sim --config shardkv.toml
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod cluster;
pub mod common;
pub mod consensus;
pub mod server;
pub mod shardctrler;
pub mod transport;

// Re-export commonly used types
pub use client::Clerk;
pub use cluster::Cluster;
pub use common::{Config, Error, Result};
pub use server::ShardKv;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
