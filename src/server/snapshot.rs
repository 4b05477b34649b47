//! Snapshot encoding
//!
//! Format: [MAGIC "SKV1"][CRC32 of payload, LE][bincode payload]
//!
//! The payload holds everything the applier owns: sessions, every shard with
//! its version and last holder, both configurations and the applied position.

use super::store::{Holder, SessionTable, Shard};
use crate::common::{crc32, Error, Result, N_SHARDS};
use crate::shardctrler::Configuration;
use serde::{Deserialize, Serialize};

const SNAPSHOT_MAGIC: [u8; 4] = *b"SKV1";
const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub last_applied: u64,
    pub current: Configuration,
    pub previous: Configuration,
    pub shards: Vec<Shard>,
    pub holders: Vec<Option<Holder>>,
    pub sessions: SessionTable,
}

pub fn encode(image: &SnapshotImage) -> Result<Vec<u8>> {
    let payload = bincode::serialize(image)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&SNAPSHOT_MAGIC);
    out.extend_from_slice(&crc32(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<SnapshotImage> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::SnapshotCorrupted(format!(
            "truncated header ({} bytes)",
            bytes.len()
        )));
    }
    if bytes[..4] != SNAPSHOT_MAGIC {
        return Err(Error::SnapshotCorrupted("bad magic".into()));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[4..HEADER_LEN]);
    let expected = u32::from_le_bytes(crc);
    let payload = &bytes[HEADER_LEN..];
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::SnapshotCorrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }

    let image: SnapshotImage = bincode::deserialize(payload)
        .map_err(|e| Error::SnapshotCorrupted(e.to_string()))?;
    if image.shards.len() != N_SHARDS || image.holders.len() != N_SHARDS {
        return Err(Error::SnapshotCorrupted(format!(
            "expected {} shards, found {} ({} holders)",
            N_SHARDS,
            image.shards.len(),
            image.holders.len()
        )));
    }
    Ok(image)
}
