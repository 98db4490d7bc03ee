//! Binary codec for cluster state snapshots
//!
//! # Layout
//! ```text
//! ┌────────────┬─────────┬────────────┬─────────────────────┬────────────────────┬──────────────────┬──────────┐
//! │ magic u32  │ fmt u8  │ version i64│ len u32 │ metadata  │ len u32 │ routing  │ len u32 │ nodes  │ crc32c   │
//! │ "QCST" LE  │         │ LE         │         │ block     │         │ block    │         │ block  │ u32 LE   │
//! └────────────┴─────────┴────────────┴─────────────────────┴────────────────────┴──────────────────┴──────────┘
//! ```
//! Blocks are bincode bodies (fixed-width integers, little endian). The
//! metadata block also carries the cluster name and state uuid. The checksum
//! covers every byte before it.
//!
//! Decoding validates the whole frame and checksum before any block is
//! deserialized, and each block must consume exactly its declared length.

use crate::metadata::Metadata;
use crate::nodes::DiscoveryNodes;
use crate::routing::RoutingTable;
use crate::state::ClusterState;
use bincode::Options;
use quarry_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// "QCST" read as a little-endian u32
pub const MAGIC: u32 = u32::from_le_bytes(*b"QCST");

/// Current format version
pub const FORMAT_VERSION: u8 = 1;

/// magic + format version + state version
const HEADER_SIZE: usize = 4 + 1 + 8;
const LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// Metadata block body
#[derive(Serialize, Deserialize)]
struct MetadataEnvelope {
    cluster_name: String,
    state_uuid: Uuid,
    metadata: Metadata,
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn encode_block<T: Serialize>(out: &mut Vec<u8>, what: &str, value: &T) -> Result<()> {
    let body = bincode_options()
        .serialize(value)
        .map_err(|e| Error::Serialization(format!("{what} block: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::format(format!("{what} block too large: {} bytes", body.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Encode a snapshot
pub fn serialize(state: &ClusterState) -> Result<Vec<u8>> {
    let version = i64::try_from(state.version())
        .map_err(|_| Error::format(format!("version {} does not fit in i64", state.version())))?;

    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&version.to_le_bytes());

    let envelope = MetadataEnvelope {
        cluster_name: state.cluster_name().to_string(),
        state_uuid: state.state_uuid(),
        metadata: state.metadata().clone(),
    };
    encode_block(&mut out, "metadata", &envelope)?;
    encode_block(&mut out, "routing", state.routing_table())?;
    encode_block(&mut out, "nodes", state.nodes())?;

    let crc = crc32c::crc32c(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Bounds-checked cursor over the input
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::format(format!(
                    "truncated cluster state: {what} needs {n} bytes at offset {}, {} available",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn block(&mut self, what: &str) -> Result<&'a [u8]> {
        let len = self.u32(what)? as usize;
        self.take(len, what)
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn decode_block<T: DeserializeOwned>(body: &[u8], what: &str) -> Result<T> {
    bincode_options()
        .with_limit(body.len() as u64)
        .deserialize(body)
        .map_err(|e| Error::format(format!("invalid {what} block: {e}")))
}

/// Decode a snapshot; any defect fails the whole decode
pub fn deserialize(bytes: &[u8]) -> Result<ClusterState> {
    if bytes.len() < HEADER_SIZE + 3 * LEN_SIZE + CRC_SIZE {
        return Err(Error::format(format!(
            "truncated cluster state: {} bytes",
            bytes.len()
        )));
    }

    let mut reader = Reader::new(bytes);
    let magic = reader.u32("magic")?;
    if magic != MAGIC {
        return Err(Error::format(format!(
            "bad cluster state magic {magic:#010x}"
        )));
    }
    let format_version = reader.take(1, "format version")?[0];
    if format_version != FORMAT_VERSION {
        return Err(Error::format(format!(
            "unknown cluster state format version {format_version}"
        )));
    }
    let version_bytes = reader.take(8, "version")?;
    let version = i64::from_le_bytes(
        version_bytes
            .try_into()
            .map_err(|_| Error::internal("version slice length"))?,
    );
    let version = u64::try_from(version)
        .map_err(|_| Error::format(format!("negative cluster state version {version}")))?;

    let metadata_body = reader.block("metadata block")?;
    let routing_body = reader.block("routing block")?;
    let nodes_body = reader.block("nodes block")?;

    let covered = reader.pos;
    let stored_crc = reader.u32("checksum")?;
    if reader.remaining() != 0 {
        return Err(Error::format(format!(
            "{} trailing bytes after cluster state",
            reader.remaining()
        )));
    }
    let computed_crc = crc32c::crc32c(&bytes[..covered]);
    if stored_crc != computed_crc {
        return Err(Error::format(format!(
            "cluster state checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let envelope: MetadataEnvelope = decode_block(metadata_body, "metadata")?;
    let routing_table: RoutingTable = decode_block(routing_body, "routing")?;
    let nodes: DiscoveryNodes = decode_block(nodes_body, "nodes")?;

    Ok(ClusterState::with_uuid(
        envelope.cluster_name,
        version,
        envelope.state_uuid,
        envelope.metadata,
        routing_table,
        nodes,
    ))
}
