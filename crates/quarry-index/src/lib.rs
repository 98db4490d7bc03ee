//! Quarry Index - per-shard segment files
//!
//! Indexing workers turn entities into `Document`s. For every document a
//! worker records one norm byte per indexed field into its own
//! `PerThreadNorms`. At flush time the per-thread runs are merged into a
//! single norms file with exactly one byte per document per field, next to a
//! small segment info file describing the segment.
//!
//! # Files
//! ```text
//! <segment>.si    SegmentMeta (bincode body + crc32c)
//! <segment>.nrm   "NRM\xFF" + max_doc bytes per normed field, field-number order
//! ```

pub mod document;
pub mod field;
pub mod norms;
pub mod norms_writer;
pub mod segment;

pub use document::{Document, Field};
pub use field::{FieldInfo, FieldInfos};
pub use norms::{DEFAULT_NORM, decode_norm, encode_norm, length_norm};
pub use norms_writer::{
    NormsAccumulator, NormsFileInfo, NormsReader, NormsWriter, PerThreadNorms,
};
pub use segment::SegmentMeta;
