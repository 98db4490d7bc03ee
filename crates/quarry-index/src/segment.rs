//! Segment info file
//!
//! Record format:
//! ```text
//! +--------+--------+------+--------+
//! | Magic  | Length | Data | CRC32C |
//! | 4B     | 4B     | var  | 4B     |
//! +--------+--------+------+--------+
//! ```
//! `Data` is the bincode encoding of `SegmentMeta`.

use crate::field::{FieldInfo, FieldInfos};
use bincode::Options;
use quarry_common::{Error, Result};
use quarry_store::{Directory, read_file, write_file};
use serde::{Deserialize, Serialize};

/// Segment info magic number
const SEGMENT_MAGIC: u32 = 0x5153_4749; // "QSGI"

/// Header size (magic + length)
const HEADER_SIZE: usize = 8;

/// Segment info file extension
pub const SEGMENT_INFO_EXTENSION: &str = "si";

/// Description of one flushed segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub name: String,
    pub max_doc: u32,
    /// Field infos in field-number order
    pub fields: Vec<FieldInfo>,
    /// Files that belong to the segment, the info file excluded
    pub files: Vec<String>,
}

impl SegmentMeta {
    pub fn new(name: impl Into<String>, max_doc: u32, field_infos: &FieldInfos) -> Self {
        Self {
            name: name.into(),
            max_doc,
            fields: field_infos.to_vec(),
            files: Vec::new(),
        }
    }

    pub fn file_name(segment: &str) -> String {
        format!("{segment}.{SEGMENT_INFO_EXTENSION}")
    }

    /// Field infos rebuilt from the stored list
    pub fn field_infos(&self) -> Result<FieldInfos> {
        FieldInfos::from_infos(self.fields.clone())
    }

    fn options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .reject_trailing_bytes()
    }

    /// Serialize into a framed record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = Self::options().serialize(self)?;
        let len = u32::try_from(data.len())
            .map_err(|_| Error::format(format!("segment info too large: {} bytes", data.len())))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + data.len() + 4);
        buf.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse a framed record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(Error::format("segment info too small"));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != SEGMENT_MAGIC {
            return Err(Error::format(format!("bad segment info magic {magic:#010x}")));
        }
        let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() != HEADER_SIZE + len + 4 {
            return Err(Error::format(format!(
                "segment info length mismatch: header says {len}, file has {}",
                data.len().saturating_sub(HEADER_SIZE + 4)
            )));
        }

        let body_end = HEADER_SIZE + len;
        let stored_crc = u32::from_le_bytes([
            data[body_end],
            data[body_end + 1],
            data[body_end + 2],
            data[body_end + 3],
        ]);
        let computed_crc = crc32c::crc32c(&data[..body_end]);
        if computed_crc != stored_crc {
            return Err(Error::format("segment info CRC mismatch"));
        }

        Self::options()
            .deserialize(&data[HEADER_SIZE..body_end])
            .map_err(|e| Error::format(format!("invalid segment info: {e}")))
    }

    /// Write `<name>.si`
    pub fn write(&self, directory: &dyn Directory) -> Result<()> {
        write_file(directory, &Self::file_name(&self.name), &self.to_bytes()?)
    }

    /// Read `<segment>.si`
    pub fn read(directory: &dyn Directory, segment: &str) -> Result<Self> {
        Self::from_bytes(&read_file(directory, &Self::file_name(segment))?)
    }

    /// Segment names with an info file in `directory`, sorted
    pub fn list(directory: &dyn Directory) -> Result<Vec<String>> {
        let suffix = format!(".{SEGMENT_INFO_EXTENSION}");
        Ok(directory
            .list_all()?
            .into_iter()
            .filter_map(|n| n.strip_suffix(&suffix).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::{FsAccess, FsDirectory, NativeFsLockFactory};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn meta() -> SegmentMeta {
        let mut infos = FieldInfos::new();
        infos.add("title", true, false);
        infos.add("id", true, true);
        let mut meta = SegmentMeta::new("_0", 12, &infos);
        meta.files.push("_0.nrm".into());
        meta
    }

    #[test]
    fn test_write_read_list() {
        let dir = tempdir().unwrap();
        let directory =
            FsDirectory::open(dir.path(), FsAccess::Mmap, Arc::new(NativeFsLockFactory)).unwrap();
        meta().write(&directory).unwrap();

        let read = SegmentMeta::read(&directory, "_0").unwrap();
        assert_eq!(read, meta());
        assert_eq!(read.field_infos().unwrap().by_name("id").unwrap().number, 1);
        assert_eq!(SegmentMeta::list(&directory).unwrap(), vec!["_0"]);
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = meta().to_bytes().unwrap();
        let last = bytes.len() - 6;
        bytes[last] ^= 0x55;
        assert!(matches!(SegmentMeta::from_bytes(&bytes), Err(Error::Format(_))));

        let bytes = meta().to_bytes().unwrap();
        assert!(SegmentMeta::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    }
}
