//! Norms accumulation and the norms file
//!
//! During indexing every worker owns a `PerThreadNorms` and appends
//! `(doc_id, norm)` pairs per field in increasing doc order. At flush the
//! runs of all workers are merged per field:
//!
//! ```text
//! worker 0:  doc 0 → a   doc 4 → c
//! worker 1:  doc 2 → b
//! max_doc 6: [a, D, b, D, c, D]        D = DEFAULT_NORM
//! ```
//!
//! # File Format
//! ```text
//! magic "NRM\xFF"                              4B
//! per normed field (field-number order):
//!   norms                                      max_doc × 1B
//! ```
//! There are no inline lengths; readers need `max_doc` and the field infos.

use crate::field::FieldInfos;
use crate::norms::DEFAULT_NORM;
use quarry_common::{DocId, Error, Result};
use quarry_store::{Directory, IndexOutput, read_file};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{debug, error, warn};

/// Magic bytes for .nrm files
pub const NORMS_MAGIC: &[u8; 4] = b"NRM\xFF";
/// Header size in bytes
pub const NORMS_HEADER_SIZE: u64 = 4;
/// Norms file extension
pub const NORMS_EXTENSION: &str = "nrm";

/// Norms one worker recorded for one field
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormsAccumulator {
    doc_ids: Vec<DocId>,
    norms: Vec<u8>,
}

impl NormsAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a norm; doc ids must strictly increase
    pub fn add(&mut self, doc_id: DocId, norm: u8) -> Result<()> {
        if let Some(&last) = self.doc_ids.last()
            && doc_id <= last
        {
            return Err(Error::invariant(format!(
                "norms out of order: doc {doc_id} after doc {last}"
            )));
        }
        self.doc_ids.push(doc_id);
        self.norms.push(norm);
        Ok(())
    }

    pub fn doc_ids(&self) -> &[DocId] {
        &self.doc_ids
    }

    pub fn norms(&self) -> &[u8] {
        &self.norms
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }
}

/// All norms one worker recorded, keyed by field number
#[derive(Clone, Debug, Default)]
pub struct PerThreadNorms {
    fields: BTreeMap<u32, NormsAccumulator>,
}

impl PerThreadNorms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field_number: u32, doc_id: DocId, norm: u8) -> Result<()> {
        self.fields.entry(field_number).or_default().add(doc_id, norm)
    }

    pub fn field(&self, field_number: u32) -> Option<&NormsAccumulator> {
        self.fields.get(&field_number)
    }

    /// Field numbers with at least one norm
    pub fn field_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(NormsAccumulator::is_empty)
    }

    /// Drop everything after a flush
    pub fn reset(&mut self) {
        self.fields.clear();
    }
}

/// Summary of a written norms file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormsFileInfo {
    pub file_name: String,
    pub max_doc: u32,
    /// Normed fields in file order
    pub fields: Vec<String>,
    pub bytes: u64,
}

/// Merges per-thread norms into a norms file
pub struct NormsWriter;

impl NormsWriter {
    /// Merge the runs of one field into exactly `max_doc` bytes
    ///
    /// Always advances the run with the smallest pending doc id; gaps and
    /// the tail are filled with `DEFAULT_NORM`. Returns the bytes written.
    pub fn merge_field<W: Write + ?Sized>(
        runs: &[&NormsAccumulator],
        max_doc: u32,
        out: &mut W,
    ) -> Result<u64> {
        let mut merged = Vec::with_capacity(max_doc as usize);
        let mut cursors = vec![0usize; runs.len()];
        let mut upto: DocId = 0;

        loop {
            let mut min: Option<(usize, DocId)> = None;
            for (run, cursor) in cursors.iter().enumerate() {
                if let Some(&doc) = runs[run].doc_ids.get(*cursor)
                    && min.is_none_or(|(_, best)| doc < best)
                {
                    min = Some((run, doc));
                }
            }
            let Some((run, doc)) = min else { break };

            if doc >= max_doc {
                return Err(Error::invariant(format!(
                    "norm for doc {doc} beyond max_doc {max_doc}"
                )));
            }
            if doc < upto {
                return Err(Error::invariant(format!("duplicate norm for doc {doc}")));
            }
            merged.resize(doc as usize, DEFAULT_NORM);
            merged.push(runs[run].norms[cursors[run]]);
            cursors[run] += 1;
            upto = doc + 1;
        }

        merged.resize(max_doc as usize, DEFAULT_NORM);
        out.write_all(&merged)?;
        Ok(merged.len() as u64)
    }

    /// Write `<segment>.nrm` from the workers' accumulators
    ///
    /// On any failure the partial file is deleted and nothing is left behind.
    pub fn flush(
        per_thread: &[&PerThreadNorms],
        field_infos: &FieldInfos,
        max_doc: u32,
        directory: &dyn Directory,
        segment: &str,
    ) -> Result<NormsFileInfo> {
        let file_name = format!("{segment}.{NORMS_EXTENSION}");
        let mut out = directory.create_output(&file_name)?;

        let result = Self::write_fields(per_thread, field_infos, max_doc, out.as_mut());
        let result = match result {
            Ok(fields) => {
                let bytes = out.bytes_written();
                out.finish().map(|()| NormsFileInfo {
                    file_name: file_name.clone(),
                    max_doc,
                    fields,
                    bytes,
                })
            }
            Err(e) => {
                drop(out);
                Err(e)
            }
        };

        match result {
            Ok(info) => {
                debug!(
                    "flushed {} ({} fields, max_doc {}, {} bytes)",
                    info.file_name,
                    info.fields.len(),
                    max_doc,
                    info.bytes
                );
                Ok(info)
            }
            Err(e) => {
                error!("norms flush for segment {} failed: {}", segment, e);
                if let Err(del) = directory.delete_file(&file_name) {
                    warn!("failed to delete partial {}: {}", file_name, del);
                }
                Err(e)
            }
        }
    }

    fn write_fields(
        per_thread: &[&PerThreadNorms],
        field_infos: &FieldInfos,
        max_doc: u32,
        out: &mut dyn IndexOutput,
    ) -> Result<Vec<String>> {
        for number in per_thread.iter().flat_map(|t| t.field_numbers()) {
            if !field_infos.by_number(number).is_some_and(|f| f.has_norms()) {
                return Err(Error::invariant(format!(
                    "norms recorded for field {number} which has no norms"
                )));
            }
        }

        out.write_all(NORMS_MAGIC)?;
        let mut fields = Vec::new();
        for info in field_infos.normed() {
            let runs: Vec<&NormsAccumulator> = per_thread
                .iter()
                .filter_map(|t| t.field(info.number))
                .collect();
            Self::merge_field(&runs, max_doc, &mut *out)?;
            fields.push(info.name.clone());
            check_field_bytes(&info.name, out.bytes_written(), fields.len() as u64, max_doc)?;
        }
        Ok(fields)
    }
}

/// One byte per document for every field written so far
fn check_field_bytes(field: &str, written: u64, norm_count: u64, max_doc: u32) -> Result<()> {
    let expected = NORMS_HEADER_SIZE + norm_count * u64::from(max_doc);
    if written != expected {
        return Err(Error::invariant(format!(
            "norms for field {field}: {written} bytes written, expected {expected} \
             ({norm_count} fields × {max_doc} docs + header)"
        )));
    }
    Ok(())
}

/// Reads a norms file back
#[derive(Debug)]
pub struct NormsReader {
    max_doc: u32,
    fields: Vec<String>,
    data: Vec<u8>,
}

impl NormsReader {
    /// Open `<segment>.nrm`, validating the magic and total length
    pub fn open(
        directory: &dyn Directory,
        segment: &str,
        field_infos: &FieldInfos,
        max_doc: u32,
    ) -> Result<Self> {
        let file_name = format!("{segment}.{NORMS_EXTENSION}");
        let data = read_file(directory, &file_name)?;
        let fields: Vec<String> = field_infos.normed().map(|f| f.name.clone()).collect();

        if data.len() < NORMS_MAGIC.len() || &data[..NORMS_MAGIC.len()] != NORMS_MAGIC {
            return Err(Error::format(format!("{file_name}: bad norms header")));
        }
        let expected = NORMS_HEADER_SIZE + fields.len() as u64 * u64::from(max_doc);
        if data.len() as u64 != expected {
            return Err(Error::format(format!(
                "{file_name}: {} bytes, expected {expected} for {} fields × {max_doc} docs",
                data.len(),
                fields.len()
            )));
        }
        Ok(Self {
            max_doc,
            fields,
            data,
        })
    }

    pub const fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Norm bytes of a field, one per document
    pub fn norms(&self, field: &str) -> Option<&[u8]> {
        let position = self.fields.iter().position(|f| f == field)?;
        let start = NORMS_HEADER_SIZE as usize + position * self.max_doc as usize;
        Some(&self.data[start..start + self.max_doc as usize])
    }
}
