//! `.ksx` — per-volume sequence metadata sidecar.
//!
//! Writer-defined layout; the only cross-component contract is ordinal
//! ordering and atomic rename on success. This writer uses: record count
//! (u32), then per sequence in ordinal order, length (u32) followed by a
//! length-prefixed (u16) ASCII accession.

use crate::error::{IndexError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub length: u32,
    pub accession: String,
}

pub struct KsxWriter {
    file: BufWriter<File>,
    records: Vec<SequenceRecord>,
}

impl KsxWriter {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(KsxWriter {
            file: BufWriter::new(File::create(path)?),
            records: Vec::new(),
        })
    }

    /// Append the next sequence's metadata (must be called in ordinal order).
    pub fn push(&mut self, length: u32, accession: &str) {
        self.records.push(SequenceRecord {
            length,
            accession: accession.to_string(),
        });
    }

    pub fn finalize(mut self) -> Result<()> {
        self.file
            .write_all(&(self.records.len() as u32).to_le_bytes())?;
        for rec in &self.records {
            self.file.write_all(&rec.length.to_le_bytes())?;
            let acc_bytes = rec.accession.as_bytes();
            if acc_bytes.len() > u16::MAX as usize {
                return Err(IndexError::InvalidConfig(format!(
                    "accession '{}' exceeds maximum length",
                    rec.accession
                )));
            }
            self.file
                .write_all(&(acc_bytes.len() as u16).to_le_bytes())?;
            self.file.write_all(acc_bytes)?;
        }
        self.file.flush()?;
        Ok(())
    }
}

pub fn read_ksx(path: &Path) -> Result<Vec<SequenceRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf)?;
    let count = u32::from_le_bytes(count_buf) as usize;

    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf)?;
        let length = u32::from_le_bytes(length_buf);

        let mut acc_len_buf = [0u8; 2];
        reader.read_exact(&mut acc_len_buf)?;
        let acc_len = u16::from_le_bytes(acc_len_buf) as usize;

        let mut acc_buf = vec![0u8; acc_len];
        reader.read_exact(&mut acc_buf)?;
        let accession = String::from_utf8(acc_buf).map_err(|_| IndexError::MalformedHeader {
            file: "ksx",
            reason: "accession is not valid UTF-8".into(),
        })?;

        records.push(SequenceRecord { length, accession });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trip_preserves_ordinal_order() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = KsxWriter::create(tmp.path()).unwrap();
        writer.push(100, "chr1");
        writer.push(250, "chr2_alt");
        writer.push(0, "");
        writer.finalize().unwrap();

        let records = read_ksx(tmp.path()).unwrap();
        assert_eq!(
            records,
            vec![
                SequenceRecord {
                    length: 100,
                    accession: "chr1".into()
                },
                SequenceRecord {
                    length: 250,
                    accession: "chr2_alt".into()
                },
                SequenceRecord {
                    length: 0,
                    accession: "".into()
                },
            ]
        );
    }

    #[test]
    fn empty_sidecar_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        KsxWriter::create(tmp.path()).unwrap().finalize().unwrap();
        assert!(read_ksx(tmp.path()).unwrap().is_empty());
    }
}
