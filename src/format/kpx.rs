//! `.kpx` — k-mer-to-position posting index, sibling of a `.kix` volume.
//!
//! 32-byte header, `4^k` x u64 offset table, then a payload of per-k-mer
//! varint-encoded positions: raw when the ordinal changed since the
//! previous posting in the run (or for the first posting), delta from the
//! previous position otherwise. Counts are not stored here; a reader always
//! consults the sibling `.kix` count table to know how many varints to pull
//! out of a given k-mer's run.

use crate::error::{IndexError, Result};
use crate::format::{KPX_FORMAT_VERSION, KPX_MAGIC};
use crate::kmer::{table_size, validate_k};
use crate::varint;
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct KpxHeader {
    pub format_version: u16,
    pub k: u8,
    pub total_postings: u64,
}

pub(crate) fn pack_header(h: &KpxHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&KPX_MAGIC);
    buf[4..6].copy_from_slice(&h.format_version.to_le_bytes());
    buf[6] = h.k;
    // byte 7 reserved
    buf[8..16].copy_from_slice(&h.total_postings.to_le_bytes());
    // bytes 16..32 reserved
    buf
}

fn unpack_header(buf: &[u8]) -> Result<KpxHeader> {
    if buf.len() < HEADER_LEN {
        return Err(IndexError::MalformedHeader {
            file: "kpx",
            reason: "file too small for header".into(),
        });
    }
    if buf[0..4] != KPX_MAGIC {
        return Err(IndexError::MalformedHeader {
            file: "kpx",
            reason: "bad magic".into(),
        });
    }
    let format_version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if format_version != KPX_FORMAT_VERSION {
        return Err(IndexError::MalformedHeader {
            file: "kpx",
            reason: format!("unsupported format version {format_version}"),
        });
    }
    Ok(KpxHeader {
        format_version,
        k: buf[6],
        total_postings: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
    })
}

/// Writes a `.kpx` file; same post-hoc offset construction as [`super::kix::KixWriter`].
pub struct KpxWriter {
    file: BufWriter<File>,
    k: u8,
    offsets: Vec<u64>,
    total_postings: u64,
    data_pos: u64,
}

impl KpxWriter {
    pub fn create(path: &Path, k: u8) -> Result<Self> {
        validate_k(k)?;
        let tbl_size = table_size(k);
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&[0u8; HEADER_LEN])?;
        for _ in 0..tbl_size {
            file.write_all(&0u64.to_le_bytes())?;
        }
        Ok(KpxWriter {
            file,
            k,
            offsets: vec![0; tbl_size as usize],
            total_postings: 0,
            data_pos: 0,
        })
    }

    /// Record the position run for `kmer_value`. `positions` and `ordinals`
    /// must be parallel, already sorted by (ordinal, position).
    pub fn write_position_list(
        &mut self,
        kmer_value: u64,
        ordinals: &[u32],
        positions: &[u32],
    ) -> Result<()> {
        debug_assert_eq!(ordinals.len(), positions.len());
        self.offsets[kmer_value as usize] = self.data_pos;
        if positions.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(positions.len() * 2);
        let mut prev_ordinal = ordinals[0];
        let mut prev_pos = 0u32;
        for i in 0..positions.len() {
            let val = if i == 0 || ordinals[i] != prev_ordinal {
                positions[i]
            } else {
                positions[i] - prev_pos
            };
            varint::encode_to(val, &mut buf);
            prev_ordinal = ordinals[i];
            prev_pos = positions[i];
        }
        self.file.write_all(&buf)?;
        self.data_pos += buf.len() as u64;
        self.total_postings += positions.len() as u64;
        Ok(())
    }

    pub fn finalize(mut self) -> Result<()> {
        let header = KpxHeader {
            format_version: KPX_FORMAT_VERSION,
            k: self.k,
            total_postings: self.total_postings,
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&pack_header(&header))?;
        for &off in &self.offsets {
            self.file.write_all(&off.to_le_bytes())?;
        }
        self.file.flush()?;
        Ok(())
    }
}

/// Memory-mapped, read-only view over a `.kpx` file.
pub struct KpxReader {
    mmap: Mmap,
    header: KpxHeader,
    tbl_size: u64,
}

impl KpxReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(IndexError::MalformedHeader {
                file: "kpx",
                reason: "file too small for header".into(),
            });
        }
        let header = unpack_header(&mmap)?;
        let tbl_size = table_size(header.k);
        let min_len = HEADER_LEN + (tbl_size as usize) * 8;
        if mmap.len() < min_len {
            return Err(IndexError::MalformedHeader {
                file: "kpx",
                reason: "file too small for offset table".into(),
            });
        }
        let _ = mmap.advise(Advice::Random);
        Ok(KpxReader {
            mmap,
            header,
            tbl_size,
        })
    }

    pub fn header(&self) -> &KpxHeader {
        &self.header
    }

    pub fn payload_start(&self) -> usize {
        HEADER_LEN + (self.tbl_size as usize) * 8
    }

    pub fn offset_at(&self, kmer: u64) -> u64 {
        let off = HEADER_LEN + (kmer as usize) * 8;
        u64::from_le_bytes(self.mmap[off..off + 8].try_into().unwrap())
    }

    pub fn payload(&self) -> &[u8] {
        &self.mmap[self.payload_start()..]
    }

    /// Decode `count` positions for `kmer`, given the corresponding
    /// ordinals from the sibling `.kix` run (needed to know where delta
    /// resets occur).
    pub fn decode_positions(&self, kmer: u64, ordinals: &[u32], out: &mut Vec<u32>) {
        if ordinals.is_empty() {
            return;
        }
        let start = self.payload_start() + self.offset_at(kmer) as usize;
        let mut pos = start;
        let mut prev_ordinal = ordinals[0];
        let mut prev_pos = 0u32;
        for (i, &ord) in ordinals.iter().enumerate() {
            let (val, n) = varint::decode(&self.mmap[pos..]);
            pos += n;
            let p = if i == 0 || ord != prev_ordinal {
                val
            } else {
                prev_pos + val
            };
            prev_ordinal = ord;
            prev_pos = p;
            out.push(p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trip_resets_delta_at_sequence_boundary() {
        let k = 5u8;
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = KpxWriter::create(tmp.path(), k).unwrap();
        // ordinals: 0,0,1 ; positions: 10,15,3 -- delta resets before the 1
        writer
            .write_position_list(42, &[0, 0, 1], &[10, 15, 3])
            .unwrap();
        writer.finalize().unwrap();

        let reader = KpxReader::open(tmp.path()).unwrap();
        assert_eq!(reader.header().total_postings, 3);
        let mut out = Vec::new();
        reader.decode_positions(42, &[0, 0, 1], &mut out);
        assert_eq!(out, vec![10, 15, 3]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), [0u8; HEADER_LEN]).unwrap();
        assert!(KpxReader::open(tmp.path()).is_err());
    }
}
