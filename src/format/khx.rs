//! `.khx` — shared cross-volume k-mer exclusion bitset.
//!
//! 32-byte header followed by `ceil(4^k / 8)` bytes; bit `v` lives at byte
//! `v / 8`, bit `v mod 8` (LSB first). A set bit means the k-mer is excluded
//! by the cross-volume frequency filter.

use crate::error::{IndexError, Result};
use crate::format::{KHX_FORMAT_VERSION, KHX_MAGIC};
use crate::kmer::table_size;
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct KhxHeader {
    pub format_version: u16,
    pub k: u8,
}

fn pack_header(h: &KhxHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&KHX_MAGIC);
    buf[4..6].copy_from_slice(&h.format_version.to_le_bytes());
    buf[6] = h.k;
    // bytes 7..32 reserved
    buf
}

fn unpack_header(buf: &[u8]) -> Result<KhxHeader> {
    if buf.len() < HEADER_LEN {
        return Err(IndexError::MalformedHeader {
            file: "khx",
            reason: "file too small for header".into(),
        });
    }
    if buf[0..4] != KHX_MAGIC {
        return Err(IndexError::MalformedHeader {
            file: "khx",
            reason: "bad magic".into(),
        });
    }
    let format_version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if format_version != KHX_FORMAT_VERSION {
        return Err(IndexError::MalformedHeader {
            file: "khx",
            reason: format!("unsupported format version {format_version}"),
        });
    }
    Ok(KhxHeader {
        format_version,
        k: buf[6],
    })
}

pub fn bitset_len_bytes(k: u8) -> usize {
    table_size(k).div_ceil(8) as usize
}

/// Write a complete exclusion bitset in one call; the filter already holds
/// the whole bitset in memory (bounded by `4^k / 8` bytes) before writing.
pub fn write_khx(path: &Path, k: u8, bitset: &[u8]) -> Result<()> {
    let expected_len = bitset_len_bytes(k);
    if bitset.len() != expected_len {
        return Err(IndexError::InvalidConfig(format!(
            "khx bitset length {} does not match expected ceil(4^k/8) = {}",
            bitset.len(),
            expected_len
        )));
    }
    let mut file = File::create(path)?;
    file.write_all(&pack_header(&KhxHeader {
        format_version: KHX_FORMAT_VERSION,
        k,
    }))?;
    file.write_all(bitset)?;
    Ok(())
}

/// Memory-mapped, read-only view over a `.khx` file.
pub struct KhxReader {
    mmap: Mmap,
    header: KhxHeader,
}

impl KhxReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = unpack_header(&mmap)?;
        let expected_len = HEADER_LEN + bitset_len_bytes(header.k);
        if mmap.len() < expected_len {
            return Err(IndexError::MalformedHeader {
                file: "khx",
                reason: "file too small for bitset".into(),
            });
        }
        let _ = mmap.advise(Advice::Random);
        Ok(KhxReader { mmap, header })
    }

    pub fn header(&self) -> &KhxHeader {
        &self.header
    }

    pub fn is_excluded(&self, kmer: u64) -> bool {
        let byte = HEADER_LEN + (kmer / 8) as usize;
        let bit = (kmer % 8) as u32;
        (self.mmap[byte] >> bit) & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trip_preserves_bits() {
        let k = 5u8;
        let len = bitset_len_bytes(k);
        let mut bitset = vec![0u8; len];
        bitset[0] |= 1 << 3; // kmer 3 excluded
        bitset[1] |= 1 << 0; // kmer 8 excluded

        let tmp = NamedTempFile::new().unwrap();
        write_khx(tmp.path(), k, &bitset).unwrap();

        let reader = KhxReader::open(tmp.path()).unwrap();
        assert_eq!(reader.header().k, k);
        assert!(reader.is_excluded(3));
        assert!(reader.is_excluded(8));
        assert!(!reader.is_excluded(4));
        assert!(!reader.is_excluded(0));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), [0u8; HEADER_LEN]).unwrap();
        assert!(KhxReader::open(tmp.path()).is_err());
    }
}
