//! `.kix` — k-mer-to-sequence-id posting index.
//!
//! 64-byte header, `4^k` x u64 offset table, `4^k` x u32 counts table, then
//! a payload of per-k-mer varint-delta-compressed ordinal runs. Grounded on
//! `KixWriter`/`KixReader` and `kix_format.hpp` (`#pragma pack(push,1)`
//! layout) in the original implementation.

use crate::error::{IndexError, Result};
use crate::format::{KIX_FORMAT_VERSION, KIX_MAGIC};
use crate::kmer::{kmer_type_for_k, table_size, validate_k};
use crate::varint;
use memmap2::{Advice, Mmap};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

pub const HEADER_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct KixHeader {
    pub format_version: u16,
    pub k: u8,
    pub kmer_type: u8,
    pub num_sequences: u32,
    pub total_postings: u64,
    pub flags: u32,
    pub volume_index: u16,
    pub total_volumes: u16,
    pub db_name: String,
}

pub(crate) fn pack_header(h: &KixHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&KIX_MAGIC);
    buf[4..6].copy_from_slice(&h.format_version.to_le_bytes());
    buf[6] = h.k;
    buf[7] = h.kmer_type;
    buf[8..12].copy_from_slice(&h.num_sequences.to_le_bytes());
    buf[12..20].copy_from_slice(&h.total_postings.to_le_bytes());
    buf[20..24].copy_from_slice(&h.flags.to_le_bytes());
    buf[24..26].copy_from_slice(&h.volume_index.to_le_bytes());
    buf[26..28].copy_from_slice(&h.total_volumes.to_le_bytes());
    let name_bytes = h.db_name.as_bytes();
    let name_len = name_bytes.len().min(32);
    buf[28..30].copy_from_slice(&(name_len as u16).to_le_bytes());
    // bytes 30..32 reserved, left zero
    buf[32..32 + name_len].copy_from_slice(&name_bytes[..name_len]);
    buf
}

fn unpack_header(buf: &[u8]) -> Result<KixHeader> {
    if buf.len() < HEADER_LEN {
        return Err(IndexError::MalformedHeader {
            file: "kix",
            reason: "file too small for header".into(),
        });
    }
    if buf[0..4] != KIX_MAGIC {
        return Err(IndexError::MalformedHeader {
            file: "kix",
            reason: "bad magic".into(),
        });
    }
    let format_version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if format_version != KIX_FORMAT_VERSION {
        return Err(IndexError::MalformedHeader {
            file: "kix",
            reason: format!("unsupported format version {format_version}"),
        });
    }
    let db_name_len = u16::from_le_bytes(buf[28..30].try_into().unwrap()) as usize;
    let db_name_len = db_name_len.min(32);
    let db_name = String::from_utf8_lossy(&buf[32..32 + db_name_len]).into_owned();
    Ok(KixHeader {
        format_version,
        k: buf[6],
        kmer_type: buf[7],
        num_sequences: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        total_postings: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        flags: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        volume_index: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
        total_volumes: u16::from_le_bytes(buf[26..28].try_into().unwrap()),
        db_name,
    })
}

/// Writes a `.kix` file using post-hoc offset construction: header and
/// tables are reserved up front, posting payloads are streamed out k-mer by
/// k-mer (callers must supply k-mers in ascending order), then the offset
/// table is seeked back and rewritten once all payloads are known.
pub struct KixWriter {
    file: BufWriter<File>,
    k: u8,
    tbl_size: u64,
    offsets: Vec<u64>,
    total_postings: u64,
    data_pos: u64,
    pub num_sequences: u32,
    pub volume_index: u16,
    pub total_volumes: u16,
    pub db_name: String,
}

impl KixWriter {
    pub fn create(path: &Path, k: u8, counts: &[u32]) -> Result<Self> {
        validate_k(k)?;
        let tbl_size = table_size(k);
        if counts.len() as u64 != tbl_size {
            return Err(IndexError::InvalidConfig(format!(
                "counts table length {} does not match 4^k = {}",
                counts.len(),
                tbl_size
            )));
        }

        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&[0u8; HEADER_LEN])?;
        for _ in 0..tbl_size {
            file.write_all(&0u64.to_le_bytes())?;
        }
        for &c in counts {
            file.write_all(&c.to_le_bytes())?;
        }

        Ok(KixWriter {
            file,
            k,
            tbl_size,
            offsets: vec![0; tbl_size as usize],
            total_postings: 0,
            data_pos: 0,
            num_sequences: 0,
            volume_index: 0,
            total_volumes: 1,
            db_name: String::new(),
        })
    }

    /// Record the posting list for `kmer_value` (ordinals already sorted).
    /// Must be called in ascending `kmer_value` order; `kmer_value`s with an
    /// empty `ordinals` slice may be skipped entirely (their offset/count
    /// stay 0).
    pub fn write_posting_list(&mut self, kmer_value: u64, ordinals: &[u32]) -> Result<()> {
        self.offsets[kmer_value as usize] = self.data_pos;
        if ordinals.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(ordinals.len() * 2);
        let mut prev = 0u32;
        for (i, &id) in ordinals.iter().enumerate() {
            let val = if i == 0 { id } else { id - prev };
            varint::encode_to(val, &mut buf);
            prev = id;
        }
        self.file.write_all(&buf)?;
        self.data_pos += buf.len() as u64;
        self.total_postings += ordinals.len() as u64;
        Ok(())
    }

    pub fn finalize(mut self, db_name: &str) -> Result<()> {
        let header = KixHeader {
            format_version: KIX_FORMAT_VERSION,
            k: self.k,
            kmer_type: kmer_type_for_k(self.k),
            num_sequences: self.num_sequences,
            total_postings: self.total_postings,
            flags: crate::format::KIX_FLAG_HAS_KSX,
            volume_index: self.volume_index,
            total_volumes: self.total_volumes,
            db_name: db_name.to_string(),
        };
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&pack_header(&header))?;
        for &off in &self.offsets {
            self.file.write_all(&off.to_le_bytes())?;
        }
        self.file.flush()?;
        Ok(())
    }

    pub fn tbl_size(&self) -> u64 {
        self.tbl_size
    }
}

/// Memory-mapped, read-only view over a `.kix` file.
pub struct KixReader {
    mmap: Mmap,
    header: KixHeader,
    tbl_size: u64,
}

impl KixReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < HEADER_LEN {
            return Err(IndexError::MalformedHeader {
                file: "kix",
                reason: "file too small for header".into(),
            });
        }
        let header = unpack_header(&mmap)?;
        let tbl_size = table_size(header.k);
        let min_len = HEADER_LEN + (tbl_size as usize) * 12;
        if mmap.len() < min_len {
            return Err(IndexError::MalformedHeader {
                file: "kix",
                reason: "file too small for offset/count tables".into(),
            });
        }
        let _ = mmap.advise(Advice::Random);
        Ok(KixReader {
            mmap,
            header,
            tbl_size,
        })
    }

    pub fn header(&self) -> &KixHeader {
        &self.header
    }

    pub fn k(&self) -> u8 {
        self.header.k
    }

    pub fn tbl_size(&self) -> u64 {
        self.tbl_size
    }

    fn offsets_start(&self) -> usize {
        HEADER_LEN
    }

    fn counts_start(&self) -> usize {
        HEADER_LEN + (self.tbl_size as usize) * 8
    }

    pub fn payload_start(&self) -> usize {
        self.counts_start() + (self.tbl_size as usize) * 4
    }

    /// Byte offset into the payload where `kmer`'s posting run begins.
    pub fn offset_at(&self, kmer: u64) -> u64 {
        let off = self.offsets_start() + (kmer as usize) * 8;
        u64::from_le_bytes(self.mmap[off..off + 8].try_into().unwrap())
    }

    /// Number of postings stored for `kmer`.
    pub fn count_at(&self, kmer: u64) -> u32 {
        let off = self.counts_start() + (kmer as usize) * 4;
        u32::from_le_bytes(self.mmap[off..off + 4].try_into().unwrap())
    }

    pub fn payload(&self) -> &[u8] {
        &self.mmap[self.payload_start()..]
    }

    /// Decode the ordinal list stored for `kmer` into `out` (appended).
    pub fn decode_ordinals(&self, kmer: u64, out: &mut Vec<u32>) {
        let count = self.count_at(kmer);
        if count == 0 {
            return;
        }
        let start = self.payload_start() + self.offset_at(kmer) as usize;
        let mut pos = start;
        let mut prev = 0u32;
        for i in 0..count {
            let (delta, n) = varint::decode(&self.mmap[pos..]);
            pos += n;
            let id = if i == 0 { delta } else { prev + delta };
            prev = id;
            out.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trip_preserves_header_and_postings() {
        let k = 5u8;
        let tbl_size = table_size(k) as usize;
        let mut counts = vec![0u32; tbl_size];
        counts[7] = 3;
        counts[9] = 2;

        let tmp = NamedTempFile::new().unwrap();
        let mut writer = KixWriter::create(tmp.path(), k, &counts).unwrap();
        writer.num_sequences = 10;
        writer.volume_index = 0;
        writer.total_volumes = 1;
        writer.write_posting_list(7, &[0, 1, 5]).unwrap();
        writer.write_posting_list(9, &[2, 2]).unwrap();
        writer.finalize("testdb").unwrap();

        let reader = KixReader::open(tmp.path()).unwrap();
        assert_eq!(reader.k(), k);
        assert_eq!(reader.header().num_sequences, 10);
        assert_eq!(reader.header().db_name, "testdb");
        assert_eq!(reader.header().total_postings, 5);
        assert_eq!(reader.count_at(7), 3);
        assert_eq!(reader.count_at(9), 2);
        assert_eq!(reader.count_at(0), 0);

        let mut v7 = Vec::new();
        reader.decode_ordinals(7, &mut v7);
        assert_eq!(v7, vec![0, 1, 5]);

        let mut v9 = Vec::new();
        reader.decode_ordinals(9, &mut v9);
        assert_eq!(v9, vec![2, 2]);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), [0u8; HEADER_LEN]).unwrap();
        assert!(KixReader::open(tmp.path()).is_err());
    }
}
