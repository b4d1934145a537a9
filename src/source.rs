//! Sequence sources: the builder's only dependency on where sequences come
//! from. Grounded on `BlastDbReader`'s `RawSequence` borrow/return contract
//! (`original_source/src/io/blastdb_reader.cpp`), reshaped for Rust: a
//! `fetch` returns slices borrowed from `&self`, so the borrow checker
//! enforces the "release before the next fetch on this worker" rule for
//! free instead of needing an explicit `ret_raw_sequence` call.

use crate::ambig::AmbigEntry;

/// One sequence's packed bases, length, and pre-decoded ambiguity runs.
pub struct SequenceHandle<'a> {
    pub packed_bases: &'a [u8],
    pub seq_length: u32,
    pub ambig_entries: &'a [AmbigEntry],
}

/// A random-access, thread-safe collection of nucleotide sequences. Workers
/// fetch by ordinal (`oid`); the trait makes no guarantee about fetch order
/// and must tolerate concurrent calls from multiple threads.
pub trait SequenceSource: Sync {
    fn num_sequences(&self) -> u32;
    fn seq_length(&self, oid: u32) -> u32;
    fn accession(&self, oid: u32) -> &str;
    fn fetch(&self, oid: u32) -> SequenceHandle<'_>;
}

struct Entry {
    packed: Vec<u8>,
    length: u32,
    ambig: Vec<AmbigEntry>,
    accession: String,
}

/// A source that holds every sequence in memory, e.g. for tests and small
/// corpora. Mirrors the shape `BlastDbReader` is wrapped into at the
/// builder boundary, without the BLAST-specific ambiguity blob.
pub struct InMemorySource {
    entries: Vec<Entry>,
}

impl InMemorySource {
    pub fn new() -> Self {
        InMemorySource {
            entries: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        packed_bases: Vec<u8>,
        seq_length: u32,
        ambig_entries: Vec<AmbigEntry>,
        accession: impl Into<String>,
    ) {
        self.entries.push(Entry {
            packed: packed_bases,
            length: seq_length,
            ambig: ambig_entries,
            accession: accession.into(),
        });
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceSource for InMemorySource {
    fn num_sequences(&self) -> u32 {
        self.entries.len() as u32
    }

    fn seq_length(&self, oid: u32) -> u32 {
        self.entries[oid as usize].length
    }

    fn accession(&self, oid: u32) -> &str {
        &self.entries[oid as usize].accession
    }

    fn fetch(&self, oid: u32) -> SequenceHandle<'_> {
        let e = &self.entries[oid as usize];
        SequenceHandle {
            packed_bases: &e.packed,
            seq_length: e.length,
            ambig_entries: &e.ambig,
        }
    }
}

/// A source backed by a UCSC `.2bit` file, read eagerly into packed
/// base2 buffers at construction time via the `twobit` crate. `.2bit`'s
/// only ambiguity concept is the hard (`N`) mask block list, so every
/// `AmbigEntry` this source produces has `base4 == 0b1111` (N).
pub struct TwoBitFileSource {
    entries: Vec<Entry>,
}

const BASE_CODE_LUT: [u8; 256] = build_base_code_lut();

const fn build_base_code_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    lut[b'A' as usize] = 0;
    lut[b'a' as usize] = 0;
    lut[b'C' as usize] = 1;
    lut[b'c' as usize] = 1;
    lut[b'G' as usize] = 2;
    lut[b'g' as usize] = 2;
    lut[b'T' as usize] = 3;
    lut[b't' as usize] = 3;
    lut
}

impl TwoBitFileSource {
    pub fn open(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let mut tb = twobit::TwoBitFile::open(path)
            .map_err(|e| crate::error::IndexError::InvalidConfig(e.to_string()))?;
        let chrom_names = tb.chrom_names();

        let mut entries = Vec::with_capacity(chrom_names.len());
        for chr in &chrom_names {
            let seq = tb
                .read_sequence(chr, ..)
                .map_err(|e| crate::error::IndexError::InvalidConfig(e.to_string()))?;
            let length = seq.len() as u32;

            let codes = seq.bytes().map(|b| BASE_CODE_LUT[b as usize]);
            let packed = crate::packed::pack_bases(codes);

            let n_blocks = tb
                .hard_masked_blocks(chr, ..)
                .map_err(|e| crate::error::IndexError::InvalidConfig(e.to_string()))?;
            let ambig = n_blocks
                .into_iter()
                .map(|r| AmbigEntry {
                    position: r.start as u32,
                    run_length: (r.end - r.start) as u32,
                    base4: 0b1111,
                })
                .collect();

            entries.push(Entry {
                packed,
                length,
                ambig,
                accession: chr.clone(),
            });
        }

        Ok(TwoBitFileSource { entries })
    }
}

impl SequenceSource for TwoBitFileSource {
    fn num_sequences(&self) -> u32 {
        self.entries.len() as u32
    }

    fn seq_length(&self, oid: u32) -> u32 {
        self.entries[oid as usize].length
    }

    fn accession(&self, oid: u32) -> &str {
        &self.entries[oid as usize].accession
    }

    fn fetch(&self, oid: u32) -> SequenceHandle<'_> {
        let e = &self.entries[oid as usize];
        SequenceHandle {
            packed_bases: &e.packed,
            seq_length: e.length,
            ambig_entries: &e.ambig,
        }
    }
}
