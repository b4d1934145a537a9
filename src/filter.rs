//! Cross-volume frequency filter.
//!
//! Aggregates per-k-mer counts across every volume's `.kix.tmp`, determines
//! which k-mers exceed a global frequency threshold, rewrites each volume's
//! final `.kix`/`.kpx` with the excluded k-mers' postings dropped (the
//! surviving postings are copied byte-for-byte, not re-encoded), renames
//! each `.ksx.tmp` to `.ksx`, and emits the shared `.khx` exclusion bitset.
//! Grounded on `filter_volumes_cross_volume` in
//! `original_source/src/index/index_filter.cpp`; volumes are filtered in
//! parallel with rayon rather than the original's raw `tbb::parallel_for`.

use crate::error::Result;
use crate::format::khx::{bitset_len_bytes, write_khx};
use crate::format::kix::{self, KixHeader, KixReader};
use crate::format::kpx::{self, KpxHeader, KpxReader};
use crate::format::{KIX_FORMAT_VERSION, KPX_FORMAT_VERSION};
use crate::kmer::{kmer_type_for_k, table_size, validate_k};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

fn with_ext(prefix: &Path, ext: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(ext);
    PathBuf::from(s)
}

/// Per-k-mer posting byte length: the gap between a present k-mer's offset
/// and the next present k-mer's offset, or the payload's end for the last
/// present k-mer. K-mers with count 0 get size 0.
fn compute_posting_sizes(
    offset_at: impl Fn(u64) -> u64,
    counts: &[u32],
    tbl_size: u64,
    total_data_size: u64,
) -> Vec<u64> {
    let mut sizes = vec![0u64; tbl_size as usize];
    let mut prev_kmer: Option<u64> = None;
    let mut prev_offset = 0u64;
    for i in 0..tbl_size {
        if counts[i as usize] > 0 {
            if let Some(pk) = prev_kmer {
                sizes[pk as usize] = offset_at(i) - prev_offset;
            }
            prev_kmer = Some(i);
            prev_offset = offset_at(i);
        }
    }
    if let Some(pk) = prev_kmer {
        sizes[pk as usize] = total_data_size - prev_offset;
    }
    sizes
}

fn write_filtered_kix(
    kix_in: &KixReader,
    kix_final: &Path,
    excluded: &[bool],
    sizes: &[u64],
    k: u8,
    new_total_postings: u64,
) -> Result<()> {
    let tbl_size = table_size(k);
    let mut file = BufWriter::new(File::create(kix_final)?);
    file.write_all(&[0u8; kix::HEADER_LEN])?;
    let mut new_offsets = vec![0u64; tbl_size as usize];
    let mut new_counts = vec![0u32; tbl_size as usize];
    for &o in &new_offsets {
        file.write_all(&o.to_le_bytes())?;
    }
    for &c in &new_counts {
        file.write_all(&c.to_le_bytes())?;
    }

    let payload = kix_in.payload();
    let mut data_pos = 0u64;
    for i in 0..tbl_size {
        let count = kix_in.count_at(i);
        if count > 0 && !excluded[i as usize] {
            new_offsets[i as usize] = data_pos;
            new_counts[i as usize] = count;
            let start = kix_in.offset_at(i) as usize;
            let len = sizes[i as usize] as usize;
            file.write_all(&payload[start..start + len])?;
            data_pos += len as u64;
        }
    }

    let header = KixHeader {
        format_version: KIX_FORMAT_VERSION,
        k,
        kmer_type: kmer_type_for_k(k),
        num_sequences: kix_in.header().num_sequences,
        total_postings: new_total_postings,
        flags: kix_in.header().flags,
        volume_index: kix_in.header().volume_index,
        total_volumes: kix_in.header().total_volumes,
        db_name: kix_in.header().db_name.clone(),
    };
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&kix::pack_header(&header))?;
    for &o in &new_offsets {
        file.write_all(&o.to_le_bytes())?;
    }
    for &c in &new_counts {
        file.write_all(&c.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

fn write_filtered_kpx(
    kpx_in: &KpxReader,
    kix_counts: &[u32],
    kpx_final: &Path,
    excluded: &[bool],
    sizes: &[u64],
    k: u8,
    new_total_postings: u64,
) -> Result<()> {
    let tbl_size = table_size(k);
    let mut file = BufWriter::new(File::create(kpx_final)?);
    file.write_all(&[0u8; kpx::HEADER_LEN])?;
    let mut new_offsets = vec![0u64; tbl_size as usize];
    for &o in &new_offsets {
        file.write_all(&o.to_le_bytes())?;
    }

    let payload = kpx_in.payload();
    let mut data_pos = 0u64;
    for i in 0..tbl_size {
        if kix_counts[i as usize] > 0 && !excluded[i as usize] {
            new_offsets[i as usize] = data_pos;
            let start = kpx_in.offset_at(i) as usize;
            let len = sizes[i as usize] as usize;
            file.write_all(&payload[start..start + len])?;
            data_pos += len as u64;
        }
    }

    let header = KpxHeader {
        format_version: KPX_FORMAT_VERSION,
        k,
        total_postings: new_total_postings,
    };
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&kpx::pack_header(&header))?;
    for &o in &new_offsets {
        file.write_all(&o.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Filter one volume's `.kix.tmp`/`.kpx.tmp` into final `.kix`/`.kpx`, and
/// rename `.ksx.tmp` to `.ksx`. The `.tmp` files are removed on success.
fn filter_one_volume(prefix: &Path, excluded: &[bool], k: u8) -> Result<()> {
    let kix_tmp = with_ext(prefix, ".kix.tmp");
    let kpx_tmp = with_ext(prefix, ".kpx.tmp");
    let ksx_tmp = with_ext(prefix, ".ksx.tmp");
    let kix_final = with_ext(prefix, ".kix");
    let kpx_final = with_ext(prefix, ".kpx");
    let ksx_final = with_ext(prefix, ".ksx");

    let kix_in = KixReader::open(&kix_tmp)?;
    let kpx_in = KpxReader::open(&kpx_tmp)?;

    let tbl_size = table_size(k);
    let counts: Vec<u32> = (0..tbl_size).map(|i| kix_in.count_at(i)).collect();

    let kix_sizes = compute_posting_sizes(
        |i| kix_in.offset_at(i),
        &counts,
        tbl_size,
        kix_in.payload().len() as u64,
    );
    let kpx_sizes = compute_posting_sizes(
        |i| kpx_in.offset_at(i),
        &counts,
        tbl_size,
        kpx_in.payload().len() as u64,
    );

    let mut new_total_postings = 0u64;
    for (i, &c) in counts.iter().enumerate() {
        if !excluded[i] {
            new_total_postings += c as u64;
        }
    }

    let (kix_result, kpx_result) = rayon::join(
        || write_filtered_kix(&kix_in, &kix_final, excluded, &kix_sizes, k, new_total_postings),
        || {
            write_filtered_kpx(
                &kpx_in,
                &counts,
                &kpx_final,
                excluded,
                &kpx_sizes,
                k,
                new_total_postings,
            )
        },
    );
    kix_result?;
    kpx_result?;

    drop(kix_in);
    drop(kpx_in);

    std::fs::rename(&ksx_tmp, &ksx_final)?;
    let _ = std::fs::remove_file(&kix_tmp);
    let _ = std::fs::remove_file(&kpx_tmp);

    log::info!(
        "filtered volume {} (total_postings: {new_total_postings})",
        prefix.display()
    );
    Ok(())
}

/// Cross-volume frequency filter entry point: aggregate counts across
/// `vol_prefixes`' `.kix.tmp` files, exclude k-mers whose combined count
/// exceeds `freq_threshold`, rewrite every volume's final `.kix`/`.kpx`, and
/// write the shared exclusion bitset at `khx_path`.
pub fn filter_volumes_cross_volume(
    vol_prefixes: &[PathBuf],
    khx_path: &Path,
    k: u8,
    freq_threshold: u64,
) -> Result<()> {
    validate_k(k)?;
    let tbl_size = table_size(k);

    log::info!(
        "cross-volume filter: aggregating counts from {} volume(s)",
        vol_prefixes.len()
    );
    let mut global_counts = vec![0u64; tbl_size as usize];
    for prefix in vol_prefixes {
        let kix_tmp = with_ext(prefix, ".kix.tmp");
        let kix = KixReader::open(&kix_tmp)?;
        for i in 0..tbl_size {
            global_counts[i as usize] += kix.count_at(i) as u64;
        }
    }

    let mut excluded = vec![false; tbl_size as usize];
    let mut num_excluded = 0u64;
    for (i, &c) in global_counts.iter().enumerate() {
        if c > freq_threshold {
            excluded[i] = true;
            num_excluded += 1;
        }
    }
    drop(global_counts);

    log::info!("cross-volume filter: {num_excluded} k-mer(s) excluded (threshold={freq_threshold})");

    vol_prefixes
        .par_iter()
        .try_for_each(|prefix| filter_one_volume(prefix, &excluded, k))?;

    let mut bitset = vec![0u8; bitset_len_bytes(k)];
    for (i, &ex) in excluded.iter().enumerate() {
        if ex {
            bitset[i / 8] |= 1 << (i % 8);
        }
    }
    write_khx(khx_path, k, &bitset)?;

    log::info!("cross-volume filter: done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambig::AmbigEntry;
    use crate::builder::{build_volume, BuildConfig};
    use crate::format::khx::KhxReader;
    use crate::format::ksx;
    use crate::packed::pack_bases;
    use crate::source::InMemorySource;
    use tempfile::tempdir;

    fn encode_base(b: u8) -> u8 {
        match b {
            b'A' => 0,
            b'C' => 1,
            b'G' => 2,
            b'T' => 3,
            _ => 0,
        }
    }

    fn pack(seq: &str) -> Vec<u8> {
        pack_bases(seq.bytes().map(encode_base))
    }

    fn config(k: u8, volume_index: u16, total_volumes: u16) -> BuildConfig {
        BuildConfig {
            k,
            threads: 1,
            partitions: 2,
            buffer_bytes: 4096,
            max_expansion: 4,
            local_freq_cap: 0,
            volume_index,
            total_volumes,
            db_name: "testdb".to_string(),
            verbose: false,
        }
    }

    // Build two volumes as .tmp files directly (bypassing build_volume's
    // atomic rename) so the filter has .kix.tmp/.kpx.tmp/.ksx.tmp to read.
    fn build_volume_tmp(source: &InMemorySource, k: u8, prefix: &Path, vi: u16, tv: u16) {
        build_volume(source, &config(k, vi, tv), prefix).unwrap();
        std::fs::rename(with_ext(prefix, ".kix"), with_ext(prefix, ".kix.tmp")).unwrap();
        std::fs::rename(with_ext(prefix, ".kpx"), with_ext(prefix, ".kpx.tmp")).unwrap();
        std::fs::rename(with_ext(prefix, ".ksx"), with_ext(prefix, ".ksx.tmp")).unwrap();
    }

    #[test]
    fn excludes_kmers_over_threshold_across_volumes() {
        let k = 5;
        let dir = tempdir().unwrap();

        // "AAAAA" (kmer 0) appears 5x in vol0 and 5x in vol1: global count 10.
        let mut src0 = InMemorySource::new();
        src0.push(pack("AAAAAAAAA"), 9, vec![], "seq0");
        let prefix0 = dir.path().join("vol0");
        build_volume_tmp(&src0, k, &prefix0, 0, 2);

        let mut src1 = InMemorySource::new();
        src1.push(pack("AAAAAAAAA"), 9, vec![], "seq1");
        src1.push(pack("ACGTACGTAC"), 10, vec![], "seq2");
        let prefix1 = dir.path().join("vol1");
        build_volume_tmp(&src1, k, &prefix1, 1, 2);

        let khx_path = dir.path().join("shared.khx");
        filter_volumes_cross_volume(&[prefix0.clone(), prefix1.clone()], &khx_path, k, 8).unwrap();

        let khx = KhxReader::open(&khx_path).unwrap();
        assert!(khx.is_excluded(0)); // AAAAA: global count 10 > 8

        let kix0 = KixReader::open(&with_ext(&prefix0, ".kix")).unwrap();
        assert_eq!(kix0.count_at(0), 0);
        assert_eq!(kix0.offset_at(0), 0);

        // A surviving k-mer's postings are untouched.
        let kix1 = KixReader::open(&with_ext(&prefix1, ".kix")).unwrap();
        let mut ordinals = Vec::new();
        kix1.decode_ordinals(108, &mut ordinals); // "ACGTA"
        assert_eq!(ordinals, vec![1, 1]);

        let kpx1 = KpxReader::open(&with_ext(&prefix1, ".kpx")).unwrap();
        let mut positions = Vec::new();
        kpx1.decode_positions(108, &ordinals, &mut positions);
        assert_eq!(positions, vec![0, 4]);

        assert!(!with_ext(&prefix0, ".kix.tmp").exists());
        assert!(!with_ext(&prefix1, ".kpx.tmp").exists());
        assert!(with_ext(&prefix0, ".ksx").exists());

        let records = ksx::read_ksx(&with_ext(&prefix1, ".ksx")).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn threshold_of_max_excludes_nothing() {
        let k = 5;
        let dir = tempdir().unwrap();
        let mut src = InMemorySource::new();
        src.push(pack("ACGTACGTAC"), 10, vec![], "seq0");
        let prefix = dir.path().join("vol0");
        build_volume_tmp(&src, k, &prefix, 0, 1);

        let khx_path = dir.path().join("shared.khx");
        filter_volumes_cross_volume(std::slice::from_ref(&prefix), &khx_path, k, u64::MAX).unwrap();

        let khx = KhxReader::open(&khx_path).unwrap();
        for i in 0..table_size(k) {
            assert!(!khx.is_excluded(i));
        }

        let kix = KixReader::open(&with_ext(&prefix, ".kix")).unwrap();
        let mut ordinals = Vec::new();
        kix.decode_ordinals(108, &mut ordinals);
        assert_eq!(ordinals, vec![0, 0]);
    }

    #[test]
    fn ambiguity_expansion_survives_filter() {
        let k = 5;
        let dir = tempdir().unwrap();
        let seq = "ACGTACG";
        let ambig = vec![AmbigEntry {
            position: 3,
            run_length: 1,
            base4: 5, // R = A|G
        }];
        let mut src = InMemorySource::new();
        src.push(pack(seq), seq.len() as u32, ambig, "seq0");
        let prefix = dir.path().join("vol0");
        build_volume_tmp(&src, k, &prefix, 0, 1);

        let khx_path = dir.path().join("shared.khx");
        filter_volumes_cross_volume(std::slice::from_ref(&prefix), &khx_path, k, u64::MAX).unwrap();

        let kix = KixReader::open(&with_ext(&prefix, ".kix")).unwrap();
        assert_eq!(kix.header().total_postings, 6);
    }
}
