//! End-to-end builder -> filter -> reader round trip, exercising the public
//! API the way a real caller would: build two volumes from in-memory
//! sources, run the cross-volume frequency filter, then read the results
//! back through the memory-mapped readers.

use ikafssn_index::builder::{build_volume, BuildConfig};
use ikafssn_index::filter::filter_volumes_cross_volume;
use ikafssn_index::format::ksx;
use ikafssn_index::packed::pack_bases;
use ikafssn_index::reader::{KhxReader, KixReader, KpxReader};
use ikafssn_index::source::InMemorySource;
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

fn with_ext(prefix: &std::path::Path, ext: &str) -> std::path::PathBuf {
    let mut s = prefix.as_os_str().to_os_string();
    s.push(ext);
    std::path::PathBuf::from(s)
}

fn config(k: u8, volume_index: u16, total_volumes: u16) -> BuildConfig {
    BuildConfig {
        k,
        threads: 1,
        partitions: 4,
        buffer_bytes: 1 << 16,
        max_expansion: 16,
        local_freq_cap: 0,
        volume_index,
        total_volumes,
        db_name: "itest".to_string(),
        verbose: false,
    }
}

#[test]
fn two_volumes_build_filter_and_read_back() {
    let k = 5u8;
    let dir = tempdir().unwrap();

    let mut src0 = InMemorySource::new();
    src0.push(pack("AAAAAAAAAA"), 10, vec![], "vol0_seq0"); // 6 windows of AAAAA
    let prefix0 = dir.path().join("nt.00");
    build_volume(&src0, &config(k, 0, 2), &prefix0).unwrap();
    std::fs::rename(with_ext(&prefix0, ".kix"), with_ext(&prefix0, ".kix.tmp")).unwrap();
    std::fs::rename(with_ext(&prefix0, ".kpx"), with_ext(&prefix0, ".kpx.tmp")).unwrap();
    std::fs::rename(with_ext(&prefix0, ".ksx"), with_ext(&prefix0, ".ksx.tmp")).unwrap();

    let mut src1 = InMemorySource::new();
    src1.push(pack("AAAAAAAAAA"), 10, vec![], "vol1_seq0"); // another 6 windows of AAAAA
    src1.push(pack("ACGTACGTAC"), 10, vec![], "vol1_seq1");
    let prefix1 = dir.path().join("nt.01");
    build_volume(&src1, &config(k, 1, 2), &prefix1).unwrap();
    std::fs::rename(with_ext(&prefix1, ".kix"), with_ext(&prefix1, ".kix.tmp")).unwrap();
    std::fs::rename(with_ext(&prefix1, ".kpx"), with_ext(&prefix1, ".kpx.tmp")).unwrap();
    std::fs::rename(with_ext(&prefix1, ".ksx"), with_ext(&prefix1, ".ksx.tmp")).unwrap();

    // Global count of "AAAAA" (kmer 0) is 6 + 6 = 12, over the threshold of 10.
    let khx_path = dir.path().join("nt.khx");
    filter_volumes_cross_volume(&[prefix0.clone(), prefix1.clone()], &khx_path, k, 10).unwrap();

    let khx = KhxReader::open(&khx_path).unwrap();
    assert!(khx.is_excluded(0));

    let kix0 = KixReader::open(&with_ext(&prefix0, ".kix")).unwrap();
    assert_eq!(kix0.count_at(0), 0);
    assert_eq!(kix0.header().num_sequences, 1);

    let kix1 = KixReader::open(&with_ext(&prefix1, ".kix")).unwrap();
    let kpx1 = KpxReader::open(&with_ext(&prefix1, ".kpx")).unwrap();
    // "ACGTA" (kmer 108) is unaffected by the filter and still decodes.
    let mut ordinals = Vec::new();
    kix1.decode_ordinals(108, &mut ordinals);
    assert_eq!(ordinals, vec![1, 1]);
    let mut positions = Vec::new();
    kpx1.decode_positions(108, &ordinals, &mut positions);
    assert_eq!(positions, vec![0, 4]);

    let records = ksx::read_ksx(&with_ext(&prefix1, ".ksx")).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].accession, "vol1_seq1");

    for ext in [".kix.tmp", ".kpx.tmp"] {
        assert!(!with_ext(&prefix0, ext).exists());
        assert!(!with_ext(&prefix1, ext).exists());
    }
}
