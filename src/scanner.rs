//! Sliding k-mer scanner over packed base2 data with ambiguity expansion.
//!
//! Grounded on `PackedKmerScanner`: a dual-cursor rolling window (one cursor
//! tracking the position entering the right edge, one tracking the position
//! leaving the left edge) so runs of ambiguous bases are walked on the fly
//! without materializing every position up front. The `ambig_count == 1`
//! case is cached to keep the common case O(1); only `ambig_count >= 2`
//! windows (rare, bounded by k) walk a scratch cursor.

use crate::ambig::AmbigEntry;
use crate::base4;
use crate::kmer::KmerInt;
use crate::packed::base_at;
use smallvec::SmallVec;

/// Describes one ambiguous base inside an emitted degenerate k-mer: its
/// base4 code and the bit offset (0, 2, 4, ...) of that base within the
/// k-mer integer (0 = the two low bits, i.e. the rightmost base).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmbigDescriptor {
    pub base4: u8,
    pub bit_offset: u8,
}

/// Up to `k` descriptors per emitted k-mer (k <= 16), stack-allocated.
pub type Descriptors = SmallVec<[AmbigDescriptor; 16]>;

#[derive(Clone, Copy, Default)]
struct Cursor {
    entry_idx: usize,
    run_offset: u32,
}

impl Cursor {
    #[inline]
    fn pos(&self, entries: &[AmbigEntry]) -> Option<u32> {
        entries
            .get(self.entry_idx)
            .map(|e| e.position + self.run_offset)
    }

    #[inline]
    fn base4(&self, entries: &[AmbigEntry]) -> u8 {
        entries[self.entry_idx].base4
    }

    #[inline]
    fn advance(&mut self, entries: &[AmbigEntry]) {
        if self.entry_idx >= entries.len() {
            return;
        }
        self.run_offset += 1;
        if self.run_offset >= entries[self.entry_idx].run_length {
            self.entry_idx += 1;
            self.run_offset = 0;
        }
    }
}

pub struct Scanner<K: KmerInt> {
    k: u8,
    mask: K,
}

impl<K: KmerInt> Scanner<K> {
    pub fn new(k: u8) -> Self {
        Scanner {
            k,
            mask: K::mask(k),
        }
    }

    /// Walk `packed_bases` left to right, invoking `on_clean(start, kmer)`
    /// for windows with no ambiguous base and `on_ambig(start, base_kmer,
    /// descriptors)` for windows whose expansion product is within
    /// `max_expansion`. Windows whose product exceeds `max_expansion` (or
    /// that contain a gap, whose product is 0) are silently dropped.
    pub fn scan(
        &self,
        packed_bases: &[u8],
        seq_length: u32,
        ambig_entries: &[AmbigEntry],
        max_expansion: u32,
        mut on_clean: impl FnMut(u32, K),
        mut on_ambig: impl FnMut(u32, K, &Descriptors),
    ) {
        let k = self.k as u32;
        if seq_length < k {
            return;
        }

        let mut enter_cur = Cursor::default();
        let mut leave_cur = Cursor::default();
        let mut ambig_count: i64 = 0;

        let mut single_pos: u32 = u32::MAX;
        let mut single_base4: u8 = 0;

        let mut kmer = K::ZERO;

        for i in 0..(k - 1) {
            let code = base_at(packed_bases, i);
            kmer = (kmer << 2) | K::from_base2(code);
            kmer = kmer & self.mask;

            if enter_cur.pos(ambig_entries) == Some(i) {
                ambig_count += 1;
                single_pos = i;
                single_base4 = enter_cur.base4(ambig_entries);
                enter_cur.advance(ambig_entries);
            }
        }

        for i in (k - 1)..seq_length {
            let code = base_at(packed_bases, i);
            kmer = (kmer << 2) | K::from_base2(code);
            kmer = kmer & self.mask;

            if enter_cur.pos(ambig_entries) == Some(i) {
                ambig_count += 1;
                if ambig_count == 1 {
                    single_pos = i;
                    single_base4 = enter_cur.base4(ambig_entries);
                }
                enter_cur.advance(ambig_entries);
            }

            let kmer_start = i + 1 - k;

            if ambig_count == 0 {
                on_clean(kmer_start, kmer);
            } else if max_expansion <= 1 {
                // expansion disabled: every ambiguous window is skipped
            } else if ambig_count == 1 {
                let ec = base4::expansion_count(single_base4);
                if ec != 0 && ec <= max_expansion {
                    let bases_from_right = i - single_pos;
                    let mut descs = Descriptors::new();
                    descs.push(AmbigDescriptor {
                        base4: single_base4,
                        bit_offset: (bases_from_right * 2) as u8,
                    });
                    on_ambig(kmer_start, kmer, &descs);
                }
            } else {
                let mut tmp = leave_cur;
                let win_start = kmer_start;
                while tmp.pos(ambig_entries).is_some_and(|p| p < win_start) {
                    tmp.advance(ambig_entries);
                }
                let mut product: u32 = 1;
                let mut descs = Descriptors::new();
                let mut exceeded = false;
                let win_end = i;
                while let Some(apos) = tmp.pos(ambig_entries) {
                    if apos > win_end {
                        break;
                    }
                    let a4 = tmp.base4(ambig_entries);
                    let ec = base4::expansion_count(a4);
                    product = product.saturating_mul(ec);
                    if product == 0 || product > max_expansion {
                        exceeded = true;
                        break;
                    }
                    let bases_from_right = i - apos;
                    descs.push(AmbigDescriptor {
                        base4: a4,
                        bit_offset: (bases_from_right * 2) as u8,
                    });
                    tmp.advance(ambig_entries);
                }
                if !exceeded {
                    on_ambig(kmer_start, kmer, &descs);
                }
            }

            if leave_cur.pos(ambig_entries) == Some(kmer_start) {
                ambig_count -= 1;
                leave_cur.advance(ambig_entries);

                if ambig_count == 1 {
                    let mut tmp = leave_cur;
                    let win_start = kmer_start + 1;
                    while tmp.pos(ambig_entries).is_some_and(|p| p < win_start) {
                        tmp.advance(ambig_entries);
                    }
                    if let Some(p) = tmp.pos(ambig_entries) {
                        single_pos = p;
                        single_base4 = tmp.base4(ambig_entries);
                    }
                }
            }
        }
    }
}
