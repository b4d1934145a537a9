//! On-disk file formats: `.kix` (id postings), `.kpx` (position postings),
//! `.ksx` (sequence metadata sidecar), `.khx` (cross-volume exclusion
//! bitset). All multi-byte fields are host little-endian; the crate
//! declares a little-endian platform requirement to match.

pub mod khx;
pub mod kix;
pub mod kpx;
pub mod ksx;

pub const KIX_MAGIC: [u8; 4] = *b"KMIX";
pub const KPX_MAGIC: [u8; 4] = *b"KMPX";
pub const KHX_MAGIC: [u8; 4] = *b"KMHX";

pub const KIX_FORMAT_VERSION: u16 = 1;
pub const KPX_FORMAT_VERSION: u16 = 1;
pub const KHX_FORMAT_VERSION: u16 = 1;

/// `.kix` header flag bit: sidecar (`.ksx`) is present alongside this volume.
pub const KIX_FLAG_HAS_KSX: u32 = 0x02;

#[cfg(not(target_endian = "little"))]
compile_error!("this crate assumes a little-endian target platform");
