//! Memory-mapped, zero-copy readers over the four on-disk formats.
//!
//! The readers themselves live beside their writers in `src/format/` (each
//! format's header layout, offset table, and payload decoding are one
//! unit); this module re-exports them under the name the component design
//! gives the reader layer as a whole.

pub use crate::format::khx::KhxReader;
pub use crate::format::kix::KixReader;
pub use crate::format::kpx::KpxReader;
