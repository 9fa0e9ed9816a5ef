//! Mach-O load command editing
//!
//! Only what dylib injection needs: walking the load command table of thin
//! and fat binaries in either byte order, and appending an `LC_LOAD_DYLIB`
//! into the padding that linkers leave between the commands and the first
//! section.

mod header;
mod inject;

#[cfg(test)]
pub(crate) use header::fixtures;
pub use header::{Endian, LoadCommand, LoadCommandTable};
pub use inject::{has_load_dylib, inject_into_buffer, inject_load_dylib, InjectOutcome};

pub const MH_MAGIC: u32 = 0xfeed_face;
pub const MH_CIGAM: u32 = 0xcefa_edfe;
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;
pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_MAGIC_64: u32 = 0xcafe_babf;

pub const LC_SEGMENT: u32 = 0x1;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
pub const LC_REEXPORT_DYLIB: u32 = 0x8000_001f;

/// Install name the injected framework is loaded from.
pub const AUTOPROXY_DYLIB: &str = "@executable_path/Frameworks/AutoProxy.framework/AutoProxy";
