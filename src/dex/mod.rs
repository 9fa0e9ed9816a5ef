//! DEX payload handling for APK injection
//!
//! This module covers everything the patcher needs to know about dex files:
//! - Magic and version sniffing
//! - Header checksum and signature verification of injected artifacts
//! - Slot bookkeeping for multidex (`classes.dex`, `classes2.dex`, ...)
//! - Injection of the SDK dex and, when missing, the Kotlin runtime dex

mod header;
mod inject;
mod kind;
mod slots;

pub use header::{verify_dex_header, HeaderCheck};
#[cfg(test)]
pub(crate) use header::synthetic_dex;
pub use inject::{contains_marker, inject_sdk, InjectionReport, KOTLIN_RUNTIME_MARKER};
pub use kind::{detect_dex_kind, DexKind, MIN_DEX_VERSION};
pub use slots::{slot_file_name, DexSet, PRIMARY_DEX};

/// DEX file header size (standard)
pub const HEADER_SIZE: usize = 0x70;
