//! Magic sniffing for dex payloads.

use std::fmt;

const DEX_MAGIC: &[u8; 4] = b"dex\n";
const CDEX_MAGIC: &[u8; 4] = b"cdex";

/// Oldest dex version the platform still loads from an APK.
pub const MIN_DEX_VERSION: u16 = 35;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DexKind {
    /// `dex\nNNN\0`, carrying the parsed version number.
    Dex(u16),
    /// ART's compact dex. Only produced on device, never shipped in a package.
    Cdex,
}

impl DexKind {
    /// Whether the runtime accepts this payload as a `classesN.dex` entry.
    pub fn is_installable(self) -> bool {
        matches!(self, DexKind::Dex(version) if version >= MIN_DEX_VERSION)
    }
}

impl fmt::Display for DexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DexKind::Dex(version) => write!(f, "dex v{version:03}"),
            DexKind::Cdex => f.write_str("compact dex"),
        }
    }
}

/// Identify a payload from its first eight bytes.
pub fn detect_dex_kind(header: &[u8]) -> Option<DexKind> {
    let magic = header.get(..8)?;
    if magic.starts_with(CDEX_MAGIC) {
        return Some(DexKind::Cdex);
    }
    if !magic.starts_with(DEX_MAGIC) || magic[7] != 0 {
        return None;
    }
    let digits = std::str::from_utf8(&magic[4..7]).ok()?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(DexKind::Dex)
}
