//! DEX header checksum and signature verification

use sha1::{Digest, Sha1};

use super::kind::{detect_dex_kind, DexKind};
use super::HEADER_SIZE;

/// DEX header offsets
const CHECKSUM_OFFSET: usize = 0x08;
const SIGNATURE_OFFSET: usize = 0x0C;
const SIGNATURE_END: usize = 0x20;
const FILE_SIZE_OFFSET: usize = 0x20;

/// Result of checking a dex header against its payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderCheck {
    /// Adler-32 at 0x08 matches the bytes after 0x0C
    pub checksum_ok: bool,
    /// SHA-1 at 0x0C-0x1F matches the bytes after 0x20
    pub signature_ok: bool,
    /// `file_size` field at 0x20 matches the buffer length
    pub size_ok: bool,
}

impl HeaderCheck {
    /// A dex that ART would load. The signature is informational only.
    pub fn is_loadable(&self) -> bool {
        self.checksum_ok && self.size_ok
    }
}

/// Verify the header of a standard DEX file
///
/// Returns `None` when the buffer is not a standard dex or is shorter than
/// the fixed header.
pub fn verify_dex_header(buffer: &[u8]) -> Option<HeaderCheck> {
    if !matches!(detect_dex_kind(buffer), Some(DexKind::Dex(_))) {
        return None;
    }
    if buffer.len() < HEADER_SIZE {
        return None;
    }

    let stored_checksum = read_u32_le(buffer, CHECKSUM_OFFSET);
    let stored_size = read_u32_le(buffer, FILE_SIZE_OFFSET);

    let mut hasher = Sha1::new();
    hasher.update(&buffer[SIGNATURE_END..]);
    let signature = hasher.finalize();

    Some(HeaderCheck {
        checksum_ok: adler32(&buffer[SIGNATURE_OFFSET..]) == stored_checksum,
        signature_ok: buffer[SIGNATURE_OFFSET..SIGNATURE_END] == signature[..20],
        size_ok: stored_size as usize == buffer.len(),
    })
}

/// Recompute the `file_size`, signature and checksum fields in place
///
/// Only standard dex buffers of at least [`HEADER_SIZE`] bytes are touched.
#[cfg(test)]
pub(crate) fn fix_dex_header(buffer: &mut [u8]) {
    if !matches!(detect_dex_kind(buffer), Some(DexKind::Dex(_))) || buffer.len() < HEADER_SIZE {
        return;
    }

    let size = buffer.len() as u32;
    buffer[FILE_SIZE_OFFSET..FILE_SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());

    // Compute SHA-1 signature over everything after offset 0x20
    let mut hasher = Sha1::new();
    hasher.update(&buffer[SIGNATURE_END..]);
    let signature = hasher.finalize();
    buffer[SIGNATURE_OFFSET..SIGNATURE_END].copy_from_slice(&signature[..20]);

    // Adler-32 covers the signature, so it goes last
    let checksum = adler32(&buffer[SIGNATURE_OFFSET..]);
    buffer[CHECKSUM_OFFSET..SIGNATURE_OFFSET].copy_from_slice(&checksum.to_le_bytes());
}

fn read_u32_le(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    ])
}

/// Compute Adler-32 checksum (as used in DEX files)
fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a = 1u32;
    let mut b = 0u32;

    for &byte in data {
        a = (a + byte as u32) % MOD;
        b = (b + a) % MOD;
    }

    (b << 16) | a
}

/// Build a minimal but well-formed dex buffer carrying `payload` after the header.
#[cfg(test)]
pub(crate) fn synthetic_dex(payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; HEADER_SIZE];
    buffer[0..8].copy_from_slice(b"dex\n035\0");
    buffer.extend_from_slice(payload);
    fix_dex_header(&mut buffer);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adler32_empty() {
        assert_eq!(adler32(&[]), 1);
    }

    #[test]
    fn test_adler32_known_value() {
        // "Wikipedia" has a known Adler-32 of 0x11E60398
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn test_verify_fixed_header() {
        let buffer = synthetic_dex(b"some class data");
        let check = verify_dex_header(&buffer).unwrap();
        assert!(check.checksum_ok);
        assert!(check.signature_ok);
        assert!(check.size_ok);
        assert!(check.is_loadable());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut buffer = synthetic_dex(b"some class data");
        let last = buffer.len() - 1;
        buffer[last] ^= 0xFF;

        let check = verify_dex_header(&buffer).unwrap();
        assert!(!check.checksum_ok);
        assert!(!check.signature_ok);
        assert!(!check.is_loadable());
    }

    #[test]
    fn test_signature_mismatch_alone_is_loadable() {
        let mut buffer = synthetic_dex(b"payload");
        buffer[SIGNATURE_OFFSET] ^= 0x01;
        // Recompute only the checksum so the signature stays wrong
        let checksum = adler32(&buffer[SIGNATURE_OFFSET..]);
        buffer[CHECKSUM_OFFSET..SIGNATURE_OFFSET].copy_from_slice(&checksum.to_le_bytes());

        let check = verify_dex_header(&buffer).unwrap();
        assert!(!check.signature_ok);
        assert!(check.is_loadable());
    }

    #[test]
    fn test_verify_rejects_non_dex() {
        let mut buffer = vec![0u8; 0x100];
        buffer[0..4].copy_from_slice(b"cdex");
        assert_eq!(verify_dex_header(&buffer), None);

        let short = b"dex\n035\0".to_vec();
        assert_eq!(verify_dex_header(&short), None);
    }

    #[test]
    fn test_fix_dex_header_ignores_short_buffer() {
        let mut buffer = vec![0u8; 0x10];
        buffer[0..8].copy_from_slice(b"dex\n035\0");
        let original = buffer.clone();
        fix_dex_header(&mut buffer);
        assert_eq!(buffer, original);
    }
}
