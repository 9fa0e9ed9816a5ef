use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::header::{fat_slices, LoadCommandTable, NCMDS_OFFSET, SIZEOFCMDS_OFFSET};
use super::LC_LOAD_DYLIB;
use crate::error::{PatcherError, Result};

/// `dylib_command` fixed part: cmd, cmdsize, name offset, timestamp, two versions.
const DYLIB_COMMAND_SIZE: usize = 24;
const DYLIB_TIMESTAMP: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The command was added to this many slices.
    Inserted { slices: usize },
    /// Every slice already loads the dylib.
    AlreadyPresent,
}

/// Add `LC_LOAD_DYLIB <dylib>` to every slice of the binary at `path`.
///
/// All slices are edited in memory first and the file is written once, so a
/// failure in any slice leaves the binary untouched.
pub fn inject_load_dylib(path: &Path, dylib: &str) -> Result<InjectOutcome> {
    let mut data = fs::read(path).map_err(|e| PatcherError::from_io_error(path, e))?;
    let outcome = inject_into_buffer(&mut data, dylib)?;

    match outcome {
        InjectOutcome::Inserted { slices } => {
            fs::write(path, &data).map_err(|e| PatcherError::from_io_error(path, e))?;
            info!("Added LC_LOAD_DYLIB {dylib} to {slices} slice(s)");
        }
        InjectOutcome::AlreadyPresent => {
            info!("{} already loads {dylib}", path.display());
        }
    }
    Ok(outcome)
}

/// Whether every slice of the binary at `path` already loads `dylib`.
pub fn has_load_dylib(path: &Path, dylib: &str) -> Result<bool> {
    let data = fs::read(path).map_err(|e| PatcherError::from_io_error(path, e))?;
    for (offset, size) in slice_ranges(&data)? {
        let table = LoadCommandTable::parse(&data[offset..offset + size])?;
        if !table.has_dylib(dylib.as_bytes()) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// In-memory variant of [`inject_load_dylib`].
pub fn inject_into_buffer(data: &mut [u8], dylib: &str) -> Result<InjectOutcome> {
    let mut inserted = 0;
    for (offset, size) in slice_ranges(data)? {
        if inject_slice(&mut data[offset..offset + size], dylib.as_bytes())? {
            inserted += 1;
        }
    }

    if inserted == 0 {
        Ok(InjectOutcome::AlreadyPresent)
    } else {
        Ok(InjectOutcome::Inserted { slices: inserted })
    }
}

fn slice_ranges(data: &[u8]) -> Result<Vec<(usize, usize)>> {
    Ok(fat_slices(data)?.unwrap_or_else(|| vec![(0, data.len())]))
}

fn inject_slice(slice: &mut [u8], name: &[u8]) -> Result<bool> {
    let table = LoadCommandTable::parse(slice)?;
    if table.has_dylib(name) {
        debug!("slice already has the load command");
        return Ok(false);
    }

    let alignment = if table.is_64 { 8 } else { 4 };
    let needed = align_up(DYLIB_COMMAND_SIZE + name.len() + 1, alignment);
    let start = table.commands_end();
    let available = table.first_content_offset.saturating_sub(start);
    if available < needed {
        return Err(PatcherError::InsufficientHeaderPadding { needed, available });
    }

    let zeroed = slice[start..start + available]
        .iter()
        .take_while(|&&b| b == 0)
        .count();
    if zeroed < needed {
        return Err(PatcherError::InsufficientHeaderPadding {
            needed,
            available: zeroed,
        });
    }

    let e = table.endian;
    e.write_u32(slice, start, LC_LOAD_DYLIB)?;
    e.write_u32(slice, start + 4, needed as u32)?;
    e.write_u32(slice, start + 8, DYLIB_COMMAND_SIZE as u32)?;
    e.write_u32(slice, start + 12, DYLIB_TIMESTAMP)?;
    e.write_u32(slice, start + 16, 0)?;
    e.write_u32(slice, start + 20, 0)?;
    let name_start = start + DYLIB_COMMAND_SIZE;
    slice[name_start..name_start + name.len()].copy_from_slice(name);

    e.write_u32(slice, NCMDS_OFFSET, table.ncmds + 1)?;
    e.write_u32(slice, SIZEOFCMDS_OFFSET, table.sizeofcmds + needed as u32)?;
    debug!(needed, available, "wrote dylib command at 0x{start:x}");
    Ok(true)
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::super::header::fixtures::{fat, thin};
    use super::super::{Endian, AUTOPROXY_DYLIB};
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn command_size_is_aligned() {
        // 24 + 57 + 1 = 82
        assert_eq!(AUTOPROXY_DYLIB.len(), 57);
        assert_eq!(align_up(82, 8), 88);
        assert_eq!(align_up(82, 4), 84);
    }

    #[test]
    fn huge_fat_arch_count_returns_an_error() {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(&[0xca, 0xfe, 0xba, 0xbe, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            inject_into_buffer(&mut buf, AUTOPROXY_DYLIB),
            Err(PatcherError::MalformedMachO(_))
        ));
    }

    #[test]
    fn inserts_into_thin_binary() {
        let mut buf = thin(true, Endian::Little, 0x1000, 0x2000);
        let outcome = inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap();
        assert_eq!(outcome, InjectOutcome::Inserted { slices: 1 });

        let table = LoadCommandTable::parse(&buf).unwrap();
        assert_eq!(table.ncmds, 2);
        assert_eq!(table.sizeofcmds, 72 + 80 + 88);
        assert_eq!(table.commands[1].cmd, LC_LOAD_DYLIB);
        assert!(table.has_dylib(AUTOPROXY_DYLIB.as_bytes()));
        assert_eq!(Endian::Little.read_u32(&buf, table.commands[1].offset + 12).unwrap(), 2);
    }

    #[test]
    fn reinjection_is_idempotent() {
        let mut buf = thin(true, Endian::Little, 0x1000, 0x2000);
        inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap();
        let once = buf.clone();

        let outcome = inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap();
        assert_eq!(outcome, InjectOutcome::AlreadyPresent);
        assert_eq!(buf, once);
        assert_eq!(LoadCommandTable::parse(&buf).unwrap().ncmds, 2);
    }

    #[test]
    fn zero_padding_fails() {
        let header_and_cmds = 32 + 72 + 80;
        let mut buf = thin(true, Endian::Little, header_and_cmds as u32, 0x1000);
        let original = buf.clone();
        let err = inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap_err();
        assert!(matches!(
            err,
            PatcherError::InsufficientHeaderPadding {
                needed: 88,
                available: 0
            }
        ));
        assert_eq!(buf, original);
    }

    #[test]
    fn dirty_padding_fails() {
        let mut buf = thin(true, Endian::Little, 0x1000, 0x2000);
        buf[32 + 72 + 80 + 4] = 0xAA;
        assert!(matches!(
            inject_into_buffer(&mut buf, AUTOPROXY_DYLIB),
            Err(PatcherError::InsufficientHeaderPadding { available: 4, .. })
        ));
    }

    #[test]
    fn thirty_two_bit_big_endian() {
        let mut buf = thin(false, Endian::Big, 0x800, 0x1000);
        inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap();
        let table = LoadCommandTable::parse(&buf).unwrap();
        assert_eq!(table.ncmds, 2);
        assert_eq!(table.commands[1].size, 84);
    }

    #[test]
    fn fat_binary_patches_every_slice() {
        let arm64 = thin(true, Endian::Little, 0x1000, 0x2000);
        let armv7 = thin(false, Endian::Little, 0x800, 0x1000);
        let mut buf = fat(&[arm64, armv7]);

        let outcome = inject_into_buffer(&mut buf, AUTOPROXY_DYLIB).unwrap();
        assert_eq!(outcome, InjectOutcome::Inserted { slices: 2 });
        for (offset, size) in slice_ranges(&buf).unwrap() {
            let table = LoadCommandTable::parse(&buf[offset..offset + size]).unwrap();
            assert!(table.has_dylib(AUTOPROXY_DYLIB.as_bytes()));
        }
    }

    #[test]
    fn fat_failure_leaves_file_untouched() -> anyhow::Result<()> {
        let roomy = thin(true, Endian::Little, 0x1000, 0x2000);
        let tight = thin(false, Endian::Little, 28 + 56 + 68, 0x1000);
        let temp = TempDir::new()?;
        let path = temp.path().join("App");
        let original = fat(&[roomy, tight]);
        fs::write(&path, &original)?;

        assert!(inject_load_dylib(&path, AUTOPROXY_DYLIB).is_err());
        assert_eq!(fs::read(&path)?, original);
        assert!(!has_load_dylib(&path, AUTOPROXY_DYLIB)?);
        Ok(())
    }

    #[test]
    fn file_roundtrip_and_query() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("App");
        fs::write(&path, thin(true, Endian::Little, 0x1000, 0x2000))?;

        assert!(!has_load_dylib(&path, AUTOPROXY_DYLIB)?);
        inject_load_dylib(&path, AUTOPROXY_DYLIB)?;
        assert!(has_load_dylib(&path, AUTOPROXY_DYLIB)?);
        assert_eq!(
            inject_load_dylib(&path, AUTOPROXY_DYLIB)?,
            InjectOutcome::AlreadyPresent
        );
        Ok(())
    }
}
