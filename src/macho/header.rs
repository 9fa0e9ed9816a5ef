use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::*;
use crate::error::{PatcherError, Result};

const HEADER_SIZE_32: usize = 28;
const HEADER_SIZE_64: usize = 32;
pub(super) const NCMDS_OFFSET: usize = 16;
pub(super) const SIZEOFCMDS_OFFSET: usize = 20;

const SEGMENT_SIZE_32: usize = 56;
const SEGMENT_SIZE_64: usize = 72;
const SECTION_SIZE_32: usize = 68;
const SECTION_SIZE_64: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn read_u32(self, buf: &[u8], offset: usize) -> Result<u32> {
        let bytes = field(buf, offset, 4)?;
        Ok(match self {
            Endian::Little => LittleEndian::read_u32(bytes),
            Endian::Big => BigEndian::read_u32(bytes),
        })
    }

    pub fn read_u64(self, buf: &[u8], offset: usize) -> Result<u64> {
        let bytes = field(buf, offset, 8)?;
        Ok(match self {
            Endian::Little => LittleEndian::read_u64(bytes),
            Endian::Big => BigEndian::read_u64(bytes),
        })
    }

    pub fn write_u32(self, buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
        let len = buf.len();
        let bytes = buf
            .get_mut(offset..offset + 4)
            .ok_or_else(|| out_of_bounds(offset, 4, len))?;
        match self {
            Endian::Little => LittleEndian::write_u32(bytes, value),
            Endian::Big => BigEndian::write_u32(bytes, value),
        }
        Ok(())
    }
}

fn field(buf: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    buf.get(offset..offset + len)
        .ok_or_else(|| out_of_bounds(offset, len, buf.len()))
}

fn out_of_bounds(offset: usize, len: usize, total: usize) -> PatcherError {
    PatcherError::MalformedMachO(format!(
        "read of {len} bytes at 0x{offset:x} past end of slice (0x{total:x})"
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadCommand {
    pub cmd: u32,
    pub offset: usize,
    pub size: usize,
}

/// Parsed load command table of one thin Mach-O slice.
#[derive(Clone, Debug)]
pub struct LoadCommandTable {
    pub endian: Endian,
    pub is_64: bool,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub commands: Vec<LoadCommand>,
    /// Install names of every dylib-loading command, without the NUL terminator.
    pub dylibs: Vec<Vec<u8>>,
    /// Lowest file offset holding segment or section content.
    pub first_content_offset: usize,
}

impl LoadCommandTable {
    pub fn parse(slice: &[u8]) -> Result<Self> {
        let magic = LittleEndian::read_u32(field(slice, 0, 4)?);
        let (endian, is_64) = match magic {
            MH_MAGIC => (Endian::Little, false),
            MH_CIGAM => (Endian::Big, false),
            MH_MAGIC_64 => (Endian::Little, true),
            MH_CIGAM_64 => (Endian::Big, true),
            other => {
                return Err(PatcherError::MalformedMachO(format!(
                    "unknown magic 0x{other:08x}"
                )))
            }
        };

        let header_size = if is_64 { HEADER_SIZE_64 } else { HEADER_SIZE_32 };
        let ncmds = endian.read_u32(slice, NCMDS_OFFSET)?;
        let sizeofcmds = endian.read_u32(slice, SIZEOFCMDS_OFFSET)?;
        let commands_end = header_size
            .checked_add(sizeofcmds as usize)
            .filter(|end| *end <= slice.len())
            .ok_or_else(|| {
                PatcherError::MalformedMachO(format!(
                    "sizeofcmds {sizeofcmds} exceeds slice length {}",
                    slice.len()
                ))
            })?;

        // Every load command is at least 8 bytes.
        if ncmds as usize > sizeofcmds as usize / 8 {
            return Err(PatcherError::MalformedMachO(format!(
                "ncmds {ncmds} cannot fit in sizeofcmds {sizeofcmds}"
            )));
        }

        let mut table = Self {
            endian,
            is_64,
            ncmds,
            sizeofcmds,
            commands: Vec::with_capacity(ncmds as usize),
            dylibs: Vec::new(),
            first_content_offset: slice.len(),
        };

        let mut offset = header_size;
        for index in 0..ncmds {
            if offset + 8 > commands_end {
                return Err(PatcherError::MalformedMachO(format!(
                    "load command {index} starts past sizeofcmds"
                )));
            }
            let cmd = endian.read_u32(slice, offset)?;
            let size = endian.read_u32(slice, offset + 4)? as usize;
            if size < 8 || offset + size > commands_end {
                return Err(PatcherError::MalformedMachO(format!(
                    "load command {index} has invalid cmdsize {size}"
                )));
            }
            let command = &slice[offset..offset + size];

            match cmd {
                LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB => {
                    table.dylibs.push(dylib_name(endian, command)?);
                }
                LC_SEGMENT_64 => table.bound_by_segment_64(command)?,
                LC_SEGMENT => table.bound_by_segment_32(command)?,
                _ => {}
            }

            table.commands.push(LoadCommand { cmd, offset, size });
            offset += size;
        }

        Ok(table)
    }

    pub fn header_size(&self) -> usize {
        if self.is_64 {
            HEADER_SIZE_64
        } else {
            HEADER_SIZE_32
        }
    }

    /// Offset one past the last load command byte.
    pub fn commands_end(&self) -> usize {
        self.header_size() + self.sizeofcmds as usize
    }

    pub fn has_dylib(&self, name: &[u8]) -> bool {
        self.dylibs.iter().any(|existing| existing == name)
    }

    fn bound(&mut self, offset: u64) {
        if offset > 0 && (offset as usize) < self.first_content_offset {
            self.first_content_offset = offset as usize;
        }
    }

    fn bound_by_segment_64(&mut self, command: &[u8]) -> Result<()> {
        let e = self.endian;
        let fileoff = e.read_u64(command, 40)?;
        let filesize = e.read_u64(command, 48)?;
        if fileoff > 0 && filesize > 0 {
            self.bound(fileoff);
        }
        let nsects = e.read_u32(command, 64)? as usize;
        for i in 0..nsects {
            let section = SEGMENT_SIZE_64 + i * SECTION_SIZE_64;
            self.bound(e.read_u32(command, section + 48)? as u64);
        }
        Ok(())
    }

    fn bound_by_segment_32(&mut self, command: &[u8]) -> Result<()> {
        let e = self.endian;
        let fileoff = e.read_u32(command, 32)?;
        let filesize = e.read_u32(command, 36)?;
        if fileoff > 0 && filesize > 0 {
            self.bound(fileoff as u64);
        }
        let nsects = e.read_u32(command, 48)? as usize;
        for i in 0..nsects {
            let section = SEGMENT_SIZE_32 + i * SECTION_SIZE_32;
            self.bound(e.read_u32(command, section + 40)? as u64);
        }
        Ok(())
    }
}

fn dylib_name(endian: Endian, command: &[u8]) -> Result<Vec<u8>> {
    let name_offset = endian.read_u32(command, 8)? as usize;
    let raw = command.get(name_offset..).ok_or_else(|| {
        PatcherError::MalformedMachO(format!("dylib name offset {name_offset} outside command"))
    })?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(raw[..end].to_vec())
}

/// Slice ranges of a fat binary, or `None` for a thin one.
pub(super) fn fat_slices(data: &[u8]) -> Result<Option<Vec<(usize, usize)>>> {
    if data.len() < 8 {
        return Ok(None);
    }
    let magic = BigEndian::read_u32(&data[0..4]);
    let is_64 = match magic {
        FAT_MAGIC => false,
        FAT_MAGIC_64 => true,
        _ => return Ok(None),
    };

    let count = BigEndian::read_u32(&data[4..8]) as usize;
    let entry_size = if is_64 { 32 } else { 20 };
    let table_end = count.checked_mul(entry_size).and_then(|len| len.checked_add(8));
    if table_end.map_or(true, |end| end > data.len()) {
        return Err(PatcherError::MalformedMachO(format!(
            "{count} fat arch entries do not fit in {} bytes",
            data.len()
        )));
    }
    let mut slices = Vec::with_capacity(count);
    for i in 0..count {
        let entry = 8 + i * entry_size;
        let (offset, size) = if is_64 {
            (
                BigEndian::read_u64(field(data, entry + 8, 8)?) as usize,
                BigEndian::read_u64(field(data, entry + 16, 8)?) as usize,
            )
        } else {
            (
                BigEndian::read_u32(field(data, entry + 8, 4)?) as usize,
                BigEndian::read_u32(field(data, entry + 12, 4)?) as usize,
            )
        };
        if offset.checked_add(size).map_or(true, |end| end > data.len()) {
            return Err(PatcherError::MalformedMachO(format!(
                "fat slice {i} (0x{offset:x}+0x{size:x}) exceeds file length"
            )));
        }
        slices.push((offset, size));
    }
    Ok(Some(slices))
}
