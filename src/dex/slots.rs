use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PatcherError, Result};

pub const PRIMARY_DEX: &str = "classes.dex";

/// File name for a dex slot: 1 is `classes.dex`, n >= 2 is `classes{n}.dex`.
pub fn slot_file_name(slot: u32) -> String {
    if slot <= 1 {
        PRIMARY_DEX.to_string()
    } else {
        format!("classes{slot}.dex")
    }
}

fn parse_slot(name: &str) -> Option<u32> {
    let middle = name.strip_prefix("classes")?.strip_suffix(".dex")?;
    if middle.is_empty() {
        return Some(1);
    }
    if middle.starts_with('0') || !middle.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match middle.parse::<u32>() {
        Ok(n) if n >= 2 => Some(n),
        _ => None,
    }
}

/// Dex payloads at the root of a decoded APK, keyed by slot.
#[derive(Clone, Debug, Default)]
pub struct DexSet {
    slots: BTreeMap<u32, PathBuf>,
}

impl DexSet {
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = fs::read_dir(dir).map_err(|e| PatcherError::from_io_error(dir, e))?;
        let mut slots = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| PatcherError::from_io_error(dir, e))?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(slot) = entry.file_name().to_str().and_then(parse_slot) {
                slots.insert(slot, entry.path());
            }
        }
        Ok(Self { slots })
    }

    #[cfg(test)]
    pub(crate) fn from_slots(slots: &[u32]) -> Self {
        Self {
            slots: slots
                .iter()
                .map(|&n| (n, PathBuf::from(slot_file_name(n))))
                .collect(),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.slots.contains_key(&1)
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.slots.contains_key(&slot)
    }

    /// First unused slot counting up from 2.
    pub fn next_free_slot(&self) -> u32 {
        let mut slot = 2;
        while self.slots.contains_key(&slot) {
            slot += 1;
        }
        slot
    }

    /// Record a slot as taken after a payload was written there.
    pub fn occupy(&mut self, slot: u32, path: PathBuf) {
        self.slots.insert(slot, path);
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.slots.values().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
