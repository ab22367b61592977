//! Reverse map from account ids to the slot ids holding their storage.
//!
//! Lets account deletion clear exactly the slots that are currently
//! non-zero without scanning the value store. Derived data: not part of
//! the composed root hash.

use crate::error::StoreError;
use crate::memory::MemoryFootprint;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;

const PAIRS_FILE: &str = "pairs.bin";

pub struct MultiMap {
    dir: PathBuf,
    map: FxHashMap<u32, BTreeSet<u32>>,
    dirty: bool,
}

impl MultiMap {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut map: FxHashMap<u32, BTreeSet<u32>> = FxHashMap::default();
        let path = dir.join(PAIRS_FILE);
        if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            if bytes.len() % 8 != 0 {
                return Err(StoreError::Corrupted(format!(
                    "multimap pair file {path:?} is not a multiple of 8 bytes"
                )));
            }
            for pair in bytes.chunks_exact(8) {
                let mut k = [0u8; 4];
                let mut v = [0u8; 4];
                k.copy_from_slice(&pair[..4]);
                v.copy_from_slice(&pair[4..]);
                map.entry(u32::from_be_bytes(k))
                    .or_default()
                    .insert(u32::from_be_bytes(v));
            }
        }
        Ok(Self {
            dir,
            map,
            dirty: false,
        })
    }

    pub fn insert(&mut self, key: u32, value: u32) {
        if self.map.entry(key).or_default().insert(value) {
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, key: u32, value: u32) {
        if let Some(values) = self.map.get_mut(&key) {
            if values.remove(&value) {
                self.dirty = true;
                if values.is_empty() {
                    self.map.remove(&key);
                }
            }
        }
    }

    /// Removes and returns all values of `key`, ascending.
    pub fn remove_all(&mut self, key: u32) -> Vec<u32> {
        match self.map.remove(&key) {
            Some(values) => {
                self.dirty = true;
                values.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn contains(&self, key: u32, value: u32) -> bool {
        self.map.get(&key).is_some_and(|values| values.contains(&value))
    }

    /// Rewrites the pair file in sorted order. Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let mut keys: Vec<u32> = self.map.keys().copied().collect();
        keys.sort_unstable();
        let mut writer = BufWriter::new(File::create(self.dir.join(PAIRS_FILE))?);
        for key in keys {
            for value in &self.map[&key] {
                writer.write_all(&key.to_be_bytes())?;
                writer.write_all(&value.to_be_bytes())?;
            }
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_data()?;
        self.dirty = false;
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let pairs: usize = self.map.values().map(BTreeSet::len).sum();
        MemoryFootprint::new((pairs * 8) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn insert_and_membership() {
        let dir = TempDir::new("multimap").unwrap();
        let mut map = MultiMap::open(dir.path()).unwrap();
        map.insert(1, 10);
        map.insert(1, 11);
        map.insert(2, 20);
        assert!(map.contains(1, 10));
        assert!(!map.contains(1, 20));
    }

    #[test]
    fn remove_all_returns_sorted_values() {
        let dir = TempDir::new("multimap").unwrap();
        let mut map = MultiMap::open(dir.path()).unwrap();
        map.insert(7, 30);
        map.insert(7, 10);
        map.insert(7, 20);
        assert_eq!(map.remove_all(7), vec![10, 20, 30]);
        assert_eq!(map.remove_all(7), Vec::<u32>::new());
        assert!(!map.contains(7, 10));
    }

    #[test]
    fn remove_single_value() {
        let dir = TempDir::new("multimap").unwrap();
        let mut map = MultiMap::open(dir.path()).unwrap();
        map.insert(1, 10);
        map.insert(1, 11);
        map.remove(1, 10);
        assert!(!map.contains(1, 10));
        assert!(map.contains(1, 11));
    }

    #[test]
    fn flush_and_reopen_round_trips() {
        let dir = TempDir::new("multimap").unwrap();
        {
            let mut map = MultiMap::open(dir.path()).unwrap();
            for key in 0..10 {
                for value in 0..5 {
                    map.insert(key, key * 100 + value);
                }
            }
            map.flush().unwrap();
        }
        let mut reopened = MultiMap::open(dir.path()).unwrap();
        assert!(reopened.contains(3, 304));
        assert_eq!(reopened.remove_all(9), vec![900, 901, 902, 903, 904]);
    }
}
