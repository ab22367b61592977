//! Append-only depot of variable-length byte strings (contract codes).
//!
//! Bodies are appended to a payload file; a dense offset table maps each
//! id to its latest `(offset, len)` record. Ids are grouped into
//! fixed-size hash groups; a group hashes as the Keccak-256 of the
//! length-prefixed concatenation of its items, and group hashes reduce
//! through the [`HashTree`].

use crate::error::StoreError;
use crate::hashtree::{HashTree, DEFAULT_BRANCHING_FACTOR};
use crate::memory::MemoryFootprint;
use amber_common::{Bytes, Hash, H256};
use rustc_hash::FxHashMap;
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "data.bin";
const OFFSETS_FILE: &str = "offsets.bin";
const META_FILE: &str = "meta.bin";

const OFFSET_RECORD: usize = 12;

#[derive(Clone, Copy, Debug)]
pub struct DepotOptions {
    /// Items per hash group.
    pub group_items: usize,
    /// Branching factor of the hash tree.
    pub branching: usize,
}

impl Default for DepotOptions {
    fn default() -> Self {
        Self {
            group_items: 32,
            branching: DEFAULT_BRANCHING_FACTOR,
        }
    }
}

pub struct Depot {
    data: File,
    data_len: u64,
    offsets_path: PathBuf,
    meta_path: PathBuf,
    /// Per-id `(offset, len)` of the latest body.
    offsets: Vec<(u64, u32)>,
    dirty_offsets: BTreeSet<u32>,
    cache: FxHashMap<u32, Bytes>,
    group_items: usize,
    unhashed_groups: BTreeSet<u32>,
    hashed_groups: u32,
    tree: HashTree,
}

impl Depot {
    pub fn open(
        dir: impl Into<PathBuf>,
        tree_dir: impl Into<PathBuf>,
        opts: DepotOptions,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta_path = dir.join(META_FILE);
        let mut hashed_groups = 0u32;
        if meta_path.exists() {
            let (stored_group_items, stored_hashed) = read_meta(&meta_path)?;
            if stored_group_items != opts.group_items as u32 {
                return Err(StoreError::UnsupportedConfiguration(format!(
                    "depot at {dir:?} was created with {stored_group_items} items per group, \
                     opened with {}",
                    opts.group_items
                )));
            }
            hashed_groups = stored_hashed;
        }

        let offsets_path = dir.join(OFFSETS_FILE);
        let mut offsets = Vec::new();
        if offsets_path.exists() {
            let mut bytes = Vec::new();
            File::open(&offsets_path)?.read_to_end(&mut bytes)?;
            if bytes.len() % OFFSET_RECORD != 0 {
                return Err(StoreError::Corrupted(format!(
                    "depot offset table {offsets_path:?} is not a multiple of the record size"
                )));
            }
            offsets.reserve(bytes.len() / OFFSET_RECORD);
            for record in bytes.chunks_exact(OFFSET_RECORD) {
                let mut off = [0u8; 8];
                off.copy_from_slice(&record[..8]);
                let mut len = [0u8; 4];
                len.copy_from_slice(&record[8..]);
                offsets.push((u64::from_be_bytes(off), u32::from_be_bytes(len)));
            }
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;
        let data_len = data.metadata()?.len();

        Ok(Self {
            data,
            data_len,
            offsets_path,
            meta_path,
            offsets,
            dirty_offsets: BTreeSet::new(),
            cache: FxHashMap::default(),
            group_items: opts.group_items,
            unhashed_groups: BTreeSet::new(),
            hashed_groups,
            tree: HashTree::open(tree_dir, opts.branching)?,
        })
    }

    /// One past the highest id ever set.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn size(&self, id: u32) -> u32 {
        self.offsets.get(id as usize).map(|(_, len)| *len).unwrap_or(0)
    }

    pub fn get(&mut self, id: u32) -> Result<Bytes, StoreError> {
        if let Some(body) = self.cache.get(&id) {
            return Ok(body.clone());
        }
        let Some(&(offset, len)) = self.offsets.get(id as usize) else {
            return Ok(Bytes::new());
        };
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.data.seek(SeekFrom::Start(offset))?;
        self.data.read_exact(&mut buf)?;
        let body = Bytes::from(buf);
        self.cache.insert(id, body.clone());
        Ok(body)
    }

    /// Stores a new body for `id`, superseding any previous one. Old
    /// bodies stay in the payload file; the offset table is the truth.
    pub fn set(&mut self, id: u32, body: Bytes) -> Result<(), StoreError> {
        let offset = self.data_len;
        self.data.seek(SeekFrom::Start(offset))?;
        self.data.write_all(&body)?;
        self.data_len += body.len() as u64;

        if self.offsets.len() <= id as usize {
            let grow_from = self.offsets.len() as u32;
            self.offsets.resize(id as usize + 1, (0, 0));
            for fresh in grow_from..=id {
                self.dirty_offsets.insert(fresh);
            }
        }
        self.offsets[id as usize] = (offset, body.len() as u32);
        self.dirty_offsets.insert(id);
        self.cache.insert(id, body);
        self.unhashed_groups.insert(id / self.group_items as u32);
        Ok(())
    }

    fn group_count(&self) -> u32 {
        (self.offsets.len() as u64).div_ceil(self.group_items as u64) as u32
    }

    /// Brings group hashes up to date and returns the depot root.
    pub fn hash(&mut self) -> Result<Hash, StoreError> {
        let mut stale: BTreeSet<u32> = std::mem::take(&mut self.unhashed_groups);
        for group in self.hashed_groups..self.group_count() {
            stale.insert(group);
        }
        for group in stale {
            let start = group * self.group_items as u32;
            let end = ((group + 1) * self.group_items as u32).min(self.offsets.len() as u32);
            let mut hasher = Keccak256::new();
            for id in start..end {
                let body = self.get(id)?;
                hasher.update((body.len() as u32).to_be_bytes());
                hasher.update(&body);
            }
            self.tree
                .set_page_hash(group as usize, H256(hasher.finalize().into()));
        }
        self.hashed_groups = self.group_count();
        Ok(self.tree.commit())
    }

    /// Persists dirty offset records, the hash tree and metadata.
    /// Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.hash()?;
        self.data.sync_data()?;
        if !self.dirty_offsets.is_empty() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.offsets_path)?;
            for id in std::mem::take(&mut self.dirty_offsets) {
                let (offset, len) = self.offsets[id as usize];
                let mut record = [0u8; OFFSET_RECORD];
                record[..8].copy_from_slice(&offset.to_be_bytes());
                record[8..].copy_from_slice(&len.to_be_bytes());
                file.seek(SeekFrom::Start(id as u64 * OFFSET_RECORD as u64))?;
                file.write_all(&record)?;
            }
            file.sync_data()?;
        }
        self.tree.flush()?;
        write_meta(&self.meta_path, self.group_items as u32, self.hashed_groups)?;
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let offsets = (self.offsets.len() * OFFSET_RECORD) as u64;
        let cached: u64 = self.cache.values().map(|b| b.len() as u64).sum();
        MemoryFootprint::new(offsets + cached).with_child("hashtree", self.tree.memory_footprint())
    }
}

fn read_meta(path: &Path) -> Result<(u32, u32), StoreError> {
    let mut buf = [0u8; 8];
    File::open(path)?.read_exact(&mut buf)?;
    let mut field = [0u8; 4];
    field.copy_from_slice(&buf[0..4]);
    let group_items = u32::from_be_bytes(field);
    field.copy_from_slice(&buf[4..8]);
    let hashed_groups = u32::from_be_bytes(field);
    Ok((group_items, hashed_groups))
}

fn write_meta(path: &Path, group_items: u32, hashed_groups: u32) -> Result<(), StoreError> {
    let mut file = File::create(path)?;
    file.write_all(&group_items.to_be_bytes())?;
    file.write_all(&hashed_groups.to_be_bytes())?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_depot(dir: &TempDir) -> Depot {
        Depot::open(
            dir.path().join("data"),
            dir.path().join("tree"),
            DepotOptions {
                group_items: 2,
                branching: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn unset_ids_read_as_empty() {
        let dir = TempDir::new("depot").unwrap();
        let mut depot = open_depot(&dir);
        assert_eq!(depot.get(5).unwrap(), Bytes::new());
        assert_eq!(depot.size(5), 0);
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = TempDir::new("depot").unwrap();
        let mut depot = open_depot(&dir);
        depot.set(0, Bytes::from_static(b"hello")).unwrap();
        depot.set(3, Bytes::from_static(b"code")).unwrap();
        assert_eq!(depot.get(0).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(depot.get(3).unwrap(), Bytes::from_static(b"code"));
        assert_eq!(depot.size(3), 4);
        assert_eq!(depot.get(1).unwrap(), Bytes::new());
    }

    #[test]
    fn overwriting_uses_the_latest_body() {
        let dir = TempDir::new("depot").unwrap();
        let mut depot = open_depot(&dir);
        depot.set(0, Bytes::from_static(b"first")).unwrap();
        depot.set(0, Bytes::from_static(b"second")).unwrap();
        assert_eq!(depot.get(0).unwrap(), Bytes::from_static(b"second"));
    }

    #[test]
    fn flush_and_reopen_preserves_bodies_and_hash() {
        let dir = TempDir::new("depot").unwrap();
        let hash = {
            let mut depot = open_depot(&dir);
            for id in 0..9 {
                depot.set(id, Bytes::from(vec![id as u8; id as usize + 1])).unwrap();
            }
            depot.flush().unwrap();
            depot.hash().unwrap()
        };
        let mut reopened = open_depot(&dir);
        for id in 0..9 {
            assert_eq!(
                reopened.get(id).unwrap(),
                Bytes::from(vec![id as u8; id as usize + 1])
            );
        }
        assert_eq!(reopened.hash().unwrap(), hash);
    }

    #[test]
    fn hash_depends_on_content_not_write_history() {
        let dir_a = TempDir::new("depot").unwrap();
        let dir_b = TempDir::new("depot").unwrap();
        let mut a = open_depot(&dir_a);
        let mut b = open_depot(&dir_b);

        a.set(0, Bytes::from_static(b"x")).unwrap();
        a.set(0, Bytes::from_static(b"final")).unwrap();
        a.set(1, Bytes::from_static(b"y")).unwrap();

        b.set(1, Bytes::from_static(b"y")).unwrap();
        b.hash().unwrap();
        b.set(0, Bytes::from_static(b"final")).unwrap();

        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn empty_body_is_distinct_from_unset_only_in_length_table() {
        let dir = TempDir::new("depot").unwrap();
        let mut depot = open_depot(&dir);
        depot.set(0, Bytes::new()).unwrap();
        assert_eq!(depot.size(0), 0);
        assert_eq!(depot.get(0).unwrap(), Bytes::new());
        assert_eq!(depot.len(), 1);
    }
}
