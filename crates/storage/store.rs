//! Paged on-disk store of fixed-size values.
//!
//! A store is a flat array `u32 -> V` persisted as fixed-size pages.
//! Unwritten indices read as the zero value of `V`. Every page carries a
//! Keccak-256 hash over its raw bytes; page hashes reduce to a single
//! root through the [`HashTree`].

use crate::codec::FixedValue;
use crate::error::StoreError;
use crate::hashtree::{HashTree, DEFAULT_BRANCHING_FACTOR};
use crate::memory::MemoryFootprint;
use amber_common::{Hash, H256};
use rustc_hash::FxHashMap;
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const DATA_FILE: &str = "data.bin";
const META_FILE: &str = "meta.bin";

/// Target page size in bytes used to derive the per-type item count.
const PAGE_BYTES: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Items per page; `None` derives it from a 4 KiB page.
    pub page_items: Option<usize>,
    /// Branching factor of the hash tree.
    pub branching: usize,
    /// Upper bound on clean pages kept in memory.
    pub cached_pages: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_items: None,
            branching: DEFAULT_BRANCHING_FACTOR,
            cached_pages: 1024,
        }
    }
}

struct Page<V> {
    values: Vec<V>,
}

pub struct PagedStore<V: FixedValue> {
    data: File,
    page_items: usize,
    cached_pages: usize,
    /// One past the highest index ever written.
    items: u32,
    /// Pages currently on disk.
    disk_pages: u32,
    pages: FxHashMap<u32, Page<V>>,
    /// Pages whose bytes differ from disk.
    dirty: BTreeSet<u32>,
    /// Pages whose leaf hash is stale.
    unhashed: BTreeSet<u32>,
    /// Pages `[0, hashed_pages)` have been fed to the tree at least once.
    hashed_pages: u32,
    tree: HashTree,
    meta_path: PathBuf,
}

impl<V: FixedValue> PagedStore<V> {
    pub fn open(
        dir: impl Into<PathBuf>,
        tree_dir: impl Into<PathBuf>,
        opts: StoreOptions,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let page_items = opts.page_items.unwrap_or((PAGE_BYTES / V::SIZE).max(1));

        let meta_path = dir.join(META_FILE);
        let mut items = 0u32;
        let mut hashed_pages = 0u32;
        if meta_path.exists() {
            let (stored_page_items, stored_items, stored_hashed) = read_meta(&meta_path)?;
            if stored_page_items != page_items as u32 {
                return Err(StoreError::UnsupportedConfiguration(format!(
                    "store at {dir:?} was created with {stored_page_items} items per page, \
                     opened with {page_items}"
                )));
            }
            items = stored_items;
            hashed_pages = stored_hashed;
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(DATA_FILE))?;
        let page_bytes = (page_items * V::SIZE) as u64;
        let disk_pages = (data.metadata()?.len() / page_bytes) as u32;

        Ok(Self {
            data,
            page_items,
            cached_pages: opts.cached_pages.max(1),
            items,
            disk_pages,
            pages: FxHashMap::default(),
            dirty: BTreeSet::new(),
            unhashed: BTreeSet::new(),
            hashed_pages,
            tree: HashTree::open(tree_dir, opts.branching)?,
            meta_path,
        })
    }

    fn page_bytes(&self) -> usize {
        self.page_items * V::SIZE
    }

    fn page_count(&self) -> u32 {
        (self.items as u64).div_ceil(self.page_items as u64) as u32
    }

    fn load_page(&mut self, page: u32) -> Result<&mut Page<V>, StoreError> {
        if !self.pages.contains_key(&page) {
            self.evict_if_full();
            let values = if page < self.disk_pages {
                let mut buf = vec![0u8; self.page_bytes()];
                self.data
                    .seek(SeekFrom::Start(page as u64 * self.page_bytes() as u64))?;
                self.data.read_exact(&mut buf)?;
                buf.chunks_exact(V::SIZE)
                    .map(V::decode)
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                vec![V::default(); self.page_items]
            };
            self.pages.insert(page, Page { values });
        }
        self.pages
            .get_mut(&page)
            .ok_or_else(|| StoreError::Corrupted("page vanished from the cache".into()))
    }

    /// Drops one clean, hashed page when the cache is over capacity.
    fn evict_if_full(&mut self) {
        if self.pages.len() < self.cached_pages {
            return;
        }
        let candidate = self
            .pages
            .keys()
            .copied()
            .find(|p| !self.dirty.contains(p) && !self.unhashed.contains(p));
        if let Some(page) = candidate {
            self.pages.remove(&page);
        }
    }

    /// One past the highest index ever written.
    pub fn len(&self) -> u32 {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn get(&mut self, index: u32) -> Result<V, StoreError> {
        if index >= self.items {
            return Ok(V::default());
        }
        let page_items = self.page_items;
        let page = self.load_page(index / page_items as u32)?;
        Ok(page.values[index as usize % page_items].clone())
    }

    pub fn set(&mut self, index: u32, value: V) -> Result<(), StoreError> {
        let page_items = self.page_items;
        let page_index = index / page_items as u32;
        let page = self.load_page(page_index)?;
        page.values[index as usize % page_items] = value;
        self.dirty.insert(page_index);
        self.unhashed.insert(page_index);
        if index >= self.items {
            self.items = index + 1;
        }
        Ok(())
    }

    fn encode_page(&mut self, page: u32) -> Result<Vec<u8>, StoreError> {
        let page_bytes = self.page_bytes();
        let size = V::SIZE;
        let values = &self.load_page(page)?.values;
        let mut buf = vec![0u8; page_bytes];
        for (i, value) in values.iter().enumerate() {
            value.encode_to(&mut buf[i * size..(i + 1) * size]);
        }
        Ok(buf)
    }

    /// Brings leaf hashes up to date and returns the store root.
    ///
    /// Covers dirty pages plus any page that has never been hashed, so
    /// that stores with identical content hash identically regardless of
    /// the write pattern that produced them.
    pub fn hash(&mut self) -> Result<Hash, StoreError> {
        let mut stale: BTreeSet<u32> = std::mem::take(&mut self.unhashed);
        for page in self.hashed_pages..self.page_count() {
            stale.insert(page);
        }
        for page in stale {
            let bytes = self.encode_page(page)?;
            let hash = H256(Keccak256::digest(&bytes).into());
            self.tree.set_page_hash(page as usize, hash);
        }
        self.hashed_pages = self.page_count();
        Ok(self.tree.commit())
    }

    /// Writes dirty pages, the hash tree and the store metadata.
    /// Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.hash()?;
        let dirty = std::mem::take(&mut self.dirty);
        for page in dirty {
            let bytes = self.encode_page(page)?;
            self.data
                .seek(SeekFrom::Start(page as u64 * self.page_bytes() as u64))?;
            self.data.write_all(&bytes)?;
            self.disk_pages = self.disk_pages.max(page + 1);
        }
        self.data.sync_data()?;
        self.tree.flush()?;
        write_meta(
            &self.meta_path,
            self.page_items as u32,
            self.items,
            self.hashed_pages,
        )?;
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let pages = (self.pages.len() * self.page_bytes()) as u64;
        MemoryFootprint::new(pages).with_child("hashtree", self.tree.memory_footprint())
    }
}

fn read_meta(path: &Path) -> Result<(u32, u32, u32), StoreError> {
    let mut buf = [0u8; 12];
    File::open(path)?.read_exact(&mut buf)?;
    let mut field = [0u8; 4];
    field.copy_from_slice(&buf[0..4]);
    let page_items = u32::from_be_bytes(field);
    field.copy_from_slice(&buf[4..8]);
    let items = u32::from_be_bytes(field);
    field.copy_from_slice(&buf[8..12]);
    let hashed_pages = u32::from_be_bytes(field);
    Ok((page_items, items, hashed_pages))
}

fn write_meta(path: &Path, page_items: u32, items: u32, hashed_pages: u32) -> Result<(), StoreError> {
    let mut file = File::create(path)?;
    file.write_all(&page_items.to_be_bytes())?;
    file.write_all(&items.to_be_bytes())?;
    file.write_all(&hashed_pages.to_be_bytes())?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_common::Balance;
    use tempdir::TempDir;

    fn open_store(dir: &TempDir, opts: StoreOptions) -> PagedStore<Balance> {
        PagedStore::open(dir.path().join("data"), dir.path().join("tree"), opts).unwrap()
    }

    fn small_opts() -> StoreOptions {
        StoreOptions {
            page_items: Some(4),
            branching: 2,
            cached_pages: 1024,
        }
    }

    #[test]
    fn unwritten_indices_read_as_zero() {
        let dir = TempDir::new("store").unwrap();
        let mut store = open_store(&dir, small_opts());
        assert_eq!(store.get(0).unwrap(), Balance::zero());
        assert_eq!(store.get(1_000_000).unwrap(), Balance::zero());
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = TempDir::new("store").unwrap();
        let mut store = open_store(&dir, small_opts());
        store.set(7, Balance::from(42u64)).unwrap();
        assert_eq!(store.get(7).unwrap(), Balance::from(42u64));
        assert_eq!(store.get(6).unwrap(), Balance::zero());
    }

    #[test]
    fn flush_and_reopen_preserves_content_and_hash() {
        let dir = TempDir::new("store").unwrap();
        let hash = {
            let mut store = open_store(&dir, small_opts());
            for i in 0..23 {
                store.set(i, Balance::from(i as u64 + 1)).unwrap();
            }
            store.flush().unwrap();
            store.hash().unwrap()
        };
        let mut reopened = open_store(&dir, small_opts());
        for i in 0..23 {
            assert_eq!(reopened.get(i).unwrap(), Balance::from(i as u64 + 1));
        }
        assert_eq!(reopened.hash().unwrap(), hash);
    }

    #[test]
    fn hash_is_independent_of_write_order() {
        let dir_a = TempDir::new("store").unwrap();
        let dir_b = TempDir::new("store").unwrap();
        let mut a = open_store(&dir_a, small_opts());
        let mut b = open_store(&dir_b, small_opts());

        a.set(0, Balance::from(1u64)).unwrap();
        a.set(9, Balance::from(2u64)).unwrap();

        b.set(9, Balance::from(2u64)).unwrap();
        b.hash().unwrap();
        b.set(0, Balance::from(1u64)).unwrap();

        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
    }

    #[test]
    fn hash_changes_when_content_changes() {
        let dir = TempDir::new("store").unwrap();
        let mut store = open_store(&dir, small_opts());
        store.set(3, Balance::from(1u64)).unwrap();
        let before = store.hash().unwrap();
        store.set(3, Balance::from(2u64)).unwrap();
        assert_ne!(store.hash().unwrap(), before);
    }

    #[test]
    fn eviction_keeps_reads_correct() {
        let dir = TempDir::new("store").unwrap();
        let mut store = open_store(
            &dir,
            StoreOptions {
                page_items: Some(2),
                branching: 2,
                cached_pages: 2,
            },
        );
        for i in 0..64 {
            store.set(i, Balance::from(i as u64 + 7)).unwrap();
        }
        store.flush().unwrap();
        for i in (0..64).rev() {
            assert_eq!(store.get(i).unwrap(), Balance::from(i as u64 + 7));
        }
    }

    #[test]
    fn random_contents_survive_flush_and_reopen() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(0xA3BE);
        let expected: Vec<(u32, Balance)> = (0..500)
            .map(|_| {
                (
                    rng.gen_range(0..10_000u32),
                    Balance::from(rng.gen::<u128>()),
                )
            })
            .collect();

        let dir = TempDir::new("store").unwrap();
        {
            let mut store = open_store(&dir, StoreOptions::default());
            for (index, value) in &expected {
                store.set(*index, *value).unwrap();
            }
            store.flush().unwrap();
        }
        let mut reopened = open_store(&dir, StoreOptions::default());
        // later writes win for duplicate indices
        let mut last = std::collections::HashMap::new();
        for (index, value) in &expected {
            last.insert(*index, *value);
        }
        for (index, value) in last {
            assert_eq!(reopened.get(index).unwrap(), value);
        }
    }

    #[test]
    fn mismatched_page_size_is_rejected() {
        let dir = TempDir::new("store").unwrap();
        {
            let mut store = open_store(&dir, small_opts());
            store.set(0, Balance::from(1u64)).unwrap();
            store.flush().unwrap();
        }
        let result: Result<PagedStore<Balance>, _> = PagedStore::open(
            dir.path().join("data"),
            dir.path().join("tree"),
            StoreOptions {
                page_items: Some(8),
                branching: 2,
                cached_pages: 16,
            },
        );
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedConfiguration(_))
        ));
    }
}
