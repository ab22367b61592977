//! Persistent injective map from fixed-size keys to dense `u32` ids.
//!
//! Ids are assigned in strictly increasing insertion order starting at 0
//! and are never reused. The index state hash is the running Keccak-256
//! chain over the inserted key sequence: `H_n = Keccak(H_{n-1} ‖ key_n)`,
//! starting from the zero hash.

use crate::codec::IndexKey;
use crate::error::StoreError;
use crate::memory::MemoryFootprint;
use amber_common::{Hash, H256};
use rustc_hash::FxHashMap;
use sha3::{Digest, Keccak256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const KEYS_FILE: &str = "keys.bin";
const HASH_FILE: &str = "hash.bin";

pub struct Index<K: IndexKey> {
    dir: PathBuf,
    map: FxHashMap<K, u32>,
    /// Keys in insertion order; position is the id.
    keys: Vec<K>,
    /// Running hash over all inserted keys.
    hash: Hash,
    /// Number of keys already appended to the keys file.
    persisted: usize,
}

impl<K: IndexKey> Index<K> {
    /// Opens the index, replaying the key log to rebuild the in-memory
    /// map. The persisted hash checkpoint covers a prefix of the log; the
    /// chain is continued over any keys appended after it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut bytes = Vec::new();
        let keys_path = dir.join(KEYS_FILE);
        if keys_path.exists() {
            File::open(&keys_path)?.read_to_end(&mut bytes)?;
        }
        if bytes.len() % K::SIZE != 0 {
            return Err(StoreError::Corrupted(format!(
                "index key log {keys_path:?} is not a multiple of the key size"
            )));
        }
        let count = bytes.len() / K::SIZE;

        let (checkpoint_count, checkpoint_hash) = read_hash_checkpoint(&dir)?;
        if checkpoint_count > count {
            return Err(StoreError::Corrupted(format!(
                "index hash checkpoint covers {checkpoint_count} keys but the log has {count}"
            )));
        }

        let mut map = FxHashMap::default();
        map.reserve(count);
        let mut keys = Vec::with_capacity(count);
        let mut hash = checkpoint_hash;
        for (id, chunk) in bytes.chunks_exact(K::SIZE).enumerate() {
            let key = K::decode(chunk);
            map.insert(key, id as u32);
            keys.push(key);
            if id >= checkpoint_count {
                hash = chain(hash, chunk);
            }
        }
        debug!(keys = count, "opened index at {dir:?}");

        Ok(Self {
            dir,
            map,
            keys,
            hash,
            persisted: count,
        })
    }

    /// Looks up the id of `key`; absence is not an error.
    pub fn get(&self, key: &K) -> Option<u32> {
        self.map.get(key).copied()
    }

    /// Returns the id of `key`, assigning the next free id on first sight.
    pub fn get_or_add(&mut self, key: K) -> Result<u32, StoreError> {
        if let Some(id) = self.map.get(&key) {
            return Ok(*id);
        }
        let id = u32::try_from(self.keys.len())
            .map_err(|_| StoreError::Corrupted("index id space exhausted".into()))?;
        let mut buf = vec![0u8; K::SIZE];
        key.encode_to(&mut buf);
        self.hash = chain(self.hash, &buf);
        self.map.insert(key, id);
        self.keys.push(key);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key assigned to `id`, if any. Used by snapshots and exports.
    pub fn key_of(&self, id: u32) -> Option<&K> {
        self.keys.get(id as usize)
    }

    /// Current state hash over the full insertion sequence.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Appends unpersisted keys to the log and checkpoints the hash.
    /// Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.persisted < self.keys.len() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(KEYS_FILE))?;
            let mut buf = vec![0u8; K::SIZE];
            for key in &self.keys[self.persisted..] {
                key.encode_to(&mut buf);
                file.write_all(&buf)?;
            }
            file.sync_data()?;
            self.persisted = self.keys.len();
        }
        write_hash_checkpoint(&self.dir, self.keys.len(), self.hash)?;
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let entry = K::SIZE + std::mem::size_of::<u32>();
        MemoryFootprint::new((self.keys.len() * (entry + K::SIZE)) as u64)
    }
}

fn chain(hash: Hash, key_bytes: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(hash.as_bytes());
    hasher.update(key_bytes);
    H256(hasher.finalize().into())
}

fn read_hash_checkpoint(dir: &Path) -> Result<(usize, Hash), StoreError> {
    let path = dir.join(HASH_FILE);
    if !path.exists() {
        return Ok((0, H256::zero()));
    }
    let mut file = File::open(path)?;
    let mut count_buf = [0u8; 8];
    file.read_exact(&mut count_buf)?;
    let mut hash_buf = [0u8; 32];
    file.read_exact(&mut hash_buf)?;
    Ok((u64::from_be_bytes(count_buf) as usize, H256(hash_buf)))
}

fn write_hash_checkpoint(dir: &Path, count: usize, hash: Hash) -> Result<(), StoreError> {
    let mut file = File::create(dir.join(HASH_FILE))?;
    file.write_all(&(count as u64).to_be_bytes())?;
    file.write_all(hash.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_common::Address;
    use tempdir::TempDir;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn ids_are_dense_and_stable() {
        let dir = TempDir::new("index").unwrap();
        let mut index: Index<Address> = Index::open(dir.path()).unwrap();
        assert_eq!(index.get_or_add(addr(1)).unwrap(), 0);
        assert_eq!(index.get_or_add(addr(2)).unwrap(), 1);
        assert_eq!(index.get_or_add(addr(1)).unwrap(), 0);
        assert_eq!(index.get(&addr(2)), Some(1));
        assert_eq!(index.get(&addr(9)), None);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn hash_chains_over_insertions_only() {
        let dir = TempDir::new("index").unwrap();
        let mut index: Index<Address> = Index::open(dir.path()).unwrap();
        let empty = index.hash();
        assert_eq!(empty, H256::zero());

        index.get_or_add(addr(1)).unwrap();
        let after_one = index.hash();
        assert_ne!(after_one, empty);

        // repeated insertion of a known key leaves the hash untouched
        index.get_or_add(addr(1)).unwrap();
        assert_eq!(index.hash(), after_one);

        let mut expected = Keccak256::new();
        expected.update(H256::zero().as_bytes());
        expected.update(addr(1).as_bytes());
        assert_eq!(after_one, H256(expected.finalize().into()));
    }

    #[test]
    fn reopen_restores_ids_and_hash() {
        let dir = TempDir::new("index").unwrap();
        let hash = {
            let mut index: Index<Address> = Index::open(dir.path()).unwrap();
            for byte in 0..100 {
                index.get_or_add(addr(byte)).unwrap();
            }
            index.flush().unwrap();
            index.hash()
        };
        let mut reopened: Index<Address> = Index::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 100);
        assert_eq!(reopened.hash(), hash);
        assert_eq!(reopened.get(&addr(42)), Some(42));
        // new keys continue the id sequence
        assert_eq!(reopened.get_or_add(addr(200)).unwrap(), 100);
    }

    #[test]
    fn reopen_recovers_keys_appended_after_the_last_checkpoint() {
        let dir = TempDir::new("index").unwrap();
        {
            let mut index: Index<Address> = Index::open(dir.path()).unwrap();
            index.get_or_add(addr(1)).unwrap();
            index.flush().unwrap();
            index.get_or_add(addr(2)).unwrap();
            // keys 2 is persisted, checkpoint still covers only key 1
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join(KEYS_FILE))
                .unwrap();
            file.write_all(addr(2).as_bytes()).unwrap();
        }
        let dir2 = TempDir::new("index").unwrap();
        let mut expected: Index<Address> = Index::open(dir2.path()).unwrap();
        expected.get_or_add(addr(1)).unwrap();
        expected.get_or_add(addr(2)).unwrap();

        let reopened: Index<Address> = Index::open(dir.path()).unwrap();
        assert_eq!(reopened.hash(), expected.hash());
        assert_eq!(reopened.get(&addr(2)), Some(1));
    }
}
