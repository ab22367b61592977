//! Persistent k-ary Merkle reduction over page hashes.
//!
//! Layer 0 holds one hash per page; every parent is the Keccak-256 of its
//! up-to-`branching` children concatenated, children grouped by integer
//! division of their index. Layers are persisted one file per layer, each
//! a dense sequence of 32-byte hashes.

use crate::error::StoreError;
use crate::memory::MemoryFootprint;
use amber_common::{Hash, H256};
use sha3::{Digest, Keccak256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;

pub const DEFAULT_BRANCHING_FACTOR: usize = 32;

pub struct HashTree {
    dir: PathBuf,
    branching: usize,
    /// layers[0] are the page hashes; the last layer has at most one entry.
    layers: Vec<Vec<Hash>>,
    /// Leaf indices changed since the last commit.
    dirty: BTreeSet<usize>,
}

impl HashTree {
    pub fn open(dir: impl Into<PathBuf>, branching: usize) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut layers = Vec::new();
        loop {
            let path = dir.join(format!("layer_{}", layers.len()));
            if !path.exists() {
                break;
            }
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            if bytes.len() % 32 != 0 {
                return Err(StoreError::Corrupted(format!(
                    "hash tree layer file {path:?} is not a multiple of 32 bytes"
                )));
            }
            let layer = bytes.chunks_exact(32).map(H256::from_slice).collect();
            layers.push(layer);
        }
        Ok(Self {
            dir,
            branching,
            layers,
            dirty: BTreeSet::new(),
        })
    }

    /// Number of leaf (page) hashes.
    pub fn page_count(&self) -> usize {
        self.layers.first().map(Vec::len).unwrap_or(0)
    }

    pub fn set_page_hash(&mut self, page: usize, hash: Hash) {
        if self.layers.is_empty() {
            self.layers.push(Vec::new());
        }
        let leaves = &mut self.layers[0];
        if page >= leaves.len() {
            leaves.resize(page + 1, H256::zero());
        }
        if leaves[page] != hash {
            leaves[page] = hash;
            self.dirty.insert(page);
        }
    }

    /// Recomputes the parents of all dirty nodes and returns the root.
    pub fn commit(&mut self) -> Hash {
        if self.page_count() == 0 {
            self.dirty.clear();
            return H256::zero();
        }
        let mut dirty = std::mem::take(&mut self.dirty);
        let mut level = 0;
        while self.layers[level].len() > 1 {
            let child_count = self.layers[level].len();
            let parent_count = child_count.div_ceil(self.branching);
            if self.layers.len() == level + 1 {
                self.layers.push(Vec::new());
            }
            let grew = self.layers[level + 1].len() != parent_count;
            if grew {
                self.layers[level + 1].resize(parent_count, H256::zero());
                // A resize moves group boundaries of the last parent, so
                // recompute it even if none of its children changed.
                dirty.insert(child_count - 1);
            }
            let parents: BTreeSet<usize> = dirty.iter().map(|i| i / self.branching).collect();
            for &parent in &parents {
                let start = parent * self.branching;
                let end = (start + self.branching).min(child_count);
                let mut hasher = Keccak256::new();
                for child in &self.layers[level][start..end] {
                    hasher.update(child.as_bytes());
                }
                self.layers[level + 1][parent] = H256(hasher.finalize().into());
            }
            dirty = parents;
            level += 1;
        }
        self.layers[level][0]
    }

    /// Commits and persists every layer. Idempotent.
    pub fn flush(&mut self) -> Result<Hash, StoreError> {
        let root = self.commit();
        for (level, layer) in self.layers.iter().enumerate() {
            let path = self.dir.join(format!("layer_{level}"));
            let mut file = File::create(path)?;
            for hash in layer {
                file.write_all(hash.as_bytes())?;
            }
            file.sync_data()?;
        }
        Ok(root)
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let bytes = self
            .layers
            .iter()
            .map(|layer| (layer.len() * 32) as u64)
            .sum::<u64>();
        MemoryFootprint::new(bytes)
    }
}
