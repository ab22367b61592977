//! Append-only, block-indexed history of every committed update.
//!
//! On disk the archive is an update log plus a fixed-record block index;
//! the whole history is additionally indexed in memory as per-account
//! version lists, rebuilt on open by replaying the log. Point-in-time
//! reads resolve to the value as of the highest committed block at or
//! below the queried block.
//!
//! Every block chains an archive hash:
//! `AH_b = Keccak(AH_prev ‖ canonical-encoding(update_b))`.
//!
//! Failures are sticky: once an I/O or corruption error is observed, the
//! archive is invalidated and every later call reports the original
//! failure until the process restarts.

use crate::error::ArchiveError;
use crate::memory::MemoryFootprint;
use amber_common::constants::EMPTY_CODE_HASH;
use amber_common::types::Update;
use amber_common::utils::keccak;
use amber_common::{Address, Balance, BlockNumber, Bytes, Hash, Key, Nonce, Value, H256};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const LOG_FILE: &str = "updates.log";
const IDX_FILE: &str = "blocks.idx";

/// block + offset + len + chain hash + live-root hint
const IDX_RECORD: usize = 8 + 8 + 4 + 32 + 32;

#[derive(Clone, Copy, Debug)]
struct BlockRecord {
    block: BlockNumber,
    offset: u64,
    len: u32,
    hash: Hash,
    #[allow(dead_code)] // recorded for operators; not consulted on reads
    hint: Hash,
}

#[derive(Default)]
struct AccountHistory {
    existence: Vec<(BlockNumber, bool)>,
    balances: Vec<(BlockNumber, Balance)>,
    nonces: Vec<(BlockNumber, Nonce)>,
    codes: Vec<(BlockNumber, Bytes)>,
    slots: FxHashMap<Key, Vec<(BlockNumber, Value)>>,
}

struct Inner {
    log: File,
    log_len: u64,
    idx: File,
    blocks: Vec<BlockRecord>,
    accounts: FxHashMap<Address, AccountHistory>,
    failure: Option<String>,
}

/// Shared archive handle. Clones share one underlying archive; the
/// background writer owns the only code path that appends.
#[derive(Clone)]
pub struct Archive {
    inner: Arc<RwLock<Inner>>,
}

impl Archive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut idx = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(IDX_FILE))?;
        let mut idx_bytes = Vec::new();
        idx.read_to_end(&mut idx_bytes)?;
        if idx_bytes.len() % IDX_RECORD != 0 {
            return Err(ArchiveError::Corrupted(
                "block index is not a multiple of the record size".into(),
            ));
        }

        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOG_FILE))?;
        let log_len = log.metadata()?.len();

        let mut blocks = Vec::with_capacity(idx_bytes.len() / IDX_RECORD);
        let mut accounts: FxHashMap<Address, AccountHistory> = FxHashMap::default();
        let mut chain = H256::zero();
        for record in idx_bytes.chunks_exact(IDX_RECORD) {
            let record = decode_idx_record(record);
            if record.offset + record.len as u64 > log_len {
                return Err(ArchiveError::Corrupted(format!(
                    "block {} update extends past the end of the log",
                    record.block
                )));
            }
            let mut bytes = vec![0u8; record.len as usize];
            log.seek(SeekFrom::Start(record.offset))?;
            log.read_exact(&mut bytes)?;
            let update: Update = bincode::deserialize(&bytes).map_err(|err| {
                ArchiveError::Corrupted(format!(
                    "undecodable update for block {}: {err}",
                    record.block
                ))
            })?;
            chain = chain_hash(chain, &update);
            if chain != record.hash {
                return Err(ArchiveError::Corrupted(format!(
                    "archive hash chain broken at block {}",
                    record.block
                )));
            }
            index_update(&mut accounts, record.block, &update);
            blocks.push(record);
        }
        debug!(blocks = blocks.len(), "opened archive at {dir:?}");

        Ok(Self {
            inner: Arc::new(RwLock::new(Inner {
                log,
                log_len,
                idx,
                blocks,
                accounts,
                failure: None,
            })),
        })
    }

    /// Records the update for `block`, which must strictly exceed every
    /// previously added block.
    pub fn add(
        &self,
        block: BlockNumber,
        update: &Update,
        hint: Option<Hash>,
    ) -> Result<(), ArchiveError> {
        let mut inner = self.inner.write().map_err(|_| ArchiveError::Lock)?;
        if let Some(failure) = &inner.failure {
            return Err(ArchiveError::Invalidated(failure.clone()));
        }
        if let Some(last) = inner.blocks.last() {
            if block <= last.block {
                return Err(ArchiveError::NonMonotonicBlock {
                    got: block,
                    last: last.block,
                });
            }
        }

        let result = inner.append(block, update, hint);
        if let Err(err) = &result {
            error!("archive append for block {block} failed: {err}");
            inner.failure = Some(err.to_string());
        }
        result
    }

    /// Height of the archive, `None` while empty.
    pub fn block_height(&self) -> Result<Option<BlockNumber>, ArchiveError> {
        let inner = self.read()?;
        Ok(inner.blocks.last().map(|record| record.block))
    }

    pub fn exists(&self, block: BlockNumber, address: &Address) -> Result<bool, ArchiveError> {
        let inner = self.read()?;
        Ok(inner
            .history(address)
            .and_then(|h| last_at(&h.existence, block))
            .unwrap_or(false))
    }

    pub fn balance(&self, block: BlockNumber, address: &Address) -> Result<Balance, ArchiveError> {
        let inner = self.read()?;
        Ok(inner
            .history(address)
            .and_then(|h| last_at(&h.balances, block))
            .unwrap_or_else(Balance::zero))
    }

    pub fn nonce(&self, block: BlockNumber, address: &Address) -> Result<Nonce, ArchiveError> {
        let inner = self.read()?;
        Ok(inner
            .history(address)
            .and_then(|h| last_at(&h.nonces, block))
            .unwrap_or(0))
    }

    pub fn code(&self, block: BlockNumber, address: &Address) -> Result<Bytes, ArchiveError> {
        let inner = self.read()?;
        Ok(inner
            .history(address)
            .and_then(|h| last_at(&h.codes, block))
            .unwrap_or_default())
    }

    pub fn storage(
        &self,
        block: BlockNumber,
        address: &Address,
        key: &Key,
    ) -> Result<Value, ArchiveError> {
        let inner = self.read()?;
        Ok(inner
            .history(address)
            .and_then(|h| h.slots.get(key))
            .and_then(|versions| last_at(versions, block))
            .unwrap_or_else(Value::zero))
    }

    /// The archive hash as of the highest committed block ≤ `block`.
    pub fn hash(&self, block: BlockNumber) -> Result<Hash, ArchiveError> {
        let inner = self.read()?;
        let pos = inner
            .blocks
            .partition_point(|record| record.block <= block);
        if pos == 0 {
            return Err(ArchiveError::UnknownBlock(block));
        }
        Ok(inner.blocks[pos - 1].hash)
    }

    /// Builds a self-contained witness of an account's state at `block`,
    /// verifiable against [`Self::hash`] for the same block.
    pub fn create_witness_proof(
        &self,
        block: BlockNumber,
        address: &Address,
        keys: &[Key],
        token: &CancellationToken,
    ) -> Result<WitnessProof, ArchiveError> {
        let archive_hash = self.hash(block)?;
        let inner = self.read()?;
        if token.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let history = inner.history(address);
        let code = history
            .and_then(|h| last_at(&h.codes, block))
            .unwrap_or_default();
        let mut slots = Vec::with_capacity(keys.len());
        for key in keys {
            if token.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let value = history
                .and_then(|h| h.slots.get(key))
                .and_then(|versions| last_at(versions, block))
                .unwrap_or_else(Value::zero);
            slots.push((*key, value));
        }
        Ok(WitnessProof {
            block,
            archive_hash,
            address: *address,
            exists: history
                .and_then(|h| last_at(&h.existence, block))
                .unwrap_or(false),
            balance: history
                .and_then(|h| last_at(&h.balances, block))
                .unwrap_or_else(Balance::zero),
            nonce: history.and_then(|h| last_at(&h.nonces, block)).unwrap_or(0),
            code_hash: if code.is_empty() {
                EMPTY_CODE_HASH
            } else {
                keccak(&code)
            },
            slots,
        })
    }

    /// Streams the full state as of `block` into `out`, accounts in
    /// ascending address order.
    pub fn export(
        &self,
        block: BlockNumber,
        out: &mut dyn Write,
        token: &CancellationToken,
    ) -> Result<(), ArchiveError> {
        // pin the height first so an empty archive is reported as such
        self.hash(block)?;
        let inner = self.read()?;

        let mut addresses: Vec<&Address> = inner.accounts.keys().collect();
        addresses.sort_unstable();

        out.write_all(&(addresses.len() as u64).to_be_bytes())?;
        for address in addresses {
            if token.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            #[allow(clippy::unwrap_used)] // key came from the map
            let history = inner.history(address).unwrap();
            let mut slots: Vec<(Key, Value)> = history
                .slots
                .iter()
                .filter_map(|(key, versions)| {
                    last_at(versions, block)
                        .filter(|value| !value.is_zero())
                        .map(|value| (*key, value))
                })
                .collect();
            slots.sort_unstable_by_key(|(key, _)| *key);
            let record = ExportedAccount {
                address: *address,
                exists: last_at(&history.existence, block).unwrap_or(false),
                balance: last_at(&history.balances, block).unwrap_or_else(Balance::zero),
                nonce: last_at(&history.nonces, block).unwrap_or(0),
                code: last_at(&history.codes, block).unwrap_or_default(),
                slots,
            };
            let bytes = bincode::serialize(&record)
                .map_err(|err| ArchiveError::Corrupted(format!("unencodable export: {err}")))?;
            out.write_all(&(bytes.len() as u64).to_be_bytes())?;
            out.write_all(&bytes)?;
        }
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let Ok(inner) = self.inner.read() else {
            return MemoryFootprint::new(0);
        };
        let mut bytes = inner.blocks.len() * IDX_RECORD;
        for history in inner.accounts.values() {
            bytes += history.existence.len() * 9
                + history.balances.len() * 24
                + history.nonces.len() * 16
                + history.codes.iter().map(|(_, c)| 8 + c.len()).sum::<usize>()
                + history
                    .slots
                    .values()
                    .map(|v| 32 + v.len() * 40)
                    .sum::<usize>();
        }
        MemoryFootprint::new(bytes as u64)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, ArchiveError> {
        let inner = self.inner.read().map_err(|_| ArchiveError::Lock)?;
        if let Some(failure) = &inner.failure {
            return Err(ArchiveError::Invalidated(failure.clone()));
        }
        Ok(inner)
    }

    /// Test hook: marks the archive as failed the way an I/O error would.
    #[cfg(test)]
    pub(crate) fn inject_failure(&self, message: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.failure = Some(message.to_string());
        }
    }
}

impl Inner {
    fn history(&self, address: &Address) -> Option<&AccountHistory> {
        self.accounts.get(address)
    }

    fn append(
        &mut self,
        block: BlockNumber,
        update: &Update,
        hint: Option<Hash>,
    ) -> Result<(), ArchiveError> {
        let bytes = bincode::serialize(update)
            .map_err(|err| ArchiveError::Corrupted(format!("unencodable update: {err}")))?;
        let prev = self.blocks.last().map(|r| r.hash).unwrap_or_default();
        let record = BlockRecord {
            block,
            offset: self.log_len,
            len: bytes.len() as u32,
            hash: chain_hash(prev, update),
            hint: hint.unwrap_or_default(),
        };

        self.log.seek(SeekFrom::Start(record.offset))?;
        self.log.write_all(&bytes)?;
        self.log.sync_data()?;
        self.idx
            .seek(SeekFrom::Start(self.blocks.len() as u64 * IDX_RECORD as u64))?;
        self.idx.write_all(&encode_idx_record(&record))?;
        self.idx.sync_data()?;

        self.log_len += bytes.len() as u64;
        index_update(&mut self.accounts, block, update);
        self.blocks.push(record);
        Ok(())
    }
}

/// Folds one update into the per-account version lists. A deletion
/// mirrors the live schema's delete: existence flips to false and every
/// slot the account has ever held reads as zero, while balance, nonce
/// and code history stay untouched (explicit zero-writes arrive as
/// separate update entries when the overlay produces them).
fn index_update(
    accounts: &mut FxHashMap<Address, AccountHistory>,
    block: BlockNumber,
    update: &Update,
) {
    for address in &update.deleted_accounts {
        let history = accounts.entry(*address).or_default();
        history.existence.push((block, false));
        for versions in history.slots.values_mut() {
            versions.push((block, Value::zero()));
        }
    }
    for address in &update.created_accounts {
        accounts
            .entry(*address)
            .or_default()
            .existence
            .push((block, true));
    }
    for entry in &update.balances {
        accounts
            .entry(entry.address)
            .or_default()
            .balances
            .push((block, entry.balance));
    }
    for entry in &update.nonces {
        accounts
            .entry(entry.address)
            .or_default()
            .nonces
            .push((block, entry.nonce));
    }
    for entry in &update.codes {
        accounts
            .entry(entry.address)
            .or_default()
            .codes
            .push((block, entry.code.clone()));
    }
    for entry in &update.slots {
        accounts
            .entry(entry.address)
            .or_default()
            .slots
            .entry(entry.key)
            .or_default()
            .push((block, entry.value));
    }
}

/// Latest version at or below `block`. Entries pushed later within the
/// same block (a deletion tombstone followed by an explicit value) win.
fn last_at<T: Clone>(versions: &[(BlockNumber, T)], block: BlockNumber) -> Option<T> {
    let pos = versions.partition_point(|(b, _)| *b <= block);
    (pos > 0).then(|| versions[pos - 1].1.clone())
}

fn chain_hash(prev: Hash, update: &Update) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(prev.as_bytes());
    hasher.update(update.canonical_encoding());
    H256(hasher.finalize().into())
}

fn encode_idx_record(record: &BlockRecord) -> [u8; IDX_RECORD] {
    let mut buf = [0u8; IDX_RECORD];
    buf[0..8].copy_from_slice(&record.block.to_be_bytes());
    buf[8..16].copy_from_slice(&record.offset.to_be_bytes());
    buf[16..20].copy_from_slice(&record.len.to_be_bytes());
    buf[20..52].copy_from_slice(record.hash.as_bytes());
    buf[52..84].copy_from_slice(record.hint.as_bytes());
    buf
}

fn decode_idx_record(bytes: &[u8]) -> BlockRecord {
    let mut u64_buf = [0u8; 8];
    let mut u32_buf = [0u8; 4];
    u64_buf.copy_from_slice(&bytes[0..8]);
    let block = u64::from_be_bytes(u64_buf);
    u64_buf.copy_from_slice(&bytes[8..16]);
    let offset = u64::from_be_bytes(u64_buf);
    u32_buf.copy_from_slice(&bytes[16..20]);
    let len = u32::from_be_bytes(u32_buf);
    BlockRecord {
        block,
        offset,
        len,
        hash: H256::from_slice(&bytes[20..52]),
        hint: H256::from_slice(&bytes[52..84]),
    }
}

/// Self-contained attestation of an account's state at a block; verifies
/// against the archive hash for that block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessProof {
    pub block: BlockNumber,
    pub archive_hash: Hash,
    pub address: Address,
    pub exists: bool,
    pub balance: Balance,
    pub nonce: Nonce,
    pub code_hash: Hash,
    pub slots: Vec<(Key, Value)>,
}

impl WitnessProof {
    pub fn verify(&self, expected_archive_hash: Hash) -> bool {
        self.archive_hash == expected_archive_hash
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedAccount {
    address: Address,
    exists: bool,
    balance: Balance,
    nonce: Nonce,
    code: Bytes,
    slots: Vec<(Key, Value)>,
}
