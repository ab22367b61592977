//! The `State` interface consumed by the transactional overlay, the
//! durable implementation behind it, and the factory tying schema and
//! archive choices together.

use crate::archive::{Archive, WitnessProof};
use crate::bulk::BulkLoad;
use crate::depot::DepotOptions;
use crate::error::StoreError;
use crate::live::ComposedState;
use crate::memory::MemoryFootprint;
use crate::snapshot::{StateProof, StateSnapshot};
use crate::store::StoreOptions;
use crate::sync::SyncState;
use crate::writer::ArchiveWriter;
use amber_common::constants::EMPTY_CODE_HASH;
use amber_common::types::Update;
use amber_common::utils::keccak;
use amber_common::{Address, Balance, BlockNumber, Bytes, Hash, Key, Nonce, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A world state as seen by the overlay: current reads, block-level
/// mutation through [`Update`]s, hashing, archive access and migration
/// snapshots. Implementations are safe for concurrent callers.
pub trait State: Send + Sync {
    fn exists(&self, address: &Address) -> Result<bool, StoreError>;
    fn balance(&self, address: &Address) -> Result<Balance, StoreError>;
    fn nonce(&self, address: &Address) -> Result<Nonce, StoreError>;
    fn storage(&self, address: &Address, key: &Key) -> Result<Value, StoreError>;
    fn code(&self, address: &Address) -> Result<Bytes, StoreError>;
    fn code_size(&self, address: &Address) -> Result<usize, StoreError>;
    fn code_hash(&self, address: &Address) -> Result<Hash, StoreError>;

    /// Applies one block's update. The update must be fully applied when
    /// this returns, and enqueued to the archive (the archive itself may
    /// lag; it processes updates in enqueue order).
    fn apply(&self, block: BlockNumber, update: Update) -> Result<(), StoreError>;

    fn hash(&self) -> Result<Hash, StoreError>;
    fn flush(&self) -> Result<(), StoreError>;
    fn close(&self) -> Result<(), StoreError>;
    fn memory_footprint(&self) -> MemoryFootprint;

    /// Read-only state view as of `block`, served by the archive.
    fn archive_state(&self, block: BlockNumber) -> Result<Arc<dyn State>, StoreError>;
    fn archive_block_height(&self) -> Result<Option<BlockNumber>, StoreError>;
    fn create_witness_proof(
        &self,
        block: BlockNumber,
        address: &Address,
        keys: &[Key],
        token: &CancellationToken,
    ) -> Result<WitnessProof, StoreError>;
    fn export(
        &self,
        block: BlockNumber,
        out: &mut dyn Write,
        token: &CancellationToken,
    ) -> Result<(), StoreError>;

    fn create_snapshot(&self) -> Result<StateSnapshot, StoreError>;
    fn restore(&self, snapshot: &StateSnapshot) -> Result<(), StoreError>;
    fn proof(&self) -> Result<StateProof, StoreError>;
    fn verify_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), StoreError>;
}

/// Live-state schema selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Schema {
    #[default]
    Composed,
    /// Merkle-Patricia-Trie schema; reserved, construction is rejected.
    Mpt,
}

/// Archive selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchiveConfig {
    /// Append-only update log + block index.
    #[default]
    Log,
    /// No history is kept; archive reads are unavailable.
    None,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    pub schema: Schema,
    pub archive: ArchiveConfig,
    pub store: StoreOptions,
    pub depot: DepotOptions,
}

/// Opens a state directory and assembles the configured schema/archive
/// pair behind the synchronization wrapper.
pub fn open_state(dir: impl AsRef<Path>, opts: Options) -> Result<Arc<SyncState>, StoreError> {
    let dir = dir.as_ref();
    match opts.schema {
        Schema::Composed => {
            let live = ComposedState::open(dir.join("live"), opts.store, opts.depot)?;
            let archive = match opts.archive {
                ArchiveConfig::Log => {
                    let archive = Archive::open(dir.join("archive"))?;
                    let writer = ArchiveWriter::spawn(archive.clone())?;
                    Some(ArchiveHandle { archive, writer })
                }
                ArchiveConfig::None => None,
            };
            info!(
                "opened state at {dir:?} (composed schema, archive: {})",
                if archive.is_some() { "log" } else { "none" }
            );
            Ok(Arc::new(SyncState::new(PersistentState {
                live,
                archive,
                closed: false,
            })))
        }
        Schema::Mpt => Err(StoreError::UnsupportedConfiguration(
            "the MPT schema is reserved; open the composed schema".into(),
        )),
    }
}

pub(crate) struct ArchiveHandle {
    pub(crate) archive: Archive,
    pub(crate) writer: ArchiveWriter,
}

/// Durable state: the composed live state plus the asynchronously
/// written archive. Wrapped in [`SyncState`] for concurrent use.
pub struct PersistentState {
    live: ComposedState,
    archive: Option<ArchiveHandle>,
    closed: bool,
}

impl PersistentState {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub fn exists(&mut self, address: &Address) -> Result<bool, StoreError> {
        self.live.exists(address)
    }

    pub fn balance(&mut self, address: &Address) -> Result<Balance, StoreError> {
        self.live.balance(address)
    }

    pub fn nonce(&mut self, address: &Address) -> Result<Nonce, StoreError> {
        self.live.nonce(address)
    }

    pub fn storage(&mut self, address: &Address, key: &Key) -> Result<Value, StoreError> {
        self.live.storage(address, key)
    }

    pub fn code(&mut self, address: &Address) -> Result<Bytes, StoreError> {
        self.live.code(address)
    }

    pub fn code_size(&mut self, address: &Address) -> Result<usize, StoreError> {
        self.live.code_size(address)
    }

    pub fn code_hash(&mut self, address: &Address) -> Result<Hash, StoreError> {
        self.live.code_hash(address)
    }

    /// Applies the update to the live state and hands a copy of it to
    /// the archive writer before returning.
    pub fn apply(&mut self, block: BlockNumber, update: Update) -> Result<(), StoreError> {
        self.check_open()?;
        let mut update = update;
        update.normalize()?;
        self.live.apply(block, &update)?;
        if let Some(handle) = &self.archive {
            handle.writer.enqueue(block, update, None)?;
        }
        Ok(())
    }

    pub fn hash(&mut self) -> Result<Hash, StoreError> {
        self.live.hash()
    }

    /// Waits for the archive writer to drain, then persists the live
    /// state. Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        if let Some(handle) = &self.archive {
            handle.writer.flush()?;
        }
        self.live.flush()
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        if let Some(handle) = &mut self.archive {
            handle.writer.close()?;
        }
        self.live.close()?;
        self.closed = true;
        Ok(())
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        let mut report = MemoryFootprint::new(0).with_child("live", self.live.memory_footprint());
        if let Some(handle) = &self.archive {
            report.add_child("archive", handle.archive.memory_footprint());
        }
        report
    }

    fn archive(&self) -> Result<&Archive, StoreError> {
        self.archive
            .as_ref()
            .map(|handle| &handle.archive)
            .ok_or(StoreError::NoArchive)
    }

    pub fn archive_state(&self, block: BlockNumber) -> Result<Arc<dyn State>, StoreError> {
        let archive = self.archive()?;
        // resolves the height and rejects blocks before the first commit
        archive.hash(block)?;
        Ok(Arc::new(ArchiveStateView {
            archive: archive.clone(),
            block,
        }))
    }

    pub fn archive_block_height(&self) -> Result<Option<BlockNumber>, StoreError> {
        Ok(self.archive()?.block_height()?)
    }

    pub fn create_witness_proof(
        &self,
        block: BlockNumber,
        address: &Address,
        keys: &[Key],
        token: &CancellationToken,
    ) -> Result<WitnessProof, StoreError> {
        Ok(self
            .archive()?
            .create_witness_proof(block, address, keys, token)?)
    }

    pub fn export(
        &self,
        block: BlockNumber,
        out: &mut dyn Write,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        Ok(self.archive()?.export(block, out, token)?)
    }

    pub fn create_snapshot(&mut self) -> Result<StateSnapshot, StoreError> {
        self.live.create_snapshot()
    }

    pub fn restore(&mut self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        self.live.restore(snapshot)
    }

    pub fn proof(&mut self) -> Result<StateProof, StoreError> {
        self.live.proof()
    }

    pub fn verify_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        snapshot.verify()
    }
}

/// Read-only [`State`] over the archive at a fixed block. Mutating and
/// migration calls are rejected; `hash` reports the archive hash of the
/// pinned block.
struct ArchiveStateView {
    archive: Archive,
    block: BlockNumber,
}

impl State for ArchiveStateView {
    fn exists(&self, address: &Address) -> Result<bool, StoreError> {
        Ok(self.archive.exists(self.block, address)?)
    }

    fn balance(&self, address: &Address) -> Result<Balance, StoreError> {
        Ok(self.archive.balance(self.block, address)?)
    }

    fn nonce(&self, address: &Address) -> Result<Nonce, StoreError> {
        Ok(self.archive.nonce(self.block, address)?)
    }

    fn storage(&self, address: &Address, key: &Key) -> Result<Value, StoreError> {
        Ok(self.archive.storage(self.block, address, key)?)
    }

    fn code(&self, address: &Address) -> Result<Bytes, StoreError> {
        Ok(self.archive.code(self.block, address)?)
    }

    fn code_size(&self, address: &Address) -> Result<usize, StoreError> {
        Ok(self.archive.code(self.block, address)?.len())
    }

    fn code_hash(&self, address: &Address) -> Result<Hash, StoreError> {
        let code = self.archive.code(self.block, address)?;
        if code.is_empty() {
            Ok(EMPTY_CODE_HASH)
        } else {
            Ok(keccak(&code))
        }
    }

    fn apply(&self, _block: BlockNumber, _update: Update) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn hash(&self) -> Result<Hash, StoreError> {
        Ok(self.archive.hash(self.block)?)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn memory_footprint(&self) -> MemoryFootprint {
        MemoryFootprint::new(std::mem::size_of::<Self>() as u64)
    }

    fn archive_state(&self, block: BlockNumber) -> Result<Arc<dyn State>, StoreError> {
        self.archive.hash(block)?;
        Ok(Arc::new(ArchiveStateView {
            archive: self.archive.clone(),
            block,
        }))
    }

    fn archive_block_height(&self) -> Result<Option<BlockNumber>, StoreError> {
        Ok(self.archive.block_height()?)
    }

    fn create_witness_proof(
        &self,
        block: BlockNumber,
        address: &Address,
        keys: &[Key],
        token: &CancellationToken,
    ) -> Result<WitnessProof, StoreError> {
        Ok(self
            .archive
            .create_witness_proof(block, address, keys, token)?)
    }

    fn export(
        &self,
        block: BlockNumber,
        out: &mut dyn Write,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        Ok(self.archive.export(block, out, token)?)
    }

    fn create_snapshot(&self) -> Result<StateSnapshot, StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn restore(&self, _snapshot: &StateSnapshot) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn proof(&self) -> Result<StateProof, StoreError> {
        Err(StoreError::ReadOnly)
    }

    fn verify_snapshot(&self, _snapshot: &StateSnapshot) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}

/// Starts a bulk load writing directly to this state, bypassing any
/// overlay. See [`BulkLoad`].
pub fn start_bulk_load(state: Arc<dyn State>, block: BlockNumber) -> BulkLoad {
    BulkLoad::new(state, block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn mpt_schema_is_rejected() {
        let dir = TempDir::new("state").unwrap();
        let result = open_state(
            dir.path(),
            Options {
                schema: Schema::Mpt,
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(StoreError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn archive_reads_require_an_archive() {
        let dir = TempDir::new("state").unwrap();
        let state = open_state(
            dir.path(),
            Options {
                archive: ArchiveConfig::None,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(
            state.archive_block_height(),
            Err(StoreError::NoArchive)
        ));
        assert!(matches!(
            state.archive_state(0),
            Err(StoreError::NoArchive)
        ));
        state.close().unwrap();
    }
}
