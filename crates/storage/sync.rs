//! Synchronization wrapper: one mutex serializes every state operation
//! from concurrent callers.

use crate::archive::WitnessProof;
use crate::error::StoreError;
use crate::memory::MemoryFootprint;
use crate::snapshot::{StateProof, StateSnapshot};
use crate::state::{PersistentState, State};
use amber_common::types::Update;
use amber_common::{Address, Balance, BlockNumber, Bytes, Hash, Key, Nonce, Value};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

pub struct SyncState {
    inner: Mutex<PersistentState>,
}

impl SyncState {
    pub(crate) fn new(inner: PersistentState) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistentState>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Lock)
    }
}

impl State for SyncState {
    fn exists(&self, address: &Address) -> Result<bool, StoreError> {
        self.lock()?.exists(address)
    }

    fn balance(&self, address: &Address) -> Result<Balance, StoreError> {
        self.lock()?.balance(address)
    }

    fn nonce(&self, address: &Address) -> Result<Nonce, StoreError> {
        self.lock()?.nonce(address)
    }

    fn storage(&self, address: &Address, key: &Key) -> Result<Value, StoreError> {
        self.lock()?.storage(address, key)
    }

    fn code(&self, address: &Address) -> Result<Bytes, StoreError> {
        self.lock()?.code(address)
    }

    fn code_size(&self, address: &Address) -> Result<usize, StoreError> {
        self.lock()?.code_size(address)
    }

    fn code_hash(&self, address: &Address) -> Result<Hash, StoreError> {
        self.lock()?.code_hash(address)
    }

    fn apply(&self, block: BlockNumber, update: Update) -> Result<(), StoreError> {
        self.lock()?.apply(block, update)
    }

    fn hash(&self) -> Result<Hash, StoreError> {
        self.lock()?.hash()
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.lock()?.flush()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.lock()?.close()
    }

    fn memory_footprint(&self) -> MemoryFootprint {
        match self.inner.lock() {
            Ok(inner) => inner.memory_footprint(),
            Err(_) => MemoryFootprint::new(0),
        }
    }

    fn archive_state(&self, block: BlockNumber) -> Result<Arc<dyn State>, StoreError> {
        self.lock()?.archive_state(block)
    }

    fn archive_block_height(&self) -> Result<Option<BlockNumber>, StoreError> {
        self.lock()?.archive_block_height()
    }

    fn create_witness_proof(
        &self,
        block: BlockNumber,
        address: &Address,
        keys: &[Key],
        token: &CancellationToken,
    ) -> Result<WitnessProof, StoreError> {
        self.lock()?.create_witness_proof(block, address, keys, token)
    }

    fn export(
        &self,
        block: BlockNumber,
        out: &mut dyn Write,
        token: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.lock()?.export(block, out, token)
    }

    fn create_snapshot(&self) -> Result<StateSnapshot, StoreError> {
        self.lock()?.create_snapshot()
    }

    fn restore(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        self.lock()?.restore(snapshot)
    }

    fn proof(&self) -> Result<StateProof, StoreError> {
        self.lock()?.proof()
    }

    fn verify_snapshot(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        self.lock()?.verify_snapshot(snapshot)
    }
}
