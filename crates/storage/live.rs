//! The composed live-state schema.
//!
//! Assembles three indices, five paged stores, the code depot and the
//! address-to-slots reverse map into one durable world state with a
//! single root hash. Reads map absent index entries to the zero of the
//! result type; mutations arrive exclusively as [`Update`] replays.

use crate::codec::SlotId;
use crate::depot::{Depot, DepotOptions};
use crate::error::StoreError;
use crate::index::Index;
use crate::memory::MemoryFootprint;
use crate::multimap::MultiMap;
use crate::snapshot::{StateProof, StateSnapshot};
use crate::store::{PagedStore, StoreOptions};
use amber_common::constants::EMPTY_CODE_HASH;
use amber_common::types::{AccountState, Update, UpdateTarget};
use amber_common::utils::keccak;
use amber_common::{Address, Balance, BlockNumber, Bytes, Hash, Key, Nonce, Value, H256};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ComposedState {
    dir: PathBuf,
    address_index: Index<Address>,
    key_index: Index<Key>,
    slot_index: Index<SlotId>,
    accounts: PagedStore<AccountState>,
    balances: PagedStore<Balance>,
    nonces: PagedStore<Nonce>,
    values: PagedStore<Value>,
    code_hashes: PagedStore<Hash>,
    codes: Depot,
    address_slots: MultiMap,
}

impl ComposedState {
    pub fn open(
        dir: impl Into<PathBuf>,
        store_opts: StoreOptions,
        depot_opts: DepotOptions,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let index = |name: &str| dir.join("index").join(name);
        let store = |name: &str| dir.join("store").join(name);
        let tree = |name: &str| dir.join("hashtree").join(name);

        let state = Self {
            address_index: Index::open(index("addresses"))?,
            key_index: Index::open(index("keys"))?,
            slot_index: Index::open(index("slots"))?,
            accounts: PagedStore::open(store("accounts"), tree("accounts"), store_opts)?,
            balances: PagedStore::open(store("balances"), tree("balances"), store_opts)?,
            nonces: PagedStore::open(store("nonces"), tree("nonces"), store_opts)?,
            values: PagedStore::open(store("values"), tree("values"), store_opts)?,
            code_hashes: PagedStore::open(store("code_hashes"), tree("code_hashes"), store_opts)?,
            codes: Depot::open(dir.join("depot").join("codes"), tree("codes"), depot_opts)?,
            address_slots: MultiMap::open(dir.join("multimap").join("address_slots"))?,
            dir,
        };
        debug!(accounts = state.address_index.len(), "opened composed state at {:?}", state.dir);
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&mut self, address: &Address) -> Result<bool, StoreError> {
        match self.address_index.get(address) {
            Some(id) => Ok(self.accounts.get(id)?.exists()),
            None => Ok(false),
        }
    }

    pub fn balance(&mut self, address: &Address) -> Result<Balance, StoreError> {
        match self.address_index.get(address) {
            Some(id) => self.balances.get(id),
            None => Ok(Balance::zero()),
        }
    }

    pub fn nonce(&mut self, address: &Address) -> Result<Nonce, StoreError> {
        match self.address_index.get(address) {
            Some(id) => self.nonces.get(id),
            None => Ok(0),
        }
    }

    pub fn storage(&mut self, address: &Address, key: &Key) -> Result<Value, StoreError> {
        let Some(address_id) = self.address_index.get(address) else {
            return Ok(Value::zero());
        };
        let Some(key_id) = self.key_index.get(key) else {
            return Ok(Value::zero());
        };
        let slot = SlotId {
            address_id,
            key_id,
        };
        match self.slot_index.get(&slot) {
            Some(slot_id) => self.values.get(slot_id),
            None => Ok(Value::zero()),
        }
    }

    pub fn code(&mut self, address: &Address) -> Result<Bytes, StoreError> {
        match self.address_index.get(address) {
            Some(id) => self.codes.get(id),
            None => Ok(Bytes::new()),
        }
    }

    pub fn code_size(&mut self, address: &Address) -> Result<usize, StoreError> {
        match self.address_index.get(address) {
            Some(id) => Ok(self.codes.size(id) as usize),
            None => Ok(0),
        }
    }

    /// The stored code hash, disambiguated against the depot: an account
    /// whose depot entry is empty reports the hash of the empty string,
    /// regardless of the (zero) content of the hash store.
    pub fn code_hash(&mut self, address: &Address) -> Result<Hash, StoreError> {
        match self.address_index.get(address) {
            Some(id) if self.codes.size(id) > 0 => self.code_hashes.get(id),
            _ => Ok(EMPTY_CODE_HASH),
        }
    }

    /// Applies one block's update. Group order is fixed by
    /// [`Update::apply_to`]: deletions, creations, balances, nonces,
    /// codes, slots.
    pub fn apply(&mut self, block: BlockNumber, update: &Update) -> Result<(), StoreError> {
        debug!(
            block,
            deleted = update.deleted_accounts.len(),
            created = update.created_accounts.len(),
            slots = update.slots.len(),
            "applying update"
        );
        update.apply_to(self)
    }

    /// The composed root:
    /// `SHA-256(H_addr ‖ H_key ‖ H_slot ‖ H_balances ‖ H_nonces ‖
    /// H_values ‖ H_accounts ‖ H_codes)`.
    ///
    /// The code-hash store and the reverse map are intentionally not part
    /// of the root: code hashes are derivable from code contents and the
    /// reverse map is derived data.
    pub fn hash(&mut self) -> Result<Hash, StoreError> {
        let parts = self.part_hashes()?;
        let mut hasher = Sha256::new();
        for part in &parts {
            hasher.update(part.as_bytes());
        }
        Ok(H256(hasher.finalize().into()))
    }

    fn part_hashes(&mut self) -> Result<[Hash; 8], StoreError> {
        Ok([
            self.address_index.hash(),
            self.key_index.hash(),
            self.slot_index.hash(),
            self.balances.hash()?,
            self.nonces.hash()?,
            self.values.hash()?,
            self.accounts.hash()?,
            self.codes.hash()?,
        ])
    }

    /// Propagates all dirty state to disk. Idempotent.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.address_index.flush()?;
        self.key_index.flush()?;
        self.slot_index.flush()?;
        self.accounts.flush()?;
        self.balances.flush()?;
        self.nonces.flush()?;
        self.values.flush()?;
        self.code_hashes.flush()?;
        self.codes.flush()?;
        self.address_slots.flush()?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), StoreError> {
        debug!("closing composed state at {:?}", self.dir);
        self.flush()
    }

    pub fn memory_footprint(&self) -> MemoryFootprint {
        MemoryFootprint::new(0)
            .with_child("address_index", self.address_index.memory_footprint())
            .with_child("key_index", self.key_index.memory_footprint())
            .with_child("slot_index", self.slot_index.memory_footprint())
            .with_child("accounts", self.accounts.memory_footprint())
            .with_child("balances", self.balances.memory_footprint())
            .with_child("nonces", self.nonces.memory_footprint())
            .with_child("values", self.values.memory_footprint())
            .with_child("code_hashes", self.code_hashes.memory_footprint())
            .with_child("codes", self.codes.memory_footprint())
            .with_child("address_slots", self.address_slots.memory_footprint())
    }

    pub fn proof(&mut self) -> Result<StateProof, StoreError> {
        let part_hashes = self.part_hashes()?.to_vec();
        let root = StateProof::root_of_parts(&part_hashes);
        Ok(StateProof { part_hashes, root })
    }

    /// Serializes the full state for migration. The payload preserves
    /// index insertion order and dense store contents so that a replay
    /// into an empty state reproduces the exact same hashes.
    pub fn create_snapshot(&mut self) -> Result<StateSnapshot, StoreError> {
        let proof = self.proof()?;

        let addresses: Vec<Address> = (0..self.address_index.len() as u32)
            .filter_map(|id| self.address_index.key_of(id).copied())
            .collect();
        let keys: Vec<Key> = (0..self.key_index.len() as u32)
            .filter_map(|id| self.key_index.key_of(id).copied())
            .collect();
        let slot_ids: Vec<(u32, u32)> = (0..self.slot_index.len() as u32)
            .filter_map(|id| self.slot_index.key_of(id).copied())
            .map(|slot| (slot.address_id, slot.key_id))
            .collect();

        let mut account_states = Vec::with_capacity(self.accounts.len() as usize);
        for id in 0..self.accounts.len() {
            account_states.push(self.accounts.get(id)?.as_byte());
        }
        let mut balances = Vec::with_capacity(self.balances.len() as usize);
        for id in 0..self.balances.len() {
            balances.push(self.balances.get(id)?);
        }
        let mut nonces = Vec::with_capacity(self.nonces.len() as usize);
        for id in 0..self.nonces.len() {
            nonces.push(self.nonces.get(id)?);
        }
        let mut values = Vec::with_capacity(self.values.len() as usize);
        for id in 0..self.values.len() {
            values.push(self.values.get(id)?);
        }
        let mut code_hashes = Vec::with_capacity(self.code_hashes.len() as usize);
        for id in 0..self.code_hashes.len() {
            code_hashes.push(self.code_hashes.get(id)?);
        }
        let mut codes = Vec::with_capacity(self.codes.len());
        for id in 0..self.codes.len() as u32 {
            codes.push(self.codes.get(id)?);
        }

        Ok(StateSnapshot {
            proof,
            addresses,
            keys,
            slot_ids,
            account_states,
            balances,
            nonces,
            values,
            code_hashes,
            codes,
        })
    }

    /// Replays a snapshot into this state. Only an empty state can be
    /// restored into; after the replay the recomputed proof must match
    /// the snapshot's, otherwise the restore fails with
    /// [`StoreError::SnapshotMismatch`] and the state must be discarded.
    pub fn restore(&mut self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        if !self.address_index.is_empty() || !self.key_index.is_empty() {
            return Err(StoreError::UnsupportedConfiguration(
                "restore requires an empty state".into(),
            ));
        }
        snapshot.verify()?;

        for address in &snapshot.addresses {
            self.address_index.get_or_add(*address)?;
        }
        for key in &snapshot.keys {
            self.key_index.get_or_add(*key)?;
        }
        for &(address_id, key_id) in &snapshot.slot_ids {
            self.slot_index.get_or_add(SlotId {
                address_id,
                key_id,
            })?;
        }
        for (id, byte) in snapshot.account_states.iter().enumerate() {
            let state = AccountState::from_byte(*byte).ok_or_else(|| {
                StoreError::Corrupted(format!("invalid account state {byte} in snapshot"))
            })?;
            self.accounts.set(id as u32, state)?;
        }
        for (id, balance) in snapshot.balances.iter().enumerate() {
            self.balances.set(id as u32, *balance)?;
        }
        for (id, nonce) in snapshot.nonces.iter().enumerate() {
            self.nonces.set(id as u32, *nonce)?;
        }
        for (id, value) in snapshot.values.iter().enumerate() {
            self.values.set(id as u32, *value)?;
        }
        for (id, hash) in snapshot.code_hashes.iter().enumerate() {
            self.code_hashes.set(id as u32, *hash)?;
        }
        for (id, code) in snapshot.codes.iter().enumerate() {
            self.codes.set(id as u32, code.clone())?;
        }
        // reverse map is derived from the live slot values
        for (slot_id, (address_id, _)) in snapshot.slot_ids.iter().enumerate() {
            if !snapshot.values[slot_id].is_zero() {
                self.address_slots.insert(*address_id, slot_id as u32);
            }
        }

        if self.proof()? != snapshot.proof {
            return Err(StoreError::SnapshotMismatch);
        }
        Ok(())
    }
}

impl UpdateTarget for ComposedState {
    type Error = StoreError;

    fn delete_account(&mut self, address: Address) -> Result<(), StoreError> {
        let id = self.address_index.get_or_add(address)?;
        self.accounts.set(id, AccountState::Deleted)?;
        // balance, nonce and code hash survive deletion; recreation
        // semantics live in the overlay
        for slot_id in self.address_slots.remove_all(id) {
            self.values.set(slot_id, Value::zero())?;
        }
        Ok(())
    }

    fn create_account(&mut self, address: Address) -> Result<(), StoreError> {
        let id = self.address_index.get_or_add(address)?;
        self.accounts.set(id, AccountState::Exists)
    }

    fn set_balance(&mut self, address: Address, balance: Balance) -> Result<(), StoreError> {
        let id = self.address_index.get_or_add(address)?;
        self.balances.set(id, balance)
    }

    fn set_nonce(&mut self, address: Address, nonce: Nonce) -> Result<(), StoreError> {
        let id = self.address_index.get_or_add(address)?;
        self.nonces.set(id, nonce)
    }

    fn set_code(&mut self, address: Address, code: &Bytes) -> Result<(), StoreError> {
        let id = self.address_index.get_or_add(address)?;
        self.codes.set(id, code.clone())?;
        self.code_hashes.set(id, keccak(code))
    }

    fn set_storage(&mut self, address: Address, key: Key, value: Value) -> Result<(), StoreError> {
        let address_id = self.address_index.get_or_add(address)?;
        let key_id = self.key_index.get_or_add(key)?;
        let slot = SlotId {
            address_id,
            key_id,
        };
        let slot_id = self.slot_index.get_or_add(slot)?;
        self.values.set(slot_id, value)?;
        if value.is_zero() {
            self.address_slots.remove(address_id, slot_id);
        } else {
            self.address_slots.insert(address_id, slot_id);
        }
        Ok(())
    }
}
