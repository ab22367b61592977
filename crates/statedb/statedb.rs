//! The transactional overlay above a live state.
//!
//! The overlay caches everything a transaction touches, keeps an undo log
//! for snapshot/rollback, prunes touched-empty accounts at transaction
//! end, and serializes a block's net effect into one deterministic
//! [`Update`] at block end. Getter I/O failures are fatal: the executing
//! machine cannot continue on an inconsistent world view.

use crate::undo::UndoOp;
use amber_common::constants::{EMPTY_CODE_HASH, ZERO_HASH};
use amber_common::types::{
    AccountState, BalanceUpdate, CodeUpdate, NonceUpdate, SlotUpdate, Update,
};
use amber_common::utils::keccak;
use amber_common::{Address, Balance, BlockNumber, Bytes, Hash, Key, Nonce, Value};
use amber_storage::error::StoreError;
use amber_storage::{start_bulk_load, BulkLoad, MemoryFootprint, State};
use lru::LruCache;
use rustc_hash::{FxHashMap, FxHashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::error;

/// Capacity of the cross-block stored-value cache.
const STORED_DATA_CACHE_CAPACITY: usize = 1 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AccountEntry {
    /// Live-state value at first load; `None` if never loaded.
    pub(crate) original: Option<AccountState>,
    pub(crate) current: AccountState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BalanceEntry {
    pub(crate) original: Option<Balance>,
    pub(crate) current: Balance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NonceEntry {
    pub(crate) original: Option<Nonce>,
    pub(crate) current: Nonce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotEntry {
    /// Live-state value at block start.
    pub(crate) stored: Value,
    /// Value at the end of the last completed transaction.
    pub(crate) committed: Value,
    pub(crate) current: Value,
    pub(crate) stored_known: bool,
    pub(crate) committed_known: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CodeEntry {
    pub(crate) code: Option<Bytes>,
    pub(crate) size: Option<usize>,
    pub(crate) hash: Option<Hash>,
    pub(crate) dirty: bool,
}

/// Clearing status of an account suicided within the current block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClearingState {
    /// Suicided in the running transaction; storage still readable.
    Pending,
    /// Deletion took effect; stored values must read as zero.
    Cleared,
}

/// Transactional overlay with commit rights: drives
/// `begin_block → (transactions)* → end_block` against the shared state.
pub struct StateDb {
    pub(crate) state: Arc<dyn State>,

    // per-block caches, reset on end_block
    pub(crate) accounts: FxHashMap<Address, AccountEntry>,
    pub(crate) balances: FxHashMap<Address, BalanceEntry>,
    pub(crate) nonces: FxHashMap<Address, NonceEntry>,
    pub(crate) data: FxHashMap<(Address, Key), SlotEntry>,
    pub(crate) codes: FxHashMap<Address, CodeEntry>,
    pub(crate) cleared: FxHashMap<Address, ClearingState>,

    // survive across blocks
    pub(crate) reincarnation: FxHashMap<Address, u64>,
    pub(crate) stored_data_cache: LruCache<(Address, Key), (Value, u64)>,

    // per-transaction state
    pub(crate) undo: Vec<UndoOp>,
    pub(crate) written_slots: FxHashSet<(Address, Key)>,
    pub(crate) refund: u64,
    pub(crate) accessed_addresses: FxHashSet<Address>,
    pub(crate) accessed_slots: FxHashSet<(Address, Key)>,
    pub(crate) empty_candidates: Vec<Address>,
    pub(crate) accounts_to_delete: Vec<Address>,

    block_open: bool,
}

/// Aborts on a failed live-state read; the caller (a virtual machine in
/// the middle of execution) has no way to proceed without the value.
fn must<T>(result: Result<T, StoreError>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!("live state access failed: {err}");
            panic!("live state access failed: {err}");
        }
    }
}

impl StateDb {
    pub fn new(state: Arc<dyn State>) -> Self {
        Self {
            state,
            accounts: FxHashMap::default(),
            balances: FxHashMap::default(),
            nonces: FxHashMap::default(),
            data: FxHashMap::default(),
            codes: FxHashMap::default(),
            cleared: FxHashMap::default(),
            reincarnation: FxHashMap::default(),
            stored_data_cache: LruCache::new(
                NonZeroUsize::new(STORED_DATA_CACHE_CAPACITY).expect("capacity is non-zero"),
            ),
            undo: Vec::new(),
            written_slots: FxHashSet::default(),
            refund: 0,
            accessed_addresses: FxHashSet::default(),
            accessed_slots: FxHashSet::default(),
            empty_candidates: Vec::new(),
            accounts_to_delete: Vec::new(),
            block_open: false,
        }
    }

    /// An independent, non-committing overlay sharing the same state.
    pub fn non_committable_view(&self) -> NonCommittableStateDb {
        NonCommittableStateDb {
            db: StateDb::new(self.state.clone()),
        }
    }

    // ------------------------------------------------------------------
    // account lifecycle
    // ------------------------------------------------------------------

    fn account_entry(&mut self, address: Address) -> AccountEntry {
        if let Some(entry) = self.accounts.get(&address) {
            return *entry;
        }
        let state = if must(self.state.exists(&address)) {
            AccountState::Exists
        } else {
            AccountState::Unknown
        };
        let entry = AccountEntry {
            original: Some(state),
            current: state,
        };
        self.accounts.insert(address, entry);
        entry
    }

    pub fn exist(&mut self, address: Address) -> bool {
        self.account_entry(address).current.exists()
    }

    /// An account is empty when balance, nonce and code are all zero.
    pub fn empty(&mut self, address: Address) -> bool {
        self.get_balance(address).is_zero()
            && self.get_nonce(address) == 0
            && self.get_code_size(address) == 0
    }

    fn set_account_state(&mut self, address: Address, new: AccountState) {
        let prev = self.accounts.get(&address).copied();
        let entry = AccountEntry {
            original: prev.and_then(|e| e.original),
            current: new,
        };
        self.accounts.insert(address, entry);
        self.undo.push(UndoOp::Account { address, prev });
    }

    /// Creates `address`. Nonce and code read as zero/empty afterwards;
    /// for a previously existing account those resets are transient (they
    /// are not part of the block's net change, so the durable values
    /// survive into the next block). The balance is zeroed only when the
    /// account did not exist. Recreating an existing account (suicided
    /// earlier or not) wipes its cached storage and marks it cleared:
    /// stored values of the previous incarnation become unreadable, and
    /// the block update carries a deletion/creation pair that purges the
    /// live storage.
    pub fn create_account(&mut self, address: Address) {
        let existed = self.exist(address);
        if existed {
            self.wipe_cached_slots(address);
            self.set_clearing(address, ClearingState::Cleared);
        }
        self.set_account_state(address, AccountState::Exists);
        if !existed {
            self.write_balance(address, Balance::zero());
        }

        // transient nonce/code resets: original == current keeps them out
        // of the end-of-block diff
        let prev = self.nonces.get(&address).copied();
        self.nonces.insert(
            address,
            NonceEntry {
                original: Some(0),
                current: 0,
            },
        );
        self.undo.push(UndoOp::Nonce {
            address,
            prev,
        });
        let prev = self.codes.get(&address).cloned();
        self.codes.insert(
            address,
            CodeEntry {
                code: Some(Bytes::new()),
                size: Some(0),
                hash: Some(EMPTY_CODE_HASH),
                dirty: false,
            },
        );
        self.undo.push(UndoOp::Code {
            address,
            prev,
        });

        self.push_empty_candidate(address);
    }

    /// Schedules `address` for deletion at transaction end. Returns false
    /// without side effects if the account does not exist.
    pub fn suicide(&mut self, address: Address) -> bool {
        if !self.exist(address) {
            return false;
        }
        self.balance_entry(address);
        self.write_balance(address, Balance::zero());
        self.undo.push(UndoOp::AccountsToDelete {
            len: self.accounts_to_delete.len(),
        });
        self.accounts_to_delete.push(address);
        self.set_clearing(address, ClearingState::Pending);
        true
    }

    pub fn has_suicided(&self, address: Address) -> bool {
        self.cleared.get(&address) == Some(&ClearingState::Pending)
    }

    fn set_clearing(&mut self, address: Address, new: ClearingState) {
        let prev = self.cleared.insert(address, new);
        self.undo.push(UndoOp::Clearing { address, prev });
    }

    fn wipe_cached_slots(&mut self, address: Address) {
        let keys: Vec<Key> = self
            .data
            .keys()
            .filter(|(a, _)| *a == address)
            .map(|(_, k)| *k)
            .collect();
        for key in keys {
            let prev = self.data.remove(&(address, key));
            self.undo.push(UndoOp::Slot { address, key, prev });
        }
    }

    fn push_empty_candidate(&mut self, address: Address) {
        self.undo.push(UndoOp::EmptyCandidates {
            len: self.empty_candidates.len(),
        });
        self.empty_candidates.push(address);
    }

    // ------------------------------------------------------------------
    // balance
    // ------------------------------------------------------------------

    fn balance_entry(&mut self, address: Address) -> BalanceEntry {
        if let Some(entry) = self.balances.get(&address) {
            return *entry;
        }
        let balance = must(self.state.balance(&address));
        let entry = BalanceEntry {
            original: Some(balance),
            current: balance,
        };
        self.balances.insert(address, entry);
        entry
    }

    /// Returns a copy of the current balance; callers never observe the
    /// overlay's internal storage.
    pub fn get_balance(&mut self, address: Address) -> Balance {
        self.balance_entry(address).current
    }

    fn write_balance(&mut self, address: Address, value: Balance) {
        let prev = self.balances.get(&address).copied();
        self.balances.insert(
            address,
            BalanceEntry {
                original: prev.and_then(|e| e.original),
                current: value,
            },
        );
        self.undo.push(UndoOp::Balance { address, prev });
    }

    /// Adds to the balance; a zero diff is a no-op. Implicitly creates
    /// the account (preserving nonce and code) when absent.
    pub fn add_balance(&mut self, address: Address, diff: Balance) {
        if diff.is_zero() {
            return;
        }
        let current = self.balance_entry(address).current;
        if !self.exist(address) {
            self.set_account_state(address, AccountState::Exists);
        }
        self.write_balance(address, current.saturating_add(diff));
    }

    /// Subtracts from the balance; a zero diff is a no-op. Draining the
    /// balance to zero marks the account as an empty-deletion candidate.
    pub fn sub_balance(&mut self, address: Address, diff: Balance) {
        if diff.is_zero() {
            return;
        }
        let current = self.balance_entry(address).current;
        let value = current.saturating_sub(diff);
        self.write_balance(address, value);
        if value.is_zero() {
            self.push_empty_candidate(address);
        }
    }

    // ------------------------------------------------------------------
    // nonce
    // ------------------------------------------------------------------

    fn nonce_entry(&mut self, address: Address) -> NonceEntry {
        if let Some(entry) = self.nonces.get(&address) {
            return *entry;
        }
        let nonce = must(self.state.nonce(&address));
        let entry = NonceEntry {
            original: Some(nonce),
            current: nonce,
        };
        self.nonces.insert(address, entry);
        entry
    }

    pub fn get_nonce(&mut self, address: Address) -> Nonce {
        self.nonce_entry(address).current
    }

    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) {
        if !self.exist(address) {
            self.set_account_state(address, AccountState::Exists);
        }
        let prev = self.nonces.get(&address).copied();
        self.nonces.insert(
            address,
            NonceEntry {
                original: prev.and_then(|e| e.original),
                current: nonce,
            },
        );
        self.undo.push(UndoOp::Nonce { address, prev });
        if nonce == 0 {
            self.push_empty_candidate(address);
        }
    }

    // ------------------------------------------------------------------
    // code
    // ------------------------------------------------------------------

    pub fn get_code(&mut self, address: Address) -> Bytes {
        if let Some(entry) = self.codes.get(&address) {
            if let Some(code) = &entry.code {
                return code.clone();
            }
        }
        let code = must(self.state.code(&address));
        let size = code.len();
        let entry = self.codes.entry(address).or_insert(CodeEntry {
            code: None,
            size: None,
            hash: None,
            dirty: false,
        });
        entry.code = Some(code.clone());
        entry.size = Some(size);
        code
    }

    pub fn get_code_size(&mut self, address: Address) -> usize {
        if let Some(entry) = self.codes.get(&address) {
            if let Some(size) = entry.size {
                return size;
            }
        }
        let size = must(self.state.code_size(&address));
        self.codes
            .entry(address)
            .or_insert(CodeEntry {
                code: None,
                size: None,
                hash: None,
                dirty: false,
            })
            .size = Some(size);
        size
    }

    /// The zero hash for non-existing accounts; otherwise the Keccak-256
    /// of the (possibly dirty) code, computed on demand and cached.
    pub fn get_code_hash(&mut self, address: Address) -> Hash {
        if !self.exist(address) {
            return ZERO_HASH;
        }
        if let Some(entry) = self.codes.get(&address) {
            if let Some(hash) = entry.hash {
                return hash;
            }
            if let Some(code) = entry.code.clone() {
                let hash = if code.is_empty() {
                    EMPTY_CODE_HASH
                } else {
                    keccak(&code)
                };
                if let Some(entry) = self.codes.get_mut(&address) {
                    entry.hash = Some(hash);
                }
                return hash;
            }
        }
        let hash = must(self.state.code_hash(&address));
        self.codes
            .entry(address)
            .or_insert(CodeEntry {
                code: None,
                size: None,
                hash: None,
                dirty: false,
            })
            .hash = Some(hash);
        hash
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        if !self.exist(address) {
            self.set_account_state(address, AccountState::Exists);
        }
        let prev = self.codes.get(&address).cloned();
        let empty = code.is_empty();
        self.codes.insert(
            address,
            CodeEntry {
                size: Some(code.len()),
                code: Some(code),
                hash: None,
                dirty: true,
            },
        );
        self.undo.push(UndoOp::Code { address, prev });
        if empty {
            self.push_empty_candidate(address);
        }
    }

    // ------------------------------------------------------------------
    // storage
    // ------------------------------------------------------------------

    /// The stored (block-start) value of a slot, routed through the
    /// reincarnation-checked cache. A cleared account reads as zero; a
    /// cache hit from a previous incarnation is an implicit clear.
    fn load_stored_state(&mut self, address: Address, key: Key) -> Value {
        if self.cleared.get(&address) == Some(&ClearingState::Cleared) {
            return Value::zero();
        }
        let reincarnation = self.reincarnation.get(&address).copied().unwrap_or(0);
        if let Some((value, cached_reincarnation)) = self.stored_data_cache.get(&(address, key)) {
            if *cached_reincarnation == reincarnation {
                return *value;
            }
            return Value::zero();
        }
        let value = must(self.state.storage(&address, &key));
        self.stored_data_cache
            .put((address, key), (value, reincarnation));
        value
    }

    pub fn get_state(&mut self, address: Address, key: Key) -> Value {
        if let Some(entry) = self.data.get(&(address, key)) {
            return entry.current;
        }
        let value = self.load_stored_state(address, key);
        self.data.insert(
            (address, key),
            SlotEntry {
                stored: value,
                committed: value,
                current: value,
                stored_known: true,
                committed_known: true,
            },
        );
        value
    }

    /// The value as of the end of the last completed transaction.
    pub fn get_committed_state(&mut self, address: Address, key: Key) -> Value {
        if let Some(entry) = self.data.get(&(address, key)) {
            if entry.committed_known {
                return entry.committed;
            }
        }
        let value = self.load_stored_state(address, key);
        match self.data.get_mut(&(address, key)) {
            Some(entry) => {
                entry.stored = value;
                entry.committed = value;
                entry.stored_known = true;
                entry.committed_known = true;
            }
            None => {
                self.data.insert(
                    (address, key),
                    SlotEntry {
                        stored: value,
                        committed: value,
                        current: value,
                        stored_known: true,
                        committed_known: true,
                    },
                );
            }
        }
        value
    }

    pub fn set_state(&mut self, address: Address, key: Key, value: Value) {
        let prev = self.data.get(&(address, key)).copied();
        match self.data.get_mut(&(address, key)) {
            Some(entry) => entry.current = value,
            None => {
                self.data.insert(
                    (address, key),
                    SlotEntry {
                        stored: Value::zero(),
                        committed: Value::zero(),
                        current: value,
                        stored_known: false,
                        committed_known: false,
                    },
                );
            }
        }
        self.undo.push(UndoOp::Slot { address, key, prev });
        if self.written_slots.insert((address, key)) {
            self.undo.push(UndoOp::WrittenSlot { address, key });
        }
    }

    // ------------------------------------------------------------------
    // refund
    // ------------------------------------------------------------------

    pub fn add_refund(&mut self, amount: u64) {
        self.undo.push(UndoOp::Refund { prev: self.refund });
        self.refund += amount;
    }

    /// Panics when `amount` exceeds the accumulated refund; the caller
    /// has broken the gas accounting contract.
    pub fn sub_refund(&mut self, amount: u64) {
        if amount > self.refund {
            panic!(
                "refund underflow: subtracting {amount} from {}",
                self.refund
            );
        }
        self.undo.push(UndoOp::Refund { prev: self.refund });
        self.refund -= amount;
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    // ------------------------------------------------------------------
    // access list
    // ------------------------------------------------------------------

    pub fn add_address_to_access_list(&mut self, address: Address) {
        if self.accessed_addresses.insert(address) {
            self.undo.push(UndoOp::AccessAddress { address });
        }
    }

    /// Adds the slot (and, implicitly, its address) to the access list.
    pub fn add_slot_to_access_list(&mut self, address: Address, key: Key) {
        self.add_address_to_access_list(address);
        if self.accessed_slots.insert((address, key)) {
            self.undo.push(UndoOp::AccessSlot { address, key });
        }
    }

    pub fn is_address_in_access_list(&self, address: Address) -> bool {
        self.accessed_addresses.contains(&address)
    }

    /// Returns `(address present, slot present)`.
    pub fn is_slot_in_access_list(&self, address: Address, key: Key) -> (bool, bool) {
        (
            self.accessed_addresses.contains(&address),
            self.accessed_slots.contains(&(address, key)),
        )
    }

    // ------------------------------------------------------------------
    // snapshot / revert
    // ------------------------------------------------------------------

    pub fn snapshot(&mut self) -> usize {
        self.undo.len()
    }

    /// Rolls every overlay mutation back to the state at `snapshot`.
    /// Panics on an id that was never handed out.
    pub fn revert_to_snapshot(&mut self, snapshot: usize) {
        if snapshot > self.undo.len() {
            panic!(
                "invalid snapshot id {snapshot}; undo log holds {} entries",
                self.undo.len()
            );
        }
        while self.undo.len() > snapshot {
            if let Some(op) = self.undo.pop() {
                op.apply(self);
            }
        }
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    pub fn begin_block(&mut self) {
        self.block_open = true;
    }

    pub fn begin_transaction(&mut self) {
        // per-transaction state starts clean; nothing to prepare
    }

    /// Seals the transaction: commits written slots, prunes touched-empty
    /// accounts (EIP-161), applies scheduled deletions and resets the
    /// per-transaction scope.
    pub fn end_transaction(&mut self) {
        let written: Vec<(Address, Key)> = self.written_slots.iter().copied().collect();
        for (address, key) in written {
            if let Some(entry) = self.data.get_mut(&(address, key)) {
                entry.committed = entry.current;
                entry.committed_known = true;
            }
        }

        let candidates = std::mem::take(&mut self.empty_candidates);
        for address in candidates {
            if self.empty(address) {
                self.accounts_to_delete.push(address);
            }
        }
        let to_delete = std::mem::take(&mut self.accounts_to_delete);
        for address in to_delete {
            if self.cleared.get(&address) == Some(&ClearingState::Cleared) {
                continue;
            }
            self.delete_account_now(address);
        }
        self.reset_transaction_scope();
    }

    /// Rolls back everything the transaction did and resets its scope.
    pub fn abort_transaction(&mut self) {
        self.revert_to_snapshot(0);
        self.reset_transaction_scope();
    }

    /// Deletion taking effect at transaction end: the account state flips
    /// to deleted, nonce and code become real zero-writes, and cached
    /// slots are wiped so they drop out of the block diff.
    fn delete_account_now(&mut self, address: Address) {
        let original = self.accounts.get(&address).and_then(|e| e.original);
        self.accounts.insert(
            address,
            AccountEntry {
                original,
                current: AccountState::Deleted,
            },
        );
        let nonce_original = self.nonces.get(&address).and_then(|e| e.original);
        self.nonces.insert(
            address,
            NonceEntry {
                original: nonce_original,
                current: 0,
            },
        );
        self.codes.insert(
            address,
            CodeEntry {
                code: Some(Bytes::new()),
                size: Some(0),
                hash: Some(EMPTY_CODE_HASH),
                dirty: true,
            },
        );
        let keys: Vec<Key> = self
            .data
            .keys()
            .filter(|(a, _)| *a == address)
            .map(|(_, k)| *k)
            .collect();
        for key in keys {
            self.data.remove(&(address, key));
        }
        self.cleared.insert(address, ClearingState::Cleared);
    }

    fn reset_transaction_scope(&mut self) {
        self.written_slots.clear();
        self.refund = 0;
        self.accessed_addresses.clear();
        self.accessed_slots.clear();
        self.undo.clear();
        self.empty_candidates.clear();
        self.accounts_to_delete.clear();
    }

    /// Materializes the block's net change as one sorted [`Update`] and
    /// applies it to the state, then resets every per-block cache.
    pub fn end_block(&mut self, block: BlockNumber) -> Result<(), StoreError> {
        let update = self.build_update();
        self.state.apply(block, update)?;

        self.accounts.clear();
        self.balances.clear();
        self.nonces.clear();
        self.data.clear();
        self.codes.clear();
        self.cleared.clear();
        self.block_open = false;
        Ok(())
    }

    fn build_update(&mut self) -> Update {
        // deletions: cleared accounts; bump their reincarnation and mark
        // the original as deleted so a recreation shows up as a creation
        let mut deleted: Vec<Address> = self
            .cleared
            .iter()
            .filter(|(_, state)| **state == ClearingState::Cleared)
            .map(|(address, _)| *address)
            .collect();
        deleted.sort_unstable();
        for address in &deleted {
            *self.reincarnation.entry(*address).or_insert(0) += 1;
            if let Some(entry) = self.accounts.get_mut(address) {
                entry.original = Some(AccountState::Deleted);
            }
        }

        let mut created: Vec<Address> = self
            .accounts
            .iter()
            .filter(|(_, entry)| {
                entry.current == AccountState::Exists
                    && entry.original != Some(AccountState::Exists)
            })
            .map(|(address, _)| *address)
            .collect();
        created.sort_unstable();

        let mut balances: Vec<BalanceUpdate> = self
            .balances
            .iter()
            .filter(|(_, entry)| entry.original != Some(entry.current))
            .map(|(address, entry)| BalanceUpdate {
                address: *address,
                balance: entry.current,
            })
            .collect();
        balances.sort_unstable_by_key(|u| u.address);

        let mut nonces: Vec<NonceUpdate> = self
            .nonces
            .iter()
            .filter(|(_, entry)| entry.original != Some(entry.current))
            .map(|(address, entry)| NonceUpdate {
                address: *address,
                nonce: entry.current,
            })
            .collect();
        nonces.sort_unstable_by_key(|u| u.address);

        let mut codes: Vec<CodeUpdate> = self
            .codes
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(address, entry)| CodeUpdate {
                address: *address,
                code: entry.code.clone().unwrap_or_default(),
            })
            .collect();
        codes.sort_unstable_by_key(|u| u.address);

        let mut slots: Vec<SlotUpdate> = self
            .data
            .iter()
            .filter(|(_, entry)| !entry.stored_known || entry.stored != entry.current)
            .map(|((address, key), entry)| SlotUpdate {
                address: *address,
                key: *key,
                value: entry.current,
            })
            .collect();
        slots.sort_unstable_by_key(|u| (u.address, u.key));
        for slot in &slots {
            let reincarnation = self
                .reincarnation
                .get(&slot.address)
                .copied()
                .unwrap_or(0);
            self.stored_data_cache
                .put((slot.address, slot.key), (slot.value, reincarnation));
        }

        Update {
            deleted_accounts: deleted,
            created_accounts: created,
            balances,
            nonces,
            codes,
            slots,
        }
    }

    /// Epoch boundaries only pin a hash; no state transition happens.
    pub fn end_epoch(&mut self) -> Hash {
        self.get_hash()
    }

    pub fn get_hash(&mut self) -> Hash {
        must(self.state.hash())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.state.flush()
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.state.close()
    }

    pub fn get_memory_footprint(&self) -> MemoryFootprint {
        let overlay = (self.accounts.len() + self.balances.len() + self.nonces.len()) * 64
            + self.data.len() * 160
            + self.codes.len() * 128
            + self.stored_data_cache.len() * 72;
        self.state
            .memory_footprint()
            .with_child("overlay", MemoryFootprint::new(overlay as u64))
    }

    /// Height of the archive behind this state, `None` while empty.
    pub fn get_archive_block_height(&self) -> Result<Option<BlockNumber>, StoreError> {
        self.state.archive_block_height()
    }

    /// A read-only overlay over the archived state as of `block`.
    pub fn get_archive_state_db(
        &self,
        block: BlockNumber,
    ) -> Result<NonCommittableStateDb, StoreError> {
        let view = self.state.archive_state(block)?;
        Ok(NonCommittableStateDb {
            db: StateDb::new(view),
        })
    }

    /// Starts a bulk load writing directly to the state, bypassing the
    /// overlay. The returned loader exclusively borrows the overlay so no
    /// block can be processed while the load is running.
    pub fn start_bulk_load(&mut self, block: BlockNumber) -> Result<StateBulkLoad<'_>, StoreError> {
        if self.block_open {
            return Err(StoreError::UnsupportedConfiguration(
                "bulk load may not overlap an open block".into(),
            ));
        }
        let load = start_bulk_load(self.state.clone(), block);
        Ok(StateBulkLoad {
            inner: Some(load),
            db: self,
        })
    }
}

/// Bulk-load session tied to a [`StateDb`]. Finishing applies the load
/// and drops the stored-value cache, which may refer to overwritten data.
pub struct StateBulkLoad<'a> {
    inner: Option<BulkLoad>,
    db: &'a mut StateDb,
}

impl StateBulkLoad<'_> {
    fn load(&mut self) -> &mut BulkLoad {
        self.inner.as_mut().expect("bulk load already finished")
    }

    pub fn create_account(&mut self, address: Address) {
        self.load().create_account(address);
    }

    pub fn set_balance(&mut self, address: Address, balance: Balance) {
        self.load().set_balance(address, balance);
    }

    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) {
        self.load().set_nonce(address, nonce);
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        self.load().set_code(address, code);
    }

    pub fn set_state(&mut self, address: Address, key: Key, value: Value) {
        self.load().set_state(address, key, value);
    }

    pub fn finish(mut self) -> Result<(), StoreError> {
        let load = self.inner.take().expect("bulk load already finished");
        load.finish()?;
        self.db.stored_data_cache.clear();
        Ok(())
    }
}

/// Overlay without commit rights: full transaction processing against a
/// shared state, but no way to end a block or bulk-load. Used for
/// speculative execution by concurrent readers.
pub struct NonCommittableStateDb {
    db: StateDb,
}

impl NonCommittableStateDb {
    pub fn new(state: Arc<dyn State>) -> Self {
        Self {
            db: StateDb::new(state),
        }
    }

    pub fn exist(&mut self, address: Address) -> bool {
        self.db.exist(address)
    }

    pub fn empty(&mut self, address: Address) -> bool {
        self.db.empty(address)
    }

    pub fn create_account(&mut self, address: Address) {
        self.db.create_account(address);
    }

    pub fn suicide(&mut self, address: Address) -> bool {
        self.db.suicide(address)
    }

    pub fn has_suicided(&self, address: Address) -> bool {
        self.db.has_suicided(address)
    }

    pub fn get_balance(&mut self, address: Address) -> Balance {
        self.db.get_balance(address)
    }

    pub fn add_balance(&mut self, address: Address, diff: Balance) {
        self.db.add_balance(address, diff);
    }

    pub fn sub_balance(&mut self, address: Address, diff: Balance) {
        self.db.sub_balance(address, diff);
    }

    pub fn get_nonce(&mut self, address: Address) -> Nonce {
        self.db.get_nonce(address)
    }

    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) {
        self.db.set_nonce(address, nonce);
    }

    pub fn get_code(&mut self, address: Address) -> Bytes {
        self.db.get_code(address)
    }

    pub fn get_code_size(&mut self, address: Address) -> usize {
        self.db.get_code_size(address)
    }

    pub fn get_code_hash(&mut self, address: Address) -> Hash {
        self.db.get_code_hash(address)
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        self.db.set_code(address, code);
    }

    pub fn get_state(&mut self, address: Address, key: Key) -> Value {
        self.db.get_state(address, key)
    }

    pub fn get_committed_state(&mut self, address: Address, key: Key) -> Value {
        self.db.get_committed_state(address, key)
    }

    pub fn set_state(&mut self, address: Address, key: Key, value: Value) {
        self.db.set_state(address, key, value);
    }

    pub fn add_refund(&mut self, amount: u64) {
        self.db.add_refund(amount);
    }

    pub fn sub_refund(&mut self, amount: u64) {
        self.db.sub_refund(amount);
    }

    pub fn get_refund(&self) -> u64 {
        self.db.get_refund()
    }

    pub fn add_address_to_access_list(&mut self, address: Address) {
        self.db.add_address_to_access_list(address);
    }

    pub fn add_slot_to_access_list(&mut self, address: Address, key: Key) {
        self.db.add_slot_to_access_list(address, key);
    }

    pub fn is_address_in_access_list(&self, address: Address) -> bool {
        self.db.is_address_in_access_list(address)
    }

    pub fn is_slot_in_access_list(&self, address: Address, key: Key) -> (bool, bool) {
        self.db.is_slot_in_access_list(address, key)
    }

    pub fn snapshot(&mut self) -> usize {
        self.db.snapshot()
    }

    pub fn revert_to_snapshot(&mut self, snapshot: usize) {
        self.db.revert_to_snapshot(snapshot);
    }

    pub fn begin_transaction(&mut self) {
        self.db.begin_transaction();
    }

    pub fn end_transaction(&mut self) {
        self.db.end_transaction();
    }

    pub fn abort_transaction(&mut self) {
        self.db.abort_transaction();
    }

    pub fn get_hash(&mut self) -> Hash {
        self.db.get_hash()
    }

    pub fn get_memory_footprint(&self) -> MemoryFootprint {
        self.db.get_memory_footprint()
    }

    /// Hands the overlay back; nothing survives it.
    pub fn release(self) {}
}
