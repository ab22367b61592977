//! The undo log: every overlay mutation pushes one reversible operation.
//!
//! Operations are tagged variants rather than closures; a snapshot id is
//! simply the log length, and a revert pops and applies entries until the
//! log is back at that length.

use crate::statedb::{
    AccountEntry, BalanceEntry, ClearingState, CodeEntry, NonceEntry, SlotEntry, StateDb,
};
use amber_common::{Address, Key};

pub(crate) enum UndoOp {
    /// Restores (or removes) the account cache entry of `address`.
    Account {
        address: Address,
        prev: Option<AccountEntry>,
    },
    Balance {
        address: Address,
        prev: Option<BalanceEntry>,
    },
    Nonce {
        address: Address,
        prev: Option<NonceEntry>,
    },
    Slot {
        address: Address,
        key: Key,
        prev: Option<SlotEntry>,
    },
    Code {
        address: Address,
        prev: Option<CodeEntry>,
    },
    Clearing {
        address: Address,
        prev: Option<ClearingState>,
    },
    Refund {
        prev: u64,
    },
    /// The address was newly added to the access list.
    AccessAddress {
        address: Address,
    },
    /// The slot was newly added to the access list.
    AccessSlot {
        address: Address,
        key: Key,
    },
    /// The slot was newly marked as written in this transaction.
    WrittenSlot {
        address: Address,
        key: Key,
    },
    /// Truncates the empty-candidate list back to `len`.
    EmptyCandidates {
        len: usize,
    },
    /// Truncates the scheduled-deletion list back to `len`.
    AccountsToDelete {
        len: usize,
    },
}

impl UndoOp {
    pub(crate) fn apply(self, db: &mut StateDb) {
        match self {
            UndoOp::Account { address, prev } => restore(&mut db.accounts, address, prev),
            UndoOp::Balance { address, prev } => restore(&mut db.balances, address, prev),
            UndoOp::Nonce { address, prev } => restore(&mut db.nonces, address, prev),
            UndoOp::Slot { address, key, prev } => restore(&mut db.data, (address, key), prev),
            UndoOp::Code { address, prev } => restore(&mut db.codes, address, prev),
            UndoOp::Clearing { address, prev } => restore(&mut db.cleared, address, prev),
            UndoOp::Refund { prev } => db.refund = prev,
            UndoOp::AccessAddress { address } => {
                db.accessed_addresses.remove(&address);
            }
            UndoOp::AccessSlot { address, key } => {
                db.accessed_slots.remove(&(address, key));
            }
            UndoOp::WrittenSlot { address, key } => {
                db.written_slots.remove(&(address, key));
            }
            UndoOp::EmptyCandidates { len } => db.empty_candidates.truncate(len),
            UndoOp::AccountsToDelete { len } => db.accounts_to_delete.truncate(len),
        }
    }
}

fn restore<K: std::hash::Hash + Eq, V>(
    map: &mut rustc_hash::FxHashMap<K, V>,
    key: K,
    prev: Option<V>,
) {
    match prev {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}
