//! Snapshot and proof payloads used for state migration.
//!
//! A proof pins the component hashes in root order; a snapshot carries
//! the full component contents in a shape that reproduces the exact
//! on-disk layout (and therefore the exact hashes) when replayed into an
//! empty state: index keys in insertion order, store contents dense.

use crate::error::StoreError;
use amber_common::{Address, Balance, Bytes, Hash, Key, Nonce, Value, H256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hashes of the composed state's parts, in root order, plus the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateProof {
    pub part_hashes: Vec<Hash>,
    pub root: Hash,
}

impl StateProof {
    /// Recomputes the root from the part hashes.
    pub fn root_of_parts(parts: &[Hash]) -> Hash {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        H256(hasher.finalize().into())
    }

    /// Checks the internal consistency of the proof itself.
    pub fn is_consistent(&self) -> bool {
        Self::root_of_parts(&self.part_hashes) == self.root
    }
}

/// Serialized contents of a composed state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub proof: StateProof,
    /// Address index keys in insertion order.
    pub addresses: Vec<Address>,
    /// Key index keys in insertion order.
    pub keys: Vec<Key>,
    /// Slot index keys `(address id, key id)` in insertion order.
    pub slot_ids: Vec<(u32, u32)>,
    /// Dense store contents, one entry per assigned id.
    pub account_states: Vec<u8>,
    pub balances: Vec<Balance>,
    pub nonces: Vec<Nonce>,
    pub values: Vec<Value>,
    pub code_hashes: Vec<Hash>,
    /// Dense depot contents.
    pub codes: Vec<Bytes>,
}

impl StateSnapshot {
    /// Structural sanity checks; content verification happens on restore,
    /// where the replayed hashes are compared against the proof.
    pub fn verify(&self) -> Result<(), StoreError> {
        if !self.proof.is_consistent() {
            return Err(StoreError::SnapshotMismatch);
        }
        if self.values.len() != self.slot_ids.len() {
            return Err(StoreError::SnapshotMismatch);
        }
        if self.code_hashes.len() != self.codes.len() {
            return Err(StoreError::SnapshotMismatch);
        }
        let accounts = self.addresses.len();
        if self.account_states.len() > accounts
            || self.balances.len() > accounts
            || self.nonces.len() > accounts
            || self.codes.len() > accounts
        {
            return Err(StoreError::SnapshotMismatch);
        }
        Ok(())
    }
}
