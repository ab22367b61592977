//! Bulk loader: the fast path for initial population.
//!
//! Accumulates writes without any overlay bookkeeping, materializes them
//! as one canonical [`Update`] and applies it on `finish`, which also
//! flushes the state and refreshes its cached hashes. Routing through
//! `apply` keeps the archive consistent with interleaved regular blocks.

use crate::error::StoreError;
use crate::state::State;
use amber_common::types::{BalanceUpdate, CodeUpdate, NonceUpdate, SlotUpdate, Update};
use amber_common::{Address, Balance, BlockNumber, Bytes, Key, Nonce, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

pub struct BulkLoad {
    state: Arc<dyn State>,
    block: BlockNumber,
    created: BTreeSet<Address>,
    balances: BTreeMap<Address, Balance>,
    nonces: BTreeMap<Address, Nonce>,
    codes: BTreeMap<Address, Bytes>,
    slots: BTreeMap<(Address, Key), Value>,
}

impl BulkLoad {
    pub fn new(state: Arc<dyn State>, block: BlockNumber) -> Self {
        Self {
            state,
            block,
            created: BTreeSet::new(),
            balances: BTreeMap::new(),
            nonces: BTreeMap::new(),
            codes: BTreeMap::new(),
            slots: BTreeMap::new(),
        }
    }

    pub fn create_account(&mut self, address: Address) {
        self.created.insert(address);
    }

    pub fn set_balance(&mut self, address: Address, balance: Balance) {
        self.balances.insert(address, balance);
    }

    pub fn set_nonce(&mut self, address: Address, nonce: Nonce) {
        self.nonces.insert(address, nonce);
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        self.codes.insert(address, code);
    }

    pub fn set_state(&mut self, address: Address, key: Key, value: Value) {
        self.slots.insert((address, key), value);
    }

    /// Applies everything accumulated as the update of `block`, flushes
    /// the state and brings its cached hashes up to date.
    pub fn finish(self) -> Result<(), StoreError> {
        let update = Update {
            deleted_accounts: Vec::new(),
            created_accounts: self.created.into_iter().collect(),
            balances: self
                .balances
                .into_iter()
                .map(|(address, balance)| BalanceUpdate { address, balance })
                .collect(),
            nonces: self
                .nonces
                .into_iter()
                .map(|(address, nonce)| NonceUpdate { address, nonce })
                .collect(),
            codes: self
                .codes
                .into_iter()
                .map(|(address, code)| CodeUpdate { address, code })
                .collect(),
            slots: self
                .slots
                .into_iter()
                .map(|((address, key), value)| SlotUpdate {
                    address,
                    key,
                    value,
                })
                .collect(),
        };
        debug!(
            block = self.block,
            created = update.created_accounts.len(),
            slots = update.slots.len(),
            "finishing bulk load"
        );
        self.state.apply(self.block, update)?;
        self.state.flush()?;
        self.state.hash()?;
        Ok(())
    }
}
