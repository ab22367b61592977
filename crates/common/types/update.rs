use crate::{Address, Balance, Bytes, Key, Nonce, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// New balance of a single account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub address: Address,
    pub balance: Balance,
}

/// New nonce of a single account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceUpdate {
    pub address: Address,
    pub nonce: Nonce,
}

/// New contract code of a single account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUpdate {
    pub address: Address,
    pub code: Bytes,
}

/// New value of a single storage slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotUpdate {
    pub address: Address,
    pub key: Key,
    pub value: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpdateError {
    #[error("duplicate {0} entry in update")]
    Duplicate(&'static str),
}

/// Target of an [`Update`] replay.
///
/// Implemented by live-state schemas and by the archive's version index.
pub trait UpdateTarget {
    type Error;

    fn delete_account(&mut self, address: Address) -> Result<(), Self::Error>;
    fn create_account(&mut self, address: Address) -> Result<(), Self::Error>;
    fn set_balance(&mut self, address: Address, balance: Balance) -> Result<(), Self::Error>;
    fn set_nonce(&mut self, address: Address, nonce: Nonce) -> Result<(), Self::Error>;
    fn set_code(&mut self, address: Address, code: &Bytes) -> Result<(), Self::Error>;
    fn set_storage(&mut self, address: Address, key: Key, value: Value)
        -> Result<(), Self::Error>;
}

/// The net effect of one block on the world state.
///
/// Each list is sorted ascending by address (then key for slots) so that
/// two implementations producing the same net change produce the same
/// bytes, and thus the same hashes, everywhere downstream. An update is
/// immutable once handed to `apply`; the archive writer receives a copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub deleted_accounts: Vec<Address>,
    pub created_accounts: Vec<Address>,
    pub balances: Vec<BalanceUpdate>,
    pub nonces: Vec<NonceUpdate>,
    pub codes: Vec<CodeUpdate>,
    pub slots: Vec<SlotUpdate>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.deleted_accounts.is_empty()
            && self.created_accounts.is_empty()
            && self.balances.is_empty()
            && self.nonces.is_empty()
            && self.codes.is_empty()
            && self.slots.is_empty()
    }

    /// Sorts every list into canonical order and rejects duplicates.
    ///
    /// Producers that already emit sorted lists (the overlay does) get a
    /// cheap verification pass out of this.
    pub fn normalize(&mut self) -> Result<(), UpdateError> {
        self.deleted_accounts.sort_unstable();
        self.created_accounts.sort_unstable();
        self.balances.sort_unstable_by_key(|u| u.address);
        self.nonces.sort_unstable_by_key(|u| u.address);
        self.codes.sort_unstable_by_key(|u| u.address);
        self.slots.sort_unstable_by_key(|u| (u.address, u.key));

        if has_adjacent_duplicate(&self.deleted_accounts, |a| *a) {
            return Err(UpdateError::Duplicate("deleted account"));
        }
        if has_adjacent_duplicate(&self.created_accounts, |a| *a) {
            return Err(UpdateError::Duplicate("created account"));
        }
        if has_adjacent_duplicate(&self.balances, |u| u.address) {
            return Err(UpdateError::Duplicate("balance"));
        }
        if has_adjacent_duplicate(&self.nonces, |u| u.address) {
            return Err(UpdateError::Duplicate("nonce"));
        }
        if has_adjacent_duplicate(&self.codes, |u| u.address) {
            return Err(UpdateError::Duplicate("code"));
        }
        if has_adjacent_duplicate(&self.slots, |u| (u.address, u.key)) {
            return Err(UpdateError::Duplicate("slot"));
        }
        Ok(())
    }

    /// Replays the update against a target in the canonical group order:
    /// deletions, creations, balances, nonces, codes, slots.
    pub fn apply_to<T: UpdateTarget>(&self, target: &mut T) -> Result<(), T::Error> {
        for address in &self.deleted_accounts {
            target.delete_account(*address)?;
        }
        for address in &self.created_accounts {
            target.create_account(*address)?;
        }
        for update in &self.balances {
            target.set_balance(update.address, update.balance)?;
        }
        for update in &self.nonces {
            target.set_nonce(update.address, update.nonce)?;
        }
        for update in &self.codes {
            target.set_code(update.address, &update.code)?;
        }
        for update in &self.slots {
            target.set_storage(update.address, update.key, update.value)?;
        }
        Ok(())
    }

    /// Deterministic byte encoding, used for archive hash chaining.
    ///
    /// Each group is a big-endian `u32` count followed by its fixed-layout
    /// records; code bodies are length-prefixed.
    pub fn canonical_encoding(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size_hint());

        out.extend_from_slice(&(self.deleted_accounts.len() as u32).to_be_bytes());
        for address in &self.deleted_accounts {
            out.extend_from_slice(address.as_bytes());
        }
        out.extend_from_slice(&(self.created_accounts.len() as u32).to_be_bytes());
        for address in &self.created_accounts {
            out.extend_from_slice(address.as_bytes());
        }
        out.extend_from_slice(&(self.balances.len() as u32).to_be_bytes());
        for update in &self.balances {
            out.extend_from_slice(update.address.as_bytes());
            out.extend_from_slice(&update.balance.to_big_endian());
        }
        out.extend_from_slice(&(self.nonces.len() as u32).to_be_bytes());
        for update in &self.nonces {
            out.extend_from_slice(update.address.as_bytes());
            out.extend_from_slice(&update.nonce.to_be_bytes());
        }
        out.extend_from_slice(&(self.codes.len() as u32).to_be_bytes());
        for update in &self.codes {
            out.extend_from_slice(update.address.as_bytes());
            out.extend_from_slice(&(update.code.len() as u32).to_be_bytes());
            out.extend_from_slice(&update.code);
        }
        out.extend_from_slice(&(self.slots.len() as u32).to_be_bytes());
        for update in &self.slots {
            out.extend_from_slice(update.address.as_bytes());
            out.extend_from_slice(update.key.as_bytes());
            out.extend_from_slice(update.value.as_bytes());
        }
        out
    }

    fn encoded_size_hint(&self) -> usize {
        24 + self.deleted_accounts.len() * 20
            + self.created_accounts.len() * 20
            + self.balances.len() * 36
            + self.nonces.len() * 28
            + self.codes.iter().map(|c| 24 + c.code.len()).sum::<usize>()
            + self.slots.len() * 84
    }
}

fn has_adjacent_duplicate<T, K: PartialEq>(items: &[T], key: impl Fn(&T) -> K) -> bool {
    items.windows(2).any(|w| key(&w[0]) == key(&w[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccountState;
    use std::collections::BTreeMap;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn normalize_sorts_all_lists() {
        let mut update = Update {
            deleted_accounts: vec![addr(3), addr(1)],
            created_accounts: vec![addr(9), addr(2)],
            balances: vec![
                BalanceUpdate {
                    address: addr(5),
                    balance: Balance::from(5u64),
                },
                BalanceUpdate {
                    address: addr(4),
                    balance: Balance::from(4u64),
                },
            ],
            nonces: vec![],
            codes: vec![],
            slots: vec![
                SlotUpdate {
                    address: addr(1),
                    key: Key::repeat_byte(2),
                    value: Value::repeat_byte(1),
                },
                SlotUpdate {
                    address: addr(1),
                    key: Key::repeat_byte(1),
                    value: Value::repeat_byte(1),
                },
            ],
        };
        update.normalize().unwrap();
        assert_eq!(update.deleted_accounts, vec![addr(1), addr(3)]);
        assert_eq!(update.created_accounts, vec![addr(2), addr(9)]);
        assert_eq!(update.balances[0].address, addr(4));
        assert_eq!(update.slots[0].key, Key::repeat_byte(1));
    }

    #[test]
    fn normalize_rejects_duplicates() {
        let mut update = Update {
            created_accounts: vec![addr(1), addr(1)],
            ..Default::default()
        };
        assert_eq!(
            update.normalize(),
            Err(UpdateError::Duplicate("created account"))
        );
    }

    #[test]
    fn canonical_encoding_is_order_independent_after_normalize() {
        let make = |flip: bool| {
            let mut slots = vec![
                SlotUpdate {
                    address: addr(1),
                    key: Key::repeat_byte(1),
                    value: Value::repeat_byte(7),
                },
                SlotUpdate {
                    address: addr(1),
                    key: Key::repeat_byte(2),
                    value: Value::repeat_byte(8),
                },
            ];
            if flip {
                slots.reverse();
            }
            let mut update = Update {
                slots,
                ..Default::default()
            };
            update.normalize().unwrap();
            update.canonical_encoding()
        };
        assert_eq!(make(false), make(true));
    }

    #[test]
    fn canonical_encoding_has_a_fixed_layout() {
        let update = Update {
            slots: vec![SlotUpdate {
                address: addr(1),
                key: Key::repeat_byte(2),
                value: Value::repeat_byte(3),
            }],
            ..Default::default()
        };
        let bytes = update.canonical_encoding();
        // six u32 section counts plus one 84-byte slot record
        assert_eq!(bytes.len(), 24 + 84);
        for section in 0..5 {
            assert_eq!(&bytes[section * 4..section * 4 + 4], &0u32.to_be_bytes());
        }
        assert_eq!(&bytes[20..24], &1u32.to_be_bytes());
        assert_eq!(&bytes[24..44], addr(1).as_bytes());
    }

    /// A toy target recording the order of operations, to pin the replay
    /// ordering: deletes before creates before value groups.
    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
        accounts: BTreeMap<Address, AccountState>,
    }

    impl UpdateTarget for Recorder {
        type Error = std::convert::Infallible;

        fn delete_account(&mut self, address: Address) -> Result<(), Self::Error> {
            self.ops.push(format!("del {address:?}"));
            self.accounts.insert(address, AccountState::Deleted);
            Ok(())
        }
        fn create_account(&mut self, address: Address) -> Result<(), Self::Error> {
            self.ops.push(format!("new {address:?}"));
            self.accounts.insert(address, AccountState::Exists);
            Ok(())
        }
        fn set_balance(&mut self, _: Address, _: Balance) -> Result<(), Self::Error> {
            self.ops.push("balance".into());
            Ok(())
        }
        fn set_nonce(&mut self, _: Address, _: Nonce) -> Result<(), Self::Error> {
            self.ops.push("nonce".into());
            Ok(())
        }
        fn set_code(&mut self, _: Address, _: &Bytes) -> Result<(), Self::Error> {
            self.ops.push("code".into());
            Ok(())
        }
        fn set_storage(&mut self, _: Address, _: Key, _: Value) -> Result<(), Self::Error> {
            self.ops.push("slot".into());
            Ok(())
        }
    }

    #[test]
    fn apply_to_replays_groups_in_canonical_order() {
        let update = Update {
            deleted_accounts: vec![addr(1)],
            created_accounts: vec![addr(1)],
            balances: vec![BalanceUpdate {
                address: addr(1),
                balance: Balance::from(1u64),
            }],
            nonces: vec![NonceUpdate {
                address: addr(1),
                nonce: 1,
            }],
            codes: vec![CodeUpdate {
                address: addr(1),
                code: Bytes::from_static(&[1]),
            }],
            slots: vec![SlotUpdate {
                address: addr(1),
                key: Key::repeat_byte(1),
                value: Value::repeat_byte(1),
            }],
        };
        let mut recorder = Recorder::default();
        update.apply_to(&mut recorder).unwrap();
        assert!(recorder.ops[0].starts_with("del"));
        assert!(recorder.ops[1].starts_with("new"));
        assert_eq!(&recorder.ops[2..], ["balance", "nonce", "code", "slot"]);
        // a delete-then-create in the same block leaves the account alive
        assert_eq!(recorder.accounts[&addr(1)], AccountState::Exists);
    }
}
