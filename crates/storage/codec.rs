//! Fixed-width binary encodings shared by the file-backed components.
//!
//! Stores and indices persist dense records, so every key and value type
//! declares its exact on-disk width. All integers are big-endian.

use crate::error::StoreError;
use amber_common::{types::AccountState, Address, Balance, H256};
use std::hash::Hash as StdHash;

/// Fixed-width value stored by a paged store.
///
/// The `Default` value is the zero value: unwritten indices decode to it.
pub trait FixedValue: Clone + Default + PartialEq {
    const SIZE: usize;

    /// Encodes into `out`, which is exactly `SIZE` bytes.
    fn encode_to(&self, out: &mut [u8]);

    /// Decodes from exactly `SIZE` bytes.
    fn decode(bytes: &[u8]) -> Result<Self, StoreError>;
}

impl FixedValue for AccountState {
    const SIZE: usize = 1;

    fn encode_to(&self, out: &mut [u8]) {
        out[0] = self.as_byte();
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        AccountState::from_byte(bytes[0])
            .ok_or_else(|| StoreError::Corrupted(format!("invalid account state {}", bytes[0])))
    }
}

impl FixedValue for Balance {
    const SIZE: usize = 16;

    fn encode_to(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_big_endian());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(Balance::from_big_endian(bytes))
    }
}

impl FixedValue for u64 {
    const SIZE: usize = 8;

    fn encode_to(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }
}

impl FixedValue for H256 {
    const SIZE: usize = 32;

    fn encode_to(&self, out: &mut [u8]) {
        out.copy_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(H256::from_slice(bytes))
    }
}

/// Storage slot identity inside the composed schema: the owning account's
/// address id paired with the slot key's key id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, StdHash)]
pub struct SlotId {
    pub address_id: u32,
    pub key_id: u32,
}

/// Fixed-width key for an [`crate::index::Index`].
pub trait IndexKey: Copy + Eq + StdHash {
    const SIZE: usize;

    fn encode_to(&self, out: &mut [u8]);

    /// Decodes from exactly `SIZE` bytes. Key encodings are total, so this
    /// cannot fail.
    fn decode(bytes: &[u8]) -> Self;
}

impl IndexKey for Address {
    const SIZE: usize = 20;

    fn encode_to(&self, out: &mut [u8]) {
        out.copy_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Address::from_slice(bytes)
    }
}

impl IndexKey for H256 {
    const SIZE: usize = 32;

    fn encode_to(&self, out: &mut [u8]) {
        out.copy_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        H256::from_slice(bytes)
    }
}

impl IndexKey for SlotId {
    const SIZE: usize = 8;

    fn encode_to(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.address_id.to_be_bytes());
        out[4..].copy_from_slice(&self.key_id.to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut a = [0u8; 4];
        let mut k = [0u8; 4];
        a.copy_from_slice(&bytes[..4]);
        k.copy_from_slice(&bytes[4..]);
        SlotId {
            address_id: u32::from_be_bytes(a),
            key_id: u32::from_be_bytes(k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_state_rejects_invalid_bytes() {
        assert!(matches!(
            <AccountState as FixedValue>::decode(&[7]),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn balance_round_trips_big_endian() {
        let balance = Balance::from(0x0102_0304_0506_0708u64);
        let mut buf = [0u8; 16];
        balance.encode_to(&mut buf);
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(<Balance as FixedValue>::decode(&buf).unwrap(), balance);
    }

    #[test]
    fn slot_id_orders_by_address_then_key() {
        let a = SlotId {
            address_id: 1,
            key_id: 9,
        };
        let b = SlotId {
            address_id: 2,
            key_id: 0,
        };
        assert!(a < b);

        let mut buf = [0u8; 8];
        a.encode_to(&mut buf);
        assert_eq!(<SlotId as IndexKey>::decode(&buf), a);
    }
}
