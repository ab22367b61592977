// Keep H160, H256, U128 from ethereum_types
pub use bytes::Bytes;
pub use ethereum_types::{H160, H256, U128};

pub mod constants;
pub mod types;
pub mod utils;

/// 20-byte account address.
pub type Address = H160;
/// 32-byte storage slot key.
pub type Key = H256;
/// 32-byte storage slot value. The zero value is the default/absent value.
pub type Value = H256;
/// 32-byte hash. Keccak-256 for code hashes, SHA-256 for composed roots.
pub type Hash = H256;
/// Account balance, persisted as a 16-byte big-endian integer.
pub type Balance = U128;
/// Account nonce, persisted as an 8-byte big-endian integer.
pub type Nonce = u64;
/// Block number.
pub type BlockNumber = u64;
