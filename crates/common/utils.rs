use crate::{Hash, H256};
use sha3::{Digest, Keccak256};

/// Computes the Keccak-256 hash of the given bytes.
#[inline]
pub fn keccak(bytes: impl AsRef<[u8]>) -> Hash {
    H256(Keccak256::digest(bytes.as_ref()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EMPTY_CODE_HASH;
    use hex_literal::hex;

    #[test]
    fn keccak_of_empty_matches_constant() {
        assert_eq!(keccak([]), EMPTY_CODE_HASH);
    }

    #[test]
    fn keccak_matches_a_known_vector() {
        assert_eq!(
            keccak(b"abc").as_bytes(),
            hex!("4e03657aea45a94fc7d47ba826c8d667c0d1e6e33a64a036ec44f58fa12d6c45")
        );
    }
}
