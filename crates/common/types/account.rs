use serde::{Deserialize, Serialize};

/// Lifecycle state of an account in the live state.
///
/// `Unknown` and `Deleted` are externally indistinguishable (neither
/// account exists); the distinction lets a schema keep a cheap tombstone
/// for accounts that existed at some point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountState {
    /// The account was never created.
    #[default]
    Unknown,
    /// The account currently exists.
    Exists,
    /// The account existed and has been deleted.
    Deleted,
}

impl AccountState {
    /// One-byte encoding used by the accounts store.
    pub fn as_byte(self) -> u8 {
        match self {
            AccountState::Unknown => 0,
            AccountState::Exists => 1,
            AccountState::Deleted => 2,
        }
    }

    /// Inverse of [`Self::as_byte`]. Unknown encodings are `None`.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AccountState::Unknown),
            1 => Some(AccountState::Exists),
            2 => Some(AccountState::Deleted),
            _ => None,
        }
    }

    /// Whether this state represents an existing account.
    pub fn exists(self) -> bool {
        matches!(self, AccountState::Exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_encoding_round_trips() {
        for state in [
            AccountState::Unknown,
            AccountState::Exists,
            AccountState::Deleted,
        ] {
            assert_eq!(AccountState::from_byte(state.as_byte()), Some(state));
        }
        assert_eq!(AccountState::from_byte(3), None);
    }

    #[test]
    fn zero_byte_is_the_default() {
        assert_eq!(AccountState::from_byte(0), Some(AccountState::default()));
    }
}
