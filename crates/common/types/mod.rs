mod account;
mod update;

pub use account::AccountState;
pub use update::{
    BalanceUpdate, CodeUpdate, NonceUpdate, SlotUpdate, Update, UpdateError, UpdateTarget,
};
