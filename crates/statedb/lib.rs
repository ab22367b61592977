mod statedb;
mod undo;

pub use statedb::{NonCommittableStateDb, StateBulkLoad, StateDb};
