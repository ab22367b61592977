mod archive;
mod bulk;
mod codec;
mod depot;
mod hashtree;
mod index;
mod live;
mod memory;
mod multimap;
mod snapshot;
mod state;
mod store;
mod sync;
mod writer;

pub mod error;

pub use archive::{Archive, WitnessProof};
pub use bulk::BulkLoad;
pub use codec::{FixedValue, IndexKey, SlotId};
pub use depot::DepotOptions;
pub use live::ComposedState;
pub use memory::MemoryFootprint;
pub use snapshot::{StateProof, StateSnapshot};
pub use state::{
    open_state, start_bulk_load, ArchiveConfig, Options, PersistentState, Schema, State,
};
pub use store::StoreOptions;
pub use sync::SyncState;
