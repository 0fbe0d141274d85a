//! Incremental Change Synchronization: replica-scoped ID-sets and the
//! sync-state object shipped between client and server.

pub mod idset;
pub mod state;

pub use idset::{IdSet, ReplMapping, ReplType};
pub use state::{IcsMode, IcsState};
