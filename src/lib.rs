//! oxmdb: Exchange-compatible mailbox storage and RPC substrate.
//!
//! The crate is organised as a federation of layers, leaves first:
//!
//! - [`types`]: identifiers (EID/XID/CN), property values, restrictions,
//!   and the MAPI-style error codes every fallible call returns.
//! - [`codec`]: the little-endian extension-buffer encoding shared by the
//!   exmdb wire protocol and the on-disk property blobs.
//! - [`ics`]: replica-scoped ID-sets and the incremental-sync state object.
//! - [`store`]: the per-user SQLite mailbox store, content-addressed side
//!   files, and all mutation/notification machinery.
//! - [`exmdb`]: the exmdb RPC protocol with its client pool and server.
//! - [`rop`]: the per-session object/handle tree and FastTransfer streams
//!   that MAPI frontends drive.

pub mod codec;
pub mod config;
pub mod exmdb;
pub mod ics;
pub mod rop;
pub mod store;
pub mod types;
