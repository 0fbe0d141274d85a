//! The ROP object/handle layer: per-session trees of typed objects and
//! the rop verb functions the MAPI frontends invoke on them.

pub mod ftstream;
pub mod fxics;
pub mod object_tree;
pub mod objects;
pub mod ops;

pub use object_tree::{ObjectTree, RopObject, INVALID_HANDLE, MAX_HANDLE_NUM, ROOT_HANDLE};
pub use ops::Session;
