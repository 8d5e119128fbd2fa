//! FUSE integration for a key-value namespace
//!
//! # Architecture
//!
//! - `mount`: starts the root watch and a fuser background session
//! - `LiveMount`: a running mount, torn down by `unmount`
//! - `KvFuse`: fuser `Filesystem` implementation delegating to `KvFs`
//! - `InodeTable`: bidirectional inode ↔ path mapping
//!
//! Write-side requests reach the kernel as `EPERM`; only `unlink` is passed
//! through to the backend.

mod filesystem;
mod inode_table;
mod mount;

pub use filesystem::{FuseOptions, KvFuse};
pub use inode_table::InodeTable;
pub use mount::{mount, LiveMount, MountError, FS_NAME};
