//! Preserves a database server's System V shared memory index segments
//! across host reboots.
//!
//! The server keeps its primary and secondary index structures in shared
//! memory so it can fast-restart without rebuilding them from disk. A reboot
//! wipes shared memory; this crate serializes a coherent snapshot of every
//! segment belonging to one instance/namespace to ordinary files, and later
//! reconstitutes the segments bit-for-bit, preserving ownership, mode, and
//! size. Discovery and validation never modify a live segment, and a failed
//! operation removes exactly the files or segments it created.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod display;
pub mod driver;
pub mod error;
pub mod group;
pub mod header;
pub mod inventory;
pub mod key;
pub mod sched;
pub mod shm;
pub mod transfer;

pub use config::{Config, Mode};
pub use error::VaultError;
pub use group::{NamespaceGroup, Side, VersionWindow};
pub use key::{KeyClass, SegmentKey, SegmentRole};
