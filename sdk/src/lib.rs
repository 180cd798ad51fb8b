//! Backup engine of heddle.
//!
//! [`repository::Repository`] stores incremental tar based backup chains on a
//! [`backend::Backend`]; [`blockstore::BlockStore`] keeps a content-addressed block
//! store that can be restored file by file.

pub mod backend;
pub mod blockstore;
pub mod checksum;
pub mod collections;
pub mod crypto;
pub mod delta;
pub mod diff;
pub mod envelope;
pub mod patch;
pub mod repository;
pub mod retry;
pub mod rules;
pub mod signature;
pub mod sigtar;
pub mod tarfile;
pub mod treewriter;
pub mod volume;
pub mod walk;

pub use heddle_protocol::{self as protocol, Error, error};
