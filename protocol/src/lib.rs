//! Data formats shared by the heddle engine and command line tool: file names,
//! manifests, entries, tar member names and the block store formats.

pub mod blockstore;
pub mod credentials;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod index;
pub mod manifest;
pub mod naming;
pub mod tarname;
pub mod time;
pub mod verification;

pub use crate::{
    entry::{Device, DeviceKind, Entry, EntryKind, Stat},
    error::Error,
    index::Index,
};

pub type DateTimeUtc = chrono::DateTime<chrono::Utc>;
