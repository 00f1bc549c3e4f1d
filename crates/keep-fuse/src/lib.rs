//! Read-only FUSE view of Keep collections, tags and groups.
//!
//! [`Operations`] holds the inode table, directory nodes and open handles
//! behind one lock and answers each filesystem request; [`KeepFs`] plugs it
//! into `fuser`. Storage, metadata and change notifications are traits with
//! in-memory implementations.

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod file;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod keep;
pub mod manifest;
pub mod node;
pub mod ops;

pub use api::{Filter, Group, GroupContents, Link, ListRequest, MemoryApi, MetadataApi};
pub use config::MountConfig;
pub use directory::Backend;
pub use error::FsError;
pub use events::{Event, EventSource, MemoryEvents, NoEvents, Subscription};
pub use fs::KeepFs;
pub use inode::{InodeTable, ROOT_INO};
pub use keep::{KeepClient, KeepError, MemoryKeep};
pub use manifest::{Manifest, ManifestError};
pub use node::{DirectoryKind, Freshness, Node};
pub use ops::{DirEntry, FsOptions, Layout, Operations};
