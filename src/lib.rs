// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! memfs-core: a library for building multi-threaded in-memory filesystems.
//!
//! The core is a concurrent directory tree with POSIX-style semantics: path
//! resolution, directories, regular files, symbolic links, extended
//! attributes, and open handles, with no block device underneath. Consumers
//! embed it to back virtual filesystems, test harnesses, or user-space
//! daemons.
//!
//! Every entry carries its own readers/writer lock; operations cross
//! multiple entries in a fixed order (parent before child, handle before
//! entry) so they never deadlock. Entries unlinked while handles are still
//! open survive, unreachable, until the last close — destruction requires
//! both the link count and the open count to reach zero. User hooks run
//! synchronously at well-defined points with the affected entry still
//! locked.
//!
//! ```
//! use memfs_core::{Credentials, FsConfig, FsCore};
//!
//! let fs = FsCore::new(FsConfig::default()).unwrap();
//! let cred = Credentials::root();
//! fs.mkdir("/tmp", &cred, 0o755).unwrap();
//! let fh = fs.create("/tmp/hello", &cred, 0o644).unwrap();
//! fs.write(&fh, b"hi", 0).unwrap();
//! fs.close(fh).unwrap();
//! ```

pub mod config;
mod entry;
mod entry_set;
pub mod error;
mod handle;
pub mod hooks;
mod resolve;
pub mod types;
mod vfs;

pub use config::{FsConfig, FsLimits, SecurityPolicy};
pub use error::{FsError, FsResult};
pub use handle::{Closed, DirHandle, FileHandle};
pub use hooks::{HookEvent, HookKind};
pub use types::{
    AppData, Clock, Credentials, DirEntry, EntryType, FileId, OpenOptions, SetxattrFlags, Stat,
};
pub use vfs::FsCore;
