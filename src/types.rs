// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions

use serde::{Deserialize, Serialize};
use std::any::Any;

/// Opaque file identifier, unique within one core instance and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry types, mirroring the POSIX file type taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDev,
    BlockDev,
    /// Zombie awaiting the last reference drop. Never observable through
    /// lookup; only stale handles can see it.
    Dead,
}

/// Identity an operation runs as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Metadata snapshot returned by stat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub file_id: FileId,
    pub kind: EntryType,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Directory entry snapshot returned by readdir. Owned; independent of the
/// live tree once returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryType,
    pub file_id: FileId,
}

/// File open options
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    /// Create the file if it does not exist, with `mode`.
    pub create: bool,
    pub mode: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            truncate: false,
            create: false,
            mode: 0o644,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }
}

/// Flags controlling setxattr creation semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SetxattrFlags {
    /// Insert or replace.
    #[default]
    Upsert,
    /// Fail with `AlreadyExists` if the attribute is present.
    Create,
    /// Fail with `NotFound` if the attribute is absent.
    Replace,
}

/// Clock source supplying filesystem timestamps. Without one installed, all
/// timestamps are zero.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Opaque caller state attached to entries, handles, and the core itself.
pub type AppData = Box<dyn Any + Send + Sync>;
