// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! User-callback dispatch.
//!
//! Hooks run synchronously while the relevant entry is still locked at the
//! operation's contracted level, which gives them atomic access to the
//! entry's app-data slot. In exchange they must not reenter the tree: no
//! operation calls from inside a hook. Hook errors become the operation's
//! error, except `Detach`, which runs in the destruction tail and only logs.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::FsResult;
use crate::types::{AppData, EntryType, FileId};

/// Operation kinds a hook can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Create,
    Mkdir,
    Open,
    Close,
    Read,
    Write,
    Trunc,
    Unlink,
    Rmdir,
    Rename,
    /// Per-entry readdir filter: an error drops that entry from the listing.
    Readdir,
    Getxattr,
    Setxattr,
    Listxattr,
    Removexattr,
    /// Fires exactly once per entry lifecycle, in the destruction tail.
    Detach,
}

/// Context passed to a hook. The entry is locked at the contracted level for
/// the duration of the call.
pub struct HookEvent<'a> {
    pub kind: HookKind,
    /// Normalized path the operation ran against.
    pub path: &'a str,
    /// For renames, the path the entry moved from.
    pub renamed_from: Option<&'a str>,
    pub file_id: FileId,
    pub entry_type: EntryType,
    /// The entry's app-data slot; hooks may read and replace it.
    pub app_data: &'a Mutex<Option<AppData>>,
}

pub type HookFn = Box<dyn Fn(&HookEvent<'_>) -> FsResult<()> + Send + Sync>;

/// Registry of user hooks, keyed by operation kind. Populated before the
/// core is shared and immutable afterwards.
#[derive(Default)]
pub(crate) struct Hooks {
    table: HashMap<HookKind, HookFn>,
}

impl Hooks {
    pub(crate) fn register(&mut self, kind: HookKind, hook: HookFn) {
        self.table.insert(kind, hook);
    }

    pub(crate) fn registered(&self, kind: HookKind) -> bool {
        self.table.contains_key(&kind)
    }

    /// Invoke the hook for `kind`, if any. Errors propagate to the caller.
    pub(crate) fn dispatch(&self, event: &HookEvent<'_>) -> FsResult<()> {
        match self.table.get(&event.kind) {
            Some(hook) => hook(event),
            None => Ok(()),
        }
    }

    /// Detach runs while an entry is being torn down; its errors are logged
    /// and dropped so destruction always completes.
    pub(crate) fn dispatch_detach(&self, event: &HookEvent<'_>) {
        if let Err(err) = self.dispatch(event) {
            tracing::error!(path = event.path, file_id = event.file_id.0, %err, "detach hook failed");
        }
    }
}
