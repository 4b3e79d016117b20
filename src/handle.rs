// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open handles: per-open-session objects binding an entry to a caller.
//!
//! A handle pins its entry's allocation but does not own its lifetime; the
//! entry's open count does. The path is captured at open time, informational
//! and never re-resolved. A handle whose entry was torn down out from under
//! it (eager destruction, core teardown) observes the entry's `Dead` state
//! on its next operation and fails with `BadFileDescriptor`.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entry::Entry;
use crate::error::{FsError, FsResult};
use crate::types::{AppData, FileId, OpenOptions};

pub(crate) struct FileHandleState {
    /// Current offset, advanced by read/write.
    pub offset: u64,
}

/// Handle to an open regular file.
pub struct FileHandle {
    entry: Arc<Entry>,
    path: String,
    options: OpenOptions,
    state: RwLock<FileHandleState>,
    app_data: Mutex<Option<AppData>>,
}

impl FileHandle {
    pub(crate) fn new(entry: Arc<Entry>, path: String, options: OpenOptions) -> Self {
        Self {
            entry,
            path,
            options,
            state: RwLock::new(FileHandleState { offset: 0 }),
            app_data: Mutex::new(None),
        }
    }

    pub(crate) fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    pub(crate) fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// Path the handle was opened under. Informational; never re-resolved.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Id of the entry this handle was opened against. The handle pins the
    /// entry, so this is the open-time id for the whole handle lifetime.
    pub fn file_id(&self) -> FileId {
        self.entry.file_id()
    }

    pub fn set_app_data(&self, data: Option<AppData>) {
        *self.app_data_guard() = data;
    }

    pub(crate) fn read(&self) -> FsResult<RwLockReadGuard<'_, FileHandleState>> {
        self.state.read().map_err(|_| {
            tracing::error!(file_id = self.entry.file_id().0, "file handle lock poisoned");
            FsError::Deadlock
        })
    }

    pub(crate) fn write(&self) -> FsResult<RwLockWriteGuard<'_, FileHandleState>> {
        self.state.write().map_err(|_| {
            tracing::error!(file_id = self.entry.file_id().0, "file handle lock poisoned");
            FsError::Deadlock
        })
    }

    pub(crate) fn app_data_guard(&self) -> MutexGuard<'_, Option<AppData>> {
        match self.app_data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to an open directory.
pub struct DirHandle {
    entry: Arc<Entry>,
    path: String,
    app_data: Mutex<Option<AppData>>,
}

impl DirHandle {
    pub(crate) fn new(entry: Arc<Entry>, path: String, app_data: Option<AppData>) -> Self {
        Self {
            entry,
            path,
            app_data: Mutex::new(app_data),
        }
    }

    pub(crate) fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Id of the directory this handle was opened against.
    pub fn file_id(&self) -> FileId {
        self.entry.file_id()
    }

    pub fn set_app_data(&self, data: Option<AppData>) {
        *self.app_data_guard() = data;
    }

    pub(crate) fn app_data_guard(&self) -> MutexGuard<'_, Option<AppData>> {
        match self.app_data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// What a close surrenders back to the caller.
pub struct Closed {
    /// App-data that was attached to the handle.
    pub handle_data: Option<AppData>,
    /// App-data of the entry, present only when this close destroyed it.
    pub entry_data: Option<AppData>,
}
