// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem core: root entry, file-id allocation, hook registry, and
//! the operations surface.
//!
//! Every operation follows the same contract: validate inputs, resolve the
//! path, mutate entries under the appropriate locks, invoke the user hook
//! (if registered) while the relevant entry is still locked, release locks
//! in reverse order, return. Guards make the reverse-order release
//! structural.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::FsConfig;
use crate::entry::{attach, detach, DestroyOutcome, Entry, EntryKind, EntryState};
use crate::entry_set::ChildRef;
use crate::error::{FsError, FsResult};
use crate::handle::{Closed, DirHandle, FileHandle};
use crate::hooks::{HookEvent, HookKind, Hooks};
use crate::resolve;
use crate::types::{
    AppData, Clock, Credentials, DirEntry, EntryType, FileId, OpenOptions, SetxattrFlags, Stat,
};

const ROOT_FILE_ID: u64 = 1;

/// A filesystem instance.
///
/// The hook registry and clock are configured before the core is shared
/// across threads; operations treat both as immutable.
pub struct FsCore {
    config: FsConfig,
    root: Arc<Entry>,
    next_file_id: AtomicU64,
    hooks: Hooks,
    clock: Option<Arc<dyn Clock>>,
    app_data: Mutex<Option<AppData>>,
}

impl FsCore {
    pub fn new(config: FsConfig) -> FsResult<Self> {
        let cred = Credentials::new(config.security.default_uid, config.security.default_gid);
        let root = Entry::new_directory(FileId(ROOT_FILE_ID), &cred, 0o755, 0, None)?;
        {
            // The core itself pins the root: it is never destroyable by
            // normal operations.
            let mut st = root.write()?;
            st.name = Some("/".to_string());
            st.link_count = 1;
        }
        Ok(Self {
            config,
            root,
            next_file_id: AtomicU64::new(ROOT_FILE_ID + 1),
            hooks: Hooks::default(),
            clock: None,
            app_data: Mutex::new(None),
        })
    }

    /// Register a user hook. Takes `&mut self`: the registry is fixed once
    /// the core is shared.
    pub fn register_hook<F>(&mut self, kind: HookKind, hook: F)
    where
        F: Fn(&HookEvent<'_>) -> FsResult<()> + Send + Sync + 'static,
    {
        self.hooks.register(kind, Box::new(hook));
    }

    /// Install the timestamp source. Without one, timestamps stay zero.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = Some(clock);
    }

    pub fn set_app_data(&mut self, data: Option<AppData>) {
        *self.app_data_guard() = data;
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Tear the instance down: drain the tree depth-first, firing remaining
    /// detach hooks, and surrender the core's app-data. Handles still open
    /// against this core go stale.
    pub fn destroy(self) -> FsResult<Option<AppData>> {
        let root = Arc::clone(&self.root);
        self.reap_dir("/", &root)?;
        {
            let mut st = root.write()?;
            st.link_count = 0;
            self.fire_detach("/", &root, &st);
            let _ = root.try_destroy(&mut st, false);
        }
        Ok(self.app_data_guard().take())
    }

    fn app_data_guard(&self) -> MutexGuard<'_, Option<AppData>> {
        match self.app_data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn now(&self) -> i64 {
        self.clock.as_ref().map(|c| c.now()).unwrap_or(0)
    }

    fn alloc_file_id(&self) -> FileId {
        FileId(self.next_file_id.fetch_add(1, Ordering::Relaxed))
    }

    fn norm(&self, path: &str) -> FsResult<String> {
        resolve::normalize(path, &self.config.limits)
    }

    fn with_read<T>(
        &self,
        norm: &str,
        cred: &Credentials,
        follow: bool,
        f: impl FnOnce(&Arc<Entry>, &EntryState) -> FsResult<T>,
    ) -> FsResult<T> {
        resolve::with_entry_read(
            &self.root,
            norm,
            cred,
            &self.config.security,
            &self.config.limits,
            follow,
            f,
        )
    }

    fn with_write<T>(
        &self,
        norm: &str,
        cred: &Credentials,
        follow: bool,
        f: impl FnOnce(&Arc<Entry>, &mut EntryState) -> FsResult<T>,
    ) -> FsResult<T> {
        resolve::with_entry_write(
            &self.root,
            norm,
            cred,
            &self.config.security,
            &self.config.limits,
            follow,
            f,
        )
    }

    fn hook_event(
        &self,
        kind: HookKind,
        path: &str,
        renamed_from: Option<&str>,
        entry: &Arc<Entry>,
        entry_type: EntryType,
    ) -> FsResult<()> {
        if !self.hooks.registered(kind) {
            return Ok(());
        }
        let event = HookEvent {
            kind,
            path,
            renamed_from,
            file_id: entry.file_id(),
            entry_type,
            app_data: entry.app_data(),
        };
        self.hooks.dispatch(&event)
    }

    fn fire_detach(&self, path: &str, entry: &Arc<Entry>, st: &EntryState) {
        if !self.hooks.registered(HookKind::Detach) {
            return;
        }
        let event = HookEvent {
            kind: HookKind::Detach,
            path,
            renamed_from: None,
            file_id: entry.file_id(),
            entry_type: st.entry_type(),
            app_data: entry.app_data(),
        };
        self.hooks.dispatch_detach(&event);
    }

    /// Destroy the entry if its counts allow it, firing the detach hook in
    /// the destruction tail. Caller holds the write lock. Returns the
    /// surrendered entry app-data when destruction happened.
    fn try_destroy_and_free(
        &self,
        path: &str,
        entry: &Arc<Entry>,
        st: &mut EntryState,
    ) -> Option<AppData> {
        self.try_destroy_with(path, entry, st, self.config.deferred_destroy)
    }

    fn try_destroy_with(
        &self,
        path: &str,
        entry: &Arc<Entry>,
        st: &mut EntryState,
        deferred: bool,
    ) -> Option<AppData> {
        if !st.destroyable(deferred) {
            return None;
        }
        // The hook sees the entry with content intact, one last time.
        self.fire_detach(path, entry, st);
        match entry.try_destroy(st, deferred) {
            DestroyOutcome::Destroyed(data) => data,
            DestroyOutcome::Kept => None,
        }
    }

    /// Shared tail of create/mkdir/symlink/mknod: resolve the parent
    /// write-locked, refuse duplicates, build and attach the child, run the
    /// hook with the child still locked, then `finish` (which runs only
    /// after a successful hook).
    fn attach_new<T>(
        &self,
        path: &str,
        cred: &Credentials,
        hook: Option<HookKind>,
        build: impl FnOnce(&Arc<Entry>, FileId, i64) -> FsResult<Arc<Entry>>,
        finish: impl FnOnce(&str, &Arc<Entry>, &mut EntryState) -> FsResult<T>,
    ) -> FsResult<T> {
        let norm = self.norm(path)?;
        let (dirname, basename) = resolve::split(&norm)?;
        self.with_write(&dirname, cred, true, |parent, ps| {
            ps.dir()?;
            if !ps.allows(cred, false, true, true, &self.config.security) {
                return Err(FsError::AccessDenied);
            }
            if ps.dir()?.find(&basename).is_some() {
                return Err(FsError::AlreadyExists);
            }
            let id = self.alloc_file_id();
            let now = self.now();
            let child = build(parent, id, now)?;
            let mut cs = child.write()?;
            attach(ps, &basename, &child, &mut cs, now)?;
            if let Some(kind) = hook {
                // A hook failure surfaces as the operation's error, but the
                // insertion stands; callers wanting rollback unlink.
                self.hook_event(kind, &norm, None, &child, cs.entry_type())?;
            }
            finish(&norm, &child, &mut cs)
        })
    }

    // File operations

    /// Create a regular file and return an open read/write handle to it.
    pub fn create(&self, path: &str, cred: &Credentials, mode: u32) -> FsResult<FileHandle> {
        let opts = OpenOptions {
            read: true,
            write: true,
            append: false,
            truncate: false,
            create: true,
            mode,
        };
        self.create_with(path, cred, &opts)
    }

    fn create_with(
        &self,
        path: &str,
        cred: &Credentials,
        opts: &OpenOptions,
    ) -> FsResult<FileHandle> {
        let mode = opts.mode;
        self.attach_new(
            path,
            cred,
            Some(HookKind::Create),
            |_, id, now| Ok(Entry::new(id, EntryKind::File(Vec::new()), cred, mode, now)),
            |norm, child, cs| {
                cs.open_count += 1;
                Ok(FileHandle::new(Arc::clone(child), norm.to_string(), opts.clone()))
            },
        )
    }

    /// Open an existing regular file, or create it when `opts.create` is
    /// set and the terminal segment is absent.
    pub fn open(&self, path: &str, cred: &Credentials, opts: &OpenOptions) -> FsResult<FileHandle> {
        let norm = self.norm(path)?;
        loop {
            let attempt = self.with_write(&norm, cred, true, |entry, st| {
                match &st.kind {
                    EntryKind::File(_) => {}
                    EntryKind::Directory(_) => return Err(FsError::IsADirectory),
                    _ => return Err(FsError::InvalidArgument),
                }
                let want_write = opts.write || opts.append || opts.truncate;
                if !st.allows(cred, opts.read, want_write, false, &self.config.security) {
                    return Err(FsError::AccessDenied);
                }
                if opts.truncate && want_write {
                    let now = self.now();
                    st.file_mut()?.clear();
                    st.mtime = now;
                    st.ctime = now;
                }
                st.open_count += 1;
                if let Err(err) =
                    self.hook_event(HookKind::Open, &norm, None, entry, st.entry_type())
                {
                    st.open_count -= 1;
                    return Err(err);
                }
                Ok(FileHandle::new(Arc::clone(entry), norm.clone(), opts.clone()))
            });
            match attempt {
                Err(FsError::NotFound) if opts.create => {
                    match self.create_with(path, cred, opts) {
                        Ok(handle) => return Ok(handle),
                        // lost the create race; the name exists now, reopen
                        Err(FsError::AlreadyExists) => continue,
                        Err(err) => return Err(err),
                    }
                }
                other => return other,
            }
        }
    }

    /// Close a file handle, surrendering its app-data. If this was the last
    /// reference to an unlinked entry, the entry is destroyed and its
    /// app-data comes back too.
    pub fn close(&self, handle: FileHandle) -> FsResult<Closed> {
        let entry = Arc::clone(handle.entry());
        let entry_data = {
            let _hs = handle.write()?;
            let mut st = entry.write()?;
            if matches!(st.kind, EntryKind::Dead) {
                // Entry was torn down under a stale handle; nothing to undo.
                None
            } else {
                st.open_count = st.open_count.saturating_sub(1);
                let hook_result =
                    self.hook_event(HookKind::Close, handle.path(), None, &entry, st.entry_type());
                let data = self.try_destroy_and_free(handle.path(), &entry, &mut st);
                hook_result?;
                data
            }
        };
        let handle_data = handle.app_data_guard().take();
        Ok(Closed {
            handle_data,
            entry_data,
        })
    }

    /// Read up to `buf.len()` bytes at `offset`. Reads past end return 0.
    pub fn read(&self, handle: &FileHandle, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if !handle.options().read {
            return Err(FsError::BadFileDescriptor);
        }
        let _hs = handle.read()?;
        let entry = handle.entry();
        let st = entry.read()?;
        let data = st.file()?;
        let size = data.len() as u64;
        let n = if offset >= size {
            0
        } else {
            (size - offset).min(buf.len() as u64) as usize
        };
        if n > 0 {
            let start = offset as usize;
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        self.hook_event(HookKind::Read, handle.path(), None, entry, st.entry_type())?;
        Ok(n)
    }

    /// Write `buf` at `offset` (or at end-of-file in append mode), growing
    /// the file and zero-filling any gap.
    pub fn write(&self, handle: &FileHandle, buf: &[u8], offset: u64) -> FsResult<usize> {
        if !handle.options().write && !handle.options().append {
            return Err(FsError::BadFileDescriptor);
        }
        let mut hs = handle.write()?;
        let entry = handle.entry();
        let mut st = entry.write()?;
        let now = self.now();

        let data = st.file_mut()?;
        let pos = if handle.options().append {
            data.len() as u64
        } else {
            offset
        };
        let end = pos.checked_add(buf.len() as u64).ok_or(FsError::FileTooLarge)?;
        if end > usize::MAX as u64 {
            return Err(FsError::FileTooLarge);
        }
        let (pos, end) = (pos as usize, end as usize);
        if end > data.len() {
            data.try_reserve(end - data.len()).map_err(|_| FsError::NoMemory)?;
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(buf);
        st.mtime = now;
        st.ctime = now;
        hs.offset = end as u64;
        self.hook_event(HookKind::Write, handle.path(), None, entry, st.entry_type())?;
        Ok(buf.len())
    }

    /// Resize the file; growth zero-fills.
    pub fn trunc(&self, handle: &FileHandle, new_size: u64) -> FsResult<()> {
        if !handle.options().write && !handle.options().append {
            return Err(FsError::BadFileDescriptor);
        }
        let _hs = handle.write()?;
        let entry = handle.entry();
        let mut st = entry.write()?;
        let now = self.now();

        if new_size > usize::MAX as u64 {
            return Err(FsError::FileTooLarge);
        }
        let data = st.file_mut()?;
        let new_len = new_size as usize;
        if new_len > data.len() {
            data.try_reserve(new_len - data.len()).map_err(|_| FsError::NoMemory)?;
        }
        data.resize(new_len, 0);
        st.mtime = now;
        st.ctime = now;
        self.hook_event(HookKind::Trunc, handle.path(), None, entry, st.entry_type())?;
        Ok(())
    }

    /// Remove a non-directory name. With handles still open against the
    /// entry, destruction waits for the last close.
    pub fn unlink(&self, path: &str, cred: &Credentials) -> FsResult<()> {
        let norm = self.norm(path)?;
        let (dirname, basename) = resolve::split(&norm)?;
        if basename == "." || basename == ".." {
            return Err(FsError::InvalidArgument);
        }
        self.with_write(&dirname, cred, true, |_, ps| {
            ps.dir()?;
            if !ps.allows(cred, false, true, true, &self.config.security) {
                return Err(FsError::AccessDenied);
            }
            let child = ps
                .dir()?
                .find(&basename)
                .and_then(|c| c.upgrade())
                .ok_or(FsError::NotFound)?;
            let mut cs = child.write()?;
            if matches!(cs.kind, EntryKind::Directory(_)) {
                return Err(FsError::IsADirectory);
            }
            detach(ps, &basename, &mut cs, self.now())?;
            let hook_result =
                self.hook_event(HookKind::Unlink, &norm, None, &child, cs.entry_type());
            let _ = self.try_destroy_and_free(&norm, &child, &mut cs);
            hook_result
        })
    }

    // Directory operations

    pub fn mkdir(&self, path: &str, cred: &Credentials, mode: u32) -> FsResult<()> {
        self.attach_new(
            path,
            cred,
            Some(HookKind::Mkdir),
            |parent, id, now| Entry::new_directory(id, cred, mode, now, Some(parent)),
            |_, _, _| Ok(()),
        )
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str, cred: &Credentials) -> FsResult<()> {
        let norm = self.norm(path)?;
        let (dirname, basename) = resolve::split(&norm)?;
        if basename == "." || basename == ".." {
            return Err(FsError::InvalidArgument);
        }
        self.with_write(&dirname, cred, true, |_, ps| {
            ps.dir()?;
            if !ps.allows(cred, false, true, true, &self.config.security) {
                return Err(FsError::AccessDenied);
            }
            let child = ps
                .dir()?
                .find(&basename)
                .and_then(|c| c.upgrade())
                .ok_or(FsError::NotFound)?;
            let mut cs = child.write()?;
            // only `.` and `..` may remain
            if cs.dir()?.live_len() > 2 {
                return Err(FsError::NotEmpty);
            }
            detach(ps, &basename, &mut cs, self.now())?;
            let hook_result =
                self.hook_event(HookKind::Rmdir, &norm, None, &child, cs.entry_type());
            let _ = self.try_destroy_and_free(&norm, &child, &mut cs);
            hook_result
        })
    }

    /// Open a directory handle with an optional app-data payload.
    pub fn opendir(
        &self,
        path: &str,
        cred: &Credentials,
        app_data: Option<AppData>,
    ) -> FsResult<DirHandle> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |entry, st| {
            st.dir()?;
            if !st.allows(cred, true, false, false, &self.config.security) {
                return Err(FsError::AccessDenied);
            }
            st.open_count += 1;
            if let Err(err) = self.hook_event(HookKind::Open, &norm, None, entry, st.entry_type())
            {
                st.open_count -= 1;
                return Err(err);
            }
            Ok(DirHandle::new(Arc::clone(entry), norm.clone(), app_data))
        })
    }

    /// Close a directory handle; symmetric to [`close`](Self::close).
    pub fn closedir(&self, handle: DirHandle) -> FsResult<Closed> {
        let entry = Arc::clone(handle.entry());
        let entry_data = {
            let mut st = entry.write()?;
            if matches!(st.kind, EntryKind::Dead) {
                None
            } else {
                st.open_count = st.open_count.saturating_sub(1);
                let hook_result =
                    self.hook_event(HookKind::Close, handle.path(), None, &entry, st.entry_type());
                let data = self.try_destroy_and_free(handle.path(), &entry, &mut st);
                hook_result?;
                data
            }
        };
        let handle_data = handle.app_data_guard().take();
        Ok(Closed {
            handle_data,
            entry_data,
        })
    }

    /// Snapshot up to `count` positions of the directory starting at
    /// `offset`. Positions are stable across removals (tombstoned slots are
    /// skipped), so a cursor survives concurrent unlinks. An offset at or
    /// past the end returns an empty list.
    pub fn readdir(&self, handle: &DirHandle, offset: u64, count: u64) -> FsResult<Vec<DirEntry>> {
        let dent = handle.entry();
        let st = dent.read()?;
        let set = match &st.kind {
            EntryKind::Directory(set) => set,
            EntryKind::Dead => return Err(FsError::BadFileDescriptor),
            _ => return Err(FsError::NotADirectory),
        };

        let len = set.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = len.min(offset.saturating_add(count));

        let mut entries = Vec::new();
        for i in offset..end {
            let i = i as usize;
            let (name, child) = match (set.name_at(i), set.child_at(i)) {
                (Some(n), Some(c)) => (n, c),
                _ => continue, // tombstone
            };

            let snapshot = if name == "." {
                // self: already locked
                DirEntry {
                    name: ".".to_string(),
                    kind: st.entry_type(),
                    file_id: dent.file_id(),
                }
            } else if name == ".." {
                // The parent's id and type are immutable, so no lock is
                // needed even when `..` is not ourselves.
                match child.upgrade() {
                    Some(up) => DirEntry {
                        name: "..".to_string(),
                        kind: EntryType::Directory,
                        file_id: up.file_id(),
                    },
                    None => continue,
                }
            } else {
                let child = match child.upgrade() {
                    Some(c) => c,
                    None => continue,
                };
                let cs = child.read()?;
                // skip entries that are mid-deletion
                if !cs.is_live() || cs.name.is_none() {
                    continue;
                }
                if self.hooks.registered(HookKind::Readdir) {
                    let event = HookEvent {
                        kind: HookKind::Readdir,
                        path: handle.path(),
                        renamed_from: None,
                        file_id: child.file_id(),
                        entry_type: cs.entry_type(),
                        app_data: child.app_data(),
                    };
                    // the readdir hook is a per-entry filter
                    if self.hooks.dispatch(&event).is_err() {
                        continue;
                    }
                }
                tracing::debug!(dir = handle.path(), name, "readdir entry");
                DirEntry {
                    name: name.to_string(),
                    kind: cs.entry_type(),
                    file_id: child.file_id(),
                }
            };
            entries.push(snapshot);
        }
        Ok(entries)
    }

    /// Snapshot the whole directory.
    pub fn listdir(&self, handle: &DirHandle) -> FsResult<Vec<DirEntry>> {
        self.readdir(handle, 0, u64::MAX)
    }

    /// Atomically move `old` to `new`. Renaming a path onto itself is a
    /// no-op; an existing destination is replaced if compatible and empty.
    pub fn rename(&self, old: &str, new: &str, cred: &Credentials) -> FsResult<()> {
        let old_n = self.norm(old)?;
        let new_n = self.norm(new)?;
        if old_n == new_n {
            return Ok(());
        }
        let (od, ob) = resolve::split(&old_n)?;
        let (nd, nb) = resolve::split(&new_n)?;
        if ob == "." || ob == ".." || nb == "." || nb == ".." {
            return Err(FsError::InvalidArgument);
        }
        // a directory cannot move into its own subtree
        if nd == old_n || nd.starts_with(&format!("{}/", old_n)) {
            return Err(FsError::InvalidArgument);
        }

        let policy = &self.config.security;
        let limits = &self.config.limits;
        let pa = resolve::walk(&self.root, &od, cred, policy, limits, true)?;
        let pb = resolve::walk(&self.root, &nd, cred, policy, limits, true)?;

        if Arc::ptr_eq(&pa, &pb) {
            let mut ps = pa.write()?;
            if !ps.is_live() {
                return Err(FsError::NotFound);
            }
            return self.rename_locked(cred, &old_n, &new_n, &ob, &nb, &pb, &mut *ps, None);
        }

        // Unrelated parents lock in lexicographic path order; equal paths
        // (a racing rename moved things) tie-break on file id.
        let a_first = if od != nd {
            od < nd
        } else {
            pa.file_id() <= pb.file_id()
        };
        let mut ga;
        let mut gb;
        if a_first {
            ga = pa.write()?;
            gb = pb.write()?;
        } else {
            gb = pb.write()?;
            ga = pa.write()?;
        }
        if !ga.is_live() || !gb.is_live() {
            return Err(FsError::NotFound);
        }
        self.rename_locked(cred, &old_n, &new_n, &ob, &nb, &pb, &mut *ga, Some(&mut *gb))
    }

    #[allow(clippy::too_many_arguments)]
    fn rename_locked(
        &self,
        cred: &Credentials,
        old_path: &str,
        new_path: &str,
        old_name: &str,
        new_name: &str,
        new_parent: &Arc<Entry>,
        src_parent: &mut EntryState,
        mut dst_parent: Option<&mut EntryState>,
    ) -> FsResult<()> {
        let policy = &self.config.security;
        if !src_parent.allows(cred, false, true, true, policy) {
            return Err(FsError::AccessDenied);
        }
        if let Some(dp) = dst_parent.as_deref() {
            if !dp.allows(cred, false, true, true, policy) {
                return Err(FsError::AccessDenied);
            }
        }

        let src = src_parent
            .dir()?
            .find(old_name)
            .and_then(|c| c.upgrade())
            .ok_or(FsError::NotFound)?;
        let dst = {
            let dset = match dst_parent.as_deref() {
                Some(dp) => dp.dir()?,
                None => src_parent.dir()?,
            };
            dset.find(new_name).and_then(|c| c.upgrade())
        };
        if let Some(d) = &dst {
            if Arc::ptr_eq(&src, d) {
                // both names already refer to the same entry
                return Ok(());
            }
        }

        // children lock after both parents, lower file id first
        let (mut src_st, mut dst_st) = match &dst {
            Some(d) if d.file_id() < src.file_id() => {
                let ds = d.write()?;
                (src.write()?, Some(ds))
            }
            Some(d) => {
                let ss = src.write()?;
                (ss, Some(d.write()?))
            }
            None => (src.write()?, None),
        };

        let src_is_dir = matches!(src_st.kind, EntryKind::Directory(_));
        let now = self.now();

        if let Some(ds) = dst_st.as_mut() {
            let dst_is_dir = matches!(ds.kind, EntryKind::Directory(_));
            if src_is_dir && !dst_is_dir {
                return Err(FsError::NotADirectory);
            }
            if !src_is_dir && dst_is_dir {
                return Err(FsError::IsADirectory);
            }
            if dst_is_dir && ds.dir()?.live_len() > 2 {
                return Err(FsError::NotEmpty);
            }
            {
                let dparent: &mut EntryState = match dst_parent.as_deref_mut() {
                    Some(dp) => dp,
                    None => src_parent,
                };
                detach(dparent, new_name, ds, now)?;
            }
            let dst_arc = dst.as_ref().expect("destination state implies an entry");
            let _ = self.try_destroy_and_free(new_path, dst_arc, ds);
        }
        drop(dst_st);

        {
            let open_count = src_parent.open_count;
            let set = src_parent.dir_mut()?;
            set.remove(old_name).ok_or(FsError::NotFound)?;
            if open_count == 0 {
                set.compact();
            }
        }
        {
            let dparent: &mut EntryState = match dst_parent.as_deref_mut() {
                Some(dp) => dp,
                None => src_parent,
            };
            dparent.dir_mut()?.insert(new_name, ChildRef::Owned(Arc::clone(&src)))?;
            dparent.mtime = now;
            dparent.ctime = now;
        }
        src_parent.mtime = now;
        src_parent.ctime = now;
        src_st.name = Some(new_name.to_string());
        src_st.ctime = now;

        // a directory that changed parents re-points its `..`
        if src_is_dir && dst_parent.is_some() {
            let set = src_st.dir_mut()?;
            set.remove("..");
            set.insert("..", ChildRef::Back(Arc::downgrade(new_parent)))?;
        }

        self.hook_event(
            HookKind::Rename,
            new_path,
            Some(old_path),
            &src,
            src_st.entry_type(),
        )
    }

    // Links

    /// Create a symbolic link at `linkpath` whose content is `target`,
    /// stored unresolved.
    pub fn symlink(&self, target: &str, linkpath: &str, cred: &Credentials) -> FsResult<()> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if target.len() > self.config.limits.max_path_len {
            return Err(FsError::NameTooLong);
        }
        let target = target.to_string();
        self.attach_new(
            linkpath,
            cred,
            None,
            move |_, id, now| Ok(Entry::new(id, EntryKind::Symlink(target), cred, 0o777, now)),
            |_, _, _| Ok(()),
        )
    }

    /// Read a symlink's target without following it.
    pub fn readlink(&self, path: &str, cred: &Credentials) -> FsResult<String> {
        let norm = self.norm(path)?;
        self.with_read(&norm, cred, false, |_, st| match &st.kind {
            EntryKind::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        })
    }

    /// Hard-link `old` under `new`. Directories cannot be hard-linked.
    pub fn link(&self, old: &str, new: &str, cred: &Credentials) -> FsResult<()> {
        let old_n = self.norm(old)?;
        let new_n = self.norm(new)?;
        let (dirname, basename) = resolve::split(&new_n)?;
        if basename == "." || basename == ".." {
            return Err(FsError::InvalidArgument);
        }
        let policy = &self.config.security;
        let src = resolve::walk(&self.root, &old_n, cred, policy, &self.config.limits, false)?;
        self.with_write(&dirname, cred, true, |_, ps| {
            ps.dir()?;
            if !ps.allows(cred, false, true, true, policy) {
                return Err(FsError::AccessDenied);
            }
            if ps.dir()?.find(&basename).is_some() {
                return Err(FsError::AlreadyExists);
            }
            let mut ss = src.write()?;
            if !ss.is_live() {
                return Err(FsError::NotFound);
            }
            if matches!(ss.kind, EntryKind::Directory(_)) {
                return Err(FsError::IsADirectory);
            }
            attach(ps, &basename, &src, &mut ss, self.now())
        })
    }

    /// Create a special node (fifo, socket, device) or a plain file without
    /// opening it.
    pub fn mknod(
        &self,
        path: &str,
        cred: &Credentials,
        kind: EntryType,
        mode: u32,
        rdev: u64,
    ) -> FsResult<()> {
        let node_kind = match kind {
            EntryType::Regular => EntryKind::File(Vec::new()),
            EntryType::Fifo => EntryKind::Fifo,
            EntryType::Socket => EntryKind::Socket,
            EntryType::CharDev => EntryKind::CharDev(rdev),
            EntryType::BlockDev => EntryKind::BlockDev(rdev),
            _ => return Err(FsError::InvalidArgument),
        };
        self.attach_new(
            path,
            cred,
            Some(HookKind::Create),
            move |_, id, now| Ok(Entry::new(id, node_kind, cred, mode, now)),
            |_, _, _| Ok(()),
        )
    }

    // Metadata operations

    /// Metadata snapshot, following a terminal symlink.
    pub fn stat(&self, path: &str, cred: &Credentials) -> FsResult<Stat> {
        let norm = self.norm(path)?;
        self.with_read(&norm, cred, true, |entry, st| Ok(st.stat(entry.file_id())))
    }

    /// Metadata snapshot of the terminal entry itself, symlinks included.
    pub fn lstat(&self, path: &str, cred: &Credentials) -> FsResult<Stat> {
        let norm = self.norm(path)?;
        self.with_read(&norm, cred, false, |entry, st| Ok(st.stat(entry.file_id())))
    }

    /// Metadata snapshot through an open handle.
    pub fn fstat(&self, handle: &FileHandle) -> FsResult<Stat> {
        let entry = handle.entry();
        let st = entry.read()?;
        if matches!(st.kind, EntryKind::Dead) {
            return Err(FsError::BadFileDescriptor);
        }
        Ok(st.stat(entry.file_id()))
    }

    /// Change permission bits. Owner or root only.
    pub fn chmod(&self, path: &str, cred: &Credentials, mode: u32) -> FsResult<()> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |_, st| {
            if self.config.security.enforce_posix_permissions
                && cred.uid != 0
                && cred.uid != st.uid
            {
                return Err(FsError::AccessDenied);
            }
            st.mode = mode & 0o7777;
            st.ctime = self.now();
            Ok(())
        })
    }

    /// Change ownership. Only root may change the owner; the owner may move
    /// the group to their own group.
    pub fn chown(&self, path: &str, cred: &Credentials, uid: u32, gid: u32) -> FsResult<()> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |_, st| {
            if self.config.security.enforce_posix_permissions && cred.uid != 0 {
                if uid != st.uid {
                    return Err(FsError::AccessDenied);
                }
                if gid != st.gid && (cred.uid != st.uid || cred.gid != gid) {
                    return Err(FsError::AccessDenied);
                }
            }
            st.uid = uid;
            st.gid = gid;
            // setuid/setgid drop on ownership change
            st.mode &= !0o6000;
            st.ctime = self.now();
            Ok(())
        })
    }

    /// Set access and modification times. Owner, root, or anyone with write
    /// permission.
    pub fn utimes(&self, path: &str, cred: &Credentials, atime: i64, mtime: i64) -> FsResult<()> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |_, st| {
            if self.config.security.enforce_posix_permissions
                && cred.uid != 0
                && cred.uid != st.uid
                && !st.allows(cred, false, true, false, &self.config.security)
            {
                return Err(FsError::AccessDenied);
            }
            st.atime = atime;
            st.mtime = mtime;
            st.ctime = self.now();
            Ok(())
        })
    }

    // Extended attributes operations

    pub fn getxattr(&self, path: &str, cred: &Credentials, name: &str) -> FsResult<Vec<u8>> {
        let norm = self.norm(path)?;
        self.with_read(&norm, cred, true, |entry, st| {
            self.getxattr_inner(&norm, cred, entry, st, name)
        })
    }

    pub fn fgetxattr(&self, handle: &FileHandle, name: &str) -> FsResult<Vec<u8>> {
        let entry = handle.entry();
        let st = entry.read()?;
        if matches!(st.kind, EntryKind::Dead) {
            return Err(FsError::BadFileDescriptor);
        }
        let cred = Credentials::root();
        self.getxattr_inner(handle.path(), &cred, entry, &st, name)
    }

    fn getxattr_inner(
        &self,
        path: &str,
        cred: &Credentials,
        entry: &Arc<Entry>,
        st: &EntryState,
        name: &str,
    ) -> FsResult<Vec<u8>> {
        if !st.allows(cred, true, false, false, &self.config.security) {
            return Err(FsError::AccessDenied);
        }
        let value = st.xattrs.get(name).cloned().ok_or(FsError::NotFound)?;
        self.hook_event(HookKind::Getxattr, path, None, entry, st.entry_type())?;
        Ok(value)
    }

    pub fn setxattr(
        &self,
        path: &str,
        cred: &Credentials,
        name: &str,
        value: &[u8],
        flags: SetxattrFlags,
    ) -> FsResult<()> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |entry, st| {
            self.setxattr_inner(&norm, cred, entry, st, name, value, flags)
        })
    }

    pub fn fsetxattr(
        &self,
        handle: &FileHandle,
        name: &str,
        value: &[u8],
        flags: SetxattrFlags,
    ) -> FsResult<()> {
        let entry = handle.entry();
        let mut st = entry.write()?;
        if matches!(st.kind, EntryKind::Dead) {
            return Err(FsError::BadFileDescriptor);
        }
        let cred = Credentials::root();
        self.setxattr_inner(handle.path(), &cred, entry, &mut st, name, value, flags)
    }

    fn setxattr_inner(
        &self,
        path: &str,
        cred: &Credentials,
        entry: &Arc<Entry>,
        st: &mut EntryState,
        name: &str,
        value: &[u8],
        flags: SetxattrFlags,
    ) -> FsResult<()> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        if !st.allows(cred, false, true, false, &self.config.security) {
            return Err(FsError::AccessDenied);
        }
        match flags {
            SetxattrFlags::Create if st.xattrs.contains_key(name) => {
                return Err(FsError::AlreadyExists)
            }
            SetxattrFlags::Replace if !st.xattrs.contains_key(name) => {
                return Err(FsError::NotFound)
            }
            _ => {}
        }
        st.xattrs.insert(name.to_string(), value.to_vec());
        st.ctime = self.now();
        self.hook_event(HookKind::Setxattr, path, None, entry, st.entry_type())
    }

    /// Write the NUL-terminated concatenation of attribute names into `buf`
    /// and return the byte count. A zero-length buffer is a length probe; a
    /// short one fails with `Range` carrying the needed size.
    pub fn listxattr(&self, path: &str, cred: &Credentials, buf: &mut [u8]) -> FsResult<usize> {
        let norm = self.norm(path)?;
        self.with_read(&norm, cred, true, |entry, st| {
            self.listxattr_inner(&norm, cred, entry, st, buf)
        })
    }

    pub fn flistxattr(&self, handle: &FileHandle, buf: &mut [u8]) -> FsResult<usize> {
        let entry = handle.entry();
        let st = entry.read()?;
        if matches!(st.kind, EntryKind::Dead) {
            return Err(FsError::BadFileDescriptor);
        }
        let cred = Credentials::root();
        self.listxattr_inner(handle.path(), &cred, entry, &st, buf)
    }

    fn listxattr_inner(
        &self,
        path: &str,
        cred: &Credentials,
        entry: &Arc<Entry>,
        st: &EntryState,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        if !st.allows(cred, true, false, false, &self.config.security) {
            return Err(FsError::AccessDenied);
        }
        let needed: usize = st.xattrs.keys().map(|k| k.len() + 1).sum();
        self.hook_event(HookKind::Listxattr, path, None, entry, st.entry_type())?;
        if buf.is_empty() {
            return Ok(needed);
        }
        if buf.len() < needed {
            return Err(FsError::Range { needed });
        }
        let mut off = 0;
        for key in st.xattrs.keys() {
            buf[off..off + key.len()].copy_from_slice(key.as_bytes());
            off += key.len();
            buf[off] = 0;
            off += 1;
        }
        Ok(needed)
    }

    pub fn removexattr(&self, path: &str, cred: &Credentials, name: &str) -> FsResult<()> {
        let norm = self.norm(path)?;
        self.with_write(&norm, cred, true, |entry, st| {
            self.removexattr_inner(&norm, cred, entry, st, name)
        })
    }

    pub fn fremovexattr(&self, handle: &FileHandle, name: &str) -> FsResult<()> {
        let entry = handle.entry();
        let mut st = entry.write()?;
        if matches!(st.kind, EntryKind::Dead) {
            return Err(FsError::BadFileDescriptor);
        }
        let cred = Credentials::root();
        self.removexattr_inner(handle.path(), &cred, entry, &mut st, name)
    }

    fn removexattr_inner(
        &self,
        path: &str,
        cred: &Credentials,
        entry: &Arc<Entry>,
        st: &mut EntryState,
        name: &str,
    ) -> FsResult<()> {
        if !st.allows(cred, false, true, false, &self.config.security) {
            return Err(FsError::AccessDenied);
        }
        if st.xattrs.remove(name).is_none() {
            return Err(FsError::NotFound);
        }
        st.ctime = self.now();
        self.hook_event(HookKind::Removexattr, path, None, entry, st.entry_type())
    }

    // Teardown

    fn reap_dir(&self, path: &str, dir: &Arc<Entry>) -> FsResult<()> {
        let children: Vec<(String, Arc<Entry>)> = {
            let st = dir.read()?;
            match st.dir() {
                Ok(set) => set
                    .iter_live()
                    .filter(|(_, c)| c.is_owned())
                    .filter_map(|(n, c)| c.upgrade().map(|a| (n.to_string(), a)))
                    .collect(),
                Err(_) => Vec::new(),
            }
        };
        for (name, child) in children {
            let child_path = if path == "/" {
                format!("/{name}")
            } else {
                format!("{path}/{name}")
            };
            let is_dir = matches!(child.read()?.kind, EntryKind::Directory(_));
            if is_dir {
                self.reap_dir(&child_path, &child)?;
            }
            let mut ps = dir.write()?;
            let mut cs = child.write()?;
            detach(&mut ps, &name, &mut cs, 0)?;
            drop(ps);
            // teardown overrides open counts; stale handles see Dead
            let _ = self.try_destroy_with(&child_path, &child, &mut cs, false);
        }
        Ok(())
    }
}
