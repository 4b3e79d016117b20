// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem entries: typed nodes carrying metadata, content, counts, and a
//! per-entry readers/writer lock.
//!
//! Lifetime is governed by two counters, not by reference counting alone:
//! `link_count` (directory entries naming this node) and `open_count` (live
//! handles). Destruction requires both to be zero while the write lock is
//! held; an unlinked entry with open handles survives as unreachable storage
//! until the last close. Handles and parents pin the allocation with `Arc`,
//! but a destroyed entry is a `Dead` zombie whose content is already gone.
//!
//! Lock order: parent before child along the tree; handle locks before entry
//! locks; unrelated entries by lexicographic path. Poisoned locks surface as
//! `Deadlock` and are treated as bugs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::SecurityPolicy;
use crate::entry_set::{ChildRef, EntrySet};
use crate::error::{FsError, FsResult};
use crate::types::{AppData, Credentials, EntryType, FileId, Stat};

/// Content of an entry, discriminated by type.
pub(crate) enum EntryKind {
    Directory(EntrySet),
    File(Vec<u8>),
    Symlink(String),
    Fifo,
    Socket,
    CharDev(u64),
    BlockDev(u64),
    /// Storage awaiting the last `Arc` drop; content already freed.
    Dead,
}

impl EntryKind {
    pub(crate) fn entry_type(&self) -> EntryType {
        match self {
            EntryKind::Directory(_) => EntryType::Directory,
            EntryKind::File(_) => EntryType::Regular,
            EntryKind::Symlink(_) => EntryType::Symlink,
            EntryKind::Fifo => EntryType::Fifo,
            EntryKind::Socket => EntryType::Socket,
            EntryKind::CharDev(_) => EntryType::CharDev,
            EntryKind::BlockDev(_) => EntryType::BlockDev,
            EntryKind::Dead => EntryType::Dead,
        }
    }
}

/// Mutable state guarded by the entry's readers/writer lock.
pub(crate) struct EntryState {
    pub kind: EntryKind,
    /// Name under which this node appears in its parent; `None` once
    /// detached. The root carries `"/"`.
    pub name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// Number of directory entries naming this node. `.` and `..` do not
    /// contribute.
    pub link_count: u32,
    /// Number of live handles (file or directory) bound to this node.
    pub open_count: u32,
    /// Set once the node is unreachable by name; no lookup may succeed
    /// against it afterwards.
    pub deletion_in_progress: bool,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl EntryState {
    pub(crate) fn entry_type(&self) -> EntryType {
        self.kind.entry_type()
    }

    pub(crate) fn size(&self) -> u64 {
        match &self.kind {
            EntryKind::File(data) => data.len() as u64,
            EntryKind::Symlink(target) => target.len() as u64,
            EntryKind::Directory(set) => set.len() as u64,
            _ => 0,
        }
    }

    /// An entry lookups are still allowed to observe.
    pub(crate) fn is_live(&self) -> bool {
        !self.deletion_in_progress && !matches!(self.kind, EntryKind::Dead)
    }

    pub(crate) fn dir(&self) -> FsResult<&EntrySet> {
        match &self.kind {
            EntryKind::Directory(set) => Ok(set),
            EntryKind::Dead => Err(FsError::NotFound),
            _ => Err(FsError::NotADirectory),
        }
    }

    pub(crate) fn dir_mut(&mut self) -> FsResult<&mut EntrySet> {
        match &mut self.kind {
            EntryKind::Directory(set) => Ok(set),
            EntryKind::Dead => Err(FsError::NotFound),
            _ => Err(FsError::NotADirectory),
        }
    }

    /// File content accessor for handle-based operations; a `Dead` entry
    /// means the handle went stale.
    pub(crate) fn file(&self) -> FsResult<&Vec<u8>> {
        match &self.kind {
            EntryKind::File(data) => Ok(data),
            EntryKind::Directory(_) => Err(FsError::IsADirectory),
            EntryKind::Dead => Err(FsError::BadFileDescriptor),
            _ => Err(FsError::InvalidArgument),
        }
    }

    pub(crate) fn file_mut(&mut self) -> FsResult<&mut Vec<u8>> {
        match &mut self.kind {
            EntryKind::File(data) => Ok(data),
            EntryKind::Directory(_) => Err(FsError::IsADirectory),
            EntryKind::Dead => Err(FsError::BadFileDescriptor),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Whether both lifetime conditions for destruction hold.
    pub(crate) fn destroyable(&self, deferred: bool) -> bool {
        !matches!(self.kind, EntryKind::Dead)
            && self.link_count == 0
            && (!deferred || self.open_count == 0)
    }

    /// Which permission class of this entry's mode applies to `cred`.
    fn mode_class_shift(&self, cred: &Credentials) -> u32 {
        if cred.uid == self.uid {
            6
        } else if cred.gid == self.gid {
            3
        } else {
            0
        }
    }

    /// Mode-bit permission check: the rwx bits requested must all be present
    /// in the class (owner, group, or other) the identity falls into.
    pub(crate) fn allows(
        &self,
        cred: &Credentials,
        want_read: bool,
        want_write: bool,
        want_exec: bool,
        policy: &SecurityPolicy,
    ) -> bool {
        if !policy.enforce_posix_permissions
            || (policy.root_bypass_permissions && cred.uid == 0)
        {
            return true;
        }

        let mut wanted = 0;
        if want_read {
            wanted |= 0o4;
        }
        if want_write {
            wanted |= 0o2;
        }
        if want_exec {
            wanted |= 0o1;
        }

        let granted = (self.mode >> self.mode_class_shift(cred)) & 0o7;
        granted & wanted == wanted
    }

    pub(crate) fn stat(&self, file_id: FileId) -> Stat {
        Stat {
            file_id,
            kind: self.entry_type(),
            size: self.size(),
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            nlink: self.link_count,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

/// Outcome of a destruction attempt.
pub(crate) enum DestroyOutcome {
    /// Content and xattrs freed, app-data surrendered.
    Destroyed(Option<AppData>),
    /// A count is still nonzero; the entry stays.
    Kept,
}

/// A node in the filesystem tree.
pub struct Entry {
    file_id: FileId,
    state: RwLock<EntryState>,
    /// Caller state. Lives outside the state lock so hooks contracted at
    /// read-lock level can still mutate it.
    app_data: Mutex<Option<AppData>>,
}

impl Entry {
    pub(crate) fn new(
        file_id: FileId,
        kind: EntryKind,
        cred: &Credentials,
        mode: u32,
        now: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            file_id,
            state: RwLock::new(EntryState {
                kind,
                name: None,
                uid: cred.uid,
                gid: cred.gid,
                mode,
                atime: now,
                mtime: now,
                ctime: now,
                link_count: 0,
                open_count: 0,
                deletion_in_progress: false,
                xattrs: BTreeMap::new(),
            }),
            app_data: Mutex::new(None),
        })
    }

    /// Create a directory entry with its `.` and `..` slots installed.
    /// `parent` of `None` makes the directory its own parent (the root).
    pub(crate) fn new_directory(
        file_id: FileId,
        cred: &Credentials,
        mode: u32,
        now: i64,
        parent: Option<&Arc<Entry>>,
    ) -> FsResult<Arc<Self>> {
        let dir = Self::new(file_id, EntryKind::Directory(EntrySet::new()), cred, mode, now);
        {
            let mut st = dir.write()?;
            let up = parent.unwrap_or(&dir);
            let set = st.dir_mut()?;
            set.insert(".", ChildRef::Back(Arc::downgrade(&dir)))?;
            set.insert("..", ChildRef::Back(Arc::downgrade(up)))?;
        }
        Ok(dir)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub(crate) fn read(&self) -> FsResult<RwLockReadGuard<'_, EntryState>> {
        self.state.read().map_err(|_| {
            tracing::error!(file_id = self.file_id.0, "entry lock poisoned");
            FsError::Deadlock
        })
    }

    pub(crate) fn write(&self) -> FsResult<RwLockWriteGuard<'_, EntryState>> {
        self.state.write().map_err(|_| {
            tracing::error!(file_id = self.file_id.0, "entry lock poisoned");
            FsError::Deadlock
        })
    }

    pub(crate) fn app_data(&self) -> &Mutex<Option<AppData>> {
        &self.app_data
    }

    pub(crate) fn app_data_guard(&self) -> MutexGuard<'_, Option<AppData>> {
        match self.app_data.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Destroy the entry if both counts are zero. The caller holds the write
    /// lock. On `Destroyed`, content and xattrs are freed, the state is
    /// marked `Dead`, and the app-data is surrendered.
    pub(crate) fn try_destroy(&self, st: &mut EntryState, deferred: bool) -> DestroyOutcome {
        if !st.destroyable(deferred) {
            return DestroyOutcome::Kept;
        }

        st.kind = EntryKind::Dead;
        st.xattrs.clear();
        st.name = None;
        st.deletion_in_progress = true;
        DestroyOutcome::Destroyed(self.app_data_guard().take())
    }
}

/// Insert `child` into `parent` under `name`. Both write locks held by the
/// caller; the insert and the count/name updates are one atomic step.
pub(crate) fn attach(
    parent: &mut EntryState,
    name: &str,
    child: &Arc<Entry>,
    child_state: &mut EntryState,
    now: i64,
) -> FsResult<()> {
    parent.dir_mut()?.insert(name, ChildRef::Owned(Arc::clone(child)))?;
    child_state.name = Some(name.to_string());
    child_state.link_count += 1;
    parent.mtime = now;
    parent.ctime = now;
    Ok(())
}

/// Remove `name` from `parent` and decrement the child's link count. When
/// the count reaches zero the child becomes unreachable: its name clears and
/// `deletion_in_progress` is set. Both write locks held by the caller.
pub(crate) fn detach(
    parent: &mut EntryState,
    name: &str,
    child_state: &mut EntryState,
    now: i64,
) -> FsResult<()> {
    let open_count = parent.open_count;
    let set = parent.dir_mut()?;
    if set.remove(name).is_none() {
        return Err(FsError::NotFound);
    }
    // No dir handle holds a cursor, so tombstones can go.
    if open_count == 0 {
        set.compact();
    }
    child_state.link_count = child_state.link_count.saturating_sub(1);
    if child_state.link_count == 0 {
        child_state.name = None;
        child_state.deletion_in_progress = true;
    }
    child_state.ctime = now;
    parent.mtime = now;
    parent.ctime = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_dir() -> Arc<Entry> {
        Entry::new_directory(FileId(1), &Credentials::root(), 0o755, 0, None)
            .expect("root creation")
    }

    #[test]
    fn directory_has_dot_and_dotdot() {
        let root = root_dir();
        let st = root.read().expect("read lock");
        let set = st.dir().expect("directory");
        let dot = set.find(".").expect("dot").upgrade().expect("dot upgrade");
        let dotdot = set.find("..").expect("dotdot").upgrade().expect("dotdot upgrade");
        assert!(Arc::ptr_eq(&dot, &root));
        assert!(Arc::ptr_eq(&dotdot, &root));
    }

    #[test]
    fn attach_detach_round_trip() {
        let root = root_dir();
        let file = Entry::new(FileId(2), EntryKind::File(Vec::new()), &Credentials::root(), 0o644, 0);

        {
            let mut ps = root.write().expect("parent lock");
            let mut cs = file.write().expect("child lock");
            attach(&mut ps, "f", &file, &mut cs, 7).expect("attach");
            assert_eq!(cs.link_count, 1);
            assert_eq!(cs.name.as_deref(), Some("f"));
            assert_eq!(ps.mtime, 7);
        }
        {
            let mut ps = root.write().expect("parent lock");
            let mut cs = file.write().expect("child lock");
            detach(&mut ps, "f", &mut cs, 8).expect("detach");
            assert_eq!(cs.link_count, 0);
            assert!(cs.name.is_none());
            assert!(cs.deletion_in_progress);
        }
    }

    #[test]
    fn destroy_deferred_until_counts_zero() {
        let file = Entry::new(FileId(3), EntryKind::File(b"x".to_vec()), &Credentials::root(), 0o644, 0);
        let mut st = file.write().expect("lock");
        st.link_count = 0;
        st.open_count = 1;
        assert!(matches!(file.try_destroy(&mut st, true), DestroyOutcome::Kept));
        st.open_count = 0;
        assert!(matches!(
            file.try_destroy(&mut st, true),
            DestroyOutcome::Destroyed(_)
        ));
        assert!(matches!(st.kind, EntryKind::Dead));
        // A second attempt on a zombie is a no-op.
        assert!(matches!(file.try_destroy(&mut st, true), DestroyOutcome::Kept));
    }

    #[test]
    fn destroy_surrenders_app_data() {
        let file = Entry::new(FileId(4), EntryKind::File(Vec::new()), &Credentials::root(), 0o644, 0);
        *file.app_data_guard() = Some(Box::new(41u32));
        let mut st = file.write().expect("lock");
        match file.try_destroy(&mut st, true) {
            DestroyOutcome::Destroyed(Some(data)) => {
                assert_eq!(*data.downcast::<u32>().expect("u32 app data"), 41);
            }
            _ => panic!("expected destruction with app data"),
        }
    }

    #[test]
    fn permission_bits_owner_group_other() {
        let cred = Credentials::new(1000, 1000);
        let file = Entry::new(FileId(5), EntryKind::File(Vec::new()), &cred, 0o640, 0);
        let st = file.read().expect("lock");
        let policy = SecurityPolicy::default();

        assert!(st.allows(&cred, true, true, false, &policy));
        assert!(!st.allows(&cred, false, false, true, &policy));

        let group_mate = Credentials::new(2000, 1000);
        assert!(st.allows(&group_mate, true, false, false, &policy));
        assert!(!st.allows(&group_mate, false, true, false, &policy));

        let other = Credentials::new(3000, 3000);
        assert!(!st.allows(&other, true, false, false, &policy));

        assert!(st.allows(&Credentials::root(), true, true, true, &policy));
    }
}
