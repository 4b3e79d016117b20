// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path resolution under the entry locking discipline.
//!
//! The walk is hand-over-hand: at most one entry lock is ever held, and each
//! acquisition re-checks that the entry is still live, since a concurrent
//! unlink may have detached it between the parent's release and our
//! acquisition. Structural changes always take the parent's write lock, so
//! this is sufficient to never observe a half-built tree.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{FsLimits, SecurityPolicy};
use crate::entry::{Entry, EntryKind, EntryState};
use crate::error::{FsError, FsResult};
use crate::types::Credentials;

/// Normalize a path: collapse `/` runs, strip the trailing `/` except for
/// the root, enforce length limits. Paths are interpreted as absolute.
pub(crate) fn normalize(path: &str, limits: &FsLimits) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::InvalidArgument);
    }
    if path.len() > limits.max_path_len {
        return Err(FsError::NameTooLong);
    }

    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        if seg.len() > limits.max_name_len {
            return Err(FsError::NameTooLong);
        }
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(seg);
    }
    Ok(out)
}

/// Split a normalized path into (dirname, basename). The root has no
/// basename to split off.
pub(crate) fn split(norm: &str) -> FsResult<(String, String)> {
    if norm == "/" {
        return Err(FsError::InvalidArgument);
    }
    let cut = norm.rfind('/').expect("normalized path contains a slash");
    let dirname = if cut == 0 { "/" } else { &norm[..cut] };
    Ok((dirname.to_string(), norm[cut + 1..].to_string()))
}

fn segments(norm: &str) -> VecDeque<String> {
    norm.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Walk a normalized path from the root, returning the terminal entry
/// unlocked. Symlinks in intermediate positions are always substituted;
/// a terminal symlink is substituted only when `follow_terminal` is set.
pub(crate) fn walk(
    root: &Arc<Entry>,
    norm: &str,
    cred: &Credentials,
    policy: &SecurityPolicy,
    limits: &FsLimits,
    follow_terminal: bool,
) -> FsResult<Arc<Entry>> {
    let mut cur = Arc::clone(root);
    let mut segs = segments(norm);
    let mut follows = 0u32;

    while let Some(seg) = segs.pop_front() {
        let is_last = segs.is_empty();

        // Look up the segment under the current directory's read lock.
        let next = {
            let st = cur.read()?;
            if !st.is_live() {
                return Err(FsError::NotFound);
            }
            let set = st.dir()?;
            if !st.allows(cred, false, false, true, policy) {
                return Err(FsError::AccessDenied);
            }
            set.find(&seg)
                .and_then(|c| c.upgrade())
                .ok_or(FsError::NotFound)?
        };

        // Peek at the child for liveness and symlink substitution.
        let target = {
            let st = next.read()?;
            if !st.is_live() {
                return Err(FsError::NotFound);
            }
            match &st.kind {
                EntryKind::Symlink(target) if !is_last || follow_terminal => {
                    Some(target.clone())
                }
                _ => None,
            }
        };

        if let Some(target) = target {
            follows += 1;
            if follows > limits.max_symlink_follows {
                return Err(FsError::TooManyLinks);
            }
            if target.is_empty() || target.len() > limits.max_path_len {
                return Err(FsError::InvalidArgument);
            }
            // An absolute target restarts the walk at the root; a relative
            // one splices into the remaining segments.
            if target.starts_with('/') {
                cur = Arc::clone(root);
            }
            for seg in target.split('/').filter(|s| !s.is_empty()).rev() {
                if seg.len() > limits.max_name_len {
                    return Err(FsError::NameTooLong);
                }
                segs.push_front(seg.to_string());
            }
            continue;
        }

        cur = next;
    }

    Ok(cur)
}

/// Resolve `norm` and hand the terminal entry, read-locked, to `f`. The
/// liveness re-check after acquisition makes a concurrent unlink look like
/// the entry never resolved.
pub(crate) fn with_entry_read<T>(
    root: &Arc<Entry>,
    norm: &str,
    cred: &Credentials,
    policy: &SecurityPolicy,
    limits: &FsLimits,
    follow_terminal: bool,
    f: impl FnOnce(&Arc<Entry>, &EntryState) -> FsResult<T>,
) -> FsResult<T> {
    let entry = walk(root, norm, cred, policy, limits, follow_terminal)?;
    let st = entry.read()?;
    if !st.is_live() {
        return Err(FsError::NotFound);
    }
    f(&entry, &*st)
}

/// As [`with_entry_read`], but the terminal is write-locked.
pub(crate) fn with_entry_write<T>(
    root: &Arc<Entry>,
    norm: &str,
    cred: &Credentials,
    policy: &SecurityPolicy,
    limits: &FsLimits,
    follow_terminal: bool,
    f: impl FnOnce(&Arc<Entry>, &mut EntryState) -> FsResult<T>,
) -> FsResult<T> {
    let entry = walk(root, norm, cred, policy, limits, follow_terminal)?;
    let mut st = entry.write()?;
    if !st.is_live() {
        return Err(FsError::NotFound);
    }
    f(&entry, &mut *st)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> FsLimits {
        FsLimits::default()
    }

    #[test]
    fn normalize_collapses_and_strips() {
        let l = limits();
        assert_eq!(normalize("/", &l).expect("root"), "/");
        assert_eq!(normalize("//", &l).expect("double root"), "/");
        assert_eq!(normalize("/a//b///c", &l).expect("runs"), "/a/b/c");
        assert_eq!(normalize("/a/b/", &l).expect("trailing"), "/a/b");
        assert_eq!(normalize("a/b", &l).expect("relative rooted"), "/a/b");
    }

    #[test]
    fn normalize_rejects_bad_input() {
        let l = limits();
        assert!(matches!(normalize("", &l), Err(FsError::InvalidArgument)));

        let long = "/".to_string() + &"x".repeat(l.max_path_len);
        assert!(matches!(normalize(&long, &l), Err(FsError::NameTooLong)));

        let long_name = "/".to_string() + &"y".repeat(l.max_name_len + 1);
        assert!(matches!(normalize(&long_name, &l), Err(FsError::NameTooLong)));
    }

    #[test]
    fn split_dirname_basename() {
        assert_eq!(
            split("/a").expect("top level"),
            ("/".to_string(), "a".to_string())
        );
        assert_eq!(
            split("/a/b/c").expect("nested"),
            ("/a/b".to_string(), "c".to_string())
        );
        assert!(matches!(split("/"), Err(FsError::InvalidArgument)));
    }
}
