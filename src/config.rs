// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the filesystem core

use serde::{Deserialize, Serialize};

/// Permission enforcement policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Enforce owner/group/other mode bits on every operation.
    pub enforce_posix_permissions: bool,
    /// uid 0 bypasses all permission checks.
    pub root_bypass_permissions: bool,
    /// Owner applied to the root directory at init.
    pub default_uid: u32,
    /// Group applied to the root directory at init.
    pub default_gid: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_posix_permissions: true,
            root_bypass_permissions: true,
            default_uid: 0,
            default_gid: 0,
        }
    }
}

/// Structural limits checked before any lock is taken.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsLimits {
    /// Maximum length of a full path, in bytes.
    pub max_path_len: usize,
    /// Maximum length of a single path component, in bytes.
    pub max_name_len: usize,
    /// Maximum number of symlink substitutions during one resolution.
    pub max_symlink_follows: u32,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_path_len: 4096,
            max_name_len: 255,
            max_symlink_follows: 40,
        }
    }
}

/// Filesystem configuration, fixed at init time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsConfig {
    pub security: SecurityPolicy,
    pub limits: FsLimits,
    /// When true (the default), an unlinked entry with live handles survives
    /// until the last handle closes. When false, unlink destroys immediately
    /// and any remaining handles go stale.
    pub deferred_destroy: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            security: SecurityPolicy::default(),
            limits: FsLimits::default(),
            deferred_destroy: true,
        }
    }
}
