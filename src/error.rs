// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the filesystem core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("out of memory")]
    NoMemory,
    #[error("access denied")]
    AccessDenied,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file too large")]
    FileTooLarge,
    #[error("result does not fit in buffer, {needed} bytes needed")]
    Range { needed: usize },
    #[error("deadlock")]
    Deadlock,
    #[error("name too long")]
    NameTooLong,
    #[error("directory not empty")]
    NotEmpty,
    #[error("too many levels of symbolic links")]
    TooManyLinks,
}

impl FsError {
    /// Negative errno-style code for this error, for C-compatible consumers.
    pub fn errno(&self) -> i32 {
        let e = match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::BadFileDescriptor => libc::EBADF,
            FsError::NoMemory => libc::ENOMEM,
            FsError::AccessDenied => libc::EACCES,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::Range { .. } => libc::ERANGE,
            FsError::Deadlock => libc::EDEADLK,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::TooManyLinks => libc::ELOOP,
        };
        -e
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_are_negative_posix_codes() {
        assert_eq!(FsError::NotFound.errno(), -2);
        assert_eq!(FsError::BadFileDescriptor.errno(), -9);
        assert_eq!(FsError::AccessDenied.errno(), -13);
        assert_eq!(FsError::AlreadyExists.errno(), -17);
        assert_eq!(FsError::NotADirectory.errno(), -20);
        assert_eq!(FsError::IsADirectory.errno(), -21);
        assert_eq!(FsError::InvalidArgument.errno(), -22);
        assert_eq!(FsError::Range { needed: 0 }.errno(), -34);
        assert_eq!(FsError::Deadlock.errno(), -35);
        assert_eq!(FsError::NameTooLong.errno(), -36);
        assert_eq!(FsError::NotEmpty.errno(), -39);
        assert_eq!(FsError::TooManyLinks.errno(), -40);
    }
}
