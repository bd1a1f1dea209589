// Copyright (c) 2025 Zensical and contributors

// SPDX-License-Identifier: MIT
// Third-party contributions licensed under DCO

// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:

// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

// ----------------------------------------------------------------------------
//! Watcher error.

use crossbeam::channel::{RecvError, SendError};
use std::path::{Path, PathBuf};
use std::{io, result};
use thiserror::Error;

use super::registry::WatchId;

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Watcher error.
///
/// Errors returned from the request entry points of the [`Watcher`][] map to
/// the negative codes returned by [`Error::code`], which are never valid watch
/// identifiers. Failures of the backend at run time are not returned from any
/// method, but reported as events, and recorded as the watcher's last error.
///
/// [`Watcher`]: crate::Watcher
#[derive(Debug, Error)]
pub enum Error {
    /// Path does not exist or is not a directory.
    #[error("file not found ({})", .0.display())]
    NotFound(PathBuf),

    /// Watch identifier is unknown.
    #[error("watch not found ({0})")]
    UnknownWatch(WatchId),

    /// Directory is already watched.
    #[error("file repeated in watches ({})", .0.display())]
    AlreadyWatched(PathBuf),

    /// Symbolic link violates the link policy.
    #[error("symlink file out of scope ({})", .0.display())]
    OutOfScope(PathBuf),

    /// Directory cannot be read.
    #[error("file not readable ({})", .0.display())]
    NotReadable(PathBuf),

    /// Directory is located on a network file system.
    #[error(
        "file is located in a remote file system, use a generic watcher ({})",
        .0.display()
    )]
    RemoteFilesystem(PathBuf),

    /// Backend failed to subscribe to a directory.
    #[error("backend failed ({}): {source}", path.display())]
    Backend {
        /// Directory path.
        path: PathBuf,
        /// Backend error.
        source: Box<Error>,
    },

    /// Unspecified error.
    #[error("{0}")]
    Unspecified(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Notify error.
    #[error(transparent)]
    Notify(#[from] notify::Error),

    /// Walk directory error.
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),

    /// Channel disconnected.
    #[error("watcher disconnected")]
    Disconnected,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Error {
    /// Classifies an I/O error that occurred while accessing the given path.
    ///
    /// Missing paths and denied permissions are mapped to their dedicated
    /// variants, while all other I/O errors are kept as they are.
    pub fn from_io<P>(err: io::Error, path: P) -> Self
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path),
            io::ErrorKind::PermissionDenied => Error::NotReadable(path),
            _ => Error::Io(err),
        }
    }

    /// Returns the negative error code of the error.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use treewatch::Error;
    ///
    /// // Obtain code for duplicate watch
    /// let err = Error::AlreadyWatched(PathBuf::from("docs"));
    /// assert_eq!(err.code(), -2);
    /// ```
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Error::NotFound(_) | Error::UnknownWatch(_) => -1,
            Error::AlreadyWatched(_) => -2,
            Error::OutOfScope(_) => -3,
            Error::NotReadable(_) => -4,
            Error::RemoteFilesystem(_) => -5,
            Error::Backend { .. } | Error::Notify(_) => -6,
            Error::Unspecified(_)
            | Error::Io(_)
            | Error::WalkDir(_)
            | Error::Disconnected => -7,
        }
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl<T> From<SendError<T>> for Error {
    /// Creates an error from a send error.
    #[inline]
    fn from(_: SendError<T>) -> Self {
        Error::Disconnected
    }
}

impl From<RecvError> for Error {
    /// Creates an error from a receive error.
    #[inline]
    fn from(_: RecvError) -> Self {
        Error::Disconnected
    }
}

// ----------------------------------------------------------------------------
// Type aliases
// ----------------------------------------------------------------------------

/// Watcher result.
pub type Result<T = ()> = result::Result<T, Error>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
