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
//! Watch event.

use std::fs::FileType;
use std::path::{Path, PathBuf};

use super::registry::WatchId;

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Event action.
///
/// The discriminants match the integer values of the actions in the classic
/// C interface of file watchers, so they can be passed through as they are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    /// File or folder was created, or moved into the directory.
    Add = 1,
    /// File or folder was removed, or moved out of the directory.
    Delete = 2,
    /// File was modified.
    Modified = 3,
    /// File or folder was renamed.
    Moved = 4,
}

// ----------------------------------------------------------------------------

/// File kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// File.
    File,
    /// Folder.
    Folder,
    /// Symbolic link.
    Link,
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Watch event.
///
/// Events are always reported relative to the directory containing the file
/// or folder, which is not necessarily the directory of the watch they were
/// delivered to, e.g., for backends with native recursion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Watch identifier.
    pub id: WatchId,
    /// Directory containing the file or folder.
    pub directory: PathBuf,
    /// File or folder name.
    pub filename: PathBuf,
    /// Event action.
    pub action: Action,
    /// Previous file name, only set for [`Action::Moved`].
    ///
    /// If the file was moved within the same directory, this is the previous
    /// file name, otherwise it's the full previous path.
    pub old_filename: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Event {
    /// Returns the full path of the event.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use treewatch::{Action, Event, WatchId};
    ///
    /// // Create event and obtain path
    /// let event = Event {
    ///     id: WatchId::new(1),
    ///     directory: PathBuf::from("docs"),
    ///     filename: PathBuf::from("index.md"),
    ///     action: Action::Add,
    ///     old_filename: None,
    /// };
    /// assert_eq!(event.path(), PathBuf::from("docs/index.md"));
    /// ```
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }

    /// Returns the full previous path of the event, if any.
    #[must_use]
    pub fn old_path(&self) -> Option<PathBuf> {
        self.old_filename.as_deref().map(|old| {
            if old.is_absolute() {
                old.to_path_buf()
            } else {
                self.directory.join(old)
            }
        })
    }
}

impl Kind {
    /// Returns the file kind of the given path, without following links.
    #[must_use]
    pub fn of<P>(path: P) -> Option<Self>
    where
        P: AsRef<Path>,
    {
        path.as_ref()
            .symlink_metadata()
            .ok()
            .map(|metadata| Kind::from(metadata.file_type()))
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl From<FileType> for Kind {
    /// Converts a file type to a file kind.
    fn from(value: FileType) -> Self {
        if value.is_dir() {
            Kind::Folder
        } else if value.is_symlink() {
            Kind::Link
        } else {
            Kind::File
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_path() {
        let mut event = Event {
            id: WatchId::new(1),
            directory: PathBuf::from("/docs"),
            filename: PathBuf::from("b.md"),
            action: Action::Moved,
            old_filename: Some(PathBuf::from("a.md")),
        };
        assert_eq!(event.old_path(), Some(PathBuf::from("/docs/a.md")));

        event.old_filename = Some(PathBuf::from("/posts/a.md"));
        assert_eq!(event.old_path(), Some(PathBuf::from("/posts/a.md")));
    }

    #[test]
    fn test_kind_of() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "a").unwrap();
        assert_eq!(Kind::of(dir.path()), Some(Kind::Folder));
        assert_eq!(Kind::of(dir.path().join("a")), Some(Kind::File));
        assert_eq!(Kind::of(dir.path().join("b")), None);
    }
}
