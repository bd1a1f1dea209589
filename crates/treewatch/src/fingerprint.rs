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
//! File fingerprint and directory snapshot.

use file_id::FileId;
use std::collections::btree_map::Iter;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::io;
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

use super::event::Kind;
use super::{Error, Result};

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Difference between two snapshots of the same directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Difference {
    /// Entry was added.
    Added(OsString, Kind),
    /// Entry was removed.
    Removed(OsString, Kind),
    /// Entry was modified.
    Modified(OsString, Kind),
    /// Entry was renamed, keeping its fingerprint.
    Moved {
        /// Previous name.
        from: OsString,
        /// Next name.
        to: OsString,
        /// File kind.
        kind: Kind,
    },
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// File fingerprint.
///
/// A fingerprint identifies the state of a directory entry by its metadata,
/// which is used to detect modifications, and to match an entry that vanished
/// with an entry that appeared as a rename. Metadata is always obtained for the
/// entry itself, so symbolic links are never followed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// File kind.
    pub kind: Kind,
    /// File size.
    pub size: u64,
    /// Modification time, if supported by the platform.
    pub modified: Option<SystemTime>,
    /// File identifier, if supported by the platform.
    pub id: Option<FileId>,
}

// ----------------------------------------------------------------------------

/// Directory snapshot.
///
/// Snapshots map the names of all entries in a directory to their fingerprints,
/// and are ordered by name, so diffing two snapshots is deterministic.
///
/// # Examples
///
/// ```
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use treewatch::fingerprint::Snapshot;
///
/// // Take two snapshots of the same directory
/// let prev = Snapshot::read(".")?;
/// let next = Snapshot::read(".")?;
/// assert!(prev.diff(&next).is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Fingerprints by entry name.
    entries: BTreeMap<OsString, Fingerprint>,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl Fingerprint {
    /// Reads the fingerprint of the file or folder at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata of the path cannot be read.
    pub fn read<P>(path: P) -> io::Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        fs::symlink_metadata(path).map(|metadata| Self::new(path, &metadata))
    }

    /// Creates a fingerprint from already obtained metadata.
    #[must_use]
    pub fn new(path: &Path, metadata: &Metadata) -> Self {
        Self {
            kind: Kind::from(metadata.file_type()),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            id: get_file_id(path, metadata),
        }
    }
}

// ----------------------------------------------------------------------------

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a snapshot of the directory at the given path.
    ///
    /// Entries that vanish while the directory is enumerated are skipped, as
    /// the next snapshot will account for them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the directory doesn't exist, and other
    /// errors if the directory itself cannot be read.
    pub fn read<P>(directory: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let directory = directory.as_ref();
        let mut snapshot = Self::new();
        let iter = WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .follow_root_links(true)
            .follow_links(false);
        for item in iter {
            match item {
                Ok(entry) => {
                    if let Ok(metadata) = entry.metadata() {
                        let fingerprint = Fingerprint::new(entry.path(), &metadata);
                        snapshot.insert(entry.file_name(), fingerprint);
                    }
                }
                Err(err) if err.depth() == 0 => {
                    return Err(match err.into_io_error() {
                        Some(err) => Error::from_io(err, directory),
                        None => Error::NotReadable(directory.to_path_buf()),
                    });
                }
                Err(_) => {}
            }
        }
        Ok(snapshot)
    }

    /// Inserts a fingerprint for the given name.
    pub fn insert<N>(&mut self, name: N, fingerprint: Fingerprint)
    where
        N: Into<OsString>,
    {
        self.entries.insert(name.into(), fingerprint);
    }

    /// Returns the fingerprint for the given name.
    #[must_use]
    pub fn get<N>(&self, name: N) -> Option<&Fingerprint>
    where
        N: AsRef<OsStr>,
    {
        self.entries.get(name.as_ref())
    }

    /// Returns an iterator over all entries, ordered by name.
    pub fn iter(&self) -> Iter<'_, OsString, Fingerprint> {
        self.entries.iter()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Computes the differences from this snapshot to the next one.
    ///
    /// Names only present in this snapshot are removals, and names only present
    /// in the next snapshot are additions. A removal and an addition sharing the
    /// same fingerprint are paired into a rename, considering removals and
    /// additions in ascending name order, so pairing is deterministic when
    /// several candidates share a fingerprint. Names present in both snapshots
    /// whose fingerprint changed are modifications, except for folders, as a
    /// folder's metadata changes whenever its contents change. If the kind of
    /// an entry changed, it's reported as a removal and an addition.
    ///
    /// Differences are ordered as renames, removals, additions, modifications.
    #[must_use]
    pub fn diff(&self, next: &Snapshot) -> Vec<Difference> {
        let mut removed = Vec::new();
        let mut added = Vec::new();
        let mut modified = Vec::new();

        // Collect removals and modifications, treating a change of kind as the
        // removal of the previous entry followed by an addition of the next
        for (name, prev) in &self.entries {
            match next.entries.get(name) {
                None => removed.push((name, prev)),
                Some(fingerprint) if fingerprint.kind != prev.kind => {
                    removed.push((name, prev));
                    added.push(Some((name, fingerprint)));
                }
                Some(fingerprint) if fingerprint != prev => {
                    if fingerprint.kind != Kind::Folder {
                        modified.push((name, fingerprint.kind));
                    }
                }
                Some(_) => {}
            }
        }

        // Collect additions, which are kept in ascending order, so we can
        // interleave them with additions from changes of kind by sorting
        for (name, fingerprint) in &next.entries {
            if !self.entries.contains_key(name) {
                added.push(Some((name, fingerprint)));
            }
        }
        added.sort_by(|a, b| a.map(|(name, _)| name).cmp(&b.map(|(name, _)| name)));

        // Pair removals with the first unpaired addition sharing the identical
        // fingerprint, and take the addition out of the set of candidates
        let mut moves = Vec::new();
        let mut removals = Vec::new();
        for (name, prev) in removed {
            let slot = added.iter_mut().find(|slot| {
                matches!(slot, Some((_, fingerprint)) if *fingerprint == prev)
            });
            match slot.and_then(Option::take) {
                Some((to, _)) => moves.push(Difference::Moved {
                    from: name.clone(),
                    to: to.clone(),
                    kind: prev.kind,
                }),
                None => removals.push(Difference::Removed(name.clone(), prev.kind)),
            }
        }

        // Combine differences in order of renames, removals, additions and
        // modifications, where additions exclude those that were paired
        let additions = added.into_iter().flatten().map(|(name, fingerprint)| {
            Difference::Added(name.clone(), fingerprint.kind)
        });
        let modifications = modified
            .into_iter()
            .map(|(name, kind)| Difference::Modified(name.clone(), kind));
        moves
            .into_iter()
            .chain(removals)
            .chain(additions)
            .chain(modifications)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Trait implementations
// ----------------------------------------------------------------------------

impl FromIterator<(OsString, Fingerprint)> for Snapshot {
    /// Creates a snapshot from name-fingerprint pairs.
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (OsString, Fingerprint)>,
    {
        Self { entries: iter.into_iter().collect() }
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns the file identifier for the file or folder at the given path.
#[cfg(target_family = "unix")]
fn get_file_id(_path: &Path, metadata: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    // Derived from symbolic link metadata, as links are tracked as entries of
    // their own, and must never be confused with their targets
    Some(FileId::new_inode(metadata.dev(), metadata.ino()))
}

/// Returns the file identifier for the file or folder at the given path.
#[cfg(target_family = "windows")]
fn get_file_id(path: &Path, _metadata: &Metadata) -> Option<FileId> {
    // The low resolution variant is much cheaper, and sufficient for volumes
    // with less than 4b entries
    file_id::get_low_res_file_id(path).ok()
}

/// Returns the file identifier for the file or folder at the given path.
#[cfg(not(any(target_family = "unix", target_family = "windows")))]
fn get_file_id(_path: &Path, _metadata: &Metadata) -> Option<FileId> {
    None
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn fingerprint(kind: Kind, size: u64, inode: u64) -> Fingerprint {
        Fingerprint {
            kind,
            size,
            modified: Some(UNIX_EPOCH + Duration::from_secs(inode)),
            id: Some(FileId::new_inode(1, inode)),
        }
    }

    fn snapshot(entries: &[(&str, Fingerprint)]) -> Snapshot {
        entries
            .iter()
            .map(|(name, fingerprint)| (OsString::from(name), *fingerprint))
            .collect()
    }

    #[test]
    fn test_diff_moved() {
        let f = fingerprint(Kind::File, 10, 7);
        let prev = snapshot(&[("old.txt", f)]);
        let next = snapshot(&[("new.txt", f)]);
        assert_eq!(
            prev.diff(&next),
            vec![Difference::Moved {
                from: OsString::from("old.txt"),
                to: OsString::from("new.txt"),
                kind: Kind::File,
            }]
        );
    }

    #[test]
    fn test_diff_fingerprint_mismatch() {
        let prev = snapshot(&[("old.txt", fingerprint(Kind::File, 10, 7))]);
        let next = snapshot(&[("new.txt", fingerprint(Kind::File, 11, 8))]);
        assert_eq!(
            prev.diff(&next),
            vec![
                Difference::Removed(OsString::from("old.txt"), Kind::File),
                Difference::Added(OsString::from("new.txt"), Kind::File),
            ]
        );
    }

    #[test]
    fn test_diff_pairs_in_name_order() {
        let f = fingerprint(Kind::File, 0, 3);
        let prev = snapshot(&[("a", f), ("b", f)]);
        let next = snapshot(&[("d", f), ("c", f)]);
        assert_eq!(
            prev.diff(&next),
            vec![
                Difference::Moved {
                    from: OsString::from("a"),
                    to: OsString::from("c"),
                    kind: Kind::File,
                },
                Difference::Moved {
                    from: OsString::from("b"),
                    to: OsString::from("d"),
                    kind: Kind::File,
                },
            ]
        );
    }

    #[test]
    fn test_diff_modified_ignores_folders() {
        let prev = snapshot(&[
            ("a.txt", fingerprint(Kind::File, 1, 1)),
            ("dir", fingerprint(Kind::Folder, 4096, 2)),
        ]);
        let mut next = prev.clone();
        next.insert("a.txt", fingerprint(Kind::File, 2, 1));
        next.insert("dir", fingerprint(Kind::Folder, 4096, 9));
        assert_eq!(
            prev.diff(&next),
            vec![Difference::Modified(OsString::from("a.txt"), Kind::File)]
        );
    }

    #[test]
    fn test_diff_kind_change() {
        let prev = snapshot(&[("x", fingerprint(Kind::File, 1, 1))]);
        let next = snapshot(&[("x", fingerprint(Kind::Folder, 1, 2))]);
        assert_eq!(
            prev.diff(&next),
            vec![
                Difference::Removed(OsString::from("x"), Kind::File),
                Difference::Added(OsString::from("x"), Kind::Folder),
            ]
        );
    }

    #[test]
    fn test_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "x").unwrap();

        let snapshot = Snapshot::read(dir.path()).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("a.txt").map(|f| f.size), Some(5));
        assert_eq!(snapshot.get("sub").map(|f| f.kind), Some(Kind::Folder));
        assert!(matches!(
            Snapshot::read(dir.path().join("missing")),
            Err(Error::NotFound(_))
        ));
    }
}
