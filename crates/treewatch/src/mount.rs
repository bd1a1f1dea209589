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
//! Mount point inspection.

use std::path::Path;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// File system types with unreliable change notification.
const REMOTE: &[&str] = &[
    "9p", "afs", "cifs", "coda", "fuse.sshfs", "ncpfs", "nfs", "nfs4",
    "smb", "smb2", "smb3", "smbfs", "sshfs", "webdav",
];

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Returns whether the given path is located on a network file system.
///
/// The mount table is consulted to find the mount point covering the path,
/// which must be absolute and canonical. If the mount table can't be read, the
/// path is assumed to be local.
#[cfg(target_os = "linux")]
#[must_use]
pub fn is_remote(path: &Path) -> bool {
    std::fs::read_to_string("/proc/self/mounts")
        .ok()
        .and_then(|table| fs_type(&table, path))
        .is_some_and(|kind| REMOTE.contains(&kind.as_str()))
}

/// Returns whether the given path is located on a network file system.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn is_remote(_path: &Path) -> bool {
    false
}

/// Returns the file system type of the mount point covering the given path,
/// which is the mount point with the longest matching prefix.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn fs_type(table: &str, path: &Path) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_), Some(target), Some(kind)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        // Mount points are escaped in octal, e.g., spaces become `\040`
        let target = unescape(target);
        if path.starts_with(&target) {
            let depth = Path::new(&target).components().count();
            if best.is_none_or(|(prev, _)| depth >= prev) {
                best = Some((depth, kind));
            }
        }
    }
    best.map(|(_, kind)| kind.to_string())
}

/// Unescapes octal sequences in a mount table field.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = &bytes[i + 1..i + 4];
            if code.iter().all(|digit| (b'0'..=b'7').contains(digit)) {
                let value = code
                    .iter()
                    .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
server:/export /mnt/share nfs4 rw,relatime 0 0
//host/docs /mnt/my\\040docs cifs rw 0 0
tmpfs /mnt/share/cache tmpfs rw 0 0
";

    #[test]
    fn test_fs_type() {
        let cases = vec![
            ("/home/user", "ext4"),
            ("/mnt/share/project", "nfs4"),
            ("/mnt/share/cache/x", "tmpfs"),
            ("/mnt/my docs/a", "cifs"),
            ("/mnt/shared", "ext4"),
        ];
        for (path, expected) in cases {
            let kind = fs_type(TABLE, Path::new(path));
            assert_eq!(kind.as_deref(), Some(expected), "Failed for {path}");
        }
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("/mnt/my\\040docs"), "/mnt/my docs");
        assert_eq!(unescape("/plain"), "/plain");
        assert_eq!(unescape("/trailing\\04"), "/trailing\\04");
    }
}
