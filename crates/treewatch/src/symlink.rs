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
//! Symbolic link safety.

use std::fs;
use std::path::{self, Path, PathBuf};

use super::{Error, Result};

// ----------------------------------------------------------------------------
// Enums
// ----------------------------------------------------------------------------

/// Traversal decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Enter the directory at the given real path.
    Enter(PathBuf),
    /// Skip the directory.
    Skip(Reason),
}

/// Reason for skipping a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    /// Directory is a symbolic link, and links are not followed.
    Link,
    /// Symbolic link cannot be resolved.
    Broken,
    /// Symbolic link points to a directory already being traversed.
    Cycle,
    /// Symbolic link points outside of the watched root.
    OutOfScope,
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

/// Symbolic link policy.
///
/// The policy is set per watcher, and copied into every watch entry that is
/// created, so changing it only affects watches created afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    /// Whether symbolic links to directories are followed.
    pub follow_symlinks: bool,
    /// Whether followed links may point outside of the watched root.
    pub allow_out_of_scope_links: bool,
}

// ----------------------------------------------------------------------------

/// Symbolic link resolver.
///
/// The resolver decides whether a directory that is discovered while walking
/// beneath a watched root may be entered. Plain directories are always entered.
/// Symbolic links are only entered if links are followed, and their real path
/// is neither part of the current chain of ancestors, which would introduce a
/// cycle, nor outside of the watched root, unless out of scope links are
/// allowed. When out of scope links are allowed, a link pointing to a parent
/// of any ancestor is still rejected as a cycle.
///
/// The check must be repeated whenever a directory is discovered, as a plain
/// directory might be replaced by a symbolic link at any time.
///
/// # Examples
///
/// ```
/// # use std::error::Error;
/// # fn main() -> Result<(), Box<dyn Error>> {
/// use std::fs;
/// use treewatch::symlink::{Decision, Policy, Resolver};
///
/// // Create resolver for the current directory
/// let root = fs::canonicalize(".")?;
/// let resolver = Resolver::new(Policy::default(), &root);
///
/// // Plain directories are always entered
/// let decision = resolver.check(root.join("src"), &[root.clone()]);
/// assert_eq!(decision, Decision::Enter(root.join("src")));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Resolver<'a> {
    /// Symbolic link policy.
    policy: Policy,
    /// Real path of the watched root.
    root: &'a Path,
}

// ----------------------------------------------------------------------------
// Implementations
// ----------------------------------------------------------------------------

impl<'a> Resolver<'a> {
    /// Creates a resolver for the given policy and real root path.
    #[must_use]
    pub fn new(policy: Policy, root: &'a Path) -> Self {
        Self { policy, root }
    }

    /// Decides whether the candidate directory may be entered.
    ///
    /// The ancestors must be the real paths of all directories traversed to
    /// reach the candidate, starting at the root. On [`Decision::Enter`], the
    /// returned real path is to be pushed onto the ancestors for descending.
    pub fn check<P>(&self, candidate: P, ancestors: &[PathBuf]) -> Decision
    where
        P: AsRef<Path>,
    {
        let candidate = candidate.as_ref();
        let link = fs::symlink_metadata(candidate)
            .is_ok_and(|metadata| metadata.file_type().is_symlink());
        if !link {
            return Decision::Enter(candidate.to_path_buf());
        }

        // Symbolic links are only considered when following is enabled
        if !self.policy.follow_symlinks {
            return Decision::Skip(Reason::Link);
        }
        let Ok(real) = fs::canonicalize(candidate) else {
            return Decision::Skip(Reason::Broken);
        };

        // Order matters here: a link pointing back at an ancestor is a cycle,
        // a link leaving the root is out of scope, and a link pointing above
        // an ancestor would re-enter the traversal from the outside
        if ancestors.contains(&real) {
            Decision::Skip(Reason::Cycle)
        } else if !self.policy.allow_out_of_scope_links
            && !real.starts_with(self.root)
        {
            Decision::Skip(Reason::OutOfScope)
        } else if ancestors.iter().any(|ancestor| ancestor.starts_with(&real)) {
            Decision::Skip(Reason::Cycle)
        } else {
            Decision::Enter(real)
        }
    }
}

// ----------------------------------------------------------------------------
// Functions
// ----------------------------------------------------------------------------

/// Resolves the real path of a directory requested to be watched.
///
/// If the requested path itself is a symbolic link, it must be followed, and
/// its target must be located inside the directory containing the link, unless
/// out of scope links are allowed. Links in intermediate components are always
/// resolved, as they do not affect the scope of the watch.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the path does not exist, [`Error::NotReadable`]
/// if it cannot be accessed, and [`Error::OutOfScope`] on a policy violation.
pub fn resolve_root<P>(path: P, policy: Policy) -> Result<PathBuf>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let metadata =
        fs::symlink_metadata(path).map_err(|err| Error::from_io(err, path))?;
    let real = fs::canonicalize(path).map_err(|err| Error::from_io(err, path))?;
    if !metadata.file_type().is_symlink() {
        return Ok(real);
    }

    // The requested path is a symbolic link, so check the policy
    if !policy.follow_symlinks {
        return Err(Error::OutOfScope(path.to_path_buf()));
    }
    if !policy.allow_out_of_scope_links {
        let scope = path::absolute(path)
            .ok()
            .and_then(|path| path.parent().map(fs::canonicalize))
            .and_then(std::result::Result::ok);
        if !scope.is_some_and(|scope| real.starts_with(scope)) {
            return Err(Error::OutOfScope(path.to_path_buf()));
        }
    }
    Ok(real)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    const FOLLOW: Policy = Policy {
        follow_symlinks: true,
        allow_out_of_scope_links: false,
    };

    #[test]
    fn test_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(root.join("sub")).unwrap();

        let resolver = Resolver::new(Policy::default(), &root);
        let decision = resolver.check(root.join("sub"), &[root.clone()]);
        assert_eq!(decision, Decision::Enter(root.join("sub")));
    }

    #[test]
    fn test_link_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        symlink(root.join("sub"), root.join("link")).unwrap();

        let resolver = Resolver::new(Policy::default(), &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Skip(Reason::Link));
    }

    #[test]
    fn test_link_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        symlink(&root, root.join("link")).unwrap();

        let resolver = Resolver::new(FOLLOW, &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Skip(Reason::Cycle));
    }

    #[test]
    fn test_link_out_of_scope() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        symlink("/", root.join("link")).unwrap();

        let resolver = Resolver::new(FOLLOW, &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Skip(Reason::OutOfScope));

        // Allowing out of scope links still rejects parents of the root
        let policy = Policy {
            allow_out_of_scope_links: true,
            ..FOLLOW
        };
        let resolver = Resolver::new(policy, &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Skip(Reason::Cycle));
    }

    #[test]
    fn test_link_in_scope() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        symlink(root.join("a/b"), root.join("link")).unwrap();

        let resolver = Resolver::new(FOLLOW, &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Enter(root.join("a/b")));
    }

    #[test]
    fn test_broken_link() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        symlink(root.join("missing"), root.join("link")).unwrap();

        let resolver = Resolver::new(FOLLOW, &root);
        let decision = resolver.check(root.join("link"), &[root.clone()]);
        assert_eq!(decision, Decision::Skip(Reason::Broken));
    }

    #[test]
    fn test_resolve_root() {
        let dir = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(base.join("docs")).unwrap();
        symlink(base.join("docs"), base.join("inside")).unwrap();
        symlink("/", base.join("outside")).unwrap();

        let real = resolve_root(base.join("docs"), Policy::default()).unwrap();
        assert_eq!(real, base.join("docs"));
        assert!(matches!(
            resolve_root(base.join("inside"), Policy::default()),
            Err(Error::OutOfScope(_))
        ));
        assert_eq!(resolve_root(base.join("inside"), FOLLOW).unwrap(), real);
        assert!(matches!(
            resolve_root(base.join("outside"), FOLLOW),
            Err(Error::OutOfScope(_))
        ));
        assert!(matches!(
            resolve_root(base.join("missing"), FOLLOW),
            Err(Error::NotFound(_))
        ));
    }
}
