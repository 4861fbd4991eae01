//! Build-tree classification.
//!
//! A path argument is turned into the absolute, symlink-normalized path the
//! kernel would act on, then compared component-wise against the configured
//! roots. Resolution goes through `realpath(3)` (via `fs::canonicalize`), which
//! applies the same rules as the kernel: symlinks are expanded before a
//! following `..` is processed.
//!
//! Symlink policy: calls that follow links classify by the resolved target;
//! calls that operate on the directory entry itself (lstat, unlink, rename,
//! `O_NOFOLLOW`, ...) classify the entry, i.e. its canonical parent joined with
//! the final component.

use crate::sync::FdTable;
use cfs_config::log_classifier_debug;
use libc::{c_char, c_int};
use std::ffi::{CStr, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::field;

/// Kernel limit on symlink expansions in one lookup.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Directory a relative path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Cwd,
    Dir(c_int),
}

impl Base {
    /// Base for an `*at` call.
    pub fn at(dirfd: c_int) -> Self {
        if dirfd == libc::AT_FDCWD {
            Base::Cwd
        } else {
            Base::Dir(dirfd)
        }
    }
}

/// Whether the call acts on a final symlink's target or on the link itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Follow {
    Target,
    Entry,
}

impl Follow {
    pub fn from_open_flags(flags: c_int) -> Self {
        // O_CREAT|O_EXCL fails on any existing entry, link or not.
        if flags & libc::O_NOFOLLOW != 0
            || flags & (libc::O_CREAT | libc::O_EXCL) == (libc::O_CREAT | libc::O_EXCL)
        {
            Follow::Entry
        } else {
            Follow::Target
        }
    }

    pub fn from_at_flags(flags: c_int) -> Self {
        if flags & libc::AT_SYMLINK_NOFOLLOW != 0 {
            Follow::Entry
        } else {
            Follow::Target
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("empty path")]
    EmptyPath,
    #[error("base descriptor {0} has no path")]
    BadBase(c_int),
    #[error("cannot resolve {path:?} (errno {errno})")]
    Unresolvable { path: PathBuf, errno: c_int },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    InTree(PathBuf),
    OutOfTree(PathBuf),
    /// Treated as out-of-tree.
    Unresolved(ClassifyError),
}

impl Classification {
    pub fn is_in_tree(&self) -> bool {
        matches!(self, Classification::InTree(_))
    }

    /// The canonical path if the access must be recorded.
    pub fn into_tracked(self) -> Option<PathBuf> {
        match self {
            Classification::InTree(path) => Some(path),
            _ => None,
        }
    }
}

/// The set of canonical build-tree roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTree {
    roots: Vec<PathBuf>,
}

impl BuildTree {
    /// Canonicalize configured roots. Fails if any root does not exist.
    pub fn from_roots(roots: &[PathBuf]) -> anyhow::Result<Self> {
        Ok(Self {
            roots: cfs_config::path::canonical_roots(roots)?,
        })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// `path` must already be canonical.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| cfs_config::path::is_within(path, root))
    }

    pub fn classify(
        &self,
        base: Base,
        path: &Path,
        follow: Follow,
        fds: &FdTable,
    ) -> Classification {
        match resolve(base, path, follow, fds) {
            Ok(canonical) if self.contains(&canonical) => Classification::InTree(canonical),
            Ok(canonical) => Classification::OutOfTree(canonical),
            Err(err) => {
                log_classifier_debug!(
                    "Unresolvable path treated as out-of-tree",
                    path = field::debug(path),
                    error = field::display(&err),
                );
                Classification::Unresolved(err)
            }
        }
    }
}

/// Borrow a C path argument. `None` for a null pointer.
///
/// # Safety
/// `p` must be null or point to a NUL-terminated string that outlives `'a`.
pub unsafe fn c_path<'a>(p: *const c_char) -> Option<&'a Path> {
    if p.is_null() {
        return None;
    }
    let bytes = CStr::from_ptr(p).to_bytes();
    Some(Path::new(OsStr::from_bytes(bytes)))
}

/// Absolute path of the directory behind `fd`.
pub fn fd_path(fd: c_int, fds: &FdTable) -> Option<PathBuf> {
    if fd < 0 {
        return None;
    }
    match std::fs::read_link(format!("/proc/self/fd/{}", fd)) {
        Ok(path) if path.is_absolute() => Some(path),
        _ => fds.get(fd).map(|entry| entry.path.clone()),
    }
}

/// Resolve `path` the way the kernel would for a call with the given base
/// and link-following behavior.
pub fn resolve(base: Base, path: &Path, follow: Follow, fds: &FdTable) -> Result<PathBuf, ClassifyError> {
    if path.as_os_str().is_empty() {
        return Err(ClassifyError::EmptyPath);
    }
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let dir = match base {
            Base::Cwd => std::env::current_dir().map_err(|e| ClassifyError::Unresolvable {
                path: path.to_path_buf(),
                errno: errno_of(&e),
            })?,
            Base::Dir(fd) => fd_path(fd, fds).ok_or(ClassifyError::BadBase(fd))?,
        };
        dir.join(path)
    };

    match follow {
        Follow::Target => resolve_target(&full, 0),
        Follow::Entry => resolve_entry(&full),
    }
}

fn resolve_target(full: &Path, hops: usize) -> Result<PathBuf, ClassifyError> {
    match full.canonicalize() {
        Ok(canonical) => Ok(canonical),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => resolve_missing(full, hops),
        Err(e) => Err(unresolvable(full, &e)),
    }
}

/// The final component does not exist, or is a dangling symlink.
fn resolve_missing(full: &Path, hops: usize) -> Result<PathBuf, ClassifyError> {
    let candidate = resolve_entry(full)?;
    match std::fs::symlink_metadata(&candidate) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if hops >= MAX_SYMLINK_HOPS {
                return Err(ClassifyError::Unresolvable {
                    path: full.to_path_buf(),
                    errno: libc::ELOOP,
                });
            }
            let target = std::fs::read_link(&candidate).map_err(|e| unresolvable(full, &e))?;
            let next = match candidate.parent() {
                Some(dir) if target.is_relative() => dir.join(target),
                _ => target,
            };
            resolve_target(&next, hops + 1)
        }
        _ => Ok(candidate),
    }
}

/// Canonical parent joined with the final component, without following it.
fn resolve_entry(full: &Path) -> Result<PathBuf, ClassifyError> {
    let (Some(parent), Some(name)) = (full.parent(), full.file_name()) else {
        // "/" or a path ending in ".."
        return full.canonicalize().map_err(|e| unresolvable(full, &e));
    };
    let parent = parent
        .canonicalize()
        .map_err(|e| unresolvable(full, &e))?;
    Ok(parent.join(name))
}

fn unresolvable(path: &Path, err: &io::Error) -> ClassifyError {
    ClassifyError::Unresolvable {
        path: path.to_path_buf(),
        errno: errno_of(err),
    }
}

fn errno_of(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_config::testing::TestTree;
    use std::ffi::CString;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::symlink;

    fn setup() -> (TestTree, BuildTree, FdTable) {
        let t = TestTree::new().unwrap();
        let tree = BuildTree::from_roots(&[t.root.clone()]).unwrap();
        (t, tree, FdTable::new())
    }

    #[test]
    fn test_root_and_descendants_in_tree() {
        let (t, tree, fds) = setup();
        std::fs::write(t.root.join("a.c"), b"int x;").unwrap();

        let c = tree.classify(Base::Cwd, &t.root, Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.clone()));
        let c = tree.classify(Base::Cwd, &t.root.join("a.c"), Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.join("a.c")));
    }

    #[test]
    fn test_sibling_prefix_is_out_of_tree() {
        let (t, tree, fds) = setup();
        let sibling = PathBuf::from(format!("{}x", t.root.display()));
        std::fs::create_dir(&sibling).unwrap();

        let c = tree.classify(Base::Cwd, &sibling.join("f"), Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(sibling.join("f")));
    }

    #[test]
    fn test_nonexistent_target_classified_by_parent() {
        let (t, tree, fds) = setup();
        let c = tree.classify(Base::Cwd, &t.root.join("new.o"), Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.join("new.o")));

        let c = tree.classify(Base::Cwd, &t.root.join("./sub/../new.o"), Follow::Entry, &fds);
        // "sub" does not exist, so "sub/.." cannot be walked
        assert!(matches!(
            c,
            Classification::Unresolved(ClassifyError::Unresolvable { errno: libc::ENOENT, .. })
        ));
    }

    #[test]
    fn test_missing_intermediate_is_unresolved() {
        let (t, tree, fds) = setup();
        let c = tree.classify(Base::Cwd, &t.root.join("nodir/file"), Follow::Target, &fds);
        assert!(!c.is_in_tree());
        assert!(matches!(c, Classification::Unresolved(_)));
        assert!(c.into_tracked().is_none());
    }

    #[test]
    fn test_link_inside_pointing_out() {
        let (t, tree, fds) = setup();
        let target = t.outside.join("lib.a");
        std::fs::write(&target, b"!<arch>").unwrap();
        let link = t.root.join("lib.a");
        symlink(&target, &link).unwrap();

        // Following calls see the outside object
        let c = tree.classify(Base::Cwd, &link, Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(target));
        // Entry calls (lstat, unlink) see the in-tree link
        let c = tree.classify(Base::Cwd, &link, Follow::Entry, &fds);
        assert_eq!(c, Classification::InTree(link));
    }

    #[test]
    fn test_link_outside_pointing_in() {
        let (t, tree, fds) = setup();
        let target = t.root.join("gen.h");
        std::fs::write(&target, b"#pragma once").unwrap();
        let link = t.outside.join("gen.h");
        symlink(&target, &link).unwrap();

        let c = tree.classify(Base::Cwd, &link, Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(target));
        let c = tree.classify(Base::Cwd, &link, Follow::Entry, &fds);
        assert_eq!(c, Classification::OutOfTree(link));
    }

    #[test]
    fn test_nested_links_crossing_twice() {
        let (t, tree, fds) = setup();
        // root/out -> outside/dir, outside/dir/back -> root/real
        std::fs::create_dir(t.outside.join("dir")).unwrap();
        std::fs::create_dir(t.root.join("real")).unwrap();
        symlink(t.outside.join("dir"), t.root.join("out")).unwrap();
        symlink(t.root.join("real"), t.outside.join("dir/back")).unwrap();

        let c = tree.classify(Base::Cwd, &t.root.join("out/back/x.o"), Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.join("real/x.o")));
        let c = tree.classify(Base::Cwd, &t.root.join("out/y.o"), Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(t.outside.join("dir/y.o")));
    }

    #[test]
    fn test_dotdot_after_symlink_uses_link_target() {
        let (t, tree, fds) = setup();
        std::fs::create_dir(t.outside.join("dir")).unwrap();
        symlink(t.outside.join("dir"), t.root.join("link")).unwrap();

        // Kernel semantics: link/.. is the target's parent, not the tree root
        let c = tree.classify(Base::Cwd, &t.root.join("link/../f"), Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(t.outside.join("f")));
    }

    #[test]
    fn test_dangling_link_chased_to_target() {
        let (t, tree, fds) = setup();
        let link = t.root.join("dangling");
        symlink(t.outside.join("created-later"), &link).unwrap();

        // open(O_CREAT) through the link creates the outside file
        let c = tree.classify(Base::Cwd, &link, Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(t.outside.join("created-later")));

        let rel = t.outside.join("rel");
        symlink("../build/made.o", &rel).unwrap();
        let c = tree.classify(Base::Cwd, &rel, Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.join("made.o")));
    }

    #[test]
    fn test_symlink_loop_unresolved() {
        let (t, tree, fds) = setup();
        symlink(t.root.join("b"), t.root.join("a")).unwrap();
        symlink(t.root.join("a"), t.root.join("b")).unwrap();

        let c = tree.classify(Base::Cwd, &t.root.join("a"), Follow::Target, &fds);
        assert!(matches!(
            c,
            Classification::Unresolved(ClassifyError::Unresolvable { errno: libc::ELOOP, .. })
        ));
        // The entry itself is still an in-tree object
        assert!(tree
            .classify(Base::Cwd, &t.root.join("a"), Follow::Entry, &fds)
            .is_in_tree());
    }

    #[test]
    fn test_dirfd_relative() {
        let (t, tree, fds) = setup();
        std::fs::create_dir(t.root.join("obj")).unwrap();
        let dir = std::fs::File::open(t.root.join("obj")).unwrap();
        let outside = std::fs::File::open(&t.outside).unwrap();

        let c = tree.classify(Base::at(dir.as_raw_fd()), Path::new("a.o"), Follow::Target, &fds);
        assert_eq!(c, Classification::InTree(t.root.join("obj/a.o")));
        let c = tree.classify(Base::at(dir.as_raw_fd()), Path::new("../../outside/z"), Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(t.outside.join("z")));
        let c = tree.classify(Base::at(outside.as_raw_fd()), Path::new("z"), Follow::Entry, &fds);
        assert_eq!(c, Classification::OutOfTree(t.outside.join("z")));
    }

    #[test]
    fn test_absolute_path_ignores_base() {
        let (t, tree, fds) = setup();
        let c = tree.classify(Base::Dir(-1), &t.root.join("x"), Follow::Target, &fds);
        assert!(c.is_in_tree());

        let c = tree.classify(Base::Dir(-1), Path::new("x"), Follow::Target, &fds);
        assert_eq!(c, Classification::Unresolved(ClassifyError::BadBase(-1)));
    }

    #[test]
    fn test_cwd_relative() {
        let (_t, tree, fds) = setup();
        let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
        let c = tree.classify(Base::Cwd, Path::new("no-such-file.cfs"), Follow::Target, &fds);
        assert_eq!(c, Classification::OutOfTree(cwd.join("no-such-file.cfs")));
    }

    #[test]
    fn test_empty_path() {
        let (_t, tree, fds) = setup();
        let c = tree.classify(Base::Cwd, Path::new(""), Follow::Target, &fds);
        assert_eq!(c, Classification::Unresolved(ClassifyError::EmptyPath));
    }

    #[test]
    fn test_follow_from_flags() {
        assert_eq!(Follow::from_open_flags(libc::O_RDONLY), Follow::Target);
        assert_eq!(Follow::from_open_flags(libc::O_CREAT | libc::O_WRONLY), Follow::Target);
        assert_eq!(Follow::from_open_flags(libc::O_CREAT | libc::O_EXCL), Follow::Entry);
        assert_eq!(Follow::from_open_flags(libc::O_NOFOLLOW), Follow::Entry);
        assert_eq!(Follow::from_at_flags(0), Follow::Target);
        assert_eq!(Follow::from_at_flags(libc::AT_SYMLINK_NOFOLLOW), Follow::Entry);
        assert_eq!(Base::at(libc::AT_FDCWD), Base::Cwd);
        assert_eq!(Base::at(5), Base::Dir(5));
    }

    #[test]
    fn test_c_path() {
        let s = CString::new("/build/\u{e9}.o").unwrap();
        assert_eq!(unsafe { c_path(s.as_ptr()) }, Some(Path::new("/build/\u{e9}.o")));
        assert_eq!(unsafe { c_path(std::ptr::null()) }, None);
    }

    #[test]
    fn test_multiple_roots() {
        let a = TestTree::new().unwrap();
        let b = TestTree::new().unwrap();
        let tree = BuildTree::from_roots(&[a.root.clone(), b.root.clone()]).unwrap();
        assert!(tree.contains(&a.root.join("x")));
        assert!(tree.contains(&b.root.join("y")));
        assert!(!tree.contains(&a.outside));
        assert_eq!(tree.roots().len(), 2);
    }
}
