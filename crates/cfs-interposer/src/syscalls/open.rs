//! open family: `open`, `openat`, `creat`, their `64` aliases and the
//! `_FORTIFY_SOURCE` variants `__open_2` / `__openat_2`.
//!
//! A successful in-tree open is recorded and its descriptor enters the FD
//! table, so later reads and writes through it are attributed to the path.

use super::{classify, dispatch, forward, status};
use crate::errno;
use crate::path::{Base, Follow};
use crate::reals;
use crate::state::Session;
use crate::sync::FdEntry;
use cfs_ipc::OpKind;
use libc::{c_char, c_int, c_uint, mode_t};
use std::sync::Arc;

/// Event kind for an open with these flags.
///
/// `created` means `O_CREAT` was given and nothing existed at the path before
/// the call.
pub fn open_kind(flags: c_int, created: bool) -> OpKind {
    if flags & libc::O_PATH != 0 {
        OpKind::Metadata
    } else if created {
        OpKind::Create
    } else if flags & libc::O_ACCMODE == libc::O_RDONLY && flags & libc::O_TRUNC == 0 {
        OpKind::Read
    } else {
        OpKind::Write
    }
}

/// Tracked core shared by every open-family entry point.
///
/// `real` performs the one forwarded call; `base` and `flags` describe it for
/// classification.
pub unsafe fn open_in(
    s: &Session,
    base: Base,
    path: *const c_char,
    flags: c_int,
    real: impl FnOnce() -> c_int,
) -> c_int {
    let saved = errno::get();
    let tracked = classify(s, base, path, Follow::from_open_flags(flags));
    let creating = match &tracked {
        Some(p) if flags & libc::O_CREAT != 0 => p.symlink_metadata().is_err(),
        _ => false,
    };

    forward(saved, real, |fd, err| {
        let Some(path) = tracked else {
            // A new descriptor reusing a number we never saw closed
            if fd >= 0 {
                s.fds.remove(fd);
            }
            return;
        };
        s.record(open_kind(flags, creating), path.clone(), None, status(fd < 0, err), None);
        if fd >= 0 {
            match FdEntry::from_fd(fd, path, flags) {
                Some(entry) => {
                    s.fds.insert(fd, Arc::new(entry));
                }
                None => {
                    s.fds.remove(fd);
                }
            }
        }
    })
}

pub unsafe fn open_shim(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real = || reals::open()(path, flags, mode as c_uint);
    dispatch(real, |s| open_in(s, Base::Cwd, path, flags, real))
}

pub unsafe fn open64_shim(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real = || reals::open64()(path, flags, mode as c_uint);
    dispatch(real, |s| open_in(s, Base::Cwd, path, flags, real))
}

pub unsafe fn openat_shim(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real = || reals::openat()(dirfd, path, flags, mode as c_uint);
    dispatch(real, |s| open_in(s, Base::at(dirfd), path, flags, real))
}

pub unsafe fn openat64_shim(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real = || reals::openat64()(dirfd, path, flags, mode as c_uint);
    dispatch(real, |s| open_in(s, Base::at(dirfd), path, flags, real))
}

const CREAT_FLAGS: c_int = libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC;

pub unsafe fn creat_shim(path: *const c_char, mode: mode_t) -> c_int {
    let real = || reals::creat()(path, mode);
    dispatch(real, |s| open_in(s, Base::Cwd, path, CREAT_FLAGS, real))
}

pub unsafe fn creat64_shim(path: *const c_char, mode: mode_t) -> c_int {
    let real = || reals::creat64()(path, mode);
    dispatch(real, |s| open_in(s, Base::Cwd, path, CREAT_FLAGS, real))
}

pub unsafe fn open_2_shim(path: *const c_char, flags: c_int) -> c_int {
    let real = || reals::open_2()(path, flags);
    dispatch(real, |s| open_in(s, Base::Cwd, path, flags, real))
}

pub unsafe fn open64_2_shim(path: *const c_char, flags: c_int) -> c_int {
    let real = || reals::open64_2()(path, flags);
    dispatch(real, |s| open_in(s, Base::Cwd, path, flags, real))
}

pub unsafe fn openat_2_shim(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    let real = || reals::openat_2()(dirfd, path, flags);
    dispatch(real, |s| open_in(s, Base::at(dirfd), path, flags, real))
}

pub unsafe fn openat64_2_shim(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    let real = || reals::openat64_2()(dirfd, path, flags);
    dispatch(real, |s| open_in(s, Base::at(dirfd), path, flags, real))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestSession;
    use crate::syscalls::testing::*;
    use cfs_ipc::Outcome;

    unsafe fn open_at(s: &Session, dirfd: c_int, path: &std::ffi::CStr, flags: c_int) -> c_int {
        open_in(s, Base::at(dirfd), path.as_ptr(), flags, || {
            reals::openat()(dirfd, path.as_ptr(), flags, 0o644 as c_uint)
        })
    }

    #[test]
    fn test_open_kind_mapping() {
        assert_eq!(open_kind(libc::O_RDONLY, false), OpKind::Read);
        assert_eq!(open_kind(libc::O_WRONLY, false), OpKind::Write);
        assert_eq!(open_kind(libc::O_RDWR, false), OpKind::Write);
        assert_eq!(open_kind(libc::O_RDONLY | libc::O_TRUNC, false), OpKind::Write);
        assert_eq!(open_kind(libc::O_WRONLY | libc::O_CREAT, true), OpKind::Create);
        assert_eq!(open_kind(libc::O_WRONLY | libc::O_CREAT, false), OpKind::Write);
        assert_eq!(open_kind(libc::O_PATH, false), OpKind::Metadata);
    }

    #[test]
    fn test_create_then_reopen_for_read() {
        let t = TestSession::new();
        let s = &t.session;
        let file = t.tree.root.join("out.o");
        let c = cpath(&file);
        unsafe {
            let fd = open_at(s, libc::AT_FDCWD, &c, libc::O_CREAT | libc::O_WRONLY);
            assert!(fd >= 0);
            let entry = s.fds.get(fd).unwrap();
            assert_eq!(entry.path, file);
            assert_eq!(entry.flags, libc::O_CREAT | libc::O_WRONLY);
            reals::close()(fd);
            s.fds.remove(fd);

            // Exists now: opening with O_CREAT again is a plain write
            let fd = open_at(s, libc::AT_FDCWD, &c, libc::O_CREAT | libc::O_WRONLY);
            reals::close()(fd);
            s.fds.remove(fd);
            let fd = open_at(s, libc::AT_FDCWD, &c, libc::O_RDONLY);
            reals::close()(fd);
            s.fds.remove(fd);
        }
        let kinds: Vec<OpKind> = t.events().into_iter().map(|e| e.0).collect();
        assert_eq!(kinds, vec![OpKind::Create, OpKind::Write, OpKind::Read]);
    }

    #[test]
    fn test_failed_open_reports_errno_and_records_failure() {
        let t = TestSession::new();
        let missing = cpath(t.tree.root.join("missing.h"));
        set_errno(0);
        let fd = unsafe { open_at(&t.session, libc::AT_FDCWD, &missing, libc::O_RDONLY) };
        assert_eq!(fd, -1);
        assert_eq!(errno(), libc::ENOENT);

        let events = t.raw_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, OpKind::Read);
        assert_eq!(events[0].outcome, Outcome::Failure { errno: libc::ENOENT });
        assert!(t.session.fds.is_empty());
    }

    #[test]
    fn test_out_of_tree_matches_libc() {
        let t = TestSession::new();
        let missing = cpath(t.tree.outside.join("non-existent-file"));

        set_errno(0);
        let direct = unsafe { libc::open(missing.as_ptr(), libc::O_RDONLY) };
        let direct_errno = errno();
        set_errno(0);
        let shimmed = unsafe { open_at(&t.session, libc::AT_FDCWD, &missing, libc::O_RDONLY) };
        assert_eq!((shimmed, errno()), (direct, direct_errno));
        assert!(t.events().is_empty());
    }

    #[test]
    fn test_success_leaves_caller_errno() {
        let t = TestSession::new();
        let c = cpath(t.tree.root.join("a.c"));
        std::fs::write(t.tree.root.join("a.c"), b"int x;").unwrap();
        set_errno(libc::EAGAIN);
        let fd = unsafe { open_at(&t.session, libc::AT_FDCWD, &c, libc::O_RDONLY) };
        assert!(fd >= 0);
        assert_eq!(errno(), libc::EAGAIN);
        unsafe { reals::close()(fd) };
    }

    #[test]
    fn test_openat_relative_to_tracked_dir() {
        let t = TestSession::new();
        let s = &t.session;
        std::fs::create_dir(t.tree.root.join("obj")).unwrap();
        let dir = cpath(t.tree.root.join("obj"));
        let name = cpath("x.o");
        unsafe {
            let dirfd = open_at(s, libc::AT_FDCWD, &dir, libc::O_RDONLY | libc::O_DIRECTORY);
            assert!(s.fds.get(dirfd).unwrap().is_dir);
            let fd = open_at(s, dirfd, &name, libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY);
            assert_eq!(s.fds.get(fd).unwrap().path, t.tree.root.join("obj/x.o"));
            reals::close()(fd);
            reals::close()(dirfd);
        }
        let events = t.events();
        assert_eq!(events[0], (OpKind::Read, t.tree.root.join("obj"), None));
        assert_eq!(events[1], (OpKind::Create, t.tree.root.join("obj/x.o"), None));
    }

    #[test]
    fn test_o_path_is_metadata() {
        let t = TestSession::new();
        let c = cpath(&t.tree.root);
        let fd = unsafe { open_at(&t.session, libc::AT_FDCWD, &c, libc::O_PATH) };
        assert!(fd >= 0);
        unsafe { reals::close()(fd) };
        assert_eq!(t.events()[0].0, OpKind::Metadata);
    }

    #[test]
    fn test_untracked_open_evicts_stale_entry() {
        let t = TestSession::new();
        let s = &t.session;
        let inside = t.tree.root.join("a.o");
        std::fs::write(&inside, b"").unwrap();
        let outside = cpath(t.tree.outside.join("b"));
        let fd = unsafe {
            open_in(s, Base::Cwd, outside.as_ptr(), libc::O_CREAT | libc::O_WRONLY, || {
                let fd = reals::open()(outside.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o644 as c_uint);
                // Left over from a descriptor closed behind the interposer's back
                let stale = FdEntry::from_fd(fd, inside.clone(), libc::O_WRONLY).unwrap();
                s.fds.insert(fd, Arc::new(stale));
                fd
            })
        };
        assert!(fd >= 0);
        assert!(s.fds.get(fd).is_none());
        unsafe { reals::close()(fd) };
    }
}
