//! Metadata queries. Failures are recorded too: a build that probed for a
//! missing header depends on it staying missing.

use super::{classify, dispatch, forward, status};
use crate::errno;
use crate::path::{Base, Follow};
use crate::reals;
use crate::state::Session;
use cfs_ipc::OpKind;
use libc::{c_char, c_int, c_uint};
use std::path::PathBuf;

/// Record a metadata query on an already classified path.
unsafe fn query_in(s: &Session, tracked: Option<PathBuf>, saved: c_int, real: impl FnOnce() -> c_int) -> c_int {
    let Some(path) = tracked else {
        errno::set(saved);
        return real();
    };
    forward(saved, real, |rc, err| {
        s.record(OpKind::Metadata, path, None, status(rc < 0, err), None);
    })
}

/// Path-based query: `stat`, `lstat`, `access`.
pub unsafe fn path_query_in(
    s: &Session,
    path: *const c_char,
    follow: Follow,
    real: impl FnOnce() -> c_int,
) -> c_int {
    let saved = errno::get();
    let tracked = classify(s, Base::Cwd, path, follow);
    query_in(s, tracked, saved, real)
}

/// Descriptor-based query: `fstat`.
pub unsafe fn fd_query_in(s: &Session, fd: c_int, real: impl FnOnce() -> c_int) -> c_int {
    let saved = errno::get();
    let tracked = s.fds.get(fd).map(|entry| entry.path.clone());
    query_in(s, tracked, saved, real)
}

/// `*at` query honoring `AT_SYMLINK_NOFOLLOW` and `AT_EMPTY_PATH`.
pub unsafe fn at_query_in(
    s: &Session,
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    real: impl FnOnce() -> c_int,
) -> c_int {
    let saved = errno::get();
    let empty = !path.is_null() && *path == 0;
    let tracked = if empty && flags & libc::AT_EMPTY_PATH != 0 {
        s.fds.get(dirfd).map(|entry| entry.path.clone())
    } else {
        classify(s, Base::at(dirfd), path, Follow::from_at_flags(flags))
    };
    query_in(s, tracked, saved, real)
}

pub unsafe fn stat_shim(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let real = || reals::stat()(path, buf);
    dispatch(real, |s| path_query_in(s, path, Follow::Target, real))
}

pub unsafe fn stat64_shim(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    let real = || reals::stat64()(path, buf);
    dispatch(real, |s| path_query_in(s, path, Follow::Target, real))
}

pub unsafe fn lstat_shim(path: *const c_char, buf: *mut libc::stat) -> c_int {
    let real = || reals::lstat()(path, buf);
    dispatch(real, |s| path_query_in(s, path, Follow::Entry, real))
}

pub unsafe fn lstat64_shim(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    let real = || reals::lstat64()(path, buf);
    dispatch(real, |s| path_query_in(s, path, Follow::Entry, real))
}

pub unsafe fn access_shim(path: *const c_char, mode: c_int) -> c_int {
    let real = || reals::access()(path, mode);
    dispatch(real, |s| path_query_in(s, path, Follow::Target, real))
}

pub unsafe fn fstat_shim(fd: c_int, buf: *mut libc::stat) -> c_int {
    let real = || reals::fstat()(fd, buf);
    dispatch(real, |s| fd_query_in(s, fd, real))
}

pub unsafe fn fstat64_shim(fd: c_int, buf: *mut libc::stat64) -> c_int {
    let real = || reals::fstat64()(fd, buf);
    dispatch(real, |s| fd_query_in(s, fd, real))
}

pub unsafe fn fstatat_shim(dirfd: c_int, path: *const c_char, buf: *mut libc::stat, flags: c_int) -> c_int {
    let real = || reals::fstatat()(dirfd, path, buf, flags);
    dispatch(real, |s| at_query_in(s, dirfd, path, flags, real))
}

pub unsafe fn fstatat64_shim(
    dirfd: c_int,
    path: *const c_char,
    buf: *mut libc::stat64,
    flags: c_int,
) -> c_int {
    let real = || reals::fstatat64()(dirfd, path, buf, flags);
    dispatch(real, |s| at_query_in(s, dirfd, path, flags, real))
}

pub unsafe fn statx_shim(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mask: c_uint,
    buf: *mut libc::statx,
) -> c_int {
    let real = || reals::statx()(dirfd, path, flags, mask, buf);
    dispatch(real, |s| at_query_in(s, dirfd, path, flags, real))
}
