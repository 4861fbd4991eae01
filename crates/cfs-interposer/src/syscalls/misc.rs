//! Namespace changes: rename, unlink, rmdir, remove, mkdir.
//!
//! None of these follow a final symlink, so every path is classified as an
//! entry.

use super::{classify, dispatch, forward, status};
use crate::errno;
use crate::path::{Base, Follow};
use crate::reals;
use crate::state::Session;
use cfs_ipc::OpKind;
use libc::{c_char, c_int, c_uint, mode_t};

/// A rename crossing the tree boundary is seen as the half that happens
/// inside it: leaving is a delete, arriving is a create.
pub unsafe fn rename_in(
    s: &Session,
    old_dirfd: c_int,
    old: *const c_char,
    new_dirfd: c_int,
    new: *const c_char,
    flags: c_uint,
    real: impl FnOnce() -> c_int,
) -> c_int {
    let saved = errno::get();
    let src = classify(s, Base::at(old_dirfd), old, Follow::Entry);
    let dst = classify(s, Base::at(new_dirfd), new, Follow::Entry);
    let exchange = flags & libc::RENAME_EXCHANGE != 0;

    forward(saved, real, |rc, err| {
        let outcome = status(rc < 0, err);
        match (src, dst) {
            (Some(src), Some(dst)) => {
                // An exchange swaps two live objects; descriptors keep their paths
                if rc == 0 && !exchange {
                    s.fds.rename_prefix(&src, Some(&dst));
                }
                s.record(OpKind::Rename, src, Some(dst), outcome, None);
            }
            (Some(src), None) => {
                if rc == 0 && !exchange {
                    s.fds.rename_prefix(&src, None);
                }
                s.record(OpKind::Delete, src, None, outcome, None);
            }
            (None, Some(dst)) => s.record(OpKind::Create, dst, None, outcome, None),
            (None, None) => {}
        }
    })
}

pub unsafe fn rename_shim(old: *const c_char, new: *const c_char) -> c_int {
    let real = || reals::rename()(old, new);
    dispatch(real, |s| rename_in(s, libc::AT_FDCWD, old, libc::AT_FDCWD, new, 0, real))
}

pub unsafe fn renameat_shim(
    old_dirfd: c_int,
    old: *const c_char,
    new_dirfd: c_int,
    new: *const c_char,
) -> c_int {
    let real = || reals::renameat()(old_dirfd, old, new_dirfd, new);
    dispatch(real, |s| rename_in(s, old_dirfd, old, new_dirfd, new, 0, real))
}

pub unsafe fn renameat2_shim(
    old_dirfd: c_int,
    old: *const c_char,
    new_dirfd: c_int,
    new: *const c_char,
    flags: c_uint,
) -> c_int {
    let real = || reals::renameat2()(old_dirfd, old, new_dirfd, new, flags);
    dispatch(real, |s| rename_in(s, old_dirfd, old, new_dirfd, new, flags, real))
}

/// Single-path namespace change recorded as `kind`.
pub unsafe fn entry_in(
    s: &Session,
    dirfd: c_int,
    path: *const c_char,
    kind: OpKind,
    real: impl FnOnce() -> c_int,
) -> c_int {
    let saved = errno::get();
    let Some(tracked) = classify(s, Base::at(dirfd), path, Follow::Entry) else {
        errno::set(saved);
        return real();
    };
    forward(saved, real, |rc, err| {
        s.record(kind, tracked, None, status(rc < 0, err), None);
    })
}

pub unsafe fn unlink_shim(path: *const c_char) -> c_int {
    let real = || reals::unlink()(path);
    dispatch(real, |s| entry_in(s, libc::AT_FDCWD, path, OpKind::Delete, real))
}

/// Covers `AT_REMOVEDIR` as well: both are deletes.
pub unsafe fn unlinkat_shim(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    let real = || reals::unlinkat()(dirfd, path, flags);
    dispatch(real, |s| entry_in(s, dirfd, path, OpKind::Delete, real))
}

pub unsafe fn rmdir_shim(path: *const c_char) -> c_int {
    let real = || reals::rmdir()(path);
    dispatch(real, |s| entry_in(s, libc::AT_FDCWD, path, OpKind::Delete, real))
}

pub unsafe fn remove_shim(path: *const c_char) -> c_int {
    let real = || reals::remove()(path);
    dispatch(real, |s| entry_in(s, libc::AT_FDCWD, path, OpKind::Delete, real))
}

pub unsafe fn mkdir_shim(path: *const c_char, mode: mode_t) -> c_int {
    let real = || reals::mkdir()(path, mode);
    dispatch(real, |s| entry_in(s, libc::AT_FDCWD, path, OpKind::Create, real))
}

pub unsafe fn mkdirat_shim(dirfd: c_int, path: *const c_char, mode: mode_t) -> c_int {
    let real = || reals::mkdirat()(dirfd, path, mode);
    dispatch(real, |s| entry_in(s, dirfd, path, OpKind::Create, real))
}
