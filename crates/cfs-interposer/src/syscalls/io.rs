//! Descriptor calls: data transfer plus the lifecycle (`close`, `dup*`,
//! `fcntl(F_DUPFD*)`) that keeps the FD table in step with the kernel.

use super::{dispatch, forward, status};
use crate::errno;
use crate::reals;
use crate::state::Session;
use cfs_ipc::OpKind;
use libc::{c_int, c_void, off64_t, off_t, size_t, ssize_t};

/// Read or write through `fd`. Untracked descriptors go straight through.
pub unsafe fn io_in(s: &Session, fd: c_int, kind: OpKind, real: impl FnOnce() -> ssize_t) -> ssize_t {
    let saved = errno::get();
    let entry = s.fds.get(fd);
    errno::set(saved);
    let Some(entry) = entry else {
        return real();
    };
    forward(saved, real, |n, err| {
        let bytes = (n >= 0).then_some(n as u64);
        s.record(kind, entry.path.clone(), None, status(n < 0, err), bytes);
    })
}

pub unsafe fn read_shim(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let real = || reals::read()(fd, buf, count);
    dispatch(real, |s| io_in(s, fd, OpKind::Read, real))
}

pub unsafe fn read_chk_shim(fd: c_int, buf: *mut c_void, count: size_t, buflen: size_t) -> ssize_t {
    let real = || reals::read_chk()(fd, buf, count, buflen);
    dispatch(real, |s| io_in(s, fd, OpKind::Read, real))
}

pub unsafe fn pread_shim(fd: c_int, buf: *mut c_void, count: size_t, offset: off_t) -> ssize_t {
    let real = || reals::pread()(fd, buf, count, offset);
    dispatch(real, |s| io_in(s, fd, OpKind::Read, real))
}

pub unsafe fn pread64_shim(fd: c_int, buf: *mut c_void, count: size_t, offset: off64_t) -> ssize_t {
    let real = || reals::pread64()(fd, buf, count, offset);
    dispatch(real, |s| io_in(s, fd, OpKind::Read, real))
}

pub unsafe fn write_shim(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let real = || reals::write()(fd, buf, count);
    dispatch(real, |s| io_in(s, fd, OpKind::Write, real))
}

pub unsafe fn pwrite_shim(fd: c_int, buf: *const c_void, count: size_t, offset: off_t) -> ssize_t {
    let real = || reals::pwrite()(fd, buf, count, offset);
    dispatch(real, |s| io_in(s, fd, OpKind::Write, real))
}

pub unsafe fn pwrite64_shim(fd: c_int, buf: *const c_void, count: size_t, offset: off64_t) -> ssize_t {
    let real = || reals::pwrite64()(fd, buf, count, offset);
    dispatch(real, |s| io_in(s, fd, OpKind::Write, real))
}

/// The entry is dropped before the real close: once the kernel releases the
/// number another thread may be handed it by `open`.
pub unsafe fn close_in(s: &Session, fd: c_int, real: impl FnOnce() -> c_int) -> c_int {
    errno::preserve(|| s.fds.remove(fd));
    real()
}

pub unsafe fn close_shim(fd: c_int) -> c_int {
    let real = || reals::close()(fd);
    dispatch(real, |s| close_in(s, fd, real))
}

/// `new_fd` now refers to whatever `old_fd` does. Applied only on success.
pub unsafe fn dup_in(s: &Session, old_fd: c_int, real: impl FnOnce() -> c_int) -> c_int {
    forward(errno::get(), real, |new_fd, _| {
        if new_fd >= 0 && new_fd != old_fd {
            s.fds.duplicate(old_fd, new_fd);
        }
    })
}

pub unsafe fn dup_shim(old_fd: c_int) -> c_int {
    let real = || reals::dup()(old_fd);
    dispatch(real, |s| dup_in(s, old_fd, real))
}

pub unsafe fn dup2_shim(old_fd: c_int, new_fd: c_int) -> c_int {
    let real = || reals::dup2()(old_fd, new_fd);
    dispatch(real, |s| dup_in(s, old_fd, real))
}

pub unsafe fn dup3_shim(old_fd: c_int, new_fd: c_int, flags: c_int) -> c_int {
    let real = || reals::dup3()(old_fd, new_fd, flags);
    dispatch(real, |s| dup_in(s, old_fd, real))
}

fn duplicates(cmd: c_int) -> bool {
    cmd == libc::F_DUPFD || cmd == libc::F_DUPFD_CLOEXEC
}

/// `arg` is passed through untouched: glibc itself reads it as a pointer-sized
/// value whatever the command.
pub unsafe fn fcntl_shim(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    let real = || reals::fcntl()(fd, cmd, arg);
    if !duplicates(cmd) {
        return real();
    }
    dispatch(real, |s| dup_in(s, fd, real))
}

pub unsafe fn fcntl64_shim(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    let real = || reals::fcntl64()(fd, cmd, arg);
    if !duplicates(cmd) {
        return real();
    }
    dispatch(real, |s| dup_in(s, fd, real))
}
