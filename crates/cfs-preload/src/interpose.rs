//! Exported C symbols.
//!
//! Variadic prototypes (`open`, `openat`, `fcntl`) are exported with their
//! full fixed arity. On x86_64 and aarch64 the extra argument lands in the
//! register the caller would have used, and is ignored by libc when unused.
//!
//! `execl`, `execle` and `execlp` are truly variadic and glibc runs them
//! without going through the symbol table, so they are replaced outright.
//! The exported symbols are jump stubs into `src/c/variadic_exec.c`, which
//! collects the argument list and comes back through the `cfs_bridge_*`
//! functions below.

use cfs_interposer::syscalls::{io, misc, open, process, stat};
use libc::{c_char, c_int, c_uint, c_void, mode_t, off64_t, off_t, pid_t, size_t, ssize_t};

// ---------------------------------------------------------------------------
// open family
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open::open_shim(path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open::open64_shim(path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    open::openat_shim(dirfd, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn openat64(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mode: mode_t,
) -> c_int {
    open::openat64_shim(dirfd, path, flags, mode)
}

#[no_mangle]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    open::creat_shim(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    open::creat64_shim(path, mode)
}

// _FORTIFY_SOURCE entry points
#[no_mangle]
pub unsafe extern "C" fn __open_2(path: *const c_char, flags: c_int) -> c_int {
    open::open_2_shim(path, flags)
}

#[no_mangle]
pub unsafe extern "C" fn __open64_2(path: *const c_char, flags: c_int) -> c_int {
    open::open64_2_shim(path, flags)
}

#[no_mangle]
pub unsafe extern "C" fn __openat_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    open::openat_2_shim(dirfd, path, flags)
}

#[no_mangle]
pub unsafe extern "C" fn __openat64_2(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    open::openat64_2_shim(dirfd, path, flags)
}

// ---------------------------------------------------------------------------
// data transfer
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    io::read_shim(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn __read_chk(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    buflen: size_t,
) -> ssize_t {
    io::read_chk_shim(fd, buf, count, buflen)
}

#[no_mangle]
pub unsafe extern "C" fn pread(fd: c_int, buf: *mut c_void, count: size_t, offset: off_t) -> ssize_t {
    io::pread_shim(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn pread64(
    fd: c_int,
    buf: *mut c_void,
    count: size_t,
    offset: off64_t,
) -> ssize_t {
    io::pread64_shim(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    io::write_shim(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn pwrite(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off_t,
) -> ssize_t {
    io::pwrite_shim(fd, buf, count, offset)
}

#[no_mangle]
pub unsafe extern "C" fn pwrite64(
    fd: c_int,
    buf: *const c_void,
    count: size_t,
    offset: off64_t,
) -> ssize_t {
    io::pwrite64_shim(fd, buf, count, offset)
}

// ---------------------------------------------------------------------------
// descriptor lifecycle
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    io::close_shim(fd)
}

#[no_mangle]
pub unsafe extern "C" fn dup(old_fd: c_int) -> c_int {
    io::dup_shim(old_fd)
}

#[no_mangle]
pub unsafe extern "C" fn dup2(old_fd: c_int, new_fd: c_int) -> c_int {
    io::dup2_shim(old_fd, new_fd)
}

#[no_mangle]
pub unsafe extern "C" fn dup3(old_fd: c_int, new_fd: c_int, flags: c_int) -> c_int {
    io::dup3_shim(old_fd, new_fd, flags)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    io::fcntl_shim(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl64(fd: c_int, cmd: c_int, arg: *mut c_void) -> c_int {
    io::fcntl64_shim(fd, cmd, arg)
}

// ---------------------------------------------------------------------------
// metadata
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn stat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    stat::stat_shim(path, buf)
}

#[no_mangle]
pub unsafe extern "C" fn stat64(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    stat::stat64_shim(path, buf)
}

#[no_mangle]
pub unsafe extern "C" fn lstat(path: *const c_char, buf: *mut libc::stat) -> c_int {
    stat::lstat_shim(path, buf)
}

#[no_mangle]
pub unsafe extern "C" fn lstat64(path: *const c_char, buf: *mut libc::stat64) -> c_int {
    stat::lstat64_shim(path, buf)
}

#[no_mangle]
pub unsafe extern "C" fn fstat(fd: c_int, buf: *mut libc::stat) -> c_int {
    stat::fstat_shim(fd, buf)
}

#[no_mangle]
pub unsafe extern "C" fn fstat64(fd: c_int, buf: *mut libc::stat64) -> c_int {
    stat::fstat64_shim(fd, buf)
}

#[no_mangle]
pub unsafe extern "C" fn fstatat(
    dirfd: c_int,
    path: *const c_char,
    buf: *mut libc::stat,
    flags: c_int,
) -> c_int {
    stat::fstatat_shim(dirfd, path, buf, flags)
}

#[no_mangle]
pub unsafe extern "C" fn fstatat64(
    dirfd: c_int,
    path: *const c_char,
    buf: *mut libc::stat64,
    flags: c_int,
) -> c_int {
    stat::fstatat64_shim(dirfd, path, buf, flags)
}

#[no_mangle]
pub unsafe extern "C" fn statx(
    dirfd: c_int,
    path: *const c_char,
    flags: c_int,
    mask: c_uint,
    buf: *mut libc::statx,
) -> c_int {
    stat::statx_shim(dirfd, path, flags, mask, buf)
}

#[no_mangle]
pub unsafe extern "C" fn access(path: *const c_char, mode: c_int) -> c_int {
    stat::access_shim(path, mode)
}

// ---------------------------------------------------------------------------
// namespace
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn rename(old: *const c_char, new: *const c_char) -> c_int {
    misc::rename_shim(old, new)
}

#[no_mangle]
pub unsafe extern "C" fn renameat(
    old_dirfd: c_int,
    old: *const c_char,
    new_dirfd: c_int,
    new: *const c_char,
) -> c_int {
    misc::renameat_shim(old_dirfd, old, new_dirfd, new)
}

#[no_mangle]
pub unsafe extern "C" fn renameat2(
    old_dirfd: c_int,
    old: *const c_char,
    new_dirfd: c_int,
    new: *const c_char,
    flags: c_uint,
) -> c_int {
    misc::renameat2_shim(old_dirfd, old, new_dirfd, new, flags)
}

#[no_mangle]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    misc::unlink_shim(path)
}

#[no_mangle]
pub unsafe extern "C" fn unlinkat(dirfd: c_int, path: *const c_char, flags: c_int) -> c_int {
    misc::unlinkat_shim(dirfd, path, flags)
}

#[no_mangle]
pub unsafe extern "C" fn rmdir(path: *const c_char) -> c_int {
    misc::rmdir_shim(path)
}

#[no_mangle]
pub unsafe extern "C" fn remove(path: *const c_char) -> c_int {
    misc::remove_shim(path)
}

#[no_mangle]
pub unsafe extern "C" fn mkdir(path: *const c_char, mode: mode_t) -> c_int {
    misc::mkdir_shim(path, mode)
}

#[no_mangle]
pub unsafe extern "C" fn mkdirat(dirfd: c_int, path: *const c_char, mode: mode_t) -> c_int {
    misc::mkdirat_shim(dirfd, path, mode)
}

// ---------------------------------------------------------------------------
// execution
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    process::execve_shim(path, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    process::execv_shim(path, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    process::execvp_shim(file, argv)
}

#[no_mangle]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    process::execvpe_shim(file, argv, envp)
}

/// Called by the C list-exec bridge with the collected argument vector.
#[no_mangle]
pub unsafe extern "C" fn cfs_bridge_execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    process::execve_shim(path, argv, envp)
}

/// Called by the C list-exec bridge for `execlp`.
#[no_mangle]
pub unsafe extern "C" fn cfs_bridge_execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    process::execvp_shim(file, argv)
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod list_exec {
    use libc::{c_char, c_int};

    extern "C" {
        fn cfs_execl(path: *const c_char, arg0: *const c_char, ...) -> c_int;
        fn cfs_execle(path: *const c_char, arg0: *const c_char, ...) -> c_int;
        fn cfs_execlp(file: *const c_char, arg0: *const c_char, ...) -> c_int;
    }

    // A plain jump keeps the caller's registers and stack untouched, which is
    // all a variadic callee needs to find the rest of the list.
    #[cfg(target_arch = "x86_64")]
    macro_rules! tail_jump {
        ($target:path) => {
            core::arch::naked_asm!("jmp {0}", sym $target)
        };
    }

    #[cfg(target_arch = "aarch64")]
    macro_rules! tail_jump {
        ($target:path) => {
            core::arch::naked_asm!("b {0}", sym $target)
        };
    }

    #[unsafe(naked)]
    #[no_mangle]
    pub unsafe extern "C" fn execl(_path: *const c_char, _arg0: *const c_char) -> c_int {
        tail_jump!(cfs_execl)
    }

    #[unsafe(naked)]
    #[no_mangle]
    pub unsafe extern "C" fn execle(_path: *const c_char, _arg0: *const c_char) -> c_int {
        tail_jump!(cfs_execle)
    }

    #[unsafe(naked)]
    #[no_mangle]
    pub unsafe extern "C" fn execlp(_file: *const c_char, _arg0: *const c_char) -> c_int {
        tail_jump!(cfs_execlp)
    }
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawn(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    process::posix_spawn_shim(pid, path, file_actions, attrp, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn posix_spawnp(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    process::posix_spawnp_shim(pid, file, file_actions, attrp, argv, envp)
}
