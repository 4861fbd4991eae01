//! regress_glibc: glibc calls on paths outside the build tree must keep their
//! normal behavior.
//!
//! Every case calls libc the way a build tool would (through whatever symbol
//! binding is in effect, so the interposer when preloaded) and checks the
//! result against the expected POSIX behavior. Where the kernel can answer the
//! same question directly, the raw system call is used as the oracle.

use crate::runner::{Checks, Suite};
use anyhow::{Context, Result};
use libc::{c_char, c_int, c_long};
use nix::errno::Errno;
use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tempfile::TempDir;

pub const SUITE: &str = "regress_glibc";

pub fn suite() -> Suite<()> {
    Suite::new(SUITE)
        .case("open_nonexistent_file", open_nonexistent_file)
        .case("open_create_and_reopen", open_create_and_reopen)
        .case("fopen_fclose", fopen_fclose)
        .case("read_write_offsets", read_write_offsets)
        .case("descriptor_errors", descriptor_errors)
        .case("stat_family", stat_family)
        .case("dup_family", dup_family)
        .case("namespace_changes", namespace_changes)
        .case("errno_untouched_on_success", errno_untouched_on_success)
        .case("exec_failure_returns", exec_failure_returns)
}

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).context("path contains NUL")
}

fn scratch() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("regress-glibc")
        .tempdir_in("/tmp")
        .context("create scratch directory under /tmp")
}

/// Run `f` with errno cleared; return its result and the errno it left.
fn observe<R>(f: impl FnOnce() -> R) -> (R, c_int) {
    Errno::clear();
    let r = f();
    (r, Errno::last() as c_int)
}

fn raw_openat(path: &CStr, flags: c_int) -> (c_long, c_int) {
    observe(|| unsafe { libc::syscall(libc::SYS_openat, libc::AT_FDCWD, path.as_ptr(), flags, 0o644) })
}

fn raw_stat(path: &CStr, flags: c_int) -> (c_long, c_int, libc::stat) {
    let mut st = MaybeUninit::<libc::stat>::zeroed();
    let (rc, err) = observe(|| unsafe {
        libc::syscall(libc::SYS_newfstatat, libc::AT_FDCWD, path.as_ptr(), st.as_mut_ptr(), flags)
    });
    (rc, err, unsafe { st.assume_init() })
}

fn same_file(a: &libc::stat, b: &libc::stat) -> bool {
    (a.st_dev, a.st_ino, a.st_mode, a.st_size, a.st_nlink)
        == (b.st_dev, b.st_ino, b.st_mode, b.st_size, b.st_nlink)
}

fn open_nonexistent_file(c: &mut Checks, _: &()) -> Result<()> {
    let path = Path::new("/tmp/non-existent-file");
    anyhow::ensure!(!path.exists(), "{} exists; remove it first", path.display());
    let p = cpath(path)?;

    let (fd, err) = observe(|| unsafe { libc::open(p.as_ptr(), libc::O_RDONLY) });
    c.check_eq(fd, -1, "open() of a missing file");
    c.check_eq(err, libc::ENOENT, "open() errno");
    let (raw, raw_err) = raw_openat(&p, libc::O_RDONLY);
    c.check_eq((fd as c_long, err), (raw, raw_err), "open() against openat(2)");
    Ok(())
}

fn open_create_and_reopen(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let p = cpath(&dir.path().join("created"))?;
    let excl = libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY;

    let (fd, _) = observe(|| unsafe { libc::open(p.as_ptr(), excl, 0o640 as libc::c_uint) });
    c.check(fd >= 0, "O_CREAT|O_EXCL on a new name succeeds");
    let (n, _) = observe(|| unsafe { libc::write(fd, b"hello".as_ptr().cast(), 5) });
    c.check_eq(n, 5, "write() count");
    c.check_eq(unsafe { libc::close(fd) }, 0, "close()");

    let (again, err) = observe(|| unsafe { libc::open(p.as_ptr(), excl, 0o640 as libc::c_uint) });
    c.check_eq((again, err), (-1, libc::EEXIST), "O_EXCL on an existing name");
    let (raw, raw_err) = raw_openat(&p, excl);
    c.check_eq((again as c_long, err), (raw, raw_err), "O_EXCL against openat(2)");

    let (st_rc, _, st) = raw_stat(&p, 0);
    c.check_eq(st_rc, 0, "created file exists");
    c.check_eq(st.st_mode & 0o777 & !0o640, 0, "creation mode within the requested bits");

    let fd = unsafe { libc::openat(libc::AT_FDCWD, p.as_ptr(), libc::O_RDONLY) };
    let mut buf = [0u8; 16];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    c.check_eq(&buf[..n.max(0) as usize], &b"hello"[..], "read back");
    unsafe { libc::close(fd) };
    Ok(())
}

fn fopen_fclose(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let p = cpath(&dir.path().join("stream.txt"))?;
    let missing = cpath(&dir.path().join("missing.txt"))?;

    let fp = unsafe { libc::fopen(p.as_ptr(), c"w".as_ptr()) };
    c.check(!fp.is_null(), "fopen(\"w\")");
    if fp.is_null() {
        return Ok(());
    }
    c.check(unsafe { libc::fputs(c"line one\n".as_ptr(), fp) } >= 0, "fputs()");
    c.check_eq(unsafe { libc::fclose(fp) }, 0, "fclose()");
    c.check_eq(
        std::fs::read(dir.path().join("stream.txt"))?,
        b"line one\n".to_vec(),
        "stream contents after fclose",
    );

    let (fp, err) = observe(|| unsafe { libc::fopen(missing.as_ptr(), c"r".as_ptr()) });
    c.check(fp.is_null(), "fopen(\"r\") of a missing file");
    c.check_eq(err, libc::ENOENT, "fopen() errno");
    Ok(())
}

fn read_write_offsets(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let p = cpath(&dir.path().join("data"))?;
    let fd = unsafe { libc::open(p.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644 as libc::c_uint) };
    anyhow::ensure!(fd >= 0, "open scratch file");

    c.check_eq(unsafe { libc::write(fd, b"abcdef".as_ptr().cast(), 6) }, 6, "write()");
    c.check_eq(unsafe { libc::pwrite(fd, b"XY".as_ptr().cast(), 2, 1) }, 2, "pwrite()");
    c.check_eq(unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) }, 6, "pwrite() keeps offset");

    let mut buf = [0u8; 4];
    c.check_eq(unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), 4, 0) }, 4, "pread()");
    c.check_eq(&buf, b"aXYd", "pread() data");
    c.check_eq(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 4) }, 0, "read() at EOF");
    c.check_eq(unsafe { libc::pread64(fd, buf.as_mut_ptr().cast(), 2, 4) }, 2, "pread64()");
    c.check_eq(&buf[..2], &b"ef"[..], "pread64() data");
    c.check_eq(unsafe { libc::close(fd) }, 0, "close()");
    Ok(())
}

fn descriptor_errors(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let path = dir.path().join("ro");
    std::fs::write(&path, b"x")?;
    let p = cpath(&path)?;
    let mut buf = [0u8; 1];

    let ro = unsafe { libc::open(p.as_ptr(), libc::O_RDONLY) };
    // A high number no other code in this process is likely to be handed
    let fd = unsafe { libc::fcntl(ro, libc::F_DUPFD, 900) };
    unsafe { libc::close(ro) };
    anyhow::ensure!(fd >= 900, "duplicate scratch descriptor");
    let (n, err) = observe(|| unsafe { libc::write(fd, b"y".as_ptr().cast(), 1) });
    c.check_eq((n, err), (-1, libc::EBADF), "write() on a read-only descriptor");
    unsafe { libc::close(fd) };

    let (n, err) = observe(|| unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 1) });
    c.check_eq((n, err), (-1, libc::EBADF), "read() after close()");
    let (rc, err) = observe(|| unsafe { libc::close(fd) });
    c.check_eq((rc, err), (-1, libc::EBADF), "double close()");
    let (rc, err) = observe(|| unsafe { libc::fstat(-1, MaybeUninit::zeroed().as_mut_ptr()) });
    c.check_eq((rc, err), (-1, libc::EBADF), "fstat(-1)");
    Ok(())
}

fn stat_family(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let file = dir.path().join("file");
    let link = dir.path().join("link");
    std::fs::write(&file, b"content")?;
    std::os::unix::fs::symlink(&file, &link)?;
    let (pf, pl) = (cpath(&file)?, cpath(&link)?);
    let missing = cpath(&dir.path().join("missing"))?;
    let through_file = cpath(&file.join("child"))?;

    let mut st = MaybeUninit::<libc::stat>::zeroed();
    let (_, _, oracle) = raw_stat(&pf, 0);
    c.check_eq(unsafe { libc::stat(pf.as_ptr(), st.as_mut_ptr()) }, 0, "stat()");
    c.check(same_file(unsafe { st.assume_init_ref() }, &oracle), "stat() fields");
    c.check_eq(unsafe { libc::stat(pl.as_ptr(), st.as_mut_ptr()) }, 0, "stat() through link");
    c.check(same_file(unsafe { st.assume_init_ref() }, &oracle), "stat() follows the link");

    let (_, _, link_oracle) = raw_stat(&pl, libc::AT_SYMLINK_NOFOLLOW);
    c.check_eq(unsafe { libc::lstat(pl.as_ptr(), st.as_mut_ptr()) }, 0, "lstat()");
    c.check(same_file(unsafe { st.assume_init_ref() }, &link_oracle), "lstat() describes the link");
    c.check_eq(
        unsafe { libc::fstatat(libc::AT_FDCWD, pl.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW) },
        0,
        "fstatat(AT_SYMLINK_NOFOLLOW)",
    );
    c.check(same_file(unsafe { st.assume_init_ref() }, &link_oracle), "fstatat() fields");

    let fd = unsafe { libc::open(pf.as_ptr(), libc::O_RDONLY) };
    c.check_eq(unsafe { libc::fstat(fd, st.as_mut_ptr()) }, 0, "fstat()");
    c.check(same_file(unsafe { st.assume_init_ref() }, &oracle), "fstat() fields");
    let mut stx = MaybeUninit::<libc::statx>::zeroed();
    let empty = c"";
    c.check_eq(
        unsafe { libc::statx(fd, empty.as_ptr(), libc::AT_EMPTY_PATH, libc::STATX_BASIC_STATS, stx.as_mut_ptr()) },
        0,
        "statx(AT_EMPTY_PATH)",
    );
    c.check_eq(unsafe { stx.assume_init_ref() }.stx_ino, oracle.st_ino, "statx() inode");
    unsafe { libc::close(fd) };

    for (name, p, want) in [("missing", &missing, libc::ENOENT), ("through a file", &through_file, libc::ENOTDIR)] {
        let (rc, err) = observe(|| unsafe { libc::stat(p.as_ptr(), st.as_mut_ptr()) });
        let (raw, raw_err, _) = raw_stat(p, 0);
        c.check_eq((rc, err), (-1, want), format!("stat() {}", name));
        c.check_eq((rc as c_long, err), (raw, raw_err), format!("stat() {} against newfstatat(2)", name));
        let (rc, err) = observe(|| unsafe { libc::access(p.as_ptr(), libc::F_OK) });
        c.check_eq((rc, err), (-1, want), format!("access() {}", name));
    }
    c.check_eq(unsafe { libc::access(pf.as_ptr(), libc::R_OK) }, 0, "access(R_OK)");
    Ok(())
}

fn dup_family(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let p = cpath(&dir.path().join("shared"))?;
    let fd = unsafe { libc::open(p.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o644 as libc::c_uint) };
    anyhow::ensure!(fd >= 0, "open scratch file");

    let d1 = unsafe { libc::dup(fd) };
    c.check(d1 >= 0 && d1 != fd, "dup()");
    let d2 = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 64) };
    c.check(d2 >= 64, "fcntl(F_DUPFD_CLOEXEC) honors the floor");
    c.check_eq(unsafe { libc::fcntl(d2, libc::F_GETFD) }, libc::FD_CLOEXEC, "F_DUPFD_CLOEXEC sets the flag");
    c.check_eq(unsafe { libc::dup2(fd, fd) }, fd, "dup2() onto itself");
    let (rc, err) = observe(|| unsafe { libc::dup3(fd, fd, libc::O_CLOEXEC) });
    c.check_eq((rc, err), (-1, libc::EINVAL), "dup3() onto itself");
    let (rc, err) = observe(|| unsafe { libc::dup(-1) });
    c.check_eq((rc, err), (-1, libc::EBADF), "dup(-1)");

    // Writes through any duplicate share one offset
    unsafe {
        libc::write(fd, b"ab".as_ptr().cast(), 2);
        libc::write(d1, b"cd".as_ptr().cast(), 2);
        libc::write(d2, b"ef".as_ptr().cast(), 2);
    }
    for n in [fd, d1, d2] {
        unsafe { libc::close(n) };
    }
    c.check_eq(std::fs::read(dir.path().join("shared"))?, b"abcdef".to_vec(), "shared offset");
    Ok(())
}

fn namespace_changes(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let d = dir.path();
    let sub = cpath(&d.join("sub"))?;
    let a = cpath(&d.join("a"))?;
    let b = cpath(&d.join("b"))?;
    let inner = cpath(&d.join("sub/inner"))?;
    let missing = cpath(&d.join("missing"))?;

    c.check_eq(unsafe { libc::mkdir(sub.as_ptr(), 0o755) }, 0, "mkdir()");
    let (rc, err) = observe(|| unsafe { libc::mkdir(sub.as_ptr(), 0o755) });
    c.check_eq((rc, err), (-1, libc::EEXIST), "mkdir() existing");
    c.check_eq(unsafe { libc::mkdirat(libc::AT_FDCWD, inner.as_ptr(), 0o755) }, 0, "mkdirat()");

    std::fs::write(d.join("a"), b"1")?;
    c.check_eq(unsafe { libc::rename(a.as_ptr(), b.as_ptr()) }, 0, "rename()");
    c.check(!d.join("a").exists() && d.join("b").exists(), "rename() moved the entry");
    let (rc, err) = observe(|| unsafe { libc::rename(missing.as_ptr(), a.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "rename() missing source");
    c.check_eq(
        unsafe { libc::renameat(libc::AT_FDCWD, b.as_ptr(), libc::AT_FDCWD, a.as_ptr()) },
        0,
        "renameat()",
    );

    let (rc, err) = observe(|| unsafe { libc::rmdir(sub.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::ENOTEMPTY), "rmdir() non-empty");
    let (rc, err) = observe(|| unsafe { libc::unlink(sub.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::EISDIR), "unlink() on a directory");
    c.check_eq(
        unsafe { libc::unlinkat(libc::AT_FDCWD, inner.as_ptr(), libc::AT_REMOVEDIR) },
        0,
        "unlinkat(AT_REMOVEDIR)",
    );
    c.check_eq(unsafe { libc::remove(sub.as_ptr()) }, 0, "remove() on a directory");
    c.check_eq(unsafe { libc::remove(a.as_ptr()) }, 0, "remove() on a file");
    let (rc, err) = observe(|| unsafe { libc::unlink(a.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "unlink() missing");
    Ok(())
}

fn errno_untouched_on_success(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let p = cpath(&dir.path().join("quiet"))?;
    let set = |value: c_int| unsafe { *libc::__errno_location() = value };

    set(libc::EAGAIN);
    let fd = unsafe { libc::open(p.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o644 as libc::c_uint) };
    c.check_eq(Errno::last() as c_int, libc::EAGAIN, "errno after successful open()");
    set(libc::EINTR);
    unsafe { libc::write(fd, b"z".as_ptr().cast(), 1) };
    c.check_eq(Errno::last() as c_int, libc::EINTR, "errno after successful write()");
    set(libc::ENOSPC);
    unsafe { libc::close(fd) };
    c.check_eq(Errno::last() as c_int, libc::ENOSPC, "errno after successful close()");
    Ok(())
}

fn exec_failure_returns(c: &mut Checks, _: &()) -> Result<()> {
    let dir = scratch()?;
    let tool = cpath(&dir.path().join("no-such-tool"))?;
    let argv: [*const c_char; 2] = [tool.as_ptr(), std::ptr::null()];

    let (rc, err) = observe(|| unsafe { libc::execv(tool.as_ptr(), argv.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "execv() of a missing program");

    let null = std::ptr::null::<c_char>();
    let (rc, err) = observe(|| unsafe { libc::execl(tool.as_ptr(), tool.as_ptr(), null) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "execl() of a missing program");

    let envp: [*const c_char; 1] = [null];
    let (rc, err) = observe(|| unsafe { libc::execle(tool.as_ptr(), tool.as_ptr(), null, envp.as_ptr()) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "execle() of a missing program");

    let bare = CString::new("cfs-regress-no-such-tool")?;
    let (rc, err) = observe(|| unsafe { libc::execlp(bare.as_ptr(), bare.as_ptr(), null) });
    c.check_eq((rc, err), (-1, libc::ENOENT), "execlp() of a program not on PATH");

    let spawn_argv: [*mut c_char; 2] = [tool.as_ptr() as *mut c_char, std::ptr::null_mut()];
    let mut pid: libc::pid_t = 0;
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            tool.as_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            spawn_argv.as_ptr(),
            std::ptr::null(),
        )
    };
    c.check_eq(rc, libc::ENOENT, "posix_spawn() of a missing program");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Summary;

    #[test]
    fn test_suite_passes_against_plain_libc() {
        let mut summary = Summary::default();
        suite().run(&(), None, &mut summary);
        assert!(summary.passed(), "{:#?}", summary.failures);
        assert_eq!(summary.tests_run, 10);
        assert!(summary.asserts_run > 50);
    }
}
