//! Child-side bodies of the trace cases.
//!
//! Each scenario runs in a process of its own, started by the trace suite with
//! the interposer preloaded and `CFS_ROOT` pointing at a fresh tree. A
//! scenario checks the results of its own calls and fails with an error if
//! tracking changed any of them; the parent checks what was recorded.

use anyhow::{bail, Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

pub const END_TO_END: &str = "end-to-end";
pub const DUP: &str = "dup";
pub const EXEC_INHERIT: &str = "exec-inherit";
pub const EXEC_INHERIT_LIST: &str = "exec-inherit-list";
pub const EXEC_INHERIT_CHILD: &str = "exec-inherit-child";
pub const OUT_OF_TREE: &str = "out-of-tree";

pub const DUP_PAYLOAD: &[u8] = b"via dup";
pub const EXEC_PAYLOAD: &[u8] = b"after exec";

pub fn run(name: &str, tree: &Path, args: &[String]) -> Result<()> {
    match name {
        END_TO_END => end_to_end(tree),
        DUP => dup(tree),
        EXEC_INHERIT => exec_inherit(tree, ExecStyle::Vector),
        EXEC_INHERIT_LIST => exec_inherit(tree, ExecStyle::List),
        EXEC_INHERIT_CHILD => {
            let fd = args
                .first()
                .context("missing descriptor argument")?
                .parse()
                .context("descriptor argument")?;
            exec_inherit_child(fd)
        }
        OUT_OF_TREE => out_of_tree(),
        other => bail!("unknown scenario `{}`", other),
    }
}

/// A readable file outside any build tree.
fn host_file() -> &'static Path {
    ["/etc/hostname", "/etc/passwd"]
        .into_iter()
        .map(Path::new)
        .find(|p| p.exists())
        .unwrap_or(Path::new("/proc/self/stat"))
}

/// Read a file through raw system calls, bypassing libc and the interposer.
fn read_raw(path: &Path) -> Result<Vec<u8>> {
    let c = CString::new(path.as_os_str().as_bytes())?;
    let fd = unsafe {
        libc::syscall(libc::SYS_openat, libc::AT_FDCWD, c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC)
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("raw open");
    }
    let fd = fd as libc::c_int;
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = unsafe { libc::syscall(libc::SYS_read, fd, buf.as_mut_ptr(), buf.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..n as usize]);
    }
    unsafe { libc::syscall(libc::SYS_close, fd) };
    Ok(out)
}

/// True if `path` exists, checked through a raw system call so the check
/// itself is never recorded.
fn exists_raw(path: &Path) -> Result<bool> {
    let c = CString::new(path.as_os_str().as_bytes())?;
    let rc = unsafe { libc::syscall(libc::SYS_faccessat, libc::AT_FDCWD, c.as_ptr(), libc::F_OK, 0) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOENT) => Ok(false),
        _ => Err(err).context("raw access"),
    }
}

/// Create out.o, read a host file, rename out.o to final.o.
///
/// Verification of in-tree results goes through raw system calls: the parent
/// expects exactly the accesses under test.
fn end_to_end(tree: &Path) -> Result<()> {
    let out = tree.join("out.o");
    let fin = tree.join("final.o");
    drop(File::create(&out).context("create out.o")?);

    let host = host_file();
    let seen = std::fs::read(host).with_context(|| format!("read {}", host.display()))?;
    if seen != read_raw(host)? {
        bail!("{} read differently through libc", host.display());
    }

    std::fs::rename(&out, &fin).context("rename out.o")?;
    if exists_raw(&out)? || !exists_raw(&fin)? {
        bail!("rename did not move out.o");
    }
    Ok(())
}

fn dup(tree: &Path) -> Result<()> {
    let path = tree.join("log.txt");
    let fd = open(&path, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY, Mode::from_bits_truncate(0o644))
        .context("open log.txt")?;
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        bail!("dup: {}", std::io::Error::last_os_error());
    }
    let n = unsafe { libc::write(copy, DUP_PAYLOAD.as_ptr().cast(), DUP_PAYLOAD.len()) };
    unsafe {
        libc::close(copy);
        libc::close(fd);
    }
    if n != DUP_PAYLOAD.len() as isize {
        bail!("short write through the duplicate: {}", n);
    }
    if read_raw(&path)? != DUP_PAYLOAD {
        bail!("log.txt contents differ");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ExecStyle {
    /// `execv` with an argument vector.
    Vector,
    /// `execl` with a NULL-terminated argument list.
    List,
}

/// Open a descriptor that survives exec, then exec this program again to
/// write through it.
fn exec_inherit(tree: &Path, style: ExecStyle) -> Result<()> {
    let path = tree.join("inherit.log");
    let fd = open(&path, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_WRONLY, Mode::from_bits_truncate(0o644))
        .context("open inherit.log")?;

    let exe = std::env::current_exe().context("locate own executable")?;
    let exe_c = CString::new(exe.as_os_str().as_bytes())?;
    let tree_c = CString::new(tree.as_os_str().as_bytes())?;
    let argv = [
        exe_c.clone(),
        CString::new("scenario")?,
        CString::new(EXEC_INHERIT_CHILD)?,
        tree_c,
        CString::new(fd.to_string())?,
    ];
    let err = match style {
        ExecStyle::Vector => match nix::unistd::execv(&exe_c, &argv) {
            Ok(never) => match never {},
            Err(e) => std::io::Error::from(e),
        },
        ExecStyle::List => {
            unsafe {
                libc::execl(
                    exe_c.as_ptr(),
                    argv[0].as_ptr(),
                    argv[1].as_ptr(),
                    argv[2].as_ptr(),
                    argv[3].as_ptr(),
                    argv[4].as_ptr(),
                    std::ptr::null::<libc::c_char>(),
                )
            };
            std::io::Error::last_os_error()
        }
    };
    bail!("{:?} exec of {}: {}", style, exe.display(), err)
}

fn exec_inherit_child(fd: libc::c_int) -> Result<()> {
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(EXEC_PAYLOAD).context("write through inherited descriptor")?;
    Ok(())
}

/// Only out-of-tree work: nothing may be recorded.
fn out_of_tree() -> Result<()> {
    let dir = tempfile::Builder::new().prefix("cfs-untracked").tempdir_in("/tmp")?;
    let a: PathBuf = dir.path().join("a");
    std::fs::write(&a, b"untracked")?;
    std::fs::rename(&a, dir.path().join("b"))?;
    if std::fs::read(dir.path().join("b"))? != b"untracked" {
        bail!("out-of-tree round trip changed the data");
    }
    std::fs::remove_file(dir.path().join("b"))?;
    Ok(())
}
