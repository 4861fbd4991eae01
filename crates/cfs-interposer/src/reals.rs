//! Real Symbol Storage
//!
//! Each intercepted function has one `RealSymbol` holding the address of the
//! next definition in lookup order (`dlsym(RTLD_NEXT, ..)`). Resolution is
//! lazy, lock-free and idempotent: racing threads compute the same address
//! and the first compare-and-swap publishes it.
//!
//! A symbol that cannot be resolved is fatal for the calling path. A shim
//! that silently skipped the real call would corrupt the traced program, so
//! [`RealSymbol::require`] aborts with a message instead.

use libc::{c_char, c_int, c_uint, c_void, mode_t, off64_t, off_t, pid_t, size_t, ssize_t};
use std::sync::atomic::{AtomicPtr, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no later definition of `{0}` in the link map")]
    Missing(&'static str),
}

pub struct RealSymbol {
    ptr: AtomicPtr<c_void>,
    /// NUL-terminated
    name: &'static str,
}

impl RealSymbol {
    pub const fn new(name: &'static str) -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name.trim_end_matches('\0')
    }

    pub fn resolve(&self) -> Result<*mut c_void, ResolveError> {
        let p = self.ptr.load(Ordering::Acquire);
        if !p.is_null() {
            return Ok(p);
        }
        debug_assert!(self.name.ends_with('\0'));
        let f = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr() as *const c_char) };
        if f.is_null() {
            return Err(ResolveError::Missing(self.name()));
        }
        match self
            .ptr
            .compare_exchange(std::ptr::null_mut(), f, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(f),
            Err(existing) => Ok(existing),
        }
    }

    /// Resolve or abort the process.
    pub fn require(&self) -> *mut c_void {
        match self.resolve() {
            Ok(p) => p,
            Err(e) => resolution_failed(&e),
        }
    }
}

#[cold]
fn resolution_failed(err: &ResolveError) -> ! {
    raw_eprintln!("cfs: {}; aborting", err);
    unsafe { libc::abort() }
}

pub type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
pub type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int;
pub type CreatFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
pub type Open2Fn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
pub type Openat2Fn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;

pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type PreadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, off_t) -> ssize_t;
pub type Pread64Fn = unsafe extern "C" fn(c_int, *mut c_void, size_t, off64_t) -> ssize_t;
pub type PwriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t, off_t) -> ssize_t;
pub type Pwrite64Fn = unsafe extern "C" fn(c_int, *const c_void, size_t, off64_t) -> ssize_t;
pub type ReadChkFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, size_t) -> ssize_t;

pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type DupFn = unsafe extern "C" fn(c_int) -> c_int;
pub type Dup2Fn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type Dup3Fn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
pub type FcntlFn = unsafe extern "C" fn(c_int, c_int, ...) -> c_int;

pub type StatFn = unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int;
pub type Stat64Fn = unsafe extern "C" fn(*const c_char, *mut libc::stat64) -> c_int;
pub type FstatFn = unsafe extern "C" fn(c_int, *mut libc::stat) -> c_int;
pub type Fstat64Fn = unsafe extern "C" fn(c_int, *mut libc::stat64) -> c_int;
pub type FstatatFn = unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat, c_int) -> c_int;
pub type Fstatat64Fn =
    unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat64, c_int) -> c_int;
pub type StatxFn =
    unsafe extern "C" fn(c_int, *const c_char, c_int, c_uint, *mut libc::statx) -> c_int;
pub type AccessFn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;

pub type RenameFn = unsafe extern "C" fn(*const c_char, *const c_char) -> c_int;
pub type RenameatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char) -> c_int;
pub type Renameat2Fn =
    unsafe extern "C" fn(c_int, *const c_char, c_int, *const c_char, c_uint) -> c_int;
pub type UnlinkFn = unsafe extern "C" fn(*const c_char) -> c_int;
pub type UnlinkatFn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;
pub type MkdirFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;
pub type MkdiratFn = unsafe extern "C" fn(c_int, *const c_char, mode_t) -> c_int;

pub type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
pub type ExecvFn = unsafe extern "C" fn(*const c_char, *const *const c_char) -> c_int;
pub type PosixSpawnFn = unsafe extern "C" fn(
    *mut pid_t,
    *const c_char,
    *const libc::posix_spawn_file_actions_t,
    *const libc::posix_spawnattr_t,
    *const *mut c_char,
    *const *mut c_char,
) -> c_int;

macro_rules! real_symbols {
    ($($accessor:ident: $sym:ident = $name:literal as $ty:ty;)*) => {
        $(
            pub static $sym: RealSymbol = RealSymbol::new(concat!($name, "\0"));

            #[inline]
            pub fn $accessor() -> $ty {
                unsafe { std::mem::transmute::<*mut c_void, $ty>($sym.require()) }
            }
        )*
    };
}

real_symbols! {
    open: REAL_OPEN = "open" as OpenFn;
    open64: REAL_OPEN64 = "open64" as OpenFn;
    openat: REAL_OPENAT = "openat" as OpenatFn;
    openat64: REAL_OPENAT64 = "openat64" as OpenatFn;
    creat: REAL_CREAT = "creat" as CreatFn;
    creat64: REAL_CREAT64 = "creat64" as CreatFn;
    open_2: REAL_OPEN_2 = "__open_2" as Open2Fn;
    open64_2: REAL_OPEN64_2 = "__open64_2" as Open2Fn;
    openat_2: REAL_OPENAT_2 = "__openat_2" as Openat2Fn;
    openat64_2: REAL_OPENAT64_2 = "__openat64_2" as Openat2Fn;

    read: REAL_READ = "read" as ReadFn;
    write: REAL_WRITE = "write" as WriteFn;
    pread: REAL_PREAD = "pread" as PreadFn;
    pread64: REAL_PREAD64 = "pread64" as Pread64Fn;
    pwrite: REAL_PWRITE = "pwrite" as PwriteFn;
    pwrite64: REAL_PWRITE64 = "pwrite64" as Pwrite64Fn;
    read_chk: REAL_READ_CHK = "__read_chk" as ReadChkFn;

    close: REAL_CLOSE = "close" as CloseFn;
    dup: REAL_DUP = "dup" as DupFn;
    dup2: REAL_DUP2 = "dup2" as Dup2Fn;
    dup3: REAL_DUP3 = "dup3" as Dup3Fn;
    fcntl: REAL_FCNTL = "fcntl" as FcntlFn;
    fcntl64: REAL_FCNTL64 = "fcntl64" as FcntlFn;

    stat: REAL_STAT = "stat" as StatFn;
    stat64: REAL_STAT64 = "stat64" as Stat64Fn;
    lstat: REAL_LSTAT = "lstat" as StatFn;
    lstat64: REAL_LSTAT64 = "lstat64" as Stat64Fn;
    fstat: REAL_FSTAT = "fstat" as FstatFn;
    fstat64: REAL_FSTAT64 = "fstat64" as Fstat64Fn;
    fstatat: REAL_FSTATAT = "fstatat" as FstatatFn;
    fstatat64: REAL_FSTATAT64 = "fstatat64" as Fstatat64Fn;
    statx: REAL_STATX = "statx" as StatxFn;
    access: REAL_ACCESS = "access" as AccessFn;

    rename: REAL_RENAME = "rename" as RenameFn;
    renameat: REAL_RENAMEAT = "renameat" as RenameatFn;
    renameat2: REAL_RENAMEAT2 = "renameat2" as Renameat2Fn;
    unlink: REAL_UNLINK = "unlink" as UnlinkFn;
    unlinkat: REAL_UNLINKAT = "unlinkat" as UnlinkatFn;
    rmdir: REAL_RMDIR = "rmdir" as UnlinkFn;
    remove: REAL_REMOVE = "remove" as UnlinkFn;
    mkdir: REAL_MKDIR = "mkdir" as MkdirFn;
    mkdirat: REAL_MKDIRAT = "mkdirat" as MkdiratFn;

    execve: REAL_EXECVE = "execve" as ExecveFn;
    execv: REAL_EXECV = "execv" as ExecvFn;
    execvp: REAL_EXECVP = "execvp" as ExecvFn;
    execvpe: REAL_EXECVPE = "execvpe" as ExecveFn;
    posix_spawn: REAL_POSIX_SPAWN = "posix_spawn" as PosixSpawnFn;
    posix_spawnp: REAL_POSIX_SPAWNP = "posix_spawnp" as PosixSpawnFn;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_idempotent() {
        let a = REAL_CLOSE.resolve().unwrap();
        let b = REAL_CLOSE.resolve().unwrap();
        assert!(!a.is_null());
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_symbol_reports_name() {
        static BOGUS: RealSymbol = RealSymbol::new("cfs_no_such_function_anywhere\0");
        assert_eq!(
            BOGUS.resolve(),
            Err(ResolveError::Missing("cfs_no_such_function_anywhere"))
        );
        assert_eq!(BOGUS.name(), "cfs_no_such_function_anywhere");
    }

    #[test]
    fn test_concurrent_first_use_publishes_once() {
        static SYM: RealSymbol = RealSymbol::new("getpid\0");
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| SYM.resolve().unwrap() as usize))
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_typed_accessor_calls_real_function() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let msg = b"ping";
        let n = unsafe { write()(fds[1], msg.as_ptr().cast(), msg.len()) };
        assert_eq!(n, 4);
        let mut buf = [0u8; 4];
        let n = unsafe { read()(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 4);
        assert_eq!(&buf, msg);
        unsafe {
            close()(fds[0]);
            close()(fds[1]);
        }
    }
}
