//! Carrying session state across exec.
//!
//! The new image gets a fresh interposer instance, so everything it needs is
//! passed through the environment:
//!
//! - the re-attach variables (`LD_PRELOAD`, `CFS_*`), appended when the
//!   caller's environment dropped them
//! - `CFS_FD_TABLE`: tracked descriptors that survive the exec, one
//!   `fd:flags:dev:ino:hexpath` record per descriptor, comma separated
//!
//! On import a record is kept only if its descriptor is still open on the same
//! device and inode, which filters out stale tables inherited through an exec
//! path that did not refresh them.

use crate::sync::{FdEntry, FdTable};
use cfs_config::{Config, ENV_FD_TABLE};
use libc::{c_char, c_int};
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ENV_PRELOAD: &str = "LD_PRELOAD";

/// Environment entries (`KEY=value`) a child needs to re-attach with the same
/// settings.
pub fn reattach_env(config: &Config) -> Vec<CString> {
    let mut vars = Vec::new();
    if let Some(preload) = std::env::var_os(ENV_PRELOAD) {
        let mut entry = format!("{}=", ENV_PRELOAD).into_bytes();
        entry.extend_from_slice(preload.as_bytes());
        vars.extend(CString::new(entry).ok());
    }
    vars.extend(
        config
            .to_env()
            .into_iter()
            .filter_map(|(key, value)| CString::new(format!("{}={}", key, value)).ok()),
    );
    vars
}

fn survives_exec(fd: c_int) -> bool {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    flags >= 0 && flags & libc::FD_CLOEXEC == 0
}

fn encode_entry(fd: c_int, entry: &FdEntry) -> String {
    format!(
        "{}:{}:{}:{}:{}",
        fd,
        entry.flags,
        entry.dev,
        entry.ino,
        hex::encode(entry.path.as_os_str().as_bytes())
    )
}

/// Render the descriptors that will still be open after exec.
pub fn export_fd_table(fds: &FdTable) -> Option<String> {
    let records: Vec<String> = fds
        .snapshot()
        .into_iter()
        .filter(|(fd, _)| survives_exec(*fd))
        .map(|(fd, entry)| encode_entry(fd, &entry))
        .collect();
    if records.is_empty() {
        None
    } else {
        Some(records.join(","))
    }
}

/// One parsed `CFS_FD_TABLE` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedFd {
    pub fd: c_int,
    pub flags: c_int,
    pub dev: u64,
    pub ino: u64,
    pub path: PathBuf,
}

fn parse_record(record: &str) -> Option<InheritedFd> {
    let mut fields = record.splitn(5, ':');
    let fd = fields.next()?.parse().ok()?;
    let flags = fields.next()?.parse().ok()?;
    let dev = fields.next()?.parse().ok()?;
    let ino = fields.next()?.parse().ok()?;
    let path = hex::decode(fields.next()?).ok()?;
    Some(InheritedFd {
        fd,
        flags,
        dev,
        ino,
        path: PathBuf::from(OsStr::from_bytes(&path)),
    })
}

/// Parse a table, skipping malformed records.
pub fn parse_fd_table(value: &str) -> Vec<InheritedFd> {
    value
        .split(',')
        .filter(|r| !r.is_empty())
        .filter_map(parse_record)
        .collect()
}

/// Re-establish inherited descriptors. Returns how many were kept.
pub fn import_fd_table(fds: &FdTable, value: &str) -> usize {
    let mut kept = 0;
    for record in parse_fd_table(value) {
        let claimed = FdEntry {
            path: record.path,
            flags: record.flags,
            dev: record.dev,
            ino: record.ino,
            is_dir: false,
        };
        // The number may have been closed and reused before the exec
        if !claimed.matches_fd(record.fd) {
            continue;
        }
        let Some(entry) = FdEntry::from_fd(record.fd, claimed.path, claimed.flags) else {
            continue;
        };
        fds.insert(record.fd, Arc::new(entry));
        kept += 1;
    }
    kept
}

/// A NULL-terminated `envp` for the real exec.
///
/// Entries copied from the caller are borrowed, so the value must not outlive
/// the caller's environment array.
pub struct ExecEnv {
    _owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl ExecEnv {
    pub fn as_ptr(&self) -> *const *const c_char {
        self.ptrs.as_ptr()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CStr> {
        self.ptrs
            .iter()
            .take_while(|p| !p.is_null())
            .map(|p| unsafe { CStr::from_ptr(*p) })
    }
}

fn key_of(entry: &[u8]) -> &[u8] {
    match entry.iter().position(|b| *b == b'=') {
        Some(i) => &entry[..=i],
        None => entry,
    }
}

/// Build the environment for an exec: the caller's entries, minus any stale
/// descriptor table, plus whichever re-attach variables are missing, plus the
/// fresh descriptor table.
///
/// # Safety
/// `envp` must be null or a NULL-terminated array of C strings.
pub unsafe fn build_exec_env(
    envp: *const *const c_char,
    reattach: &[CString],
    fd_table: Option<String>,
) -> ExecEnv {
    let table_key = format!("{}=", ENV_FD_TABLE);
    let mut ptrs: Vec<*const c_char> = Vec::new();
    let mut keys: Vec<&[u8]> = Vec::new();

    if !envp.is_null() {
        let mut cursor = envp;
        while !(*cursor).is_null() {
            let entry = CStr::from_ptr(*cursor).to_bytes();
            if !entry.starts_with(table_key.as_bytes()) {
                ptrs.push(*cursor);
                keys.push(key_of(entry));
            }
            cursor = cursor.add(1);
        }
    }

    let mut owned = Vec::new();
    for var in reattach {
        let key = key_of(var.to_bytes());
        if !keys.contains(&key) {
            owned.push(var.clone());
        }
    }
    if let Some(table) = fd_table {
        owned.extend(CString::new(format!("{}{}", table_key, table)).ok());
    }

    ptrs.extend(owned.iter().map(|v| v.as_ptr()));
    ptrs.push(std::ptr::null());
    ExecEnv {
        _owned: owned,
        ptrs,
    }
}

/// The process's current environment as a NULL-terminated array.
pub fn environ() -> *const *const c_char {
    extern "C" {
        static environ: *const *const c_char;
    }
    unsafe { environ }
}

/// Locate `file` the way `execvp` does, for classification only.
pub fn search_path(file: &Path) -> Option<PathBuf> {
    if file.as_os_str().as_bytes().contains(&b'/') {
        return Some(file.to_path_buf());
    }
    if file.as_os_str().is_empty() {
        return None;
    }
    let search = std::env::var_os("PATH").unwrap_or_else(|| "/bin:/usr/bin".into());
    std::env::split_paths(&search)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".").join(file)
            } else {
                dir.join(file)
            }
        })
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
