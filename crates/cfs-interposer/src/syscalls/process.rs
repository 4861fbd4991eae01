//! Program execution: the `exec` family and `posix_spawn`.
//!
//! Before an exec the queue is flushed, because a successful exec never
//! returns and the image holding the queue is gone. The child environment is
//! rebuilt so the new image re-attaches and inherits the descriptor table (see
//! [`crate::state::exec`]). In a `vfork` child the flush is skipped: that
//! child shares the parent's memory, and the parent's worker delivers
//! whatever it queued.

use super::{classify, dispatch, status};
use crate::errno;
use crate::path::{c_path, Base, Follow};
use crate::reals;
use crate::state::exec::{self, ExecEnv};
use crate::state::Session;
use cfs_config::log_interposer_debug;
use cfs_ipc::{OpKind, Outcome};
use libc::{c_char, c_int, pid_t};
use std::path::PathBuf;

unsafe fn classify_program(s: &Session, file: *const c_char, search: bool) -> Option<PathBuf> {
    if !search {
        return classify(s, Base::Cwd, file, Follow::Target);
    }
    let found = exec::search_path(c_path(file)?)?;
    s.tree
        .classify(Base::Cwd, &found, Follow::Target, &s.fds)
        .into_tracked()
}

/// Record the attempt, flush, and build the environment for the new image.
pub unsafe fn prepare_exec(s: &Session, program: Option<PathBuf>, envp: *const *const c_char) -> ExecEnv {
    if let Some(program) = program {
        s.record(OpKind::Execute, program, None, Outcome::Attempted, None);
    }
    if !s.is_vfork_child() && !s.flush() {
        log_interposer_debug!("Events still queued at exec", pending = s.recorder.pending());
    }
    exec::build_exec_env(envp, s.exec_env(), exec::export_fd_table(&s.fds))
}

/// Tracked exec. `real` receives the rebuilt environment and only returns on
/// failure.
pub unsafe fn exec_in(
    s: &Session,
    file: *const c_char,
    envp: *const *const c_char,
    search: bool,
    real: impl FnOnce(*const *const c_char) -> c_int,
) -> c_int {
    let saved = errno::get();
    let program = classify_program(s, file, search);
    let env = prepare_exec(s, program.clone(), envp);

    errno::set(saved);
    let rc = real(env.as_ptr());
    let err = errno::get();
    if let Some(program) = program {
        s.record(OpKind::Execute, program, None, Outcome::Failure { errno: err }, None);
    }
    errno::set(err);
    rc
}

pub unsafe fn execve_shim(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    dispatch(
        || reals::execve()(path, argv, envp),
        |s| exec_in(s, path, envp, false, |env| reals::execve()(path, argv, env)),
    )
}

/// `execv` inherits `environ`, so it becomes an `execve` with the rebuilt copy.
pub unsafe fn execv_shim(path: *const c_char, argv: *const *const c_char) -> c_int {
    dispatch(
        || reals::execv()(path, argv),
        |s| exec_in(s, path, exec::environ(), false, |env| reals::execve()(path, argv, env)),
    )
}

pub unsafe fn execvp_shim(file: *const c_char, argv: *const *const c_char) -> c_int {
    dispatch(
        || reals::execvp()(file, argv),
        |s| exec_in(s, file, exec::environ(), true, |env| reals::execvpe()(file, argv, env)),
    )
}

pub unsafe fn execvpe_shim(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    dispatch(
        || reals::execvpe()(file, argv, envp),
        |s| exec_in(s, file, envp, true, |env| reals::execvpe()(file, argv, env)),
    )
}

/// Tracked spawn. The caller keeps running, so there is nothing to flush and
/// the result is known: `posix_spawn` returns an error number rather than
/// setting errno.
pub unsafe fn spawn_in(
    s: &Session,
    file: *const c_char,
    envp: *const *mut c_char,
    search: bool,
    real: impl FnOnce(*const *mut c_char) -> c_int,
) -> c_int {
    let saved = errno::get();
    let program = classify_program(s, file, search);
    let env = exec::build_exec_env(envp.cast(), s.exec_env(), exec::export_fd_table(&s.fds));

    errno::set(saved);
    let rc = real(env.as_ptr().cast());
    let err = errno::get();
    if let Some(program) = program {
        s.record(OpKind::Execute, program, None, status(rc != 0, rc), None);
    }
    errno::set(err);
    rc
}

pub unsafe fn posix_spawn_shim(
    pid: *mut pid_t,
    path: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    dispatch(
        || reals::posix_spawn()(pid, path, file_actions, attrp, argv, envp),
        |s| {
            spawn_in(s, path, envp, false, |env| {
                reals::posix_spawn()(pid, path, file_actions, attrp, argv, env)
            })
        },
    )
}

pub unsafe fn posix_spawnp_shim(
    pid: *mut pid_t,
    file: *const c_char,
    file_actions: *const libc::posix_spawn_file_actions_t,
    attrp: *const libc::posix_spawnattr_t,
    argv: *const *mut c_char,
    envp: *const *mut c_char,
) -> c_int {
    dispatch(
        || reals::posix_spawnp()(pid, file, file_actions, attrp, argv, envp),
        |s| {
            spawn_in(s, file, envp, true, |env| {
                reals::posix_spawnp()(pid, file, file_actions, attrp, argv, env)
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::TestSession;
    use crate::syscalls::testing::*;
    use std::ffi::CString;
    use std::os::unix::fs::PermissionsExt;

    fn script(path: &std::path::Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_failed_exec_returns_with_both_events() {
        let t = TestSession::new();
        let tool = t.tree.root.join("no-such-tool");
        let c = cpath(&tool);
        let argv = [c.as_ptr(), std::ptr::null()];
        set_errno(0);
        let rc = unsafe {
            exec_in(&t.session, c.as_ptr(), exec::environ(), false, |env| {
                reals::execve()(c.as_ptr(), argv.as_ptr(), env)
            })
        };
        assert_eq!((rc, errno()), (-1, libc::ENOENT));

        let events = t.raw_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, OpKind::Execute);
        assert_eq!(events[0].outcome, Outcome::Attempted);
        assert_eq!(events[1].outcome, Outcome::Failure { errno: libc::ENOENT });
        assert_eq!(events[1].path, tool);
    }

    #[test]
    fn test_prepare_exec_flushes_and_exports_inheritable_fds() {
        let t = TestSession::new();
        let s = &t.session;
        let path = t.tree.root.join("kept.log");
        let c = cpath(&path);
        let fd = unsafe {
            crate::syscalls::open::open_in(s, Base::Cwd, c.as_ptr(), libc::O_CREAT | libc::O_WRONLY, || {
                reals::open()(c.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o644 as libc::c_uint)
            })
        };

        let env = unsafe { prepare_exec(s, Some(t.tree.root.join("cc")), exec::environ()) };
        // Flushed before the exec, without an explicit flush here
        assert_eq!(s.recorder.pending(), 0);
        assert_eq!(t.sink.events().len(), 2);

        let entries: Vec<String> = env.entries().map(|e| e.to_string_lossy().into_owned()).collect();
        let table = entries
            .iter()
            .find_map(|e| e.strip_prefix("CFS_FD_TABLE="))
            .unwrap();
        let inherited = exec::parse_fd_table(table);
        assert_eq!(inherited.len(), 1);
        assert_eq!((inherited[0].fd, &inherited[0].path), (fd, &path));
        assert!(entries.iter().any(|e| e.starts_with("CFS_ROOT=")));
        unsafe { reals::close()(fd) };
    }

    #[test]
    fn test_spawn_in_tree_program_sees_reattach_env() {
        let t = TestSession::new();
        let tool = t.tree.root.join("tool.sh");
        let out = t.tree.outside.join("child-env");
        script(&tool, "env > \"$1\"");
        let (ctool, cout) = (cpath(&tool), cpath(&out));
        let argv: [*mut c_char; 3] = [ctool.as_ptr() as *mut _, cout.as_ptr() as *mut _, std::ptr::null_mut()];

        let mut pid: pid_t = 0;
        let rc = unsafe {
            spawn_in(&t.session, ctool.as_ptr(), exec::environ().cast(), false, |env| {
                reals::posix_spawn()(&mut pid, ctool.as_ptr(), std::ptr::null(), std::ptr::null(), argv.as_ptr(), env)
            })
        };
        assert_eq!(rc, 0);
        let mut wstatus = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut wstatus, 0) }, pid);
        assert!(libc::WIFEXITED(wstatus) && libc::WEXITSTATUS(wstatus) == 0);

        let child_env = std::fs::read_to_string(&out).unwrap();
        assert!(child_env.contains(&format!("CFS_ROOT={}", t.tree.root.display())));
        let events = t.raw_events();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].kind, events[0].outcome), (OpKind::Execute, Outcome::Success));
        assert_eq!(events[0].path, tool);
    }

    #[test]
    fn test_spawn_failure_is_error_number() {
        let t = TestSession::new();
        let tool = cpath(t.tree.root.join("missing.sh"));
        let argv: [*mut c_char; 2] = [tool.as_ptr() as *mut _, std::ptr::null_mut()];
        let mut pid: pid_t = 0;
        set_errno(libc::EINTR);
        let rc = unsafe {
            spawn_in(&t.session, tool.as_ptr(), exec::environ().cast(), false, |env| {
                reals::posix_spawn()(&mut pid, tool.as_ptr(), std::ptr::null(), std::ptr::null(), argv.as_ptr(), env)
            })
        };
        assert_eq!(rc, libc::ENOENT);
        assert_eq!(
            t.raw_events()[0].outcome,
            Outcome::Failure { errno: libc::ENOENT }
        );
    }

    #[test]
    fn test_path_search_classifies_found_program() {
        let t = TestSession::new();
        let bin = t.tree.root.join("bin");
        std::fs::create_dir(&bin).unwrap();
        script(&bin.join("gen-tool"), "exit 0");
        let name = CString::new(bin.join("gen-tool").to_string_lossy().into_owned()).unwrap();
        // A name with a slash is used as is
        let found = unsafe { classify_program(&t.session, name.as_ptr(), true) };
        assert_eq!(found, Some(bin.join("gen-tool")));
        let bare = cpath("sh");
        assert_eq!(unsafe { classify_program(&t.session, bare.as_ptr(), true) }, None);
    }
}
