//! Interposed Call Shims
//!
//! `cfs-preload` exports one C symbol per intercepted entry point and forwards
//! it to the matching `*_shim` function here. Every shim has the same shape:
//!
//! 1. take the recursion guard and the session, or call straight through
//! 2. classify the path, or look the descriptor up in the FD table
//! 3. call the real function exactly once, with the caller's errno
//! 4. record and update the FD table, then restore the errno the call left
//!
//! The session-taking `*_in` variants hold steps 2-4 and are what the unit
//! tests drive.

pub mod io;
pub mod misc;
pub mod open;
pub mod process;
pub mod stat;

use crate::errno;
use crate::guard::ShimGuard;
use crate::path::{c_path, Base, Follow};
use crate::state::{self, Session};
use cfs_ipc::Outcome;
use libc::{c_char, c_int};
use std::path::PathBuf;

/// Route a call either straight to libc or through the tracked path.
#[inline]
pub(crate) fn dispatch<R>(
    passthrough: impl FnOnce() -> R,
    tracked: impl FnOnce(&'static Session) -> R,
) -> R {
    let Some(_guard) = ShimGuard::enter() else {
        return passthrough();
    };
    let saved = errno::get();
    let Some(session) = state::session() else {
        errno::set(saved);
        return passthrough();
    };
    errno::set(saved);
    let ret = tracked(session);
    errno::preserve(|| session.recorder.ensure_worker());
    ret
}

/// Make the real call with `saved` as errno, run `after` with the result and
/// the errno it produced, then leave that errno for the caller.
#[inline]
pub(crate) fn forward<R: Copy>(saved: c_int, real: impl FnOnce() -> R, after: impl FnOnce(R, c_int)) -> R {
    errno::set(saved);
    let ret = real();
    let err = errno::get();
    after(ret, err);
    errno::set(err);
    ret
}

pub(crate) fn status(failed: bool, err: c_int) -> Outcome {
    if failed {
        Outcome::Failure { errno: err }
    } else {
        Outcome::Success
    }
}

/// Canonical path of an in-tree access, `None` for everything else.
pub(crate) unsafe fn classify(
    s: &Session,
    base: Base,
    path: *const c_char,
    follow: Follow,
) -> Option<PathBuf> {
    let path = c_path(path)?;
    s.tree.classify(base, path, follow, &s.fds).into_tracked()
}
