//! # cfs-preload
//!
//! The shared object named in `LD_PRELOAD`. It owns the exported C symbols
//! and the load/unload hooks; all behavior lives in `cfs_interposer`.
//!
//! Tracking is off unless `CFS_ROOT` is set, in which case every export is a
//! single extra branch in front of the real libc function.

#![allow(clippy::missing_safety_doc)]

#[cfg(target_os = "linux")]
pub mod interpose;

use ctor::{ctor, dtor};

/// Bring the session up at load time so the first intercepted call does not
/// pay for it. Later calls initialize lazily if this did not run yet.
#[ctor]
fn load() {
    cfs_interposer::state::initialize();
}

/// Runs on `dlclose` as well as at exit. A no-op once the session has
/// finished.
#[dtor]
fn unload() {
    cfs_interposer::state::finalize();
}
