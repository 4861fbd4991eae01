//! CFS interposer core.
//!
//! Everything the preload library does lives here so it can be exercised by
//! ordinary unit tests: the `cfs-preload` cdylib only exports the C symbols
//! and forwards to [`syscalls`].
//!
//! Layout:
//! - [`reals`]: lazily resolved pointers to the genuine libc functions
//! - [`path`]: canonicalization and build-tree classification
//! - [`sync`]: the descriptor table and the event ring buffer
//! - [`recorder`]: delivery of access events to the collector
//! - [`state`]: the per-process session and its lifecycle hooks
//! - [`syscalls`]: one shim per intercepted entry point

#![allow(clippy::missing_safety_doc)]

#[macro_use]
pub mod macros;
pub mod errno;
pub mod guard;
pub mod path;
pub mod reals;
pub mod recorder;
pub mod state;
pub mod sync;
pub mod syscalls;

pub use path::{Base, BuildTree, Classification, ClassifyError, Follow};
pub use recorder::{EventSink, RecordError, Recorder};
pub use state::Session;
