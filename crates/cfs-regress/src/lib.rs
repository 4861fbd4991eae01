//! # cfs-regress
//!
//! Harness for the CFS interposer:
//! - [`regress`]: the `regress_glibc` transparency suite
//! - [`trace`]: recorded-event checks with the interposer preloaded
//! - [`scenario`]: what the traced children do
//! - [`runner`]: suites, cases and the run summary

pub mod regress;
pub mod runner;
pub mod scenario;
pub mod trace;

pub use runner::{Checks, Suite, Summary};
