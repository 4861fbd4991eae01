// =============================================================================
// state/mod.rs: process/session state
// =============================================================================
//
// One `Session` per process image, reached through a small state machine:
//
//   UNINIT ──first caller──▶ BUSY ──▶ READY     (tracking)
//                                 └──▶ DISABLED (no CFS_ROOT, or bad config)
//
// Threads arriving while BUSY yield until the initializer publishes. The
// initializing thread holds the shim guard, so its own libc calls never come
// back here. The session is leaked on purpose: shims on other threads may
// still be running while atexit handlers execute.
// =============================================================================

pub mod exec;

use crate::errno;
use crate::guard::ShimGuard;
use crate::path::BuildTree;
use crate::recorder::{EventSink, NullSink, Recorder, SinkGuard, SocketSink};
use crate::sync::{FdTable, ShardGuard};
use cfs_config::logging::init_file_logging;
use cfs_config::{log_interposer_debug, log_interposer_info, log_interposer_trace};
use cfs_config::{Config, ConfigError};
use cfs_ipc::{AccessEvent, OpKind, Outcome, SessionStats};
use std::cell::RefCell;
use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const UNINIT: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;
const DISABLED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(UNINIT);
static SESSION: AtomicPtr<Session> = AtomicPtr::new(std::ptr::null_mut());
static FINALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0:#}")]
    Root(anyhow::Error),
}

pub struct Session {
    pub config: Config,
    pub tree: BuildTree,
    pub fds: FdTable,
    pub recorder: Recorder,
    /// `LD_PRELOAD` and `CFS_*` entries a child needs to re-attach.
    exec_env: Vec<CString>,
    pid: AtomicU32,
    flush_timeout: Duration,
}

impl Session {
    pub fn new(config: Config, sink: Box<dyn EventSink>) -> Result<Self, SessionError> {
        config.validate()?;
        let tree = BuildTree::from_roots(&config.interposer.roots).map_err(SessionError::Root)?;
        Ok(Self {
            tree,
            fds: FdTable::new(),
            recorder: Recorder::new(config.interposer.queue_capacity, sink),
            exec_env: exec::reattach_env(&config),
            pid: AtomicU32::new(std::process::id()),
            flush_timeout: Duration::from_millis(config.interposer.flush_timeout_ms),
            config,
        })
    }

    /// Build the session for this process image from its environment.
    /// `Ok(None)` when no build tree is configured.
    pub fn from_env() -> Result<Option<Self>, SessionError> {
        let config = Config::load()?;
        if !config.is_enabled() {
            return Ok(None);
        }
        if config.logging.debug_level > 0 {
            // Logging is optional: a log file we cannot create is not fatal
            let _ = init_file_logging(config.logging.level(), &config.logging.log_file);
        }
        let sink: Box<dyn EventSink> = match &config.interposer.collector {
            Some(path) => Box::new(SocketSink::new(path, &config.interposer)),
            None => Box::new(NullSink),
        };
        let session = Self::new(config, sink)?;
        if let Some(table) = std::env::var_os(cfs_config::ENV_FD_TABLE) {
            let imported = exec::import_fd_table(&session.fds, &table.to_string_lossy());
            log_interposer_debug!("Descriptors inherited across exec", count = imported);
            // Belongs to this image only; a later exec exports a fresh one
            std::env::remove_var(cfs_config::ENV_FD_TABLE);
        }
        Ok(Some(session))
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// True in a `vfork` child, which shares this session's memory but not
    /// its pid.
    pub fn is_vfork_child(&self) -> bool {
        std::process::id() != self.pid()
    }

    pub fn exec_env(&self) -> &[CString] {
        &self.exec_env
    }

    pub fn record(
        &self,
        kind: OpKind,
        path: PathBuf,
        dest: Option<PathBuf>,
        outcome: Outcome,
        bytes: Option<u64>,
    ) {
        log_interposer_trace!(
            "Access",
            kind = kind.as_str(),
            path = tracing::field::debug(&path),
            outcome = tracing::field::debug(outcome)
        );
        self.recorder.submit(AccessEvent {
            kind,
            path,
            dest,
            outcome,
            bytes,
            timestamp_ns: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0),
            pid: std::process::id(),
            tid: unsafe { libc::syscall(libc::SYS_gettid) } as u32,
        });
    }

    /// Deliver everything queued, bounded by the configured flush timeout.
    pub fn flush(&self) -> bool {
        self.recorder.flush(self.flush_timeout)
    }

    pub fn finish(&self) -> SessionStats {
        self.recorder.finish(self.pid(), self.flush_timeout)
    }
}

/// The session, initializing it on first use.
///
/// `None` means pass through: tracking is disabled for this process.
#[inline]
pub fn session() -> Option<&'static Session> {
    loop {
        match STATE.load(Ordering::Acquire) {
            READY => return unsafe { SESSION.load(Ordering::Acquire).as_ref() },
            DISABLED => return None,
            UNINIT => {
                if STATE
                    .compare_exchange(UNINIT, BUSY, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return initialize_slow();
                }
            }
            _ => std::thread::yield_now(),
        }
    }
}

/// The session if it is already up. Never initializes.
pub fn current() -> Option<&'static Session> {
    if STATE.load(Ordering::Acquire) == READY {
        unsafe { SESSION.load(Ordering::Acquire).as_ref() }
    } else {
        None
    }
}

/// Load-time entry point.
pub fn initialize() {
    let _ = session();
}

#[cold]
#[inline(never)]
fn initialize_slow() -> Option<&'static Session> {
    let _guard = ShimGuard::enter();
    errno::preserve(|| match Session::from_env() {
        Ok(Some(session)) => {
            let ptr = Box::into_raw(Box::new(session));
            SESSION.store(ptr, Ordering::Release);
            STATE.store(READY, Ordering::Release);
            install_hooks();
            let session = unsafe { &*ptr };
            log_interposer_info!(
                "Session started",
                pid = session.pid(),
                roots = session.tree.roots().len(),
                inherited_fds = session.fds.len()
            );
            Some(session)
        }
        Ok(None) => {
            STATE.store(DISABLED, Ordering::Release);
            None
        }
        Err(e) => {
            raw_eprintln!("cfs: interposer disabled: {}", e);
            STATE.store(DISABLED, Ordering::Release);
            None
        }
    })
}

fn install_hooks() {
    unsafe {
        libc::atexit(finalize_at_exit);
        libc::pthread_atfork(Some(before_fork), Some(after_fork_parent), Some(after_fork_child));
    }
}

/// Flush pending events and say goodbye to the collector. Runs once per
/// process image, from `atexit` or the library destructor, whichever is first.
pub fn finalize() {
    let Some(session) = current() else { return };
    if session.is_vfork_child() || FINALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    let _guard = ShimGuard::enter();
    errno::preserve(|| {
        let stats = session.finish();
        log_interposer_info!(
            "Session finished",
            enqueued = stats.enqueued,
            delivered = stats.delivered,
            dropped_full = stats.dropped_full,
            dropped_undeliverable = stats.dropped_undeliverable,
            max_queue_depth = session.recorder.queue_stats().max_depth
        );
    });
}

extern "C" fn finalize_at_exit() {
    finalize();
}

struct ForkLocks {
    sink: SinkGuard<'static>,
    shards: Vec<ShardGuard<'static>>,
}

thread_local! {
    static FORK_LOCKS: RefCell<Option<ForkLocks>> = const { RefCell::new(None) };
}

// Hold every interposer lock across fork so the child never inherits one
// owned by a thread that does not exist on its side.
unsafe extern "C" fn before_fork() {
    let Some(session) = current() else { return };
    let _guard = ShimGuard::enter();
    let locks = ForkLocks {
        sink: session.recorder.lock_for_fork(),
        shards: session.fds.lock_all(),
    };
    let _ = FORK_LOCKS.try_with(|slot| *slot.borrow_mut() = Some(locks));
}

unsafe extern "C" fn after_fork_parent() {
    let _ = FORK_LOCKS.try_with(|slot| slot.borrow_mut().take());
}

unsafe extern "C" fn after_fork_child() {
    let Some(session) = current() else { return };
    let locks = FORK_LOCKS.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
    if let Some(ForkLocks { sink, shards }) = locks {
        drop(shards);
        unsafe { session.recorder.reset_after_fork(sink) };
    }
    session.pid.store(std::process::id(), Ordering::Relaxed);
    FINALIZED.store(false, Ordering::Release);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::recorder::testing::MemorySink;
    use cfs_config::testing::TestTree;

    /// A session over a fresh temporary tree, recording into memory.
    pub struct TestSession {
        pub tree: TestTree,
        pub sink: MemorySink,
        pub session: Session,
    }

    impl TestSession {
        pub fn new() -> Self {
            let tree = TestTree::new().unwrap();
            let sink = MemorySink::default();
            let session = Session::new(tree.config(), Box::new(sink.clone())).unwrap();
            Self {
                tree,
                sink,
                session,
            }
        }

        /// Flush, then return `(kind, path, dest)` for every delivered event.
        pub fn events(&self) -> Vec<(OpKind, PathBuf, Option<PathBuf>)> {
            assert!(self.session.flush());
            self.sink
                .events()
                .into_iter()
                .map(|e| (e.kind, e.path, e.dest))
                .collect()
        }

        pub fn raw_events(&self) -> Vec<AccessEvent> {
            assert!(self.session.flush());
            self.sink.events()
        }
    }
}
