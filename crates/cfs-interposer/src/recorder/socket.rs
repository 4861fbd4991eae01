//! Collector connection over a Unix stream socket.
//!
//! Bounded-blocking only: `SO_SNDTIMEO` caps both `connect` and every `send`,
//! and a circuit breaker stops reconnect attempts for a while once the
//! collector has failed several times in a row.
//!
//! The socket lives on a high descriptor number and is remembered by inode.
//! A program that closes that number and opens something else there keeps
//! its new descriptor: the recorder notices the swap and reconnects.

use super::{EventSink, RecordError};
use cfs_config::{log_recorder_info, log_recorder_warn, InterposerConfig};
use cfs_ipc::{encode_frame, CollectorMessage, ProgramInfo};
use libc::c_int;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

struct CircuitBreaker {
    threshold: usize,
    recovery: Duration,
    failures: usize,
    tripped_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new(threshold: usize, recovery: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery,
            failures: 0,
            tripped_at: None,
        }
    }

    fn check(&mut self) -> Result<(), RecordError> {
        if let Some(tripped_at) = self.tripped_at {
            if tripped_at.elapsed() < self.recovery {
                return Err(RecordError::CircuitOpen);
            }
            log_recorder_info!(
                "Circuit breaker recovery attempt",
                after_secs = tripped_at.elapsed().as_secs()
            );
            self.tripped_at = None;
            self.failures = 0;
        }
        Ok(())
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.threshold && self.tripped_at.is_none() {
            self.tripped_at = Some(Instant::now());
            log_recorder_warn!(
                "Collector failed repeatedly, circuit breaker tripped",
                failures = self.failures,
                retry_after_secs = self.recovery.as_secs()
            );
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
    }
}

/// Span below the descriptor ceiling where the socket is parked.
const PARKING_SPAN: c_int = 64;

/// An established collector connection.
struct Connection {
    fd: c_int,
    dev: u64,
    ino: u64,
}

impl Connection {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let fd = park_high(fd);
        let (dev, ino) = identity(fd.as_raw_fd()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            fd: fd.into_raw_fd(),
            dev,
            ino,
        })
    }

    /// True while the number still names the socket this connection opened.
    fn is_ours(&self) -> bool {
        identity(self.fd) == Some((self.dev, self.ino))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_ours() {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn identity(fd: c_int) -> Option<(u64, u64)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return None;
    }
    Some((st.st_dev as u64, st.st_ino as u64))
}

/// Move `fd` to the top of the descriptor range, out of the way of the low
/// numbers a program allocates and closes. Falls back to `fd` unchanged.
fn park_high(fd: OwnedFd) -> OwnedFd {
    let mut limit: libc::rlimit = unsafe { std::mem::zeroed() };
    let ceiling = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur.min(1024) as c_int
    } else {
        1024
    };
    let floor = (ceiling - PARKING_SPAN).max(3);
    if fd.as_raw_fd() >= floor {
        return fd;
    }
    let high = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if high < 0 {
        return fd;
    }
    unsafe { OwnedFd::from_raw_fd(high) }
}

pub struct SocketSink {
    path: PathBuf,
    connect_timeout: Duration,
    send_timeout: Duration,
    conn: Option<Connection>,
    breaker: CircuitBreaker,
}

impl SocketSink {
    pub fn new(path: impl Into<PathBuf>, config: &InterposerConfig) -> Self {
        Self {
            path: path.into(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            conn: None,
            breaker: CircuitBreaker::new(
                config.circuit_threshold,
                Duration::from_secs(config.circuit_recovery_secs),
            ),
        }
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    #[cfg(test)]
    fn raw_fd(&self) -> Option<c_int> {
        self.conn.as_ref().map(|c| c.fd)
    }

    fn connection(&mut self) -> Result<&Connection, RecordError> {
        if let Some(conn) = self.conn.take() {
            if conn.is_ours() {
                self.conn = Some(conn);
            } else {
                log_recorder_warn!("Collector descriptor reused by the program, reconnecting", fd = conn.fd);
            }
        }
        if self.conn.is_none() {
            let conn = connect(&self.path, self.connect_timeout, self.send_timeout)
                .and_then(Connection::new)
                .map_err(|source| RecordError::Connect {
                    path: self.path.clone(),
                    source,
                })?;
            // Each connection opens with the program record
            let hello = encode_frame(&CollectorMessage::Hello(program_info()))?;
            send_all(conn.fd, &hello).map_err(RecordError::Send)?;
            self.conn = Some(conn);
        }
        self.conn.as_ref().ok_or(RecordError::NotConfigured)
    }

    fn try_send(&mut self, frame: &[u8]) -> Result<(), RecordError> {
        let fd = self.connection()?.fd;
        send_all(fd, frame).map_err(RecordError::Send)
    }
}

impl EventSink for SocketSink {
    fn send(&mut self, message: &CollectorMessage) -> Result<(), RecordError> {
        self.breaker.check()?;
        let frame = encode_frame(message)?;
        match self.try_send(&frame) {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.conn = None;
        self.breaker = CircuitBreaker::new(self.breaker.threshold, self.breaker.recovery);
    }
}

fn set_timeout(fd: c_int, option: c_int, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Connect to a Unix socket with bounded waits.
///
/// The descriptor is close-on-exec so it never leaks into a traced child.
pub fn connect(path: &Path, connect_timeout: Duration, send_timeout: Duration) -> io::Result<OwnedFd> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "collector socket path does not fit in sockaddr_un",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SO_SNDTIMEO also bounds a connect that would block
    set_timeout(raw, libc::SO_SNDTIMEO, connect_timeout)?;
    let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    if unsafe { libc::connect(raw, &addr as *const _ as *const libc::sockaddr, len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    set_timeout(raw, libc::SO_SNDTIMEO, send_timeout)?;
    set_timeout(raw, libc::SO_RCVTIMEO, send_timeout)?;
    Ok(fd)
}

/// Write the whole buffer. `MSG_NOSIGNAL` keeps a vanished collector from
/// raising `SIGPIPE` in the traced process.
fn send_all(fd: c_int, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Identity of the current program image.
pub fn program_info() -> ProgramInfo {
    let argv = std::fs::read("/proc/self/cmdline")
        .map(|raw| {
            raw.split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(<[u8]>::to_vec)
                .collect()
        })
        .unwrap_or_default();
    ProgramInfo {
        pid: std::process::id(),
        ppid: unsafe { libc::getppid() } as u32,
        cwd: std::env::current_dir().unwrap_or_default(),
        argv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_config::testing::TestTree;
    use cfs_ipc::{read_frame, SessionStats};
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::net::UnixListener;

    fn goodbye() -> CollectorMessage {
        CollectorMessage::Goodbye {
            pid: 1,
            stats: SessionStats::default(),
        }
    }

    #[test]
    fn test_hello_precedes_messages() {
        let t = TestTree::new().unwrap();
        let listener = UnixListener::bind(&t.socket_path).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut out = Vec::new();
            while let Some(msg) = read_frame(&mut stream).unwrap() {
                out.push(msg);
            }
            out
        });

        let mut sink = SocketSink::new(&t.socket_path, &t.config().interposer);
        sink.send(&goodbye()).unwrap();
        sink.send(&goodbye()).unwrap();
        assert!(sink.is_connected());
        drop(sink);

        let received = server.join().unwrap();
        assert_eq!(received.len(), 3);
        match &received[0] {
            CollectorMessage::Hello(info) => {
                assert_eq!(info.pid, std::process::id());
                assert!(!info.argv.is_empty());
            }
            other => panic!("expected hello, got {:?}", other),
        }
        assert_eq!(received[1], goodbye());
    }

    #[test]
    fn test_reused_descriptor_left_to_program() {
        let t = TestTree::new().unwrap();
        let _listener = UnixListener::bind(&t.socket_path).unwrap();
        let mut sink = SocketSink::new(&t.socket_path, &t.config().interposer);
        sink.send(&goodbye()).unwrap();
        let parked = sink.raw_fd().unwrap();
        assert!(parked > 2);

        // The program takes over the number: dup2 closes the socket in place
        let log = t.root.join("program.log");
        let file = std::fs::File::create(&log).unwrap().into_raw_fd();
        assert_eq!(unsafe { libc::dup2(file, parked) }, parked);
        unsafe { libc::close(file) };

        sink.send(&goodbye()).unwrap();
        assert_ne!(sink.raw_fd(), Some(parked));
        drop(sink);

        let (_, ino) = identity(parked).expect("program descriptor still open");
        assert_eq!(ino, std::fs::metadata(&log).unwrap().ino());
        unsafe { libc::close(parked) };
    }

    #[test]
    fn test_connection_close_on_exec() {
        let t = TestTree::new().unwrap();
        let _listener = UnixListener::bind(&t.socket_path).unwrap();
        let mut sink = SocketSink::new(&t.socket_path, &t.config().interposer);
        sink.send(&goodbye()).unwrap();
        let fd = sink.raw_fd().unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
        assert!(fd >= 3);
    }

    #[test]
    fn test_missing_collector_trips_breaker() {
        let t = TestTree::new().unwrap();
        let config = t.config_without_collector();
        let mut sink = SocketSink::new(config.interposer.collector.clone().unwrap(), &config.interposer);

        for _ in 0..config.interposer.circuit_threshold {
            assert!(matches!(sink.send(&goodbye()), Err(RecordError::Connect { .. })));
        }
        assert!(matches!(sink.send(&goodbye()), Err(RecordError::CircuitOpen)));
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_breaker_recovers_after_delay() {
        let t = TestTree::new().unwrap();
        let mut config = t.config().interposer;
        config.circuit_threshold = 1;
        config.circuit_recovery_secs = 0;
        let mut sink = SocketSink::new(&t.socket_path, &config);

        assert!(matches!(sink.send(&goodbye()), Err(RecordError::Connect { .. })));
        // Zero recovery delay: the next send tries again instead of short-circuiting
        let _listener = UnixListener::bind(&t.socket_path).unwrap();
        assert!(sink.send(&goodbye()).is_ok());
    }

    #[test]
    fn test_path_too_long_rejected() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        let err = connect(&long, Duration::from_millis(10), Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_program_info_describes_self() {
        let info = program_info();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.ppid, unsafe { libc::getppid() } as u32);
        assert!(info.cwd.is_absolute());
    }
}
