//! Trace suite: run scenarios under `LD_PRELOAD` and check what the collector
//! received.
//!
//! The reference collector runs on a private tokio runtime in this process.
//! Each case gets a fresh build tree, starts one child with the interposer
//! loaded, waits for it, then gathers the messages carrying the child's pid.

use crate::runner::{Checks, Suite};
use crate::scenario;
use anyhow::{Context, Result};
use cfs_config::{log_regress_debug, ENV_COLLECTOR, ENV_CONFIG, ENV_FD_TABLE, ENV_ROOT};
use cfs_ipc::collector::Collector;
use cfs_ipc::{AccessEvent, CollectorMessage, OpKind, SessionStats};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

pub const SUITE: &str = "trace";

const WAIT_FOR_GOODBYE: Duration = Duration::from_secs(10);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

pub fn suite() -> Suite<TraceContext> {
    Suite::new(SUITE)
        .case("end_to_end", end_to_end)
        .case("descriptor_dup", descriptor_dup)
        .case("exec_inheritance", exec_inheritance)
        .case("exec_list_inheritance", exec_list_inheritance)
        .case("out_of_tree_silent", out_of_tree_silent)
        .case("degraded_collector", degraded_collector)
}

pub struct TraceContext {
    preload: PathBuf,
    exe: PathBuf,
    socket: PathBuf,
    runtime: Runtime,
    rx: Mutex<mpsc::UnboundedReceiver<CollectorMessage>>,
    dir: TempDir,
}

/// Everything one child left behind.
pub struct ChildRun {
    pub pid: u32,
    pub status: ExitStatus,
    pub messages: Vec<CollectorMessage>,
}

impl ChildRun {
    /// Events in the order they happened.
    pub fn events(&self) -> Vec<AccessEvent> {
        let mut events: Vec<AccessEvent> = self
            .messages
            .iter()
            .filter_map(|m| match m {
                CollectorMessage::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect();
        events.sort_by_key(|e| e.timestamp_ns);
        events
    }

    pub fn summary(&self) -> Vec<(OpKind, PathBuf, Option<PathBuf>)> {
        self.events()
            .into_iter()
            .map(|e| (e.kind, e.path, e.dest))
            .collect()
    }

    pub fn goodbye(&self) -> Option<&SessionStats> {
        self.messages.iter().find_map(|m| match m {
            CollectorMessage::Goodbye { stats, .. } => Some(stats),
            _ => None,
        })
    }
}

fn message_pid(message: &CollectorMessage) -> u32 {
    match message {
        CollectorMessage::Hello(info) => info.pid,
        CollectorMessage::Event(event) => event.pid,
        CollectorMessage::Goodbye { pid, .. } => *pid,
    }
}

impl TraceContext {
    pub fn start(preload: &Path) -> Result<Self> {
        let preload = preload
            .canonicalize()
            .with_context(|| format!("preload library {}", preload.display()))?;
        let exe = std::env::current_exe().context("locate own executable")?;
        let dir = tempfile::Builder::new().prefix("cfs-trace").tempdir()?;
        let socket = dir.path().join("collector.sock");

        let runtime = Runtime::new().context("start collector runtime")?;
        let collector = {
            let _guard = runtime.enter();
            Collector::bind(&socket)?
        };
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            if let Err(e) = collector.run(tx).await {
                log_regress_debug!("Collector stopped", error = tracing::field::display(&e));
            }
        });

        Ok(Self {
            preload,
            exe,
            socket,
            runtime,
            rx: Mutex::new(rx),
            dir,
        })
    }

    /// A fresh canonical build tree for one case.
    fn tree(&self, name: &str) -> Result<PathBuf> {
        let tree = self.dir.path().join(name);
        std::fs::create_dir_all(&tree)?;
        Ok(tree.canonicalize()?)
    }

    /// Run `regress-glibc scenario <name> <tree>` under the interposer.
    /// `collector` false points the child at a socket nobody listens on.
    pub fn run_child(&self, name: &str, tree: &Path, collector: bool) -> Result<ChildRun> {
        let socket = if collector {
            self.socket.clone()
        } else {
            self.dir.path().join("absent.sock")
        };
        let mut child = Command::new(&self.exe)
            .arg("scenario")
            .arg(name)
            .arg(tree)
            .env("LD_PRELOAD", &self.preload)
            .env(ENV_ROOT, tree)
            .env(ENV_COLLECTOR, &socket)
            .env_remove(ENV_FD_TABLE)
            .env_remove(ENV_CONFIG)
            .spawn()
            .with_context(|| format!("spawn scenario {}", name))?;
        let pid = child.id();
        let status = child.wait()?;
        log_regress_debug!("Scenario finished", scenario = name, pid = pid, status = tracing::field::display(&status));

        let messages = if collector { self.gather(pid) } else { self.gather_quiet(pid) };
        Ok(ChildRun {
            pid,
            status,
            messages,
        })
    }

    /// Messages from `pid` up to its goodbye, plus stragglers from earlier
    /// images of the same process still in flight.
    fn gather(&self, pid: u32) -> Vec<CollectorMessage> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + WAIT_FOR_GOODBYE;
        let mut out = Vec::new();
        let mut said_goodbye = false;
        loop {
            let wait = if said_goodbye {
                QUIET_PERIOD
            } else {
                deadline.saturating_duration_since(Instant::now())
            };
            let next = self
                .runtime
                .block_on(async { tokio::time::timeout(wait, rx.recv()).await });
            match next {
                Ok(Some(message)) if message_pid(&message) == pid => {
                    said_goodbye |= matches!(message, CollectorMessage::Goodbye { .. });
                    out.push(message);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return out,
            }
        }
    }

    fn gather_quiet(&self, pid: u32) -> Vec<CollectorMessage> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        while let Ok(Some(message)) = self
            .runtime
            .block_on(async { tokio::time::timeout(QUIET_PERIOD, rx.recv()).await })
        {
            if message_pid(&message) == pid {
                out.push(message);
            }
        }
        out
    }
}

fn end_to_end(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    let tree = ctx.tree("end-to-end")?;
    let run = ctx.run_child(scenario::END_TO_END, &tree, true)?;
    c.check(run.status.success(), format!("scenario exit status {}", run.status));
    c.check_eq(
        run.summary(),
        vec![
            (OpKind::Create, tree.join("out.o"), None),
            (OpKind::Rename, tree.join("out.o"), Some(tree.join("final.o"))),
        ],
        "recorded events",
    );
    let hello = run.messages.first();
    c.check(
        matches!(hello, Some(CollectorMessage::Hello(info)) if info.pid == run.pid),
        "connection opens with the program record",
    );
    match run.goodbye() {
        Some(stats) => {
            c.check_eq(stats.dropped_full, 0, "events dropped on a full queue");
            c.check_eq(stats.delivered, 2, "events delivered");
        }
        None => {
            c.check(false, "goodbye received");
        }
    }
    Ok(())
}

fn descriptor_dup(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    let tree = ctx.tree("dup")?;
    let run = ctx.run_child(scenario::DUP, &tree, true)?;
    c.check(run.status.success(), format!("scenario exit status {}", run.status));
    let events = run.events();
    c.check_eq(
        events.iter().map(|e| (e.kind, e.path.clone())).collect::<Vec<_>>(),
        vec![
            (OpKind::Create, tree.join("log.txt")),
            (OpKind::Write, tree.join("log.txt")),
        ],
        "write through the duplicate is attributed to log.txt",
    );
    c.check_eq(
        events.get(1).and_then(|e| e.bytes),
        Some(scenario::DUP_PAYLOAD.len() as u64),
        "bytes written",
    );
    Ok(())
}

fn exec_inheritance(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    check_exec_inheritance(c, ctx, "exec", scenario::EXEC_INHERIT)
}

/// Same as `exec_inheritance`, through the variadic `execl` entry point.
fn exec_list_inheritance(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    check_exec_inheritance(c, ctx, "execl", scenario::EXEC_INHERIT_LIST)
}

fn check_exec_inheritance(c: &mut Checks, ctx: &TraceContext, tree_name: &str, name: &str) -> Result<()> {
    let tree = ctx.tree(tree_name)?;
    let run = ctx.run_child(name, &tree, true)?;
    c.check(run.status.success(), format!("scenario exit status {}", run.status));
    c.check_eq(
        run.summary(),
        vec![
            (OpKind::Create, tree.join("inherit.log"), None),
            (OpKind::Write, tree.join("inherit.log"), None),
        ],
        "write after exec is attributed to inherit.log",
    );
    c.check_eq(
        std::fs::read(tree.join("inherit.log")).unwrap_or_default(),
        scenario::EXEC_PAYLOAD.to_vec(),
        "inherit.log contents",
    );
    let hellos = run
        .messages
        .iter()
        .filter(|m| matches!(m, CollectorMessage::Hello(_)))
        .count();
    c.check_eq(hellos, 2, "one program record per image");
    Ok(())
}

fn out_of_tree_silent(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    let tree = ctx.tree("untracked")?;
    let run = ctx.run_child(scenario::OUT_OF_TREE, &tree, true)?;
    c.check(run.status.success(), format!("scenario exit status {}", run.status));
    c.check_eq(run.events().len(), 0, "events for out-of-tree work");
    c.check_eq(run.goodbye().map(|s| s.enqueued), Some(0), "goodbye with nothing enqueued");
    Ok(())
}

fn degraded_collector(c: &mut Checks, ctx: &TraceContext) -> Result<()> {
    let tree = ctx.tree("degraded")?;
    let run = ctx.run_child(scenario::END_TO_END, &tree, false)?;
    c.check(run.status.success(), format!("scenario exit status {}", run.status));
    c.check(tree.join("final.o").exists(), "work completed without a collector");
    c.check_eq(run.messages.len(), 0, "nothing delivered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_ipc::{Outcome, ProgramInfo};
    use std::os::unix::process::ExitStatusExt;

    fn event(path: &str, timestamp_ns: u64) -> CollectorMessage {
        CollectorMessage::Event(AccessEvent {
            kind: OpKind::Write,
            path: PathBuf::from(path),
            dest: None,
            outcome: Outcome::Success,
            bytes: Some(1),
            timestamp_ns,
            pid: 42,
            tid: 42,
        })
    }

    #[test]
    fn test_events_ordered_across_images() {
        let run = ChildRun {
            pid: 42,
            status: ExitStatus::from_raw(0),
            messages: vec![
                CollectorMessage::Hello(ProgramInfo {
                    pid: 42,
                    ppid: 1,
                    cwd: PathBuf::from("/"),
                    argv: vec![],
                }),
                event("/build/late", 20),
                CollectorMessage::Goodbye {
                    pid: 42,
                    stats: SessionStats {
                        enqueued: 1,
                        ..SessionStats::default()
                    },
                },
                event("/build/early", 10),
            ],
        };
        let paths: Vec<PathBuf> = run.summary().into_iter().map(|e| e.1).collect();
        assert_eq!(paths, vec![PathBuf::from("/build/early"), PathBuf::from("/build/late")]);
        assert_eq!(run.goodbye().map(|s| s.enqueued), Some(1));
        assert!(run.messages.iter().all(|m| message_pid(m) == 42));
    }
}
