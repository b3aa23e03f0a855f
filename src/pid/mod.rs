//! Parent PID fallback lookup.
//!
//! The kernel program reads `real_parent->tgid` at exec time, but some
//! kernels report it as 0 (see iovisor/bcc#1883). Exec events that arrive
//! with `ppid == 0` are completed from the process table. That only works
//! while the process is alive, so short-lived processes keep `ppid == 0`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::tracer::event::DecodedEvent;

/// Resolves the parent of a live process.
pub trait ParentResolver: Send + Sync {
    /// Parent PID of `pid`, or `None` when it cannot be determined
    /// (process already exited, no permission, malformed table).
    fn parent_of(&self, pid: u64) -> Option<u64>;
}

/// Reads `PPid:` from `/proc/<pid>/status`.
#[derive(Debug, Clone)]
pub struct ProcParentResolver {
    root: PathBuf,
}

impl ProcParentResolver {
    /// Resolver over the host's `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Resolver over an alternate procfs mount (e.g. a container's host /proc).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for ProcParentResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ParentResolver for ProcParentResolver {
    fn parent_of(&self, pid: u64) -> Option<u64> {
        let path = self.root.join(pid.to_string()).join("status");
        match std::fs::read_to_string(&path) {
            Ok(status) => parse_ppid(&status),
            Err(e) => {
                trace!(pid, error = %e, "reading process status failed");
                None
            }
        }
    }
}

/// Extract the `PPid:` value from a `/proc/<pid>/status` document.
pub fn parse_ppid(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("PPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Fill in a missing parent PID on exec events. Other events pass through.
pub fn enrich<R: ParentResolver + ?Sized>(event: DecodedEvent, resolver: &R) -> DecodedEvent {
    match event {
        DecodedEvent::Exec(mut ev) if ev.ppid == 0 => {
            if let Some(ppid) = resolver.parent_of(ev.pid) {
                ev.ppid = ppid;
            }
            DecodedEvent::Exec(ev)
        }
        other => other,
    }
}

/// Async form of [`enrich`] for the pump. The process table read runs on
/// the blocking pool, and only for exec events that arrive with `ppid == 0`.
pub async fn resolve_missing_parent(
    event: DecodedEvent,
    resolver: Arc<dyn ParentResolver>,
) -> DecodedEvent {
    match event {
        DecodedEvent::Exec(mut ev) if ev.ppid == 0 => {
            let pid = ev.pid;
            match tokio::task::spawn_blocking(move || resolver.parent_of(pid)).await {
                Ok(Some(ppid)) => ev.ppid = ppid,
                Ok(None) => {}
                Err(e) => warn!(pid, error = %e, "parent lookup task failed"),
            }
            DecodedEvent::Exec(ev)
        }
        other => other,
    }
}
