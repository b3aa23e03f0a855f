//! aya-backed record source.
//!
//! Loads the embedded kernel program, attaches the probes for the
//! configured [`ProbeKind`], and forwards every ring buffer sample as a
//! raw record. The reader never waits on the pump: when the delivery
//! channel is full the sample is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use aya::maps::RingBuf;
use aya::programs::{KProbe, UProbe};
use aya::{Btf, Ebpf, EbpfLoader};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;

use super::event::ProbeKind;
use super::{RawRecord, RecordSource};

/// Compiled BPF object, embedded at build time.
///
/// Uses `include_bytes_aligned!` to guarantee 32-byte alignment. Without this,
/// `include_bytes!` provides only 1-byte alignment and `aya-obj`'s ELF parser
/// will reject the data when the pointer lands at a non-8-byte-aligned address.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/snoopd.bpf.o"));

/// Wrapper symbols tried before the bare `sys_<name>` entry point.
const SYSCALL_PREFIXES: &[&str] = &["__x64_sys_", "__arm64_sys_", "__ia32_sys_", "sys_"];

/// BPF-backed record source.
pub struct BpfSource {
    cfg: ProbeConfig,
    capacity: usize,
    ebpf: Option<Ebpf>,
    read_task: Option<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
}

impl BpfSource {
    /// Create a source for `cfg.kind` delivering on a channel of `capacity`.
    pub fn new(cfg: ProbeConfig, capacity: usize) -> Self {
        Self {
            cfg,
            capacity,
            ebpf: None,
            read_task: None,
            cancel: CancellationToken::new(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Samples dropped because the delivery channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordSource for BpfSource {
    fn kind(&self) -> ProbeKind {
        self.cfg.kind
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<RawRecord>> {
        let kallsyms =
            std::fs::read_to_string("/proc/kallsyms").context("reading /proc/kallsyms")?;
        let execve_fn = syscall_fn_name(&kallsyms, "execve");
        let wrapper: u8 = u8::from(execve_fn != "sys_execve");
        let max_args = self.cfg.max_args;

        // The parent PID read is relocated against the running kernel's types.
        let btf = Btf::from_sys_fs().context("loading kernel BTF")?;

        let mut ebpf = EbpfLoader::new()
            .btf(Some(&btf))
            .set_global("MAX_ARGS", &max_args, true)
            .set_global("SYSCALL_WRAPPER", &wrapper, true)
            .load(BPF_OBJ)
            .context("loading BPF objects")?;

        match self.cfg.kind {
            ProbeKind::Execve => {
                attach_kprobe(&mut ebpf, "kprobe_execve", &execve_fn)?;
                attach_kprobe(&mut ebpf, "kretprobe_execve", &execve_fn)?;
            }
            ProbeKind::Readline => {
                attach_uretprobe(
                    &mut ebpf,
                    "uretprobe_readline",
                    &self.cfg.readline_symbol,
                    &self.cfg.readline_binary,
                )?;
            }
        }

        // Take the ring buffer map for the read task.
        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow::anyhow!("events map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let cancel = self.cancel.clone();
        let dropped = Arc::clone(&self.dropped);

        self.read_task = Some(tokio::spawn(read_loop(ring_buf, tx, dropped, cancel)));
        self.ebpf = Some(ebpf);

        tracing::info!(
            probe = %self.cfg.kind,
            max_args = self.cfg.max_args,
            capacity = self.capacity,
            "BPF record source started",
        );

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.read_task.take() {
            handle.await.context("waiting for read task")?;
        }

        // Dropping the Ebpf object detaches all programs and closes maps.
        self.ebpf = None;

        tracing::info!(
            probe = %self.cfg.kind,
            dropped = self.dropped(),
            "BPF record source stopped",
        );
        Ok(())
    }
}

async fn read_loop(
    ring_buf: RingBuf<aya::maps::MapData>,
    tx: mpsc::Sender<RawRecord>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut async_fd = match AsyncFd::new(ring_buf) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed to create async fd for ring buffer");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = async_fd.readable_mut() => {
                let mut guard = match result {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(error = %e, "ring buffer poll error");
                        continue;
                    }
                };

                // Drain all available samples.
                let rb = guard.get_inner_mut();
                while let Some(item) = rb.next() {
                    match tx.try_send(item.to_vec()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::debug!(dropped = n, "delivery channel full, dropping record");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            tracing::debug!("delivery channel closed, stopping reader");
                            return;
                        }
                    }
                }

                guard.clear_ready();
            }
        }
    }
}

/// Resolve the kernel symbol implementing syscall `name`, preferring the
/// arch wrapper (`__x64_sys_execve`) when the kernel has one.
fn syscall_fn_name(kallsyms: &str, name: &str) -> String {
    for prefix in SYSCALL_PREFIXES {
        let symbol = format!("{prefix}{name}");
        let found = kallsyms
            .lines()
            .filter_map(|line| line.split_whitespace().nth(2))
            .any(|sym| sym == symbol);
        if found {
            return symbol;
        }
    }

    format!("sys_{name}")
}

/// Attach a kprobe or kretprobe. BPF programs with section `kretprobe/`
/// are detected by aya and attached as return probes automatically.
fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("kprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {symbol}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching kprobe {symbol}"))?;

    tracing::debug!(program = prog_name, symbol, "attached kprobe");
    Ok(())
}

fn attach_uretprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str, binary: &str) -> Result<()> {
    let prog: &mut UProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("uprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a uprobe program"))?;
    prog.load()
        .with_context(|| format!("loading uretprobe {symbol}"))?;
    prog.attach(Some(symbol), 0, binary, None)
        .with_context(|| format!("attaching uretprobe {symbol} in {binary}"))?;

    tracing::debug!(program = prog_name, symbol, binary, "attached uretprobe");
    Ok(())
}
