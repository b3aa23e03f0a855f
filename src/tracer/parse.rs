//! Record decoding for raw probe samples.
//!
//! Decodes byte slices delivered by a [`RecordSource`](super::RecordSource)
//! into typed [`DecodedEvent`] values. The layout is chosen by the configured
//! [`ProbeKind`], never sniffed from the bytes. Length checks happen once per
//! record, then fixed-width reads copy out of the checked slice. Integers are
//! in host byte order, as written by the kernel program.

use thiserror::Error;

use super::event::{
    DecodedEvent, ExecEvent, ExecPhase, PhaseType, ProbeKind, ReadlineEvent,
};

/// `TASK_COMM_LEN` in the kernel.
pub const COMM_LEN: usize = 16;

/// `ARGSIZE` in `bpf/snoopd.c`.
pub const ARG_LEN: usize = 128;

/// Readline buffer size in `bpf/snoopd.c`.
pub const LINE_LEN: usize = 80;

/// Size of `struct exec_event` (matches `bpf/snoopd.c`).
pub const EXEC_RECORD_SIZE: usize = 168;

/// Size of `struct readline_event` (matches `bpf/snoopd.c`).
pub const READLINE_RECORD_SIZE: usize = 84;

const EXEC_PID_OFFSET: usize = 0;
const EXEC_PPID_OFFSET: usize = 8;
const EXEC_COMM_OFFSET: usize = 16;
const EXEC_PHASE_OFFSET: usize = 32;
const EXEC_ARGV_OFFSET: usize = 36;
const EXEC_RETVAL_OFFSET: usize = 164;

const READLINE_PID_OFFSET: usize = 0;
const READLINE_LINE_OFFSET: usize = 4;

/// Errors that can occur while decoding a raw record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{probe} record too short: {size} bytes, need {need}")]
    Truncated {
        probe: ProbeKind,
        size: usize,
        need: usize,
    },

    #[error("execve record has invalid phase discriminator {raw}")]
    InvalidPhase { raw: i32 },
}

/// Returns the fixed record size for a probe's layout.
pub const fn record_size(kind: ProbeKind) -> usize {
    match kind {
        ProbeKind::Execve => EXEC_RECORD_SIZE,
        ProbeKind::Readline => READLINE_RECORD_SIZE,
    }
}

/// Decode a raw record using the layout of `kind`.
///
/// Bytes past the layout size are ignored; ring buffers pad samples.
pub fn decode(kind: ProbeKind, data: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let need = record_size(kind);
    if data.len() < need {
        return Err(DecodeError::Truncated {
            probe: kind,
            size: data.len(),
            need,
        });
    }

    match kind {
        ProbeKind::Execve => decode_exec(data).map(DecodedEvent::Exec),
        ProbeKind::Readline => Ok(DecodedEvent::Readline(decode_readline(data))),
    }
}

/// Callers guarantee `data.len() >= EXEC_RECORD_SIZE`.
fn decode_exec(data: &[u8]) -> Result<ExecEvent, DecodeError> {
    let raw_phase = read_i32_ne(data, EXEC_PHASE_OFFSET);
    let phase = match PhaseType::from_i32(raw_phase) {
        Some(PhaseType::Arg) => ExecPhase::Arg {
            argv: c_string(&data[EXEC_ARGV_OFFSET..EXEC_ARGV_OFFSET + ARG_LEN]),
        },
        Some(PhaseType::Ret) => ExecPhase::Ret {
            retval: read_i32_ne(data, EXEC_RETVAL_OFFSET),
        },
        None => return Err(DecodeError::InvalidPhase { raw: raw_phase }),
    };

    Ok(ExecEvent {
        pid: read_u64_ne(data, EXEC_PID_OFFSET),
        ppid: read_u64_ne(data, EXEC_PPID_OFFSET),
        comm: c_string(&data[EXEC_COMM_OFFSET..EXEC_COMM_OFFSET + COMM_LEN]),
        phase,
    })
}

/// Callers guarantee `data.len() >= READLINE_RECORD_SIZE`.
fn decode_readline(data: &[u8]) -> ReadlineEvent {
    ReadlineEvent {
        pid: read_u32_ne(data, READLINE_PID_OFFSET),
        line: c_string(&data[READLINE_LINE_OFFSET..READLINE_LINE_OFFSET + LINE_LEN]),
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

/// Extract a NUL-terminated string from a fixed-capacity buffer.
///
/// Stops at the first NUL; without one the whole buffer is used. Bytes are
/// not validated, invalid UTF-8 sequences become U+FFFD.
pub fn c_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[offset..offset + N]);
    out
}

#[inline(always)]
fn read_u32_ne(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_i32_ne(data: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_ne(data: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(read_fixed::<8>(data, offset))
}
