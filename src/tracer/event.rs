use std::fmt;

use serde::Deserialize;

/// ProbeKind selects which kernel program is attached and therefore which
/// record layout the decoder applies. Exactly one is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// kprobe + kretprobe on the execve syscall.
    #[default]
    Execve,
    /// uretprobe on `readline` in a shell binary or library.
    Readline,
}

impl ProbeKind {
    /// Returns the canonical config/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execve => "execve",
            Self::Readline => "readline",
        }
    }

    /// Parse from a config label name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "execve" => Some(Self::Execve),
            "readline" => Some(Self::Readline),
            _ => None,
        }
    }

    /// Return all probe kinds.
    pub fn all() -> &'static [ProbeKind] {
        &[Self::Execve, Self::Readline]
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exec record discriminator. Values must match `enum event_type` in
/// `bpf/snoopd.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PhaseType {
    Arg = 0,
    Ret = 1,
}

impl PhaseType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Arg),
            1 => Some(Self::Ret),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Arg => "arg",
            Self::Ret => "ret",
        }
    }
}

impl fmt::Display for PhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an exec record, selected by its phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecPhase {
    /// One fragment of the command line: the executable path, a single
    /// argument, or the `"..."` marker once `max_args` is exceeded.
    Arg { argv: String },
    /// Return code observed by the kretprobe.
    Ret { retval: i32 },
}

impl ExecPhase {
    pub fn phase_type(&self) -> PhaseType {
        match self {
            Self::Arg { .. } => PhaseType::Arg,
            Self::Ret { .. } => PhaseType::Ret,
        }
    }
}

/// execve probe event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    /// Userspace PID (kernel tgid).
    pub pid: u64,
    /// Parent userspace PID. Zero when the kernel could not provide it.
    pub ppid: u64,
    /// Task command name (`TASK_COMM_LEN` bytes at most).
    pub comm: String,
    pub phase: ExecPhase,
}

/// readline uretprobe event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadlineEvent {
    pub pid: u32,
    pub line: String,
}

/// A fully decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    Exec(ExecEvent),
    Readline(ReadlineEvent),
}

impl DecodedEvent {
    /// The probe that produced this event.
    pub fn kind(&self) -> ProbeKind {
        match self {
            Self::Exec(_) => ProbeKind::Execve,
            Self::Readline(_) => ProbeKind::Readline,
        }
    }

    /// PID of the process that triggered the probe.
    pub fn pid(&self) -> u64 {
        match self {
            Self::Exec(e) => e.pid,
            Self::Readline(e) => u64::from(e.pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_kind_from_name() {
        for kind in ProbeKind::all() {
            assert_eq!(ProbeKind::from_name(kind.as_str()), Some(*kind));
        }
        assert_eq!(ProbeKind::from_name("kprobe"), None);
        assert_eq!(ProbeKind::from_name(""), None);
    }

    #[test]
    fn test_probe_kind_default_is_execve() {
        assert_eq!(ProbeKind::default(), ProbeKind::Execve);
        assert_eq!(ProbeKind::Readline.to_string(), "readline");
    }

    #[test]
    fn test_phase_type_from_i32() {
        assert_eq!(PhaseType::from_i32(0), Some(PhaseType::Arg));
        assert_eq!(PhaseType::from_i32(1), Some(PhaseType::Ret));
        assert_eq!(PhaseType::from_i32(2), None);
        assert_eq!(PhaseType::from_i32(-1), None);
    }

    #[test]
    fn test_exec_phase_type() {
        let arg = ExecPhase::Arg {
            argv: "/bin/ls".to_string(),
        };
        assert_eq!(arg.phase_type(), PhaseType::Arg);
        assert_eq!(ExecPhase::Ret { retval: -2 }.phase_type(), PhaseType::Ret);
    }

    #[test]
    fn test_decoded_event_accessors() {
        let ev = DecodedEvent::Readline(ReadlineEvent {
            pid: 42,
            line: "ls".to_string(),
        });
        assert_eq!(ev.kind(), ProbeKind::Readline);
        assert_eq!(ev.pid(), 42);
    }
}
