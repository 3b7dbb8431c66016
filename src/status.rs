use nix::sys::wait::WaitStatus;
use std::fmt;

/// Decoded outcome of a `waitpid` poll on a launched child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    ExitedWithCode(i32),
    KilledBySignal { signal: i32, core_dumped: bool },
    StoppedBySignal(i32),
    Unknown(String),
}

impl ChildStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ChildStatus::Running)
    }

    /// True only for a clean `exit(0)`.
    pub fn is_success(&self) -> bool {
        matches!(self, ChildStatus::ExitedWithCode(0))
    }

    /// Whether the poll that produced this status reaped the process.
    pub fn is_reaped(&self) -> bool {
        matches!(self, ChildStatus::ExitedWithCode(_) | ChildStatus::KilledBySignal { .. })
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildStatus::Running => write!(f, "child is still running"),
            ChildStatus::ExitedWithCode(code) => write!(f, "child exited with status {}", code),
            ChildStatus::KilledBySignal { signal, core_dumped } => write!(
                f,
                "child terminated with signal {}; core dump file created = {}",
                signal, core_dumped
            ),
            ChildStatus::StoppedBySignal(signal) => write!(f, "child stopped with signal {}", signal),
            ChildStatus::Unknown(raw) => write!(f, "unknown problem; status = {}", raw),
        }
    }
}

/*
    @@@
    @decode();
    . Single place where a raw wait status is turned into a ChildStatus.
    . StillAlive maps to Running; continued and ptrace stops have no launch meaning and land in Unknown.
*/
pub fn decode(status: WaitStatus) -> ChildStatus {
    match status {
        WaitStatus::StillAlive => ChildStatus::Running,
        WaitStatus::Exited(_, code) => ChildStatus::ExitedWithCode(code),
        WaitStatus::Signaled(_, sig, core_dumped) => ChildStatus::KilledBySignal {
            signal: sig as i32,
            core_dumped,
        },
        WaitStatus::Stopped(_, sig) => ChildStatus::StoppedBySignal(sig as i32),
        other => ChildStatus::Unknown(format!("{:?}", other)),
    }
}
