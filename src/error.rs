use crate::status::ChildStatus;
use nix::errno::Errno;
use std::time::Duration;
use thiserror::Error;

fn errno_code(errno: &Errno) -> i32 {
    *errno as i32
}

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Failures of the traced-program launch protocol.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("the input deck did not specify an executable to be run")]
    MissingExecutable,

    #[error("fork failed to launch the traced process: errno = {}, errstr = {}", errno_code(.0), .0.desc())]
    Fork(Errno),

    #[error("launching trace child failed: {0}")]
    EarlyExit(ChildStatus),

    #[error("waitpid returned an error, errno = {}; did the child ever even start?", errno_code(.0))]
    Wait(Errno),

    #[error("traced program did not attach within {0:?}")]
    AttachTimeout(Duration),

    #[error("wait for the traced program to attach was cancelled")]
    AttachCancelled,

    #[error("handshake channel error: {0}")]
    Tunnel(#[from] std::io::Error),

    #[error("a traced child was already started (pid {0})")]
    AlreadyStarted(i32),

    #[error("argument contains an interior NUL byte: {0:?}")]
    InvalidArgument(String),
}

/// Bad input to the rank-placement tool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("<nprocs> must be positive (got {0})")]
    NonPositiveRanks(i64),

    #[error("<tracerank> must be in [0,{total}) (got {rank})")]
    TracedRankOutOfRange { rank: i64, total: i64 },

    #[error("{name} is not a number: {value:?}")]
    NotANumber { name: &'static str, value: String },

    #[error("missing `--` between the tool invocation and the program invocation")]
    MissingSeparator,

    #[error("no tool invocation before `--`")]
    EmptyTool,

    #[error("no program invocation after `--`")]
    EmptyProgram,
}
