use crate::command::{build, local_hostname, Invocation, Placement, TOOL_SEPARATOR};
use crate::control::ChildSlot;
use crate::error::ArgumentError;
use crate::launcher::{spawn_command, OsSpawner, ProcessSpawner};
use crate::placement::plan;
use crate::status::{decode, ChildStatus};
use futures::stream::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{error, info, warn};

/// Exit status when the job could not be forked.
pub const EXIT_FORK_FAILED: i32 = -1;
pub const EXIT_USAGE: i32 = 1;

/// How the launcher process looks after the `mpirun` child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// Block until the child exits and report how it ended.
    Wait,
    /// Like `Wait`, but SIGTERM/SIGINT sent to the launcher are passed on to
    /// the child before the launcher exits.
    ForwardSignals,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MpiCli {
    pub total_ranks: i64,
    pub traced_rank: i64,
    pub invocation: Invocation,
}

pub fn usage(prog: &str) -> String {
    format!(
        "Usage: {} <nprocs> <tracerank> <pin-binary> [pin args] -- <program-binary> [program args]",
        prog
    )
}

fn number(name: &'static str, value: &str) -> Result<i64, ArgumentError> {
    value
        .trim()
        .parse()
        .map_err(|_| ArgumentError::NotANumber { name, value: value.to_string() })
}

/*
    @@@
    @parse_args();
    . Ok(None) asks for the usage text: too few arguments, or -H in first position.
    . Everything after the two numbers is split at the first `--` into the tool and the program it runs.
*/
pub fn parse_args(args: &[String]) -> Result<Option<MpiCli>, ArgumentError> {
    if args.len() < 4 || args[1] == "-H" {
        return Ok(None);
    }
    let total_ranks = number("<nprocs>", &args[1])?;
    let traced_rank = number("<tracerank>", &args[2])?;

    let rest = &args[3..];
    let split = rest
        .iter()
        .position(|a| a == TOOL_SEPARATOR)
        .ok_or(ArgumentError::MissingSeparator)?;
    let tool = rest[..split].to_vec();
    let program = rest[split + 1..].to_vec();
    if tool.is_empty() {
        return Err(ArgumentError::EmptyTool);
    }
    if program.is_empty() {
        return Err(ArgumentError::EmptyProgram);
    }

    Ok(Some(MpiCli { total_ranks, traced_rank, invocation: Invocation { tool, program } }))
}

/// Entry point shared by the launcher binaries. Returns the process exit code.
pub fn run(args: &[String], placement: Placement, supervision: Supervision) -> i32 {
    let prog = args.first().map(String::as_str).unwrap_or("mpilauncher");

    let placed = parse_args(args).and_then(|cli| match cli {
        Some(cli) => plan(cli.total_ranks, cli.traced_rank).map(|p| Some((cli, p))),
        None => Ok(None),
    });
    let (cli, rank_plan) = match placed {
        Ok(Some(placed)) => placed,
        Ok(None) => {
            println!("{}", usage(prog));
            return EXIT_USAGE;
        }
        Err(e) => {
            println!("Error: {}: {}", prog, e);
            println!("{}", usage(prog));
            return EXIT_USAGE;
        }
    };

    let host = local_hostname();
    let command = build(&rank_plan, &cli.invocation, &host, placement);
    info!(
        host = %host,
        ranks_before = rank_plan.ranks_before,
        ranks_after = rank_plan.ranks_after,
        command = %command.command_line(),
        "MPI command"
    );

    let argv = command.argv();
    match supervision {
        Supervision::Wait => run_and_wait(&OsSpawner, &argv),
        Supervision::ForwardSignals => run_forwarding_signals(&argv),
    }
}

/// Fork/exec `argv`, block until it exits, and warn if it did not end cleanly.
pub fn run_and_wait<S: ProcessSpawner + ?Sized>(spawner: &S, argv: &[String]) -> i32 {
    let slot = ChildSlot::new();
    match spawn_command(spawner, argv, &slot) {
        Ok(pid) => {
            if let Some(status) = wait_for_exit(pid) {
                report_exit(&status);
            }
            0
        }
        Err(e) => {
            error!(error = %e, "could not start the MPI job");
            EXIT_FORK_FAILED
        }
    }
}

/*
    @@@
    @run_forwarding_signals();
    . Signal handlers go in before the fork so a SIGTERM can never arrive with nobody to forward it.
    . Whichever comes first wins: a signal (forwarded, then exit without waiting) or the child's own exit.
*/
pub fn run_forwarding_signals(argv: &[String]) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return EXIT_FORK_FAILED;
        }
    };
    let code = runtime.block_on(forward_until_exit(&OsSpawner, argv));
    // The blocking waitpid may still be parked on a child we just signalled.
    runtime.shutdown_background();
    code
}

async fn forward_until_exit<S: ProcessSpawner + ?Sized>(spawner: &S, argv: &[String]) -> i32 {
    let mut signals = match Signals::new([SIGTERM, SIGINT]) {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "failed to install signal handlers");
            return EXIT_FORK_FAILED;
        }
    };
    let handle = signals.handle();

    let slot = ChildSlot::new();
    let pid = match spawn_command(spawner, argv, &slot) {
        Ok(pid) => pid,
        Err(e) => {
            error!(error = %e, "could not start the MPI job");
            handle.close();
            return EXIT_FORK_FAILED;
        }
    };

    let mut waiter = tokio::task::spawn_blocking(move || wait_for_exit(pid));
    tokio::select! {
        Some(signum) = signals.next() => {
            info!(signal = signum, "caught signal, exiting");
            forward_signal(&slot, signum);
        }
        joined = &mut waiter => {
            match joined {
                Ok(Some(status)) => report_exit(&status),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "child wait task failed"),
            }
        }
    }
    handle.close();
    0
}

/// Sends `signum` to the child recorded in `slot`, if any.
pub fn forward_signal(slot: &ChildSlot, signum: i32) {
    let Some(pid) = slot.pid() else {
        return;
    };
    match Signal::try_from(signum) {
        Ok(sig) => {
            if let Err(e) = kill(pid, sig) {
                warn!(pid = pid.as_raw(), signal = ?sig, error = %e, "failed to forward signal");
            }
        }
        Err(e) => warn!(signal = signum, error = %e, "not a forwardable signal"),
    }
}

fn wait_for_exit(pid: Pid) -> Option<ChildStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(raw) => {
                let status = decode(raw);
                if status.is_reaped() {
                    return Some(status);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "waitpid failed");
                return None;
            }
        }
    }
}

fn report_exit(status: &ChildStatus) {
    match status {
        s if s.is_success() => info!("forked process exited cleanly"),
        ChildStatus::ExitedWithCode(code) => warn!(code, "forked process has non-zero exit code"),
        other => warn!(status = %other, "forked process did not exit normally"),
    }
}
