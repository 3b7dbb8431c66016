use crate::control::ChildSlot;
use crate::error::{LaunchError, Result};
use crate::launch_spec::{LaunchSpec, RedirectSpec};
use crate::status::decode;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::libc::{self, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{close, dup2, execvp, write, ForkResult, Pid};
use std::collections::BTreeMap;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, info};

/// Tracing-mode flag read by the instrumented binary.
pub const ENV_CACHE_SIMULATION: &str = "METASIM_CACHE_SIMULATION";
/// Tells the instrumented binary it runs under this frontend.
pub const ENV_ARIEL_FRONTEND: &str = "METASIM_ARIEL_FRONTEND";
/// Name of the handshake tunnel the instrumented binary attaches to.
pub const ENV_SST_SHMEM: &str = "METASIM_SST_SHMEM";

pub const DEFAULT_START_GRACE: Duration = Duration::from_secs(1);

/// Exit status of a child whose stream redirection failed.
pub const EXIT_SETUP_FAILED: i32 = 1;
/// Exit status of a child whose exec call returned.
///
/// The parent only sees this as `EarlyExit(ExitedWithCode(127))`; the exec
/// errno goes to the child's stderr. A traced program that itself exits 127
/// inside the grace window looks the same, so check that stream first.
pub const EXIT_EXEC_FAILED: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Run,
    /// The host only initializes; nothing is forked.
    InitOnly,
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub run_mode: RunMode,
    pub start_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        LaunchOptions { run_mode: RunMode::Run, start_grace: DEFAULT_START_GRACE }
    }
}

/// Seam over `fork` so a refused fork can be exercised without exhausting
/// the process table.
pub trait ProcessSpawner {
    /// # Safety
    /// Same contract as [`nix::unistd::fork`].
    unsafe fn fork(&self) -> nix::Result<ForkResult>;
}

pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    unsafe fn fork(&self) -> nix::Result<ForkResult> {
        nix::unistd::fork()
    }
}

struct PreparedRedirect {
    stream: &'static str,
    path: CString,
    flags: OFlag,
    target: RawFd,
}

/// Everything the child branch needs, built before forking.
struct PreparedExec {
    program: CString,
    argv: Vec<CString>,
    /// Full environment block; `None` inherits the parent's.
    envp: Option<Vec<CString>>,
    overrides: Vec<(String, String)>,
    redirects: Vec<PreparedRedirect>,
    trace_parent: bool,
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| LaunchError::InvalidArgument(s.to_string()))
}

impl PreparedExec {
    fn traced(spec: &LaunchSpec, redirect: &RedirectSpec, handshake_name: &str) -> Result<Self> {
        let mut overrides: Vec<(String, String)> =
            spec.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        overrides.push((ENV_CACHE_SIMULATION.to_string(), "0".to_string()));
        overrides.push((ENV_ARIEL_FRONTEND.to_string(), "1".to_string()));
        overrides.push((ENV_SST_SHMEM.to_string(), handshake_name.to_string()));

        let mut env: BTreeMap<OsString, OsString> = std::env::vars_os().collect();
        for (k, v) in &overrides {
            env.insert(OsString::from(k), OsString::from(v));
        }
        let mut envp = Vec::with_capacity(env.len());
        for (k, v) in &env {
            let mut entry = k.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            envp.push(
                CString::new(entry)
                    .map_err(|_| LaunchError::InvalidArgument(k.to_string_lossy().into_owned()))?,
            );
        }

        let mut redirects = Vec::new();
        if let Some(path) = &redirect.stdin {
            redirects.push(PreparedRedirect {
                stream: "stdin",
                path: c_string(path)?,
                flags: OFlag::O_RDONLY,
                target: STDIN_FILENO,
            });
        }
        for (stream, target, fd) in [
            ("stdout", &redirect.stdout, STDOUT_FILENO),
            ("stderr", &redirect.stderr, STDERR_FILENO),
        ] {
            if let Some(out) = target {
                let mode = if out.append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
                redirects.push(PreparedRedirect {
                    stream,
                    path: c_string(&out.path)?,
                    flags: OFlag::O_WRONLY | OFlag::O_CREAT | mode,
                    target: fd,
                });
            }
        }

        Ok(PreparedExec {
            program: c_string(&spec.executable)?,
            argv: spec.argv.iter().map(|a| c_string(a)).collect::<Result<_>>()?,
            envp: Some(envp),
            overrides,
            redirects,
            trace_parent: true,
        })
    }

    fn plain(argv: &[String]) -> Result<Self> {
        let program = argv.first().ok_or_else(|| LaunchError::InvalidArgument(String::new()))?;
        Ok(PreparedExec {
            program: c_string(program)?,
            argv: argv.iter().map(|a| c_string(a)).collect::<Result<_>>()?,
            envp: None,
            overrides: Vec::new(),
            redirects: Vec::new(),
            trace_parent: false,
        })
    }
}

/*
    @@@
    @launch();
    . Returns Ok(None) without forking when the host only initializes.
    . Forks; the parent records the pid into the slot before anything else, then runs the grace check.
    . The child redirects its streams, exports the handshake variables, and execs. It never returns.
*/
pub fn launch<S: ProcessSpawner + ?Sized>(
    spawner: &S,
    spec: &LaunchSpec,
    redirect: &RedirectSpec,
    handshake_name: &str,
    options: &LaunchOptions,
    slot: &ChildSlot,
) -> Result<Option<Pid>> {
    if options.run_mode == RunMode::InitOnly {
        info!("init-only run mode, traced program is not forked");
        return Ok(None);
    }
    if spec.executable.is_empty() {
        return Err(LaunchError::MissingExecutable);
    }

    info!(command = %spec.command_line(), "executing command");
    let prepared = PreparedExec::traced(spec, redirect, handshake_name)?;
    if redirect.is_inherit() {
        debug!("child inherits the parent's standard streams");
    }
    for r in &prepared.redirects {
        debug!(stream = r.stream, path = %r.path.to_string_lossy(), "redirecting child stream");
    }
    for (k, v) in &prepared.overrides {
        debug!(key = %k, value = %v, "child environment");
    }

    match unsafe { spawner.fork() } {
        Err(errno) => {
            error!(errno = errno as i32, error = %errno.desc(), "fork failed");
            Err(LaunchError::Fork(errno))
        }
        Ok(ForkResult::Child) => exec_child(&prepared),
        Ok(ForkResult::Parent { child }) => {
            slot.record(child);
            info!(pid = child.as_raw(), program = %spec.executable, "spawned traced child");
            check_started(child, options.start_grace, slot).map(Some)
        }
    }
}

/// Fork and exec `argv` with the parent's streams and environment. The pid
/// is recorded into `slot` before returning.
pub fn spawn_command<S: ProcessSpawner + ?Sized>(spawner: &S, argv: &[String], slot: &ChildSlot) -> Result<Pid> {
    let prepared = PreparedExec::plain(argv)?;
    match unsafe { spawner.fork() } {
        Err(errno) => {
            error!(errno = errno as i32, error = %errno.desc(), "fork failed");
            Err(LaunchError::Fork(errno))
        }
        Ok(ForkResult::Child) => exec_child(&prepared),
        Ok(ForkResult::Parent { child }) => {
            slot.record(child);
            info!(pid = child.as_raw(), program = %argv[0], "spawned child");
            Ok(child)
        }
    }
}

/*
    @@@
    @check_started();
    . Sleeps through the grace window, then polls the child once without blocking.
    . Any exit, kill, or stop inside the window is a launch failure; a reaped child is dropped from the slot.
*/
fn check_started(child: Pid, grace: Duration, slot: &ChildSlot) -> Result<Pid> {
    std::thread::sleep(grace);

    let status = match waitpid(child, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
        Ok(raw) => decode(raw),
        Err(errno) => {
            error!(pid = child.as_raw(), errno = errno as i32, "waitpid failed during startup check");
            return Err(LaunchError::Wait(errno));
        }
    };

    if status.is_running() {
        return Ok(child);
    }
    if status.is_reaped() {
        slot.clear();
    }
    error!(pid = child.as_raw(), status = %status, "launching trace child failed");
    Err(LaunchError::EarlyExit(status))
}

fn exec_child(prepared: &PreparedExec) -> ! {
    for r in &prepared.redirects {
        if let Err(errno) = redirect_stream(r) {
            fail_child(
                &[
                    b"Error: failed to redirect ",
                    r.stream.as_bytes(),
                    b" to ",
                    r.path.as_bytes(),
                    b": ",
                    errno.desc().as_bytes(),
                    b"\n",
                ],
                EXIT_SETUP_FAILED,
            );
        }
    }

    if prepared.trace_parent {
        allow_parent_tracer();
    }

    let errno = exec(prepared);
    fail_child(
        &[b"Error: error executing ", prepared.program.as_bytes(), b": ", errno.desc().as_bytes(), b"\n"],
        EXIT_EXEC_FAILED,
    )
}

fn redirect_stream(r: &PreparedRedirect) -> nix::Result<()> {
    let fd = open(r.path.as_c_str(), r.flags, Mode::from_bits_truncate(0o644))?;
    if fd != r.target {
        dup2(fd, r.target)?;
        close(fd)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn allow_parent_tracer() {
    let parent = nix::unistd::getppid().as_raw() as libc::c_ulong;
    // Unsupported kernels reject the option; the child runs untraced then.
    unsafe {
        libc::prctl(libc::PR_SET_PTRACER, parent, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong);
    }
}

#[cfg(not(target_os = "linux"))]
fn allow_parent_tracer() {}

#[cfg(target_os = "linux")]
fn exec(prepared: &PreparedExec) -> Errno {
    let result = match &prepared.envp {
        Some(envp) => nix::unistd::execvpe(&prepared.program, &prepared.argv, envp),
        None => execvp(&prepared.program, &prepared.argv),
    };
    match result {
        Ok(never) => match never {},
        Err(errno) => errno,
    }
}

#[cfg(not(target_os = "linux"))]
fn exec(prepared: &PreparedExec) -> Errno {
    for (k, v) in &prepared.overrides {
        std::env::set_var(k, v);
    }
    match execvp(&prepared.program, &prepared.argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    }
}

/// Raw writes only: the parent may have had other threads at fork time.
fn fail_child(parts: &[&[u8]], code: i32) -> ! {
    let stderr = unsafe { BorrowedFd::borrow_raw(STDERR_FILENO) };
    for part in parts {
        let _ = write(stderr, part);
    }
    unsafe { libc::_exit(code) }
}
