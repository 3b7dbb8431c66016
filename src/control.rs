use crate::error::{LaunchError, Result};
use crate::launch_spec::{LaunchSpec, RedirectSpec};
use crate::launcher::{launch, LaunchOptions, ProcessSpawner};
use crate::status::{decode, ChildStatus};
use crate::tunnel::Tunnel;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pid of the supervised child, 0 while there is none.
///
/// A single atomic word: written by the launching flow, readable from
/// signal-forwarding code without locks.
#[derive(Debug, Clone, Default)]
pub struct ChildSlot(Arc<AtomicI32>);

impl ChildSlot {
    pub fn new() -> Self {
        ChildSlot::default()
    }

    pub fn record(&self, pid: Pid) {
        self.0.store(pid.as_raw(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Empties the slot, returning what it held.
    pub fn take(&self) -> Option<Pid> {
        match self.0.swap(0, Ordering::SeqCst) {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub fn raw(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<Pid> {
        match self.raw() {
            0 => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildState {
    NotStarted,
    Starting,
    Running,
    FailedEarly,
    Exited(ChildStatus),
    Killed,
}

/// Owns the traced child and its handshake tunnel for the host's lifetime.
pub struct ProcessSupervisor {
    slot: ChildSlot,
    tunnel: Option<Box<dyn Tunnel>>,
    state: ChildState,
}

impl ProcessSupervisor {
    pub fn new(tunnel: Box<dyn Tunnel>) -> Self {
        ProcessSupervisor { slot: ChildSlot::new(), tunnel: Some(tunnel), state: ChildState::NotStarted }
    }

    pub fn child_slot(&self) -> ChildSlot {
        self.slot.clone()
    }

    pub fn pid(&self) -> Option<Pid> {
        self.slot.pid()
    }

    pub fn state(&self) -> &ChildState {
        &self.state
    }

    pub fn handshake_name(&self) -> Option<&str> {
        self.tunnel.as_deref().map(|t| t.name())
    }

    /*
        @@@
        @start();
        . Launches the one child this supervisor will ever own; a second call is refused.
        . The pid lands in the shared slot from inside launch(), so a failed start can still be cleaned up by emergency_shutdown().
    */
    pub fn start<S: ProcessSpawner + ?Sized>(
        &mut self,
        spawner: &S,
        spec: &LaunchSpec,
        redirect: &RedirectSpec,
        options: &LaunchOptions,
    ) -> Result<Option<Pid>> {
        if self.state != ChildState::NotStarted {
            return Err(LaunchError::AlreadyStarted(self.slot.raw()));
        }
        let name = match self.tunnel.as_deref() {
            Some(t) => t.name().to_string(),
            None => {
                return Err(LaunchError::Tunnel(io::Error::new(
                    io::ErrorKind::NotFound,
                    "handshake tunnel already released",
                )))
            }
        };

        self.state = ChildState::Starting;
        match launch(spawner, spec, redirect, &name, options, &self.slot) {
            Ok(Some(pid)) => {
                self.state = ChildState::Running;
                Ok(Some(pid))
            }
            Ok(None) => {
                self.state = ChildState::NotStarted;
                Ok(None)
            }
            Err(e) => {
                self.state = ChildState::FailedEarly;
                Err(e)
            }
        }
    }

    /// Blocks until the child attaches to the tunnel.
    pub fn wait_for_attach(&self) -> Result<()> {
        match self.tunnel.as_deref() {
            Some(t) => t.wait_for_attach(),
            None => Err(LaunchError::Tunnel(io::Error::new(
                io::ErrorKind::NotFound,
                "handshake tunnel already released",
            ))),
        }
    }

    /// Non-blocking reap. Returns the status once the child is gone.
    pub fn poll_exit(&mut self) -> Option<ChildStatus> {
        let pid = self.slot.pid()?;
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(raw) => {
                let status = decode(raw);
                if !status.is_reaped() {
                    return None;
                }
                self.slot.clear();
                info!(pid = pid.as_raw(), status = %status, "traced child finished");
                self.state = ChildState::Exited(status.clone());
                Some(status)
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "waitpid failed while polling traced child");
                None
            }
        }
    }

    /// Normal teardown: kill a still-running child without waiting for it,
    /// then release the tunnel.
    pub fn shutdown(&mut self) {
        self.terminate("shutdown");
    }

    /// Failure-path teardown. Safe in every state, including before the
    /// child existed.
    pub fn emergency_shutdown(&mut self) {
        warn!(state = ?self.state, "emergency shutdown of traced child");
        self.terminate("emergency");
    }

    fn terminate(&mut self, reason: &'static str) {
        // pid 0 would signal our whole process group.
        match self.slot.take() {
            Some(pid) => {
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) => info!(pid = pid.as_raw(), reason, "sent SIGKILL to traced child"),
                    Err(e) => warn!(pid = pid.as_raw(), reason, error = %e, "failed to SIGKILL traced child"),
                }
                self.state = ChildState::Killed;
            }
            None => debug!(reason, "no child process to signal"),
        }
        self.release_tunnel();
    }

    fn release_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.release();
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.release_tunnel();
    }
}
