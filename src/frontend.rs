use crate::control::{ChildSlot, ProcessSupervisor};
use crate::error::{LaunchError, Result};
use crate::launch_spec::{LaunchSpec, RedirectSpec};
use crate::launcher::{LaunchOptions, OsSpawner, RunMode};
use crate::parse::FrontendParams;
use crate::status::ChildStatus;
use crate::tunnel::{AttachCancel, FileTunnel, Tunnel};
use nix::unistd::Pid;
use tracing::info;

/// Host-facing side of the traced-program launcher. Mirrors the host's
/// component hooks: construct, `init`, `finish`, `emergency_shutdown`.
pub struct EpaFrontend {
    spec: LaunchSpec,
    redirect: RedirectSpec,
    options: LaunchOptions,
    supervisor: ProcessSupervisor,
    attach_cancel: AttachCancel,
}

impl EpaFrontend {
    /*
        @@@
        @new();
        . Builds the launch and redirect descriptions from the parameters (missing executable fails here).
        . Creates the handshake tunnel sized for `corecount` participants before any fork can happen.
    */
    pub fn new(owner_id: &str, params: &FrontendParams, run_mode: RunMode) -> Result<Self> {
        let spec = LaunchSpec::from_params(params)?;
        let redirect = RedirectSpec::from_params(params);
        info!(
            executable = %spec.executable,
            args = spec.argv.len() - 1,
            "model specifies the traced application"
        );

        let tunnel = FileTunnel::create(owner_id, params.corecount, params.maxcorequeue)?
            .with_attach_timeout(params.attach_timeout());
        info!(tunnel = %tunnel.name(), "base pipe name");
        let attach_cancel = tunnel.attach_cancel();

        Ok(EpaFrontend {
            spec,
            redirect,
            options: LaunchOptions { run_mode, start_grace: params.start_grace() },
            supervisor: ProcessSupervisor::new(Box::new(tunnel)),
            attach_cancel,
        })
    }

    /// Phase 0 launches the child and blocks until it attaches. Later
    /// phases do nothing.
    pub fn init(&mut self, phase: u32) -> Result<Option<Pid>> {
        if phase != 0 {
            return Ok(self.supervisor.pid());
        }
        if self.attach_cancel.is_cancelled() {
            return Err(LaunchError::AttachCancelled);
        }
        let pid = self.supervisor.start(&OsSpawner, &self.spec, &self.redirect, &self.options)?;
        if pid.is_some() {
            info!("waiting for child to attach");
            self.supervisor.wait_for_attach()?;
            info!("child has attached");
        }
        Ok(pid)
    }

    /// A simulation that ended early may leave the child running.
    pub fn finish(&mut self) {
        self.supervisor.shutdown();
    }

    pub fn emergency_shutdown(&mut self) {
        self.supervisor.emergency_shutdown();
    }

    pub fn poll_exit(&mut self) -> Option<ChildStatus> {
        self.supervisor.poll_exit()
    }

    /// Lets another thread abandon an `init` that is waiting for the attach.
    pub fn attach_cancel(&self) -> AttachCancel {
        self.attach_cancel.clone()
    }

    pub fn child_slot(&self) -> ChildSlot {
        self.supervisor.child_slot()
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.spec
    }
}
