use anyhow::{bail, Context};
use epa_launcher::frontend::EpaFrontend;
use epa_launcher::launcher::RunMode;
use epa_launcher::logger::logs_tracing;
use epa_launcher::mpi::forward_signal;
use epa_launcher::parse::parser;
use futures::stream::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGKILL, SIGTERM};
use signal_hook_tokio::Signals;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let (path, run_mode) = match args.as_slice() {
        [_, path] => (path.clone(), RunMode::Run),
        [_, path, flag] if flag == "--init-only" => (path.clone(), RunMode::InitOnly),
        _ => bail!("usage: epa-frontend <params.yml> [--init-only]"),
    };

    let params = parser(&path).with_context(|| format!("loading {}", path))?;
    let _guard = logs_tracing("logs", "epa-frontend.log", params.verbose)?;

    let mut signals = Signals::new([SIGTERM, SIGINT])?;
    let handle = signals.handle();

    let owner = format!("epa{}", std::process::id());
    let frontend = EpaFrontend::new(&owner, &params, run_mode)?;

    /*
        init() sleeps through the grace window and then blocks on the attach,
        so it runs off the runtime thread and a signal can still interrupt it.
        The slot already holds the pid during the grace sleep.
    */
    let slot = frontend.child_slot();
    let cancel = frontend.attach_cancel();
    let mut starting = tokio::task::spawn_blocking(move || {
        let mut frontend = frontend;
        let started = frontend.init(0);
        (frontend, started)
    });
    let (mut frontend, started) = tokio::select! {
        joined = &mut starting => joined?,
        Some(signum) = signals.next() => {
            warn!(signal = signum, "caught signal while starting traced child");
            cancel.cancel();
            forward_signal(&slot, SIGKILL);
            let (mut frontend, _) = starting.await?;
            frontend.emergency_shutdown();
            handle.close();
            std::process::exit(1);
        }
    };

    match started {
        Ok(Some(pid)) => info!(pid = pid.as_raw(), "traced child running"),
        Ok(None) => {
            info!("init-only run, nothing to supervise");
            frontend.finish();
            handle.close();
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "failed to start traced child");
            frontend.emergency_shutdown();
            handle.close();
            return Err(e.into());
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            Some(signum) = signals.next() => {
                warn!(signal = signum, "caught signal, shutting down traced child");
                frontend.emergency_shutdown();
                handle.close();
                std::process::exit(1);
            }
            _ = ticker.tick() => {
                if let Some(status) = frontend.poll_exit() {
                    info!(status = %status, "traced child finished");
                    break;
                }
            }
        }
    }

    frontend.finish();
    handle.close();
    Ok(())
}
