//! Pins the traced rank to this host and leaves the other ranks to the MPI
//! allocation. SIGTERM/SIGINT are forwarded to the job so killing the
//! launcher never orphans it.

use epa_launcher::command::Placement;
use epa_launcher::logger::console_tracing;
use epa_launcher::mpi::{run, Supervision};

fn main() -> anyhow::Result<()> {
    console_tracing(0)?;
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(run(&args, Placement::Allocation, Supervision::ForwardSignals));
}
