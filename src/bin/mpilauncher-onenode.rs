//! Runs every rank on the local host; one rank runs under the tracing tool.
//! Waits for the job and reports how it ended.

use epa_launcher::command::Placement;
use epa_launcher::logger::console_tracing;
use epa_launcher::mpi::{run, Supervision};

fn main() -> anyhow::Result<()> {
    console_tracing(0)?;
    let args: Vec<String> = std::env::args().collect();
    std::process::exit(run(&args, Placement::OneNode, Supervision::Wait));
}
