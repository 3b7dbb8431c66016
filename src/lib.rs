/* src/lib.rs */

// Re-export modules for the binaries and tests
pub mod command;
pub mod control;
pub mod error;
pub mod frontend;
pub mod launch_spec;
pub mod launcher;
pub mod logger;
pub mod mpi;
pub mod parse;
pub mod placement;
pub mod status;
pub mod tunnel;

pub use control::{ChildSlot, ChildState, ProcessSupervisor};
pub use error::{ArgumentError, LaunchError};
pub use launch_spec::{LaunchSpec, OutputTarget, RedirectSpec};
pub use launcher::{launch, LaunchOptions, OsSpawner, ProcessSpawner, RunMode};
pub use status::ChildStatus;
pub use tunnel::{AttachCancel, FileTunnel, Tunnel};
