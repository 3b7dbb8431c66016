use crate::placement::RankPlacementPlan;
use tracing::warn;

pub const MPI_LAUNCHER: &str = "mpirun";
pub const LAUNCHER_FLAGS: &[&str] = &["--oversubscribe"];
/// Token `mpirun` uses between application contexts.
pub const GROUP_SEPARATOR: &str = ":";
/// Token between the tool's own arguments and the program it wraps.
pub const TOOL_SEPARATOR: &str = "--";

/// Where the untraced ranks are allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Every segment is pinned to the local host.
    OneNode,
    /// Only the traced rank is pinned locally; the allocator places the rest.
    Allocation,
}

/// The tool command line and the program command line it wraps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Vec<String>,
    pub program: Vec<String>,
}

impl Invocation {
    /// `tool... -- program...`
    pub fn traced(&self) -> Vec<String> {
        let mut tokens = self.tool.clone();
        tokens.push(TOOL_SEPARATOR.to_string());
        tokens.extend(self.program.iter().cloned());
        tokens
    }
}

/// One `[-H host] -np N <tokens>` clause of the job command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSegment {
    pub host: Option<String>,
    pub processes: u32,
    pub tokens: Vec<String>,
}

impl CommandSegment {
    fn push_tokens(&self, out: &mut Vec<String>) {
        if let Some(host) = &self.host {
            out.push("-H".to_string());
            out.push(host.clone());
        }
        out.push("-np".to_string());
        out.push(self.processes.to_string());
        out.extend(self.tokens.iter().cloned());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub segments: Vec<CommandSegment>,
}

impl LaunchCommand {
    /// The argument vector that is executed.
    pub fn argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = std::iter::once(MPI_LAUNCHER)
            .chain(LAUNCHER_FLAGS.iter().copied())
            .map(String::from)
            .collect();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                argv.push(GROUP_SEPARATOR.to_string());
            }
            segment.push_tokens(&mut argv);
        }
        argv
    }

    /// Space-joined form, for log lines only.
    pub fn command_line(&self) -> String {
        self.argv().join(" ")
    }
}

/*
    @@@
    @build();
    . Up to three segments: untraced ranks before, the traced rank under the tool, untraced ranks after.
    . Empty before/after groups are left out instead of being emitted with -np 0.
*/
pub fn build(plan: &RankPlacementPlan, invocation: &Invocation, host: &str, placement: Placement) -> LaunchCommand {
    let untraced_host = match placement {
        Placement::OneNode => Some(host.to_string()),
        Placement::Allocation => None,
    };
    let untraced = |processes: u32| CommandSegment {
        host: untraced_host.clone(),
        processes,
        tokens: invocation.program.clone(),
    };

    let mut segments = Vec::with_capacity(3);
    if plan.ranks_before > 0 {
        segments.push(untraced(plan.ranks_before));
    }
    segments.push(CommandSegment {
        host: Some(host.to_string()),
        processes: 1,
        tokens: invocation.traced(),
    });
    if plan.ranks_after > 0 {
        segments.push(untraced(plan.ranks_after));
    }
    LaunchCommand { segments }
}

/// Whitespace split. Tokens with embedded whitespace do not survive.
pub fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

/// Name of the host this process runs on.
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!(error = %e, "gethostname failed, using localhost");
            "localhost".to_string()
        }
    }
}
