use crate::error::{LaunchError, Result};
use crate::parse::FrontendParams;
use std::collections::BTreeMap;

/// Suffix of the instrumented build of the configured executable. The bare
/// name is never executed.
pub const INSTRUMENTED_SUFFIX: &str = ".addstrinst";

/// What to run: program, full argument vector (argv[0] included), and the
/// environment overrides applied on top of the parent's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// `argv[0]` is set to the executable itself.
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let executable = executable.into();
        let mut argv = vec![executable.clone()];
        argv.extend(args.into_iter().map(Into::into));
        LaunchSpec { executable, argv, env: BTreeMap::new() }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /*
        @@@
        @from_params();
        . Refuses an empty executable before anything else happens.
        . Appends the instrumentation suffix and collects apparg0..appargcount-1 in order.
    */
    pub fn from_params(params: &FrontendParams) -> Result<Self> {
        if params.executable.is_empty() {
            return Err(LaunchError::MissingExecutable);
        }
        let executable = format!("{}{}", params.executable, INSTRUMENTED_SUFFIX);
        let mut spec = LaunchSpec::new(executable, params.app_args());
        spec.env = params.appenv.clone().into_iter().collect();
        Ok(spec)
    }

    /// Space-joined argv, for log lines only.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Where a redirected stream goes and whether existing content is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub path: String,
    pub append: bool,
}

/// Standard stream wiring for the child. `None` inherits the parent's stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectSpec {
    pub stdin: Option<String>,
    pub stdout: Option<OutputTarget>,
    pub stderr: Option<OutputTarget>,
}

impl RedirectSpec {
    pub fn from_params(params: &FrontendParams) -> Self {
        let output = |path: &str, append: u32| {
            non_empty(path).map(|path| OutputTarget { path, append: append != 0 })
        };
        RedirectSpec {
            stdin: non_empty(&params.appstdin),
            stdout: output(&params.appstdout, params.appstdoutappend),
            stderr: output(&params.appstderr, params.appstderrappend),
        }
    }

    pub fn is_inherit(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

fn non_empty(path: &str) -> Option<String> {
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}
