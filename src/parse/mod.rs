use serde::Deserialize;
use std::{collections::HashMap, fs, time::Duration};
use thiserror::Error;

fn default_corecount() -> u32 { 1 }
fn default_maxcorequeue() -> u32 { 64 }
fn default_startgrace() -> u64 { 1000 }

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Host parameters for the traced-program frontend, one flat key per
/// parameter. `apparg<N>` entries are picked up from `extra`.
#[derive(Debug, Deserialize, Clone)]
pub struct FrontendParams {
    #[serde(default)]
    pub verbose: u32,
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub appstdin: String,
    #[serde(default)]
    pub appstdout: String,
    #[serde(default)]
    pub appstderr: String,
    #[serde(default)]
    pub appstdoutappend: u32,
    #[serde(default)]
    pub appstderrappend: u32,
    #[serde(default)]
    pub appargcount: u32,
    #[serde(default)]
    pub appenv: HashMap<String, String>,
    #[serde(default = "default_corecount")]
    pub corecount: u32,
    #[serde(default = "default_maxcorequeue")]
    pub maxcorequeue: u32,
    /// Seconds; absent means wait for the child forever.
    #[serde(default)]
    pub attachtimeout: Option<u64>,
    /// Milliseconds the launcher waits before checking the child survived.
    #[serde(default = "default_startgrace")]
    pub startgrace: u64,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl FrontendParams {
    /// `apparg0..appargcount-1` in order; a missing entry is an empty string.
    pub fn app_args(&self) -> Vec<String> {
        (0..self.appargcount)
            .map(|i| {
                let key = format!("apparg{}", i);
                let value = self.extra.get(&key).map(scalar_to_string).unwrap_or_default();
                tracing::debug!(arg = i, key = %key, value = %value, "found application argument");
                value
            })
            .collect()
    }

    pub fn attach_timeout(&self) -> Option<Duration> {
        self.attachtimeout.map(Duration::from_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.startgrace)
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim_end().to_string(),
    }
}

pub fn parse_str(yaml: &str) -> Result<FrontendParams, ParamsError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/*
    @@@
    @parser();
    . Reads the parameter file into a String; I/O errors are returned as ParamsError::Io.
    . Hands the raw YAML to serde_yaml; unknown keys are kept in `extra` so apparg<N> can be found later.
*/
pub fn parser(path: &str) -> Result<FrontendParams, ParamsError> {
    let yaml_file = fs::read_to_string(path)?;
    parse_str(&yaml_file)
}
