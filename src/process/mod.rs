//! Process-group lifecycle: validation, spawn, and reaping.
//!
//! A process group is one running parallel job: a daemonized leader
//! process (the job launcher) plus the partition it occupies. The manager
//! tracks leaders by pid, collects their exit statuses with a non-blocking
//! reaper, and removes finished groups only through an explicit `wait`.

mod manager;
mod spawn;

pub use manager::{ProcessGroupManager, ProcessGroupSnapshot};
pub use spawn::{install_subreaper, parse_signal, reap_exited};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TorusError};

/// Fields a client must supply in an add spec.
pub const REQUIRED_FIELDS: &[&str] = &["user", "executable", "args", "location", "size", "cwd"];

/// Where a process group is in its spawn lifecycle.
///
/// `Spawning` covers construction up to the double-fork; `Daemonized`
/// means the leader pid is known and the job is detached; `Exited` means
/// the reaper has captured an exit status (or the start failed outright).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnState {
    Spawning,
    Daemonized,
    Exited,
}

/// One parallel job execution.
///
/// Also the wire form: `get`/`wait`/`signal` return these records, and
/// filters run over their serialized fields. `exit_status` stays null
/// until the reaper collects the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGroup {
    pub id: u64,
    /// Owning job id, supplied by the queue manager so it can find its
    /// own groups again. Opaque here.
    pub jobid: Option<u64>,
    pub user: String,
    pub location: Vec<String>,
    pub size: u64,
    pub cwd: String,
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mode: String,
    pub kernel_options: Option<String>,
    pub true_launch_args: Option<Vec<String>>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub head_pid: Option<i32>,
    pub exit_status: Option<i32>,
    pub spawn_state: SpawnState,
}

impl ProcessGroup {
    fn from_spec(id: u64, spec: ProcessGroupSpec) -> Self {
        Self {
            id,
            jobid: spec.jobid,
            user: spec.user.unwrap_or_default(),
            location: spec.location.unwrap_or_default(),
            size: spec.size.unwrap_or_default(),
            cwd: spec.cwd.unwrap_or_default(),
            executable: spec.executable.unwrap_or_default(),
            args: spec.args.unwrap_or_default(),
            env: spec.env,
            mode: spec.mode.unwrap_or_else(|| "co".to_string()),
            kernel_options: spec.kernel_options,
            true_launch_args: spec.true_launch_args,
            stdin: spec.stdin,
            stdout: spec.stdout,
            stderr: spec.stderr,
            head_pid: None,
            exit_status: None,
            spawn_state: SpawnState::Spawning,
        }
    }
}

/// Client-supplied add spec, before id assignment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessGroupSpec {
    pub id: Option<Value>,
    pub jobid: Option<u64>,
    pub user: Option<String>,
    pub location: Option<Vec<String>>,
    pub size: Option<u64>,
    pub cwd: Option<String>,
    pub executable: Option<String>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub mode: Option<String>,
    pub kernel_options: Option<String>,
    pub true_launch_args: Option<Vec<String>>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl ProcessGroupSpec {
    /// Parse and validate one add spec.
    ///
    /// Ids are assigned server-side; a client-supplied id other than the
    /// `"*"` placeholder is rejected.
    ///
    /// # Errors
    ///
    /// Returns a creation error naming the problem: a forged id, an
    /// undecodable spec, missing required fields, or an empty location.
    pub fn parse(spec: &Map<String, Value>) -> Result<Self> {
        if let Some(id) = spec.get("id") {
            if id.as_str() != Some("*") {
                return Err(TorusError::Creation("cannot specify an id".to_string()));
            }
        }
        let parsed: ProcessGroupSpec = serde_json::from_value(Value::Object(spec.clone()))
            .map_err(|e| TorusError::Creation(format!("invalid process group spec: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.user.is_none() {
            missing.push("user");
        }
        if self.executable.is_none() {
            missing.push("executable");
        }
        if self.args.is_none() {
            missing.push("args");
        }
        if self.location.is_none() {
            missing.push("location");
        }
        if self.size.is_none() {
            missing.push("size");
        }
        if self.cwd.is_none() {
            missing.push("cwd");
        }
        if !missing.is_empty() {
            return Err(TorusError::Creation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.location.as_ref().is_some_and(|l| l.is_empty()) {
            return Err(TorusError::Creation("no location".to_string()));
        }
        Ok(())
    }
}
