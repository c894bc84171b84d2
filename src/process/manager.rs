use std::collections::BTreeMap;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::spawn::{self, LaunchPlan};
use super::{ProcessGroup, ProcessGroupSpec, SpawnState};
use crate::error::{Result, TorusError};
use crate::filter::{self, FilterSpec};

/// Keyed collection of process groups.
///
/// Ids are assigned here, sequentially, and are never reused within a
/// component generation. Removal happens only through [`wait`]; `get`
/// and `signal` leave entries in place so exit statuses stay collectable.
///
/// [`wait`]: ProcessGroupManager::wait
pub struct ProcessGroupManager {
    groups: BTreeMap<u64, ProcessGroup>,
    next_id: u64,
    launcher: PathBuf,
}

/// Persistent form of the manager: the id counter plus every live entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessGroupSnapshot {
    pub next_id: u64,
    pub groups: Vec<ProcessGroup>,
}

impl ProcessGroupManager {
    pub fn new(launcher: PathBuf) -> Self {
        Self {
            groups: BTreeMap::new(),
            next_id: 0,
            launcher,
        }
    }

    /// Validate and start one process group per spec.
    ///
    /// Validation runs to completion for every spec, including user
    /// lookups and stdio staging, before anything forks; a bad spec
    /// faults the whole call with nothing started. After that point a
    /// spawn failure is confined to its own group, which is recorded as
    /// exited with status -1 so a later `wait` can collect it.
    pub fn add(&mut self, specs: &[Map<String, Value>]) -> Result<Vec<ProcessGroup>> {
        let mut staged = Vec::new();
        for raw in specs {
            let spec = ProcessGroupSpec::parse(raw)?;
            let user = spec.user.clone().unwrap_or_default();
            let (uid, gid) = spawn::resolve_user(&user)?;
            self.next_id += 1;
            let pg = ProcessGroup::from_spec(self.next_id, spec);
            let plan = LaunchPlan::build(&pg, &self.launcher, uid, gid)?;
            staged.push((pg, plan));
        }

        let mut added = Vec::with_capacity(staged.len());
        for (mut pg, plan) in staged {
            match spawn::spawn(&plan) {
                Ok(pid) => {
                    pg.head_pid = Some(pid);
                    pg.spawn_state = SpawnState::Daemonized;
                    info!(
                        id = pg.id,
                        user = %pg.user,
                        pid,
                        executable = %pg.executable,
                        location = ?pg.location,
                        "started process group"
                    );
                }
                Err(e) => {
                    error!(id = pg.id, error = %e, "process group failed to start");
                    pg.exit_status = Some(-1);
                    pg.spawn_state = SpawnState::Exited;
                }
            }
            added.push(pg.clone());
            self.groups.insert(pg.id, pg);
        }
        Ok(added)
    }

    /// Return matching groups, reaping exited leaders first.
    pub fn get(&mut self, specs: &[FilterSpec]) -> Result<Vec<ProcessGroup>> {
        self.reap();
        self.matching(specs)
    }

    /// Return and remove matching groups whose exit status is already set.
    pub fn wait(&mut self, specs: &[FilterSpec]) -> Result<Vec<ProcessGroup>> {
        let finished: Vec<u64> = self
            .matching(specs)?
            .into_iter()
            .filter(|pg| pg.exit_status.is_some())
            .map(|pg| pg.id)
            .collect();
        let mut waited = Vec::with_capacity(finished.len());
        for id in finished {
            if let Some(pg) = self.groups.remove(&id) {
                debug!(id, exit_status = pg.exit_status, "waited process group");
                waited.push(pg);
            }
        }
        Ok(waited)
    }

    /// Send a signal to the leader of every matching, still-running group.
    ///
    /// Returns the matched groups whether or not delivery worked; a
    /// failed kill is logged per entry and does not fault the call.
    pub fn signal(&mut self, specs: &[FilterSpec], name: &str) -> Result<Vec<ProcessGroup>> {
        let signal = spawn::parse_signal(name)
            .ok_or_else(|| TorusError::BadRequest(format!("unknown signal: {}", name)))?;
        let matched = self.matching(specs)?;
        for pg in &matched {
            if pg.exit_status.is_some() {
                continue;
            }
            let Some(pid) = pg.head_pid else { continue };
            match kill(Pid::from_raw(pid), signal) {
                Ok(()) => info!(id = pg.id, pid, ?signal, "signalled process group"),
                Err(e) => {
                    warn!(id = pg.id, pid, ?signal, error = %e, "could not signal process group")
                }
            }
        }
        Ok(matched)
    }

    /// Collect exited leaders and record their statuses.
    ///
    /// Pids with no matching group were inherited through subreaping
    /// from something we already forgot; they are reaped and dropped.
    pub fn reap(&mut self) {
        for child in spawn::reap_exited() {
            let known = self
                .groups
                .values_mut()
                .find(|pg| pg.head_pid == Some(child.pid) && pg.exit_status.is_none());
            match known {
                Some(pg) => {
                    pg.exit_status = Some(child.status);
                    pg.spawn_state = SpawnState::Exited;
                    info!(
                        id = pg.id,
                        pid = child.pid,
                        status = child.status,
                        "process group exited"
                    );
                }
                None => debug!(pid = child.pid, status = child.status, "reaped unknown child"),
            }
        }
        // Leaders restored from before a restart are not our children, so
        // their exits never show up in waitpid. Probe the survivors; our
        // own unreaped children stay signalable as zombies and pass.
        for pg in self.groups.values_mut() {
            if pg.spawn_state != SpawnState::Daemonized || pg.exit_status.is_some() {
                continue;
            }
            let Some(pid) = pg.head_pid else { continue };
            if kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH) {
                warn!(id = pg.id, pid, "process group leader vanished, exit status lost");
                pg.exit_status = Some(-1);
                pg.spawn_state = SpawnState::Exited;
            }
        }
    }

    pub fn snapshot(&self) -> ProcessGroupSnapshot {
        ProcessGroupSnapshot {
            next_id: self.next_id,
            groups: self.groups.values().cloned().collect(),
        }
    }

    /// Reload groups from a snapshot taken by an earlier generation.
    ///
    /// Leaders from before a restart are no longer our children, so their
    /// real exit statuses are unrecoverable. Each restored running group
    /// gets a liveness probe; the dead ones are marked exited with status
    /// -1 rather than left hanging forever.
    pub fn restore(&mut self, snapshot: ProcessGroupSnapshot) {
        self.next_id = self.next_id.max(snapshot.next_id);
        for mut pg in snapshot.groups {
            if pg.exit_status.is_none() {
                let alive = pg
                    .head_pid
                    .is_some_and(|pid| kill(Pid::from_raw(pid), None).is_ok());
                if !alive {
                    warn!(
                        id = pg.id,
                        pid = pg.head_pid,
                        "restored process group is gone, exit status lost"
                    );
                    pg.exit_status = Some(-1);
                    pg.spawn_state = SpawnState::Exited;
                }
            }
            self.groups.insert(pg.id, pg);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn matching(&self, specs: &[FilterSpec]) -> Result<Vec<ProcessGroup>> {
        let mut matched = Vec::new();
        for pg in self.groups.values() {
            if filter::matches_any(specs, &filter::record_of(pg)?) {
                matched.push(pg.clone());
            }
        }
        Ok(matched)
    }
}
