//! The system component: the partition graph and the process-group
//! collection wired to a dispatcher.
//!
//! All mutable state sits behind one async mutex. Reserve, release,
//! configure, refresh, and the reaper take that same lock, so every
//! read-modify-write sequence over the graph is serialized; two
//! concurrent reservations of overlapping partitions get exactly one
//! winner.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::component::{opt_param, param, Dispatcher};
use crate::config::SystemConfig;
use crate::error::{Result, TorusError};
use crate::filter::FilterSpec;
use crate::partition::{ManagedPartition, PartitionGraph, TopologySource};
use crate::process::{self, ProcessGroupManager, ProcessGroupSnapshot};
use crate::snapshot;

pub const COMPONENT_NAME: &str = "system";
pub const IMPLEMENTATION: &str = "torus";

/// Everything the system component mutates, behind one lock.
pub struct SystemState {
    pub graph: PartitionGraph,
    pub pgs: ProcessGroupManager,
}

/// On-disk form of the system component's state.
#[derive(Debug, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub partitions: Vec<ManagedPartition>,
    pub process_groups: ProcessGroupSnapshot,
}

/// Assemble the system component.
///
/// The initial configure and any snapshot restore happen here, before
/// anything serves: failing either is fatal, since partition bookkeeping
/// without topology is unsafe and a corrupt snapshot should stop the
/// daemon rather than silently start it empty.
pub fn build(
    config: &SystemConfig,
    source: Arc<dyn TopologySource>,
) -> Result<(Dispatcher, Arc<Mutex<SystemState>>)> {
    process::install_subreaper()?;

    let mut graph = PartitionGraph::new();
    let topology = source.describe()?;
    graph.configure(&topology)?;
    info!(
        partitions = graph.partition_count(),
        nodes = graph.node_count(),
        "topology configured"
    );

    let mut pgs = ProcessGroupManager::new(config.launcher.clone());
    if let Some(statefile) = &config.statefile {
        if let Some(snap) = snapshot::load::<SystemSnapshot>(statefile, COMPONENT_NAME)? {
            graph.restore_managed(&snap.partitions);
            pgs.restore(snap.process_groups);
            info!(statefile = %statefile.display(), "state restored");
        }
    }

    let state = Arc::new(Mutex::new(SystemState { graph, pgs }));
    let dispatcher = build_dispatcher(state.clone(), config, source);
    Ok((dispatcher, state))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn build_dispatcher(
    state: Arc<Mutex<SystemState>>,
    config: &SystemConfig,
    source: Arc<dyn TopologySource>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(COMPONENT_NAME, IMPLEMENTATION);

    let shared = state.clone();
    dispatcher.expose(
        "get_partitions",
        "Return managed partitions matching the filter specs.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let state = state.lock().await;
                to_value(state.graph.query(&specs)?)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "add_partitions",
        "Mark partitions matching the filter specs as managed.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let mut state = state.lock().await;
                let names = state.graph.match_names(&specs)?;
                to_value(state.graph.add_managed(&names))
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "del_partitions",
        "Remove partitions matching the filter specs from management.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let mut state = state.lock().await;
                let names = state.graph.match_names(&specs)?;
                to_value(state.graph.remove_managed(&names))
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "set_partitions",
        "Update queue/functional/scheduled on matching managed partitions.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let updates: FilterSpec = param(&params, 1, "updates")?;
                let mut state = state.lock().await;
                to_value(state.graph.set_attrs(&specs, &updates)?)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "reserve_partition",
        "Reserve a managed partition for a job; false when unavailable.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let name: String = param(&params, 0, "name")?;
                let size: Option<u64> = opt_param(&params, 1, "size")?;
                let mut state = state.lock().await;
                Ok(Value::Bool(state.graph.reserve(&name, size)))
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "release_partition",
        "Release a reserved partition; false when it was not busy.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let name: String = param(&params, 0, "name")?;
                let mut state = state.lock().await;
                Ok(Value::Bool(state.graph.release(&name)))
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "add_process_groups",
        "Validate, start, and return one process group per spec.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let mut state = state.lock().await;
                to_value(state.pgs.add(&specs)?)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "get_process_groups",
        "Return process groups matching the filter specs, reaping first.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let mut state = state.lock().await;
                to_value(state.pgs.get(&specs)?)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "wait_process_groups",
        "Return and forget matching process groups that have exited.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let mut state = state.lock().await;
                to_value(state.pgs.wait(&specs)?)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "signal_process_groups",
        "Send a signal (default SIGINT) to matching process group leaders.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                let signal: Option<String> = opt_param(&params, 1, "signal")?;
                let mut state = state.lock().await;
                to_value(
                    state
                        .pgs
                        .signal(&specs, signal.as_deref().unwrap_or("SIGINT"))?,
                )
            })
        },
    );

    let shared = state.clone();
    let default_statefile = config.statefile.clone();
    dispatcher.expose(
        "save",
        "Write a state snapshot to the statefile (or a given path).",
        move |params| {
            let state = shared.clone();
            let default_statefile = default_statefile.clone();
            Box::pin(async move {
                let path: Option<String> = opt_param(&params, 0, "statefile")?;
                let path = path
                    .map(PathBuf::from)
                    .or(default_statefile)
                    .ok_or_else(|| {
                        TorusError::BadRequest("no statefile configured".to_string())
                    })?;
                let state = state.lock().await;
                let snap = SystemSnapshot {
                    partitions: state.graph.managed_snapshot(),
                    process_groups: state.pgs.snapshot(),
                };
                snapshot::save(&path, COMPONENT_NAME, &snap)?;
                info!(path = %path.display(), "state saved");
                Ok(Value::String(path.display().to_string()))
            })
        },
    );

    let shared = state.clone();
    let poll_source = source.clone();
    dispatcher.automatic("refresh-partitions", config.refresh_interval(), move || {
        let state = shared.clone();
        let source = poll_source.clone();
        Box::pin(async move {
            let mut state = state.lock().await;
            let topology = source.describe()?;
            state.graph.configure(&topology)?;
            if let Some(busy) = source.poll_busy()? {
                state.graph.set_busy(&busy);
            }
            Ok(())
        })
    });

    let shared = state.clone();
    dispatcher.automatic("reap-process-groups", config.reap_interval(), move || {
        let state = shared.clone();
        Box::pin(async move {
            state.lock().await.pgs.reap();
            Ok(())
        })
    });

    if let Some(statefile) = config.statefile.clone() {
        let shared = state.clone();
        dispatcher.automatic("save-state", config.save_interval(), move || {
            let state = shared.clone();
            let statefile = statefile.clone();
            Box::pin(async move {
                let state = state.lock().await;
                let snap = SystemSnapshot {
                    partitions: state.graph.managed_snapshot(),
                    process_groups: state.pgs.snapshot(),
                };
                snapshot::save(&statefile, COMPONENT_NAME, &snap)
            })
        });
    }

    dispatcher
}
