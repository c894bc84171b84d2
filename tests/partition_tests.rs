//! Partition lifecycle tests driven through the system component's
//! dispatch surface, the same path the wire uses.

use std::sync::Arc;

use serde_json::json;

use torus::component::Dispatcher;
use torus::config::SystemConfig;
use torus::error::fault;
use torus::partition::{PartitionDef, Topology};
use torus::system;

fn nodes(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-N{i:02}")).collect()
}

fn def(name: &str, nodes: &[String]) -> PartitionDef {
    let refs: Vec<&str> = nodes.iter().map(String::as_str).collect();
    PartitionDef::new(name, &refs)
}

/// One 64-node rack split into halves, plus a small partition whose
/// interconnect shares wiring with the right half.
fn rack() -> Topology {
    let all = nodes("P64", 64);
    let aux = nodes("X16", 16);
    Topology::new(vec![
        def("P64", &all).size(64),
        def("P32-L", &all[..32]).size(32),
        def("P32-R", &all[32..]).size(32),
        def("X16", &aux).size(16).wiring(&["P32-R"]),
    ])
}

async fn managed_system() -> Dispatcher {
    let (dispatcher, _state) =
        system::build(&SystemConfig::default(), Arc::new(rack())).expect("system build");
    dispatcher
        .dispatch("add_partitions", vec![json!([{"name": "*"}])])
        .await
        .expect("manage all partitions");
    dispatcher
}

async fn state_of(dispatcher: &Dispatcher, name: &str) -> String {
    let records = dispatcher
        .dispatch("get_partitions", vec![json!([{"name": name}])])
        .await
        .expect("get_partitions");
    records[0]["state"].as_str().expect("state string").to_string()
}

async fn reserve(dispatcher: &Dispatcher, name: &str, size: Option<u64>) -> bool {
    let mut params = vec![json!(name)];
    if let Some(size) = size {
        params.push(json!(size));
    }
    dispatcher
        .dispatch("reserve_partition", params)
        .await
        .expect("reserve_partition")
        .as_bool()
        .expect("bool result")
}

async fn release(dispatcher: &Dispatcher, name: &str) -> bool {
    dispatcher
        .dispatch("release_partition", vec![json!(name)])
        .await
        .expect("release_partition")
        .as_bool()
        .expect("bool result")
}

#[tokio::test]
async fn reserve_release_cycle_on_a_full_rack() {
    let dispatcher = managed_system().await;

    assert_eq!(state_of(&dispatcher, "P64").await, "idle");
    assert!(reserve(&dispatcher, "P64", Some(64)).await);
    assert_eq!(state_of(&dispatcher, "P64").await, "busy");

    // A busy partition refuses a second reservation.
    assert!(!reserve(&dispatcher, "P64", Some(64)).await);

    assert!(release(&dispatcher, "P64").await);
    assert_eq!(state_of(&dispatcher, "P64").await, "idle");
    assert!(!release(&dispatcher, "P64").await);
}

#[tokio::test]
async fn containment_blocks_in_both_directions() {
    let dispatcher = managed_system().await;

    assert!(reserve(&dispatcher, "P32-L", None).await);
    assert_eq!(state_of(&dispatcher, "P64").await, "blocked (P32-L)");
    assert_eq!(state_of(&dispatcher, "P32-R").await, "idle");
    assert!(!reserve(&dispatcher, "P64", None).await);
    assert!(release(&dispatcher, "P32-L").await);

    assert!(reserve(&dispatcher, "P64", None).await);
    assert_eq!(state_of(&dispatcher, "P32-L").await, "blocked (P64)");
    assert_eq!(state_of(&dispatcher, "P32-R").await, "blocked (P64)");
    assert!(!reserve(&dispatcher, "P32-R", None).await);
}

#[tokio::test]
async fn wiring_dependencies_block_symmetrically() {
    let dispatcher = managed_system().await;

    assert!(reserve(&dispatcher, "X16", None).await);
    assert_eq!(state_of(&dispatcher, "P32-R").await, "blocked-wiring (X16)");
    assert!(!reserve(&dispatcher, "P32-R", None).await);
    assert!(release(&dispatcher, "X16").await);

    assert!(reserve(&dispatcher, "P32-R", None).await);
    assert_eq!(state_of(&dispatcher, "X16").await, "blocked-wiring (P32-R)");
}

#[tokio::test]
async fn oversized_reservation_leaves_the_partition_idle() {
    let dispatcher = managed_system().await;

    assert!(!reserve(&dispatcher, "P32-L", Some(33)).await);
    assert_eq!(state_of(&dispatcher, "P32-L").await, "idle");
    assert!(reserve(&dispatcher, "P32-L", Some(32)).await);
}

#[tokio::test]
async fn set_partitions_updates_attributes_and_rejects_unknown_ones() {
    let dispatcher = managed_system().await;

    let updated = dispatcher
        .dispatch(
            "set_partitions",
            vec![json!([{"name": "P32-L"}]), json!({"queue": "debug"})],
        )
        .await
        .expect("set_partitions");
    assert_eq!(updated.as_array().map(Vec::len), Some(1));
    assert_eq!(updated[0]["queue"], json!("debug"));

    let records = dispatcher
        .dispatch("get_partitions", vec![json!([{"name": "P32-R"}])])
        .await
        .expect("get_partitions");
    assert_eq!(records[0]["queue"], json!("default"));

    let err = dispatcher
        .dispatch(
            "set_partitions",
            vec![json!([{"name": "*"}]), json!({"owner": "ops"})],
        )
        .await
        .unwrap_err();
    assert_eq!(err.fault_code(), fault::BAD_REQUEST);
}

#[tokio::test]
async fn del_partitions_drops_management_and_relations() {
    let dispatcher = managed_system().await;

    let removed = dispatcher
        .dispatch("del_partitions", vec![json!([{"name": "P64"}])])
        .await
        .expect("del_partitions");
    assert_eq!(removed.as_array().map(Vec::len), Some(1));

    let records = dispatcher
        .dispatch("get_partitions", vec![json!([{"name": "*"}])])
        .await
        .expect("get_partitions");
    assert_eq!(records.as_array().map(Vec::len), Some(3));

    // An unmanaged partition cannot be reserved and no longer shows up
    // as anyone's parent.
    assert!(!reserve(&dispatcher, "P64", None).await);
    let halves = dispatcher
        .dispatch("get_partitions", vec![json!([{"name": "P32-L"}])])
        .await
        .expect("get_partitions");
    assert_eq!(halves[0]["parents"], json!([]));

    dispatcher
        .dispatch("add_partitions", vec![json!([{"name": "P64"}])])
        .await
        .expect("add_partitions");
    let halves = dispatcher
        .dispatch("get_partitions", vec![json!([{"name": "P32-L"}])])
        .await
        .expect("get_partitions");
    assert_eq!(halves[0]["parents"], json!(["P64"]));
}

#[tokio::test]
async fn concurrent_overlapping_reserves_have_one_winner() {
    let dispatcher = managed_system().await;

    // P32-L's nodes are a subset of P64's, so these reservations can
    // never both hold. The state lock serializes them in either order.
    let (left, whole) = tokio::join!(
        reserve(&dispatcher, "P32-L", None),
        reserve(&dispatcher, "P64", None),
    );
    assert!(left != whole);

    let winner = if left { "P32-L" } else { "P64" };
    assert_eq!(state_of(&dispatcher, winner).await, "busy");
    assert!(release(&dispatcher, winner).await);
    assert_eq!(state_of(&dispatcher, "P64").await, "idle");
}
