//! Service-location expiry scenarios: the passive window, the heartbeat
//! that defeats it, and the active ping check against real endpoints.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use torus::component::{server, Dispatcher, Task};
use torus::config::{ExpiryPolicy, LocatorConfig};
use torus::locator;

fn config(policy: ExpiryPolicy, window_secs: u64) -> LocatorConfig {
    LocatorConfig {
        policy,
        expiry_window_secs: window_secs,
        ..LocatorConfig::default()
    }
}

/// Run one of the locator's automatic tasks by name, once.
async fn run_task(tasks: &[Task], name: &str) {
    let task = tasks
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task named {name}"));
    (task.runner)().await.expect(name);
}

async fn locate(dispatcher: &Dispatcher, name: &str) -> String {
    let out = dispatcher
        .dispatch("locate", vec![json!(name)])
        .await
        .expect("locate");
    out.as_str().expect("location string").to_string()
}

async fn register(dispatcher: &Dispatcher, name: &str, location: &str) {
    dispatcher
        .dispatch("register", vec![json!(name), json!(location)])
        .await
        .expect("register");
}

async fn serve_endpoint(dispatcher: Dispatcher) -> (String, CancellationToken, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let token = CancellationToken::new();
    let serve_token = token.clone();
    let handle = tokio::spawn(async move {
        server::serve(dispatcher, listener, None, serve_token)
            .await
            .expect("serve");
    });
    (format!("http://{addr}"), token, handle)
}

#[tokio::test]
async fn passive_window_bounds_an_unrefreshed_registration() {
    let (mut dispatcher, _state) =
        locator::build(&config(ExpiryPolicy::Passive, 1), None).expect("build");
    let tasks = dispatcher.take_tasks();

    register(&dispatcher, "svc-a", "http://h1:5900").await;

    // Inside the window the expiry pass leaves the entry alone.
    tokio::time::sleep(Duration::from_millis(600)).await;
    run_task(&tasks, "expire-services").await;
    assert_eq!(locate(&dispatcher, "svc-a").await, "http://h1:5900");

    tokio::time::sleep(Duration::from_millis(600)).await;
    run_task(&tasks, "expire-services").await;
    assert_eq!(locate(&dispatcher, "svc-a").await, "");
}

#[tokio::test]
async fn reregistration_keeps_a_service_inside_the_window() {
    let (mut dispatcher, _state) =
        locator::build(&config(ExpiryPolicy::Passive, 1), None).expect("build");
    let tasks = dispatcher.take_tasks();

    register(&dispatcher, "svc-a", "http://h1:5900").await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        register(&dispatcher, "svc-a", "http://h1:5900").await;
    }

    // Well past the window in wall time, but every heartbeat reset it.
    run_task(&tasks, "expire-services").await;
    assert_eq!(locate(&dispatcher, "svc-a").await, "http://h1:5900");

    // Silence for longer than the window, and the entry goes.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    run_task(&tasks, "expire-services").await;
    assert_eq!(locate(&dispatcher, "svc-a").await, "");
}

#[tokio::test]
async fn active_policy_drops_only_unreachable_services() {
    let (live_url, token, handle) =
        serve_endpoint(Dispatcher::new("probe-target", "test")).await;

    let (mut dispatcher, _state) =
        locator::build(&config(ExpiryPolicy::Active, 300), None).expect("build");
    let tasks = dispatcher.take_tasks();

    register(&dispatcher, "live", &live_url).await;
    register(&dispatcher, "dead", "http://127.0.0.1:9").await;

    run_task(&tasks, "check-services").await;

    assert_eq!(locate(&dispatcher, "live").await, live_url);
    assert_eq!(locate(&dispatcher, "dead").await, "");

    token.cancel();
    handle.await.expect("server join");
}
