//! HTTP serving loop for one component.
//!
//! All methods ride a single POST route; the dispatcher decides what the
//! method name means. Automatic tasks run on their own intervals for
//! exactly the life of the server.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::validate_request::ValidateRequestHeaderLayer;
use tracing::{info, warn};

use super::{Dispatcher, RpcRequest, RpcResponse, Task};
use crate::config::AuthConfig;
use crate::error::Result;

#[derive(Clone)]
struct ServeState {
    dispatcher: Arc<Dispatcher>,
}

/// Serve a component on an already-bound listener until shutdown.
///
/// The listener is bound by the caller so an ephemeral port is known,
/// and registerable, before serving starts. The token is cancelled on
/// the way out even when serving failed, so task loops never outlive
/// the server.
pub async fn serve(
    mut dispatcher: Dispatcher,
    listener: TcpListener,
    auth: Option<AuthConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    let tasks = dispatcher.take_tasks();
    let name = dispatcher.name().to_string();
    let addr = listener.local_addr()?;
    let dispatcher = Arc::new(dispatcher);

    let task_handles = spawn_tasks(tasks, shutdown.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/RPC2", post(rpc_handler))
        .layer(cors)
        .with_state(ServeState { dispatcher });
    if let Some(auth) = &auth {
        app = app.layer(ValidateRequestHeaderLayer::basic(&auth.user, &auth.password));
    }

    info!(component = %name, addr = %addr, "serving component");
    let token = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;

    shutdown.cancel();
    for handle in task_handles {
        let _ = handle.await;
    }
    info!(component = %name, "component stopped");
    result.map_err(Into::into)
}

fn spawn_tasks(tasks: Vec<Task>, token: CancellationToken) -> Vec<JoinHandle<()>> {
    tasks
        .into_iter()
        .map(|task| {
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = (task.runner)().await {
                                warn!(task = task.name, error = %e, "automatic task failed");
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

async fn rpc_handler(
    State(state): State<ServeState>,
    Json(request): Json<RpcRequest>,
) -> Json<RpcResponse> {
    let RpcRequest { method, params } = request;
    match state.dispatcher.dispatch(&method, params).await {
        Ok(result) => Json(RpcResponse::success(result)),
        Err(e) => {
            warn!(method = %method, error = %e, "method call faulted");
            Json(RpcResponse::from_error(&e))
        }
    }
}
