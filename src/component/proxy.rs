//! Component name resolution and remote calls.
//!
//! A proxy call resolves its target in three stages: components running
//! in this process, the statically configured address table, and finally
//! a `locate` call against the service locator. Only when all three miss
//! does the caller see a lookup error; transport failures against a
//! resolved location stay distinct from "no such component".

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{Dispatcher, RpcRequest, RpcResponse};
use crate::config::AuthConfig;
use crate::error::{Result, TorusError};

/// Registered name of the locator component itself.
pub const LOCATOR_NAME: &str = "service-location";

/// HTTP client speaking the JSON envelope protocol.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    auth: Option<AuthConfig>,
}

impl RpcClient {
    /// Build a client, optionally attaching basic-auth credentials to
    /// every outbound call.
    pub fn new(auth: Option<AuthConfig>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, auth })
    }

    /// Call `method` on the component served at `location`.
    pub async fn call(&self, location: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        let url = format!("{}/RPC2", location.trim_end_matches('/'));
        let request = RpcRequest {
            method: method.to_string(),
            params,
        };
        let mut builder = self.http.post(&url).json(&request);
        if let Some(auth) = &self.auth {
            builder = builder.basic_auth(&auth.user, Some(&auth.password));
        }
        let response = builder.send().await?.error_for_status()?;
        let envelope: RpcResponse = response.json().await?;
        envelope.into_result()
    }
}

/// Resolution outcome: an in-process dispatcher or a remote address.
pub enum Located {
    Local(Arc<Dispatcher>),
    Remote(String),
}

impl fmt::Debug for Located {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Located::Local(dispatcher) => f.debug_tuple("Local").field(&dispatcher.name()).finish(),
            Located::Remote(location) => f.debug_tuple("Remote").field(location).finish(),
        }
    }
}

/// Component directory combining all three resolution stages.
pub struct Directory {
    local: BTreeMap<String, Arc<Dispatcher>>,
    static_table: HashMap<String, String>,
    client: RpcClient,
}

impl Directory {
    pub fn new(static_table: HashMap<String, String>, client: RpcClient) -> Self {
        Self {
            local: BTreeMap::new(),
            static_table,
            client,
        }
    }

    /// Make an in-process component resolvable without touching the
    /// network.
    pub fn register_local(&mut self, dispatcher: Arc<Dispatcher>) {
        self.local
            .insert(dispatcher.name().to_string(), dispatcher);
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Find a component by name.
    ///
    /// # Errors
    ///
    /// [`TorusError::ComponentLookup`] when no stage knows the name. A
    /// failed call to the locator propagates as the transport error it
    /// is.
    pub async fn resolve(&self, name: &str) -> Result<Located> {
        if let Some(dispatcher) = self.local.get(name) {
            return Ok(Located::Local(dispatcher.clone()));
        }
        if let Some(location) = self.static_table.get(name) {
            return Ok(Located::Remote(location.clone()));
        }
        if let Some(locator) = self.static_table.get(LOCATOR_NAME) {
            let answer = self
                .client
                .call(locator, "locate", vec![Value::String(name.to_string())])
                .await?;
            let location = answer.as_str().unwrap_or_default().to_string();
            if !location.is_empty() {
                debug!(name, location = %location, "component located dynamically");
                return Ok(Located::Remote(location));
            }
        }
        Err(TorusError::ComponentLookup(name.to_string()))
    }

    /// Resolve and call in one step.
    pub async fn call(&self, component: &str, method: &str, params: Vec<Value>) -> Result<Value> {
        match self.resolve(component).await? {
            Located::Local(dispatcher) => dispatcher.dispatch(method, params).await,
            Located::Remote(location) => self.client.call(&location, method, params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn directory(static_table: &[(&str, &str)]) -> Directory {
        let table = static_table
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Directory::new(table, RpcClient::new(None).expect("client"))
    }

    #[tokio::test]
    async fn local_registry_wins_over_static_table() {
        let mut dir = directory(&[("system", "http://far-away:5900")]);
        dir.register_local(Arc::new(Dispatcher::new("system", "test")));
        match dir.resolve("system").await.expect("resolve") {
            Located::Local(dispatcher) => assert_eq!(dispatcher.name(), "system"),
            Located::Remote(_) => panic!("expected local resolution"),
        }
    }

    #[tokio::test]
    async fn static_table_resolves_remote_components() {
        let dir = directory(&[("system", "http://h1:5900")]);
        match dir.resolve("system").await.expect("resolve") {
            Located::Remote(location) => assert_eq!(location, "http://h1:5900"),
            Located::Local(_) => panic!("expected remote resolution"),
        }
    }

    #[tokio::test]
    async fn unknown_component_is_a_lookup_error() {
        let dir = directory(&[]);
        let err = dir.resolve("queue-manager").await.unwrap_err();
        assert!(matches!(err, TorusError::ComponentLookup(_)));
    }

    #[tokio::test]
    async fn local_calls_dispatch_without_network() {
        let mut dispatcher = Dispatcher::new("system", "test");
        dispatcher.expose("answer", "", |_| Box::pin(async { Ok(json!(42)) }));
        let mut dir = directory(&[]);
        dir.register_local(Arc::new(dispatcher));
        let out = dir.call("system", "answer", vec![]).await.expect("call");
        assert_eq!(out, json!(42));
    }
}
