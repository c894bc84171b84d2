//! Component base: method dispatch, automatic tasks, wire envelope.
//!
//! A component is a named bundle of remotely callable methods plus a set
//! of periodic background tasks, served over the JSON envelope in this
//! module. Methods are callable only if explicitly exposed; everything
//! else answers with a method-not-supported fault, never a crash.

pub mod proxy;
pub mod server;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TorusError};

/// A remotely callable method body.
///
/// Handlers capture their own shared state and may await; the dispatcher
/// imposes no ordering beyond what that state's lock provides.
pub type Handler = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A periodic background task body.
pub type TaskFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One automatic task: named, with its own cadence.
pub struct Task {
    pub name: &'static str,
    pub interval: Duration,
    pub runner: TaskFn,
}

struct MethodEntry {
    help: String,
    handler: Handler,
}

/// Methods every component answers without registration.
const BUILTINS: &[(&str, &str)] = &[
    ("get_implementation", "Report the component's implementation tag."),
    ("get_name", "Report the component's registered name."),
    ("list_methods", "List every callable method name."),
    ("method_help", "Return the help text for a named method."),
    ("ping", "Echo the arguments back to the caller."),
];

/// Explicit registry of exposed methods and automatic tasks.
pub struct Dispatcher {
    name: String,
    implementation: String,
    methods: BTreeMap<String, MethodEntry>,
    tasks: Vec<Task>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementation: implementation.into(),
            methods: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Component name, as registered with the service locator.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }

    /// Mark a method as remotely callable.
    ///
    /// Builtin names keep priority; exposing `ping` changes nothing.
    pub fn expose<F>(&mut self, name: &str, help: &str, handler: F)
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                help: help.to_string(),
                handler: Box::new(handler),
            },
        );
    }

    /// Add a background task run on its own interval for the life of the
    /// serving loop.
    pub fn automatic<F>(&mut self, name: &'static str, interval: Duration, runner: F)
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.tasks.push(Task {
            name,
            interval,
            runner: Box::new(runner),
        });
    }

    /// Detach the task list so the serving loop can own it.
    pub fn take_tasks(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.tasks)
    }

    /// Invoke a method by name.
    ///
    /// # Errors
    ///
    /// Unknown methods fail with [`TorusError::MethodNotSupported`];
    /// everything else is whatever the handler returns.
    pub async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match method {
            "ping" => Ok(Value::Array(params)),
            "get_name" => Ok(Value::String(self.name.clone())),
            "get_implementation" => Ok(Value::String(self.implementation.clone())),
            "list_methods" => Ok(serde_json::to_value(self.method_names())?),
            "method_help" => {
                let name: String = param(&params, 0, "method")?;
                Ok(Value::String(self.help_for(&name)))
            }
            _ => match self.methods.get(method) {
                Some(entry) => (entry.handler)(params).await,
                None => Err(TorusError::MethodNotSupported(method.to_string())),
            },
        }
    }

    fn method_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = BUILTINS.iter().map(|(n, _)| n.to_string()).collect();
        names.extend(self.methods.keys().cloned());
        names.into_iter().collect()
    }

    /// Help text for a method, or `""` when there is none to give.
    fn help_for(&self, method: &str) -> String {
        if let Some((_, help)) = BUILTINS.iter().find(|(n, _)| *n == method) {
            return help.to_string();
        }
        self.methods
            .get(method)
            .map(|entry| entry.help.clone())
            .unwrap_or_default()
    }
}

/// Request envelope: `{"method": ..., "params": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Structured fault carried back to the caller instead of a result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

/// Response envelope: exactly one of `result` or `fault`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl RpcResponse {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            fault: None,
        }
    }

    pub fn from_error(error: &TorusError) -> Self {
        Self {
            result: None,
            fault: Some(Fault {
                code: error.fault_code(),
                message: error.to_string(),
            }),
        }
    }

    /// Client-side view: a fault becomes an error, a missing result is
    /// a null result.
    pub fn into_result(self) -> Result<Value> {
        if let Some(fault) = self.fault {
            return Err(TorusError::Fault {
                code: fault.code,
                message: fault.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Decode one required positional parameter.
pub fn param<T: serde::de::DeserializeOwned>(params: &[Value], idx: usize, name: &str) -> Result<T> {
    let value = params
        .get(idx)
        .ok_or_else(|| TorusError::BadRequest(format!("missing parameter: {}", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|_| TorusError::BadRequest(format!("invalid parameter: {}", name)))
}

/// Decode one optional positional parameter; absent and null both read
/// as `None`.
pub fn opt_param<T: serde::de::DeserializeOwned>(
    params: &[Value],
    idx: usize,
    name: &str,
) -> Result<Option<T>> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|_| TorusError::BadRequest(format!("invalid parameter: {}", name))),
    }
}
