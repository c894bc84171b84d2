//! Service location registry.
//!
//! Components serving on dynamic addresses register themselves here by
//! name; proxies that have no static address for a peer ask the locator.
//! Registration is a heartbeat contract: entries are dropped either when
//! a periodic ping fails (active policy) or when the last registration
//! falls outside the expiry window (passive policy).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::component::proxy::{RpcClient, LOCATOR_NAME};
use crate::component::{opt_param, param, Dispatcher};
use crate::config::{AuthConfig, ExpiryPolicy, LocatorConfig};
use crate::error::{Result, TorusError};
use crate::filter::{self, FilterSpec};
use crate::snapshot;

/// One registered service, as stored and as returned by `get_services`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub location: String,
    pub stamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ServiceLocator {
    services: BTreeMap<String, ServiceRecord>,
}

impl ServiceLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a service is alive at a location.
    ///
    /// Re-registration at the same location just refreshes the stamp. A
    /// changed location is taken over the old one, loudly, since the
    /// usual cause is a component restart on a fresh ephemeral port.
    pub fn register(&mut self, name: &str, location: &str) {
        let now = Utc::now();
        match self.services.get_mut(name) {
            Some(service) if service.location == location => {
                service.stamp = now;
                debug!(name, location, "service registration refreshed");
            }
            Some(service) => {
                info!(name, from = %service.location, to = location, "service moved");
                service.location = location.to_string();
                service.stamp = now;
            }
            None => {
                info!(name, location, "service registered");
                self.services.insert(
                    name.to_string(),
                    ServiceRecord {
                        name: name.to_string(),
                        location: location.to_string(),
                        stamp: now,
                    },
                );
            }
        }
    }

    /// Remove a registration. Unknown names are not an error.
    pub fn unregister(&mut self, name: &str) {
        match self.services.remove(name) {
            Some(_) => info!(name, "service unregistered"),
            None => debug!(name, "unregister of unknown service ignored"),
        }
    }

    /// Location of a service, or `""` when unknown.
    ///
    /// Callers treat the empty string as "not started yet", so absence
    /// is an answer here rather than an error.
    pub fn locate(&self, name: &str) -> String {
        match self.services.get(name) {
            Some(service) => service.location.clone(),
            None => {
                debug!(name, "locate of unknown service");
                String::new()
            }
        }
    }

    pub fn query(&self, specs: &[FilterSpec]) -> Result<Vec<ServiceRecord>> {
        let mut matched = Vec::new();
        for service in self.services.values() {
            if filter::matches_any(specs, &filter::record_of(service)?) {
                matched.push(service.clone());
            }
        }
        Ok(matched)
    }

    /// Passive expiry: drop services that have not re-registered within
    /// the window. Returns the names dropped.
    pub fn expire_stale(&mut self, window: Duration) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .services
            .values()
            .filter(|s| (now - s.stamp).to_std().unwrap_or_default() > window)
            .map(|s| s.name.clone())
            .collect();
        for name in &expired {
            warn!(name = %name, "service expired");
            self.services.remove(name);
        }
        expired
    }

    /// Name and location of every registration, for active ping checks.
    pub fn endpoints(&self) -> Vec<(String, String)> {
        self.services
            .values()
            .map(|s| (s.name.clone(), s.location.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        self.services.values().cloned().collect()
    }

    pub fn restore(&mut self, services: Vec<ServiceRecord>) {
        for service in services {
            self.services.insert(service.name.clone(), service);
        }
    }
}

/// Assemble the service-location component.
///
/// The registry restore happens before anything serves; a corrupt
/// snapshot stops the daemon rather than silently starting it empty.
pub fn build(
    config: &LocatorConfig,
    auth: Option<AuthConfig>,
) -> Result<(Dispatcher, Arc<Mutex<ServiceLocator>>)> {
    let mut locator = ServiceLocator::new();
    if let Some(statefile) = &config.statefile {
        if let Some(services) = snapshot::load::<Vec<ServiceRecord>>(statefile, LOCATOR_NAME)? {
            locator.restore(services);
            info!(
                statefile = %statefile.display(),
                services = locator.len(),
                "registry restored"
            );
        }
    }
    let state = Arc::new(Mutex::new(locator));
    let dispatcher = build_dispatcher(state.clone(), config, auth)?;
    Ok((dispatcher, state))
}

fn build_dispatcher(
    state: Arc<Mutex<ServiceLocator>>,
    config: &LocatorConfig,
    auth: Option<AuthConfig>,
) -> Result<Dispatcher> {
    let implementation = match config.policy {
        ExpiryPolicy::Active => "active",
        ExpiryPolicy::Passive => "passive",
    };
    let mut dispatcher = Dispatcher::new(LOCATOR_NAME, implementation);

    let shared = state.clone();
    dispatcher.expose(
        "register",
        "Record that a named service is alive at a location.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let name: String = param(&params, 0, "name")?;
                let location: String = param(&params, 1, "location")?;
                state.lock().await.register(&name, &location);
                Ok(Value::Null)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "unregister",
        "Drop a service registration; unknown names are ignored.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let name: String = param(&params, 0, "name")?;
                state.lock().await.unregister(&name);
                Ok(Value::Null)
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "locate",
        "Return a service's location, or \"\" when it is not registered.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let name: String = param(&params, 0, "name")?;
                Ok(Value::String(state.lock().await.locate(&name)))
            })
        },
    );

    let shared = state.clone();
    dispatcher.expose(
        "get_services",
        "Return registered services matching the filter specs.",
        move |params| {
            let state = shared.clone();
            Box::pin(async move {
                let specs: Vec<FilterSpec> = param(&params, 0, "specs")?;
                Ok(serde_json::to_value(state.lock().await.query(&specs)?)?)
            })
        },
    );

    let shared = state.clone();
    let default_statefile = config.statefile.clone();
    dispatcher.expose(
        "save",
        "Write a registry snapshot to the statefile (or a given path).",
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
                let services = state.lock().await.snapshot();
                snapshot::save(&path, LOCATOR_NAME, &services)?;
                info!(path = %path.display(), "registry saved");
                Ok(Value::String(path.display().to_string()))
            })
        },
    );

    match config.policy {
        ExpiryPolicy::Passive => {
            let shared = state.clone();
            let window = config.expiry_window();
            dispatcher.automatic("expire-services", config.check_interval(), move || {
                let state = shared.clone();
                Box::pin(async move {
                    state.lock().await.expire_stale(window);
                    Ok(())
                })
            });
        }
        ExpiryPolicy::Active => {
            let shared = state.clone();
            let client = RpcClient::new(auth)?;
            dispatcher.automatic("check-services", config.check_interval(), move || {
                let state = shared.clone();
                let client = client.clone();
                Box::pin(async move {
                    // Ping without holding the lock; a dead endpoint
                    // blocks for the full client timeout.
                    let endpoints = state.lock().await.endpoints();
                    for (name, location) in endpoints {
                        if let Err(e) = client.call(&location, "ping", vec![]).await {
                            warn!(
                                name = %name,
                                location = %location,
                                error = %e,
                                "service failed ping check"
                            );
                            state.lock().await.unregister(&name);
                        }
                    }
                    Ok(())
                })
            });
        }
    }

    if let Some(statefile) = config.statefile.clone() {
        let shared = state.clone();
        dispatcher.automatic("save-registry", config.check_interval(), move || {
            let state = shared.clone();
            let statefile = statefile.clone();
            Box::pin(async move {
                let services = state.lock().await.snapshot();
                snapshot::save(&statefile, LOCATOR_NAME, &services)
            })
        });
    }

    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: serde_json::Value) -> FilterSpec {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn register_locate_unregister_cycle() {
        let mut locator = ServiceLocator::new();
        assert_eq!(locator.locate("svc-a"), "");

        locator.register("svc-a", "http://h1:5900");
        assert_eq!(locator.locate("svc-a"), "http://h1:5900");
        assert_eq!(locator.len(), 1);

        locator.unregister("svc-a");
        assert_eq!(locator.locate("svc-a"), "");
        locator.unregister("svc-a");
        assert!(locator.is_empty());
    }

    #[test]
    fn reregistration_refreshes_the_stamp() {
        let mut locator = ServiceLocator::new();
        locator.register("svc-a", "http://h1:5900");
        let first = locator.snapshot()[0].stamp;
        std::thread::sleep(Duration::from_millis(5));
        locator.register("svc-a", "http://h1:5900");
        let second = locator.snapshot()[0].stamp;
        assert!(second > first);
        assert_eq!(locator.len(), 1);
    }

    #[test]
    fn moved_service_takes_the_new_location() {
        let mut locator = ServiceLocator::new();
        locator.register("svc-a", "http://h1:5900");
        locator.register("svc-a", "http://h2:5901");
        assert_eq!(locator.locate("svc-a"), "http://h2:5901");
        assert_eq!(locator.len(), 1);
    }

    #[test]
    fn expiry_drops_only_stale_services() {
        let mut locator = ServiceLocator::new();
        locator.register("old", "http://h1:1");
        std::thread::sleep(Duration::from_millis(10));
        let dropped = locator.expire_stale(Duration::from_secs(3600));
        assert!(dropped.is_empty());
        let dropped = locator.expire_stale(Duration::from_millis(1));
        assert_eq!(dropped, vec!["old".to_string()]);
        assert_eq!(locator.locate("old"), "");
    }

    #[test]
    fn query_filters_on_fields() {
        let mut locator = ServiceLocator::new();
        locator.register("svc-a", "http://h1:1");
        locator.register("svc-b", "http://h2:2");
        let all = locator.query(&[spec(json!({"name": "*"}))]).expect("query");
        assert_eq!(all.len(), 2);
        let one = locator
            .query(&[spec(json!({"name": "svc-b"}))])
            .expect("query");
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].location, "http://h2:2");
        let none = locator.query(&[]).expect("query");
        assert!(none.is_empty());
    }

    #[test]
    fn snapshot_restores_registrations() {
        let mut locator = ServiceLocator::new();
        locator.register("svc-a", "http://h1:1");
        locator.register("svc-b", "http://h2:2");
        let snap = locator.snapshot();

        let mut restored = ServiceLocator::new();
        restored.restore(snap);
        assert_eq!(restored.locate("svc-a"), "http://h1:1");
        assert_eq!(restored.locate("svc-b"), "http://h2:2");
    }

    #[tokio::test]
    async fn dispatch_register_locate_cycle() {
        let (dispatcher, _state) =
            build(&LocatorConfig::default(), None).expect("build");

        let out = dispatcher
            .dispatch("locate", vec![json!("svc-a")])
            .await
            .expect("locate");
        assert_eq!(out, json!(""));

        dispatcher
            .dispatch("register", vec![json!("svc-a"), json!("http://h1:5900")])
            .await
            .expect("register");
        let out = dispatcher
            .dispatch("locate", vec![json!("svc-a")])
            .await
            .expect("locate");
        assert_eq!(out, json!("http://h1:5900"));

        let services = dispatcher
            .dispatch("get_services", vec![json!([{"name": "*"}])])
            .await
            .expect("get_services");
        let services: Vec<ServiceRecord> = serde_json::from_value(services).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].location, "http://h1:5900");

        dispatcher
            .dispatch("unregister", vec![json!("svc-a")])
            .await
            .expect("unregister");
        let out = dispatcher
            .dispatch("locate", vec![json!("svc-a")])
            .await
            .expect("locate");
        assert_eq!(out, json!(""));
    }

    #[tokio::test]
    async fn implementation_tracks_expiry_policy() {
        let (passive, _state) =
            build(&LocatorConfig::default(), None).expect("build");
        assert_eq!(passive.implementation(), "passive");

        let config = LocatorConfig {
            policy: ExpiryPolicy::Active,
            ..LocatorConfig::default()
        };
        let (active, _state) = build(&config, None).expect("build");
        assert_eq!(active.implementation(), "active");
    }

    #[tokio::test]
    async fn save_and_rebuild_keeps_registrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = LocatorConfig {
            statefile: Some(dir.path().join("slp.state")),
            ..LocatorConfig::default()
        };

        let (dispatcher, _state) = build(&config, None).expect("build");
        dispatcher
            .dispatch("register", vec![json!("svc-a"), json!("http://h1:5900")])
            .await
            .expect("register");
        dispatcher.dispatch("save", vec![]).await.expect("save");

        let (rebuilt, _state) = build(&config, None).expect("rebuild");
        let out = rebuilt
            .dispatch("locate", vec![json!("svc-a")])
            .await
            .expect("locate");
        assert_eq!(out, json!("http://h1:5900"));
    }
}
