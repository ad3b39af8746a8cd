//! Orchestrates controllers, leader election, webhooks and health probes
//!
//! Startup order: probes → leader election → cache sync → workers → webhook
//! server. Shutdown runs strictly in reverse and respects the configured
//! grace window.

use crate::{
    controller::{self, Action, Context, Controller},
    elector::{ConfigBuilder as ElectorConfigBuilder, LeaderElector},
    metrics::Metrics,
    watcher::{fixed_backoff, WatchHealth},
    webhook::WebhookServer,
};
use axum::{extract::State, http::StatusCode, routing::get, Router};
use futures::{future::BoxFuture, FutureExt, StreamExt, TryFuture};
use opkit_core::{client::ApiClient, params::ListParams, resource::Resource};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::{
    fmt::Debug,
    hash::Hash,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid manager configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind probe endpoint: {0}")]
    Bind(#[source] std::io::Error),
    #[error("webhook server failed: {0}")]
    Webhook(#[source] crate::webhook::Error),
    #[error("leader elector failed: {0}")]
    Elector(#[source] crate::elector::Error),
}

impl Error {
    /// Fatal startup errors map to process exit code 1
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// How a manager run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal shutdown (exit code 0)
    Clean,
    /// Leadership was lost and the config asks for an exit (exit code 2)
    LeadershipLost,
}

impl ExitStatus {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::LeadershipLost => 2,
        }
    }
}

/// The recognized configuration surface of the manager.
///
/// Durations are expressed in seconds. All fields have defaults so a config
/// file only needs to name what it changes. `user_impersonation` is carried
/// for the embedding application to pass to its `ApiClient` construction
/// (the `Impersonate-User` header is a transport concern).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Restrict LIST+WATCH to one namespace; empty means cluster scope
    pub watch_namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Worker pool size per controller
    pub max_concurrent_reconciles: usize,
    pub error_min_requeue_interval: u64,
    pub error_max_requeue_interval: u64,
    /// Sleep between watch restarts
    pub watch_retry_delay: u64,
    /// Bound on a single reconcile invocation, unbounded when absent
    pub reconcile_timeout: Option<u64>,
    pub leader_election_enabled: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    pub lease_duration: u64,
    pub renew_deadline: u64,
    pub retry_period: u64,
    /// Exit with code 2 on leadership loss instead of rejoining as follower
    pub exit_on_leadership_loss: bool,
    /// Lease holder identity; defaults to `<hostname>-<pid>`
    pub identity: Option<String>,
    pub user_impersonation: Option<String>,
    pub metrics_endpoint: String,
    pub liveness_endpoint: String,
    pub readiness_endpoint: String,
    pub startup_endpoint: String,
    pub listen_address: String,
    /// Webhook server port
    pub port: u16,
    /// Probe + metrics server port
    pub probe_port: u16,
    pub graceful_shutdown_timeout: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            label_selector: None,
            field_selector: None,
            max_concurrent_reconciles: 1,
            error_min_requeue_interval: 1,
            error_max_requeue_interval: 600,
            watch_retry_delay: 30,
            reconcile_timeout: None,
            leader_election_enabled: false,
            lease_name: "opkit-leader".to_string(),
            lease_namespace: "default".to_string(),
            lease_duration: 15,
            renew_deadline: 10,
            retry_period: 2,
            exit_on_leadership_loss: true,
            identity: None,
            user_impersonation: None,
            metrics_endpoint: "/metrics".to_string(),
            liveness_endpoint: "/healthz".to_string(),
            readiness_endpoint: "/readyz".to_string(),
            startup_endpoint: "/startupz".to_string(),
            listen_address: "0.0.0.0".to_string(),
            port: 8443,
            probe_port: 8081,
            graceful_shutdown_timeout: 30,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for endpoint in [
            &self.metrics_endpoint,
            &self.liveness_endpoint,
            &self.readiness_endpoint,
            &self.startup_endpoint,
        ] {
            if !endpoint.starts_with('/') {
                return Err(Error::InvalidConfig(format!(
                    "endpoint {endpoint:?} must start with '/'"
                )));
            }
        }
        if self.port == self.probe_port {
            return Err(Error::InvalidConfig(
                "webhook port and probe port must differ".to_string(),
            ));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::InvalidConfig(
                "maxConcurrentReconciles must be at least 1".to_string(),
            ));
        }
        if self.error_min_requeue_interval > self.error_max_requeue_interval {
            return Err(Error::InvalidConfig(
                "errorMinRequeueInterval must not exceed errorMaxRequeueInterval".to_string(),
            ));
        }
        if self.watch_retry_delay == 0 {
            return Err(Error::InvalidConfig(
                "watchRetryDelay must be at least 1 second".to_string(),
            ));
        }
        if self.leader_election_enabled {
            // reuse the elector's own validation for the lease parameters
            self.elector_config()?;
        }
        Ok(())
    }

    /// Selectors from this config as watch parameters
    #[must_use]
    pub fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(labels) = &self.label_selector {
            lp = lp.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            lp = lp.fields(fields);
        }
        lp
    }

    /// The watched namespace, `None` for cluster scope
    #[must_use]
    pub fn scope(&self) -> Option<String> {
        self.watch_namespace.clone().filter(|ns| !ns.is_empty())
    }

    #[must_use]
    pub fn watch_retry_delay_duration(&self) -> Duration {
        Duration::from_secs(self.watch_retry_delay)
    }

    #[must_use]
    pub fn graceful_shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout)
    }

    /// The address the webhook server should bind
    pub fn webhook_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.listen_address, self.port)
            .parse()
            .map_err(|err| Error::InvalidConfig(format!("bad listen address: {err}")))
    }

    fn probe_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.listen_address, self.probe_port)
            .parse()
            .map_err(|err| Error::InvalidConfig(format!("bad listen address: {err}")))
    }

    fn controller_config(&self) -> controller::Config {
        controller::Config {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            reconcile_timeout: self.reconcile_timeout.map(Duration::from_secs),
            error_min_requeue_interval: Duration::from_secs(self.error_min_requeue_interval),
            error_max_requeue_interval: Duration::from_secs(self.error_max_requeue_interval),
            ..controller::Config::default()
        }
    }

    fn elector_config(&self) -> Result<crate::elector::Config, Error> {
        ElectorConfigBuilder {
            name: self.lease_name.clone(),
            namespace: self.lease_namespace.clone(),
            identity: self.identity.clone().unwrap_or_else(default_identity),
            lease_duration: Duration::from_secs(self.lease_duration),
            renew_deadline: Duration::from_secs(self.renew_deadline),
            retry_period: Duration::from_secs(self.retry_period),
            ..Default::default()
        }
        .finish()
        .map_err(|err| Error::InvalidConfig(err.to_string()))
    }
}

fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "opkit".to_string());
    format!("{host}-{}", std::process::id())
}

type SyncedCheck = Box<dyn Fn() -> bool + Send + Sync>;
type StartFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

struct ManagedController {
    name: String,
    start: StartFn,
    health: Arc<WatchHealth>,
    synced: SyncedCheck,
}

/// Aggregated state behind the probe endpoints
struct HealthState {
    started: AtomicBool,
    draining: AtomicBool,
    leading: watch::Receiver<bool>,
    watchers: Vec<(String, Arc<WatchHealth>)>,
    liveness_threshold: Duration,
    metrics: Arc<Metrics>,
}

impl HealthState {
    /// Liveness fails once any watcher has been disconnected longer than
    /// twice the watch retry delay
    fn live(&self) -> bool {
        self.watchers.iter().all(|(_, health)| {
            health
                .disconnected_for()
                .map_or(true, |d| d < self.liveness_threshold)
        })
    }

    /// Readiness fails during leader transitions and while draining
    fn ready(&self) -> bool {
        *self.leading.borrow() && !self.draining.load(Ordering::SeqCst)
    }

    /// Startup succeeds once the initial LIST completed for every controller
    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn probe_router(state: Arc<HealthState>, config: &ManagerConfig) -> Router {
    async fn check(ok: bool) -> StatusCode {
        if ok {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
    Router::new()
        .route(
            &config.liveness_endpoint,
            get(|State(s): State<Arc<HealthState>>| async move { check(s.live()).await }),
        )
        .route(
            &config.readiness_endpoint,
            get(|State(s): State<Arc<HealthState>>| async move { check(s.ready()).await }),
        )
        .route(
            &config.startup_endpoint,
            get(|State(s): State<Arc<HealthState>>| async move { check(s.started()).await }),
        )
        .route(
            &config.metrics_endpoint,
            get(|State(s): State<Arc<HealthState>>| async move { s.metrics.render() }),
        )
        .with_state(state)
}

/// Owns controllers, the optional webhook server, leader election and the
/// probe endpoints, and runs them with the documented startup and shutdown
/// order.
pub struct ControllerManager {
    config: ManagerConfig,
    client: Arc<dyn ApiClient>,
    controllers: Vec<ManagedController>,
    webhooks: Option<WebhookServer>,
    metrics: Arc<Metrics>,
}

impl ControllerManager {
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>, config: ManagerConfig) -> Self {
        Self {
            config,
            client,
            controllers: Vec::new(),
            webhooks: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// The shared client handed to controllers and the elector
    #[must_use]
    pub fn client(&self) -> Arc<dyn ApiClient> {
        self.client.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Attach the webhook server; it is started last and stopped first.
    pub fn webhook_server(&mut self, server: WebhookServer) -> &mut Self {
        self.webhooks = Some(server);
        self
    }

    /// Register a controller under `name` with its reconcile callbacks.
    ///
    /// The manager applies its own worker-pool, retry and watch-backoff
    /// settings to the controller, owns its lifecycle, and feeds its results
    /// into logs and metrics.
    pub fn register<K, ReconcilerFut, T>(
        &mut self,
        name: &str,
        controller: Controller<K>,
        reconciler: impl FnMut(Arc<K>, Context<T>) -> ReconcilerFut + Send + 'static,
        error_policy: impl FnMut(&ReconcilerFut::Error, Context<T>) -> Action + Send + 'static,
        context: Context<T>,
    ) -> &mut Self
    where
        K: Clone + Resource + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Debug + Eq + Hash + Clone + Unpin + Send + Sync,
        ReconcilerFut: TryFuture<Ok = Action> + Send + 'static,
        ReconcilerFut::Error: std::error::Error + Send + 'static,
        T: Send + Sync + 'static,
    {
        let controller = controller
            .with_config(self.config.controller_config())
            .trigger_backoff(fixed_backoff(self.config.watch_retry_delay_duration()));
        let health = controller.health();
        let store = controller.store();
        let synced: SyncedCheck = Box::new(move || store.is_ready());
        let metrics = self.metrics.clone();
        let controller_name = name.to_string();
        let log_name = controller_name.clone();
        let start: StartFn = Box::new(move |token: CancellationToken| {
            controller
                .graceful_shutdown_on(token.cancelled_owned())
                .run(reconciler, error_policy, context)
                .for_each(move |res| {
                    match &res {
                        Ok((obj_ref, _action)) => {
                            tracing::debug!(controller = %log_name, object = %obj_ref, "reconciled");
                            metrics.reconcile.runs.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            tracing::warn!(controller = %log_name, error = %err, "reconcile failed");
                            metrics.reconcile.runs.fetch_add(1, Ordering::Relaxed);
                            metrics.reconcile.failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    async {}
                })
                .boxed()
        });
        self.controllers.push(ManagedController {
            name: controller_name,
            start,
            health,
            synced,
        });
        self
    }

    /// Run until shutdown is requested by signal, returning the exit status
    /// the process should report.
    pub async fn run(self) -> Result<ExitStatus, Error> {
        self.run_with_shutdown(shutdown_signal()).await
    }

    /// [`ControllerManager::run`] with an explicit shutdown trigger instead
    /// of process signals.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl futures::Future<Output = ()> + Send,
    ) -> Result<ExitStatus, Error> {
        let ControllerManager {
            config,
            client,
            controllers,
            webhooks,
            metrics,
        } = self;
        config.validate()?;
        let mut controllers = Some(controllers);
        let mut webhooks = webhooks;

        let (leading_tx, leading_rx) = watch::channel(!config.leader_election_enabled);
        let health = Arc::new(HealthState {
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            leading: leading_rx,
            watchers: controllers
                .as_ref()
                .map(|cs| cs.iter().map(|c| (c.name.clone(), c.health.clone())).collect())
                .unwrap_or_default(),
            liveness_threshold: 2 * config.watch_retry_delay_duration(),
            metrics,
        });

        // 1. probes come up first so orchestrators can see us starting
        let probe_listener = tokio::net::TcpListener::bind(config.probe_addr()?)
            .await
            .map_err(Error::Bind)?;
        let probe_app = probe_router(health.clone(), &config);
        let probe_task = tokio::spawn(async move {
            if let Err(err) = axum::serve(probe_listener, probe_app).await {
                tracing::error!(error = %err, "probe server failed");
            }
        });

        // 2. leader election gates everything that writes to the cluster
        let elector = if config.leader_election_enabled {
            Some(LeaderElector::spawn(config.elector_config()?, client.clone()))
        } else {
            None
        };

        let shutdown = shutdown.fuse();
        futures::pin_mut!(shutdown);
        let mut status = ExitStatus::Clean;

        'lifecycle: loop {
            health.draining.store(false, Ordering::SeqCst);
            if let Some(elector) = &elector {
                let mut state = elector.state();
                tracing::info!("waiting to acquire leadership");
                tokio::select! {
                    res = state.wait_for(|s| s.is_leader()) => {
                        if res.is_err() {
                            break 'lifecycle;
                        }
                        let _ = leading_tx.send(true);
                        tracing::info!("acquired leadership, starting controllers");
                    }
                    () = &mut shutdown => break 'lifecycle,
                }
            }

            // 3. start controllers and wait for every cache to sync
            let token = CancellationToken::new();
            let mut tasks = Vec::new();
            let mut synced_checks = Vec::new();
            for managed in controllers.take().unwrap_or_default() {
                tracing::info!(controller = %managed.name, "starting controller");
                tasks.push(tokio::spawn((managed.start)(token.child_token())));
                synced_checks.push(managed.synced);
            }
            loop {
                if synced_checks.iter().all(|synced| synced()) {
                    break;
                }
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(100)) => {}
                    () = &mut shutdown => {
                        drain(token, tasks, &config, &health).await;
                        break 'lifecycle;
                    }
                }
            }
            health.started.store(true, Ordering::SeqCst);
            tracing::info!("all caches synced");

            // 4. webhooks last; they answer regardless of leadership
            let webhook_token = token.child_token();
            let webhook_task = webhooks.take().map(|server| {
                tokio::spawn(async move {
                    if let Err(err) = server.run(webhook_token).await {
                        tracing::error!(error = %err, "webhook server failed");
                    }
                })
            });

            // 5. run until shutdown or leadership loss
            let lost = async {
                match &elector {
                    Some(elector) => {
                        let mut state = elector.state();
                        let _ = state.wait_for(|s| !s.is_leader()).await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            };
            tokio::select! {
                () = &mut shutdown => {
                    drain(token, tasks, &config, &health).await;
                    if let Some(task) = webhook_task {
                        let _ = task.await;
                    }
                    break 'lifecycle;
                }
                () = lost => {
                    tracing::warn!("leadership lost, halting controllers");
                    let _ = leading_tx.send(false);
                    drain(token, tasks, &config, &health).await;
                    if let Some(task) = webhook_task {
                        task.abort();
                    }
                    if config.exit_on_leadership_loss {
                        status = ExitStatus::LeadershipLost;
                        break 'lifecycle;
                    }
                    // rejoin as follower; note that controllers are consumed
                    // on start, so without registered controllers remaining
                    // this degrades to waiting for shutdown
                    health.started.store(false, Ordering::SeqCst);
                    continue 'lifecycle;
                }
            }
        }

        // reverse order teardown: webhooks and workers are gone, release the
        // lease, then drop the probes
        if let Some(elector) = elector {
            let _ = elector.shutdown().await;
        }
        probe_task.abort();
        tracing::info!(status = ?status, "manager stopped");
        Ok(status)
    }
}

/// Cancel controllers and wait for in-flight reconciles, bounded by the
/// graceful shutdown window.
async fn drain(
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    config: &ManagerConfig,
    health: &Arc<HealthState>,
) {
    health.draining.store(true, Ordering::SeqCst);
    token.cancel();
    let waits = futures::future::join_all(tasks);
    if tokio::time::timeout(config.graceful_shutdown_duration(), waits)
        .await
        .is_err()
    {
        tracing::warn!("graceful shutdown window elapsed with reconciles still running");
    }
}

async fn shutdown_signal() {
    futures::future::select(
        tokio::signal::ctrl_c().map(|_| ()).boxed(),
        #[cfg(unix)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler")
            .recv()
            .map(|_| ())
            .boxed(),
        #[cfg(not(unix))]
        futures::future::pending::<()>().boxed(),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::{HealthState, ManagerConfig};
    use crate::{metrics::Metrics, watcher::WatchHealth};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::Duration;
    use tokio::sync::watch;

    #[test]
    fn default_config_validates() {
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn config_rejects_bad_values() {
        let bad = ManagerConfig {
            liveness_endpoint: "healthz".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ManagerConfig {
            probe_port: 8443,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ManagerConfig {
            max_concurrent_reconciles: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ManagerConfig {
            leader_election_enabled: true,
            lease_duration: 5,
            renew_deadline: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn config_deserializes_from_camel_case() {
        let config: ManagerConfig = serde_json::from_value(serde_json::json!({
            "watchNamespace": "team-a",
            "maxConcurrentReconciles": 4,
            "errorMinRequeueInterval": 2,
            "leaderElectionEnabled": true,
            "leaseDuration": 30,
            "renewDeadline": 20,
        }))
        .unwrap();
        assert_eq!(config.scope().as_deref(), Some("team-a"));
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert!(config.leader_election_enabled);
        assert_eq!(config.lease_duration, 30);
        // untouched keys keep their defaults
        assert_eq!(config.watch_retry_delay, 30);
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn health_state_probe_semantics() {
        let (leading_tx, leading_rx) = watch::channel(false);
        let watch_health = Arc::new(WatchHealth::default());
        let state = HealthState {
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            leading: leading_rx,
            watchers: vec![("widgets".into(), watch_health.clone())],
            liveness_threshold: Duration::from_secs(60),
            metrics: Arc::new(Metrics::new()),
        };
        // not leading and not started yet
        assert!(!state.ready());
        assert!(!state.started());
        // never-disconnected watchers are live
        assert!(state.live());

        leading_tx.send(true).unwrap();
        assert!(state.ready());
        state.draining.store(true, Ordering::SeqCst);
        assert!(!state.ready());
    }
}
