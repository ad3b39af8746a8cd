//! Lease-based leader election built on the `coordination.k8s.io/v1` API.
//!
//! Every replica runs a `LeaderElector` task: followers poll the lease every
//! `retry_period`, the leader refreshes it every `renew_deadline / 2`, and a
//! leader that cannot renew within `renew_deadline` demotes itself and
//! surfaces the loss through its state channel. Controllers subscribe to that
//! channel to start work on `Leading` and cancel it on anything else.
//!
//! A client only acts on timestamps captured locally to infer the state of
//! the leader election. Timestamps inside the lease record are never compared
//! against the local clock, only their *changes* indicate that another client
//! has renewed the lease. The implementation is therefore tolerant to
//! arbitrary clock skew, but not to arbitrary clock skew *rate*; the
//! tolerated ratio is roughly `lease_duration / renew_deadline`.
//!
//! Note that this does not guarantee fencing: a paused leader may act for a
//! short window after its lease has been taken over.

use std::{sync::Arc, time::Duration};

use futures::prelude::*;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use opkit_core::client::{ApiClient, ClientError};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// The jitter factor applied to poll delays to mitigate thundering herds.
const JITTER_FACTOR: f64 = 1.2;

/// Leader election error variants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid leader election config: {0}")]
    ConfigError(String),
    #[error("timeout while updating the lease")]
    TimeoutError,
    #[error("client error from lease call: {0}")]
    ClientError(#[source] ClientError),
    #[error("error from the leader elector task: {0}")]
    TaskError(String),
}

/// Leader election result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fully validated configuration for use by a [`LeaderElector`] instance.
///
/// Construct an instance via `ConfigBuilder::finish()`.
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// The name of the lease object.
    pub name: String,
    /// The namespace of the lease object.
    pub namespace: String,
    /// The identity to use when the lease is acquired.
    ///
    /// Typically this value will directly correspond to the name of the pod
    /// running this process.
    pub identity: String,
    /// The duration that non-leader candidates will wait to force acquire
    /// leadership. This is measured against the time of last observed change
    /// to the record.
    ///
    /// A client needs to wait a full `lease_duration` without observing a
    /// change to the record before it can attempt to take over, so this
    /// should be as short as your clock-skew tolerance allows.
    ///
    /// Core clients default this value to 15 seconds.
    pub lease_duration: Duration,
    /// The duration within which the current lease holder must manage to
    /// refresh the lease before considering its leadership lost.
    ///
    /// Core clients default this value to 10 seconds.
    pub renew_deadline: Duration,
    /// The duration which follower candidates wait between polls of the
    /// lease.
    ///
    /// Core clients default this value to 2 seconds.
    pub retry_period: Duration,
    /// API timeout to use for individual lease calls.
    pub api_timeout: Duration,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: "default".to_string(),
            identity: String::new(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(5),
        }
    }
}

impl ConfigBuilder {
    /// Finish building leader elector config by validating this config builder.
    ///
    /// # Errors
    /// Will return `Error::ConfigError` if the fields are invalid according
    /// to the following constraints:
    /// - `name` and `identity` must not be empty strings;
    /// - `lease_duration` must be greater than `renew_deadline`;
    /// - `renew_deadline` must be greater than `JITTER_FACTOR * retry_period`;
    /// - all durations must be at least 1 second.
    pub fn finish(self) -> Result<Config> {
        if self.name.is_empty() {
            return Err(Error::ConfigError("lease name may not be empty".into()));
        }
        if self.identity.is_empty() {
            return Err(Error::ConfigError("identity may not be empty".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::ConfigError(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline <= Duration::from_secs_f64(JITTER_FACTOR * self.retry_period.as_secs_f64()) {
            return Err(Error::ConfigError(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        if self.lease_duration.as_secs() < 1 {
            return Err(Error::ConfigError(
                "lease_duration must be at least 1 second".into(),
            ));
        }
        if self.renew_deadline.as_secs() < 1 {
            return Err(Error::ConfigError(
                "renew_deadline must be at least 1 second".into(),
            ));
        }
        if self.retry_period.as_secs() < 1 {
            return Err(Error::ConfigError(
                "retry_period must be at least 1 second".into(),
            ));
        }
        if self.api_timeout.as_secs() < 1 {
            return Err(Error::ConfigError("api_timeout must be at least 1 second".into()));
        }
        Ok(Config(self))
    }
}

/// A task which is responsible for acquiring and maintaining a
/// `coordination.k8s.io/v1` `Lease` to establish leadership.
pub struct LeaderElector {
    /// The lease operations capability.
    client: Arc<dyn ApiClient>,
    /// Leader election config.
    config: ConfigBuilder,
    /// The internal state of this task.
    state: State,
    /// The state signal, which always reflects the current internal state of
    /// this task.
    state_tx: watch::Sender<LeaderState>,
    /// Shutdown channel.
    shutdown: oneshot::Receiver<()>,
    /// A bool indicating that there was an error encountered on the last
    /// attempt to acquire the lease.
    ///
    /// This is used as a simple retry / backoff indicator.
    had_error_on_last_try: bool,
}

impl LeaderElector {
    /// Create a new `LeaderElector` instance & spawn it onto the runtime for
    /// execution.
    #[must_use = "handle must be used for observing state changes and graceful shutdown"]
    pub fn spawn(config: Config, client: Arc<dyn ApiClient>) -> LeaderElectorHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = LeaderElector {
            client,
            config: config.0,
            state_tx,
            state: State::Standby,
            shutdown: shutdown_rx,
            had_error_on_last_try: false,
        };
        let handle = tokio::spawn(this.run());
        LeaderElectorHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    async fn run(mut self) {
        tracing::info!(lease = %self.config.name, identity = %self.config.identity, "leader elector task started");

        // Perform an initial pass at acquiring / renewing the lease.
        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = %err, "error attempting to acquire/renew lease");
            self.had_error_on_last_try = true;
        }

        loop {
            let delay_duration = self.get_next_acquire_renew_time();
            tracing::debug!("delaying for {}ms", delay_duration.as_millis());
            let delay = tokio::time::sleep(delay_duration);
            tokio::select! {
                () = delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = %err, "error during call to try_acquire_or_renew");
                        self.had_error_on_last_try = true;
                        self.handle_renew_failure();
                    }
                }
                _ = &mut self.shutdown => break,
            }
        }

        self.release_if_leading().await;
        tracing::info!("leader elector task terminated");
    }

    /// Demote when the last successful renewal has fallen outside the renew
    /// deadline; a single failed call inside the deadline keeps leadership.
    fn handle_renew_failure(&mut self) {
        if let State::Leading { last_renew, .. } = &self.state {
            if last_renew.elapsed() >= self.config.renew_deadline {
                tracing::warn!("failed to renew lease within renew_deadline, relinquishing leadership");
                self.state = State::Standby;
                self.publish_state();
            }
        }
    }

    /// Best-effort lease release on shutdown, so a replacement does not have
    /// to wait out the full lease_duration.
    async fn release_if_leading(&mut self) {
        let State::Leading { lease, .. } = &self.state else {
            return;
        };
        let mut lease = lease.clone();
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = None;
            spec.acquire_time = None;
        }
        let res = timeout(
            self.config.api_timeout,
            self.client.create_or_update_lease(&lease),
        )
        .await;
        match res {
            Ok(Ok(_)) => tracing::info!("released lease on shutdown"),
            Ok(Err(err)) => tracing::warn!(error = %err, "failed to release lease on shutdown"),
            Err(_) => tracing::warn!("timed out releasing lease on shutdown"),
        }
        self.state = State::Standby;
        self.publish_state();
    }

    /// Fetch the target lease from the API, and update observation info as
    /// needed.
    async fn fetch_lease_and_update(&mut self) -> Result<()> {
        let lease_opt = timeout(
            self.config.api_timeout,
            self.client.get_lease(&self.config.namespace, &self.config.name),
        )
        .await
        .map_err(|_err| Error::TimeoutError)?
        .map_err(Error::ClientError)?;
        self.update_observation(lease_opt);
        Ok(())
    }

    /// Attempt to acquire or renew the target lease.
    #[allow(clippy::cast_possible_truncation)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        // 1. Refresh our view of the lease unless we are the holder.
        if matches!(&self.state, State::Following { .. } | State::Standby) {
            self.fetch_lease_and_update().await?;
        }

        // 2. If following and the lease is not expired (according to our own
        // local time records), there is nothing to do.
        if matches!(&self.state, State::Following { .. }) && !self.is_observed_expired() {
            self.had_error_on_last_try = false;
            return Ok(());
        }

        // 3. We are either the holder (renew), or the lease is free/expired
        // (acquire). Build up the changeset.
        let acquiring = !matches!(&self.state, State::Leading { .. });
        let now = chrono::Utc::now();
        let mut lease = self.state.get_lease().cloned().unwrap_or_default();
        lease
            .metadata
            .name
            .get_or_insert_with(|| self.config.name.clone());
        lease
            .metadata
            .namespace
            .get_or_insert_with(|| self.config.namespace.clone());
        lease.metadata.managed_fields = None;
        let spec = lease.spec.get_or_insert_with(Default::default);
        spec.lease_duration_seconds = Some(self.config.lease_duration.as_secs() as i32);
        spec.renew_time = Some(MicroTime(now));
        if acquiring {
            spec.holder_identity = Some(self.config.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |val| val + 1));
        }

        // 4. Write the lease back; optimistic concurrency on the carried
        // resourceVersion surfaces racing acquirers as conflicts.
        let lease = timeout(
            self.config.api_timeout,
            self.client.create_or_update_lease(&lease),
        )
        .await
        .map_err(|_err| Error::TimeoutError)?
        .map_err(Error::ClientError)?;
        self.had_error_on_last_try = false;
        self.state = State::Leading {
            lease,
            last_renew: Instant::now(),
        };
        self.publish_state();
        Ok(())
    }

    /// Update task state based upon an observed lease.
    fn update_observation(&mut self, lease_opt: Option<Lease>) {
        let Some(lease) = lease_opt else {
            // lease missing: free for acquisition
            self.state = State::Standby;
            self.publish_state();
            return;
        };

        let holder = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.holder_identity.clone())
            .unwrap_or_default();
        let renew_stamp = lease
            .spec
            .as_ref()
            .and_then(|spec| spec.renew_time.as_ref())
            .map(|t| t.0.to_rfc3339());
        if holder == self.config.identity {
            // The server still shows us as the holder; keep leading with the
            // freshest copy so renewals carry the right resourceVersion.
            self.state = State::Leading {
                lease,
                last_renew: match &self.state {
                    State::Leading { last_renew, .. } => *last_renew,
                    _ => Instant::now(),
                },
            };
        } else if holder.is_empty() {
            // An empty holder means the lease is open for acquisition.
            self.state = State::Standby;
        } else {
            // Someone else holds it; restart the expiry clock only when their
            // renew stamp actually moved.
            let last_change = match &self.state {
                State::Following {
                    leader,
                    renew_stamp: old_stamp,
                    last_change,
                    ..
                } if *leader == holder && *old_stamp == renew_stamp => *last_change,
                _ => Instant::now(),
            };
            self.state = State::Following {
                leader: holder,
                lease,
                renew_stamp,
                last_change,
            };
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let observed = match &self.state {
            State::Leading { .. } => LeaderState::Leading,
            State::Following { .. } => LeaderState::Following,
            State::Standby => LeaderState::Standby,
        };
        self.state_tx.send_if_modified(|val| {
            if *val == observed {
                false
            } else {
                *val = observed;
                true
            }
        });
    }

    /// Get the duration to delay before attempting the next lease update.
    fn get_next_acquire_renew_time(&mut self) -> Duration {
        match &self.state {
            // As leader, renew well inside the deadline.
            State::Leading { .. } => self.config.renew_deadline / 2,
            // As follower, poll on the retry period with jitter to mitigate
            // contention between candidates.
            State::Following { .. } => {
                let rand_val: f64 = rand::thread_rng().gen_range(0.01..1.0);
                let jitter = rand_val * (JITTER_FACTOR - 1.0) * self.config.retry_period.as_secs_f64();
                self.config.retry_period + Duration::from_secs_f64(jitter)
            }
            // After an error, hold off for about a retry period.
            State::Standby if self.had_error_on_last_try => {
                self.had_error_on_last_try = false;
                let rand_val: f64 = rand::thread_rng().gen_range(0.5..1.5);
                Duration::from_secs_f64(rand_val * self.config.retry_period.as_secs_f64())
            }
            // Never observed, or recently freed: acquire now.
            State::Standby => Duration::from_secs(0),
        }
    }

    /// Check if the observed lease is expired.
    ///
    /// If the lease is unknown due to being in state `Standby`, this function
    /// will return `true`.
    fn is_observed_expired(&self) -> bool {
        match &self.state {
            State::Leading { last_renew, .. } => {
                last_renew.elapsed() >= self.config.lease_duration
            }
            State::Following { last_change, .. } => {
                last_change.elapsed() >= self.config.lease_duration
            }
            State::Standby => true,
        }
    }
}

/// The private state of the leader elector task.
#[derive(Clone, Debug)]
enum State {
    /// This client instance is the leader.
    Leading {
        /// The last written lease state.
        lease: Lease,
        /// The last time we successfully renewed the lease.
        last_renew: Instant,
    },
    /// A different client is currently the leader, identified by the
    /// encapsulated identity.
    Following {
        /// The ID of the current leader.
        leader: String,
        /// The last observed lease state.
        lease: Lease,
        /// The leader's renew stamp at the last observed change.
        renew_stamp: Option<String>,
        /// The local time at which the lease record last changed.
        last_change: Instant,
    },
    /// The lease state is unknown, does not exist, or the task is starting
    /// or stopping.
    Standby,
}

impl State {
    /// Get a reference to the last known lease state.
    fn get_lease(&self) -> Option<&Lease> {
        match self {
            Self::Leading { lease, .. } | Self::Following { lease, .. } => Some(lease),
            Self::Standby => None,
        }
    }
}

/// Different states which a leader elector may be in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// This client instance is the leader.
    Leading,
    /// A different client is currently the leader.
    Following,
    /// The lease state is unknown, does not exist, or the corresponding
    /// leader elector task is starting or stopping.
    Standby,
}

impl LeaderState {
    /// Check if currently in `Leading` state.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leading)
    }
}

/// A handle to a leader elector task.
pub struct LeaderElectorHandle {
    /// Shutdown channel.
    shutdown: oneshot::Sender<()>,
    /// A watch signal over the observed leader state.
    state: watch::Receiver<LeaderState>,
    /// A join handle to the spawned leader elector task.
    handle: JoinHandle<()>,
}

impl LeaderElectorHandle {
    /// Get a handle to the state signal of this leader elector task.
    ///
    /// This signal receiver may be embedded in other parts of a program and
    /// used to govern actions taken by the app in accordance with leader
    /// election state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Shutdown this leader elector task and return its underlying join
    /// handle.
    ///
    /// A leading elector releases the lease on the way out so a replacement
    /// does not have to wait out the full lease duration.
    pub fn shutdown(self) -> impl Future<Output = Result<()>> {
        let _res = self.shutdown.send(());
        self.handle.map_err(|res| Error::TaskError(res.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigBuilder, LeaderElector, LeaderState};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use k8s_openapi::api::coordination::v1::Lease;
    use opkit_core::{
        client::{ApiClient, ClientError, ObjectList},
        error::ErrorResponse,
        params::{ListParams, Patch},
        GroupVersionResource,
    };
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};
    use tokio::time::timeout;

    /// An in-memory lease server with apiserver-style optimistic concurrency
    #[derive(Default)]
    struct FakeLeaseServer {
        lease: Mutex<Option<Lease>>,
        revision: Mutex<u64>,
    }

    impl FakeLeaseServer {
        fn holder(&self) -> Option<String> {
            self.lease
                .lock()
                .as_ref()
                .and_then(|l| l.spec.as_ref())
                .and_then(|s| s.holder_identity.clone())
                .filter(|h| !h.is_empty())
        }
    }

    #[async_trait]
    impl ApiClient for FakeLeaseServer {
        async fn list(
            &self,
            _gvr: &GroupVersionResource,
            _namespace: Option<&str>,
            _params: &ListParams,
            _rv: &str,
        ) -> Result<ObjectList, ClientError> {
            unreachable!("lease elector only uses lease calls")
        }

        async fn watch(
            &self,
            _gvr: &GroupVersionResource,
            _namespace: Option<&str>,
            _params: &ListParams,
            _rv: &str,
            _bookmarks: bool,
        ) -> Result<BoxStream<'static, Result<opkit_core::WatchEvent<serde_json::Value>, ClientError>>, ClientError>
        {
            unreachable!("lease elector only uses lease calls")
        }

        async fn patch(
            &self,
            _gvr: &GroupVersionResource,
            _namespace: Option<&str>,
            _name: &str,
            _patch: &Patch,
        ) -> Result<serde_json::Value, ClientError> {
            unreachable!("lease elector only uses lease calls")
        }

        async fn update(
            &self,
            _gvr: &GroupVersionResource,
            _namespace: Option<&str>,
            _name: &str,
            _object: &serde_json::Value,
        ) -> Result<serde_json::Value, ClientError> {
            unreachable!("lease elector only uses lease calls")
        }

        async fn get_lease(&self, _ns: &str, _name: &str) -> Result<Option<Lease>, ClientError> {
            Ok(self.lease.lock().clone())
        }

        async fn create_or_update_lease(&self, lease: &Lease) -> Result<Lease, ClientError> {
            let mut stored = self.lease.lock();
            if let Some(existing) = stored.as_ref() {
                if existing.metadata.resource_version != lease.metadata.resource_version {
                    return Err(ClientError::Api(ErrorResponse {
                        status: "Failure".into(),
                        message: "the object has been modified".into(),
                        reason: "Conflict".into(),
                        code: 409,
                    }));
                }
            }
            let mut revision = self.revision.lock();
            *revision += 1;
            let mut accepted = lease.clone();
            accepted.metadata.resource_version = Some(revision.to_string());
            *stored = Some(accepted.clone());
            Ok(accepted)
        }
    }

    fn config(identity: &str) -> super::Config {
        ConfigBuilder {
            name: "opkit-leader".into(),
            namespace: "default".into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(5),
        }
        .finish()
        .unwrap()
    }

    #[test]
    fn config_validation_rejects_inverted_durations() {
        let bad = ConfigBuilder {
            name: "l".into(),
            identity: "i".into(),
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(bad.finish().is_err());

        let bad = ConfigBuilder {
            name: "l".into(),
            identity: "i".into(),
            retry_period: Duration::from_secs(9),
            ..Default::default()
        };
        assert!(bad.finish().is_err());

        assert!(ConfigBuilder {
            name: "l".into(),
            identity: "i".into(),
            ..Default::default()
        }
        .finish()
        .is_ok());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn elector_acquires_a_free_lease() {
        let server = Arc::new(FakeLeaseServer::default());
        let handle = LeaderElector::spawn(config("r1"), server.clone());
        let mut state = handle.state();
        timeout(Duration::from_secs(30), state.wait_for(|s| s.is_leader()))
            .await
            .expect("acquisition timed out")
            .unwrap();
        assert_eq!(server.holder().as_deref(), Some("r1"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn follower_defers_to_live_leader_and_takes_over_after_expiry() {
        let server = Arc::new(FakeLeaseServer::default());
        let leader = LeaderElector::spawn(config("r1"), server.clone());
        let mut leader_state = leader.state();
        timeout(Duration::from_secs(30), leader_state.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();

        let follower = LeaderElector::spawn(config("r2"), server.clone());
        let mut follower_state = follower.state();
        timeout(
            Duration::from_secs(30),
            follower_state.wait_for(|s| *s == LeaderState::Following),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(server.holder().as_deref(), Some("r1"));

        // kill the leader without a release; the follower must wait out the
        // full lease_duration before usurping
        leader.handle.abort();
        timeout(Duration::from_secs(60), follower_state.wait_for(|s| s.is_leader()))
            .await
            .expect("takeover timed out")
            .unwrap();
        assert_eq!(server.holder().as_deref(), Some("r2"));
        follower.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_releases_the_lease_for_fast_handoff() {
        let server = Arc::new(FakeLeaseServer::default());
        let r1 = LeaderElector::spawn(config("r1"), server.clone());
        let mut r1_state = r1.state();
        timeout(Duration::from_secs(30), r1_state.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();

        r1.shutdown().await.unwrap();
        assert_eq!(server.holder(), None);

        let r2 = LeaderElector::spawn(config("r2"), server.clone());
        let mut r2_state = r2.state();
        // no expiry wait needed since the lease was released
        timeout(Duration::from_secs(10), r2_state.wait_for(|s| s.is_leader()))
            .await
            .expect("released lease should be acquired quickly")
            .unwrap();
        r2.shutdown().await.unwrap();
    }
}
