//! Registration lifecycle of this process: register, heartbeat, recover, deregister

use registry_core::{
    BackoffExecutor, HeartbeatError, HeartbeatPolicy, InstanceRecord, InstanceStatus, RegistryError, Result,
    RetryPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::transport::RegistryTransport;

/// Registration state of the agent's instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registered,
    ShuttingDown,
    Stopped,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AgentState::Registered,
            2 => AgentState::ShuttingDown,
            3 => AgentState::Stopped,
            _ => AgentState::Unregistered,
        }
    }
}

/// Agent tuning
///
/// `retry` bounds the one-shot registration in [`RegistrationAgent::start`];
/// `heartbeat` shapes the unbounded retries of the background loop.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    pub retry: RetryPolicy,
    pub heartbeat: HeartbeatPolicy,
    /// Propagate a failed initial registration out of `start()`
    pub fail_fast: bool,
    /// Longest wait for the heartbeat loop to exit during shutdown
    pub shutdown_timeout: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
            fail_fast: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    transport: Arc<RegistryTransport>,
    app_name: String,
    instance_id: String,
    renewal_interval: Duration,
    heartbeat_policy: HeartbeatPolicy,
    // Held for the duration of every register/heartbeat/deregister/status call
    instance: Mutex<InstanceRecord>,
    // Written only while `instance` is locked
    state: AtomicU8,
    loop_running: AtomicBool,
    // Set while a register call is outstanding; stays set if its task is aborted
    registration_in_flight: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl Shared {
    fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state as u8, Ordering::SeqCst);
        if let Some(metrics) = self.transport.metrics() {
            metrics.registered.set(i64::from(state == AgentState::Registered));
        }
    }

    async fn register_once(&self) -> Result<()> {
        let instance = self.instance.lock().await;
        match self.state() {
            AgentState::Registered => Ok(()),
            AgentState::ShuttingDown | AgentState::Stopped => Err(RegistryError::ShuttingDown),
            AgentState::Unregistered => self.register_locked(&instance).await,
        }
    }

    // Caller holds the instance lock.
    async fn register_locked(&self, instance: &InstanceRecord) -> Result<()> {
        self.registration_in_flight.store(true, Ordering::SeqCst);
        let outcome = self.transport.register(instance).await;
        self.registration_in_flight.store(false, Ordering::SeqCst);
        match &outcome {
            Ok(()) => {
                self.set_state(AgentState::Registered);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if let Some(metrics) = self.transport.metrics() {
                    metrics.registration("success");
                }
            }
            Err(_) => {
                if let Some(metrics) = self.transport.metrics() {
                    metrics.registration("failure");
                }
            }
        }
        outcome
    }

    /// Run one heartbeat-loop tick and return the wait before the next one
    async fn tick(&self, current_interval: Duration) -> Duration {
        let instance = self.instance.lock().await;

        match self.state() {
            AgentState::ShuttingDown | AgentState::Stopped => current_interval,
            AgentState::Unregistered => match self.register_locked(&instance).await {
                Ok(()) => {
                    info!("Registered {} from the heartbeat loop", self.instance_id);
                    self.renewal_interval
                }
                Err(e) => {
                    warn!(
                        "Registration of {} failed, retrying in {:?}: {}",
                        self.instance_id, current_interval, e
                    );
                    current_interval
                }
            },
            AgentState::Registered => self.heartbeat_locked(&instance, current_interval).await,
        }
    }

    async fn heartbeat_locked(&self, instance: &InstanceRecord, current_interval: Duration) -> Duration {
        let metrics = self.transport.metrics();

        match self.transport.heartbeat(&self.app_name, &self.instance_id).await {
            Ok(()) => {
                if let Some(metrics) = metrics {
                    metrics.heartbeat("success");
                }
                let failures = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if failures > 0 {
                    info!("Heartbeat recovered after {} failures", failures);
                }
                self.renewal_interval
            }
            Err(HeartbeatError::InstanceNotFound { .. }) => {
                if let Some(metrics) = metrics {
                    metrics.heartbeat("not_found");
                }
                warn!(
                    "Instance {} is unknown to the registry, re-registering",
                    self.instance_id
                );
                self.set_state(AgentState::Unregistered);

                match self.register_locked(instance).await {
                    Ok(()) => {
                        info!("Re-registered {} after eviction", self.instance_id);
                        self.renewal_interval
                    }
                    Err(e) => {
                        warn!(
                            "Re-registration of {} failed, retrying next tick: {}",
                            self.instance_id, e
                        );
                        current_interval
                    }
                }
            }
            Err(HeartbeatError::Transport(e)) => {
                if let Some(metrics) = metrics {
                    metrics.heartbeat("failure");
                }
                // Stay Registered: eviction is the registry's call, not ours
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let next = self.heartbeat_policy.interval(self.renewal_interval, failures);
                warn!(
                    "Heartbeat failed (attempt {}), next in {:?}: {}",
                    failures, next, e
                );
                next
            }
        }
    }
}

/// Clears the loop-running flag however the loop task ends, abort and panic included
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn heartbeat_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let _running = RunningGuard(&shared.loop_running);
    let mut interval = shared.renewal_interval;
    info!(
        "Heartbeat loop started for {} (every {:?})",
        shared.instance_id, interval
    );

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if *stop.borrow() {
                    break;
                }
                interval = shared.tick(interval).await;
            }
            changed = stop.changed() => {
                // Sender gone: the agent was dropped
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Heartbeat loop stopped for {}", shared.instance_id);
}

/// Owns the registration of one instance
///
/// `start()` registers with bounded retries and always launches the
/// heartbeat loop, which keeps the lease alive and re-registers after
/// eviction or an initial failure. `shutdown()` stops the loop and
/// deregisters; wire it into the host's graceful shutdown. Dropping the
/// agent stops the loop without deregistering.
pub struct RegistrationAgent {
    shared: Arc<Shared>,
    options: AgentOptions,
    stop_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

impl RegistrationAgent {
    pub fn new(transport: Arc<RegistryTransport>, instance: InstanceRecord, options: AgentOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport,
            app_name: instance.app_name.clone(),
            instance_id: instance.instance_id.clone(),
            renewal_interval: instance.renewal_interval(),
            heartbeat_policy: options.heartbeat.clone(),
            instance: Mutex::new(instance),
            state: AtomicU8::new(AgentState::Unregistered as u8),
            loop_running: AtomicBool::new(false),
            registration_in_flight: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        });

        Self {
            shared,
            options,
            stop_tx,
            heartbeat: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Register with the registry and launch the heartbeat loop.
    ///
    /// The loop is launched even when registration fails. With `fail_fast`
    /// the registration error is returned after the loop is running;
    /// otherwise it is logged and `Ok(())` is returned. A `shutdown()` that
    /// begins meanwhile cuts the retries short, and `start()` then returns
    /// [`RegistryError::ShuttingDown`] without launching the loop.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }
        if self.heartbeat.lock().await.is_some() {
            warn!("Registration agent for {} already started", self.shared.instance_id);
            return Ok(());
        }

        info!("Registering {} with registry...", self.shared.instance_id);

        let executor = BackoffExecutor::new(self.options.retry.clone());
        let shared = self.shared.clone();
        let stopping = &self.shutdown_started;
        let outcome = executor
            .run_retrying(
                "Registry registration",
                self.options.fail_fast,
                |e: &RegistryError| !matches!(e, RegistryError::ShuttingDown),
                move |_| {
                    let shared = shared.clone();
                    async move {
                        if stopping.load(Ordering::SeqCst) {
                            return Err(RegistryError::ShuttingDown);
                        }
                        shared.register_once().await
                    }
                },
            )
            .await;

        if !self.spawn_heartbeat_loop().await {
            info!(
                "Shutdown began while registering {}, heartbeat loop not started",
                self.shared.instance_id
            );
            return Err(RegistryError::ShuttingDown);
        }

        match outcome {
            Ok(Some(())) => {
                info!("Registration completed for {}", self.shared.instance_id);
                Ok(())
            }
            Ok(None) => {
                warn!(
                    "Failed to register {}, continuing; the heartbeat loop keeps retrying",
                    self.shared.instance_id
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// False when shutdown has begun and no loop may be launched
    async fn spawn_heartbeat_loop(&self) -> bool {
        let mut slot = self.heartbeat.lock().await;
        if self.shutdown_started.load(Ordering::SeqCst) {
            return false;
        }
        if slot.is_some() {
            return true;
        }

        self.shared.loop_running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(heartbeat_loop(self.shared.clone(), self.stop_tx.subscribe()));
        *slot = Some(handle);
        true
    }

    /// Stop the heartbeat loop and deregister if registered. Idempotent.
    ///
    /// Waits at most `shutdown_timeout` for the loop, then aborts it. A
    /// registration cut off that way may already have reached the registry,
    /// so it is deregistered as well.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Registration agent for {} already shut down", self.shared.instance_id);
            return;
        }

        info!("Shutting down registration for {}", self.shared.instance_id);
        self.stop_tx.send_replace(true);

        let handle = self.heartbeat.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.options.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    "Heartbeat loop did not stop within {:?}, aborting it",
                    self.options.shutdown_timeout
                );
                handle.abort();
            }
        }
        self.shared.loop_running.store(false, Ordering::SeqCst);

        let instance = self.shared.instance.lock().await;
        let was_registered = self.shared.state() == AgentState::Registered;
        let interrupted = self.shared.registration_in_flight.swap(false, Ordering::SeqCst);
        self.shared.set_state(AgentState::ShuttingDown);

        if was_registered || interrupted {
            if interrupted {
                warn!(
                    "Registration of {} was interrupted, deregistering in case it landed",
                    instance.instance_id
                );
            }
            let metrics = self.shared.transport.metrics();
            match self
                .shared
                .transport
                .deregister(&instance.app_name, &instance.instance_id)
                .await
            {
                Ok(()) => {
                    if let Some(metrics) = metrics {
                        metrics.deregistration("success");
                    }
                }
                Err(e) if e.is_not_found() && !was_registered => {
                    debug!("Interrupted registration of {} never landed", instance.instance_id);
                }
                Err(e) => {
                    if let Some(metrics) = metrics {
                        metrics.deregistration("failure");
                    }
                    error!("Failed to deregister {}: {}", instance.instance_id, e);
                }
            }
        } else {
            debug!(
                "{} was never registered, skipping deregistration",
                instance.instance_id
            );
        }

        self.shared.set_state(AgentState::Stopped);
        info!("Registration shutdown complete for {}", instance.instance_id);
    }

    /// Change the self-reported status. Failures are logged, not returned.
    pub async fn update_status(&self, status: InstanceStatus) {
        let mut instance = self.shared.instance.lock().await;

        if self.shared.state() != AgentState::Registered {
            warn!(
                "Cannot update status of {} to {}: not registered",
                instance.instance_id, status
            );
            return;
        }

        match self
            .shared
            .transport
            .set_status(&instance.app_name, &instance.instance_id, status)
            .await
        {
            Ok(()) => instance.status = status,
            Err(e) => error!(
                "Failed to update status of {} to {}: {}",
                instance.instance_id, status, e
            ),
        }
    }

    pub fn state(&self) -> AgentState {
        self.shared.state()
    }

    /// Health-check input: whether the registry currently holds this instance
    pub fn is_registered(&self) -> bool {
        self.shared.state() == AgentState::Registered
    }

    /// Whether the background heartbeat loop is alive
    pub fn heartbeat_running(&self) -> bool {
        self.shared.loop_running.load(Ordering::SeqCst)
    }

    pub fn consecutive_heartbeat_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn app_name(&self) -> &str {
        &self.shared.app_name
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Snapshot of the instance record
    pub async fn instance(&self) -> InstanceRecord {
        self.shared.instance.lock().await.clone()
    }
}
