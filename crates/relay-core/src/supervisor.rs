//! Connection supervisor.
//!
//! Runs the publisher and listener identities on their own threads and
//! polls their liveness at a fixed cadence. The listener follows
//! `Idle → Connecting → Up → Degraded → Restarting → Connecting`; the
//! decision logic is the pure [`SupervisorMachine`], the runtime side is
//! [`Supervisor`]. The supervisor is the only writer of [`SupervisorState`].

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    errors::Error,
    identity::{spawn_identity, IdentityContext, IdentityFactory, Liveness, Role},
    Result,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerStatus {
    Idle,
    Connecting,
    Up,
    Degraded,
    Restarting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublisherStatus {
    Idle,
    Connecting,
    Up,
    Down,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorState {
    pub listener: ListenerStatus,
    pub publisher: PublisherStatus,
    pub listener_generation: u64,
    pub publisher_generation: u64,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self {
            listener: ListenerStatus::Idle,
            publisher: PublisherStatus::Idle,
            listener_generation: 0,
            publisher_generation: 0,
        }
    }
}

/// Transitions the status reporter cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    /// First time the listener came up.
    ListenerConnected,
    ListenerDegraded,
    /// Back to `Up` after `Degraded` or a restart.
    ListenerRecovered { restarted: bool },
    /// Auto-resume window ran out; a restart is being forced.
    ListenerRestarting,
    PublisherRestarted,
}

#[derive(Clone, Copy, Debug)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub auto_resume_window: Duration,
    pub restart_join_bound: Duration,
    pub monitor_interval: Duration,
    pub monitor_backoff: Duration,
    /// Ceiling for the doubling delay between publisher respawns.
    pub publisher_backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub connect_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            auto_resume_window: Duration::from_secs(5),
            restart_join_bound: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(1),
            monitor_backoff: Duration::from_secs(1),
            publisher_backoff_max: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            connect_grace: Duration::from_secs(30),
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            heartbeat_interval: cfg.heartbeat_interval,
            heartbeat_timeout: cfg.heartbeat_timeout,
            auto_resume_window: cfg.auto_resume_window,
            restart_join_bound: cfg.restart_join_bound,
            monitor_interval: cfg.monitor_interval,
            monitor_backoff: cfg.monitor_backoff,
            publisher_backoff_max: cfg.publisher_backoff_max,
            shutdown_grace: cfg.shutdown_grace,
            connect_grace: cfg.connect_grace,
        }
    }

    /// Silence longer than this counts as a heartbeat lapse.
    pub fn lapse(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_timeout
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub event: Option<StatusEvent>,
    pub restart: bool,
}

/// Listener state machine; time is always passed in.
#[derive(Debug)]
pub struct SupervisorMachine {
    settings: SupervisorSettings,
    status: ListenerStatus,
    entered_at: Option<Instant>,
    restarted: bool,
    ever_up: bool,
}

impl SupervisorMachine {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            status: ListenerStatus::Idle,
            entered_at: None,
            restarted: false,
            ever_up: false,
        }
    }

    pub fn status(&self) -> ListenerStatus {
        self.status
    }

    /// A fresh listener context was spawned.
    pub fn on_spawned(&mut self, now: Instant) {
        self.enter(ListenerStatus::Connecting, now);
    }

    /// A restart is underway, whoever asked for it.
    pub fn begin_restart(&mut self, now: Instant) {
        if self.status != ListenerStatus::Restarting {
            self.enter(ListenerStatus::Restarting, now);
        }
        self.restarted = true;
    }

    pub fn observe(&mut self, now: Instant, listener: Liveness) -> Observation {
        let healthy = listener.is_healthy(now, self.settings.lapse());
        let in_state = self
            .entered_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        match self.status {
            ListenerStatus::Idle | ListenerStatus::Restarting => Observation::default(),
            ListenerStatus::Connecting => {
                if healthy {
                    self.enter(ListenerStatus::Up, now);
                    let event = if self.ever_up {
                        StatusEvent::ListenerRecovered {
                            restarted: std::mem::take(&mut self.restarted),
                        }
                    } else {
                        self.restarted = false;
                        StatusEvent::ListenerConnected
                    };
                    self.ever_up = true;
                    Observation {
                        event: Some(event),
                        restart: false,
                    }
                } else if listener.closed || in_state > self.settings.connect_grace {
                    self.enter(ListenerStatus::Degraded, now);
                    Observation {
                        event: Some(StatusEvent::ListenerDegraded),
                        restart: false,
                    }
                } else {
                    Observation::default()
                }
            }
            ListenerStatus::Up => {
                if healthy {
                    return Observation::default();
                }
                self.enter(ListenerStatus::Degraded, now);
                Observation {
                    event: Some(StatusEvent::ListenerDegraded),
                    restart: false,
                }
            }
            ListenerStatus::Degraded => {
                if healthy {
                    self.enter(ListenerStatus::Up, now);
                    self.ever_up = true;
                    return Observation {
                        event: Some(StatusEvent::ListenerRecovered {
                            restarted: std::mem::take(&mut self.restarted),
                        }),
                        restart: false,
                    };
                }
                if in_state >= self.settings.auto_resume_window {
                    self.begin_restart(now);
                    return Observation {
                        event: Some(StatusEvent::ListenerRestarting),
                        restart: true,
                    };
                }
                Observation::default()
            }
        }
    }

    fn enter(&mut self, status: ListenerStatus, now: Instant) {
        debug!(target: "relay::supervisor", from = ?self.status, to = ?status, "listener state");
        self.status = status;
        self.entered_at = Some(now);
    }
}

/// Delay between publisher respawns. Starts at `monitor_backoff`, doubles up
/// to `publisher_backoff_max` and resets once a publisher reports ready.
#[derive(Debug)]
struct RespawnBackoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    not_before: Option<Instant>,
    in_outage: bool,
}

impl RespawnBackoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            delay: initial,
            not_before: None,
            in_outage: false,
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }

    /// Record a respawn. True only for the first respawn of an outage.
    fn on_respawn(&mut self, now: Instant) -> bool {
        self.not_before = Some(now + self.delay);
        self.delay = (self.delay * 2).min(self.max);
        !std::mem::replace(&mut self.in_outage, true)
    }

    fn on_healthy(&mut self) {
        self.delay = self.initial;
        self.not_before = None;
        self.in_outage = false;
    }
}

struct SupervisorInner {
    settings: SupervisorSettings,
    publisher_factory: Arc<dyn IdentityFactory>,
    listener_factory: Arc<dyn IdentityFactory>,
    publisher: tokio::sync::Mutex<Option<IdentityContext>>,
    listener: tokio::sync::Mutex<Option<IdentityContext>>,
    machine: Mutex<SupervisorMachine>,
    publisher_backoff: Mutex<RespawnBackoff>,
    restarting: AtomicBool,
    generation: AtomicU64,
    state_tx: watch::Sender<SupervisorState>,
    events_tx: mpsc::Sender<StatusEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<StatusEvent>>>,
    cancel: CancellationToken,
}

/// Clears the restart flag however the restart ends.
struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        publisher_factory: Arc<dyn IdentityFactory>,
        listener_factory: Arc<dyn IdentityFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::default());
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(SupervisorInner {
                settings,
                publisher_factory,
                listener_factory,
                publisher: tokio::sync::Mutex::new(None),
                listener: tokio::sync::Mutex::new(None),
                machine: Mutex::new(SupervisorMachine::new(settings)),
                publisher_backoff: Mutex::new(RespawnBackoff::new(
                    settings.monitor_backoff,
                    settings.publisher_backoff_max,
                )),
                restarting: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                state_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state_tx.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state_tx.borrow()
    }

    /// The event stream; only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<StatusEvent>> {
        self.inner.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Spawn both identities and monitor them until [`Supervisor::shutdown`]
    /// or the cancellation token fires.
    ///
    /// A failing or panicking tick is logged and retried after the backoff;
    /// the loop itself only ends on cancellation.
    pub async fn start(&self) -> Result<()> {
        self.spawn_publisher().await?;
        self.spawn_listener().await?;
        self.publish_state().await;
        info!(target: "relay::supervisor", "supervisor started");

        let settings = self.inner.settings;
        loop {
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.monitor_interval) => {}
            }

            let this = self.clone();
            let failure = match tokio::spawn(async move { this.tick().await }).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join) if join.is_panic() => Some(format!("panic: {join}")),
                Err(join) => Some(join.to_string()),
            };
            if let Some(reason) = failure {
                error!(target: "relay::supervisor", "monitor tick failed: {reason}");
                tokio::select! {
                    biased;
                    _ = self.inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.monitor_backoff) => {}
                }
            }
        }

        self.stop_identities().await;
        info!(target: "relay::supervisor", "supervisor stopped");
        Ok(())
    }

    /// Stop monitoring and wind both identities down within the grace period.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.stop_identities().await;
    }

    /// Replace the listener with a fresh context.
    ///
    /// Returns `false` without doing anything when another restart is already
    /// in flight. The previous context gets `restart_join_bound` to stop and
    /// is abandoned if it does not.
    pub async fn restart_listener(&self) -> bool {
        if self
            .inner
            .restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(target: "relay::supervisor", "listener restart already in flight");
            return false;
        }
        let _guard = RestartGuard(&self.inner.restarting);

        if let Ok(mut machine) = self.inner.machine.lock() {
            machine.begin_restart(Instant::now());
        }
        self.publish_state().await;

        {
            let mut slot = self.inner.listener.lock().await;
            if let Some(mut old) = slot.take() {
                let joined = old
                    .join_within(self.inner.settings.restart_join_bound)
                    .await;
                if !joined {
                    warn!(
                        target: "relay::supervisor",
                        generation = old.generation(),
                        "previous listener abandoned"
                    );
                }
            }
        }

        let restarted = match self.spawn_listener().await {
            Ok(()) => true,
            Err(e) => {
                error!(target: "relay::supervisor", "listener respawn failed: {e}");
                false
            }
        };
        self.publish_state().await;
        restarted
    }

    async fn tick(&self) -> Result<()> {
        self.check_publisher().await?;

        let liveness = {
            let slot = self.inner.listener.lock().await;
            slot.as_ref().map(IdentityContext::liveness)
        };
        // No context means a restart is mid-flight.
        let Some(liveness) = liveness else {
            return Ok(());
        };

        let observation = self
            .inner
            .machine
            .lock()
            .map_err(|_| Error::External("supervisor state poisoned".to_string()))?
            .observe(Instant::now(), liveness);

        self.publish_state().await;

        if let Some(event) = observation.event {
            match event {
                StatusEvent::ListenerDegraded => {
                    warn!(target: "relay::supervisor", "listener heartbeat lapsed")
                }
                StatusEvent::ListenerRestarting => {
                    warn!(target: "relay::supervisor", "listener did not resume, restarting")
                }
                other => info!(target: "relay::supervisor", event = ?other, "listener state changed"),
            }
            self.emit(event);
        }

        if observation.restart {
            self.restart_listener().await;
        }
        Ok(())
    }

    async fn check_publisher(&self) -> Result<()> {
        let liveness = {
            let slot = self.inner.publisher.lock().await;
            slot.as_ref().map(IdentityContext::liveness)
        };
        let now = Instant::now();
        {
            let mut backoff = self
                .inner
                .publisher_backoff
                .lock()
                .map_err(|_| Error::External("publisher backoff poisoned".to_string()))?;
            match liveness {
                Some(l) if !l.closed => {
                    if l.ready {
                        backoff.on_healthy();
                    }
                    return Ok(());
                }
                _ if !backoff.ready(now) => return Ok(()),
                _ => {}
            }
        }

        {
            let mut slot = self.inner.publisher.lock().await;
            if let Some(mut old) = slot.take() {
                old.join_within(self.inner.settings.restart_join_bound).await;
            }
        }
        self.spawn_publisher().await?;

        let first = self
            .inner
            .publisher_backoff
            .lock()
            .map(|mut backoff| backoff.on_respawn(now))
            .unwrap_or(false);
        if first {
            warn!(target: "relay::supervisor", "publisher connection closed, respawning");
            self.emit(StatusEvent::PublisherRestarted);
        } else {
            debug!(target: "relay::supervisor", "publisher still down, respawned again");
        }
        Ok(())
    }

    async fn spawn_publisher(&self) -> Result<()> {
        let ctx = spawn_identity(
            self.inner.publisher_factory.clone(),
            self.next_generation(),
            self.inner.settings.shutdown_grace,
        )?;
        *self.inner.publisher.lock().await = Some(ctx);
        Ok(())
    }

    async fn spawn_listener(&self) -> Result<()> {
        let ctx = spawn_identity(
            self.inner.listener_factory.clone(),
            self.next_generation(),
            self.inner.settings.shutdown_grace,
        )?;
        *self.inner.listener.lock().await = Some(ctx);
        if let Ok(mut machine) = self.inner.machine.lock() {
            machine.on_spawned(Instant::now());
        }
        Ok(())
    }

    async fn stop_identities(&self) {
        let grace = self.inner.settings.shutdown_grace;
        for (role, slot) in [
            (Role::Listener, &self.inner.listener),
            (Role::Publisher, &self.inner.publisher),
        ] {
            let ctx = slot.lock().await.take();
            if let Some(mut ctx) = ctx {
                if !ctx.join_within(grace).await {
                    warn!(target: "relay::supervisor", %role, "did not stop within the grace period");
                }
            }
        }
        self.publish_state().await;
    }

    fn next_generation(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn emit(&self, event: StatusEvent) {
        if let Err(e) = self.inner.events_tx.try_send(event) {
            debug!(target: "relay::supervisor", "status event dropped: {e}");
        }
    }

    async fn publish_state(&self) {
        let (publisher, publisher_generation) = {
            let slot = self.inner.publisher.lock().await;
            match slot.as_ref() {
                None => (PublisherStatus::Idle, 0),
                Some(ctx) => {
                    let l = ctx.liveness();
                    let status = if l.closed {
                        PublisherStatus::Down
                    } else if l.ready {
                        PublisherStatus::Up
                    } else {
                        PublisherStatus::Connecting
                    };
                    (status, ctx.generation())
                }
            }
        };
        let listener_generation = self
            .inner
            .listener
            .lock()
            .await
            .as_ref()
            .map(IdentityContext::generation)
            .unwrap_or(0);
        let listener = self
            .inner
            .machine
            .lock()
            .map(|m| m.status())
            .unwrap_or(ListenerStatus::Idle);

        self.inner.state_tx.send_replace(SupervisorState {
            listener,
            publisher,
            listener_generation,
            publisher_generation,
        });
    }
}
