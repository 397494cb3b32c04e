//! Identity execution contexts.
//!
//! Each identity (publisher, listener) owns one OS thread driving its own
//! single-threaded tokio runtime. The identity object is built on that thread
//! and never leaves it; other contexts only see its [`HealthCell`] and the
//! cancellation token.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Publisher,
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Listener => f.write_str("listener"),
        }
    }
}

/// Point-in-time view of a connection's liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Liveness {
    pub ready: bool,
    pub closed: bool,
    pub last_heartbeat: Option<Instant>,
}

impl Liveness {
    /// Ready, open, and heard from within `lapse`.
    pub fn is_healthy(&self, now: Instant, lapse: Duration) -> bool {
        self.ready
            && !self.closed
            && self
                .last_heartbeat
                .map(|hb| now.saturating_duration_since(hb) <= lapse)
                .unwrap_or(false)
    }
}

/// Liveness written by the identity's own loop, read by the supervisor.
#[derive(Debug, Default)]
pub struct HealthCell {
    ready: AtomicBool,
    closed: AtomicBool,
    last_heartbeat: Mutex<Option<Instant>>,
}

impl HealthCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.closed.store(false, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        self.beat();
    }

    pub fn beat(&self) {
        self.beat_at(Instant::now());
    }

    pub fn beat_at(&self, at: Instant) {
        if let Ok(mut hb) = self.last_heartbeat.lock() {
            *hb = Some(at);
        }
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Liveness {
        Liveness {
            ready: self.ready.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
            last_heartbeat: self.last_heartbeat.lock().ok().and_then(|hb| *hb),
        }
    }
}

/// A long-lived platform connection.
///
/// `run` returns when the connection ends or `cancel` fires. Closing the
/// protocol session cleanly is the identity's own job.
#[async_trait(?Send)]
pub trait Identity {
    fn role(&self) -> Role;
    async fn run(self: Box<Self>, health: Arc<HealthCell>, cancel: CancellationToken) -> Result<()>;
}

/// Builds a fresh identity; called on the identity's own thread.
pub trait IdentityFactory: Send + Sync {
    fn role(&self) -> Role;
    fn build(&self) -> Result<Box<dyn Identity>>;
}

/// Handle to one running identity thread.
pub struct IdentityContext {
    role: Role,
    generation: u64,
    health: Arc<HealthCell>,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("role", &self.role)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Marks the cell closed however the thread ends, panics included.
struct CloseOnExit(Arc<HealthCell>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// Start `factory`'s identity on a dedicated thread.
///
/// After `run` returns, in-flight tasks on the identity's runtime get `grace`
/// to finish before the runtime is dropped.
pub fn spawn_identity(
    factory: Arc<dyn IdentityFactory>,
    generation: u64,
    grace: Duration,
) -> Result<IdentityContext> {
    let role = factory.role();
    let health = Arc::new(HealthCell::new());
    let cancel = CancellationToken::new();
    let (done_tx, done_rx) = oneshot::channel();

    let thread_health = health.clone();
    let thread_cancel = cancel.clone();
    let thread = thread::Builder::new()
        .name(format!("relay-{role}-{generation}"))
        .spawn(move || {
            let _closed = CloseOnExit(thread_health.clone());
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(target: "relay::supervisor", %role, "runtime build failed: {e}");
                    return;
                }
            };

            rt.block_on(async {
                let identity = match factory.build() {
                    Ok(identity) => identity,
                    Err(e) => {
                        error!(target: "relay::supervisor", %role, generation, "identity build failed: {e}");
                        return;
                    }
                };
                info!(target: "relay::supervisor", %role, generation, "identity started");
                match identity.run(thread_health.clone(), thread_cancel).await {
                    Ok(()) => info!(target: "relay::supervisor", %role, generation, "identity stopped"),
                    Err(e) => warn!(target: "relay::supervisor", %role, generation, "identity ended: {e}"),
                }
            });
            thread_health.mark_closed();
            rt.shutdown_timeout(grace);
            let _ = done_tx.send(());
        })
        .map_err(|e| Error::External(format!("spawn {role} thread: {e}")))?;

    Ok(IdentityContext {
        role,
        generation,
        health,
        cancel,
        done: Some(done_rx),
        thread: Some(thread),
    })
}

impl IdentityContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn health(&self) -> Arc<HealthCell> {
        self.health.clone()
    }

    pub fn liveness(&self) -> Liveness {
        self.health.snapshot()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(thread::JoinHandle::is_finished)
            .unwrap_or(true)
    }

    /// Cancel and wait up to `bound` for the thread to wind down.
    ///
    /// Returns `false` when the bound elapsed; the thread is then abandoned,
    /// never killed.
    pub async fn join_within(&mut self, bound: Duration) -> bool {
        self.cancel.cancel();
        let Some(done) = self.done.take() else {
            return self.is_finished();
        };
        match tokio::time::timeout(bound, done).await {
            // A dropped sender means the thread unwound; it is gone either way.
            Ok(_) => true,
            Err(_) => {
                warn!(
                    target: "relay::supervisor",
                    role = %self.role,
                    generation = self.generation,
                    "identity did not stop within {bound:?}, abandoning it"
                );
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Marks ready, beats until cancelled; `stubborn` ignores cancellation for a while.
    pub(crate) struct FakeIdentity {
        pub role: Role,
        pub stubborn: Option<Duration>,
    }

    #[async_trait(?Send)]
    impl Identity for FakeIdentity {
        fn role(&self) -> Role {
            self.role
        }

        async fn run(self: Box<Self>, health: Arc<HealthCell>, cancel: CancellationToken) -> Result<()> {
            health.mark_ready();
            if let Some(hold) = self.stubborn {
                tokio::time::sleep(hold).await;
                return Ok(());
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => health.beat(),
                }
            }
        }
    }

    pub(crate) struct FakeFactory {
        pub role: Role,
        pub built: AtomicUsize,
        pub fail: bool,
        pub stubborn: Option<Duration>,
    }

    impl FakeFactory {
        pub(crate) fn new(role: Role) -> Self {
            Self {
                role,
                built: AtomicUsize::new(0),
                fail: false,
                stubborn: None,
            }
        }
    }

    impl FakeFactory {
        /// Builds happen on the identity thread; poll until `expected` is reached.
        pub(crate) async fn built_count_eventually(&self, expected: usize) -> usize {
            for _ in 0..200 {
                let n = self.built.load(Ordering::SeqCst);
                if n >= expected {
                    return n;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.built.load(Ordering::SeqCst)
        }
    }

    impl IdentityFactory for FakeFactory {
        fn role(&self) -> Role {
            self.role
        }

        fn build(&self) -> Result<Box<dyn Identity>> {
            self.built.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Config("no token".to_string()));
            }
            Ok(Box::new(FakeIdentity {
                role: self.role,
                stubborn: self.stubborn,
            }))
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn liveness_lapses_after_the_window() {
        let cell = HealthCell::new();
        let t0 = Instant::now();
        assert!(!cell.snapshot().is_healthy(t0, Duration::from_secs(10)));

        cell.mark_ready();
        cell.beat_at(t0);
        let lapse = Duration::from_secs(10);
        assert!(cell.snapshot().is_healthy(t0 + Duration::from_secs(10), lapse));
        assert!(!cell.snapshot().is_healthy(t0 + Duration::from_secs(11), lapse));

        cell.mark_closed();
        assert!(!cell.snapshot().is_healthy(t0, lapse));
    }

    #[tokio::test]
    async fn identity_runs_on_its_own_thread_and_joins() {
        let factory = Arc::new(FakeFactory::new(Role::Listener));
        let mut ctx = spawn_identity(factory.clone(), 1, Duration::from_millis(100)).unwrap();
        let health = ctx.health();
        wait_until(|| health.snapshot().ready).await;

        assert!(ctx.join_within(Duration::from_secs(1)).await);
        assert!(ctx.liveness().closed);
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stubborn_identity_is_abandoned_after_the_bound() {
        let mut factory = FakeFactory::new(Role::Listener);
        factory.stubborn = Some(Duration::from_millis(300));
        let mut ctx = spawn_identity(Arc::new(factory), 1, Duration::from_millis(10)).unwrap();
        let health = ctx.health();
        wait_until(|| health.snapshot().ready).await;

        assert!(!ctx.join_within(Duration::from_millis(20)).await);
        wait_until(|| ctx.is_finished()).await;
    }

    #[tokio::test]
    async fn failed_build_closes_the_context() {
        let mut factory = FakeFactory::new(Role::Publisher);
        factory.fail = true;
        let ctx = spawn_identity(Arc::new(factory), 1, Duration::from_millis(10)).unwrap();
        let health = ctx.health();
        wait_until(|| health.snapshot().closed).await;
        assert!(!health.snapshot().ready);
    }
}
