/// Staleness watcher: poll an "is my cached state stale?" predicate on a fixed
/// cadence and run an update action whenever it reports true.
///
/// Each watch session runs on its own tokio task. The first check happens as
/// soon as the task is scheduled; afterwards the task waits `interval` between
/// checks. The caller only gets a [`WatchHandle`], which can cancel the session
/// and observe it, but never touches the loop's state directly.
use futures::FutureExt;
use serde::Deserialize;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a session does when `is_stale` or `update` returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// End the session. The error is kept as the handle's last error.
    #[default]
    Stop,
    /// Log the error, abandon the current check, and keep polling.
    Skip,
}

/// Errors reported synchronously by [`watch`] before any task is started.
#[derive(Debug, PartialEq, Eq)]
pub enum WatchError {
    /// The polling interval was zero.
    ZeroInterval,
    /// `watch` was called outside a tokio runtime.
    NoRuntime,
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::ZeroInterval => write!(f, "watch interval must be greater than zero"),
            WatchError::NoRuntime => write!(f, "watch must be started inside a tokio runtime"),
        }
    }
}

impl std::error::Error for WatchError {}

/// Lifecycle of a watch session as seen by the caller.
///
/// `Cancelled` is terminal. A session whose task stopped on a failure is still
/// `Running` here; use [`WatchHandle::is_finished`] to detect that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running,
    Cancelled,
}

/// How a session's background task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchExit {
    /// Stopped by [`WatchHandle::cancel`] or by dropping the handle.
    Cancelled,
    /// A callback failed under [`FailurePolicy::Stop`].
    Failed(String),
    /// A callback panicked. The panic message is kept as the last error.
    Panicked,
}

/// Immutable configuration of one watch session.
pub struct WatchSpec<S, U> {
    is_stale: S,
    update: U,
    interval: Duration,
    on_failure: FailurePolicy,
}

impl<S, U> WatchSpec<S, U> {
    pub fn new(is_stale: S, update: U, interval: Duration) -> Self {
        Self {
            is_stale,
            update,
            interval,
            on_failure: FailurePolicy::default(),
        }
    }

    /// Choose how callback failures are handled (default: [`FailurePolicy::Stop`]).
    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }
}

impl<S, SF, SE, U, UF, UE> WatchSpec<S, U>
where
    S: FnMut() -> SF + Send + 'static,
    SF: Future<Output = Result<bool, SE>> + Send + 'static,
    SE: Display + Send + 'static,
    U: FnMut() -> UF + Send + 'static,
    UF: Future<Output = Result<(), UE>> + Send + 'static,
    UE: Display + Send + 'static,
{
    /// Validate the parameters and spawn the background task.
    ///
    /// Returns immediately; the first check runs on the spawned task.
    pub fn start(self) -> Result<WatchHandle, WatchError> {
        if self.interval.is_zero() {
            return Err(WatchError::ZeroInterval);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| WatchError::NoRuntime)?;

        let shared = Arc::new(Shared::default());
        tracing::debug!(
            interval_ms = self.interval.as_millis() as u64,
            on_failure = ?self.on_failure,
            "starting watch session"
        );
        let task = runtime.spawn(run(self, Arc::clone(&shared)));

        Ok(WatchHandle {
            shared,
            task: Some(task),
        })
    }
}

/// Start a watch session with the default failure policy.
///
/// `is_stale` is checked right away and then every `interval`; each `true`
/// triggers exactly one `update`. The session runs until the returned handle
/// is cancelled or dropped.
#[allow(dead_code)]
pub fn watch<S, SF, SE, U, UF, UE>(
    is_stale: S,
    update: U,
    interval: Duration,
) -> Result<WatchHandle, WatchError>
where
    S: FnMut() -> SF + Send + 'static,
    SF: Future<Output = Result<bool, SE>> + Send + 'static,
    SE: Display + Send + 'static,
    U: FnMut() -> UF + Send + 'static,
    UF: Future<Output = Result<(), UE>> + Send + 'static,
    UE: Display + Send + 'static,
{
    WatchSpec::new(is_stale, update, interval).start()
}

/// State shared between a handle and its task.
#[derive(Default)]
struct Shared {
    token: CancellationToken,
    checks: AtomicU64,
    updates: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_last_error(&self, message: String) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    /// Record a callback failure; returns the exit if the session must stop.
    fn fail(&self, stage: &'static str, error: &dyn Display, policy: FailurePolicy) -> Option<WatchExit> {
        let message = format!("{stage} failed: {error}");
        self.set_last_error(message.clone());
        match policy {
            FailurePolicy::Stop => {
                tracing::warn!(stage, error = %error, "watch callback failed, stopping session");
                Some(WatchExit::Failed(message))
            }
            FailurePolicy::Skip => {
                tracing::warn!(stage, error = %error, "watch callback failed, skipping check");
                None
            }
        }
    }

    /// Record a callback panic. Panics end the session whatever the policy.
    fn panicked(&self, stage: &'static str, payload: Box<dyn Any + Send>) -> WatchExit {
        let reason = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown panic");
        self.set_last_error(format!("{stage} panicked: {reason}"));
        tracing::error!(stage, reason, "watch callback panicked, stopping session");
        WatchExit::Panicked
    }
}

async fn run<S, SF, SE, U, UF, UE>(mut spec: WatchSpec<S, U>, shared: Arc<Shared>) -> WatchExit
where
    S: FnMut() -> SF + Send + 'static,
    SF: Future<Output = Result<bool, SE>> + Send + 'static,
    SE: Display + Send + 'static,
    U: FnMut() -> UF + Send + 'static,
    UF: Future<Output = Result<(), UE>> + Send + 'static,
    UE: Display + Send + 'static,
{
    let token = shared.token.clone();

    loop {
        if token.is_cancelled() {
            break;
        }
        shared.checks.fetch_add(1, Ordering::SeqCst);

        let checked = AssertUnwindSafe(async { (spec.is_stale)().await })
            .catch_unwind()
            .await;
        match checked {
            Err(payload) => return shared.panicked("is_stale", payload),
            Ok(Ok(true)) => {
                // Cancelled while the predicate ran: the update must not begin.
                if token.is_cancelled() {
                    break;
                }
                shared.updates.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("stale state detected, running update");
                let updated = AssertUnwindSafe(async { (spec.update)().await })
                    .catch_unwind()
                    .await;
                match updated {
                    Err(payload) => return shared.panicked("update", payload),
                    Ok(Err(e)) => {
                        if let Some(exit) = shared.fail("update", &e, spec.on_failure) {
                            return exit;
                        }
                    }
                    Ok(Ok(())) => {}
                }
            }
            Ok(Ok(false)) => tracing::trace!("state is fresh"),
            Ok(Err(e)) => {
                if let Some(exit) = shared.fail("is_stale", &e, spec.on_failure) {
                    return exit;
                }
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(spec.interval) => {}
        }
    }

    tracing::debug!("watch session cancelled");
    WatchExit::Cancelled
}

/// The caller's side of a running watch session.
///
/// Dropping the handle cancels the session.
#[derive(Debug)]
pub struct WatchHandle {
    shared: Arc<Shared>,
    task: Option<JoinHandle<WatchExit>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("cancelled", &self.token.is_cancelled())
            .field("checks", &self.checks.load(Ordering::SeqCst))
            .field("updates", &self.updates.load(Ordering::SeqCst))
            .finish()
    }
}

impl WatchHandle {
    /// Stop the session.
    ///
    /// Wakes the task if it is waiting out the interval. A check or update
    /// already in progress is allowed to finish, but none starts once this
    /// returns. Calling it again has no effect.
    pub fn cancel(&self) {
        if !self.shared.token.is_cancelled() {
            tracing::debug!("cancelling watch session");
        }
        self.shared.token.cancel();
    }

    pub fn state(&self) -> WatchState {
        if self.shared.token.is_cancelled() {
            WatchState::Cancelled
        } else {
            WatchState::Running
        }
    }

    /// True once the background task has exited, for any reason.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Number of `is_stale` invocations started so far.
    pub fn checks(&self) -> u64 {
        self.shared.checks.load(Ordering::SeqCst)
    }

    /// Number of `update` invocations started so far.
    pub fn updates(&self) -> u64 {
        self.shared.updates.load(Ordering::SeqCst)
    }

    /// Most recent callback failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the background task to exit without cancelling it.
    pub async fn join(mut self) -> WatchExit {
        let Some(task) = self.task.take() else {
            return WatchExit::Cancelled;
        };
        match task.await {
            Ok(exit) => exit,
            Err(e) if e.is_panic() => WatchExit::Panicked,
            Err(_) => WatchExit::Cancelled,
        }
    }

    /// Cancel the session and wait for its task to exit.
    pub async fn shutdown(self) -> WatchExit {
        self.cancel();
        self.join().await
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}
