//! Generic connection-health monitoring.
//!
//! Every plugin that talks to an external peer over a socket/IPC/log stream
//! needs the same shape of logic: probe on a timer, debounce both edges, and
//! notify the owner on confirmed transitions. [`ConnectionMonitor`] abstracts
//! that once, parameterized by a probe function.
//!
//! The monitor never mutates system state directly; it calls back into its
//! owning plugin through [`ConnectionObserver`], and the plugin pushes the
//! resulting state change to the state machine. Stopping the monitor cancels
//! its task and awaits termination, so no callback fires after `stop`
//! returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of a single connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The peer is connected / playing.
    Connected,
    /// The peer is absent or idle.
    Disconnected,
}

/// Probe function evaluated on every monitor tick.
///
/// A returned error counts as a failed check; it does not stop the monitor.
pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<ProbeOutcome, String>> + Send + Sync>;

/// Callback interface into the monitor's owning plugin.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// Called once per confirmed (debounced) connection transition.
    fn connection_changed(&self, connected: bool);

    /// One reconnection attempt during sustained disconnection.
    ///
    /// Returning `true` ends the backoff sequence; the next probes confirm
    /// whether the connection actually came back. The default implementation
    /// declines, disabling reconnection for monitors that don't need it.
    async fn attempt_reconnect(&self) -> bool {
        false
    }
}

/// Bounded exponential backoff for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the per-attempt delay.
    pub max_delay: Duration,
    /// Maximum number of attempts per disconnection.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Tuning knobs for a [`ConnectionMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Probe interval while connected (kept short to notice drops quickly).
    pub connected_interval: Duration,
    /// Probe interval while idle/disconnected (longer, to reduce load).
    pub idle_interval: Duration,
    /// Upper bound on a single probe; a timeout counts as a failed check.
    pub probe_timeout: Duration,
    /// Consecutive failed checks before "disconnected" is reported.
    pub failure_threshold: u32,
    /// Consecutive successful checks before "connected" is trusted.
    ///
    /// Keep at 1 unless the underlying signal is itself noisy (e.g.
    /// distinguishing "really stopped" from "buffering").
    pub success_threshold: u32,
    /// Optional reconnection driver for sustained disconnection.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connected_interval: Duration::from_secs(2),
            idle_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 1,
            reconnect: None,
        }
    }
}

struct MonitorTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Debounced probe-and-notify component owned by a plugin.
///
/// `start` spawns the probe loop and stores the owned task handle; `stop`
/// cancels it and awaits termination before returning.
pub struct ConnectionMonitor {
    config: MonitorConfig,
    task: Mutex<Option<MonitorTask>>,
}

impl ConnectionMonitor {
    /// Creates a monitor with the given tuning.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            task: Mutex::new(None),
        }
    }

    /// Whether the probe loop is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts the probe loop. No-op if already running.
    pub fn start(&self, probe: ProbeFn, observer: Arc<dyn ConnectionObserver>) {
        let mut slot = self.task.lock();
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                log::warn!("[Monitor] start called while already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.config.clone(),
            probe,
            observer,
            cancel.clone(),
        ));
        *slot = Some(MonitorTask { handle, cancel });
    }

    /// Cancels the probe loop and awaits its termination.
    ///
    /// After this returns, no observer callback will fire. Safe to call when
    /// not running.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    log::warn!("[Monitor] Probe task ended abnormally: {}", e);
                }
            }
        }
    }
}

async fn run_loop(
    config: MonitorConfig,
    probe: ProbeFn,
    observer: Arc<dyn ConnectionObserver>,
    cancel: CancellationToken,
) {
    let mut connected = false;
    let mut consecutive_failures: u32 = 0;
    let mut consecutive_successes: u32 = 0;

    loop {
        let interval = if connected {
            config.connected_interval
        } else {
            config.idle_interval
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let outcome = match tokio::time::timeout(config.probe_timeout, probe()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log::debug!("[Monitor] Probe error: {}", e);
                ProbeOutcome::Disconnected
            }
            Err(_) => {
                log::debug!("[Monitor] Probe timed out");
                ProbeOutcome::Disconnected
            }
        };

        match outcome {
            ProbeOutcome::Connected => {
                consecutive_failures = 0;
                consecutive_successes = consecutive_successes.saturating_add(1);
                if !connected && consecutive_successes >= config.success_threshold {
                    connected = true;
                    observer.connection_changed(true);
                }
            }
            ProbeOutcome::Disconnected => {
                consecutive_successes = 0;
                consecutive_failures = consecutive_failures.saturating_add(1);
                if connected && consecutive_failures >= config.failure_threshold {
                    connected = false;
                    consecutive_failures = 0;
                    observer.connection_changed(false);
                    if let Some(policy) = &config.reconnect {
                        run_reconnect(policy, observer.as_ref(), &cancel).await;
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Drives bounded exponential-backoff reconnection attempts.
///
/// Returns when an attempt succeeds, attempts are exhausted, or the monitor
/// is cancelled. Regular probing resumes afterwards to confirm the result.
async fn run_reconnect(
    policy: &ReconnectPolicy,
    observer: &dyn ConnectionObserver,
    cancel: &CancellationToken,
) {
    let mut delay = policy.base_delay;
    for attempt in 1..=policy.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        log::info!(
            "[Monitor] Reconnect attempt {}/{}",
            attempt,
            policy.max_attempts
        );
        if observer.attempt_reconnect().await {
            log::info!("[Monitor] Reconnect attempt succeeded");
            return;
        }
        delay = (delay * 2).min(policy.max_delay);
    }
    log::warn!(
        "[Monitor] Giving up after {} reconnect attempts",
        policy.max_attempts
    );
}
