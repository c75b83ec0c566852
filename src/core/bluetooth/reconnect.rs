//! Auto-reconnect with bounded exponential backoff
//! Remembers the last device that connected successfully and redials it
//! through a caller-supplied attempt function, so the retry policy knows
//! nothing about the platform.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BACKOFF_MS};
use crate::core::bluetooth::types::{BleDevice, ReconnectState};

/// Retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before attempt n is `delays[n - 1]`, clamped to the last entry
    pub delays: Vec<Duration>,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delays: RECONNECT_BACKOFF_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before the 1-indexed `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

struct ReconnectJob {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
    device: BleDevice,
}

/// Owns the reconnect target, the retry loop and the published [`ReconnectState`].
pub struct AutoReconnectManager {
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ReconnectState>>,
    last_device: Mutex<Option<BleDevice>>,
    job: Mutex<Option<ReconnectJob>>,
    retry_count: Arc<AtomicU32>,
}

impl Default for AutoReconnectManager {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl AutoReconnectManager {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ReconnectState::Idle);
        Self {
            policy,
            state_tx: Arc::new(state_tx),
            last_device: Mutex::new(None),
            job: Mutex::new(None),
            retry_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Records `device` as the reconnect target.
    pub fn save_last_connected_device(&self, device: BleDevice) {
        info!(
            "AutoReconnect: saved device {} ({})",
            device.display_name(),
            device.id
        );
        *lock(&self.last_device) = Some(device);
    }

    /// Forgets the target, stops any running loop and returns to `Idle`.
    pub fn clear_saved_device(&self) {
        *lock(&self.last_device) = None;
        self.cancel_reconnect();
        self.state_tx.send_replace(ReconnectState::Idle);
        info!("AutoReconnect: cleared saved device");
    }

    pub fn last_connected_device(&self) -> Option<BleDevice> {
        lock(&self.last_device).clone()
    }

    /// Starts the retry loop for the saved device.
    ///
    /// No-op when nothing is saved or a loop is already running. `attempt` is
    /// awaited once per try; `Ok(true)` ends the loop as `Success`, while
    /// `Ok(false)`, an error or a panic count as a failed try.
    pub fn start_auto_reconnect<F, Fut>(&self, attempt: F)
    where
        F: Fn(BleDevice) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        let Some(device) = self.last_connected_device() else {
            debug!("AutoReconnect: no saved device to reconnect");
            return;
        };

        let mut job = lock(&self.job);
        if job.as_ref().is_some_and(|j| !j.handle.is_finished()) {
            debug!("AutoReconnect: retry loop already running");
            return;
        }

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_retry_loop(
            device.clone(),
            self.policy.clone(),
            self.state_tx.clone(),
            self.retry_count.clone(),
            cancel_token.clone(),
            attempt,
        ));

        *job = Some(ReconnectJob {
            cancel_token,
            handle,
            device,
        });
    }

    /// Stops a running loop before its next delay or attempt. Idempotent.
    pub fn cancel_reconnect(&self) {
        if let Some(job) = lock(&self.job).take() {
            if !job.handle.is_finished() {
                info!("AutoReconnect: cancelling retry loop");
            }
            job.cancel_token.cancel();
        }
        self.state_tx.send_if_modified(|state| {
            self.retry_count.store(0, Ordering::SeqCst);
            if matches!(state, ReconnectState::Reconnecting { .. }) {
                *state = ReconnectState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// The device a running loop is dialing, if a loop is running.
    pub fn active_target(&self) -> Option<BleDevice> {
        lock(&self.job)
            .as_ref()
            .filter(|j| !j.handle.is_finished())
            .map(|j| j.device.clone())
    }

    pub fn is_running(&self) -> bool {
        self.active_target().is_some()
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(*self.state_tx.borrow(), ReconnectState::Reconnecting { .. })
    }

    /// 1-indexed attempt of the running loop, 0 when idle.
    pub fn current_attempt(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReconnectState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconnectState> {
        self.state_tx.subscribe()
    }
}

impl Drop for AutoReconnectManager {
    fn drop(&mut self) {
        if let Some(job) = lock(&self.job).take() {
            job.cancel_token.cancel();
        }
    }
}

async fn run_retry_loop<F, Fut>(
    device: BleDevice,
    policy: ReconnectPolicy,
    state_tx: Arc<watch::Sender<ReconnectState>>,
    retry_count: Arc<AtomicU32>,
    cancel_token: CancellationToken,
    attempt: F,
) where
    F: Fn(BleDevice) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let max_attempts = policy.max_attempts;

    for n in 1..=max_attempts {
        // Publish only while not cancelled, so a concurrent cancel's reset is never overwritten.
        let published = state_tx.send_if_modified(|state| {
            if cancel_token.is_cancelled() {
                return false;
            }
            *state = ReconnectState::Reconnecting {
                device: device.clone(),
                attempt: n,
                max_attempts,
            };
            retry_count.store(n, Ordering::SeqCst);
            true
        });
        if !published {
            return;
        }

        let delay = policy.delay_for(n);
        info!(
            "AutoReconnect: attempt {}/{} for {} in {} ms",
            n,
            max_attempts,
            device.display_name(),
            delay.as_millis()
        );

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let task = tokio::spawn(attempt(device.clone()));
        let abort_handle = task.abort_handle();
        let success = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                abort_handle.abort();
                return;
            }
            result = task => match result {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    warn!("AutoReconnect: attempt {} failed: {}", n, e);
                    false
                }
                Err(e) => {
                    warn!("AutoReconnect: attempt {} aborted: {}", n, e);
                    false
                }
            }
        };

        if success {
            info!("AutoReconnect: reconnected to {}", device.display_name());
            publish_unless_cancelled(
                &state_tx,
                &cancel_token,
                ReconnectState::Success {
                    device: device.clone(),
                },
            );
            retry_count.store(0, Ordering::SeqCst);
            return;
        }

        warn!("AutoReconnect: attempt {}/{} failed", n, max_attempts);
    }

    warn!("AutoReconnect: all {} attempts exhausted", max_attempts);
    let reason = format!(
        "Could not reconnect to {} ({}) after {} attempts",
        device.display_name(),
        device.id,
        max_attempts
    );
    publish_unless_cancelled(
        &state_tx,
        &cancel_token,
        ReconnectState::Failed {
            device: device.clone(),
            reason,
        },
    );
    retry_count.store(0, Ordering::SeqCst);
}

fn publish_unless_cancelled(
    state_tx: &watch::Sender<ReconnectState>,
    cancel_token: &CancellationToken,
    next: ReconnectState,
) {
    state_tx.send_if_modified(|state| {
        if cancel_token.is_cancelled() {
            return false;
        }
        *state = next;
        true
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
