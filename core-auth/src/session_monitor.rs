//! Session Monitor
//!
//! Owns the pair of timers attached to an active session:
//!
//! - the **refresh** timer, due `refresh_lead_time` before expiry but never
//!   sooner than `min_refresh_delay` after arming;
//! - the **expiry** timer, due when the session expires.
//!
//! Both timers share one [`CancellationToken`], so cancel-and-replace is a
//! single step. Firings are delivered over an mpsc channel tagged with the
//! generation that armed them; the consumer drops any firing for which
//! [`SessionMonitor::is_current`] is false.

use crate::error::{AuthError, Result};
use crate::token_store::TokenStore;
use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use core_runtime::config::SessionSettings;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Refresh,
    Expiry,
}

/// A timer went off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Timers currently armed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimers {
    pub generation: u64,
    /// Delay from arming until the refresh timer fires.
    pub refresh_in: Duration,
    /// Delay from arming until the expiry timer fires.
    pub expires_in: Duration,
    pub expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    generation: u64,
    cancel: Option<CancellationToken>,
    armed: Option<ArmedTimers>,
}

pub struct SessionMonitor {
    token_store: TokenStore,
    clock: Arc<dyn Clock>,
    refresh_lead_time: Duration,
    min_refresh_delay: Duration,
    state: Mutex<MonitorState>,
    sender: mpsc::UnboundedSender<TimerFired>,
}

impl SessionMonitor {
    /// Create a monitor and the receiver its timer firings are delivered to.
    pub fn new(
        token_store: TokenStore,
        clock: Arc<dyn Clock>,
        settings: &SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let monitor = Self {
            token_store,
            clock,
            refresh_lead_time: settings.refresh_lead_time,
            min_refresh_delay: settings.min_refresh_delay,
            state: Mutex::new(MonitorState::default()),
            sender,
        };
        (monitor, receiver)
    }

    /// `max(expires_in - lead, min)`.
    pub fn refresh_delay(&self, expires_in: Duration) -> Duration {
        expires_in
            .saturating_sub(self.refresh_lead_time)
            .max(self.min_refresh_delay)
    }

    /// Start timers for a session lasting `expires_in` from now.
    ///
    /// Cancels any armed timers, persists the expiry, then arms the new pair.
    pub async fn start(&self, expires_in: Duration) -> Result<DateTime<Utc>> {
        self.cancel_timers();

        let expires_at = chrono::Duration::from_std(expires_in)
            .ok()
            .and_then(|delta| self.clock.now().checked_add_signed(delta))
            .ok_or_else(|| {
                AuthError::InvalidResponse(format!("Session lifetime out of range: {:?}", expires_in))
            })?;

        self.token_store.set_expires_at(expires_at).await?;
        self.arm(expires_in, expires_at);
        Ok(expires_at)
    }

    /// Re-arm timers for a persisted session from its remaining lifetime.
    ///
    /// An already passed `expires_at` arms the expiry timer with no delay.
    pub fn resume(&self, expires_at: DateTime<Utc>) -> ArmedTimers {
        let remaining = (expires_at - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.arm(remaining, expires_at)
    }

    /// Cancel both timers and remove the persisted expiry. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.cancel_timers();
        self.token_store.clear_expires_at().await
    }

    /// Cancel both timers, leaving storage untouched.
    pub fn cancel_timers(&self) {
        let mut state = self.lock_state();
        if let Some(token) = state.cancel.take() {
            token.cancel();
            debug!(generation = state.generation, "Session timers cancelled");
        }
        state.armed = None;
        state.generation += 1;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.lock_state();
        state.armed.is_some() && state.generation == generation
    }

    pub fn armed(&self) -> Option<ArmedTimers> {
        self.lock_state().armed
    }

    pub fn is_armed(&self) -> bool {
        self.armed().is_some()
    }

    fn arm(&self, expires_in: Duration, expires_at: DateTime<Utc>) -> ArmedTimers {
        let refresh_in = self.refresh_delay(expires_in);

        let mut state = self.lock_state();
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }
        state.generation += 1;

        let token = CancellationToken::new();
        let armed = ArmedTimers {
            generation: state.generation,
            refresh_in,
            expires_in,
            expires_at,
        };
        self.spawn_timer(TimerKind::Refresh, refresh_in, armed.generation, token.clone());
        self.spawn_timer(TimerKind::Expiry, expires_in, armed.generation, token.clone());
        state.cancel = Some(token);
        state.armed = Some(armed);

        debug!(
            generation = armed.generation,
            refresh_in_secs = refresh_in.as_secs(),
            expires_in_secs = expires_in.as_secs(),
            "Session timers armed"
        );
        armed
    }

    fn spawn_timer(
        &self,
        kind: TimerKind,
        delay: Duration,
        generation: u64,
        token: CancellationToken,
    ) {
        // The deadline is fixed at arming time, not when the task first runs.
        let Some(deadline) = Instant::now().checked_add(delay) else {
            debug!(?kind, "Timer delay out of range, not arming");
            return;
        };
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = sender.send(TimerFired { kind, generation });
                }
            }
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.lock_state().cancel.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::StorageKeys;
    use bridge_desktop::MemoryKeyValueStore;
    use bridge_traits::time::ManualClock;

    fn monitor() -> (SessionMonitor, mpsc::UnboundedReceiver<TimerFired>, TokenStore) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let tokens = TokenStore::new(
            Arc::new(MemoryKeyValueStore::new_origin()),
            StorageKeys::new("test"),
            Arc::clone(&clock),
        );
        let (monitor, rx) = SessionMonitor::new(tokens.clone(), clock, &SessionSettings::default());
        (monitor, rx, tokens)
    }

    #[test]
    fn test_refresh_delay_arithmetic() {
        let (monitor, _rx, _) = monitor();
        assert_eq!(monitor.refresh_delay(Duration::from_secs(600)), Duration::from_secs(300));
        assert_eq!(monitor.refresh_delay(Duration::from_secs(3600)), Duration::from_secs(3300));
        assert_eq!(monitor.refresh_delay(Duration::from_secs(320)), Duration::from_secs(60));
        assert_eq!(monitor.refresh_delay(Duration::from_secs(10)), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_arms_and_persists() {
        let (monitor, mut rx, tokens) = monitor();
        let expires_at = monitor.start(Duration::from_secs(600)).await.unwrap();

        let armed = monitor.armed().unwrap();
        assert_eq!(armed.refresh_in, Duration::from_secs(300));
        assert_eq!(armed.expires_in, Duration::from_secs(600));
        assert_eq!(
            tokens.expires_at().await.map(|t| t.timestamp_millis()),
            Some(expires_at.timestamp_millis())
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Refresh);
        assert!(monitor.is_current(fired.generation));

        tokio::time::advance(Duration::from_secs(300)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_both_timers() {
        let (monitor, mut rx, _) = monitor();
        monitor.start(Duration::from_secs(600)).await.unwrap();
        let first = monitor.armed().unwrap().generation;

        tokio::time::advance(Duration::from_secs(200)).await;
        monitor.start(Duration::from_secs(600)).await.unwrap();
        assert!(!monitor.is_current(first));

        // The first pair would have fired at 300s; only the new refresh fires, at 500s.
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Refresh);
        assert!(monitor.is_current(fired.generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_silences_timers() {
        let (monitor, mut rx, tokens) = monitor();
        monitor.stop().await.unwrap();
        monitor.stop().await.unwrap();
        assert!(!monitor.is_armed());

        monitor.start(Duration::from_secs(120)).await.unwrap();
        monitor.stop().await.unwrap();
        monitor.stop().await.unwrap();
        assert!(!monitor.is_armed());
        assert_eq!(tokens.expires_at().await, None);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_uses_remaining_time() {
        let clock = ManualClock::default();
        let tokens = TokenStore::new(
            Arc::new(MemoryKeyValueStore::new_origin()),
            StorageKeys::new("test"),
            Arc::new(clock.clone()),
        );
        let (monitor, mut rx) =
            SessionMonitor::new(tokens, Arc::new(clock.clone()), &SessionSettings::default());

        let armed = monitor.resume(clock.now() + chrono::Duration::seconds(400));
        assert_eq!(armed.expires_in, Duration::from_secs(400));
        assert_eq!(armed.refresh_in, Duration::from_secs(100));

        let armed = monitor.resume(clock.now() - chrono::Duration::seconds(5));
        assert_eq!(armed.expires_in, Duration::ZERO);
        tokio::time::advance(Duration::from_millis(1)).await;
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.kind, TimerKind::Expiry);
    }
}
