//! Lifecycle observers for desktop hosts.

use async_trait::async_trait;
use bridge_traits::{
    background::{LifecycleChangeStream, LifecycleObserver, LifecycleState},
    error::Result,
};
use tokio::sync::watch;
use tracing::debug;

/// Desktop lifecycle observer (always foreground).
pub struct DesktopLifecycleObserver;

impl DesktopLifecycleObserver {
    /// Create a new lifecycle observer.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DesktopLifecycleObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleObserver for DesktopLifecycleObserver {
    async fn get_state(&self) -> Result<LifecycleState> {
        Ok(LifecycleState::Foreground)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>> {
        Ok(Box::new(DesktopLifecycleChangeStream))
    }
}

/// Desktop lifecycle change stream (never emits).
struct DesktopLifecycleChangeStream;

#[async_trait]
impl LifecycleChangeStream for DesktopLifecycleChangeStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        std::future::pending::<()>().await;
        None
    }
}

/// Lifecycle observer driven by the host.
///
/// The host forwards window focus / visibility events through
/// [`set_state`](Self::set_state). Repeating the current state is a no-op.
pub struct ChannelLifecycleObserver {
    sender: watch::Sender<LifecycleState>,
}

impl ChannelLifecycleObserver {
    pub fn new(initial: LifecycleState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Record a lifecycle transition. Returns `true` if the state changed.
    pub fn set_state(&self, state: LifecycleState) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(state = %state, "Lifecycle state changed");
        }
        changed
    }

    pub fn current(&self) -> LifecycleState {
        *self.sender.borrow()
    }
}

impl Default for ChannelLifecycleObserver {
    fn default() -> Self {
        Self::new(LifecycleState::Foreground)
    }
}

#[async_trait]
impl LifecycleObserver for ChannelLifecycleObserver {
    async fn get_state(&self) -> Result<LifecycleState> {
        Ok(self.current())
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>> {
        Ok(Box::new(ChannelLifecycleChangeStream {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct ChannelLifecycleChangeStream {
    receiver: watch::Receiver<LifecycleState>,
}

#[async_trait]
impl LifecycleChangeStream for ChannelLifecycleChangeStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        self.receiver.changed().await.ok()?;
        Some(*self.receiver.borrow_and_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_desktop_observer_is_foreground() {
        let observer = DesktopLifecycleObserver::new();
        assert_eq!(observer.get_state().await.unwrap(), LifecycleState::Foreground);

        let mut stream = observer.subscribe_changes().await.unwrap();
        assert!(timeout(Duration::from_millis(20), stream.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_observer_delivers_transitions() {
        let observer = ChannelLifecycleObserver::default();
        let mut stream = observer.subscribe_changes().await.unwrap();

        assert!(observer.set_state(LifecycleState::Background));
        assert_eq!(stream.next().await, Some(LifecycleState::Background));

        assert!(observer.set_state(LifecycleState::Foreground));
        assert_eq!(stream.next().await, Some(LifecycleState::Foreground));
        assert_eq!(observer.get_state().await.unwrap(), LifecycleState::Foreground);
    }

    #[tokio::test]
    async fn test_repeated_state_is_ignored() {
        let observer = ChannelLifecycleObserver::default();
        let mut stream = observer.subscribe_changes().await.unwrap();

        assert!(!observer.set_state(LifecycleState::Foreground));
        assert!(timeout(Duration::from_millis(20), stream.next()).await.is_err());
    }
}
