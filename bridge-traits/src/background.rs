//! Application Lifecycle
//!
//! Visibility signal for the core. A transition into
//! [`LifecycleState::Foreground`] is treated as "visibility regained".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Application is in the foreground and visible
    Foreground,
    /// Application is hidden or in the background
    Background,
    /// Application is being suspended
    Suspended,
}

impl LifecycleState {
    pub fn is_visible(&self) -> bool {
        matches!(self, LifecycleState::Foreground)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Foreground => write!(f, "foreground"),
            LifecycleState::Background => write!(f, "background"),
            LifecycleState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Lifecycle observer trait
///
/// Notifies the core about visibility transitions so it can re-validate the
/// session when the user comes back to the application.
///
/// # Platform Support
///
/// - **Web**: Page Visibility API
/// - **Desktop**: Window focus/minimize events
/// - **Mobile**: Activity/UIApplication lifecycle callbacks
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::{LifecycleObserver, LifecycleState};
///
/// async fn watch_visibility(observer: &dyn LifecycleObserver) -> Result<()> {
///     let mut stream = observer.subscribe_changes().await?;
///
///     while let Some(state) = stream.next().await {
///         if state.is_visible() {
///             revalidate().await;
///         }
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// Get current lifecycle state
    async fn get_state(&self) -> Result<LifecycleState>;

    /// Subscribe to lifecycle state changes
    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>>;
}

/// Stream of lifecycle state changes
#[async_trait]
pub trait LifecycleChangeStream: Send {
    /// Get the next lifecycle state update
    ///
    /// Returns `None` when the stream is closed.
    async fn next(&mut self) -> Option<LifecycleState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_foreground_is_visible() {
        assert!(LifecycleState::Foreground.is_visible());
        assert!(!LifecycleState::Background.is_visible());
        assert!(!LifecycleState::Suspended.is_visible());
    }

    #[test]
    fn test_display() {
        assert_eq!(LifecycleState::Background.to_string(), "background");
    }
}
