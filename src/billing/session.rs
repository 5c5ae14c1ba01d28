//! Current-user source injected into the reader, invalidator and poller.

use std::sync::Arc;
use tokio::sync::watch;

/// Holds the id of the logged-in user, if any.
///
/// Cloning shares the same session. Observers call [`subscribe`](Self::subscribe)
/// and react to changes; there is no global singleton.
#[derive(Debug, Clone)]
pub struct SessionContext {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl SessionContext {
    /// Create a session with nobody logged in.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a session already bound to `user_id`.
    #[must_use]
    pub fn for_user(user_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(Some(user_id.into()));
        Self { tx: Arc::new(tx) }
    }

    /// Set the current user. No-op if that user is already current.
    pub fn login(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(user_id.as_str()) {
                false
            } else {
                tracing::debug!(target: "subscription_sync::session", user_id = %user_id, "Session user set");
                *current = Some(user_id);
                true
            }
        });
    }

    /// Clear the current user.
    pub fn logout(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                tracing::debug!(target: "subscription_sync::session", "Session user cleared");
                *current = None;
                true
            } else {
                false
            }
        });
    }

    /// Id of the current user.
    #[must_use]
    pub fn current_user(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Watch for user changes. The initial value is marked as seen.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
