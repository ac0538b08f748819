//! Session lifecycle notifications.

use smol_str::SmolStr;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Opaque identifier of a scheduled proactive refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefreshTimerId(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Login,
    Logout,
    SessionExpired,
    /// Access token refreshed; carries the new lifetime in seconds.
    SessionExtended {
        expires_in: i64,
    },
    SessionRestored {
        url: SmolStr,
    },
    /// The provider rotated the refresh token.
    NewRefreshToken(SmolStr),
    Error {
        code: SmolStr,
        description: Option<SmolStr>,
    },
    TimeoutSet(RefreshTimerId),
}

/// Broadcasts [`SessionEvent`]s to every subscriber.
///
/// Cloning yields another handle onto the same channel.
#[derive(Debug, Clone)]
pub struct SessionEventEmitter {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish `event`. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        #[cfg(feature = "tracing")]
        tracing::trace!(?event, "session event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
