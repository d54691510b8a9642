//! Session lifecycle states.

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Discovered, never connected.
    #[default]
    Idle,
    /// Waiting for the transport to open a link.
    Connecting,
    /// Link open, enumerating GATT services.
    DiscoveringServices,
    /// Enabling notifications on the recognised channels.
    SubscribingChannels,
    /// All required channels subscribed, no payload seen yet.
    Ready,
    /// At least one notification has been received.
    Streaming,
    /// Releasing the link.
    Disconnecting,
    /// Link released.
    Disconnected,
    /// A transport operation failed; the session is being torn down.
    Failed,
}

impl SessionState {
    /// Whether the transport link is believed to be open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::SubscribingChannels | Self::Ready | Self::Streaming
        )
    }

    /// Whether the session is fully set up.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Streaming)
    }

    /// Whether `connect()` may start from this state.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected)
    }

    /// Whether a connect sequence is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::SubscribingChannels
                | Self::Disconnecting
        )
    }

    /// Whether notifications are accepted in this state.
    ///
    /// The priming battery request is issued while still subscribing, so
    /// its reply can arrive before `Ready`.
    pub fn accepts_notifications(&self) -> bool {
        matches!(self, Self::SubscribingChannels | Self::Ready | Self::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::SubscribingChannels => write!(f, "SubscribingChannels"),
            Self::Ready => write!(f, "Ready"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state() {
        assert!(!SessionState::Idle.is_connected());
        assert!(!SessionState::Connecting.is_connected());
        assert!(SessionState::DiscoveringServices.is_connected());
        assert!(SessionState::Streaming.is_connected());
        assert!(!SessionState::Disconnecting.is_connected());

        assert!(SessionState::Idle.can_connect());
        assert!(SessionState::Disconnected.can_connect());
        assert!(!SessionState::Failed.can_connect());
        assert!(!SessionState::Ready.can_connect());

        assert!(SessionState::Connecting.is_transitioning());
        assert!(!SessionState::Ready.is_transitioning());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(format!("{}", SessionState::Streaming), "Streaming");
        assert_eq!(format!("{}", SessionState::Idle), "Idle");
    }
}
