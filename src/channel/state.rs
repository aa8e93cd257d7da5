#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; only an explicit connect leaves this state.
    Failed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Disconnected => "DISCONNECTED",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Connected => "CONNECTED",
            ChannelState::Reconnecting => "RECONNECTING",
            ChannelState::Failed => "FAILED",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Connected)
    }

    pub fn is_valid_transition(from: ChannelState, to: ChannelState) -> bool {
        use ChannelState::*;
        match (from, to) {
            (_, Disconnected) => true,
            (Disconnected | Reconnecting | Failed, Connecting) => true,
            (Connecting, Connected) => true,
            (Connecting | Connected, Reconnecting) => true,
            (Connecting | Connected, Failed) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelState::{self, *};

    #[test]
    fn failed_only_leaves_through_connecting_or_disconnect() {
        assert!(ChannelState::is_valid_transition(Failed, Connecting));
        assert!(ChannelState::is_valid_transition(Failed, Disconnected));
        assert!(!ChannelState::is_valid_transition(Failed, Connected));
        assert!(!ChannelState::is_valid_transition(Failed, Reconnecting));
    }

    #[test]
    fn connected_requires_connecting_first() {
        assert!(!ChannelState::is_valid_transition(Disconnected, Connected));
        assert!(!ChannelState::is_valid_transition(Reconnecting, Connected));
        assert!(ChannelState::is_valid_transition(Connecting, Connected));
    }
}
