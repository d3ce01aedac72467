//! Hub connection lifecycle state machine

use super::HubError;

/// Lifecycle state of the hub connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Automatic reconnection in progress; `attempt` is 0 until the first try
    Reconnecting { attempt: u32 },
    /// Connecting or reconnecting gave up with this error
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A connect attempt is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            Self::Failed(error) => write!(f, "failed: {}", error),
        }
    }
}

/// Guards every transition of [`ConnectionState`]
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Start a fresh connect from an idle or failed connection
    pub fn begin_connect(&mut self) -> Result<ConnectionState, HubError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                Ok(self.set(ConnectionState::Connecting))
            }
            _ => Err(self.invalid("begin_connect")),
        }
    }

    pub fn on_connected(&mut self) -> Result<ConnectionState, HubError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                Ok(self.set(ConnectionState::Connected))
            }
            _ => Err(self.invalid("on_connected")),
        }
    }

    /// The link dropped without being asked to
    pub fn on_connection_lost(&mut self) -> Result<ConnectionState, HubError> {
        match self.state {
            ConnectionState::Connected => Ok(self.set(ConnectionState::Reconnecting { attempt: 0 })),
            _ => Err(self.invalid("on_connection_lost")),
        }
    }

    pub fn on_reconnect_attempt(&mut self, attempt: u32) -> Result<ConnectionState, HubError> {
        match self.state {
            ConnectionState::Reconnecting { .. } => {
                Ok(self.set(ConnectionState::Reconnecting { attempt }))
            }
            _ => Err(self.invalid("on_reconnect_attempt")),
        }
    }

    pub fn on_failed(&mut self, error: impl Into<String>) -> Result<ConnectionState, HubError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                Ok(self.set(ConnectionState::Failed(error.into())))
            }
            _ => Err(self.invalid("on_failed")),
        }
    }

    /// Explicit stop; allowed from any state
    pub fn on_stopped(&mut self) -> ConnectionState {
        self.set(ConnectionState::Disconnected)
    }

    fn set(&mut self, next: ConnectionState) -> ConnectionState {
        self.state = next.clone();
        next
    }

    fn invalid(&self, action: &'static str) -> HubError {
        HubError::InvalidTransition {
            from: self.state.to_string(),
            action,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_reconnect_cycle() {
        let mut sm = ConnectionStateMachine::default();
        assert_eq!(sm.state(), &ConnectionState::Disconnected);

        sm.begin_connect().unwrap();
        assert_eq!(sm.state(), &ConnectionState::Connecting);

        sm.on_connected().unwrap();
        assert!(sm.state().is_connected());

        sm.on_connection_lost().unwrap();
        assert_eq!(sm.state(), &ConnectionState::Reconnecting { attempt: 0 });

        sm.on_reconnect_attempt(2).unwrap();
        assert_eq!(sm.state(), &ConnectionState::Reconnecting { attempt: 2 });

        sm.on_connected().unwrap();
        assert_eq!(sm.state(), &ConnectionState::Connected);
    }

    #[test]
    fn test_failed_is_not_terminal() {
        let mut sm = ConnectionStateMachine::default();
        sm.begin_connect().unwrap();
        sm.on_failed("unreachable").unwrap();
        assert_eq!(sm.state(), &ConnectionState::Failed("unreachable".to_string()));

        sm.begin_connect().expect("a failed connection may be retried");
        assert_eq!(sm.state(), &ConnectionState::Connecting);
    }

    #[test]
    fn test_rejects_invalid_transitions() {
        let mut sm = ConnectionStateMachine::default();

        let err = sm.on_connected().expect_err("cannot connect without an attempt");
        assert!(matches!(err, HubError::InvalidTransition { action: "on_connected", .. }));

        let err = sm.on_connection_lost().expect_err("nothing to lose");
        assert!(matches!(err, HubError::InvalidTransition { .. }));

        sm.begin_connect().unwrap();
        assert!(sm.begin_connect().is_err());

        sm.on_stopped();
        assert_eq!(sm.state(), &ConnectionState::Disconnected);
    }
}
