// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection lifecycle state machine.
//!
//! ```text
//!                ConnectRequested          ConnectSucceeded
//!  Disconnected ─────────────────► Connecting ─────────────► Connected
//!       ▲  ▲                          │                        │
//!       │  └──── ConnectFailed ───────┘                        │ ConnectionLost
//!       │                                                      ▼
//!       │ ReconnectExhausted                             Disconnected
//!       │                                                      │ ReconnectScheduled(n)
//!       └──────────────────────── Reconnecting{n} ◄────────────┘
//!
//!  any ── CircuitTripped ──► CircuitOpen ── CircuitReset ──► Disconnected
//! ```
//!
//! While the circuit is open every other event is ignored: a successful health check
//! must not close an open breaker early.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    CircuitOpen,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({})", attempt),
            Self::CircuitOpen => write!(f, "circuit_open"),
        }
    }
}

/// Inputs to the state machine, raised by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    /// Liveness check failed on an established connection
    ConnectionLost,
    /// Backoff timer armed for reconnect attempt `n` (1-based)
    ReconnectScheduled(u32),
    ReconnectExhausted,
    CircuitTripped,
    CircuitReset,
    Shutdown,
}

impl ConnectionState {
    /// Transition function. Pure, so the breaker/reconnect interplay can be
    /// tested without a network.
    #[must_use]
    pub fn on_event(self, event: ConnectionEvent) -> Self {
        use ConnectionEvent as E;

        match (self, event) {
            (_, E::Shutdown) => Self::Disconnected,
            (_, E::CircuitTripped) => Self::CircuitOpen,
            (Self::CircuitOpen, E::CircuitReset) => Self::Disconnected,
            (Self::CircuitOpen, _) => Self::CircuitOpen,

            (Self::Reconnecting { .. }, E::ConnectRequested) => self,
            (Self::Connected, E::ConnectRequested) => self,
            (_, E::ConnectRequested) => Self::Connecting,

            (_, E::ConnectSucceeded) => Self::Connected,

            (Self::Reconnecting { .. }, E::ConnectFailed) => self,
            (Self::Connected, E::ConnectFailed) => self,
            (_, E::ConnectFailed) => Self::Disconnected,

            (_, E::ConnectionLost) => Self::Disconnected,
            (Self::Connected, E::ReconnectScheduled(_)) => self,
            (_, E::ReconnectScheduled(attempt)) => Self::Reconnecting { attempt },
            (Self::Reconnecting { .. }, E::ReconnectExhausted) => Self::Disconnected,

            (state, _) => state,
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent as E;

    fn run(events: &[ConnectionEvent]) -> ConnectionState {
        events.iter().fold(ConnectionState::default(), |s, e| s.on_event(*e))
    }

    #[test]
    fn test_happy_path() {
        assert_eq!(run(&[E::ConnectRequested]), ConnectionState::Connecting);
        assert_eq!(run(&[E::ConnectRequested, E::ConnectSucceeded]), ConnectionState::Connected);
    }

    #[test]
    fn test_lost_connection_reconnects() {
        let s = run(&[E::ConnectRequested, E::ConnectSucceeded, E::ConnectionLost, E::ReconnectScheduled(1)]);
        assert_eq!(s, ConnectionState::Reconnecting { attempt: 1 });

        // A failed attempt keeps us reconnecting; the next schedule bumps the attempt
        let s = s.on_event(E::ConnectRequested).on_event(E::ConnectFailed);
        assert_eq!(s, ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(s.on_event(E::ReconnectScheduled(2)), ConnectionState::Reconnecting { attempt: 2 });

        assert_eq!(s.on_event(E::ConnectSucceeded), ConnectionState::Connected);
        assert_eq!(s.on_event(E::ReconnectExhausted), ConnectionState::Disconnected);
    }

    #[test]
    fn test_open_circuit_ignores_successful_check() {
        let s = run(&[E::ConnectRequested, E::ConnectSucceeded, E::CircuitTripped]);
        assert_eq!(s, ConnectionState::CircuitOpen);
        assert!(!s.is_connected());

        assert_eq!(s.on_event(E::ConnectSucceeded), ConnectionState::CircuitOpen);
        assert_eq!(s.on_event(E::ReconnectScheduled(3)), ConnectionState::CircuitOpen);

        let s = s.on_event(E::CircuitReset);
        assert_eq!(s, ConnectionState::Disconnected);
        assert_eq!(s.on_event(E::ConnectSucceeded), ConnectionState::Connected);
    }

    #[test]
    fn test_stray_events_keep_connected() {
        let s = run(&[E::ConnectRequested, E::ConnectSucceeded]);
        assert_eq!(s.on_event(E::ConnectFailed), ConnectionState::Connected);
        assert_eq!(s.on_event(E::ReconnectScheduled(1)), ConnectionState::Connected);
        assert_eq!(s.on_event(E::CircuitReset), ConnectionState::Connected);
        assert_eq!(s.on_event(E::Shutdown), ConnectionState::Disconnected);
    }

    #[test]
    fn test_display_and_serialize() {
        assert_eq!(ConnectionState::Reconnecting { attempt: 4 }.to_string(), "reconnecting(4)");
        let json = serde_json::to_value(ConnectionState::CircuitOpen).unwrap();
        assert_eq!(json["state"], "circuit_open");
    }
}
