//! Lifecycle phases of a server connection and the transition table between
//! them. Side effects live in [`crate::client::connection`]; this module only
//! answers "where does this trigger lead from here".

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Dropped while connected; immediately restarts.
    Recovered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    Initialize,
    Connect,
    Disconnect,
    /// Raised by the transport "connect" signal.
    ConnectOk,
    /// Raised by a transport drop, or by teardown completing.
    ConnectErr,
    Restart,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::Initialized => "initialized",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnecting => "disconnecting",
            Phase::Disconnected => "disconnected",
            Phase::Recovered => "recovered",
        };
        f.write_str(name)
    }
}

/// Next phase for `trigger` in `phase`, or `None` if the trigger is not
/// valid there.
pub fn transition(phase: Phase, trigger: Trigger) -> Option<Phase> {
    use Phase::*;
    use Trigger::*;

    match (trigger, phase) {
        (Initialize, Created) => Some(Initialized),

        (Connect, Initialized | Disconnected) => Some(Connecting),

        (Disconnect, Initialized | Disconnected) => Some(Disconnected),
        (Disconnect, Connecting | Connected | Recovered) => Some(Disconnecting),

        (ConnectOk, Connecting | Recovered) => Some(Connected),

        (ConnectErr, Connecting | Disconnecting) => Some(Disconnected),
        (ConnectErr, Connected) => Some(Recovered),

        (Restart, Connected | Connecting | Recovered) => Some(Disconnecting),
        (Restart, Disconnected) => Some(Connecting),

        _ => None,
    }
}
