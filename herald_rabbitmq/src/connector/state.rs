use std::fmt::{Display, Formatter};

/// The lifecycle of a [`Connector`](crate::Connector), observable through its
/// [`Gateway`](crate::Gateway).
///
/// `Closed` and `Exhausted` are terminal: once reached, the connector no longer
/// serves channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    Init,
    /// The initial dial is in progress.
    Dialing,
    /// A connection is open and serving channels.
    Ready,
    /// The connection was lost; reconnection is under way.
    Reconnecting,
    /// The owning scope was cancelled and the connection closed.
    Closed,
    /// The initial dial failed.
    Failed,
    /// Reconnection gave up after the given number of attempts.
    Exhausted(u32),
}

impl ConnectionState {
    /// Reports whether the connector has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed | Self::Exhausted(_))
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::Dialing => f.write_str("dialing"),
            Self::Ready => f.write_str("ready"),
            Self::Reconnecting => f.write_str("reconnecting"),
            Self::Closed => f.write_str("closed"),
            Self::Failed => f.write_str("failed"),
            Self::Exhausted(attempts) => write!(f, "exhausted after {} attempts", attempts),
        }
    }
}
