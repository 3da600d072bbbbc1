//! Typed notifications emitted by sessions and the token manager.

use serde::Serialize;
use tokio::sync::mpsc;

/// Why a session left the Ready state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// `stop` was called.
    Stopped,
    /// The gateway answered with 401; the credential must be re-acquired.
    TokenExpired,
    /// A fresh credential was issued in the background; reconnect with it.
    CredentialRefreshed,
    /// Remote end closed the socket.
    TransportClosed,
    TransportError(String),
}

impl CloseReason {
    /// Reconnect right away instead of waiting out the restart backoff.
    pub fn reconnect_immediately(&self) -> bool {
        matches!(self, Self::TokenExpired | Self::CredentialRefreshed)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::TokenExpired => write!(f, "token expired"),
            Self::CredentialRefreshed => write!(f, "credential refreshed"),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Registration acknowledged; `credential` is the one the gateway accepted.
    Registered {
        account_id: String,
        session_id: String,
        credential: String,
    },
    TokenExpired {
        account_id: String,
    },
    CredentialRefreshed {
        account_id: String,
    },
    VerificationRequired {
        account_id: String,
        url: String,
    },
    Closed {
        account_id: String,
        reason: CloseReason,
    },
}

impl SessionEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::Registered { account_id, .. }
            | Self::TokenExpired { account_id }
            | Self::CredentialRefreshed { account_id }
            | Self::VerificationRequired { account_id, .. }
            | Self::Closed { account_id, .. } => account_id,
        }
    }
}

/// Cloneable sending half of the event channel. Sends never block and are
/// dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sender whose events go nowhere.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        tracing::debug!(account = event.account_id(), ?event, "Session event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
