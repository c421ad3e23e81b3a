use std::sync::Arc;

use thiserror::Error;

use crate::sip::SipRequest;
use crate::transport::Conn;

/// Errors surfaced by [`crate::transport::Listener`].
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener has been closed; only a new bind recovers.
    #[error("sip: closed")]
    Closed,
    /// The request parsed, but its topmost Via carries no usable RFC 3261 branch.
    /// The request and its connection are handed back so the caller can reject it.
    #[error("sip: invalid branch")]
    InvalidBranch {
        request: Box<SipRequest>,
        conn: Arc<Conn>,
    },
    /// Bind, accept or receive failed. Fatal to the whole listener.
    #[error("sip: transport failure: {0}")]
    Transport(#[from] std::io::Error),
    /// Bytes from a peer could not be decoded as a SIP request.
    #[error("sip: malformed message from {}: {source:#}", .conn.peer_addr())]
    Codec {
        conn: Arc<Conn>,
        #[source]
        source: anyhow::Error,
    },
    /// A TCP peer closed or reset the stream. Nothing more arrives on `conn`.
    #[error("sip: connection closed by {}", .conn.peer_addr())]
    PeerClosed { conn: Arc<Conn> },
    /// A background task panicked or was cancelled.
    #[error("sip: listener task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ListenerError {
    /// Connection the error concerns, if there is one.
    pub fn conn(&self) -> Option<&Arc<Conn>> {
        match self {
            ListenerError::InvalidBranch { conn, .. }
            | ListenerError::Codec { conn, .. }
            | ListenerError::PeerClosed { conn } => Some(conn),
            _ => None,
        }
    }

    /// Whether the listener is finished; no further requests will be delivered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ListenerError::Closed | ListenerError::Transport(_) | ListenerError::Task(_)
        )
    }
}
