//! Connection Lifecycle Types
//!
//! State machine, credential and handle types for the supervised stream
//! connection.
//!
//! # State Machine
//!
//! ```text
//!            open()             on_connect
//! Closed ───────────► Opening ────────────► Open
//!   ▲                  │  ▲ ▲                │ │
//!   │  connect failed  │  │ └─ disconnect ───┘ │ disconnect
//!   └──────────────────┘  │    (other)         │ (credential rejected)
//!                         │ new credential     ▼
//!                         └──────────── Reauthenticating
//!
//! any state ── close() ──► Closing ──► Closed
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of the supervised connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection and none requested.
    #[default]
    Closed,
    /// Connect issued, awaiting confirmation.
    Opening,
    /// Connected and streaming.
    Open,
    /// Credential rejected; waiting for a fresh one.
    Reauthenticating,
    /// Teardown in progress.
    Closing,
}

impl ConnectionState {
    /// Check if a state transition is valid.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Closed, Self::Opening)
                | (Self::Opening, Self::Open)
                | (Self::Opening, Self::Closed)
                | (Self::Opening, Self::Reauthenticating)
                | (Self::Open, Self::Opening)
                | (Self::Open, Self::Reauthenticating)
                | (Self::Reauthenticating, Self::Opening)
                | (
                    Self::Opening | Self::Open | Self::Reauthenticating,
                    Self::Closing
                )
                | (Self::Closing, Self::Closed)
        )
    }

    /// Whether the state holds, or is trying to hold, a connection.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Opening | Self::Open | Self::Reauthenticating)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Reauthenticating => "reauthenticating",
            Self::Closing => "closing",
        }
    }

    /// Numeric code for gauges.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Opening => 1,
            Self::Open => 2,
            Self::Reauthenticating => 3,
            Self::Closing => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

// =============================================================================
// Credential
// =============================================================================

/// Access credential for the streaming transport.
///
/// The token is opaque to the supervisor; `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    issued_at: DateTime<Utc>,
}

impl Credential {
    /// Create a new credential.
    #[must_use]
    pub fn new(token: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            issued_at,
        }
    }

    /// Get the access token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the credential was issued.
    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Identity of a single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HandleId(u64);

impl HandleId {
    /// Create a handle identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a live transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    id: HandleId,
    opened_at: DateTime<Utc>,
}

impl TransportHandle {
    /// Create a handle.
    #[must_use]
    pub const fn new(id: HandleId, opened_at: DateTime<Utc>) -> Self {
        Self { id, opened_at }
    }

    /// Handle identity.
    #[must_use]
    pub const fn id(&self) -> HandleId {
        self.id
    }

    /// When the connection was established.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}

// =============================================================================
// Disconnect Reason
// =============================================================================

/// WebSocket close codes that indicate the peer refused our credentials.
const CREDENTIAL_CLOSE_CODES: &[u16] = &[1008, 4001, 4003];

/// Message fragments that indicate credential rejection.
const CREDENTIAL_MARKERS: &[&str] = &[
    "invalid token",
    "access token",
    "tokenexception",
    "token expired",
    "token is invalid",
    "unauthorized",
    "unauthorised",
    "403 forbidden",
    "invalid api_key",
    "invalid api key",
    "credential",
];

/// Why a transport connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport no longer accepts the credential.
    CredentialRejected(String),
    /// The server closed the connection.
    ServerClosed {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason text.
        reason: String,
    },
    /// Network-level failure.
    Network(String),
    /// No traffic within the heartbeat window.
    HeartbeatTimeout,
}

impl DisconnectReason {
    /// Classify a free-form disconnect message.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        if mentions_credential(message) {
            Self::CredentialRejected(message.to_string())
        } else {
            Self::Network(message.to_string())
        }
    }

    /// Classify a close frame.
    #[must_use]
    pub fn from_close(code: Option<u16>, reason: &str) -> Self {
        let code_rejects = code.is_some_and(|c| CREDENTIAL_CLOSE_CODES.contains(&c));
        if code_rejects || mentions_credential(reason) {
            Self::CredentialRejected(reason.to_string())
        } else {
            Self::ServerClosed {
                code,
                reason: reason.to_string(),
            }
        }
    }

    /// Whether this disconnect means the credential must be replaced.
    #[must_use]
    pub const fn is_credential_rejection(&self) -> bool {
        matches!(self, Self::CredentialRejected(_))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialRejected(msg) => write!(f, "credential rejected: {msg}"),
            Self::ServerClosed { code: Some(code), reason } => {
                write!(f, "server closed ({code}): {reason}")
            }
            Self::ServerClosed { code: None, reason } => write!(f, "server closed: {reason}"),
            Self::Network(msg) => write!(f, "network: {msg}"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
        }
    }
}

fn mentions_credential(text: &str) -> bool {
    let lower = text.to_lowercase();
    CREDENTIAL_MARKERS.iter().any(|marker| lower.contains(marker))
}

// =============================================================================
// Tests
// =============================================================================
