//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following the
//! Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ScheduleStore`: read-only access to schedule entries
//! - `Authenticator`: current and refreshed stream credentials
//! - `StreamTransport`: the market data streaming connection
//! - `Clock`: wall-clock time
//!
//! ## Driver Ports (Inbound)
//!
//! - `TickConsumer`: fan-out target for ticks received on the stream

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::connection::{Credential, DisconnectReason, HandleId, TransportHandle};
use crate::domain::schedule::{AccountId, ScheduleEntry, ScheduleKind};
use crate::domain::subscription::{InstrumentId, SubscriptionMode};

// =============================================================================
// Schedule Store
// =============================================================================

/// Schedule store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleStoreError {
    /// Backend could not be queried.
    #[error("schedule store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to schedule entries.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Entries of `kind` owned by `account` plus all shared entries.
    async fn schedule_entries(
        &self,
        account: &AccountId,
        kind: ScheduleKind,
    ) -> Result<Vec<ScheduleEntry>, ScheduleStoreError>;
}

// =============================================================================
// Authenticator
// =============================================================================

/// Authenticator error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthenticatorError {
    /// No credential is available for the account.
    #[error("no credential available for account {0}")]
    Unavailable(String),

    /// The only credential available is the one just rejected.
    #[error("no fresh credential: the available token was already rejected")]
    StaleCredential,

    /// Backend failure.
    #[error("authenticator failure: {0}")]
    Backend(String),
}

/// Source of stream credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Credential to use for a normal connect.
    async fn current_credential(&self, account: &AccountId)
    -> Result<Credential, AuthenticatorError>;

    /// Obtain a replacement after the transport rejected the current one.
    async fn force_reauthenticate(
        &self,
        account: &AccountId,
    ) -> Result<Credential, AuthenticatorError>;
}

// =============================================================================
// Stream Transport
// =============================================================================

/// A single market data update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Instrument the update is for.
    pub instrument: InstrumentId,
    /// Raw packet payload, passed through undecoded.
    pub payload: Vec<u8>,
    /// When the packet was received.
    pub received_at: DateTime<Utc>,
}

/// Events delivered by a transport from its own task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection confirmed and ready for subscriptions.
    Connected {
        /// Connection the event belongs to.
        handle: HandleId,
    },
    /// Connection ended.
    Disconnected {
        /// Connection the event belongs to.
        handle: HandleId,
        /// Why it ended.
        reason: DisconnectReason,
    },
    /// Market data received.
    Tick {
        /// Connection the event belongs to.
        handle: HandleId,
        /// The update.
        tick: Tick,
    },
    /// Non-fatal error reported by the server or codec.
    Error {
        /// Connection the event belongs to.
        handle: HandleId,
        /// Error description.
        message: String,
    },
}

impl TransportEvent {
    /// Connection the event belongs to.
    #[must_use]
    pub const fn handle(&self) -> HandleId {
        match self {
            Self::Connected { handle }
            | Self::Disconnected { handle, .. }
            | Self::Tick { handle, .. }
            | Self::Error { handle, .. } => *handle,
        }
    }
}

/// Sender a transport uses to deliver events.
pub type TransportEventSender = mpsc::Sender<TransportEvent>;

/// Transport error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The credential was refused during connect.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// Connect failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The handle does not refer to a live connection.
    #[error("unknown or closed handle {0}")]
    UnknownHandle(HandleId),

    /// Sending a request failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Market data streaming connection.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a connection. Events for it are delivered on `events`.
    async fn connect(
        &self,
        credential: &Credential,
        events: TransportEventSender,
    ) -> Result<TransportHandle, TransportError>;

    /// Subscribe instruments in `mode`.
    async fn subscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError>;

    /// Unsubscribe instruments.
    async fn unsubscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
    ) -> Result<(), TransportError>;

    /// Close a connection. Closing an unknown handle succeeds.
    async fn close(&self, handle: &TransportHandle) -> Result<(), TransportError>;
}

// =============================================================================
// Tick Consumer
// =============================================================================

/// Downstream receiver of ticks.
///
/// Called synchronously from the event pump; implementations must not block.
pub trait TickConsumer: Send + Sync {
    /// Handle a tick.
    fn on_tick(&self, tick: &Tick);
}

// =============================================================================
// Clock
// =============================================================================

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
