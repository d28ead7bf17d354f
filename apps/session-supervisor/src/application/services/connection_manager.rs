//! Connection Manager
//!
//! Sole owner of the live stream connection for one account. Enforces the
//! single-connection invariant, replays the subscription registry on every
//! confirmed connect, and turns transport events into state transitions.
//!
//! # Locking
//!
//! - `lifecycle` (async mutex) serializes open, close, reconnect,
//!   re-authentication and connect confirmation. It is held across transport
//!   I/O so two connects can never overlap.
//! - `live` mirrors `(state, handle)` for lock-free reads. It is only written
//!   while `lifecycle` is held.
//! - `apply` (async mutex) keeps subscription pushes single-flight. It is
//!   never acquired while holding `lifecycle`.
//! - The registry's own lock is released (via `snapshot`) before any
//!   transport call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    Authenticator, AuthenticatorError, StreamTransport, Tick, TickConsumer, TransportError,
    TransportEvent, TransportEventSender,
};
use crate::domain::connection::{
    ConnectionState, Credential, DisconnectReason, HandleId, StateChange, TransportHandle,
};
use crate::domain::schedule::AccountId;
use crate::domain::subscription::{
    InstrumentId, SubscriptionChanges, SubscriptionMode, SubscriptionRegistry,
};
use crate::infrastructure::metrics;

/// Capacity of the state change broadcast channel.
const STATE_CHANGE_CAPACITY: usize = 64;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by connection operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError {
    /// The transport refused the credential.
    #[error("credential rejected: {0}")]
    CredentialRejected(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The authenticator could not supply a credential.
    #[error("authenticator error: {0}")]
    Authenticator(#[from] AuthenticatorError),

    /// The connection is in a state that does not accept this request.
    #[error("connection is {0}")]
    Busy(ConnectionState),
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters exposed for health checks.
#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    reconnects: AtomicU64,
    reauthentications: AtomicU64,
    connect_failures: AtomicU64,
    subscription_pushes: AtomicU64,
}

/// Snapshot of connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStats {
    /// Ticks forwarded to consumers.
    pub ticks_received: u64,
    /// Reconnects after an unexpected disconnect.
    pub reconnects: u64,
    /// Calls to `force_reauthenticate`.
    pub reauthentications: u64,
    /// Failed connect attempts.
    pub connect_failures: u64,
    /// Successful subscription pushes.
    pub subscription_pushes: u64,
}

// =============================================================================
// Connection Manager
// =============================================================================

#[derive(Debug, Default)]
struct Live {
    state: ConnectionState,
    handle: Option<TransportHandle>,
}

/// Owns the stream connection for one account.
pub struct ConnectionManager {
    account: AccountId,
    transport: Arc<dyn StreamTransport>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<SubscriptionRegistry>,
    event_tx: TransportEventSender,
    lifecycle: Mutex<()>,
    apply: Mutex<()>,
    live: RwLock<Live>,
    consumers: RwLock<Vec<Arc<dyn TickConsumer>>>,
    state_tx: broadcast::Sender<StateChange>,
    counters: Counters,
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// `event_tx` is handed to the transport on every connect; the matching
    /// receiver must be drained by [`ConnectionManager::process_events`].
    #[must_use]
    pub fn new(
        account: AccountId,
        transport: Arc<dyn StreamTransport>,
        authenticator: Arc<dyn Authenticator>,
        registry: Arc<SubscriptionRegistry>,
        event_tx: TransportEventSender,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            account,
            transport,
            authenticator,
            registry,
            event_tx,
            lifecycle: Mutex::new(()),
            apply: Mutex::new(()),
            live: RwLock::new(Live::default()),
            consumers: RwLock::new(Vec::new()),
            state_tx,
            counters: Counters::default(),
        }
    }

    /// Account this manager serves.
    #[must_use]
    pub const fn account(&self) -> &AccountId {
        &self.account
    }

    /// Current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.live.read().state
    }

    /// Current handle, if a connection exists.
    #[must_use]
    pub fn current_handle(&self) -> Option<TransportHandle> {
        self.live.read().handle.clone()
    }

    /// Subscription registry replayed on connect.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Receive every state transition from now on.
    #[must_use]
    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    /// Register a downstream tick consumer.
    pub fn register_tick_consumer(&self, consumer: Arc<dyn TickConsumer>) {
        self.consumers.write().push(consumer);
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            ticks_received: self.counters.ticks.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            reauthentications: self.counters.reauthentications.load(Ordering::Relaxed),
            connect_failures: self.counters.connect_failures.load(Ordering::Relaxed),
            subscription_pushes: self.counters.subscription_pushes.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open the connection.
    ///
    /// Idempotent: while a connection exists this returns its handle
    /// without connecting again.
    ///
    /// # Errors
    ///
    /// Returns `ConnError::Busy` while waiting for a fresh credential, or
    /// the connect failure. A rejected credential leaves the state in
    /// `Reauthenticating`; any other failure returns it to `Closed`.
    pub async fn open(&self, credential: &Credential) -> Result<TransportHandle, ConnError> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let live = self.live.read();
            if let Some(handle) = &live.handle
                && live.state.is_active()
            {
                tracing::debug!(handle = %handle.id(), state = %live.state, "Connection already exists");
                return Ok(handle.clone());
            }
            if live.state != ConnectionState::Closed {
                return Err(ConnError::Busy(live.state));
            }
        }

        self.connect_locked(credential).await
    }

    /// Close the connection. Safe to call when already closed.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        if self.current_state() == ConnectionState::Closed {
            return;
        }

        self.transition(ConnectionState::Closing);
        let handle = self.live.write().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = self.transport.close(&handle).await {
                tracing::warn!(handle = %handle.id(), error = %e, "Transport close failed");
            }
            tracing::info!(account = %self.account, handle = %handle.id(), "Stream connection closed");
        }
        self.transition(ConnectionState::Closed);
    }

    /// Retry re-authentication while stuck in `Reauthenticating`.
    ///
    /// Returns `Ok(None)` when the state no longer needs it.
    ///
    /// # Errors
    ///
    /// Returns the authenticator or connect failure.
    pub async fn reauthenticate(&self) -> Result<Option<TransportHandle>, ConnError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.current_state() != ConnectionState::Reauthenticating {
            return Ok(None);
        }

        self.reauthenticate_locked().await.map(Some)
    }

    /// Connect with `credential`. Caller holds `lifecycle`.
    async fn connect_locked(&self, credential: &Credential) -> Result<TransportHandle, ConnError> {
        self.transition(ConnectionState::Opening);
        tracing::info!(account = %self.account, "Opening stream connection");

        let started = Instant::now();
        let result = self.transport.connect(credential, self.event_tx.clone()).await;
        metrics::record_connect_duration(started.elapsed());

        match result {
            Ok(handle) => {
                tracing::info!(account = %self.account, handle = %handle.id(), "Stream transport connected");
                self.live.write().handle = Some(handle.clone());
                Ok(handle)
            }
            Err(TransportError::CredentialRejected(msg)) => {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_connect_failure("credential_rejected");
                tracing::warn!(account = %self.account, reason = %msg, "Credential rejected on connect");
                self.transition(ConnectionState::Reauthenticating);
                Err(ConnError::CredentialRejected(msg))
            }
            Err(e) => {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_connect_failure("transport");
                tracing::warn!(account = %self.account, error = %e, "Stream connect failed");
                self.transition(ConnectionState::Closed);
                Err(e.into())
            }
        }
    }

    /// Fetch a fresh credential once and reconnect. Caller holds `lifecycle`.
    async fn reauthenticate_locked(&self) -> Result<TransportHandle, ConnError> {
        self.counters.reauthentications.fetch_add(1, Ordering::Relaxed);
        tracing::info!(account = %self.account, "Requesting fresh credential");

        match self.authenticator.force_reauthenticate(&self.account).await {
            Ok(credential) => {
                metrics::record_reauthentication("success");
                self.connect_locked(&credential).await
            }
            Err(e) => {
                metrics::record_reauthentication("failure");
                tracing::warn!(
                    account = %self.account,
                    error = %e,
                    "Re-authentication failed, will retry on next poll"
                );
                Err(e.into())
            }
        }
    }

    /// Apply a state transition and publish it.
    fn transition(&self, to: ConnectionState) {
        let from = {
            let mut live = self.live.write();
            let from = live.state;
            if from == to {
                return;
            }
            if !from.can_transition_to(to) {
                tracing::error!(from = %from, to = %to, "Rejected invalid connection state transition");
                return;
            }
            live.state = to;
            from
        };

        tracing::debug!(account = %self.account, from = %from, to = %to, "Connection state changed");
        metrics::set_connection_state(to);
        let _ = self.state_tx.send(StateChange {
            from,
            to,
            at: Utc::now(),
        });
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Push the full registry to the live connection.
    ///
    /// Does nothing unless the connection is `Open`. Returns the number of
    /// instruments pushed.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure.
    pub async fn apply_subscriptions(&self) -> Result<usize, ConnError> {
        let _apply = self.apply.lock().await;

        let Some(handle) = self.open_handle() else {
            return Ok(0);
        };

        let snapshot = self.registry.snapshot();
        metrics::set_subscriptions(snapshot.len());

        for (mode, instruments) in snapshot.by_mode() {
            self.transport
                .subscribe(&handle, &instruments, mode)
                .await
                .inspect_err(|e| {
                    tracing::warn!(handle = %handle.id(), mode = mode.as_str(), error = %e, "Subscription push failed");
                })?;
        }

        self.counters.subscription_pushes.fetch_add(1, Ordering::Relaxed);
        metrics::record_subscription_push();
        tracing::debug!(handle = %handle.id(), instruments = snapshot.len(), "Subscriptions applied");
        Ok(snapshot.len())
    }

    /// Add instruments of interest.
    ///
    /// Always succeeds against the registry; pushed live when `Open`.
    pub async fn add_instruments(
        &self,
        ids: impl IntoIterator<Item = InstrumentId>,
        mode: SubscriptionMode,
    ) -> SubscriptionChanges {
        let changes = self.registry.add(ids, mode);
        metrics::set_subscriptions(self.registry.len());

        if !changes.is_empty()
            && let Err(e) = self.apply_subscriptions().await
        {
            tracing::warn!(error = %e, "Live subscribe failed, will replay on next connect");
        }

        changes
    }

    /// Remove instruments of interest.
    ///
    /// Always succeeds against the registry; unsubscribed live when `Open`.
    pub async fn remove_instruments(
        &self,
        ids: impl IntoIterator<Item = InstrumentId>,
    ) -> SubscriptionChanges {
        let changes = self.registry.remove(ids);
        metrics::set_subscriptions(self.registry.len());

        if changes.unsubscribe.is_empty() {
            return changes;
        }

        let _apply = self.apply.lock().await;
        if let Some(handle) = self.open_handle() {
            let removed: Vec<_> = changes.unsubscribe.iter().copied().collect();
            if let Err(e) = self.transport.unsubscribe(&handle, &removed).await {
                tracing::warn!(handle = %handle.id(), error = %e, "Live unsubscribe failed");
            }
        }

        changes
    }

    fn open_handle(&self) -> Option<TransportHandle> {
        let live = self.live.read();
        if live.state == ConnectionState::Open {
            live.handle.clone()
        } else {
            None
        }
    }

    fn is_current(&self, handle: HandleId) -> bool {
        self.live
            .read()
            .handle
            .as_ref()
            .is_some_and(|h| h.id() == handle)
    }

    // -------------------------------------------------------------------------
    // Transport Events
    // -------------------------------------------------------------------------

    /// Drain transport events until cancelled or the channel closes.
    pub async fn process_events(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Event pump cancelled");
                    return;
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::debug!("Transport event channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch a single transport event.
    pub async fn handle_event(&self, event: TransportEvent) {
        // Connect and disconnect re-check under the lifecycle lock.
        if matches!(event, TransportEvent::Tick { .. } | TransportEvent::Error { .. })
            && !self.is_current(event.handle())
        {
            tracing::trace!(handle = %event.handle(), "Dropping event from stale handle");
            return;
        }

        match event {
            TransportEvent::Connected { handle } => self.on_connect(handle).await,
            TransportEvent::Disconnected { handle, reason } => {
                self.on_disconnect(handle, reason).await;
            }
            TransportEvent::Tick { handle, tick } => self.on_tick(handle, &tick),
            TransportEvent::Error { handle, message } => self.on_error(handle, &message),
        }
    }

    /// Connection confirmed: mark `Open` and replay subscriptions.
    pub async fn on_connect(&self, handle: HandleId) {
        {
            let _lifecycle = self.lifecycle.lock().await;

            if !self.is_current(handle) {
                tracing::debug!(handle = %handle, "Ignoring connect from stale handle");
                return;
            }
            if self.current_state() != ConnectionState::Opening {
                return;
            }
            self.transition(ConnectionState::Open);
        }

        tracing::info!(account = %self.account, handle = %handle, "Stream connection open");

        if let Err(e) = self.apply_subscriptions().await {
            tracing::warn!(handle = %handle, error = %e, "Subscription replay failed");
        }
    }

    /// Connection lost: re-authenticate or reconnect immediately.
    pub async fn on_disconnect(&self, handle: HandleId, reason: DisconnectReason) {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.current_state();
        if !self.is_current(handle) || !state.is_active() {
            tracing::debug!(handle = %handle, state = %state, "Ignoring disconnect from stale handle");
            return;
        }

        tracing::warn!(account = %self.account, handle = %handle, reason = %reason, "Stream disconnected");

        let dead = self.live.write().handle.take();
        if let Some(dead) = dead {
            let _ = self.transport.close(&dead).await;
        }

        if reason.is_credential_rejection() {
            self.transition(ConnectionState::Reauthenticating);
            let _ = self.reauthenticate_locked().await;
            return;
        }

        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        metrics::record_reconnect();
        self.transition(ConnectionState::Opening);

        match self.authenticator.current_credential(&self.account).await {
            Ok(credential) => {
                let _ = self.connect_locked(&credential).await;
            }
            Err(e) => {
                tracing::warn!(account = %self.account, error = %e, "No credential for reconnect");
                self.transition(ConnectionState::Closed);
            }
        }
    }

    /// Non-fatal transport error: log only.
    pub fn on_error(&self, handle: HandleId, message: &str) {
        tracing::warn!(account = %self.account, handle = %handle, error = %message, "Stream error");
    }

    /// Forward a tick to every registered consumer.
    pub fn on_tick(&self, handle: HandleId, tick: &Tick) {
        if !self.is_current(handle) {
            tracing::trace!(handle = %handle, "Dropping tick from stale handle");
            return;
        }

        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick();

        for consumer in self.consumers.read().iter() {
            consumer.on_tick(tick);
        }
    }
}
