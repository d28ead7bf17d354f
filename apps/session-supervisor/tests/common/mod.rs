//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mockall::mock;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use session_supervisor::{
    AccountId, Authenticator, AuthenticatorError, Clock, ConnectionManager, ConnectionState,
    Credential, HandleId, InstrumentId, StateChange, StreamTransport, SubscriptionMode, SubscriptionRegistry,
    TransportError, TransportEvent, TransportEventSender, TransportHandle,
};

pub const ACCOUNT: &str = "AB1234";

pub fn account() -> AccountId {
    AccountId::new(ACCOUNT)
}

pub fn credential(token: &str) -> Credential {
    Credential::new(token, Utc::now())
}

pub fn ids(raw: &[u32]) -> Vec<InstrumentId> {
    raw.iter().copied().map(InstrumentId::new).collect()
}

/// Wall-clock instant in India Standard Time.
pub fn ist(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    chrono_tz::Asia::Kolkata
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

// =============================================================================
// Recording Transport
// =============================================================================

/// A call made against the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { token: String, handle: Option<HandleId> },
    Subscribe { handle: HandleId, instruments: Vec<InstrumentId>, mode: SubscriptionMode },
    Unsubscribe { handle: HandleId, instruments: Vec<InstrumentId> },
    Close { handle: HandleId },
}

/// In-process transport that records every call and confirms connects by
/// emitting `Connected` on the event channel.
#[derive(Default)]
pub struct RecordingTransport {
    next_id: AtomicU64,
    calls: Mutex<Vec<Call>>,
    rejected_tokens: Mutex<HashSet<String>>,
    failing_connects: AtomicUsize,
    close_delay: Mutex<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse `token` during connect.
    pub fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().insert(token.to_string());
    }

    /// Fail the next `n` connects with a network error.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make every `close` take `delay` before returning.
    pub fn slow_close(&self, delay: Duration) {
        *self.close_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Tokens of successful connects, in order.
    pub fn connected_tokens(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Connect { token, handle: Some(_) } => Some(token.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Connect { .. }))
            .count()
    }

    pub fn subscribed(&self) -> Vec<(Vec<InstrumentId>, SubscriptionMode)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Subscribe { instruments, mode, .. } => Some((instruments.clone(), *mode)),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<HandleId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Close { handle } => Some(*handle),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl StreamTransport for RecordingTransport {
    async fn connect(
        &self,
        credential: &Credential,
        events: TransportEventSender,
    ) -> Result<TransportHandle, TransportError> {
        let token = credential.token().to_string();

        if self.rejected_tokens.lock().contains(&token) {
            self.calls.lock().push(Call::Connect { token, handle: None });
            return Err(TransportError::CredentialRejected("invalid access token".to_string()));
        }

        let failing = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.calls.lock().push(Call::Connect { token, handle: None });
            return Err(TransportError::ConnectionFailed("connection refused".to_string()));
        }

        let id = HandleId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.calls.lock().push(Call::Connect { token, handle: Some(id) });
        events
            .send(TransportEvent::Connected { handle: id })
            .await
            .unwrap();
        Ok(TransportHandle::new(id, Utc::now()))
    }

    async fn subscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
        mode: SubscriptionMode,
    ) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Subscribe {
            handle: handle.id(),
            instruments: instruments.to_vec(),
            mode,
        });
        Ok(())
    }

    async fn unsubscribe(
        &self,
        handle: &TransportHandle,
        instruments: &[InstrumentId],
    ) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Unsubscribe {
            handle: handle.id(),
            instruments: instruments.to_vec(),
        });
        Ok(())
    }

    async fn close(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        self.calls.lock().push(Call::Close { handle: handle.id() });
        let delay = *self.close_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

// =============================================================================
// Authenticator
// =============================================================================

mock! {
    pub Auth {}

    #[async_trait]
    impl Authenticator for Auth {
        async fn current_credential(&self, account: &AccountId) -> Result<Credential, AuthenticatorError>;
        async fn force_reauthenticate(&self, account: &AccountId) -> Result<Credential, AuthenticatorError>;
    }
}

/// Authenticator that always serves `token` and never re-authenticates.
pub fn serving(token: &'static str) -> MockAuth {
    let mut auth = MockAuth::new();
    auth.expect_current_credential()
        .returning(move |_| Ok(credential(token)));
    auth.expect_force_reauthenticate().never();
    auth
}

/// Authenticator serving `current`, rotating to `fresh` exactly once.
pub fn rotating(current: &'static str, fresh: &'static str) -> MockAuth {
    let mut auth = MockAuth::new();
    auth.expect_current_credential()
        .returning(move |_| Ok(credential(current)));
    auth.expect_force_reauthenticate()
        .times(1)
        .returning(move |_| Ok(credential(fresh)));
    auth
}

// =============================================================================
// Clock
// =============================================================================

/// Manually advanced clock.
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(now)))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Connection manager wired to a recording transport. Events are delivered
/// only when the test calls [`Harness::pump`].
pub struct Harness {
    pub transport: Arc<RecordingTransport>,
    pub registry: Arc<SubscriptionRegistry>,
    pub manager: Arc<ConnectionManager>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Harness {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        let transport = RecordingTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::new(ConnectionManager::new(
            account(),
            transport.clone(),
            authenticator,
            Arc::clone(&registry),
            tx,
        ));

        Self {
            transport,
            registry,
            manager,
            events: rx,
        }
    }

    /// Deliver every queued transport event. Returns how many were handled.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.manager.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Handle of the live connection.
    pub fn handle(&self) -> HandleId {
        self.manager.current_handle().unwrap().id()
    }
}

/// Connection manager with its event pump running on a spawned task, the
/// way the binary wires it.
pub struct PumpedHarness {
    pub transport: Arc<RecordingTransport>,
    pub registry: Arc<SubscriptionRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub events: TransportEventSender,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl PumpedHarness {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        let transport = RecordingTransport::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let (tx, rx) = mpsc::channel(64);
        let manager = Arc::new(ConnectionManager::new(
            account(),
            transport.clone(),
            authenticator,
            Arc::clone(&registry),
            tx.clone(),
        ));
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(Arc::clone(&manager).process_events(rx, cancel.clone()));

        Self {
            transport,
            registry,
            manager,
            events: tx,
            cancel,
            pump,
        }
    }

    /// Wait until the manager reports `state` on a handle other than `not`.
    pub async fn wait_for(&self, state: ConnectionState, not: Option<HandleId>) -> HandleId {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if self.manager.current_state() == state
                    && let Some(handle) = self.manager.current_handle()
                    && Some(handle.id()) != not
                {
                    return handle.id();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("state not reached in time")
    }

    /// Stop the pump and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.pump.await.unwrap();
    }
}

/// Poll `current_state()` from its own task until cancelled and return the
/// slowest read observed.
pub fn watch_read_latency(
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
) -> JoinHandle<Duration> {
    tokio::spawn(async move {
        let mut slowest = Duration::ZERO;
        while !cancel.is_cancelled() {
            let started = std::time::Instant::now();
            let _ = manager.current_state();
            let _ = manager.current_handle();
            slowest = slowest.max(started.elapsed());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        slowest
    })
}

/// Drain every state change received so far.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<StateChange>) -> Vec<StateChange> {
    let mut changes = Vec::new();
    while let Ok(change) = rx.try_recv() {
        changes.push(change);
    }
    changes
}
