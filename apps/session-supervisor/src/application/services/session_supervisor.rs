//! Session Supervisor
//!
//! Polling control loop that keeps the stream connection open exactly while
//! the account's trading session is active.
//!
//! Each tick resolves today's window in the exchange timezone, decides
//! whether the connection should be open and asks the [`ConnectionManager`]
//! to converge. Retries are throttled by the poll interval; there is no
//! separate backoff timer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{Authenticator, Clock};
use crate::application::services::connection_manager::ConnectionManager;
use crate::application::services::schedule_resolver::ScheduleResolver;
use crate::domain::connection::{ConnectionState, HandleId};
use crate::domain::schedule::{AccountId, SessionWindow};
use crate::infrastructure::metrics;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default exchange timezone.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Kolkata;

// =============================================================================
// Settings
// =============================================================================

/// Supervisor loop settings.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Timezone the schedule is expressed in.
    pub timezone: Tz,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

// =============================================================================
// Tick Outcome
// =============================================================================

/// What a single supervisor tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    /// State already matched the schedule.
    Idle,
    /// A connection was opened (or already existed).
    Opened(HandleId),
    /// Opening failed; the next tick retries.
    OpenFailed,
    /// A fresh credential was obtained and a reconnect issued.
    Reauthenticated(HandleId),
    /// Re-authentication failed; the next tick retries.
    ReauthenticationFailed,
    /// The session ended and the connection was closed.
    Closed,
}

// =============================================================================
// Session Supervisor
// =============================================================================

/// Drives one account's connection from its session schedule.
pub struct SessionSupervisor {
    account: AccountId,
    resolver: Arc<ScheduleResolver>,
    manager: Arc<ConnectionManager>,
    authenticator: Arc<dyn Authenticator>,
    clock: Arc<dyn Clock>,
    settings: SupervisorSettings,
    cancel: CancellationToken,
    should_be_open: AtomicBool,
}

impl SessionSupervisor {
    /// Create a supervisor. Nothing runs until [`SessionSupervisor::run`].
    #[must_use]
    pub fn new(
        resolver: Arc<ScheduleResolver>,
        manager: Arc<ConnectionManager>,
        authenticator: Arc<dyn Authenticator>,
        clock: Arc<dyn Clock>,
        settings: SupervisorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            account: manager.account().clone(),
            resolver,
            manager,
            authenticator,
            clock,
            settings,
            cancel,
            should_be_open: AtomicBool::new(false),
        }
    }

    /// Supervised account.
    #[must_use]
    pub const fn account(&self) -> &AccountId {
        &self.account
    }

    /// Connection manager driven by this supervisor.
    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Current connection state.
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.manager.current_state()
    }

    /// Window resolved by the most recent tick.
    #[must_use]
    pub fn current_window(&self) -> Option<SessionWindow> {
        self.resolver.current_window(&self.account)
    }

    /// Whether the most recent tick decided the session is active.
    #[must_use]
    pub fn should_be_open(&self) -> bool {
        self.should_be_open.load(Ordering::Acquire)
    }

    /// Request the loop to stop. Observed within one poll interval.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run until stopped, then close the connection.
    pub async fn run(&self) {
        tracing::info!(
            account = %self.account,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            timezone = %self.settings.timezone,
            "Session supervisor started"
        );

        while !self.cancel.is_cancelled() {
            let action = self.tick().await;
            tracing::trace!(action = ?action, "Supervisor tick complete");

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        self.manager.close().await;
        self.should_be_open.store(false, Ordering::Release);
        metrics::set_session_open(false);
        tracing::info!(account = %self.account, "Session supervisor stopped");
    }

    /// One iteration at the clock's current time.
    pub async fn tick(&self) -> SupervisorAction {
        self.tick_at(self.clock.now()).await
    }

    /// One iteration at `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> SupervisorAction {
        let local = now.with_timezone(&self.settings.timezone);
        let window = self.resolver.resolve(&self.account, local.date_naive()).await;
        let should_be_open = window.contains(local.time());

        let was_open = self.should_be_open.swap(should_be_open, Ordering::AcqRel);
        if was_open != should_be_open {
            tracing::info!(
                account = %self.account,
                should_be_open,
                local_time = %local.format("%Y-%m-%d %H:%M:%S %Z"),
                "Session intent changed"
            );
        }
        metrics::set_session_open(should_be_open);

        let state = self.manager.current_state();
        match (should_be_open, state) {
            (true, ConnectionState::Closed) => self.open().await,
            (true, ConnectionState::Reauthenticating) => self.reauthenticate().await,
            (false, state) if state.is_active() => {
                tracing::info!(account = %self.account, state = %state, "Session inactive, closing connection");
                self.manager.close().await;
                SupervisorAction::Closed
            }
            _ => SupervisorAction::Idle,
        }
    }

    async fn open(&self) -> SupervisorAction {
        let credential = match self.authenticator.current_credential(&self.account).await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(account = %self.account, error = %e, "No credential available, will retry");
                return SupervisorAction::OpenFailed;
            }
        };

        match self.manager.open(&credential).await {
            Ok(handle) => SupervisorAction::Opened(handle.id()),
            Err(e) => {
                tracing::warn!(account = %self.account, error = %e, "Open failed, will retry");
                SupervisorAction::OpenFailed
            }
        }
    }

    async fn reauthenticate(&self) -> SupervisorAction {
        match self.manager.reauthenticate().await {
            Ok(Some(handle)) => SupervisorAction::Reauthenticated(handle.id()),
            Ok(None) => SupervisorAction::Idle,
            Err(_) => SupervisorAction::ReauthenticationFailed,
        }
    }
}
