//! Schedule Resolver
//!
//! Turns schedule store entries into a [`SessionWindow`] for an account and
//! date, caching the result for the rest of that date.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::application::ports::ScheduleStore;
use crate::domain::schedule::{AccountId, ScheduleKind, SessionWindow, resolve_window};
use crate::infrastructure::metrics;

/// Resolves and caches session windows for one schedule kind.
pub struct ScheduleResolver {
    store: Arc<dyn ScheduleStore>,
    kind: ScheduleKind,
    cache: Mutex<HashMap<(AccountId, NaiveDate), SessionWindow>>,
    latest: Mutex<HashMap<AccountId, SessionWindow>>,
}

impl ScheduleResolver {
    /// Create a resolver over `store` for `kind`.
    #[must_use]
    pub fn new(store: Arc<dyn ScheduleStore>, kind: ScheduleKind) -> Self {
        Self {
            store,
            kind,
            cache: Mutex::new(HashMap::new()),
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Schedule kind this resolver serves.
    #[must_use]
    pub const fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Resolve the window for `account` on `date`.
    ///
    /// Never fails: a store error or a schedule with no matching entry
    /// yields a closed, unresolved window. Only resolved windows are cached,
    /// so a misconfiguration is retried on the next call.
    pub async fn resolve(&self, account: &AccountId, date: NaiveDate) -> SessionWindow {
        let key = (account.clone(), date);
        if let Some(window) = self.cache.lock().get(&key).copied() {
            return window;
        }

        let window = match self.store.schedule_entries(account, self.kind).await {
            Ok(entries) => resolve_window(&entries, account, date),
            Err(e) => {
                tracing::warn!(
                    account = %account,
                    kind = self.kind.as_str(),
                    error = %e,
                    "Schedule store query failed, failing closed"
                );
                SessionWindow::unresolved()
            }
        };

        if window.is_resolved() {
            let mut cache = self.cache.lock();
            cache.retain(|(_, cached_date), _| *cached_date >= date);
            cache.insert(key, window);
            tracing::debug!(
                account = %account,
                %date,
                is_open = window.is_open,
                start = ?window.start,
                end = ?window.end,
                source = ?window.source,
                "Session window resolved"
            );
        } else {
            metrics::record_schedule_miss(self.kind.as_str());
            tracing::warn!(
                account = %account,
                %date,
                kind = self.kind.as_str(),
                "No schedule entry at any fallback level, session treated as closed"
            );
        }

        self.latest.lock().insert(account.clone(), window);
        window
    }

    /// Most recently resolved window for `account`.
    #[must_use]
    pub fn current_window(&self, account: &AccountId) -> Option<SessionWindow> {
        self.latest.lock().get(account).copied()
    }

    /// Number of cached `(account, date)` windows.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
