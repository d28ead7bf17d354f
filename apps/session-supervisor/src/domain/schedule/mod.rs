//! Trading Schedule Types
//!
//! Schedule entries describe when an account's market session is open and
//! the fallback chain that turns them into a single [`SessionWindow`] for a
//! calendar date.
//!
//! # Fallback Chain
//!
//! ```text
//! ExactDate(date)  ──► account entry ──► shared entry ─┐
//!                                                      │ miss
//! Weekday(day)     ──► account entry ──► shared entry ─┤
//!                                                      │ miss
//! Global           ──► account entry ──► shared entry ─┤
//!                                                      │ miss
//! Unresolved (closed)  ◄───────────────────────────────┘
//! ```
//!
//! The first match wins. An account-specific entry always beats the shared
//! entry at the same level before the next level is consulted.

use std::collections::HashMap;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Trading account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create a new account identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Family of schedule a set of entries belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleKind {
    /// Live market session (drives the stream connection).
    #[default]
    Market,
    /// Batch/back-office window.
    Batch,
}

impl ScheduleKind {
    /// Get all schedule kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Market, Self::Batch]
    }

    /// Get the kind name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Batch => "BATCH",
        }
    }
}

// =============================================================================
// Schedule Entry
// =============================================================================

/// Which dates a schedule entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScheduleScope {
    /// A single calendar date (holiday, special session).
    ExactDate(NaiveDate),
    /// Every occurrence of a weekday.
    Weekday(Weekday),
    /// Terminal default for the schedule kind.
    Global,
}

/// A single schedule rule.
///
/// `account = None` places the entry in the shared scope that every account
/// falls back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Owning account, or `None` for the shared scope.
    #[serde(default)]
    pub account: Option<AccountId>,
    /// Schedule family.
    #[serde(default)]
    pub kind: ScheduleKind,
    /// Dates this entry applies to.
    pub scope: ScheduleScope,
    /// Session start (inclusive). `None` means start of day.
    #[serde(default)]
    pub start: Option<NaiveTime>,
    /// Session end (exclusive). `None` means end of day.
    #[serde(default)]
    pub end: Option<NaiveTime>,
    /// Whether the session is open at all.
    pub is_open: bool,
}

impl ScheduleEntry {
    /// Create an open entry with a time range.
    #[must_use]
    pub const fn open(scope: ScheduleScope, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            account: None,
            kind: ScheduleKind::Market,
            scope,
            start: Some(start),
            end: Some(end),
            is_open: true,
        }
    }

    /// Create a closed entry.
    #[must_use]
    pub const fn closed(scope: ScheduleScope) -> Self {
        Self {
            account: None,
            kind: ScheduleKind::Market,
            scope,
            start: None,
            end: None,
            is_open: false,
        }
    }

    /// Scope this entry to an account.
    #[must_use]
    pub fn for_account(mut self, account: AccountId) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the schedule kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: ScheduleKind) -> Self {
        self.kind = kind;
        self
    }

    const fn is_shared_default(&self) -> bool {
        self.account.is_none() && matches!(self.scope, ScheduleScope::Global)
    }
}

// =============================================================================
// Session Window
// =============================================================================

/// Fallback level that produced a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    /// Matched an exact-date entry.
    ExactDate,
    /// Matched a weekday entry.
    Weekday,
    /// Matched the global default.
    Global,
    /// No entry at any level; failed closed.
    Unresolved,
}

/// Resolved trading window for an account and date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionWindow {
    /// Whether the session opens at all on this date.
    pub is_open: bool,
    /// Session start (inclusive).
    pub start: Option<NaiveTime>,
    /// Session end (exclusive).
    pub end: Option<NaiveTime>,
    /// Fallback level that matched.
    pub source: WindowSource,
    /// Whether the matching entry was account-specific.
    pub account_specific: bool,
}

impl SessionWindow {
    /// Window returned when nothing matched.
    #[must_use]
    pub const fn unresolved() -> Self {
        Self {
            is_open: false,
            start: None,
            end: None,
            source: WindowSource::Unresolved,
            account_specific: false,
        }
    }

    fn from_entry(entry: &ScheduleEntry, source: WindowSource) -> Self {
        Self {
            is_open: entry.is_open,
            start: entry.start,
            end: entry.end,
            source,
            account_specific: entry.account.is_some(),
        }
    }

    /// Whether the window was produced by an actual entry.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        !matches!(self.source, WindowSource::Unresolved)
    }

    /// Whether the session is active at `time` (`start <= time < end`).
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if !self.is_open {
            return false;
        }

        let start = self.start.unwrap_or(NaiveTime::MIN);
        match self.end {
            Some(end) => start < end && start <= time && time < end,
            None => start <= time,
        }
    }
}

// =============================================================================
// Resolution
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Level {
    ExactDate,
    Weekday,
    Global,
}

impl Level {
    const ORDER: [Self; 3] = [Self::ExactDate, Self::Weekday, Self::Global];

    fn matches(self, scope: &ScheduleScope, date: NaiveDate) -> bool {
        match (self, scope) {
            (Self::ExactDate, ScheduleScope::ExactDate(d)) => *d == date,
            (Self::Weekday, ScheduleScope::Weekday(w)) => *w == date.weekday(),
            (Self::Global, ScheduleScope::Global) => true,
            _ => false,
        }
    }

    const fn source(self) -> WindowSource {
        match self {
            Self::ExactDate => WindowSource::ExactDate,
            Self::Weekday => WindowSource::Weekday,
            Self::Global => WindowSource::Global,
        }
    }
}

/// Resolve the session window for `account` on `date` from `entries`.
///
/// Entries owned by other accounts are ignored. Returns
/// [`SessionWindow::unresolved`] when no level matches.
#[must_use]
pub fn resolve_window(
    entries: &[ScheduleEntry],
    account: &AccountId,
    date: NaiveDate,
) -> SessionWindow {
    for level in Level::ORDER {
        let candidates = entries.iter().filter(|e| level.matches(&e.scope, date));

        let mut shared = None;
        for entry in candidates {
            match &entry.account {
                Some(owner) if owner == account => {
                    return SessionWindow::from_entry(entry, level.source());
                }
                None if shared.is_none() => shared = Some(entry),
                _ => {}
            }
        }

        if let Some(entry) = shared {
            return SessionWindow::from_entry(entry, level.source());
        }
    }

    SessionWindow::unresolved()
}

// =============================================================================
// Validation
// =============================================================================

/// Schedule document errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// A schedule kind has no shared global default.
    #[error("schedule kind {0} has no shared global default")]
    MissingDefault(&'static str),

    /// A schedule kind has more than one shared global default.
    #[error("schedule kind {kind} has {count} shared global defaults, expected one")]
    DuplicateDefault {
        /// Schedule kind name.
        kind: &'static str,
        /// Number of defaults found.
        count: usize,
    },
}

/// Check that every kind used by `entries` has exactly one shared default.
///
/// # Errors
///
/// Returns the first kind that is missing a default or has duplicates.
pub fn validate_entries(entries: &[ScheduleEntry]) -> Result<(), ScheduleError> {
    let mut defaults: HashMap<ScheduleKind, usize> = HashMap::new();
    for entry in entries {
        let count = defaults.entry(entry.kind).or_insert(0);
        if entry.is_shared_default() {
            *count += 1;
        }
    }

    for kind in ScheduleKind::all() {
        match defaults.get(kind) {
            None | Some(1) => {}
            Some(0) => return Err(ScheduleError::MissingDefault(kind.as_str())),
            Some(&count) => {
                return Err(ScheduleError::DuplicateDefault {
                    kind: kind.as_str(),
                    count,
                });
            }
        }
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
