//! Subscription Registry
//!
//! Tracks the instruments of interest for a supervised stream and the mode
//! each one should be subscribed in. The registry is the single source of
//! truth that is replayed onto every new connection.
//!
//! # Design
//!
//! - One lock guards the whole set; every operation is mutually exclusive.
//! - [`SubscriptionRegistry::snapshot`] returns an owned copy so callers can
//!   iterate it (and perform network I/O) without holding the lock.
//! - Mutations return [`SubscriptionChanges`] describing what actually
//!   changed, so callers can decide whether a live push is needed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Streaming instrument identifier (exchange instrument token).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct InstrumentId(u32);

impl InstrumentId {
    /// Create a new instrument identifier.
    #[must_use]
    pub const fn new(token: u32) -> Self {
        Self(token)
    }

    /// Get the raw token value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstrumentId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// How much data to stream for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    /// Last traded price only.
    Ltp,
    /// Quote without market depth.
    Quote,
    /// Quote with market depth.
    #[default]
    Full,
}

impl SubscriptionMode {
    /// Get all subscription modes.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ltp, Self::Quote, Self::Full]
    }

    /// Parse mode from string, defaulting to `Full`.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ltp" => Self::Ltp,
            "quote" => Self::Quote,
            _ => Self::Full,
        }
    }

    /// Get the mode name used on the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }
}

/// Owned copy of the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: BTreeMap<InstrumentId, SubscriptionMode>,
}

impl SubscriptionSet {
    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check whether an instrument is present.
    #[must_use]
    pub fn contains(&self, id: InstrumentId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Mode for an instrument, if present.
    #[must_use]
    pub fn mode_of(&self, id: InstrumentId) -> Option<SubscriptionMode> {
        self.entries.get(&id).copied()
    }

    /// All instrument ids in ascending order.
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.entries.keys().copied().collect()
    }

    /// Instruments grouped by mode, skipping empty groups.
    #[must_use]
    pub fn by_mode(&self) -> Vec<(SubscriptionMode, Vec<InstrumentId>)> {
        SubscriptionMode::all()
            .iter()
            .filter_map(|mode| {
                let ids: Vec<_> = self
                    .entries
                    .iter()
                    .filter(|(_, m)| *m == mode)
                    .map(|(id, _)| *id)
                    .collect();
                (!ids.is_empty()).then_some((*mode, ids))
            })
            .collect()
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Effective changes produced by a registry mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Instruments newly added or whose mode changed.
    pub subscribe: BTreeSet<InstrumentId>,
    /// Instruments removed.
    pub unsubscribe: BTreeSet<InstrumentId>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe set of instruments of interest.
///
/// # Example
///
/// ```rust
/// use session_supervisor::domain::subscription::{
///     InstrumentId, SubscriptionMode, SubscriptionRegistry,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let nifty = InstrumentId::new(256_265);
///
/// let changes = registry.add([nifty], SubscriptionMode::Full);
/// assert!(changes.subscribe.contains(&nifty));
///
/// // Adding again in the same mode is not a change
/// assert!(registry.add([nifty], SubscriptionMode::Full).is_empty());
///
/// let snapshot = registry.snapshot();
/// registry.remove([nifty]);
/// assert!(snapshot.contains(nifty));
/// assert!(registry.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeMap<InstrumentId, SubscriptionMode>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add instruments in `mode`.
    ///
    /// Returns the instruments that were new or changed mode.
    pub fn add(
        &self,
        ids: impl IntoIterator<Item = InstrumentId>,
        mode: SubscriptionMode,
    ) -> SubscriptionChanges {
        let mut entries = self.entries.write();
        let mut changes = SubscriptionChanges::default();

        for id in ids {
            if entries.insert(id, mode) != Some(mode) {
                changes.subscribe.insert(id);
            }
        }

        changes
    }

    /// Remove instruments.
    ///
    /// Returns the instruments that were actually present.
    pub fn remove(&self, ids: impl IntoIterator<Item = InstrumentId>) -> SubscriptionChanges {
        let mut entries = self.entries.write();
        let mut changes = SubscriptionChanges::default();

        for id in ids {
            if entries.remove(&id).is_some() {
                changes.unsubscribe.insert(id);
            }
        }

        changes
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionSet {
        SubscriptionSet {
            entries: self.entries.read().clone(),
        }
    }

    /// Check whether an instrument is registered.
    #[must_use]
    pub fn contains(&self, id: InstrumentId) -> bool {
        self.entries.read().contains_key(&id)
    }

    /// Mode an instrument is registered in.
    #[must_use]
    pub fn mode_of(&self, id: InstrumentId) -> Option<SubscriptionMode> {
        self.entries.read().get(&id).copied()
    }

    /// Number of registered instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ids(raw: &[u32]) -> Vec<InstrumentId> {
        raw.iter().copied().map(InstrumentId::new).collect()
    }

    #[test]
    fn add_reports_new_instruments() {
        let registry = SubscriptionRegistry::new();

        let changes = registry.add(ids(&[1, 2]), SubscriptionMode::Quote);

        assert_eq!(changes.subscribe.len(), 2);
        assert!(changes.unsubscribe.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn re_add_same_mode_is_not_a_change() {
        let registry = SubscriptionRegistry::new();
        registry.add(ids(&[1]), SubscriptionMode::Full);

        let changes = registry.add(ids(&[1]), SubscriptionMode::Full);

        assert!(changes.is_empty());
    }

    #[test]
    fn mode_change_is_reported() {
        let registry = SubscriptionRegistry::new();
        registry.add(ids(&[1]), SubscriptionMode::Ltp);

        let changes = registry.add(ids(&[1]), SubscriptionMode::Full);

        assert!(changes.subscribe.contains(&InstrumentId::new(1)));
        assert_eq!(
            registry.snapshot().mode_of(InstrumentId::new(1)),
            Some(SubscriptionMode::Full)
        );
        assert_eq!(
            registry.mode_of(InstrumentId::new(1)),
            Some(SubscriptionMode::Full)
        );
    }

    #[test]
    fn remove_reports_only_present_instruments() {
        let registry = SubscriptionRegistry::new();
        registry.add(ids(&[1, 2]), SubscriptionMode::Full);

        let changes = registry.remove(ids(&[2, 3]));

        assert_eq!(changes.unsubscribe.len(), 1);
        assert!(changes.unsubscribe.contains(&InstrumentId::new(2)));
        assert!(registry.contains(InstrumentId::new(1)));
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let registry = SubscriptionRegistry::new();
        registry.add(ids(&[1]), SubscriptionMode::Full);

        let snapshot = registry.snapshot();
        registry.add(ids(&[2]), SubscriptionMode::Full);
        registry.remove(ids(&[1]));

        assert_eq!(snapshot.instruments(), ids(&[1]));
        assert_eq!(registry.snapshot().instruments(), ids(&[2]));
    }

    #[test]
    fn by_mode_groups_and_skips_empty() {
        let registry = SubscriptionRegistry::new();
        registry.add(ids(&[3, 1]), SubscriptionMode::Full);
        registry.add(ids(&[2]), SubscriptionMode::Ltp);

        let groups = registry.snapshot().by_mode();

        assert_eq!(
            groups,
            vec![
                (SubscriptionMode::Ltp, ids(&[2])),
                (SubscriptionMode::Full, ids(&[1, 3])),
            ]
        );
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.add([InstrumentId::new(worker * 1000 + i)], SubscriptionMode::Full);
                        let _ = registry.snapshot().len();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 800);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(
            SubscriptionMode::from_str_case_insensitive("LTP"),
            SubscriptionMode::Ltp
        );
        assert_eq!(
            SubscriptionMode::from_str_case_insensitive("quote"),
            SubscriptionMode::Quote
        );
        assert_eq!(
            SubscriptionMode::from_str_case_insensitive("unknown"),
            SubscriptionMode::Full
        );
    }

    #[test]
    fn instrument_id_parsing() {
        assert_eq!(" 408065 ".parse::<InstrumentId>(), Ok(InstrumentId::new(408_065)));
        assert!("abc".parse::<InstrumentId>().is_err());
    }
}
