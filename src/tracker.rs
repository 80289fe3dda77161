//! Best known editions per versioned key.

use std::collections::BTreeMap;

use tracing::trace;

use crate::key::{Edition, VersionedKey};

/// Result of [`EditionTracker::advance_known_good`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KnownGoodUpdate {
    /// Whether the known good edition moved forward.
    pub changed: bool,
    /// Whether the latest slot moved forward as well.
    pub slot_advanced: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct TrackerEntry {
    /// Highest edition observed to plausibly exist.
    slot: Option<Edition>,
    /// Highest edition whose content was fetched successfully.
    ///
    /// Never ahead of `slot`.
    known_good: Option<Edition>,
}

/// Tracks the latest slot and the latest known good edition of every key we touched.
///
/// Entries are created lazily and never removed. Both values only ever move forward.
#[derive(Debug, Default)]
pub(crate) struct EditionTracker {
    entries: BTreeMap<VersionedKey, TrackerEntry>,
}

impl EditionTracker {
    pub fn lookup_known_good(&self, key: &VersionedKey) -> Option<Edition> {
        self.entries.get(key).and_then(|e| e.known_good)
    }

    pub fn lookup_slot(&self, key: &VersionedKey) -> Option<Edition> {
        self.entries.get(key).and_then(|e| e.slot)
    }

    /// Records that the content of `edition` was fetched.
    ///
    /// The slot is moved along if it lags behind. Older or equal editions are ignored.
    pub fn advance_known_good(&mut self, key: &VersionedKey, edition: Edition) -> KnownGoodUpdate {
        let entry = self.entries.entry(key.clone()).or_default();
        if entry.known_good >= Some(edition) {
            trace!(%key, edition, known_good = ?entry.known_good, "known good not advanced");
            return KnownGoodUpdate::default();
        }
        entry.known_good = Some(edition);
        let slot_advanced = entry.slot < Some(edition);
        if slot_advanced {
            entry.slot = Some(edition);
        }
        KnownGoodUpdate {
            changed: true,
            slot_advanced,
        }
    }

    /// Records that a block for `edition` exists. Returns whether the slot moved forward.
    pub fn advance_slot(&mut self, key: &VersionedKey, edition: Edition) -> bool {
        let entry = self.entries.entry(key.clone()).or_default();
        if entry.slot >= Some(edition) {
            trace!(%key, edition, slot = ?entry.slot, "slot not advanced");
            return false;
        }
        entry.slot = Some(edition);
        true
    }

    /// Returns the first edition a poller should look at: one past everything we know of.
    pub fn next_unknown(&self, key: &VersionedKey) -> Edition {
        match self.entries.get(key) {
            Some(TrackerEntry {
                slot: Some(slot), ..
            }) => slot.saturating_add(1),
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
