//! Immediate/Scheduled partition of server entries awaiting a query.
//!
//! Every known server lives in exactly one of the two deques. The synthetic
//! discovery entry travels between them like a server and triggers a
//! registry refresh whenever the scan reaches it.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::core::job::ServerAddress;

/// What a timeline entry stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryTarget {
    /// Re-enumerate live servers.
    Discovery,
    /// Query one queue server.
    Server(ServerAddress),
}

impl EntryTarget {
    /// Server address, unless this is the discovery sentinel.
    #[must_use]
    pub const fn server(&self) -> Option<&ServerAddress> {
        match self {
            Self::Discovery => None,
            Self::Server(addr) => Some(addr),
        }
    }
}

/// One slot of the polling timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Server or discovery sentinel.
    pub target: EntryTarget,
    /// When the entry is due again; meaningful while scheduled.
    pub deadline: Instant,
    /// Whether the last empty answer covered every affinity we could ask for.
    pub all_affinities_checked: bool,
}

impl TimelineEntry {
    fn new(target: EntryTarget) -> Self {
        Self {
            target,
            deadline: Instant::now(),
            all_affinities_checked: true,
        }
    }
}

/// Rotating schedule of servers to query.
#[derive(Debug, Clone)]
pub struct Timeline {
    immediate: VecDeque<TimelineEntry>,
    scheduled: VecDeque<TimelineEntry>,
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Timeline {
    /// A fresh timeline: only the discovery entry, due immediately.
    #[must_use]
    pub fn new() -> Self {
        let mut immediate = VecDeque::new();
        immediate.push_back(TimelineEntry::new(EntryTarget::Discovery));
        Self {
            immediate,
            scheduled: VecDeque::new(),
        }
    }

    /// Entries due now, in scan order.
    pub fn immediate(&self) -> impl ExactSizeIterator<Item = &TimelineEntry> {
        self.immediate.iter()
    }

    /// Deferred entries, earliest deadline first.
    pub fn scheduled(&self) -> impl ExactSizeIterator<Item = &TimelineEntry> {
        self.scheduled.iter()
    }

    /// Entry at `index` in the immediate list.
    #[must_use]
    pub fn immediate_at(&self, index: usize) -> Option<&TimelineEntry> {
        self.immediate.get(index)
    }

    /// Position of `target` in the immediate list.
    #[must_use]
    pub fn position_in_immediate(&self, target: &EntryTarget) -> Option<usize> {
        self.immediate.iter().position(|e| &e.target == target)
    }

    /// Whether `target` is present in either list.
    #[must_use]
    pub fn contains(&self, target: &EntryTarget) -> bool {
        self.immediate.iter().any(|e| &e.target == target)
            || self.scheduled.iter().any(|e| &e.target == target)
    }

    /// Total number of entries, discovery included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.immediate.len() + self.scheduled.len()
    }

    /// Whether both lists are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.scheduled.is_empty()
    }

    /// Earliest scheduled entry.
    #[must_use]
    pub fn earliest_scheduled(&self) -> Option<&TimelineEntry> {
        self.scheduled.front()
    }

    /// Make `target` due now. A scheduled entry moves to the tail of the
    /// immediate list, an unknown server is appended, an entry that is
    /// already immediate stays where it is.
    pub fn move_to_immediate(&mut self, target: &EntryTarget) {
        if let Some(index) = self.scheduled.iter().position(|e| &e.target == target) {
            if let Some(entry) = self.scheduled.remove(index) {
                self.immediate.push_back(entry);
            }
            return;
        }
        if self.position_in_immediate(target).is_none() {
            self.immediate.push_back(TimelineEntry::new(target.clone()));
        }
    }

    /// Defer the immediate entry at `index` until `deadline`.
    pub fn move_to_scheduled(&mut self, index: usize, deadline: Instant, all_affinities_checked: bool) {
        if let Some(mut entry) = self.immediate.remove(index) {
            entry.deadline = deadline;
            entry.all_affinities_checked = all_affinities_checked;
            self.insert_scheduled(entry);
        }
    }

    /// Move the immediate entry at `index` to the front of the immediate list.
    pub fn move_to_front(&mut self, index: usize) {
        if index == 0 {
            return;
        }
        if let Some(entry) = self.immediate.remove(index) {
            self.immediate.push_front(entry);
        }
    }

    /// Drop the immediate entry at `index`.
    pub fn remove_immediate(&mut self, index: usize) -> Option<TimelineEntry> {
        self.immediate.remove(index)
    }

    /// Move every scheduled entry whose deadline is at or before `now` to the
    /// tail of the immediate list, keeping their relative order.
    pub fn drain_expired(&mut self, now: Instant) -> usize {
        let mut moved = 0;
        while self.scheduled.front().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = self.scheduled.pop_front() {
                self.immediate.push_back(entry);
                moved += 1;
            }
        }
        moved
    }

    /// Move the earliest scheduled entry to the immediate list.
    pub fn promote_earliest_scheduled(&mut self) -> Option<EntryTarget> {
        let entry = self.scheduled.pop_front()?;
        let target = entry.target.clone();
        self.immediate.push_back(entry);
        Some(target)
    }

    /// Remove server entries that are not in `live`, from both lists.
    /// Returns the removed servers.
    pub fn reconcile(&mut self, live: &HashSet<ServerAddress>) -> Vec<ServerAddress> {
        let mut removed = reconcile_list(&mut self.immediate, live);
        removed.extend(reconcile_list(&mut self.scheduled, live));
        removed
    }

    /// Append servers not yet present to the immediate list, in the given
    /// order. Returns how many were added.
    pub fn add_discovered<I>(&mut self, servers: I) -> usize
    where
        I: IntoIterator<Item = ServerAddress>,
    {
        let mut known: HashSet<ServerAddress> = self
            .immediate
            .iter()
            .chain(self.scheduled.iter())
            .filter_map(|e| e.target.server().cloned())
            .collect();
        let mut added = 0;
        for server in servers {
            if known.insert(server.clone()) {
                self.immediate.push_back(TimelineEntry::new(EntryTarget::Server(server)));
                added += 1;
            }
        }
        added
    }

    /// Put the discovery entry into the scheduled list at `deadline`,
    /// wherever it currently is.
    pub fn reschedule_discovery(&mut self, deadline: Instant) {
        self.immediate.retain(|e| e.target != EntryTarget::Discovery);
        self.scheduled.retain(|e| e.target != EntryTarget::Discovery);
        let mut entry = TimelineEntry::new(EntryTarget::Discovery);
        entry.deadline = deadline;
        self.insert_scheduled(entry);
    }

    /// Forget every entry, discovery included.
    pub fn clear(&mut self) {
        self.immediate.clear();
        self.scheduled.clear();
    }

    /// Scheduled entries are enqueued with now + a fixed timeout, so this is
    /// an append in practice; the partition point keeps the order anyway.
    fn insert_scheduled(&mut self, entry: TimelineEntry) {
        let at = self.scheduled.partition_point(|e| e.deadline <= entry.deadline);
        self.scheduled.insert(at, entry);
    }
}

fn reconcile_list(list: &mut VecDeque<TimelineEntry>, live: &HashSet<ServerAddress>) -> Vec<ServerAddress> {
    let mut removed = Vec::new();
    list.retain(|entry| match &entry.target {
        EntryTarget::Discovery => true,
        EntryTarget::Server(addr) if live.contains(addr) => true,
        EntryTarget::Server(addr) => {
            removed.push(addr.clone());
            false
        }
    });
    removed
}
