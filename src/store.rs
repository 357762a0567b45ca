//! In-memory notification list shared by fetch, mark-as-read and the live feed.
//!
//! All mutation goes through three entry points: [`NotificationStore::replace_on_fetch`],
//! [`NotificationStore::patch_read`] and [`NotificationStore::prepend_insert`].
//! Fetch results are stamped with a [`FetchTicket`] so a slow response can neither
//! clobber a newer fetch nor drop entries patched in while it was in flight.

use crate::model::{MarkerLookup, NotificationView};
use std::collections::HashSet;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loading,
    Ready,
}

/// Issued by [`NotificationStore::begin_fetch`], handed back with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    id: u64,
    seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { newest_id: Option<String> },
    /// A fetch issued later has already been applied.
    Stale,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStart {
    Proceed(MarkerLookup),
    AlreadyRead,
    InFlight,
    Closed,
}

#[derive(Debug, Clone)]
enum Patch {
    Inserted(NotificationView),
    Read { id: String, marker_id: String },
}

#[derive(Debug)]
pub struct NotificationStore {
    views: Vec<NotificationView>,
    phase: Phase,
    seq: u64,
    next_ticket: u64,
    applied_ticket: Option<u64>,
    // Tickets at or below this were issued before the last reset.
    reset_cutoff: u64,
    fetches_in_flight: usize,
    // Patches made while a fetch was outstanding, replayed onto its result.
    journal: Vec<(u64, Patch)>,
    writes_in_flight: HashSet<String>,
    closed: bool,
    revision: watch::Sender<u64>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            views: Vec::new(),
            phase: Phase::Idle,
            seq: 0,
            next_ticket: 0,
            applied_ticket: None,
            reset_cutoff: 0,
            fetches_in_flight: 0,
            journal: Vec::new(),
            writes_in_flight: HashSet::new(),
            closed: false,
            revision,
        }
    }

    pub fn views(&self) -> &[NotificationView] {
        &self.views
    }

    pub fn get(&self, id: &str) -> Option<&NotificationView> {
        self.views.iter().find(|v| v.id() == id)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn unread_count(&self) -> usize {
        self.views.iter().filter(|v| !v.is_read).count()
    }

    /// Receiver that observes a new revision number after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if self.closed {
            return None;
        }
        self.next_ticket += 1;
        self.fetches_in_flight += 1;
        self.set_phase(Phase::Loading);
        Some(FetchTicket {
            id: self.next_ticket,
            seq: self.seq,
        })
    }

    /// Replace the list with a fetch result, replaying anything patched in since
    /// the ticket was issued.
    pub fn replace_on_fetch(
        &mut self,
        ticket: FetchTicket,
        mut fetched: Vec<NotificationView>,
    ) -> ApplyOutcome {
        if self.closed {
            return ApplyOutcome::Closed;
        }
        if ticket.id <= self.reset_cutoff {
            return ApplyOutcome::Stale;
        }
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);

        if self.applied_ticket.is_some_and(|applied| applied > ticket.id) {
            self.settle_fetch();
            return ApplyOutcome::Stale;
        }

        for (_, patch) in self.journal.iter().filter(|(seq, _)| *seq > ticket.seq) {
            match patch {
                Patch::Inserted(view) => {
                    if !fetched.iter().any(|v| v.id() == view.id()) {
                        fetched.insert(0, view.clone());
                    }
                }
                Patch::Read { id, marker_id } => {
                    if let Some(v) = fetched.iter_mut().find(|v| v.id() == id) {
                        v.is_read = true;
                        v.marker = MarkerLookup::Existing(marker_id.clone());
                    }
                }
            }
        }

        self.views = fetched;
        self.applied_ticket = Some(ticket.id);
        self.settle_fetch();
        self.bump();
        ApplyOutcome::Applied {
            newest_id: self.views.first().map(|v| v.id().to_string()),
        }
    }

    /// A fetch failed: keep the current list and leave the loading phase.
    pub fn abort_fetch(&mut self, ticket: FetchTicket) {
        if self.closed || ticket.id <= self.reset_cutoff {
            return;
        }
        self.fetches_in_flight = self.fetches_in_flight.saturating_sub(1);
        self.settle_fetch();
    }

    /// Signed-out state: nothing to show. Fetches still in flight are voided.
    pub fn reset(&mut self) {
        if self.closed {
            return;
        }
        self.views.clear();
        self.journal.clear();
        self.writes_in_flight.clear();
        self.applied_ticket = None;
        self.reset_cutoff = self.next_ticket;
        self.fetches_in_flight = 0;
        self.phase = Phase::Idle;
        self.bump();
    }

    /// Claim the right to write a read marker for `view`.
    ///
    /// The stored entry wins over the caller's copy, so a stale view cannot
    /// trigger a second insert for a marker that already exists.
    pub fn begin_write(&mut self, view: &NotificationView) -> WriteStart {
        if self.closed {
            return WriteStart::Closed;
        }
        let (is_read, marker) = match self.get(view.id()) {
            Some(stored) => (stored.is_read, stored.marker.clone()),
            None => (view.is_read, view.marker.clone()),
        };
        if is_read {
            return WriteStart::AlreadyRead;
        }
        if !self.writes_in_flight.insert(view.id().to_string()) {
            return WriteStart::InFlight;
        }
        WriteStart::Proceed(marker)
    }

    pub fn finish_write(&mut self, id: &str) {
        self.writes_in_flight.remove(id);
    }

    /// Flip one entry to read after the backend confirmed the marker.
    pub fn patch_read(&mut self, id: &str, marker_id: &str) -> bool {
        if self.closed {
            return false;
        }
        self.writes_in_flight.remove(id);
        let Some(view) = self.views.iter_mut().find(|v| v.id() == id) else {
            return false;
        };
        view.is_read = true;
        view.marker = MarkerLookup::Existing(marker_id.to_string());
        self.record(Patch::Read {
            id: id.to_string(),
            marker_id: marker_id.to_string(),
        });
        self.bump();
        true
    }

    /// Put a live-streamed entry at the top. Returns false for duplicates.
    pub fn prepend_insert(&mut self, view: NotificationView) -> bool {
        if self.closed || self.get(view.id()).is_some() {
            return false;
        }
        self.views.insert(0, view.clone());
        self.record(Patch::Inserted(view));
        self.bump();
        true
    }

    /// Teardown: every later mutation is discarded.
    pub fn close(&mut self) {
        self.closed = true;
        self.journal.clear();
        self.writes_in_flight.clear();
    }

    fn record(&mut self, patch: Patch) {
        if self.fetches_in_flight > 0 {
            self.journal.push((self.seq + 1, patch));
        }
    }

    fn settle_fetch(&mut self) {
        if self.fetches_in_flight == 0 {
            self.journal.clear();
            let phase = if self.applied_ticket.is_some() {
                Phase::Ready
            } else {
                Phase::Idle
            };
            self.set_phase(phase);
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.bump();
        }
    }

    fn bump(&mut self) {
        self.seq += 1;
        self.revision.send_replace(self.seq);
    }
}
