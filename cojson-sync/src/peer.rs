//! Per-peer sync state
//!
//! Tracks what each peer is known to hold (updated on every send and on
//! each received KNOWN/CONTENT), diffs known states to decide between
//! CONTENT and LOAD, buffers messages waiting on missing dependencies,
//! and bounds the outbound queue with KNOWN coalescing.

use crate::message::SyncMessage;
use cojson_core::{KnownState, SessionNewContent};
use cojson_model::{CoId, SessionId};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Default cap on transactions per CONTENT fragment.
pub const MAX_TXS_PER_CONTENT: usize = 100;

/// Default outbound queue high-water mark.
pub const OUTBOUND_HIGH_WATER: usize = 64;

/// What a known-state comparison tells us to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KnownDiff {
    /// Sessions where we hold more: their current count, the base for
    /// the CONTENT delta.
    pub they_need: BTreeMap<SessionId, u32>,
    /// Sessions where the peer holds more: our current count, the base
    /// for a LOAD request.
    pub we_need: BTreeMap<SessionId, u32>,
    /// The peer has not seen the header.
    pub they_need_header: bool,
}

impl KnownDiff {
    pub fn is_settled(&self) -> bool {
        self.they_need.is_empty() && self.we_need.is_empty() && !self.they_need_header
    }
}

/// Compare our state against a peer's advertised state.
pub fn diff_known(ours: &KnownState, theirs: &KnownState) -> KnownDiff {
    let mut diff = KnownDiff {
        they_need_header: !theirs.header,
        ..KnownDiff::default()
    };

    for (session, &our_count) in &ours.sessions {
        let their_count = theirs.sessions.get(session).copied().unwrap_or(0);
        if our_count > their_count {
            diff.they_need.insert(*session, their_count);
        }
    }
    for (session, &their_count) in &theirs.sessions {
        let our_count = ours.sessions.get(session).copied().unwrap_or(0);
        if their_count > our_count {
            diff.we_need.insert(*session, our_count);
        }
    }
    diff
}

/// The engine's picture of one peer: advertised/sent knowledge per
/// CoValue. Pessimistically reset on acknowledgement timeout.
#[derive(Debug, Default)]
pub struct PeerState {
    known: HashMap<CoId, KnownState>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tracked state for a CoValue, if any.
    pub fn known(&self, id: &CoId) -> Option<&KnownState> {
        self.known.get(id)
    }

    pub fn knows_header(&self, id: &CoId) -> bool {
        self.known.get(id).is_some_and(|k| k.header)
    }

    /// Merge a received KNOWN (or the known-view implied by a LOAD)
    /// into the tracked state.
    pub fn record_known(&mut self, id: &CoId, header: bool, sessions: &BTreeMap<SessionId, u32>) {
        let entry = self.known.entry(*id).or_default();
        entry.header |= header;
        for (session, &count) in sessions {
            let tracked = entry.sessions.entry(*session).or_insert(0);
            *tracked = (*tracked).max(count);
        }
    }

    /// Account for CONTENT we sent to (or received from) this peer.
    pub fn record_content(
        &mut self,
        id: &CoId,
        header: bool,
        new: &BTreeMap<SessionId, SessionNewContent>,
    ) {
        let entry = self.known.entry(*id).or_default();
        entry.header |= header;
        for (session, content) in new {
            let end = content.after + content.transactions.len() as u32;
            let tracked = entry.sessions.entry(*session).or_insert(0);
            *tracked = (*tracked).max(end);
        }
    }

    /// Does the tracked state show the peer already has this session up
    /// to `count`? Used to decide forwarding.
    pub fn has(&self, id: &CoId, session: &SessionId, count: u32) -> bool {
        self.known
            .get(id)
            .and_then(|k| k.sessions.get(session))
            .is_some_and(|&tracked| tracked >= count)
    }

    /// Forget everything (acknowledgement timeout). The next exchange
    /// starts from a fresh KNOWN.
    pub fn reset(&mut self) {
        self.known.clear();
    }
}

/// Bounded outbound queue. Above the high-water mark, queued KNOWN
/// messages are coalesced per CoValue so only the latest survives.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<SyncMessage>,
    high_water: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(OUTBOUND_HIGH_WATER)
    }
}

impl OutboundQueue {
    pub fn new(high_water: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            high_water,
        }
    }

    pub fn push(&mut self, msg: SyncMessage) {
        self.queue.push_back(msg);
        if self.queue.len() > self.high_water {
            self.coalesce();
        }
    }

    /// Drop every queued KNOWN that a later KNOWN for the same CoValue
    /// supersedes.
    fn coalesce(&mut self) {
        let mut latest_known: HashMap<CoId, usize> = HashMap::new();
        for (i, msg) in self.queue.iter().enumerate() {
            if let SyncMessage::Known { id, .. } = msg {
                latest_known.insert(*id, i);
            }
        }
        let mut i = 0;
        self.queue.retain(|msg| {
            let keep = match msg {
                SyncMessage::Known { id, .. } => latest_known.get(id) == Some(&i),
                _ => true,
            };
            i += 1;
            keep
        });
    }

    pub fn pop(&mut self) -> Option<SyncMessage> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Messages parked until a missing dependency (header or governing
/// group) arrives. Retried when the dependency lands.
#[derive(Debug)]
pub struct DependencyBuffer<T> {
    waiting: HashMap<CoId, Vec<T>>,
}

impl<T> Default for DependencyBuffer<T> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
        }
    }
}

impl<T> DependencyBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an item until `missing` becomes available.
    pub fn park(&mut self, missing: CoId, item: T) {
        self.waiting.entry(missing).or_default().push(item);
    }

    /// Everything that was waiting on `arrived`, in arrival order.
    pub fn take_ready(&mut self, arrived: &CoId) -> Vec<T> {
        self.waiting.remove(arrived).unwrap_or_default()
    }

    /// Dependencies still outstanding.
    pub fn pending(&self) -> impl Iterator<Item = &CoId> {
        self.waiting.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
