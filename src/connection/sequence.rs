// src/connection/sequence.rs
use std::collections::BTreeMap;

use log::debug;

use crate::message::Message;

/// Tracks the server-assigned ordering counter for one connection session
/// and gates delivery so consumers see each sequence number at most once,
/// in increasing order.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    /// Start a tracker from the sequence carried by the session's first
    /// frame (always 0 on the wire).
    pub fn starting_at(sequence_number: u64) -> Self {
        Self {
            last: Some(sequence_number),
        }
    }

    pub fn last_sequence_number(&self) -> Option<u64> {
        self.last
    }

    /// Delivery gate: returns true when the message should reach consumers
    /// and advances the counter. Replays and regressions are dropped.
    pub fn admit(&mut self, sequence_number: u64) -> bool {
        match self.last {
            Some(last) if sequence_number <= last => {
                debug!(
                    "Dropping replayed sequence {} (last delivered {})",
                    sequence_number, last
                );
                false
            }
            _ => {
                self.last = Some(sequence_number);
                true
            }
        }
    }
}

/// One successful establishment of the transport, identified by the
/// server-issued connection id. The session survives transient reconnects
/// (the id is re-keyed, the counter is kept) and is cleared only by an
/// explicit disconnect.
#[derive(Debug)]
pub struct ConnectionSession {
    pub connection_id: String,
    pub tracker: SequenceTracker,
}

impl ConnectionSession {
    pub fn new(connection_id: String, first_sequence: u64) -> Self {
        Self {
            connection_id,
            tracker: SequenceTracker::starting_at(first_sequence),
        }
    }
}

/// Buffer for messages that arrive between physical reconnection and
/// completed gap recovery. It never dispatches directly; the manager drains
/// it exactly once through [`merge_replay`] and drops it, whether or not
/// the fetch succeeded.
#[derive(Debug, Default)]
pub struct ReplayWindow {
    buffered: Vec<Message>,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        debug!(
            "Buffering {} message #{} during gap recovery",
            message.kind, message.sequence_number
        );
        self.buffered.push(message);
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.buffered
    }
}

/// Union a fetched batch with the replay-window contents, deduplicated by
/// sequence number and sorted ascending. Buffered copies win ties; the
/// server guarantees a reused sequence number carries an identical payload,
/// so the tie-break is immaterial.
pub fn merge_replay(fetched: Vec<Message>, buffered: Vec<Message>) -> Vec<Message> {
    let mut by_sequence: BTreeMap<u64, Message> = BTreeMap::new();
    for message in buffered.into_iter().chain(fetched) {
        by_sequence.entry(message.sequence_number).or_insert(message);
    }
    by_sequence.into_values().collect()
}
