use crate::error::Error;
use crate::protocol::messages::EntryMessage;
use crate::protocol::{FrameTag, RawFrame};
use std::collections::VecDeque;

/// Extra slots reserved beyond the replayed prefix, so short invocations
/// never reallocate.
const CAPACITY_HINT: usize = 8;

/// Metadata for one journal slot. The recorded payload itself lives on the
/// wire (replay queue) or has already been emitted; entries only track what
/// the machine needs for ordering, matching and diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) ty: FrameTag,
    pub(crate) name: String,
    pub(crate) completed: bool,
}

impl Entry {
    pub(crate) fn new(ty: FrameTag, name: String, completed: bool) -> Self {
        Self {
            ty,
            name,
            completed,
        }
    }
}

/// Append-only ordered record of the effects this invocation performed,
/// with the not-yet-consumed replay prefix buffered as raw frames.
pub(crate) struct Journal {
    entries: Vec<Entry>,
    replay: VecDeque<RawFrame>,
    known_entries: u32,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            replay: VecDeque::new(),
            known_entries: 0,
        }
    }
}

impl Journal {
    pub(crate) fn initialize(&mut self, known_entries: u32) {
        self.known_entries = known_entries;
        self.entries
            .reserve(known_entries as usize + CAPACITY_HINT);
        self.replay.reserve(known_entries as usize);
    }

    /// Buffer one replayed entry frame. Returns the number of frames still
    /// missing before replay can start.
    pub(crate) fn push_replay_frame(&mut self, frame: RawFrame) -> u32 {
        self.replay.push_back(frame);
        self.known_entries
            .saturating_sub(self.replay.len() as u32)
    }

    /// The cursor: index the next consumed or appended entry will get.
    pub(crate) fn next_index(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Index of the last recorded entry, `-1` before the input was consumed.
    pub(crate) fn last_index(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.next_index() < self.known_entries
    }

    pub(crate) fn get(&self, index: u32) -> Option<&Entry> {
        self.entries.get(index as usize)
    }

    /// True when the next buffered replay frame decodes to `M` and matches
    /// `expected`'s identity fields. Used by the eager-state path to decide
    /// whether the previous execution journaled this read at all.
    pub(crate) fn peek_replay_matches<M: EntryMessage>(&self, expected: &M) -> bool {
        let Some(frame) = self.replay.front() else {
            return false;
        };
        if frame.tag() != Ok(M::TAG) {
            return false;
        }
        frame
            .clone()
            .decode_to::<M>(self.next_index() as i64)
            .is_ok_and(|decoded| decoded.replay_eq(expected))
    }

    /// Consume the next replayed entry, which must decode to `M` and agree
    /// with `expected` on its identity fields.
    pub(crate) fn pop_replay<M: EntryMessage>(&mut self, expected: &M) -> Result<(u32, M), Error> {
        let index = self.next_index();
        let frame = self
            .replay
            .pop_front()
            .ok_or_else(|| Error::replay_exhausted(M::TAG))?;
        let decoded = frame.decode_to::<M>(index as i64).map_err(Error::from)?;
        if !decoded.replay_eq(expected) {
            return Err(Error::journal_mismatch(
                index as i64,
                M::TAG,
                &decoded.entry_name(),
                &expected.entry_name(),
            ));
        }
        self.entries
            .push(Entry::new(M::TAG, decoded.entry_name(), false));
        Ok((index, decoded))
    }

    /// Record a fresh entry. Only legal once the replay prefix is drained.
    pub(crate) fn append(&mut self, entry: Entry) -> u32 {
        debug_assert!(self.replay.is_empty());
        let index = self.next_index();
        self.entries.push(entry);
        index
    }

    pub(crate) fn mark_completed(&mut self, index: u32) {
        if let Some(entry) = self.entries.get_mut(index as usize) {
            entry.completed = true;
        }
    }
}
