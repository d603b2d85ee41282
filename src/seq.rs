// Sequences store their events in one sorted vector; note on/off pairs
// reference each other by index. Links are valid only while the vector is
// untouched, so every mutation ends with `tidy`, which re-sorts and
// re-links in a single pass.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::midi::{self, MidiMessage, EV_NOTE_OFF, EV_NOTE_ON};
use crate::timing::{Ticks, SEQUENCE_DEFAULT_LENGTH};

pub const SEQF_REPEATED: u32 = 0x1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    tick: Ticks,
    status: u8,
    data: [u8; 2],
    marked: bool,
    selected: bool,
    link: Option<usize>,
}

impl Event {
    pub fn note_on(tick: Ticks, note: u8, velocity: u8) -> Self {
        Event {
            tick,
            status: EV_NOTE_ON,
            data: [note & 0x7F, velocity & 0x7F],
            marked: false,
            selected: false,
            link: None,
        }
    }

    pub fn note_off(tick: Ticks, note: u8, velocity: u8) -> Self {
        Event { status: EV_NOTE_OFF, ..Event::note_on(tick, note, velocity) }
    }

    pub fn tick(&self) -> Ticks {
        self.tick
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn note(&self) -> u8 {
        self.data[0]
    }

    pub fn velocity(&self) -> u8 {
        self.data[1]
    }

    pub fn is_note_on(&self) -> bool {
        self.status == EV_NOTE_ON
    }

    pub fn is_note_off(&self) -> bool {
        self.status == EV_NOTE_OFF
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    pub fn link(&self) -> Option<usize> {
        self.link
    }

    pub fn rank(&self) -> i32 {
        midi::rank(self.status)
    }

    /// Tick distance to the linked partner; 0 for dangling events.
    pub fn length_in(&self, events: &[Event]) -> Ticks {
        match self.link.and_then(|i| events.get(i)) {
            Some(partner) => (partner.tick - self.tick).max(0),
            None => 0,
        }
    }

    /// The wire form of this event on the given MIDI channel.
    pub fn to_message(&self, channel: u8) -> MidiMessage {
        MidiMessage::new(0, &[self.status | (channel & 0x0F), self.data[0], self.data[1]])
    }

    fn sort_key(&self) -> (Ticks, i32) {
        (self.tick, self.rank())
    }
}

#[derive(Debug)]
struct SeqInner {
    events: Vec<Event>,
    length: Ticks,
    flags: u32,
}

impl SeqInner {
    fn add_note(&mut self, start: Ticks, length: Ticks, note: u8, velocity: u8, selected: bool) {
        let mut on = Event::note_on(start, note, velocity);
        on.selected = selected;
        self.events.push(on);
        self.events.push(Event::note_off(start + length, note, velocity));
    }

    fn unmark_all(&mut self) {
        for ev in &mut self.events {
            ev.marked = false;
        }
    }

    fn unselect_all(&mut self) {
        for ev in &mut self.events {
            ev.selected = false;
        }
    }

    fn remove_marked(&mut self) {
        self.events.retain(|ev| !ev.marked);
    }

    fn mark_range(&mut self, start: Ticks, end: Ticks, note_low: u8, note_hi: u8) {
        for i in 0..self.events.len() {
            let ev = self.events[i];
            if ev.is_note_on()
                && ev.tick >= start
                && ev.tick < end
                && ev.note() >= note_low
                && ev.note() < note_hi
            {
                self.events[i].marked = true;
                if let Some(j) = ev.link {
                    if let Some(off) = self.events.get_mut(j) {
                        off.marked = true;
                    }
                }
            }
        }
    }

    fn select_range(&mut self, start: Ticks, end: Ticks, note_low: u8, note_hi: u8, toggle: bool) {
        for ev in &mut self.events {
            if ev.is_note_on()
                && ev.tick >= start
                && ev.tick < end
                && ev.note() >= note_low
                && ev.note() < note_hi
            {
                ev.selected = !(ev.selected && toggle);
            }
        }
    }

    /// Restores the invariants: events sorted by (tick, rank), every
    /// note-on linked to the first unconsumed note-off of the same pitch at
    /// a later or equal tick, no transient marks left behind. Unpairable
    /// events stay dangling.
    fn tidy(&mut self) {
        self.events.sort_by_key(Event::sort_key);
        for ev in &mut self.events {
            ev.link = None;
            ev.marked = false;
        }
        // the mark bit doubles as "this note-off is taken" during linking
        for i in 0..self.events.len() {
            if !self.events[i].is_note_on() {
                continue;
            }
            let note = self.events[i].note();
            for j in i + 1..self.events.len() {
                if self.events[j].is_note_off() && self.events[j].note() == note && !self.events[j].marked {
                    self.events[i].link = Some(j);
                    self.events[j].link = Some(i);
                    self.events[j].marked = true;
                    break;
                }
            }
        }
        self.unmark_all();
    }
}

/// A single linear sequence of MIDI events with a length in ticks. All
/// public operations lock the internal mutex; the audio thread only ever
/// holds it through the scoped read handle.
#[derive(Debug)]
pub struct Sequence {
    inner: Mutex<SeqInner>,
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence {
            inner: Mutex::new(SeqInner {
                events: Vec::new(),
                length: SEQUENCE_DEFAULT_LENGTH,
                flags: SEQF_REPEATED,
            }),
        }
    }
}

impl Sequence {
    fn lock(&self) -> MutexGuard<'_, SeqInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_note(&self, start: Ticks, length: Ticks, note: u8, velocity: u8) {
        let mut inner = self.lock();
        inner.add_note(start, length, note, velocity, false);
        inner.tidy();
    }

    /// Marks note-ons (and their linked note-offs) inside the window. Marks
    /// accumulate; callers wanting a fresh query unmark first.
    pub fn mark_range(&self, start: Ticks, end: Ticks, note_low: u8, note_hi: u8) {
        self.lock().mark_range(start, end, note_low, note_hi);
    }

    pub fn select_range(&self, start: Ticks, end: Ticks, note_low: u8, note_hi: u8, toggle: bool) {
        self.lock().select_range(start, end, note_low, note_hi, toggle);
    }

    pub fn unmark_all(&self) {
        self.lock().unmark_all();
    }

    pub fn unselect_all(&self) {
        self.lock().unselect_all();
    }

    pub fn remove_marked(&self) {
        let mut inner = self.lock();
        inner.remove_marked();
        inner.tidy();
    }

    /// Replaces each marked note with one of the given length, keeping
    /// pitch, velocity and selection.
    pub fn set_note_lengths(&self, length: Ticks) {
        let mut inner = self.lock();
        let count = inner.events.len();
        for i in 0..count {
            let ev = inner.events[i];
            if ev.marked && ev.is_note_on() {
                inner.add_note(ev.tick, length, ev.note(), ev.velocity(), ev.selected);
            }
        }
        inner.remove_marked();
        inner.tidy();
    }

    /// Sets velocity on marked note-ons and clears their marks.
    pub fn set_note_velocities(&self, velocity: u8) {
        let mut inner = self.lock();
        for i in 0..inner.events.len() {
            let ev = inner.events[i];
            if ev.marked && ev.is_note_on() {
                inner.events[i].data[1] = velocity & 0x7F;
                inner.events[i].marked = false;
                if let Some(j) = ev.link {
                    if let Some(off) = inner.events.get_mut(j) {
                        off.marked = false;
                    }
                }
            }
        }
    }

    /// Shortens the sequence. Notes starting at or past the new end are
    /// dropped, note-offs crossing it are clipped to end exactly there.
    pub fn set_length(&self, length: Ticks) {
        let mut inner = self.lock();
        let old = inner.length;
        inner.length = length;
        if old <= length {
            return;
        }
        let count = inner.events.len();
        for i in 0..count {
            let ev = inner.events[i];
            if ev.is_note_on() && ev.tick >= length {
                inner.events[i].marked = true;
                if let Some(j) = ev.link {
                    if let Some(off) = inner.events.get_mut(j) {
                        off.marked = true;
                    }
                }
            }
        }
        for i in 0..count {
            let ev = inner.events[i];
            if ev.is_note_on() && !inner.events[i].marked {
                if let Some(j) = ev.link {
                    if inner.events[j].tick > length {
                        inner.events[j].tick = length;
                    }
                }
            }
        }
        for ev in &mut inner.events {
            if !ev.marked && (ev.tick > length || (ev.tick >= length && !ev.is_note_off())) {
                ev.marked = true;
            }
        }
        inner.remove_marked();
        inner.tidy();
    }

    /// Applies `mover(tick, note) -> (tick, note)` to every selected
    /// note-on, preserving length, velocity and selection.
    pub fn move_selected_notes<F>(&self, mover: F)
    where
        F: Fn(Ticks, u8) -> (Ticks, u8),
    {
        let mut inner = self.lock();
        let count = inner.events.len();
        for i in 0..count {
            let ev = inner.events[i];
            if !ev.is_note_on() || !ev.selected {
                continue;
            }
            let length = ev.length_in(&inner.events);
            let (tick, note) = mover(ev.tick, ev.note());
            inner.events[i].marked = true;
            if let Some(j) = ev.link {
                if let Some(off) = inner.events.get_mut(j) {
                    off.marked = true;
                }
            }
            inner.add_note(tick.max(0), length, note & 0x7F, ev.velocity(), true);
        }
        inner.remove_marked();
        inner.tidy();
    }

    /// Mean velocity over marked note-ons, which it unmarks. Falls back to
    /// the default velocity when nothing is marked.
    pub fn get_average_velocity(&self) -> u8 {
        let mut inner = self.lock();
        let mut sum: u32 = 0;
        let mut count: u32 = 0;
        for i in 0..inner.events.len() {
            let ev = inner.events[i];
            if ev.marked && ev.is_note_on() {
                sum += ev.velocity() as u32;
                count += 1;
                inner.events[i].marked = false;
                if let Some(j) = ev.link {
                    if let Some(off) = inner.events.get_mut(j) {
                        off.marked = false;
                    }
                }
            }
        }
        if count == 0 {
            crate::timing::DEFAULT_VELOCITY
        } else {
            (sum / count) as u8
        }
    }

    pub fn selected_count(&self) -> usize {
        self.lock().events.iter().filter(|ev| ev.is_note_on() && ev.selected).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn get_length(&self) -> Ticks {
        self.lock().length
    }

    pub fn get_flags(&self) -> u32 {
        self.lock().flags
    }

    pub fn set_flags(&self, flags: u32) {
        self.lock().flags = flags;
    }

    pub fn is_repeated(&self) -> bool {
        self.get_flags() & SEQF_REPEATED != 0
    }

    /// Scoped read access. Holds the mutex until dropped; the audio thread
    /// keeps one only for the duration of a single process window.
    pub fn handle(&self) -> SeqHandle<'_> {
        SeqHandle { guard: self.lock() }
    }
}

pub struct SeqHandle<'a> {
    guard: MutexGuard<'a, SeqInner>,
}

impl SeqHandle<'_> {
    pub fn events(&self) -> &[Event] {
        &self.guard.events
    }

    pub fn length(&self) -> Ticks {
        self.guard.length
    }

    pub fn flags(&self) -> u32 {
        self.guard.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::{DEFAULT_VELOCITY, PPQN};

    fn sorted_by_key(seq: &Sequence) -> bool {
        let handle = seq.handle();
        handle.events().windows(2).all(|w| w[0].sort_key() <= w[1].sort_key())
    }

    fn no_marks(seq: &Sequence) -> bool {
        let handle = seq.handle();
        handle.events().iter().all(|ev| !ev.is_marked())
    }

    #[test]
    fn add_note_links_a_pair() {
        let seq = Sequence::default();
        seq.add_note(PPQN, PPQN, 60, 100);
        let handle = seq.handle();
        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_note_on());
        assert_eq!(events[0].tick(), PPQN);
        assert!(events[1].is_note_off());
        assert_eq!(events[1].tick(), 2 * PPQN);
        assert_eq!(events[0].link(), Some(1));
        assert_eq!(events[1].link(), Some(0));
        assert_eq!(events[0].length_in(events), PPQN);
    }

    #[test]
    fn events_stay_ordered_and_unmarked() {
        let seq = Sequence::default();
        seq.add_note(3 * PPQN, PPQN, 62, 80);
        seq.add_note(0, PPQN / 2, 60, 100);
        seq.add_note(0, PPQN, 64, 90);
        assert!(sorted_by_key(&seq));
        assert!(no_marks(&seq));

        seq.unmark_all();
        seq.mark_range(0, PPQN, 60, 61);
        seq.remove_marked();
        assert!(sorted_by_key(&seq));
        assert!(no_marks(&seq));

        seq.set_length(2 * PPQN);
        assert!(sorted_by_key(&seq));
        assert!(no_marks(&seq));
    }

    #[test]
    fn same_tick_retrigger_orders_off_before_on() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.add_note(PPQN, PPQN, 60, 100);
        let handle = seq.handle();
        let events = handle.events();
        // at tick PPQN the off of the first note precedes the on of the second
        assert_eq!(events[1].tick(), PPQN);
        assert!(events[1].is_note_off());
        assert_eq!(events[2].tick(), PPQN);
        assert!(events[2].is_note_on());
        assert_eq!(events[0].link(), Some(1));
        assert_eq!(events[2].link(), Some(3));
    }

    #[test]
    fn mark_range_accumulates() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.add_note(PPQN, PPQN, 64, 100);
        seq.mark_range(0, 1, 60, 61);
        seq.mark_range(PPQN, PPQN + 1, 64, 65);
        let marked = {
            let handle = seq.handle();
            handle.events().iter().filter(|ev| ev.is_marked()).count()
        };
        assert_eq!(marked, 4); // both pairs, marks from the first call kept
    }

    #[test]
    fn remove_marked_is_idempotent() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.add_note(0, PPQN, 64, 100);
        seq.mark_range(0, 1, 60, 61);
        seq.remove_marked();
        let remaining = { seq.handle().events().len() };
        seq.remove_marked();
        assert_eq!(seq.handle().events().len(), remaining);
        assert_eq!(remaining, 2);
        assert!(no_marks(&seq));
    }

    #[test]
    fn set_note_lengths_replaces_marked_notes() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 77);
        seq.mark_range(0, 1, 60, 61);
        seq.set_note_lengths(3 * PPQN);
        let handle = seq.handle();
        let events = handle.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].length_in(events), 3 * PPQN);
        assert_eq!(events[0].velocity(), 77);
    }

    #[test]
    fn set_note_velocities_clears_marks() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.mark_range(0, 1, 60, 61);
        seq.set_note_velocities(55);
        let handle = seq.handle();
        assert_eq!(handle.events()[0].velocity(), 55);
        assert!(handle.events().iter().all(|ev| !ev.is_marked()));
    }

    #[test]
    fn set_length_clips_and_drops() {
        let seq = Sequence::default();
        seq.add_note(0, 4 * PPQN, 60, 100); // crosses the new end
        seq.add_note(2 * PPQN, PPQN, 62, 100); // starts past the new end
        seq.set_length(2 * PPQN);
        let handle = seq.handle();
        let events = handle.events();
        assert_eq!(handle.length(), 2 * PPQN);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].note(), 60);
        assert_eq!(events[0].length_in(events), 2 * PPQN);
        for ev in events.iter().filter(|ev| ev.is_note_on()) {
            assert!(ev.tick() + ev.length_in(events) <= 2 * PPQN);
        }
    }

    #[test]
    fn growing_length_keeps_events() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.set_length(16 * PPQN);
        assert_eq!(seq.get_length(), 16 * PPQN);
        assert_eq!(seq.handle().events().len(), 2);
    }

    #[test]
    fn selection_survives_moves() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 90);
        seq.select_range(0, 1, 60, 61, false);
        assert_eq!(seq.selected_count(), 1);
        seq.move_selected_notes(|tick, note| (tick + PPQN, note + 2));
        let handle = seq.handle();
        let events = handle.events();
        assert_eq!(events.len(), 2);
        let on = &events[0];
        assert_eq!(on.tick(), PPQN);
        assert_eq!(on.note(), 62);
        assert_eq!(on.velocity(), 90);
        assert!(on.is_selected());
        assert_eq!(on.length_in(events), PPQN);
    }

    #[test]
    fn select_toggle_flips() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.select_range(0, 1, 60, 61, true);
        assert_eq!(seq.selected_count(), 1);
        seq.select_range(0, 1, 60, 61, true);
        assert_eq!(seq.selected_count(), 0);
        seq.add_note(0, PPQN, 62, 100);
        // adding notes does not disturb selection flags of others
        seq.select_range(0, 1, 62, 63, false);
        seq.add_note(PPQN, PPQN, 64, 100);
        assert_eq!(seq.selected_count(), 1);
    }

    #[test]
    fn average_velocity_unmarks() {
        let seq = Sequence::default();
        seq.add_note(0, PPQN, 60, 100);
        seq.add_note(0, PPQN, 64, 50);
        seq.mark_range(0, 1, 0, 127);
        assert_eq!(seq.get_average_velocity(), 75);
        assert!(no_marks(&seq));
        assert_eq!(seq.get_average_velocity(), DEFAULT_VELOCITY);
    }

    #[test]
    fn defaults_match_new_sequences() {
        let seq = Sequence::default();
        assert_eq!(seq.get_length(), SEQUENCE_DEFAULT_LENGTH);
        assert!(seq.is_repeated());
        assert!(seq.is_empty());
    }
}
