use super::{Event, EventType};

const INITIAL_CAPACITY: usize = 4;

/// Bounded FIFO of logical events, growing by doubling.
///
/// Indices follow the `in`/`out`/`count` convention: `count` equals
/// `(in - out) mod capacity` except when the queue is full. On growth the
/// tail segment of a wrapped occupied region is moved to the new high end so
/// that the logical order is preserved.
#[derive(Debug)]
pub(crate) struct EventQueue {
    events: Vec<Option<Event>>,
    incoming: usize,
    outgoing: usize,
    count: usize,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue {
            events: (0..INITIAL_CAPACITY).map(|_| None).collect(),
            incoming: 0,
            outgoing: 0,
            count: 0,
        }
    }

    pub(crate) fn post(&mut self, event: Event) {
        if self.count == self.events.len() {
            self.grow();
        }

        self.events[self.incoming] = Some(event);
        self.incoming = (self.incoming + 1) % self.events.len();
        self.count += 1;
    }

    fn grow(&mut self) {
        let old_len = self.events.len();
        self.events.resize_with(old_len * 2, || None);

        if self.count > 0 && self.incoming == 0 {
            // The occupied region is [outgoing, old_len); appending continues
            // right after it.
            self.incoming = old_len;
        } else if self.count > 0 && self.outgoing >= self.incoming {
            // The occupied region wraps; move its tail to the new high end.
            let move_len = old_len - self.outgoing;
            let new_out = self.events.len() - move_len;
            for i in (0..move_len).rev() {
                self.events[new_out + i] = self.events[self.outgoing + i].take();
            }
            self.outgoing = new_out;
        }
    }

    pub(crate) fn get(&mut self) -> Option<Event> {
        if self.count == 0 {
            return None;
        }

        let event = self.events[self.outgoing].take();
        debug_assert!(event.is_some());
        self.outgoing = (self.outgoing + 1) % self.events.len();
        self.count -= 1;
        event
    }

    pub(crate) fn peek_type(&self) -> Option<EventType> {
        if self.count == 0 {
            return None;
        }
        self.events[self.outgoing].as_ref().map(Event::event_type)
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }
}
