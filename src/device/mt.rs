//! Slot reconstruction for multi-touch protocol A devices.
//!
//! Protocol A devices report anonymous contacts in arbitrary order,
//! delimited by `SYN_MT_REPORT`, with no slot or tracking identity. The
//! [`SlotConverter`] buffers one frame worth of contacts, matches them to
//! the previous frame's contacts by nearest position and emits a
//! synthesized protocol B stream (`ABS_MT_SLOT` before each slot's data,
//! tracking id transitions on touch down/up). The fallback decoder consumes
//! the synthesized stream identically to native protocol B input.

use smallvec::SmallVec;

use crate::evdev::{codes, InputEvent};

/// Contacts tracked simultaneously for slotless devices.
pub(crate) const MAX_CONTACTS: usize = 10;

pub(crate) type ConvertedFrame = SmallVec<[InputEvent; 32]>;

#[derive(Debug, Clone, Copy, Default)]
struct Contact {
    x: Option<i32>,
    y: Option<i32>,
}

impl Contact {
    fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tracking_id: i32,
    x: i32,
    y: i32,
}

#[derive(Debug)]
pub(crate) struct SlotConverter {
    slots: Vec<Option<Slot>>,
    next_tracking_id: i32,
    pending: Vec<(i32, i32)>,
    current: Contact,
}

impl SlotConverter {
    pub(crate) fn new(nslots: usize) -> SlotConverter {
        SlotConverter {
            slots: vec![None; nslots.max(1)],
            next_tracking_id: 0,
            pending: Vec::new(),
            current: Contact::default(),
        }
    }

    /// Drops any partially accumulated frame, e.g. after a SYN_DROPPED.
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.current = Contact::default();
    }

    /// Feeds one raw event. Returns `None` while buffering; a synthesized
    /// slotted frame at the frame boundary; and passes non-MT events
    /// through unchanged.
    pub(crate) fn feed(&mut self, event: &InputEvent) -> Option<ConvertedFrame> {
        match (event.kind, event.code) {
            (codes::EV_ABS, codes::ABS_MT_POSITION_X) => {
                self.current.x = Some(event.value);
                None
            }
            (codes::EV_ABS, codes::ABS_MT_POSITION_Y) => {
                self.current.y = Some(event.value);
                None
            }
            // Pressure, touch sizes and the like carry no position
            // information the slot model needs.
            (codes::EV_ABS, code) if code >= codes::ABS_MT_SLOT => None,
            (codes::EV_SYN, codes::SYN_MT_REPORT) => {
                if !self.current.is_empty() && self.pending.len() < self.slots.len() {
                    self.pending
                        .push((self.current.x.unwrap_or(0), self.current.y.unwrap_or(0)));
                }
                self.current = Contact::default();
                None
            }
            (codes::EV_SYN, codes::SYN_REPORT) => Some(self.flush(event)),
            // Anything else is not part of the multi-touch protocol.
            _ => Some(SmallVec::from_slice(std::slice::from_ref(event))),
        }
    }

    /// Matches the frame's contacts against the live slots and synthesizes
    /// the equivalent protocol B sequence.
    fn flush(&mut self, syn: &InputEvent) -> ConvertedFrame {
        let mut frame = ConvertedFrame::new();
        let ev = |code, value| InputEvent {
            code,
            value,
            kind: codes::EV_ABS,
            sec: syn.sec,
            usec: syn.usec,
        };

        let mut assigned: Vec<Option<usize>> = vec![None; self.pending.len()];
        let mut claimed = vec![false; self.slots.len()];

        // Contacts keep the identity of the nearest contact of the previous
        // frame. Pairs are taken greedily by distance so a fast contact
        // cannot steal a slot from a stationary one.
        let mut pairs: Vec<(i64, usize, usize)> = Vec::new();
        for (ci, &(x, y)) in self.pending.iter().enumerate() {
            for (si, slot) in self.slots.iter().enumerate() {
                if let Some(slot) = slot {
                    let dx = i64::from(slot.x - x);
                    let dy = i64::from(slot.y - y);
                    pairs.push((dx * dx + dy * dy, ci, si));
                }
            }
        }
        pairs.sort_unstable();
        for (_, ci, si) in pairs {
            if assigned[ci].is_none() && !claimed[si] {
                assigned[ci] = Some(si);
                claimed[si] = true;
            }
        }

        for (ci, &(x, y)) in self.pending.iter().enumerate() {
            let (slot_index, is_new) = match assigned[ci] {
                Some(si) => (si, false),
                None => match self.slots.iter().position(|s| s.is_none()) {
                    Some(si) => (si, true),
                    // More contacts than slots; excess contacts are dropped.
                    None => continue,
                },
            };

            frame.push(ev(codes::ABS_MT_SLOT, slot_index as i32));
            if is_new {
                let id = self.next_tracking_id;
                self.next_tracking_id = self.next_tracking_id.wrapping_add(1) & i32::MAX;
                self.slots[slot_index] = Some(Slot {
                    tracking_id: id,
                    x,
                    y,
                });
                claimed[slot_index] = true;
                frame.push(ev(codes::ABS_MT_TRACKING_ID, id));
            } else if let Some(slot) = self.slots[slot_index].as_mut() {
                slot.x = x;
                slot.y = y;
            }
            frame.push(ev(codes::ABS_MT_POSITION_X, x));
            frame.push(ev(codes::ABS_MT_POSITION_Y, y));
        }

        for (si, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !claimed[si] {
                *slot = None;
                frame.push(ev(codes::ABS_MT_SLOT, si as i32));
                frame.push(ev(codes::ABS_MT_TRACKING_ID, -1));
            }
        }

        frame.push(*syn);
        self.pending.clear();
        self.current = Contact::default();
        frame
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn feed_contact(conv: &mut SlotConverter, x: i32, y: i32) {
        assert!(conv
            .feed(&InputEvent::synthesized(0, codes::EV_ABS, codes::ABS_MT_POSITION_X, x))
            .is_none());
        assert!(conv
            .feed(&InputEvent::synthesized(0, codes::EV_ABS, codes::ABS_MT_POSITION_Y, y))
            .is_none());
        assert!(conv
            .feed(&InputEvent::synthesized(0, codes::EV_SYN, codes::SYN_MT_REPORT, 0))
            .is_none());
    }

    fn flush(conv: &mut SlotConverter) -> Vec<(u16, u16, i32)> {
        let frame = conv
            .feed(&InputEvent::synthesized(0, codes::EV_SYN, codes::SYN_REPORT, 0))
            .unwrap();
        frame.iter().map(|e| (e.kind, e.code, e.value)).collect()
    }

    #[test]
    fn single_contact_produces_slotted_stream() {
        let mut conv = SlotConverter::new(4);
        feed_contact(&mut conv, 100, 200);
        let frame = flush(&mut conv);
        assert_eq!(
            frame,
            vec![
                (codes::EV_ABS, codes::ABS_MT_SLOT, 0),
                (codes::EV_ABS, codes::ABS_MT_TRACKING_ID, 0),
                (codes::EV_ABS, codes::ABS_MT_POSITION_X, 100),
                (codes::EV_ABS, codes::ABS_MT_POSITION_Y, 200),
                (codes::EV_SYN, codes::SYN_REPORT, 0),
            ]
        );

        // Second frame: same contact moved, no new tracking id.
        feed_contact(&mut conv, 110, 210);
        let frame = flush(&mut conv);
        assert_eq!(
            frame,
            vec![
                (codes::EV_ABS, codes::ABS_MT_SLOT, 0),
                (codes::EV_ABS, codes::ABS_MT_POSITION_X, 110),
                (codes::EV_ABS, codes::ABS_MT_POSITION_Y, 210),
                (codes::EV_SYN, codes::SYN_REPORT, 0),
            ]
        );

        // Empty frame releases the slot.
        let frame = flush(&mut conv);
        assert_eq!(
            frame,
            vec![
                (codes::EV_ABS, codes::ABS_MT_SLOT, 0),
                (codes::EV_ABS, codes::ABS_MT_TRACKING_ID, -1),
                (codes::EV_SYN, codes::SYN_REPORT, 0),
            ]
        );
    }

    #[test]
    fn contacts_keep_identity_by_position() {
        let mut conv = SlotConverter::new(4);
        feed_contact(&mut conv, 0, 0);
        feed_contact(&mut conv, 1000, 1000);
        flush(&mut conv);

        // Report the contacts in the opposite order; slot assignment must
        // follow position, not report order.
        feed_contact(&mut conv, 1010, 1010);
        feed_contact(&mut conv, 10, 10);
        let frame = flush(&mut conv);

        let slots: Vec<(i32, i32)> = frame
            .chunks(3)
            .filter(|c| c.len() == 3 && c[0].1 == codes::ABS_MT_SLOT)
            .map(|c| (c[0].2, c[1].2))
            .collect();
        // Contact near (1000, 1000) stays in slot 1, the other in slot 0.
        assert!(slots.contains(&(1, 1010)));
        assert!(slots.contains(&(0, 10)));
    }

    #[test]
    fn passthrough_of_non_mt_events() {
        let mut conv = SlotConverter::new(2);
        let key = InputEvent::synthesized(0, codes::EV_KEY, codes::BTN_TOUCH, 1);
        let out = conv.feed(&key).unwrap();
        assert_eq!(out.as_slice(), &[key]);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut conv = SlotConverter::new(2);
        feed_contact(&mut conv, 5, 5);
        conv.reset();
        let frame = flush(&mut conv);
        assert_eq!(frame, vec![(codes::EV_SYN, codes::SYN_REPORT, 0)]);
    }
}
