//! Seats group the devices of one user.

use std::fmt;
use std::rc::Rc;

#[derive(Debug)]
pub(crate) struct SeatInner {
    physical_name: String,
    logical_name: String,
}

/// A group of input devices belonging together.
///
/// Seats are identified by a (physical name, logical name) pair; devices
/// sharing both names share a seat. The handle is reference counted: a seat
/// whose devices are gone stays alive for as long as any event or caller
/// still refers to it.
#[derive(Clone)]
pub struct Seat {
    pub(crate) inner: Rc<SeatInner>,
}

impl Seat {
    pub(crate) fn new(physical_name: &str, logical_name: &str) -> Seat {
        Seat {
            inner: Rc::new(SeatInner {
                physical_name: physical_name.to_owned(),
                logical_name: logical_name.to_owned(),
            }),
        }
    }

    /// The physical seat name, e.g. `seat0`.
    pub fn physical_name(&self) -> &str {
        &self.inner.physical_name
    }

    /// The logical seat name, e.g. `default`.
    pub fn logical_name(&self) -> &str {
        &self.inner.logical_name
    }

    pub(crate) fn names_match(&self, physical: &str, logical: &str) -> bool {
        self.inner.physical_name == physical && self.inner.logical_name == logical
    }
}

impl PartialEq for Seat {
    fn eq(&self, other: &Seat) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Seat {}

impl fmt::Debug for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seat")
            .field("physical_name", &self.inner.physical_name)
            .field("logical_name", &self.inner.logical_name)
            .finish()
    }
}
