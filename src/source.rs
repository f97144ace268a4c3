//! The source multiplexer.
//!
//! One epoll instance multiplexes every file descriptor the context watches:
//! device fds, touchpad timer fds and the discovery monitor. Sources may be
//! removed from within their own callback, so removal only unregisters the
//! fd and marks the slot stale; the slot itself is reclaimed at the end of
//! the dispatch cycle.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

use rustix::event::epoll;
use smallvec::SmallVec;

use crate::device::DeviceInner;

pub(crate) type SourceId = usize;

const STALE_FD: RawFd = -1;

/// Per-device timers registered as additional sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Touchpad tap state machine timeout.
    Tap,
    /// Touchpad software button state machine timeout.
    Button,
}

/// What to do when a source becomes readable.
#[derive(Debug)]
pub(crate) enum SourceKind {
    /// An evdev device fd.
    Device(Weak<DeviceInner>),
    /// A timer fd owned by a device dispatch.
    Timer(Weak<DeviceInner>, TimerKind),
    /// The discovery backend's monitor fd.
    #[cfg(feature = "backend_udev")]
    Monitor,
}

#[derive(Debug)]
pub(crate) struct Source {
    fd: Cell<RawFd>,
    pub(crate) kind: SourceKind,
}

impl Source {
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.get()
    }
}

#[derive(Debug)]
pub(crate) struct Poller {
    epoll: OwnedFd,
    sources: RefCell<Vec<Option<Rc<Source>>>>,
    pending_destroy: RefCell<Vec<SourceId>>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(Poller {
            epoll,
            sources: RefCell::new(Vec::new()),
            pending_destroy: RefCell::new(Vec::new()),
        })
    }

    /// The fd the host polls for read readiness.
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }

    /// Registers a source for read readiness. The fd stays owned by the
    /// caller.
    pub(crate) fn add_fd(&self, fd: RawFd, kind: SourceKind) -> io::Result<SourceId> {
        let mut sources = self.sources.borrow_mut();
        let id = sources
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or_else(|| {
                sources.push(None);
                sources.len() - 1
            });

        epoll::add(
            &self.epoll,
            unsafe { BorrowedFd::borrow_raw(fd) },
            epoll::EventData::new_u64(id as u64),
            epoll::EventFlags::IN,
        )?;

        sources[id] = Some(Rc::new(Source {
            fd: Cell::new(fd),
            kind,
        }));
        Ok(id)
    }

    /// Unregisters a source. The slot is kept stale until
    /// [`drop_destroyed`](Self::drop_destroyed) so that ids of removed
    /// sources are not reused within the current dispatch cycle.
    pub(crate) fn remove(&self, id: SourceId) {
        let sources = self.sources.borrow();
        let Some(source) = sources.get(id).and_then(|slot| slot.as_ref()) else {
            return;
        };
        if source.fd.get() == STALE_FD {
            return;
        }

        let _ = epoll::delete(&self.epoll, unsafe {
            BorrowedFd::borrow_raw(source.fd.get())
        });
        source.fd.set(STALE_FD);
        self.pending_destroy.borrow_mut().push(id);
    }

    /// Waits with timeout zero and returns the ids of all ready sources.
    pub(crate) fn ready(&self) -> io::Result<SmallVec<[SourceId; 32]>> {
        let mut event_list = epoll::EventVec::with_capacity(32);
        epoll::wait(&self.epoll, &mut event_list, 0)?;

        Ok(event_list.iter().map(|event| event.data.u64() as SourceId).collect())
    }

    /// Looks up a ready source, skipping slots removed earlier in the same
    /// dispatch cycle.
    pub(crate) fn get(&self, id: SourceId) -> Option<Rc<Source>> {
        let sources = self.sources.borrow();
        let source = sources.get(id)?.as_ref()?;
        if source.fd.get() == STALE_FD {
            return None;
        }
        Some(source.clone())
    }

    /// Reclaims the slots of sources removed during this dispatch cycle.
    pub(crate) fn drop_destroyed(&self) {
        let mut pending = self.pending_destroy.borrow_mut();
        let mut sources = self.sources.borrow_mut();
        for id in pending.drain(..) {
            sources[id] = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::io::AsRawFd;

    use rustix::event::{eventfd, EventfdFlags};

    fn readable_fd() -> OwnedFd {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap();
        rustix::io::write(&fd, &1u64.to_ne_bytes()).unwrap();
        fd
    }

    #[test]
    fn ready_reports_registered_fd() {
        let poller = Poller::new().unwrap();
        let fd = readable_fd();
        let id = poller
            .add_fd(fd.as_raw_fd(), SourceKind::Device(Weak::new()))
            .unwrap();

        let ready = poller.ready().unwrap();
        assert_eq!(ready.as_slice(), &[id]);
        assert!(poller.get(id).is_some());
    }

    #[test]
    fn removed_source_is_skipped_until_drained() {
        let poller = Poller::new().unwrap();
        let fd = readable_fd();
        let id = poller
            .add_fd(fd.as_raw_fd(), SourceKind::Device(Weak::new()))
            .unwrap();

        poller.remove(id);
        // Stale references skip delivery but the slot is still occupied.
        assert!(poller.get(id).is_none());
        assert!(poller.sources.borrow()[id].is_some());

        poller.drop_destroyed();
        assert!(poller.sources.borrow()[id].is_none());

        // The slot is reusable afterwards.
        let fd2 = readable_fd();
        let id2 = poller
            .add_fd(fd2.as_raw_fd(), SourceKind::Device(Weak::new()))
            .unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn double_remove_is_inert() {
        let poller = Poller::new().unwrap();
        let fd = readable_fd();
        let id = poller
            .add_fd(fd.as_raw_fd(), SourceKind::Device(Weak::new()))
            .unwrap();
        poller.remove(id);
        poller.remove(id);
        poller.drop_destroyed();
        assert_eq!(poller.pending_destroy.borrow().len(), 0);
    }
}
