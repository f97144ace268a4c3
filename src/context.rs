//! The context: one per process, owning the seats, devices, the event ring
//! and the source multiplexer.
//!
//! The host polls [`Context::as_fd`] for read readiness, calls
//! [`Context::dispatch`] and drains [`Context::next_event`]. All event
//! decoding runs inline inside `dispatch`; there are no suspension points
//! and no blocking calls on that path.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};
use tracing::info;

use crate::backend::path::PathBackend;
#[cfg(feature = "backend_udev")]
use crate::backend::udev::UdevBackend;
use crate::device::lid::LidSwitchDispatch;
use crate::device::{self, Device, RemovalKind};
use crate::events::queue::EventQueue;
use crate::events::{
    ButtonState, DeviceAddedEvent, DeviceRemovedEvent, Event, EventType, KeyState, KeyboardKeyEvent,
    PointerAxis, PointerAxisEvent, PointerButtonEvent, PointerMotionAbsoluteEvent,
    PointerMotionEvent, Switch, SwitchState, SwitchToggleEvent, TabletAxes, TabletAxisEvent,
    TabletButtonEvent, TabletProximityOutEvent, TabletTool, TabletToolUpdateEvent, TouchCancelEvent,
    TouchDownEvent, TouchMotionEvent, TouchUpEvent, TABLET_AXIS_COUNT,
};
use crate::seat::Seat;
use crate::source::{Poller, SourceKind};
use crate::utils::{Clock, Fixed, Monotonic};

/// The host side of the context: privilege mediated fd access and output
/// geometry.
pub trait Interface {
    /// Opens a device node, returning an fd or a negative errno.
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<RawFd, i32>;

    /// Closes an fd previously returned by
    /// [`open_restricted`](Self::open_restricted).
    fn close_restricted(&mut self, fd: RawFd);

    /// The logical screen extents in pixels, used to scale absolute and
    /// multi-touch coordinates.
    fn screen_dimensions(&mut self, device: &Device) -> (i32, i32);
}

/// Errors creating a context.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// The event wait primitive could not be created.
    #[error("failed to create the event wait primitive: {0}")]
    Poller(#[source] io::Error),
    /// The discovery backend could not be brought up.
    #[error("failed to enable the discovery backend: {0}")]
    Enable(#[source] io::Error),
}

#[derive(Debug)]
pub(crate) enum Backend {
    Path(PathBackend),
    #[cfg(feature = "backend_udev")]
    Udev(UdevBackend),
}

impl Backend {
    fn resume(&mut self, ctx: &Context) -> io::Result<()> {
        match self {
            Backend::Path(path) => path.enable(ctx),
            #[cfg(feature = "backend_udev")]
            Backend::Udev(udev) => udev.enable(ctx),
        }
    }

    fn suspend(&mut self, ctx: &Context) {
        match self {
            Backend::Path(path) => path.disable(ctx),
            #[cfg(feature = "backend_udev")]
            Backend::Udev(udev) => udev.disable(ctx),
        }
    }
}

/// A libinput-style input context.
pub struct Context {
    poller: Poller,
    clock: Clock<Monotonic>,
    interface: RefCell<Box<dyn Interface>>,
    seats: RefCell<Vec<Seat>>,
    devices: RefCell<Vec<Device>>,
    queue: RefCell<EventQueue>,
    backend: RefCell<Backend>,
    token: Cell<Option<Token>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices.borrow().len())
            .field("seats", &self.seats.borrow().len())
            .field("queued_events", &self.queue.borrow().len())
            .finish()
    }
}

impl Context {
    fn new(interface: Box<dyn Interface>, backend: Backend) -> Result<Context, ContextError> {
        Ok(Context {
            poller: Poller::new().map_err(ContextError::Poller)?,
            clock: Clock::new(),
            interface: RefCell::new(interface),
            seats: RefCell::new(Vec::new()),
            devices: RefCell::new(Vec::new()),
            queue: RefCell::new(EventQueue::new()),
            backend: RefCell::new(backend),
            token: Cell::new(None),
        })
    }

    /// Creates a context over an explicit list of device nodes.
    ///
    /// Every listed device must be usable; a device that fails to open or
    /// probe fails the constructor, matching the path discovery contract.
    pub fn from_paths<I, P>(interface: I, paths: P) -> Result<Context, ContextError>
    where
        I: Interface + 'static,
        P: IntoIterator<Item = PathBuf>,
    {
        let ctx = Context::new(
            Box::new(interface),
            Backend::Path(PathBackend::new(paths.into_iter().collect())),
        )?;
        ctx.resume().map_err(ContextError::Enable)?;
        Ok(ctx)
    }

    /// Creates a context discovering devices through udev, restricted to
    /// the given seat id (usually `"seat0"`).
    #[cfg(feature = "backend_udev")]
    pub fn from_udev<I>(interface: I, seat_id: &str) -> Result<Context, ContextError>
    where
        I: Interface + 'static,
    {
        let ctx = Context::new(Box::new(interface), Backend::Udev(UdevBackend::new(seat_id)))?;
        ctx.resume().map_err(ContextError::Enable)?;
        Ok(ctx)
    }

    /// Processes everything currently readable: device fds, timers and the
    /// discovery monitor. Never blocks; events become available through
    /// [`next_event`](Self::next_event).
    #[profiling::function]
    pub fn dispatch(&self) -> io::Result<()> {
        let ready = self.poller.ready()?;

        for id in ready {
            // Sources removed earlier in this cycle are skipped.
            let Some(source) = self.poller.get(id) else {
                continue;
            };
            match &source.kind {
                SourceKind::Device(weak) => {
                    if let Some(inner) = weak.upgrade() {
                        device::dispatch_device(self, &Device { inner });
                    }
                }
                SourceKind::Timer(weak, kind) => {
                    if let Some(inner) = weak.upgrade() {
                        device::dispatch_timer(self, &Device { inner }, *kind);
                    }
                }
                #[cfg(feature = "backend_udev")]
                SourceKind::Monitor => {
                    let mut backend = self.backend.borrow_mut();
                    if let Backend::Udev(udev) = &mut *backend {
                        udev.handle_monitor(self);
                    }
                }
            }
        }

        self.poller.drop_destroyed();
        Ok(())
    }

    /// Retrieves the next event from the internal queue.
    pub fn next_event(&self) -> Option<Event> {
        self.queue.borrow_mut().get()
    }

    /// The type of the next queued event, without dequeuing it.
    pub fn peek_event_type(&self) -> Option<EventType> {
        self.queue.borrow().peek_type()
    }

    /// Removes every device and stops discovery, keeping the context alive
    /// for [`resume`](Self::resume). Calling this twice is the same as
    /// calling it once.
    pub fn suspend(&self) {
        self.backend.borrow_mut().suspend(self);
    }

    /// Re-enables discovery and re-adds available devices.
    pub fn resume(&self) -> io::Result<()> {
        self.backend.borrow_mut().resume(self)
    }

    /// The current monotonic time in milliseconds, the clock synthetic
    /// event timestamps are drawn from.
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// The seats known to this context.
    pub fn seats(&self) -> Vec<Seat> {
        self.seats.borrow().clone()
    }

    /// The devices currently attached to this context.
    pub fn devices(&self) -> Vec<Device> {
        self.devices.borrow().clone()
    }

    pub(crate) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(crate) fn open_restricted(&self, path: &Path, flags: i32) -> Result<RawFd, i32> {
        self.interface.borrow_mut().open_restricted(path, flags)
    }

    pub(crate) fn close_restricted(&self, fd: RawFd) {
        self.interface.borrow_mut().close_restricted(fd);
    }

    pub(crate) fn screen_dimensions(&self, device: &Device) -> (i32, i32) {
        self.interface.borrow_mut().screen_dimensions(device)
    }

    pub(crate) fn get_or_create_seat(&self, physical: &str, logical: &str) -> Seat {
        let mut seats = self.seats.borrow_mut();
        if let Some(seat) = seats.iter().find(|s| s.names_match(physical, logical)) {
            return seat.clone();
        }
        let seat = Seat::new(physical, logical);
        seats.push(seat.clone());
        seat
    }

    pub(crate) fn find_device_by_devnode(&self, devnode: &Path) -> Option<Device> {
        self.devices
            .borrow()
            .iter()
            .find(|d| d.devnode() == devnode)
            .cloned()
    }

    /// Detaches all devices at once, for backend suspend paths that tear
    /// down every device.
    pub(crate) fn take_devices(&self) -> Vec<Device> {
        self.devices.borrow().clone()
    }

    /// Hooks a freshly created device into the context: posts the added
    /// event, runs the seat-local `device_added` broadcast in both
    /// directions and syncs the dispatch with the kernel state.
    pub(crate) fn attach_device(&self, device: &Device) {
        self.devices.borrow_mut().push(device.clone());
        self.post(Event::DeviceAdded(DeviceAddedEvent {
            device: device.clone(),
        }));

        let others: Vec<Device> = self
            .devices
            .borrow()
            .iter()
            .filter(|d| *d != device && d.seat() == device.seat())
            .cloned()
            .collect();
        for other in &others {
            if let Some(dispatch) = other.inner.dispatch.borrow_mut().as_mut() {
                dispatch.device_added(other, device);
            }
            if let Some(dispatch) = device.inner.dispatch.borrow_mut().as_mut() {
                dispatch.device_added(device, other);
            }
        }

        if let Some(dispatch) = device.inner.dispatch.borrow_mut().as_mut() {
            dispatch.sync_initial_state(self, device);
        }
    }

    /// Tears one device down: seat-local broadcast, source removal, fd
    /// close through the host interface, removed event. The device handle
    /// stays valid for event consumers until the last reference drops.
    pub(crate) fn remove_device(&self, device: &Device, how: RemovalKind) {
        {
            let mut devices = self.devices.borrow_mut();
            let Some(position) = devices.iter().position(|d| d == device) else {
                return;
            };
            devices.remove(position);
        }

        let others: Vec<Device> = self
            .devices
            .borrow()
            .iter()
            .filter(|d| d.seat() == device.seat())
            .cloned()
            .collect();
        for other in &others {
            if let Some(dispatch) = other.inner.dispatch.borrow_mut().as_mut() {
                match how {
                    RemovalKind::Removed => dispatch.device_removed(other, device),
                    RemovalKind::Suspended => dispatch.device_suspended(other, device),
                }
            }
        }

        if let Some(source) = device.inner.source.take() {
            self.poller.remove(source);
        }
        if let Some(mut dispatch) = device.inner.dispatch.borrow_mut().take() {
            dispatch.destroy(self);
        }
        if device.inner.fd >= 0 {
            self.close_restricted(device.inner.fd);
        }

        // A seat with no remaining devices leaves the seat list; event
        // holders keep it alive through their handles.
        if others.is_empty() {
            self.seats.borrow_mut().retain(|s| s != device.seat());
        }

        info!(device = device.sysname(), "removed input device");
        self.post(Event::DeviceRemoved(DeviceRemovedEvent {
            device: device.clone(),
        }));
    }

    fn post(&self, event: Event) {
        self.queue.borrow_mut().post(event);
    }

    pub(crate) fn keyboard_notify_key(&self, device: &Device, time: u32, key: u32, state: KeyState) {
        // Key listeners observe the event before it is queued; the only
        // listener kind is the lid-switch wake.
        let listeners: Vec<_> = device
            .inner
            .listeners
            .borrow()
            .iter()
            .map(|l| l.lid.clone())
            .collect();
        for lid_weak in listeners {
            let Some(lid_inner) = lid_weak.upgrade() else {
                continue;
            };
            let lid_device = Device { inner: lid_inner };
            let remove = {
                let mut dispatch = lid_device.inner.dispatch.borrow_mut();
                match dispatch
                    .as_mut()
                    .and_then(|d| d.downcast_mut::<LidSwitchDispatch>())
                {
                    Some(lid) => lid.handle_paired_key(self, &lid_device, time),
                    None => false,
                }
            };
            if remove {
                device
                    .inner
                    .listeners
                    .borrow_mut()
                    .retain(|l| !l.lid.ptr_eq(&lid_weak));
            }
        }

        self.post(Event::KeyboardKey(KeyboardKeyEvent {
            device: device.clone(),
            time,
            key,
            state,
        }));
    }

    pub(crate) fn pointer_notify_motion(&self, device: &Device, time: u32, dx: Fixed, dy: Fixed) {
        self.post(Event::PointerMotion(PointerMotionEvent {
            device: device.clone(),
            time,
            dx,
            dy,
        }));
    }

    pub(crate) fn pointer_notify_motion_absolute(&self, device: &Device, time: u32, x: Fixed, y: Fixed) {
        self.post(Event::PointerMotionAbsolute(PointerMotionAbsoluteEvent {
            device: device.clone(),
            time,
            x,
            y,
        }));
    }

    pub(crate) fn pointer_notify_button(
        &self,
        device: &Device,
        time: u32,
        button: u32,
        state: ButtonState,
    ) {
        self.post(Event::PointerButton(PointerButtonEvent {
            device: device.clone(),
            time,
            button,
            state,
        }));
    }

    pub(crate) fn pointer_notify_axis(
        &self,
        device: &Device,
        time: u32,
        axis: PointerAxis,
        value: Fixed,
    ) {
        self.post(Event::PointerAxis(PointerAxisEvent {
            device: device.clone(),
            time,
            axis,
            value,
        }));
    }

    pub(crate) fn touch_notify_down(&self, device: &Device, time: u32, slot: u32, x: Fixed, y: Fixed) {
        self.post(Event::TouchDown(TouchDownEvent {
            device: device.clone(),
            time,
            slot,
            x,
            y,
        }));
    }

    pub(crate) fn touch_notify_motion(&self, device: &Device, time: u32, slot: u32, x: Fixed, y: Fixed) {
        self.post(Event::TouchMotion(TouchMotionEvent {
            device: device.clone(),
            time,
            slot,
            x,
            y,
        }));
    }

    pub(crate) fn touch_notify_up(&self, device: &Device, time: u32, slot: u32) {
        self.post(Event::TouchUp(TouchUpEvent {
            device: device.clone(),
            time,
            slot,
        }));
    }

    pub(crate) fn touch_notify_cancel(&self, device: &Device, time: u32, slot: u32) {
        self.post(Event::TouchCancel(TouchCancelEvent {
            device: device.clone(),
            time,
            slot,
        }));
    }

    pub(crate) fn tablet_notify_axis(
        &self,
        device: &Device,
        time: u32,
        changed: TabletAxes,
        values: [f64; TABLET_AXIS_COUNT],
    ) {
        self.post(Event::TabletAxis(TabletAxisEvent {
            device: device.clone(),
            time,
            changed,
            values,
        }));
    }

    pub(crate) fn tablet_notify_tool_update(&self, device: &Device, time: u32, tool: TabletTool) {
        self.post(Event::TabletToolUpdate(TabletToolUpdateEvent {
            device: device.clone(),
            time,
            tool,
        }));
    }

    pub(crate) fn tablet_notify_proximity_out(&self, device: &Device, time: u32) {
        self.post(Event::TabletProximityOut(TabletProximityOutEvent {
            device: device.clone(),
            time,
        }));
    }

    pub(crate) fn tablet_notify_button(
        &self,
        device: &Device,
        time: u32,
        button: u32,
        state: ButtonState,
    ) {
        self.post(Event::TabletButton(TabletButtonEvent {
            device: device.clone(),
            time,
            button,
            state,
        }));
    }

    pub(crate) fn switch_notify_toggle(
        &self,
        device: &Device,
        time: u32,
        switch: Switch,
        state: SwitchState,
    ) {
        self.post(Event::SwitchToggle(SwitchToggleEvent {
            device: device.clone(),
            time,
            switch,
            state,
        }));
    }

    #[cfg(test)]
    pub(crate) fn test_seat(&self) -> Seat {
        self.get_or_create_seat(crate::backend::DEFAULT_SEAT, crate::backend::DEFAULT_SEAT_NAME)
    }

    #[cfg(test)]
    pub(crate) fn drain_events(&self) {
        while self.next_event().is_some() {}
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.suspend();
    }
}

impl AsFd for Context {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.poller.fd()
    }
}

impl EventSource for Context {
    type Event = Event;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(&mut self, _: Readiness, token: Token, mut callback: F) -> io::Result<PostAction>
    where
        F: FnMut(Event, &mut ()),
    {
        if Some(token) == self.token.get() {
            self.dispatch()?;
            while let Some(event) = self.next_event() {
                callback(event, &mut ());
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token.set(Some(token));
        // Safety: the epoll fd lives as long as the context, which cannot
        // leave the event loop without unregister running first.
        unsafe { poll.register(self.as_fd(), Interest::READ, Mode::Level, token) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        let token = factory.token();
        self.token.set(Some(token));
        poll.reregister(self.as_fd(), Interest::READ, Mode::Level, token)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token.set(None);
        poll.unregister(self.as_fd())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A host interface that cannot open devices and reports fixed screen
    /// extents.
    pub(crate) struct TestInterface {
        dimensions: (i32, i32),
    }

    impl Interface for TestInterface {
        fn open_restricted(&mut self, _path: &Path, _flags: i32) -> Result<RawFd, i32> {
            Err(-libc::ENOSYS)
        }

        fn close_restricted(&mut self, _fd: RawFd) {}

        fn screen_dimensions(&mut self, _device: &Device) -> (i32, i32) {
            self.dimensions
        }
    }

    /// A context with no devices and a path backend over an empty list.
    pub(crate) fn test_context(dimensions: (i32, i32)) -> Context {
        Context::from_paths(TestInterface { dimensions }, Vec::new()).expect("test context")
    }
}
