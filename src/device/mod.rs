//! Device state, capability probing and per-device event decoding.
//!
//! A [`Device`] wraps one opened evdev character device. Probing the kernel
//! capability bits selects one of four dispatch behaviors (fallback,
//! touchpad, tablet, lid switch); the dispatch consumes raw
//! [`InputEvent`](crate::evdev::InputEvent) records and produces logical
//! events through the context.

pub(crate) mod fallback;
pub(crate) mod lid;
pub(crate) mod mt;
pub(crate) mod tablet;
pub(crate) mod touchpad;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use downcast_rs::{impl_downcast, Downcast};
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::evdev::{self, codes, InputEvent, InputId, EVENT_SIZE};
use crate::seat::Seat;
use crate::source::{SourceId, SourceKind, TimerKind};
use crate::utils::Fixed;

use self::lid::SwitchReliability;
use self::mt::SlotConverter;

const fn bits_len(max: u16) -> usize {
    max as usize / 8 + 1
}

bitflags::bitflags! {
    /// Raw capabilities gathered while probing the kernel bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct DeviceCaps: u32 {
        const KEYBOARD = 1 << 0;
        const BUTTON = 1 << 1;
        const MOTION_ABS = 1 << 2;
        const MOTION_REL = 1 << 3;
        const TOUCH = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Capabilities exposed to the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct SeatCaps: u32 {
        const POINTER = 1 << 0;
        const KEYBOARD = 1 << 1;
        const TOUCH = 1 << 2;
        const SWITCH = 1 << 3;
        const TABLET_TOOL = 1 << 4;
    }
}

/// A capability a device may expose to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCapability {
    /// The device controls a pointer.
    Pointer,
    /// The device produces key events.
    Keyboard,
    /// The device is a touchscreen or touchpad.
    Touch,
    /// The device carries switches.
    Switch,
    /// The device is a tablet tool.
    TabletTool,
}

bitflags::bitflags! {
    /// LEDs on a keyboard device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Leds: u32 {
        /// Num lock LED
        const NUM_LOCK = 1 << 0;
        /// Caps lock LED
        const CAPS_LOCK = 1 << 1;
        /// Scroll lock LED
        const SCROLL_LOCK = 1 << 2;
    }
}

/// Range of an absolute axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AbsRange {
    pub min: i32,
    pub max: i32,
}

impl AbsRange {
    /// Linearly maps `value` from this range onto `[0, to]`, rounding to the
    /// nearest fixed point value to avoid truncation bias.
    pub(crate) fn scale(&self, value: i32, to: i32) -> Fixed {
        let span = self.max - self.min;
        if span == 0 {
            return Fixed::ZERO;
        }
        Fixed::from_double(f64::from(value - self.min) * f64::from(to) / f64::from(span))
    }

    /// Maps `value` onto `[0.0, 1.0]`.
    pub(crate) fn normalize(&self, value: i32) -> f64 {
        let span = self.max - self.min;
        if span == 0 {
            return 0.0;
        }
        f64::from(value - self.min) / f64::from(span)
    }
}

/// Absolute axis state and calibration.
#[derive(Debug, Clone, Default)]
pub(crate) struct AbsState {
    pub range_x: AbsRange,
    pub range_y: AbsRange,
    /// Last seen coordinates, scaled to the screen.
    pub x: Fixed,
    pub y: Fixed,
    /// Top two rows of a 3x3 affine transform.
    pub calibration: [f32; 6],
    pub apply_calibration: bool,
}

/// One multi-touch slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MtSlot {
    pub x: Fixed,
    pub y: Fixed,
    /// `>= 0` while the contact is active.
    pub tracking_id: i32,
    /// Coordinates changed since the last frame.
    pub dirty: bool,
}

impl Default for MtSlot {
    fn default() -> MtSlot {
        MtSlot {
            x: Fixed::ZERO,
            y: Fixed::ZERO,
            tracking_id: -1,
            dirty: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MtState {
    /// Currently addressed slot.
    pub slot: i32,
    pub slots: Vec<MtSlot>,
}

/// Why a device was removed; selects which broadcast the other dispatches
/// receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemovalKind {
    /// The device is gone (unplug, read failure, context teardown).
    Removed,
    /// The context is being suspended; the device may come back on resume.
    Suspended,
}

/// Per-device polymorphic behavior.
///
/// `device` is always the dispatch's owning device; dispatches do not store
/// an owning back-reference.
pub(crate) trait DeviceDispatch: Downcast + fmt::Debug {
    /// Decodes one kernel event.
    fn process(&mut self, ctx: &Context, device: &Device, event: &InputEvent, time: u32);

    /// Another device appeared on the same seat.
    fn device_added(&mut self, _device: &Device, _added: &Device) {}

    /// Another device on the same seat disappeared.
    fn device_removed(&mut self, _device: &Device, _removed: &Device) {}

    /// Another device on the same seat was suspended.
    fn device_suspended(&mut self, device: &Device, other: &Device) {
        self.device_removed(device, other);
    }

    /// A previously suspended device on the same seat came back.
    fn device_resumed(&mut self, device: &Device, other: &Device) {
        self.device_added(device, other);
    }

    /// Reconciles the dispatch with the kernel state right after creation.
    fn sync_initial_state(&mut self, _ctx: &Context, _device: &Device) {}

    /// Releases resources registered with the context.
    fn destroy(&mut self, _ctx: &Context) {}
}

impl_downcast!(DeviceDispatch);

/// A key listener installed on a device by a lid-switch dispatch.
///
/// Fires for every keyboard key event the device produces; the weak
/// reference keeps the pairing from extending the lid device's lifetime.
#[derive(Debug)]
pub(crate) struct KeyListener {
    pub(crate) lid: Weak<DeviceInner>,
}

#[derive(Debug)]
pub(crate) struct DeviceInner {
    devnode: PathBuf,
    sysname: String,
    devname: String,
    output_name: RefCell<Option<String>>,
    pub(crate) fd: RawFd,
    pub(crate) id: InputId,
    pub(crate) caps: Cell<DeviceCaps>,
    seat_caps: Cell<SeatCaps>,
    pub(crate) abs: RefCell<AbsState>,
    pub(crate) mt: RefCell<MtState>,
    pub(crate) is_mt: bool,
    pub(crate) lid_reliability: SwitchReliability,
    pub(crate) dispatch: RefCell<Option<Box<dyn DeviceDispatch>>>,
    pub(crate) source: Cell<Option<SourceId>>,
    seat: Seat,
    pub(crate) listeners: RefCell<Vec<KeyListener>>,
    /// Pressed-key bookkeeping for SYN_DROPPED recovery.
    key_state: RefCell<[u8; bits_len(codes::KEY_MAX)]>,
    sw_state: RefCell<[u8; bits_len(codes::SW_MAX)]>,
    syncing: Cell<bool>,
    converter: RefCell<Option<SlotConverter>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("sysname", &self.inner.sysname)
            .field("devname", &self.inner.devname)
            .finish()
    }
}

/// An input device.
///
/// The handle is reference counted; events keep their originating device
/// alive until they are dropped, even after the device was removed from the
/// context.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Rc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Device) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl Device {
    /// The kernel sysname, e.g. `event3`.
    pub fn sysname(&self) -> &str {
        &self.inner.sysname
    }

    /// The human readable device name as reported by the kernel.
    pub fn name(&self) -> &str {
        &self.inner.devname
    }

    /// The device node path.
    pub fn devnode(&self) -> &Path {
        &self.inner.devnode
    }

    /// The name of the output this device is mapped to, if any.
    pub fn output_name(&self) -> Option<String> {
        self.inner.output_name.borrow().clone()
    }

    /// The seat this device belongs to.
    pub fn seat(&self) -> &Seat {
        &self.inner.seat
    }

    /// The vendor id of the device.
    pub fn vendor_id(&self) -> u16 {
        self.inner.id.vendor
    }

    /// The product id of the device.
    pub fn product_id(&self) -> u16 {
        self.inner.id.product
    }

    /// Whether the device exposes the given capability.
    pub fn has_capability(&self, capability: DeviceCapability) -> bool {
        let caps = self.inner.seat_caps.get();
        match capability {
            DeviceCapability::Pointer => caps.contains(SeatCaps::POINTER),
            DeviceCapability::Keyboard => caps.contains(SeatCaps::KEYBOARD),
            DeviceCapability::Touch => caps.contains(SeatCaps::TOUCH),
            DeviceCapability::Switch => caps.contains(SeatCaps::SWITCH),
            DeviceCapability::TabletTool => caps.contains(SeatCaps::TABLET_TOOL),
        }
    }

    /// Updates the LEDs on the device, if any.
    pub fn led_update(&self, leds: Leds) {
        const MAP: [(Leds, u16); 3] = [
            (Leds::NUM_LOCK, codes::LED_NUML),
            (Leds::CAPS_LOCK, codes::LED_CAPSL),
            (Leds::SCROLL_LOCK, codes::LED_SCROLLL),
        ];

        if !self.inner.caps.get().contains(DeviceCaps::KEYBOARD) {
            return;
        }

        let mut events = [InputEvent::synthesized(0, 0, 0, 0); 4];
        for (event, (led, code)) in events.iter_mut().zip(MAP) {
            *event = InputEvent::synthesized(0, codes::EV_LED, code, i32::from(leds.contains(led)));
        }
        events[3] = InputEvent::synthesized(0, codes::EV_SYN, codes::SYN_REPORT, 0);

        let bytes = unsafe {
            std::slice::from_raw_parts(events.as_ptr() as *const u8, events.len() * EVENT_SIZE)
        };
        // The kernel either applies the state or it does not; there is
        // nothing sensible to do about a failed write here.
        let _ = rustix::io::write(unsafe { BorrowedFd::borrow_raw(self.inner.fd) }, bytes);
    }

    /// Returns the bitmask of keys currently pressed on the device.
    pub fn keys(&self) -> io::Result<Vec<u8>> {
        let mut keys = vec![0u8; bits_len(codes::KEY_MAX)];
        evdev::query_keys(self.inner.fd, &mut keys).map_err(io::Error::from)?;
        Ok(keys)
    }

    /// Installs a calibration matrix, applied to absolute coordinates
    /// before scaling. The matrix is the top two rows `[a b c d e f]` of a
    /// 3x3 affine transform.
    pub fn calibrate(&self, calibration: [f32; 6]) {
        let mut abs = self.inner.abs.borrow_mut();
        abs.calibration = calibration;
        abs.apply_calibration = true;
    }

    /// Adjusts the pointer acceleration speed in `[-1, 1]`.
    ///
    /// Returns `false` when the device has no acceleration filter.
    pub fn config_set_accel_speed(&self, speed: f64) -> bool {
        let mut dispatch = self.inner.dispatch.borrow_mut();
        match dispatch
            .as_mut()
            .and_then(|d| d.downcast_mut::<touchpad::TouchpadDispatch>())
        {
            Some(touchpad) => {
                touchpad.filter.set_speed(speed.clamp(-1.0, 1.0));
                true
            }
            None => false,
        }
    }

    pub(crate) fn bustype(&self) -> u16 {
        self.inner.id.bustype
    }
}

/// Probe rejection classes; all are logged-and-skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// ABS_WHEEL/ABS_GAS/ABS_BRAKE/ABS_HAT0X present.
    Joystick,
    /// Absolute axes without keys and without multi-touch.
    Accelerometer,
    /// Nothing the engine can decode.
    NoCapabilities,
}

/// Which dispatch behavior a device gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    Fallback,
    Touchpad,
    Tablet,
    LidSwitch,
}

/// Kernel capability bits, as filled by `EVIOCGBIT`.
#[derive(Debug, Clone)]
pub(crate) struct EvdevBits {
    pub ev: [u8; bits_len(codes::EV_MAX)],
    pub abs: [u8; bits_len(codes::ABS_MAX)],
    pub rel: [u8; bits_len(codes::REL_MAX)],
    pub key: [u8; bits_len(codes::KEY_MAX)],
    pub sw: [u8; bits_len(codes::SW_MAX)],
}

impl Default for EvdevBits {
    fn default() -> EvdevBits {
        EvdevBits {
            ev: [0; bits_len(codes::EV_MAX)],
            abs: [0; bits_len(codes::ABS_MAX)],
            rel: [0; bits_len(codes::REL_MAX)],
            key: [0; bits_len(codes::KEY_MAX)],
            sw: [0; bits_len(codes::SW_MAX)],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Classification {
    pub caps: DeviceCaps,
    pub is_mt: bool,
    pub has_mt_slot: bool,
    pub kind: Option<DispatchKind>,
}

/// Derives capabilities and the dispatch selection from the kernel bits.
pub(crate) fn classify(bits: &EvdevBits) -> Result<Classification, Rejection> {
    use crate::evdev::bit_is_set;

    let mut out = Classification::default();
    let mut has_key = false;
    let has_abs = bit_is_set(&bits.ev, codes::EV_ABS as usize);

    if has_abs {
        if bit_is_set(&bits.abs, codes::ABS_WHEEL as usize)
            || bit_is_set(&bits.abs, codes::ABS_GAS as usize)
            || bit_is_set(&bits.abs, codes::ABS_BRAKE as usize)
            || bit_is_set(&bits.abs, codes::ABS_HAT0X as usize)
        {
            return Err(Rejection::Joystick);
        }

        if bit_is_set(&bits.abs, codes::ABS_X as usize) || bit_is_set(&bits.abs, codes::ABS_Y as usize) {
            out.caps |= DeviceCaps::MOTION_ABS;
        }

        // Only the slotted protocol B is decoded natively. Devices with
        // ABS_MT_POSITION_* but no ABS_MT_SLOT go through the slot
        // converter.
        if bit_is_set(&bits.abs, codes::ABS_MT_POSITION_X as usize)
            && bit_is_set(&bits.abs, codes::ABS_MT_POSITION_Y as usize)
        {
            out.is_mt = true;
            out.caps |= DeviceCaps::TOUCH;
            out.has_mt_slot = bit_is_set(&bits.abs, codes::ABS_MT_SLOT as usize);
        }
    }

    if bit_is_set(&bits.ev, codes::EV_REL as usize)
        && (bit_is_set(&bits.rel, codes::REL_X as usize) || bit_is_set(&bits.rel, codes::REL_Y as usize))
    {
        out.caps |= DeviceCaps::MOTION_REL;
    }

    if bit_is_set(&bits.ev, codes::EV_KEY as usize) {
        has_key = true;

        if has_abs {
            if bit_is_set(&bits.key, codes::BTN_TOOL_FINGER as usize)
                && !bit_is_set(&bits.key, codes::BTN_TOOL_PEN as usize)
            {
                out.kind = Some(DispatchKind::Touchpad);
            } else if bit_is_set(&bits.key, codes::BTN_TOOL_PEN as usize) {
                out.kind = Some(DispatchKind::Tablet);
            }
        }

        for i in codes::KEY_ESC..codes::KEY_MAX {
            if (codes::BTN_MISC..codes::KEY_OK).contains(&i) {
                continue;
            }
            if bit_is_set(&bits.key, i as usize) {
                out.caps |= DeviceCaps::KEYBOARD;
                break;
            }
        }
        if bit_is_set(&bits.key, codes::BTN_TOUCH as usize) {
            out.caps |= DeviceCaps::TOUCH;
        }
        for i in codes::BTN_MISC..codes::BTN_JOYSTICK {
            if bit_is_set(&bits.key, i as usize) {
                out.caps |= DeviceCaps::BUTTON;
                out.caps &= !DeviceCaps::TOUCH;
                break;
            }
        }
    }

    if bit_is_set(&bits.ev, codes::EV_LED as usize) {
        out.caps |= DeviceCaps::KEYBOARD;
    }

    if out.kind.is_none()
        && bit_is_set(&bits.ev, codes::EV_SW as usize)
        && bit_is_set(&bits.sw, codes::SW_LID as usize)
    {
        out.kind = Some(DispatchKind::LidSwitch);
    }

    // Accelerometers expose absolute axes without any keys; there is no
    // meaningful event stream to produce for them.
    if has_abs && !has_key && !out.is_mt {
        return Err(Rejection::Accelerometer);
    }

    if out.kind.is_none() {
        if out.caps.is_empty() {
            return Err(Rejection::NoCapabilities);
        }
        out.kind = Some(DispatchKind::Fallback);
    }

    Ok(out)
}

fn seat_caps_for(classification: &Classification) -> SeatCaps {
    let mut seat_caps = SeatCaps::empty();
    match classification.kind {
        Some(DispatchKind::Tablet) => {
            seat_caps |= SeatCaps::TABLET_TOOL;
        }
        Some(DispatchKind::LidSwitch) => {
            seat_caps |= SeatCaps::SWITCH;
        }
        _ => {
            let caps = classification.caps;
            if caps.intersects(DeviceCaps::MOTION_ABS | DeviceCaps::MOTION_REL)
                && caps.contains(DeviceCaps::BUTTON)
            {
                seat_caps |= SeatCaps::POINTER;
            }
            if caps.contains(DeviceCaps::KEYBOARD) {
                seat_caps |= SeatCaps::KEYBOARD;
            }
            if caps.contains(DeviceCaps::TOUCH) {
                seat_caps |= SeatCaps::TOUCH;
            }
        }
    }
    seat_caps
}

/// Everything probing gathered about a device.
pub(crate) struct Probe {
    pub classification: Classification,
    pub range_x: AbsRange,
    pub range_y: AbsRange,
    pub mt_slot: i32,
    pub mt_slot_count: usize,
    pub devname: String,
    pub id: InputId,
    pub key_state: [u8; bits_len(codes::KEY_MAX)],
    pub sw_state: [u8; bits_len(codes::SW_MAX)],
}

/// Queries the kernel about the device behind `fd`.
pub(crate) fn probe(fd: RawFd) -> Result<Result<Probe, Rejection>, DeviceError> {
    use crate::evdev::bit_is_set;

    let mut bits = EvdevBits::default();
    evdev::query_bits(fd, 0, &mut bits.ev).map_err(DeviceError::probe)?;
    if bit_is_set(&bits.ev, codes::EV_ABS as usize) {
        evdev::query_bits(fd, codes::EV_ABS, &mut bits.abs).map_err(DeviceError::probe)?;
    }
    if bit_is_set(&bits.ev, codes::EV_REL as usize) {
        evdev::query_bits(fd, codes::EV_REL, &mut bits.rel).map_err(DeviceError::probe)?;
    }
    if bit_is_set(&bits.ev, codes::EV_KEY as usize) {
        evdev::query_bits(fd, codes::EV_KEY, &mut bits.key).map_err(DeviceError::probe)?;
    }
    if bit_is_set(&bits.ev, codes::EV_SW as usize) {
        evdev::query_bits(fd, codes::EV_SW, &mut bits.sw).map_err(DeviceError::probe)?;
    }

    let classification = match classify(&bits) {
        Ok(c) => c,
        Err(rejection) => return Ok(Err(rejection)),
    };

    let mut range_x = AbsRange::default();
    let mut range_y = AbsRange::default();
    let mut mt_slot = -1;
    let mut mt_slot_count = 0;

    if classification.caps.contains(DeviceCaps::MOTION_ABS) {
        if let Ok(info) = evdev::query_abs(fd, codes::ABS_X) {
            range_x = AbsRange {
                min: info.minimum,
                max: info.maximum,
            };
        }
        if let Ok(info) = evdev::query_abs(fd, codes::ABS_Y) {
            range_y = AbsRange {
                min: info.minimum,
                max: info.maximum,
            };
        }
    }

    if classification.is_mt {
        // The multi-touch ranges shadow the single-touch ones.
        if let Ok(info) = evdev::query_abs(fd, codes::ABS_MT_POSITION_X) {
            range_x = AbsRange {
                min: info.minimum,
                max: info.maximum,
            };
        }
        if let Ok(info) = evdev::query_abs(fd, codes::ABS_MT_POSITION_Y) {
            range_y = AbsRange {
                min: info.minimum,
                max: info.maximum,
            };
        }

        if classification.has_mt_slot {
            match evdev::query_abs(fd, codes::ABS_MT_SLOT) {
                Ok(info) => {
                    mt_slot = info.value;
                    mt_slot_count = (info.maximum + 1).max(1) as usize;
                }
                Err(err) => return Err(DeviceError::probe(err)),
            }
        } else {
            mt_slot = 0;
            mt_slot_count = mt::MAX_CONTACTS;
        }
    }

    let mut key_state = [0u8; bits_len(codes::KEY_MAX)];
    let mut sw_state = [0u8; bits_len(codes::SW_MAX)];
    let _ = evdev::query_keys(fd, &mut key_state);
    let _ = evdev::query_switches(fd, &mut sw_state);

    Ok(Ok(Probe {
        classification,
        range_x,
        range_y,
        mt_slot,
        mt_slot_count,
        devname: evdev::query_name(fd),
        id: evdev::query_id(fd),
        key_state,
        sw_state,
    }))
}

/// Errors creating a device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// Probing the kernel capability bits failed.
    #[error("failed to probe device capabilities: {0}")]
    Probe(#[source] io::Error),
    /// Registering the device fd with the multiplexer failed.
    #[error("failed to register device with the multiplexer: {0}")]
    Register(#[source] io::Error),
}

impl DeviceError {
    fn probe(err: nix::Error) -> DeviceError {
        DeviceError::Probe(io::Error::from(err))
    }
}

/// Creates a device for an already opened fd and hooks it into the context.
///
/// Returns `Ok(None)` when probing decided the device is not handled; the
/// caller still owns the fd in that case.
pub(crate) fn create_device(
    ctx: &Context,
    seat: &Seat,
    devnode: &Path,
    sysname: &str,
    fd: RawFd,
    properties: &crate::backend::DeviceProperties,
) -> Result<Option<Device>, DeviceError> {
    let probe = match probe(fd)? {
        Ok(probe) => probe,
        Err(rejection) => {
            debug!(device = sysname, ?rejection, "ignoring input device");
            return Ok(None);
        }
    };

    let classification = probe.classification;
    let device = Device {
        inner: Rc::new(DeviceInner {
            devnode: devnode.to_owned(),
            sysname: sysname.to_owned(),
            devname: probe.devname,
            output_name: RefCell::new(properties.output_name.clone()),
            fd,
            id: probe.id,
            caps: Cell::new(classification.caps),
            seat_caps: Cell::new(seat_caps_for(&classification)),
            abs: RefCell::new(AbsState {
                range_x: probe.range_x,
                range_y: probe.range_y,
                x: Fixed::ZERO,
                y: Fixed::ZERO,
                calibration: properties.calibration.unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
                apply_calibration: properties.calibration.is_some(),
            }),
            mt: RefCell::new(MtState {
                slot: probe.mt_slot,
                slots: vec![MtSlot::default(); probe.mt_slot_count],
            }),
            is_mt: classification.is_mt,
            lid_reliability: properties.lid_reliability,
            dispatch: RefCell::new(None),
            source: Cell::new(None),
            seat: seat.clone(),
            listeners: RefCell::new(Vec::new()),
            key_state: RefCell::new(probe.key_state),
            sw_state: RefCell::new(probe.sw_state),
            syncing: Cell::new(false),
            converter: RefCell::new(if classification.is_mt && !classification.has_mt_slot {
                Some(SlotConverter::new(probe.mt_slot_count))
            } else {
                None
            }),
        }),
    };

    let dispatch = build_dispatch(ctx, &device, classification.kind.unwrap_or(DispatchKind::Fallback));
    *device.inner.dispatch.borrow_mut() = Some(dispatch);

    let source = ctx
        .poller()
        .add_fd(fd, SourceKind::Device(Rc::downgrade(&device.inner)))
        .map_err(DeviceError::Register)?;
    device.inner.source.set(Some(source));

    info!(
        device = sysname,
        name = %device.inner.devname,
        seat = seat.logical_name(),
        "new input device"
    );

    ctx.attach_device(&device);
    Ok(Some(device))
}

fn build_dispatch(ctx: &Context, device: &Device, kind: DispatchKind) -> Box<dyn DeviceDispatch> {
    match kind {
        DispatchKind::Fallback => Box::new(fallback::FallbackDispatch::new()),
        DispatchKind::Touchpad => Box::new(touchpad::TouchpadDispatch::new(ctx, device)),
        DispatchKind::Tablet => Box::new(tablet::TabletDispatch::new(device)),
        DispatchKind::LidSwitch => Box::new(lid::LidSwitchDispatch::new()),
    }
}

/// Feeds one raw event to the device's dispatch.
fn process_event(ctx: &Context, device: &Device, event: &InputEvent) {
    let time = event.time_ms();
    let mut dispatch = device.inner.dispatch.borrow_mut();
    if let Some(dispatch) = dispatch.as_mut() {
        dispatch.process(ctx, device, event, time);
    }
}

fn track_hw_state(device: &Device, event: &InputEvent) {
    match event.kind {
        codes::EV_KEY if event.value == 0 || event.value == 1 => {
            evdev::set_bit(
                &mut *device.inner.key_state.borrow_mut(),
                event.code as usize,
                event.value == 1,
            );
        }
        codes::EV_SW => {
            evdev::set_bit(
                &mut *device.inner.sw_state.borrow_mut(),
                event.code as usize,
                event.value != 0,
            );
        }
        _ => {}
    }
}

fn handle_event(ctx: &Context, device: &Device, event: &InputEvent) {
    track_hw_state(device, event);

    if event.kind == codes::EV_SYN && event.code == codes::SYN_DROPPED {
        debug!(device = device.sysname(), "SYN_DROPPED, entering sync mode");
        device.inner.syncing.set(true);
        if let Some(converter) = device.inner.converter.borrow_mut().as_mut() {
            converter.reset();
        }
        return;
    }

    if device.inner.syncing.get() {
        // Everything up to the next frame boundary belongs to the broken
        // frame and is discarded; the boundary itself triggers the replay.
        if event.kind == codes::EV_SYN && event.code == codes::SYN_REPORT {
            device.inner.syncing.set(false);
            resync_device(ctx, device);
        }
        return;
    }

    let converted = {
        let mut converter = device.inner.converter.borrow_mut();
        match converter.as_mut() {
            Some(converter) => converter.feed(event),
            None => None,
        }
    };

    match converted {
        // Protocol A: nothing surfaces until the converter flushes a
        // synthesized slotted frame at SYN_REPORT.
        Some(frame) => {
            for event in &frame {
                process_event(ctx, device, event);
            }
        }
        None if device.inner.converter.borrow().is_some() => {}
        None => process_event(ctx, device, event),
    }
}

/// Replays kernel state after a SYN_DROPPED: cancels active touches, diffs
/// the key and switch state and closes with a synthetic frame boundary so
/// the dispatch flushes cleanly.
fn resync_device(ctx: &Context, device: &Device) {
    let now = ctx.now_ms();

    let active: Vec<u32> = {
        let mut mt = device.inner.mt.borrow_mut();
        let mut active = Vec::new();
        for (idx, slot) in mt.slots.iter_mut().enumerate() {
            if slot.tracking_id >= 0 {
                active.push(idx as u32);
                slot.tracking_id = -1;
                slot.dirty = false;
            }
        }
        active
    };
    for slot in active {
        ctx.touch_notify_cancel(device, now, slot);
    }

    let mut synthesized: Vec<InputEvent> = Vec::new();

    {
        let mut keys = [0u8; bits_len(codes::KEY_MAX)];
        if evdev::query_keys(device.inner.fd, &mut keys).is_ok() {
            let tracked = *device.inner.key_state.borrow();
            for code in 0..codes::KEY_CNT {
                let is_down = evdev::bit_is_set(&keys, code);
                if is_down != evdev::bit_is_set(&tracked, code) {
                    synthesized.push(InputEvent::synthesized(
                        now,
                        codes::EV_KEY,
                        code as u16,
                        i32::from(is_down),
                    ));
                }
            }
            *device.inner.key_state.borrow_mut() = keys;
        }
    }

    {
        let mut switches = [0u8; bits_len(codes::SW_MAX)];
        if evdev::query_switches(device.inner.fd, &mut switches).is_ok() {
            let tracked = *device.inner.sw_state.borrow();
            for code in 0..codes::SW_CNT {
                let is_on = evdev::bit_is_set(&switches, code);
                if is_on != evdev::bit_is_set(&tracked, code) {
                    synthesized.push(InputEvent::synthesized(
                        now,
                        codes::EV_SW,
                        code as u16,
                        i32::from(is_on),
                    ));
                }
            }
            *device.inner.sw_state.borrow_mut() = switches;
        }
    }

    synthesized.push(InputEvent::synthesized(now, codes::EV_SYN, codes::SYN_REPORT, 0));

    for event in &synthesized {
        process_event(ctx, device, event);
    }
}

/// Reads and decodes everything available on the device fd.
///
/// Called from the multiplexer when the fd is readable. Reads until EAGAIN
/// so a host that dispatches once per frame does not accumulate input lag.
#[profiling::function]
pub(crate) fn dispatch_device(ctx: &Context, device: &Device) {
    let mut buf = [0u8; 32 * EVENT_SIZE];

    loop {
        let len = match rustix::io::read(unsafe { BorrowedFd::borrow_raw(device.inner.fd) }, &mut buf)
        {
            Ok(0) => {
                info!(device = device.sysname(), "device disappeared");
                ctx.remove_device(device, RemovalKind::Removed);
                return;
            }
            Ok(len) => len,
            Err(err) if err == Errno::AGAIN || err == Errno::INTR => return,
            Err(err) => {
                warn!(device = device.sysname(), error = %err, "read failed, removing device");
                ctx.remove_device(device, RemovalKind::Removed);
                return;
            }
        };

        if len % EVENT_SIZE != 0 {
            warn!(
                device = device.sysname(),
                len, "short read from device, removing device"
            );
            ctx.remove_device(device, RemovalKind::Removed);
            return;
        }

        for chunk in buf[..len].chunks_exact(EVENT_SIZE) {
            let event = InputEvent::from_bytes(chunk);
            handle_event(ctx, device, &event);
        }
    }
}

/// Delivers a fired touchpad timer to the device's dispatch.
pub(crate) fn dispatch_timer(ctx: &Context, device: &Device, kind: TimerKind) {
    let now = ctx.now_ms();
    let mut dispatch = device.inner.dispatch.borrow_mut();
    if let Some(touchpad) = dispatch
        .as_mut()
        .and_then(|d| d.downcast_mut::<touchpad::TouchpadDispatch>())
    {
        touchpad.handle_timer(ctx, device, kind, now);
    }
}
