//! Logical input events delivered to the host.
//!
//! Every event carries a handle to the device it originated from. Handles
//! are reference counted, so an event stays valid after its device has been
//! unplugged and removed from the context; the device (and its seat) are
//! released once the last event referring to them is dropped.

pub(crate) mod queue;

use crate::device::Device;
use crate::seat::Seat;
use crate::utils::Fixed;

/// Logical state of a key.
///
/// Note that the logical state may not represent the physical state of the
/// key: kernel key repeats are dropped and never reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Key is released
    Released,
    /// Key is pressed
    Pressed,
}

/// Logical state of a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    /// Button is released
    Released,
    /// Button is pressed
    Pressed,
}

impl ButtonState {
    pub(crate) fn from_pressed(pressed: bool) -> ButtonState {
        if pressed {
            ButtonState::Pressed
        } else {
            ButtonState::Released
        }
    }
}

impl KeyState {
    pub(crate) fn from_pressed(pressed: bool) -> KeyState {
        if pressed {
            KeyState::Pressed
        } else {
            KeyState::Released
        }
    }
}

/// Scroll axis of a pointer axis event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerAxis {
    /// Vertical scroll
    Vertical,
    /// Horizontal scroll
    Horizontal,
}

/// A switch on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// The laptop lid switch.
    Lid,
}

/// Logical state of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Switch is off (lid open)
    Off,
    /// Switch is on (lid closed)
    On,
}

/// The tool type of a tablet event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletTool {
    /// A pen-like tool
    Pen,
    /// The eraser end of a tool
    Eraser,
    /// A paint brush tool
    Brush,
    /// A pencil tool
    Pencil,
    /// An airbrush tool
    Airbrush,
    /// A mouse puck
    Mouse,
    /// A lens cursor
    Lens,
}

/// An axis reported by a tablet tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletAxis {
    /// Absolute x position
    X = 0,
    /// Absolute y position
    Y = 1,
    /// Tip pressure
    Pressure = 2,
    /// Hover distance
    Distance = 3,
    /// Tilt around the x axis
    TiltX = 4,
    /// Tilt around the y axis
    TiltY = 5,
}

pub(crate) const TABLET_AXIS_COUNT: usize = 6;

bitflags::bitflags! {
    /// Set of tablet axes changed within one frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TabletAxes: u32 {
        /// Absolute x position
        const X = 1 << 0;
        /// Absolute y position
        const Y = 1 << 1;
        /// Tip pressure
        const PRESSURE = 1 << 2;
        /// Hover distance
        const DISTANCE = 1 << 3;
        /// Tilt around the x axis
        const TILT_X = 1 << 4;
        /// Tilt around the y axis
        const TILT_Y = 1 << 5;
    }
}

impl TabletAxis {
    pub(crate) fn flag(self) -> TabletAxes {
        TabletAxes::from_bits_truncate(1 << self as u32)
    }
}

macro_rules! event_common {
    ($ty:ty) => {
        impl $ty {
            /// The device the event originated from.
            pub fn device(&self) -> &Device {
                &self.device
            }

            /// The seat of the originating device.
            pub fn seat(&self) -> &Seat {
                self.device.seat()
            }
        }
    };
    ($ty:ty, time) => {
        event_common!($ty);
        impl $ty {
            /// The event timestamp in milliseconds.
            pub fn time(&self) -> u32 {
                self.time
            }
        }
    };
}

/// A new device was added to the context.
#[derive(Debug, Clone)]
pub struct DeviceAddedEvent {
    pub(crate) device: Device,
}
event_common!(DeviceAddedEvent);

/// A device disappeared from the context.
#[derive(Debug, Clone)]
pub struct DeviceRemovedEvent {
    pub(crate) device: Device,
}
event_common!(DeviceRemovedEvent);

/// A key changed its logical state.
#[derive(Debug, Clone)]
pub struct KeyboardKeyEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) key: u32,
    pub(crate) state: KeyState,
}
event_common!(KeyboardKeyEvent, time);

impl KeyboardKeyEvent {
    /// The key code, see `linux/input-event-codes.h`.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// The new logical key state.
    pub fn state(&self) -> KeyState {
        self.state
    }
}

/// Relative pointer motion.
#[derive(Debug, Clone)]
pub struct PointerMotionEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) dx: Fixed,
    pub(crate) dy: Fixed,
}
event_common!(PointerMotionEvent, time);

impl PointerMotionEvent {
    /// Motion along the x axis.
    pub fn dx(&self) -> Fixed {
        self.dx
    }

    /// Motion along the y axis.
    pub fn dy(&self) -> Fixed {
        self.dy
    }
}

/// Absolute pointer motion, scaled to the current screen extents.
#[derive(Debug, Clone)]
pub struct PointerMotionAbsoluteEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) x: Fixed,
    pub(crate) y: Fixed,
}
event_common!(PointerMotionAbsoluteEvent, time);

impl PointerMotionAbsoluteEvent {
    /// The absolute x coordinate.
    pub fn x(&self) -> Fixed {
        self.x
    }

    /// The absolute y coordinate.
    pub fn y(&self) -> Fixed {
        self.y
    }
}

/// A pointer button changed its logical state.
#[derive(Debug, Clone)]
pub struct PointerButtonEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) button: u32,
    pub(crate) state: ButtonState,
}
event_common!(PointerButtonEvent, time);

impl PointerButtonEvent {
    /// The button code, see `linux/input-event-codes.h`.
    pub fn button(&self) -> u32 {
        self.button
    }

    /// The new logical button state.
    pub fn state(&self) -> ButtonState {
        self.state
    }
}

/// Pointer scroll motion.
#[derive(Debug, Clone)]
pub struct PointerAxisEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) axis: PointerAxis,
    pub(crate) value: Fixed,
}
event_common!(PointerAxisEvent, time);

impl PointerAxisEvent {
    /// The scroll axis.
    pub fn axis(&self) -> PointerAxis {
        self.axis
    }

    /// The scroll amount in motion-equivalent units.
    pub fn value(&self) -> Fixed {
        self.value
    }
}

/// A new touch point appeared.
#[derive(Debug, Clone)]
pub struct TouchDownEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) slot: u32,
    pub(crate) x: Fixed,
    pub(crate) y: Fixed,
}
event_common!(TouchDownEvent, time);

impl TouchDownEvent {
    /// The slot identifying the touch point across frames.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The x coordinate, scaled to the current screen extents.
    pub fn x(&self) -> Fixed {
        self.x
    }

    /// The y coordinate, scaled to the current screen extents.
    pub fn y(&self) -> Fixed {
        self.y
    }
}

/// A touch point moved.
#[derive(Debug, Clone)]
pub struct TouchMotionEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) slot: u32,
    pub(crate) x: Fixed,
    pub(crate) y: Fixed,
}
event_common!(TouchMotionEvent, time);

impl TouchMotionEvent {
    /// The slot identifying the touch point across frames.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The x coordinate, scaled to the current screen extents.
    pub fn x(&self) -> Fixed {
        self.x
    }

    /// The y coordinate, scaled to the current screen extents.
    pub fn y(&self) -> Fixed {
        self.y
    }
}

/// A touch point was lifted.
#[derive(Debug, Clone)]
pub struct TouchUpEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) slot: u32,
}
event_common!(TouchUpEvent, time);

impl TouchUpEvent {
    /// The slot identifying the touch point across frames.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// End of a set of touch points at one device sample time.
#[derive(Debug, Clone)]
pub struct TouchFrameEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
}
event_common!(TouchFrameEvent, time);

/// A touch sequence was cancelled; all its previous events should be
/// disregarded.
#[derive(Debug, Clone)]
pub struct TouchCancelEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) slot: u32,
}
event_common!(TouchCancelEvent, time);

impl TouchCancelEvent {
    /// The slot identifying the touch point across frames.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// One or more tablet axes changed within a frame.
#[derive(Debug, Clone)]
pub struct TabletAxisEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) changed: TabletAxes,
    pub(crate) values: [f64; TABLET_AXIS_COUNT],
}
event_common!(TabletAxisEvent, time);

impl TabletAxisEvent {
    /// Whether the given axis changed in this frame.
    pub fn axis_has_changed(&self, axis: TabletAxis) -> bool {
        self.changed.contains(axis.flag())
    }

    /// The current value of the given axis, normalized to `[0, 1]` for
    /// positional axes and pressure/distance, `[-1, 1]` for tilt.
    pub fn axis_value(&self, axis: TabletAxis) -> f64 {
        self.values[axis as usize]
    }
}

/// The tool in proximity changed.
#[derive(Debug, Clone)]
pub struct TabletToolUpdateEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) tool: TabletTool,
}
event_common!(TabletToolUpdateEvent, time);

impl TabletToolUpdateEvent {
    /// The tool that came into proximity.
    pub fn tool(&self) -> TabletTool {
        self.tool
    }
}

/// The tool left proximity.
#[derive(Debug, Clone)]
pub struct TabletProximityOutEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
}
event_common!(TabletProximityOutEvent, time);

/// A tablet tool button changed its logical state.
#[derive(Debug, Clone)]
pub struct TabletButtonEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) button: u32,
    pub(crate) state: ButtonState,
}
event_common!(TabletButtonEvent, time);

impl TabletButtonEvent {
    /// The button code, see `linux/input-event-codes.h`.
    pub fn button(&self) -> u32 {
        self.button
    }

    /// The new logical button state.
    pub fn state(&self) -> ButtonState {
        self.state
    }
}

/// A switch changed its state.
#[derive(Debug, Clone)]
pub struct SwitchToggleEvent {
    pub(crate) device: Device,
    pub(crate) time: u32,
    pub(crate) switch: Switch,
    pub(crate) state: SwitchState,
}
event_common!(SwitchToggleEvent, time);

impl SwitchToggleEvent {
    /// The switch that toggled.
    pub fn switch(&self) -> Switch {
        self.switch
    }

    /// The new switch state.
    pub fn state(&self) -> SwitchState {
        self.state
    }
}

/// A logical input event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new device was added
    DeviceAdded(DeviceAddedEvent),
    /// A device was removed
    DeviceRemoved(DeviceRemovedEvent),
    /// A key changed state
    KeyboardKey(KeyboardKeyEvent),
    /// Relative pointer motion
    PointerMotion(PointerMotionEvent),
    /// Absolute pointer motion
    PointerMotionAbsolute(PointerMotionAbsoluteEvent),
    /// A pointer button changed state
    PointerButton(PointerButtonEvent),
    /// Pointer scroll motion
    PointerAxis(PointerAxisEvent),
    /// A touch point appeared
    TouchDown(TouchDownEvent),
    /// A touch point was lifted
    TouchUp(TouchUpEvent),
    /// A touch point moved
    TouchMotion(TouchMotionEvent),
    /// End of a touch frame
    TouchFrame(TouchFrameEvent),
    /// A touch sequence was cancelled
    TouchCancel(TouchCancelEvent),
    /// Tablet axes changed
    TabletAxis(TabletAxisEvent),
    /// A tablet tool came into proximity
    TabletToolUpdate(TabletToolUpdateEvent),
    /// The tablet tool left proximity
    TabletProximityOut(TabletProximityOutEvent),
    /// A tablet tool button changed state
    TabletButton(TabletButtonEvent),
    /// A switch toggled
    SwitchToggle(SwitchToggleEvent),
}

/// Discriminant of an [`Event`], as reported by
/// [`Context::peek_event_type`](crate::Context::peek_event_type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum EventType {
    DeviceAdded,
    DeviceRemoved,
    KeyboardKey,
    PointerMotion,
    PointerMotionAbsolute,
    PointerButton,
    PointerAxis,
    TouchDown,
    TouchUp,
    TouchMotion,
    TouchFrame,
    TouchCancel,
    TabletAxis,
    TabletToolUpdate,
    TabletProximityOut,
    TabletButton,
    SwitchToggle,
}

impl Event {
    /// The discriminant of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::DeviceAdded(_) => EventType::DeviceAdded,
            Event::DeviceRemoved(_) => EventType::DeviceRemoved,
            Event::KeyboardKey(_) => EventType::KeyboardKey,
            Event::PointerMotion(_) => EventType::PointerMotion,
            Event::PointerMotionAbsolute(_) => EventType::PointerMotionAbsolute,
            Event::PointerButton(_) => EventType::PointerButton,
            Event::PointerAxis(_) => EventType::PointerAxis,
            Event::TouchDown(_) => EventType::TouchDown,
            Event::TouchUp(_) => EventType::TouchUp,
            Event::TouchMotion(_) => EventType::TouchMotion,
            Event::TouchFrame(_) => EventType::TouchFrame,
            Event::TouchCancel(_) => EventType::TouchCancel,
            Event::TabletAxis(_) => EventType::TabletAxis,
            Event::TabletToolUpdate(_) => EventType::TabletToolUpdate,
            Event::TabletProximityOut(_) => EventType::TabletProximityOut,
            Event::TabletButton(_) => EventType::TabletButton,
            Event::SwitchToggle(_) => EventType::SwitchToggle,
        }
    }

    /// The device the event originated from.
    pub fn device(&self) -> &Device {
        match self {
            Event::DeviceAdded(e) => e.device(),
            Event::DeviceRemoved(e) => e.device(),
            Event::KeyboardKey(e) => e.device(),
            Event::PointerMotion(e) => e.device(),
            Event::PointerMotionAbsolute(e) => e.device(),
            Event::PointerButton(e) => e.device(),
            Event::PointerAxis(e) => e.device(),
            Event::TouchDown(e) => e.device(),
            Event::TouchUp(e) => e.device(),
            Event::TouchMotion(e) => e.device(),
            Event::TouchFrame(e) => e.device(),
            Event::TouchCancel(e) => e.device(),
            Event::TabletAxis(e) => e.device(),
            Event::TabletToolUpdate(e) => e.device(),
            Event::TabletProximityOut(e) => e.device(),
            Event::TabletButton(e) => e.device(),
            Event::SwitchToggle(e) => e.device(),
        }
    }

    /// The seat of the originating device.
    pub fn seat(&self) -> &Seat {
        self.device().seat()
    }
}
