//! The touchpad dispatch.
//!
//! Owns per-slot touch tracking with motion history and hysteresis, feeds
//! single-finger motion through the pointer acceleration filter, turns
//! two-finger motion into scroll events, and drives the tap and software
//! button state machines. Both machines arm timer fds that are registered
//! with the multiplexer as additional sources; their expiry is observed on
//! the next context dispatch.

pub(crate) mod buttons;
pub(crate) mod tap;

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::rc::Rc;

use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};
use tracing::warn;

use crate::context::Context;
use crate::device::{Device, DeviceDispatch};
use crate::evdev::{codes, InputEvent};
use crate::events::PointerAxis;
use crate::filter::{MotionParams, PointerAccelerator};
use crate::source::{SourceId, SourceKind, TimerKind};
use crate::utils::Fixed;

use self::buttons::ButtonMachine;
use self::tap::{TapEvent, TapMachine};

const HISTORY_LENGTH: usize = 4;
const MIN_SAMPLES: usize = 4;
/// Device units a touch may wander before it stops counting as a tap.
const TAP_MOTION_THRESHOLD: i64 = 30;

/// A timer fd registered with the context's multiplexer.
#[derive(Debug)]
pub(crate) struct TpTimer {
    timerfd: Option<OwnedFd>,
    source: Option<SourceId>,
}

impl TpTimer {
    fn new(ctx: &Context, device: &Device, kind: TimerKind) -> TpTimer {
        let timerfd = match timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::CLOEXEC | TimerfdFlags::NONBLOCK,
        ) {
            Ok(fd) => fd,
            Err(err) => {
                warn!(device = device.sysname(), error = %err, "failed to create timer");
                return TpTimer {
                    timerfd: None,
                    source: None,
                };
            }
        };

        let source = ctx
            .poller()
            .add_fd(
                timerfd.as_raw_fd(),
                SourceKind::Timer(Rc::downgrade(&device.inner), kind),
            )
            .map_err(|err| {
                warn!(device = device.sysname(), error = %err, "failed to register timer");
                err
            })
            .ok();

        TpTimer {
            timerfd: Some(timerfd),
            source,
        }
    }

    /// Arms the timer `delay_ms` from now, replacing any earlier deadline.
    pub(crate) fn arm(&self, delay_ms: u32) {
        let Some(timerfd) = &self.timerfd else { return };
        let spec = Itimerspec {
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Timespec {
                tv_sec: i64::from(delay_ms / 1000),
                tv_nsec: i64::from(delay_ms % 1000) * 1_000_000,
            },
        };
        let _ = timerfd_settime(timerfd, TimerfdTimerFlags::empty(), &spec);
    }

    pub(crate) fn cancel(&self) {
        let Some(timerfd) = &self.timerfd else { return };
        let spec = Itimerspec {
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let _ = timerfd_settime(timerfd, TimerfdTimerFlags::empty(), &spec);
    }

    fn drain(&self) {
        if let Some(timerfd) = &self.timerfd {
            let mut expirations = [0u8; 8];
            let _ = rustix::io::read(timerfd, &mut expirations);
        }
    }

    fn unregister(&mut self, ctx: &Context) {
        if let Some(source) = self.source.take() {
            ctx.poller().remove(source);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TouchState {
    #[default]
    None,
    Begin,
    Update,
    End,
}

#[derive(Debug, Clone, Copy, Default)]
struct History {
    samples: [(i32, i32); HISTORY_LENGTH],
    index: usize,
    count: usize,
}

impl History {
    fn push(&mut self, x: i32, y: i32) {
        self.samples[self.index] = (x, y);
        self.index = (self.index + 1) % HISTORY_LENGTH;
        self.count = (self.count + 1).min(HISTORY_LENGTH);
    }

    fn offset(&self, age: usize) -> (i32, i32) {
        let index = (self.index + HISTORY_LENGTH - 1 - age) % HISTORY_LENGTH;
        self.samples[index]
    }

    /// Motion estimate averaged over the retained samples; zero until
    /// enough samples arrived to smooth out jitter.
    fn delta(&self) -> (f64, f64) {
        if self.count < MIN_SAMPLES {
            return (0.0, 0.0);
        }
        let mut dx = 0.0;
        let mut dy = 0.0;
        for age in 0..HISTORY_LENGTH - 1 {
            let (nx, ny) = self.offset(age);
            let (ox, oy) = self.offset(age + 1);
            dx += f64::from(nx - ox);
            dy += f64::from(ny - oy);
        }
        (dx / (HISTORY_LENGTH - 1) as f64, dy / (HISTORY_LENGTH - 1) as f64)
    }

    fn reset(&mut self) {
        *self = History::default();
    }
}

/// One touch point on the pad.
#[derive(Debug, Default)]
pub(crate) struct TpTouch {
    pub(crate) state: TouchState,
    dirty: bool,
    pub(crate) x: i32,
    pub(crate) y: i32,
    origin: (i32, i32),
    history: History,
    hysteresis_center: (i32, i32),
    pub(crate) button: buttons::TouchButtonState,
}

impl TpTouch {
    fn is_active(&self) -> bool {
        matches!(self.state, TouchState::Begin | TouchState::Update)
    }

    fn exceeded_tap_threshold(&self) -> bool {
        let dx = i64::from(self.x - self.origin.0);
        let dy = i64::from(self.y - self.origin.1);
        dx * dx + dy * dy > TAP_MOTION_THRESHOLD * TAP_MOTION_THRESHOLD
    }
}

fn hysteresis(int_in: i32, center: i32, margin: i32) -> i32 {
    let diff = int_in - center;
    if diff.abs() <= margin {
        return center;
    }
    if diff > margin {
        center + diff - margin
    } else {
        center + diff + margin
    }
}

#[derive(Debug)]
pub(crate) struct TouchpadDispatch {
    pub(crate) filter: PointerAccelerator,
    has_mt: bool,
    slot: usize,
    touches: Vec<TpTouch>,
    nfingers_down: u32,
    fake_touches: u32,
    margin: (i32, i32),
    pub(crate) tap: TapMachine,
    pub(crate) buttons: ButtonMachine,
}

/// Bit positions in `fake_touches`.
const FAKE_TOUCH: u32 = 0;
const FAKE_FINGER: u32 = 1;
const FAKE_DOUBLE: u32 = 2;
const FAKE_TRIPLE: u32 = 3;
const FAKE_QUAD: u32 = 4;

impl TouchpadDispatch {
    pub(crate) fn new(ctx: &Context, device: &Device) -> TouchpadDispatch {
        let (ntouches, margin, has_mt) = {
            let abs = device.inner.abs.borrow();
            let mt = device.inner.mt.borrow();
            let has_mt = device.inner.is_mt && !mt.slots.is_empty();
            let ntouches = if has_mt { mt.slots.len() } else { 5 };
            // Jitter margin, 0.5% of the axis span.
            let margin = (
                ((abs.range_x.max - abs.range_x.min) / 200).max(1),
                ((abs.range_y.max - abs.range_y.min) / 200).max(1),
            );
            (ntouches, margin, has_mt)
        };

        TouchpadDispatch {
            filter: PointerAccelerator::new(),
            has_mt,
            slot: 0,
            touches: (0..ntouches).map(|_| TpTouch::default()).collect(),
            nfingers_down: 0,
            fake_touches: 0,
            margin,
            tap: TapMachine::new(ctx, device),
            buttons: ButtonMachine::new(ctx, device),
        }
    }

    fn begin_touch(&mut self, index: usize) {
        let Some(touch) = self.touches.get_mut(index) else {
            return;
        };
        if touch.is_active() {
            return;
        }
        touch.state = TouchState::Begin;
        touch.history.reset();
        self.nfingers_down += 1;
    }

    fn end_touch(&mut self, index: usize) {
        let Some(touch) = self.touches.get_mut(index) else {
            return;
        };
        if !touch.is_active() {
            return;
        }
        touch.state = TouchState::End;
        self.nfingers_down = self.nfingers_down.saturating_sub(1);
    }

    fn fake_finger_count(&self) -> u32 {
        if self.fake_touches & (1 << FAKE_QUAD) != 0 {
            4
        } else if self.fake_touches & (1 << FAKE_TRIPLE) != 0 {
            3
        } else if self.fake_touches & (1 << FAKE_DOUBLE) != 0 {
            2
        } else if self.fake_touches & ((1 << FAKE_FINGER) | (1 << FAKE_TOUCH)) != 0 {
            1
        } else {
            0
        }
    }

    fn process_fake_touch(&mut self, e: &InputEvent) {
        let bit = match e.code {
            codes::BTN_TOUCH => FAKE_TOUCH,
            codes::BTN_TOOL_FINGER => FAKE_FINGER,
            codes::BTN_TOOL_DOUBLETAP => FAKE_DOUBLE,
            codes::BTN_TOOL_TRIPLETAP => FAKE_TRIPLE,
            codes::BTN_TOOL_QUADTAP => FAKE_QUAD,
            _ => return,
        };

        if e.value != 0 {
            self.fake_touches |= 1 << bit;
        } else {
            self.fake_touches &= !(1 << bit);
        }

        // Single-touch pads derive their touch count from the tool bits.
        if !self.has_mt {
            let count = self.fake_finger_count() as usize;
            for i in 0..self.touches.len() {
                if i < count {
                    self.begin_touch(i);
                } else {
                    self.end_touch(i);
                }
            }
        }
    }

    fn process_absolute(&mut self, e: &InputEvent) {
        if self.has_mt {
            match e.code {
                codes::ABS_MT_SLOT => {
                    if e.value >= 0 && (e.value as usize) < self.touches.len() {
                        self.slot = e.value as usize;
                    }
                }
                codes::ABS_MT_TRACKING_ID => {
                    if e.value >= 0 {
                        self.begin_touch(self.slot);
                    } else {
                        self.end_touch(self.slot);
                    }
                }
                codes::ABS_MT_POSITION_X => {
                    if let Some(touch) = self.touches.get_mut(self.slot) {
                        touch.x = e.value;
                        touch.dirty = true;
                    }
                }
                codes::ABS_MT_POSITION_Y => {
                    if let Some(touch) = self.touches.get_mut(self.slot) {
                        touch.y = e.value;
                        touch.dirty = true;
                    }
                }
                _ => {}
            }
        } else {
            match e.code {
                codes::ABS_X => {
                    if let Some(touch) = self.touches.first_mut() {
                        touch.x = e.value;
                        touch.dirty = true;
                    }
                }
                codes::ABS_Y => {
                    if let Some(touch) = self.touches.first_mut() {
                        touch.y = e.value;
                        touch.dirty = true;
                    }
                }
                _ => {}
            }
        }
    }

    fn process_key(&mut self, e: &InputEvent, time: u32) {
        match e.code {
            codes::BTN_LEFT | codes::BTN_RIGHT | codes::BTN_MIDDLE => {
                self.tap.push(TapEvent::Button);
                self.buttons
                    .process_click(&self.touches, e.code, e.value != 0, time);
            }
            _ => self.process_fake_touch(e),
        }
    }

    fn process_touch_states(&mut self, time: u32) {
        let margin = self.margin;
        for touch in &mut self.touches {
            match touch.state {
                TouchState::Begin => {
                    if touch.dirty {
                        touch.origin = (touch.x, touch.y);
                        touch.hysteresis_center = (touch.x, touch.y);
                        touch.history.push(touch.x, touch.y);
                        touch.dirty = false;
                    }
                    self.buttons.touch_begin(touch, time);
                    self.tap.push(TapEvent::Touch);
                    touch.state = TouchState::Update;
                }
                TouchState::Update if touch.dirty => {
                    touch.x = hysteresis(touch.x, touch.hysteresis_center.0, margin.0);
                    touch.y = hysteresis(touch.y, touch.hysteresis_center.1, margin.1);
                    touch.hysteresis_center = (touch.x, touch.y);
                    touch.history.push(touch.x, touch.y);
                    touch.dirty = false;
                    self.buttons.touch_motion(touch);
                    if touch.exceeded_tap_threshold() {
                        self.tap.push(TapEvent::Motion);
                    }
                }
                TouchState::End => {
                    self.buttons.touch_end(touch);
                    self.tap.push(TapEvent::Release);
                    *touch = TpTouch {
                        button: std::mem::take(&mut touch.button),
                        ..TpTouch::default()
                    };
                }
                _ => {}
            }
        }
    }

    fn post_motion_events(&mut self, ctx: &Context, device: &Device, time: u32) {
        match self.nfingers_down {
            1 => {
                let Some(touch) = self.touches.iter().find(|t| t.is_active()) else {
                    return;
                };
                let (dx, dy) = touch.history.delta();
                if dx == 0.0 && dy == 0.0 {
                    return;
                }
                let mut motion = MotionParams { dx, dy };
                self.filter.filter(&mut motion, u64::from(time));
                if motion.dx != 0.0 || motion.dy != 0.0 {
                    ctx.pointer_notify_motion(
                        device,
                        time,
                        Fixed::from_double(motion.dx),
                        Fixed::from_double(motion.dy),
                    );
                }
            }
            2 => {
                // Two-finger scroll: average the finger motion and pick the
                // dominant axis.
                let mut dx = 0.0;
                let mut dy = 0.0;
                let mut active = 0;
                for touch in self.touches.iter().filter(|t| t.is_active()) {
                    let (tdx, tdy) = touch.history.delta();
                    dx += tdx;
                    dy += tdy;
                    active += 1;
                }
                if active != 2 || (dx == 0.0 && dy == 0.0) {
                    return;
                }
                dx /= 2.0;
                dy /= 2.0;
                if dy.abs() >= dx.abs() {
                    ctx.pointer_notify_axis(device, time, PointerAxis::Vertical, Fixed::from_double(dy));
                } else {
                    ctx.pointer_notify_axis(
                        device,
                        time,
                        PointerAxis::Horizontal,
                        Fixed::from_double(dx),
                    );
                }
            }
            _ => {}
        }
    }

    fn flush(&mut self, ctx: &Context, device: &Device, time: u32) {
        self.process_touch_states(time);
        self.post_motion_events(ctx, device, time);

        let queued = std::mem::take(&mut self.tap.queued);
        for event in queued {
            self.tap.handle(ctx, device, event, time);
        }

        self.buttons.flush(ctx, device, time);
    }

    /// Entry point for fired timer sources.
    pub(crate) fn handle_timer(&mut self, ctx: &Context, device: &Device, kind: TimerKind, now: u32) {
        match kind {
            TimerKind::Tap => {
                self.tap.timer.drain();
                self.tap.handle(ctx, device, TapEvent::Timeout, now);
            }
            TimerKind::Button => {
                self.buttons.timer.drain();
                self.buttons.handle_timeout(&mut self.touches, now);
            }
        }
    }

    pub(crate) fn active_fingers(&self) -> u32 {
        self.nfingers_down
    }
}

impl DeviceDispatch for TouchpadDispatch {
    fn process(&mut self, ctx: &Context, device: &Device, event: &InputEvent, time: u32) {
        match event.kind {
            codes::EV_ABS => self.process_absolute(event),
            codes::EV_KEY => self.process_key(event, time),
            codes::EV_SYN if event.code == codes::SYN_REPORT => self.flush(ctx, device, time),
            _ => {}
        }
    }

    fn destroy(&mut self, ctx: &Context) {
        self.tap.timer.unregister(ctx);
        self.buttons.timer.unregister(ctx);
    }
}
