//! The fallback dispatch: mice, keyboards and absolute touchscreens.
//!
//! Kernel events within one frame are coalesced into at most one pending
//! event per semantic kind; the frame boundary (`EV_SYN SYN_REPORT`)
//! flushes it. Interleaving a different kind flushes the previous pending
//! event first, so relative ordering between e.g. motion and wheel events
//! within a frame is preserved.

use tracing::warn;

use crate::context::Context;
use crate::device::{Device, DeviceCaps, DeviceDispatch};
use crate::evdev::{codes, InputEvent};
use crate::events::{ButtonState, KeyState, PointerAxis};
use crate::utils::Fixed;

const DEFAULT_AXIS_STEP_DISTANCE: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum PendingEvent {
    #[default]
    None,
    RelativeMotion,
    AbsoluteMotion,
    AbsoluteTouchDown,
    AbsoluteTouchUp,
    MtDown,
    MtMotion,
    MtUp,
}

#[derive(Debug, Default)]
pub(crate) struct FallbackDispatch {
    pending: PendingEvent,
    dx: Fixed,
    dy: Fixed,
}

impl FallbackDispatch {
    pub(crate) fn new() -> FallbackDispatch {
        FallbackDispatch::default()
    }

    fn flush_pending(&mut self, ctx: &Context, device: &Device, time: u32) {
        let slot = device.inner.mt.borrow().slot.max(0) as u32;

        match std::mem::take(&mut self.pending) {
            PendingEvent::None => {}
            PendingEvent::RelativeMotion => {
                ctx.pointer_notify_motion(device, time, self.dx, self.dy);
                self.dx = Fixed::ZERO;
                self.dy = Fixed::ZERO;
            }
            PendingEvent::MtDown => {
                let (x, y) = transform_absolute_mt(device, slot as usize);
                ctx.touch_notify_down(device, time, slot, x, y);
                clear_slot_dirty(device, slot as usize);
            }
            PendingEvent::MtMotion => {
                let (x, y) = transform_absolute_mt(device, slot as usize);
                ctx.touch_notify_motion(device, time, slot, x, y);
                clear_slot_dirty(device, slot as usize);
            }
            PendingEvent::MtUp => {
                ctx.touch_notify_up(device, time, slot);
            }
            PendingEvent::AbsoluteTouchDown => {
                let (x, y) = transform_absolute(device);
                ctx.touch_notify_down(device, time, 0, x, y);
            }
            PendingEvent::AbsoluteMotion => {
                let (x, y) = transform_absolute(device);
                if device.inner.caps.get().contains(DeviceCaps::TOUCH) {
                    ctx.touch_notify_motion(device, time, 0, x, y);
                } else {
                    ctx.pointer_notify_motion_absolute(device, time, x, y);
                }
            }
            PendingEvent::AbsoluteTouchUp => {
                ctx.touch_notify_up(device, time, 0);
            }
        }
    }

    fn process_relative(&mut self, ctx: &Context, device: &Device, e: &InputEvent, time: u32) {
        match e.code {
            codes::REL_X => {
                if self.pending != PendingEvent::RelativeMotion {
                    self.flush_pending(ctx, device, time);
                }
                self.dx += Fixed::from_int(e.value);
                self.pending = PendingEvent::RelativeMotion;
            }
            codes::REL_Y => {
                if self.pending != PendingEvent::RelativeMotion {
                    self.flush_pending(ctx, device, time);
                }
                self.dy += Fixed::from_int(e.value);
                self.pending = PendingEvent::RelativeMotion;
            }
            codes::REL_WHEEL => {
                self.flush_pending(ctx, device, time);
                if e.value == 1 || e.value == -1 {
                    ctx.pointer_notify_axis(
                        device,
                        time,
                        PointerAxis::Vertical,
                        Fixed::from_int(-e.value * DEFAULT_AXIS_STEP_DISTANCE),
                    );
                }
            }
            codes::REL_HWHEEL => {
                self.flush_pending(ctx, device, time);
                if e.value == 1 || e.value == -1 {
                    ctx.pointer_notify_axis(
                        device,
                        time,
                        PointerAxis::Horizontal,
                        Fixed::from_int(e.value * DEFAULT_AXIS_STEP_DISTANCE),
                    );
                }
            }
            _ => {}
        }
    }

    fn process_touch(&mut self, ctx: &Context, device: &Device, e: &InputEvent, time: u32) {
        let (screen_width, screen_height) = ctx.screen_dimensions(device);

        match e.code {
            codes::ABS_MT_SLOT => {
                self.flush_pending(ctx, device, time);
                let mut mt = device.inner.mt.borrow_mut();
                if e.value < 0 || e.value as usize >= mt.slots.len() {
                    warn!(
                        device = device.sysname(),
                        slot = e.value,
                        "slot index out of range"
                    );
                } else {
                    mt.slot = e.value;
                }
            }
            codes::ABS_MT_TRACKING_ID => {
                if self.pending != PendingEvent::None && self.pending != PendingEvent::MtMotion {
                    self.flush_pending(ctx, device, time);
                }
                let mut mt = device.inner.mt.borrow_mut();
                let slot = mt.slot.max(0) as usize;
                if e.value >= 0 {
                    self.pending = PendingEvent::MtDown;
                    if let Some(slot) = mt.slots.get_mut(slot) {
                        slot.tracking_id = e.value;
                    }
                } else {
                    self.pending = PendingEvent::MtUp;
                    if let Some(slot) = mt.slots.get_mut(slot) {
                        slot.tracking_id = -1;
                    }
                }
            }
            codes::ABS_MT_POSITION_X => {
                let scaled = device.inner.abs.borrow().range_x.scale(e.value, screen_width);
                let mut mt = device.inner.mt.borrow_mut();
                let slot = mt.slot.max(0) as usize;
                if let Some(slot) = mt.slots.get_mut(slot) {
                    slot.x = scaled;
                    slot.dirty = true;
                }
                if self.pending == PendingEvent::None {
                    self.pending = PendingEvent::MtMotion;
                }
            }
            codes::ABS_MT_POSITION_Y => {
                let scaled = device.inner.abs.borrow().range_y.scale(e.value, screen_height);
                let mut mt = device.inner.mt.borrow_mut();
                let slot = mt.slot.max(0) as usize;
                if let Some(slot) = mt.slots.get_mut(slot) {
                    slot.y = scaled;
                    slot.dirty = true;
                }
                if self.pending == PendingEvent::None {
                    self.pending = PendingEvent::MtMotion;
                }
            }
            _ => {}
        }
    }

    fn process_absolute_motion(&mut self, ctx: &Context, device: &Device, e: &InputEvent) {
        let (screen_width, screen_height) = ctx.screen_dimensions(device);

        match e.code {
            codes::ABS_X => {
                let mut abs = device.inner.abs.borrow_mut();
                abs.x = abs.range_x.scale(e.value, screen_width);
                if self.pending == PendingEvent::None {
                    self.pending = PendingEvent::AbsoluteMotion;
                }
            }
            codes::ABS_Y => {
                let mut abs = device.inner.abs.borrow_mut();
                abs.y = abs.range_y.scale(e.value, screen_height);
                if self.pending == PendingEvent::None {
                    self.pending = PendingEvent::AbsoluteMotion;
                }
            }
            _ => {}
        }
    }

    fn process_touch_button(&mut self, ctx: &Context, device: &Device, value: i32, time: u32) {
        if self.pending != PendingEvent::None && self.pending != PendingEvent::AbsoluteMotion {
            self.flush_pending(ctx, device, time);
        }

        self.pending = if value != 0 {
            PendingEvent::AbsoluteTouchDown
        } else {
            PendingEvent::AbsoluteTouchUp
        };
    }

    fn process_key(&mut self, ctx: &Context, device: &Device, e: &InputEvent, time: u32) {
        // Kernel key repeat carries no state change.
        if e.value == 2 {
            return;
        }

        if e.code == codes::BTN_TOUCH {
            if !device.inner.is_mt {
                self.process_touch_button(ctx, device, e.value, time);
            }
            return;
        }

        self.flush_pending(ctx, device, time);

        match e.code {
            codes::BTN_LEFT..=codes::BTN_TASK => {
                ctx.pointer_notify_button(
                    device,
                    time,
                    u32::from(e.code),
                    ButtonState::from_pressed(e.value != 0),
                );
            }
            _ => {
                ctx.keyboard_notify_key(
                    device,
                    time,
                    u32::from(e.code),
                    KeyState::from_pressed(e.value != 0),
                );
            }
        }
    }
}

impl DeviceDispatch for FallbackDispatch {
    fn process(&mut self, ctx: &Context, device: &Device, event: &InputEvent, time: u32) {
        match event.kind {
            codes::EV_REL => self.process_relative(ctx, device, event, time),
            codes::EV_ABS => {
                if device.inner.is_mt {
                    self.process_touch(ctx, device, event, time);
                } else {
                    self.process_absolute_motion(ctx, device, event);
                }
            }
            codes::EV_KEY => self.process_key(ctx, device, event, time),
            codes::EV_SYN if event.code == codes::SYN_REPORT => {
                self.flush_pending(ctx, device, time);
            }
            _ => {}
        }
    }
}

fn clear_slot_dirty(device: &Device, slot: usize) {
    if let Some(slot) = device.inner.mt.borrow_mut().slots.get_mut(slot) {
        slot.dirty = false;
    }
}

/// Applies the calibration matrix `x' = a·x + b·y + c`, `y' = d·x + e·y + f`
/// in floating point.
fn calibrate(calibration: &[f32; 6], x: Fixed, y: Fixed) -> (Fixed, Fixed) {
    let (x, y) = (x.to_double(), y.to_double());
    let cal = calibration.map(f64::from);
    let cx = x * cal[0] + y * cal[1] + cal[2];
    let cy = x * cal[3] + y * cal[4] + cal[5];
    (Fixed::from_double(cx), Fixed::from_double(cy))
}

fn transform_absolute(device: &Device) -> (Fixed, Fixed) {
    let abs = device.inner.abs.borrow();
    if !abs.apply_calibration {
        return (abs.x, abs.y);
    }
    calibrate(&abs.calibration, abs.x, abs.y)
}

fn transform_absolute_mt(device: &Device, slot: usize) -> (Fixed, Fixed) {
    let mt = device.inner.mt.borrow();
    let (x, y) = match mt.slots.get(slot) {
        Some(slot) => (slot.x, slot.y),
        None => return (Fixed::ZERO, Fixed::ZERO),
    };

    let abs = device.inner.abs.borrow();
    if !abs.apply_calibration {
        return (x, y);
    }
    calibrate(&abs.calibration, x, y)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::device::test_support::{feed, TestDeviceBuilder};
    use crate::device::DeviceCaps;
    use crate::events::{Event, EventType};

    #[test]
    fn relative_motion_and_wheel() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_REL | DeviceCaps::BUTTON)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_REL, codes::REL_X, 5, 10);
        feed(&ctx, &device, codes::EV_REL, codes::REL_Y, -3, 10);
        feed(&ctx, &device, codes::EV_REL, codes::REL_WHEEL, 1, 10);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 10);

        match ctx.next_event().unwrap() {
            Event::PointerMotion(e) => {
                assert_eq!(e.dx().into_raw(), 5 << 8);
                assert_eq!(e.dy().into_raw(), -3 << 8);
                assert_eq!(e.time(), 10);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        match ctx.next_event().unwrap() {
            Event::PointerAxis(e) => {
                assert_eq!(e.axis(), PointerAxis::Vertical);
                assert_eq!(e.value().into_raw(), -10 << 8);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn relative_motion_accumulates_within_frame() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new().caps(DeviceCaps::MOTION_REL).build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_REL, codes::REL_X, 2, 0);
        feed(&ctx, &device, codes::EV_REL, codes::REL_X, 3, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        match ctx.next_event().unwrap() {
            Event::PointerMotion(e) => assert_eq!(e.dx(), Fixed::from_int(5)),
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn absolute_motion_scales_to_screen() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_ABS | DeviceCaps::BUTTON)
            .abs_range(0, 1024)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_X, 512, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_Y, 0, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        match ctx.next_event().unwrap() {
            Event::PointerMotionAbsolute(e) => {
                assert_eq!(e.x().into_raw(), 50 << 8);
                assert_eq!(e.y().into_raw(), 0);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }

    #[test]
    fn mt_down_motion_up() {
        let ctx = test_context((200, 200));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::TOUCH)
            .mt(5)
            .abs_range(0, 1000)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_SLOT, 0, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_TRACKING_ID, 77, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_X, 0, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_Y, 0, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_X, 500, 1);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 1);

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_TRACKING_ID, -1, 2);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 2);

        match ctx.next_event().unwrap() {
            Event::TouchDown(e) => {
                assert_eq!(e.slot(), 0);
                assert_eq!(e.x(), Fixed::ZERO);
                assert_eq!(e.y(), Fixed::ZERO);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        match ctx.next_event().unwrap() {
            Event::TouchMotion(e) => {
                assert_eq!(e.slot(), 0);
                assert_eq!(e.x(), Fixed::from_int(100));
                assert_eq!(e.y(), Fixed::ZERO);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        match ctx.next_event().unwrap() {
            Event::TouchUp(e) => assert_eq!(e.slot(), 0),
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn kernel_key_repeat_is_dropped() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new().caps(DeviceCaps::KEYBOARD).build(&ctx);
        ctx.drain_events();

        for value in [1, 2, 0] {
            feed(&ctx, &device, codes::EV_KEY, 30, value, 0);
            feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);
        }

        let states: Vec<KeyState> = std::iter::from_fn(|| ctx.next_event())
            .map(|event| match event {
                Event::KeyboardKey(e) => e.state(),
                other => panic!("unexpected event {:?}", other.event_type()),
            })
            .collect();
        assert_eq!(states, vec![KeyState::Pressed, KeyState::Released]);
    }

    #[test]
    fn mouse_buttons_are_pointer_buttons() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_REL | DeviceCaps::BUTTON)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_KEY, codes::BTN_LEFT, 1, 5);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 5);

        match ctx.next_event().unwrap() {
            Event::PointerButton(e) => {
                assert_eq!(e.button(), u32::from(codes::BTN_LEFT));
                assert_eq!(e.state(), ButtonState::Pressed);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }

    #[test]
    fn button_interleaved_with_motion_flushes_motion_first() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_REL | DeviceCaps::BUTTON)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_REL, codes::REL_X, 4, 0);
        feed(&ctx, &device, codes::EV_KEY, codes::BTN_LEFT, 1, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        assert_eq!(ctx.peek_event_type(), Some(EventType::PointerMotion));
        ctx.next_event();
        assert_eq!(ctx.peek_event_type(), Some(EventType::PointerButton));
    }

    #[test]
    fn identity_calibration_is_transparent() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_ABS | DeviceCaps::BUTTON)
            .abs_range(0, 100)
            .calibration([1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_X, 37, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_Y, 73, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        match ctx.next_event().unwrap() {
            Event::PointerMotionAbsolute(e) => {
                assert_eq!(e.x(), Fixed::from_int(37));
                assert_eq!(e.y(), Fixed::from_int(73));
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }

    #[test]
    fn calibration_offsets_apply_per_axis() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_ABS | DeviceCaps::BUTTON)
            .abs_range(0, 100)
            .calibration([1.0, 0.0, 10.0, 0.0, 1.0, -5.0])
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_X, 20, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_Y, 20, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        match ctx.next_event().unwrap() {
            Event::PointerMotionAbsolute(e) => {
                assert_eq!(e.x(), Fixed::from_int(30));
                assert_eq!(e.y(), Fixed::from_int(15));
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }

    #[test]
    fn non_mt_touch_uses_btn_touch() {
        let ctx = test_context((100, 100));
        let device = TestDeviceBuilder::new()
            .caps(DeviceCaps::MOTION_ABS | DeviceCaps::TOUCH)
            .abs_range(0, 100)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_KEY, codes::BTN_TOUCH, 1, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_X, 50, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_Y, 50, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        feed(&ctx, &device, codes::EV_KEY, codes::BTN_TOUCH, 0, 1);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 1);

        assert_eq!(ctx.peek_event_type(), Some(EventType::TouchDown));
        ctx.next_event();
        assert_eq!(ctx.peek_event_type(), Some(EventType::TouchUp));
    }
}
