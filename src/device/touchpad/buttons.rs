//! Software button handling for clickpads.
//!
//! Clickpads report every physical click as BTN_LEFT; the bottom strip of
//! the pad is split into software button areas and the finger positions at
//! click time decide which logical button the click becomes. A touch that
//! lands in the bottom strip only settles as a button touch after a short
//! timeout, so a finger passing through the strip on its way up still moves
//! the pointer.

use smallvec::SmallVec;

use super::{TpTimer, TpTouch};
use crate::context::Context;
use crate::device::Device;
use crate::evdev::{self, codes};
use crate::events::ButtonState;
use crate::source::TimerKind;

const BUTTON_TIMEOUT_MS: u32 = 200;
/// Percentage of the pad height reserved for the software button strip.
const BOTTOM_AREA_PERCENT: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TouchButtonArea {
    #[default]
    None,
    Area,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TouchButtonPhase {
    #[default]
    None,
    /// The touch sits in the main area.
    Area,
    /// The touch landed in the bottom strip but has not settled yet.
    BottomNew,
    /// The touch settled in the bottom strip.
    Bottom,
}

/// Button bookkeeping carried by each touch.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TouchButtonState {
    phase: TouchButtonPhase,
    area: TouchButtonArea,
}

#[derive(Debug)]
pub(crate) struct ButtonMachine {
    is_clickpad: bool,
    active_button: Option<u16>,
    /// Bottom strip boundary; larger y is inside the strip.
    top_edge: i32,
    /// Left edge of the right software button.
    rightbutton_left_edge: i32,
    pub(crate) timer: TpTimer,
    queued: SmallVec<[(u16, bool); 4]>,
}

impl ButtonMachine {
    pub(crate) fn new(ctx: &Context, device: &Device) -> ButtonMachine {
        let mut key_bits = [0u8; codes::KEY_CNT / 8];
        let is_clickpad = evdev::query_bits(device.inner.fd, codes::EV_KEY, &mut key_bits)
            .map(|()| {
                evdev::bit_is_set(&key_bits, codes::BTN_LEFT as usize)
                    && !evdev::bit_is_set(&key_bits, codes::BTN_RIGHT as usize)
            })
            .unwrap_or(false);

        let abs = device.inner.abs.borrow();
        let span_y = abs.range_y.max - abs.range_y.min;
        ButtonMachine {
            is_clickpad,
            active_button: None,
            top_edge: abs.range_y.max - span_y * BOTTOM_AREA_PERCENT / 100,
            rightbutton_left_edge: abs.range_x.min + (abs.range_x.max - abs.range_x.min) / 2,
            timer: TpTimer::new(ctx, device, TimerKind::Button),
            queued: SmallVec::new(),
        }
    }

    fn classify(&self, x: i32, y: i32) -> TouchButtonArea {
        if y < self.top_edge {
            TouchButtonArea::Area
        } else if x >= self.rightbutton_left_edge {
            TouchButtonArea::BottomRight
        } else {
            TouchButtonArea::BottomLeft
        }
    }

    pub(crate) fn touch_begin(&mut self, touch: &mut TpTouch, _time: u32) {
        if !self.is_clickpad {
            touch.button = TouchButtonState {
                phase: TouchButtonPhase::Area,
                area: TouchButtonArea::Area,
            };
            return;
        }

        let area = self.classify(touch.x, touch.y);
        touch.button = match area {
            TouchButtonArea::Area => TouchButtonState {
                phase: TouchButtonPhase::Area,
                area,
            },
            _ => {
                self.timer.arm(BUTTON_TIMEOUT_MS);
                TouchButtonState {
                    phase: TouchButtonPhase::BottomNew,
                    area,
                }
            }
        };
    }

    pub(crate) fn touch_motion(&mut self, touch: &mut TpTouch) {
        if touch.button.phase != TouchButtonPhase::BottomNew {
            return;
        }
        // A finger that leaves the strip before settling is a pointer
        // touch, not a button touch.
        if self.classify(touch.x, touch.y) == TouchButtonArea::Area {
            touch.button = TouchButtonState {
                phase: TouchButtonPhase::Area,
                area: TouchButtonArea::Area,
            };
        }
    }

    pub(crate) fn touch_end(&mut self, touch: &mut TpTouch) {
        touch.button = TouchButtonState::default();
    }

    pub(crate) fn handle_timeout(&mut self, touches: &mut [TpTouch], _now: u32) {
        for touch in touches {
            if touch.button.phase == TouchButtonPhase::BottomNew {
                touch.button.phase = TouchButtonPhase::Bottom;
            }
        }
    }

    /// A physical button changed state.
    pub(crate) fn process_click(&mut self, touches: &[TpTouch], code: u16, pressed: bool, _time: u32) {
        if !self.is_clickpad {
            self.queued.push((code, pressed));
            return;
        }

        if pressed {
            let in_bottom = |area| {
                touches.iter().any(|t| {
                    matches!(
                        t.button.phase,
                        TouchButtonPhase::BottomNew | TouchButtonPhase::Bottom
                    ) && t.button.area == area
                })
            };

            let button = if in_bottom(TouchButtonArea::BottomRight) {
                codes::BTN_RIGHT
            } else {
                codes::BTN_LEFT
            };
            self.active_button = Some(button);
            self.queued.push((button, true));
        } else if let Some(button) = self.active_button.take() {
            self.queued.push((button, false));
        }
    }

    pub(crate) fn flush(&mut self, ctx: &Context, device: &Device, time: u32) {
        for (button, pressed) in self.queued.drain(..) {
            ctx.pointer_notify_button(
                device,
                time,
                u32::from(button),
                ButtonState::from_pressed(pressed),
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn configure_clickpad(&mut self, top_edge: i32, rightbutton_left_edge: i32) {
        self.is_clickpad = true;
        self.top_edge = top_edge;
        self.rightbutton_left_edge = rightbutton_left_edge;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::device::test_support::{feed, TestDeviceBuilder};
    use crate::device::touchpad::TouchpadDispatch;
    use crate::device::{DeviceCaps, DispatchKind};
    use crate::events::Event;

    fn clickpad(ctx: &Context) -> Device {
        let device = TestDeviceBuilder::new()
            .kind(DispatchKind::Touchpad)
            .caps(DeviceCaps::TOUCH | DeviceCaps::BUTTON)
            .mt(5)
            .abs_range(0, 1000)
            .build(ctx);
        {
            let mut dispatch = device.inner.dispatch.borrow_mut();
            let tp = dispatch
                .as_mut()
                .unwrap()
                .downcast_mut::<TouchpadDispatch>()
                .unwrap();
            // Bottom strip below y=850, right button right of x=500.
            tp.buttons.configure_clickpad(850, 500);
        }
        ctx.drain_events();
        device
    }

    fn click_with_finger_at(ctx: &Context, device: &Device, x: i32, y: i32) -> Vec<(u32, ButtonState)> {
        feed(ctx, device, codes::EV_ABS, codes::ABS_MT_SLOT, 0, 0);
        feed(ctx, device, codes::EV_ABS, codes::ABS_MT_TRACKING_ID, 1, 0);
        feed(ctx, device, codes::EV_ABS, codes::ABS_MT_POSITION_X, x, 0);
        feed(ctx, device, codes::EV_ABS, codes::ABS_MT_POSITION_Y, y, 0);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        // Let the strip touch settle, then click.
        {
            let mut dispatch = device.inner.dispatch.borrow_mut();
            let tp = dispatch
                .as_mut()
                .unwrap()
                .downcast_mut::<TouchpadDispatch>()
                .unwrap();
            tp.handle_timer(ctx, device, TimerKind::Button, 100);
        }

        feed(ctx, device, codes::EV_KEY, codes::BTN_LEFT, 1, 150);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, 150);
        feed(ctx, device, codes::EV_KEY, codes::BTN_LEFT, 0, 250);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, 250);
        feed(ctx, device, codes::EV_ABS, codes::ABS_MT_TRACKING_ID, -1, 300);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, 300);

        std::iter::from_fn(|| ctx.next_event())
            .filter_map(|event| match event {
                Event::PointerButton(e) => Some((e.button(), e.state())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn click_in_right_strip_is_right_button() {
        let ctx = test_context((100, 100));
        let device = clickpad(&ctx);

        let events = click_with_finger_at(&ctx, &device, 900, 950);
        assert_eq!(
            events,
            vec![
                (u32::from(codes::BTN_RIGHT), ButtonState::Pressed),
                (u32::from(codes::BTN_RIGHT), ButtonState::Released),
            ]
        );
    }

    #[test]
    fn click_in_main_area_is_left_button() {
        let ctx = test_context((100, 100));
        let device = clickpad(&ctx);

        let events = click_with_finger_at(&ctx, &device, 500, 300);
        assert_eq!(
            events,
            vec![
                (u32::from(codes::BTN_LEFT), ButtonState::Pressed),
                (u32::from(codes::BTN_LEFT), ButtonState::Released),
            ]
        );
    }

    #[test]
    fn release_matches_press_even_after_finger_moves() {
        let ctx = test_context((100, 100));
        let device = clickpad(&ctx);

        // Press with the finger bottom-right, move it, then release: the
        // released button must match the pressed one.
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_SLOT, 0, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_TRACKING_ID, 1, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_X, 900, 0);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_Y, 950, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);
        {
            let mut dispatch = device.inner.dispatch.borrow_mut();
            let tp = dispatch
                .as_mut()
                .unwrap()
                .downcast_mut::<TouchpadDispatch>()
                .unwrap();
            tp.handle_timer(&ctx, &device, TimerKind::Button, 100);
        }
        feed(&ctx, &device, codes::EV_KEY, codes::BTN_LEFT, 1, 110);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 110);

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_X, 200, 150);
        feed(&ctx, &device, codes::EV_ABS, codes::ABS_MT_POSITION_Y, 200, 150);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 150);

        feed(&ctx, &device, codes::EV_KEY, codes::BTN_LEFT, 0, 200);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 200);

        let events: Vec<(u32, ButtonState)> = std::iter::from_fn(|| ctx.next_event())
            .filter_map(|event| match event {
                Event::PointerButton(e) => Some((e.button(), e.state())),
                _ => None,
            })
            .collect();
        assert_eq!(events[0], (u32::from(codes::BTN_RIGHT), ButtonState::Pressed));
        assert_eq!(
            events.last().unwrap(),
            &(u32::from(codes::BTN_RIGHT), ButtonState::Released)
        );
    }
}
