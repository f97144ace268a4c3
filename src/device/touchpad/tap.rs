//! The tap-to-click state machine.
//!
//! Taps emit button press/release pairs by finger count: one finger is a
//! left click, two a right click, three a middle click. A tap followed by a
//! touch within the timeout turns into a drag with the button held. The
//! machine goes dead on a physical button press or when the finger count
//! exceeds three, and recovers once all fingers are up.

use smallvec::SmallVec;

use super::TpTimer;
use crate::context::Context;
use crate::device::Device;
use crate::evdev::codes;
use crate::events::ButtonState;
use crate::source::TimerKind;

const TAP_TIMEOUT_MS: u32 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TapEvent {
    /// A finger went down.
    Touch,
    /// A finger went up.
    Release,
    /// A finger moved past the tap motion threshold.
    Motion,
    /// The tap timer fired.
    Timeout,
    /// A physical button was pressed.
    Button,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TapState {
    #[default]
    Idle,
    Touch,
    Hold,
    Tapped,
    Touch2,
    Touch2Hold,
    Touch3,
    Touch3Hold,
    DraggingOrDoubletap,
    Dragging,
    DraggingWait,
    Dragging2,
    /// Finger count exceeded or physical buttons interfered.
    Dead,
}

#[derive(Debug)]
pub(crate) struct TapMachine {
    state: TapState,
    fingers_down: u32,
    pub(crate) timer: TpTimer,
    pub(crate) queued: SmallVec<[TapEvent; 8]>,
}

impl TapMachine {
    pub(crate) fn new(ctx: &Context, device: &Device) -> TapMachine {
        TapMachine {
            state: TapState::Idle,
            fingers_down: 0,
            timer: TpTimer::new(ctx, device, TimerKind::Tap),
            queued: SmallVec::new(),
        }
    }

    pub(crate) fn state(&self) -> TapState {
        self.state
    }

    /// Queues an event for the frame flush.
    pub(crate) fn push(&mut self, event: TapEvent) {
        self.queued.push(event);
    }

    fn notify(&self, ctx: &Context, device: &Device, time: u32, button: u16, state: ButtonState) {
        ctx.pointer_notify_button(device, time, u32::from(button), state);
    }

    fn dead(&mut self) {
        self.state = TapState::Dead;
        self.timer.cancel();
    }

    pub(crate) fn handle(&mut self, ctx: &Context, device: &Device, event: TapEvent, time: u32) {
        use ButtonState::{Pressed, Released};
        use TapEvent as E;
        use TapState as S;

        match event {
            E::Touch => self.fingers_down += 1,
            E::Release => self.fingers_down = self.fingers_down.saturating_sub(1),
            _ => {}
        }

        match (self.state, event) {
            (S::Idle, E::Touch) => {
                self.state = S::Touch;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Idle, _) => {}

            (S::Touch, E::Touch) => {
                self.state = S::Touch2;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Touch, E::Release) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Pressed);
                self.state = S::Tapped;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Touch, E::Motion | E::Timeout) => {
                self.state = S::Hold;
                self.timer.cancel();
            }
            (S::Touch, E::Button) => self.dead(),

            (S::Hold, E::Touch) => {
                self.state = S::Touch2;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Hold, E::Release) => self.state = S::Idle,
            (S::Hold, E::Button) => self.dead(),
            (S::Hold, _) => {}

            (S::Tapped, E::Touch) => {
                self.state = S::DraggingOrDoubletap;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Tapped, E::Timeout) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.state = S::Idle;
            }
            (S::Tapped, E::Button) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.dead();
            }
            (S::Tapped, _) => {}

            (S::Touch2, E::Touch) => {
                self.state = S::Touch3;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Touch2, E::Release) => {
                self.notify(ctx, device, time, codes::BTN_RIGHT, Pressed);
                self.notify(ctx, device, time, codes::BTN_RIGHT, Released);
                self.state = S::Hold;
                self.timer.cancel();
            }
            (S::Touch2, E::Motion | E::Timeout) => {
                self.state = S::Touch2Hold;
                self.timer.cancel();
            }
            (S::Touch2, E::Button) => self.dead(),

            (S::Touch2Hold, E::Touch) => {
                self.state = S::Touch3;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Touch2Hold, E::Release) => self.state = S::Hold,
            (S::Touch2Hold, E::Button) => self.dead(),
            (S::Touch2Hold, _) => {}

            (S::Touch3, E::Touch) => self.dead(),
            (S::Touch3, E::Release) => {
                self.notify(ctx, device, time, codes::BTN_MIDDLE, Pressed);
                self.notify(ctx, device, time, codes::BTN_MIDDLE, Released);
                self.state = S::Touch2Hold;
                self.timer.cancel();
            }
            (S::Touch3, E::Motion | E::Timeout) => {
                self.state = S::Touch3Hold;
                self.timer.cancel();
            }
            (S::Touch3, E::Button) => self.dead(),

            (S::Touch3Hold, E::Touch) => self.dead(),
            (S::Touch3Hold, E::Release) => self.state = S::Touch2Hold,
            (S::Touch3Hold, E::Button) => self.dead(),
            (S::Touch3Hold, _) => {}

            (S::DraggingOrDoubletap, E::Release) => {
                // The second tap of a double tap: the button is already
                // down, cycle it so the host sees two clicks.
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.notify(ctx, device, time, codes::BTN_LEFT, Pressed);
                self.state = S::Tapped;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::DraggingOrDoubletap, E::Motion | E::Timeout) => {
                self.state = S::Dragging;
                self.timer.cancel();
            }
            (S::DraggingOrDoubletap, E::Touch) => self.state = S::Dragging2,
            (S::DraggingOrDoubletap, E::Button) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.dead();
            }

            (S::Dragging, E::Release) => {
                self.state = S::DraggingWait;
                self.timer.arm(TAP_TIMEOUT_MS);
            }
            (S::Dragging, E::Touch) => self.state = S::Dragging2,
            (S::Dragging, E::Button) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.dead();
            }
            (S::Dragging, _) => {}

            (S::DraggingWait, E::Touch) => {
                self.state = S::Dragging;
                self.timer.cancel();
            }
            (S::DraggingWait, E::Timeout) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.state = S::Idle;
            }
            (S::DraggingWait, _) => {}

            (S::Dragging2, E::Release) => self.state = S::Dragging,
            (S::Dragging2, E::Touch) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.dead();
            }
            (S::Dragging2, E::Button) => {
                self.notify(ctx, device, time, codes::BTN_LEFT, Released);
                self.dead();
            }
            (S::Dragging2, _) => {}

            (S::Dead, E::Release) => {
                if self.fingers_down == 0 {
                    self.state = S::Idle;
                }
            }
            (S::Dead, _) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::device::test_support::TestDeviceBuilder;
    use crate::device::{DeviceCaps, DispatchKind};
    use crate::events::Event;

    fn machine(ctx: &Context) -> (TapMachine, Device) {
        let device = TestDeviceBuilder::new()
            .kind(DispatchKind::Touchpad)
            .caps(DeviceCaps::TOUCH | DeviceCaps::BUTTON)
            .mt(5)
            .abs_range(0, 2000)
            .build(ctx);
        ctx.drain_events();
        (TapMachine::new(ctx, &device), device)
    }

    fn buttons(ctx: &Context) -> Vec<(u32, ButtonState)> {
        std::iter::from_fn(|| ctx.next_event())
            .filter_map(|event| match event {
                Event::PointerButton(e) => Some((e.button(), e.state())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_tap_clicks_left() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Release, 50);
        assert_eq!(tap.state(), TapState::Tapped);
        tap.handle(&ctx, &device, TapEvent::Timeout, 230);
        assert_eq!(tap.state(), TapState::Idle);

        assert_eq!(
            buttons(&ctx),
            vec![
                (u32::from(codes::BTN_LEFT), ButtonState::Pressed),
                (u32::from(codes::BTN_LEFT), ButtonState::Released),
            ]
        );
    }

    #[test]
    fn motion_cancels_tap() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Motion, 20);
        assert_eq!(tap.state(), TapState::Hold);
        tap.handle(&ctx, &device, TapEvent::Release, 50);
        assert_eq!(tap.state(), TapState::Idle);

        assert!(buttons(&ctx).is_empty());
    }

    #[test]
    fn two_finger_tap_clicks_right() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Touch, 10);
        tap.handle(&ctx, &device, TapEvent::Release, 60);
        tap.handle(&ctx, &device, TapEvent::Release, 70);

        let events = buttons(&ctx);
        assert_eq!(
            events,
            vec![
                (u32::from(codes::BTN_RIGHT), ButtonState::Pressed),
                (u32::from(codes::BTN_RIGHT), ButtonState::Released),
            ]
        );
    }

    #[test]
    fn three_finger_tap_clicks_middle() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        for t in [0, 5, 10] {
            tap.handle(&ctx, &device, TapEvent::Touch, t);
        }
        tap.handle(&ctx, &device, TapEvent::Release, 50);

        let events = buttons(&ctx);
        assert_eq!(events[0], (u32::from(codes::BTN_MIDDLE), ButtonState::Pressed));
        assert_eq!(events[1], (u32::from(codes::BTN_MIDDLE), ButtonState::Released));
    }

    #[test]
    fn tap_then_touch_drags() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Release, 40);
        tap.handle(&ctx, &device, TapEvent::Touch, 90);
        tap.handle(&ctx, &device, TapEvent::Motion, 120);
        assert_eq!(tap.state(), TapState::Dragging);

        // The button stays pressed while dragging.
        assert_eq!(
            buttons(&ctx),
            vec![(u32::from(codes::BTN_LEFT), ButtonState::Pressed)]
        );

        tap.handle(&ctx, &device, TapEvent::Release, 300);
        tap.handle(&ctx, &device, TapEvent::Timeout, 500);
        assert_eq!(tap.state(), TapState::Idle);
        assert_eq!(
            buttons(&ctx),
            vec![(u32::from(codes::BTN_LEFT), ButtonState::Released)]
        );
    }

    #[test]
    fn double_tap_clicks_twice() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Release, 30);
        tap.handle(&ctx, &device, TapEvent::Touch, 60);
        tap.handle(&ctx, &device, TapEvent::Release, 90);
        tap.handle(&ctx, &device, TapEvent::Timeout, 280);

        use ButtonState::{Pressed, Released};
        let left = u32::from(codes::BTN_LEFT);
        assert_eq!(
            buttons(&ctx),
            vec![
                (left, Pressed),
                (left, Released),
                (left, Pressed),
                (left, Released)
            ]
        );
    }

    #[test]
    fn physical_button_kills_machine_until_fingers_up() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        tap.handle(&ctx, &device, TapEvent::Touch, 0);
        tap.handle(&ctx, &device, TapEvent::Button, 10);
        assert_eq!(tap.state(), TapState::Dead);
        tap.handle(&ctx, &device, TapEvent::Release, 50);
        assert_eq!(tap.state(), TapState::Idle);

        assert!(buttons(&ctx).is_empty());
    }

    #[test]
    fn four_fingers_kill_machine() {
        let ctx = test_context((100, 100));
        let (mut tap, device) = machine(&ctx);

        for t in [0, 5, 10, 15] {
            tap.handle(&ctx, &device, TapEvent::Touch, t);
        }
        assert_eq!(tap.state(), TapState::Dead);

        for t in [20, 25, 30, 35] {
            tap.handle(&ctx, &device, TapEvent::Release, t);
        }
        assert_eq!(tap.state(), TapState::Idle);
    }
}
