//! The tablet tool dispatch.
//!
//! Accumulates axis updates into a changed-axis mask, reports tool
//! proximity through `BTN_TOOL_*` transitions and passes stylus buttons
//! through while a tool is in proximity. Leaving proximity releases any
//! buttons still logically pressed; a repeated proximity out is inert.

use smallvec::SmallVec;

use crate::context::Context;
use crate::device::{AbsRange, Device, DeviceDispatch};
use crate::evdev::{self, codes, InputEvent};
use crate::events::{ButtonState, TabletAxes, TabletAxis, TabletTool, TABLET_AXIS_COUNT};

/// Ranges of every axis the dispatch normalizes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TabletRanges {
    axes: [AbsRange; TABLET_AXIS_COUNT],
}

impl TabletRanges {
    fn from_fd(device: &Device) -> TabletRanges {
        let mut ranges = TabletRanges::default();
        for (axis, code) in AXIS_CODES {
            if let Ok(info) = evdev::query_abs(device.inner.fd, code) {
                ranges.axes[axis as usize] = AbsRange {
                    min: info.minimum,
                    max: info.maximum,
                };
            }
        }
        // The x/y ranges were already probed for the device itself.
        let abs = device.inner.abs.borrow();
        ranges.axes[TabletAxis::X as usize] = abs.range_x;
        ranges.axes[TabletAxis::Y as usize] = abs.range_y;
        ranges
    }
}

const AXIS_CODES: [(TabletAxis, u16); TABLET_AXIS_COUNT] = [
    (TabletAxis::X, codes::ABS_X),
    (TabletAxis::Y, codes::ABS_Y),
    (TabletAxis::Pressure, codes::ABS_PRESSURE),
    (TabletAxis::Distance, codes::ABS_DISTANCE),
    (TabletAxis::TiltX, codes::ABS_TILT_X),
    (TabletAxis::TiltY, codes::ABS_TILT_Y),
];

fn axis_for_code(code: u16) -> Option<TabletAxis> {
    AXIS_CODES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(axis, _)| *axis)
}

fn tool_for_code(code: u16) -> Option<TabletTool> {
    match code {
        codes::BTN_TOOL_PEN => Some(TabletTool::Pen),
        codes::BTN_TOOL_RUBBER => Some(TabletTool::Eraser),
        codes::BTN_TOOL_BRUSH => Some(TabletTool::Brush),
        codes::BTN_TOOL_PENCIL => Some(TabletTool::Pencil),
        codes::BTN_TOOL_AIRBRUSH => Some(TabletTool::Airbrush),
        codes::BTN_TOOL_MOUSE => Some(TabletTool::Mouse),
        codes::BTN_TOOL_LENS => Some(TabletTool::Lens),
        _ => None,
    }
}

#[derive(Debug)]
pub(crate) struct TabletDispatch {
    ranges: TabletRanges,
    in_proximity: bool,
    tool: Option<TabletTool>,
    values: [f64; TABLET_AXIS_COUNT],
    changed: TabletAxes,
    tool_update_queued: bool,
    proximity_out_queued: bool,
    button_events: SmallVec<[(u32, bool); 4]>,
    buttons_down: SmallVec<[u32; 4]>,
}

impl TabletDispatch {
    pub(crate) fn new(device: &Device) -> TabletDispatch {
        TabletDispatch {
            ranges: TabletRanges::from_fd(device),
            in_proximity: false,
            tool: None,
            values: [0.0; TABLET_AXIS_COUNT],
            changed: TabletAxes::empty(),
            tool_update_queued: false,
            proximity_out_queued: false,
            button_events: SmallVec::new(),
            buttons_down: SmallVec::new(),
        }
    }

    fn process_absolute(&mut self, e: &InputEvent) {
        let Some(axis) = axis_for_code(e.code) else {
            return;
        };

        let range = self.ranges.axes[axis as usize];
        let value = match axis {
            // Tilt is centered; report it in [-1, 1].
            TabletAxis::TiltX | TabletAxis::TiltY => range.normalize(e.value) * 2.0 - 1.0,
            _ => range.normalize(e.value),
        };

        if (self.values[axis as usize] - value).abs() > f64::EPSILON || !self.in_proximity {
            self.values[axis as usize] = value;
            self.changed |= axis.flag();
        }
    }

    fn process_key(&mut self, e: &InputEvent, _time: u32) {
        if let Some(tool) = tool_for_code(e.code) {
            if e.value != 0 {
                self.tool = Some(tool);
                self.tool_update_queued = true;
            } else {
                self.proximity_out_queued = true;
            }
            return;
        }

        match e.code {
            codes::BTN_TOUCH | codes::BTN_STYLUS | codes::BTN_STYLUS2 => {
                self.button_events.push((u32::from(e.code), e.value != 0));
            }
            _ => {}
        }
    }

    fn flush(&mut self, ctx: &Context, device: &Device, time: u32) {
        if self.tool_update_queued {
            self.tool_update_queued = false;
            if let Some(tool) = self.tool {
                self.in_proximity = true;
                ctx.tablet_notify_tool_update(device, time, tool);
            }
        }

        // The frame taking the tool out of proximity must not produce axis
        // events.
        if self.in_proximity && !self.proximity_out_queued && !self.changed.is_empty() {
            ctx.tablet_notify_axis(device, time, self.changed, self.values);
        }
        self.changed = TabletAxes::empty();

        for (button, pressed) in std::mem::take(&mut self.button_events) {
            if !self.in_proximity {
                continue;
            }
            if pressed {
                if !self.buttons_down.contains(&button) {
                    self.buttons_down.push(button);
                }
            } else {
                self.buttons_down.retain(|b| *b != button);
            }
            ctx.tablet_notify_button(device, time, button, ButtonState::from_pressed(pressed));
        }

        if self.proximity_out_queued {
            self.proximity_out_queued = false;
            if self.in_proximity {
                // Release anything still logically pressed before the tool
                // vanishes.
                for button in std::mem::take(&mut self.buttons_down) {
                    ctx.tablet_notify_button(device, time, button, ButtonState::Released);
                }
                self.in_proximity = false;
                self.tool = None;
                ctx.tablet_notify_proximity_out(device, time);
            }
        }
    }
}

impl DeviceDispatch for TabletDispatch {
    fn process(&mut self, ctx: &Context, device: &Device, event: &InputEvent, time: u32) {
        match event.kind {
            codes::EV_ABS => self.process_absolute(event),
            codes::EV_KEY => self.process_key(event, time),
            codes::EV_SYN if event.code == codes::SYN_REPORT => self.flush(ctx, device, time),
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::device::test_support::{feed, TestDeviceBuilder};
    use crate::device::DispatchKind;
    use crate::events::{Event, EventType};

    fn tablet(ctx: &Context) -> Device {
        let device = TestDeviceBuilder::new()
            .kind(DispatchKind::Tablet)
            .abs_range(0, 1000)
            .build(ctx);
        ctx.drain_events();
        device
    }

    fn proximity_in(ctx: &Context, device: &Device, x: i32, y: i32, time: u32) {
        feed(ctx, device, codes::EV_KEY, codes::BTN_TOOL_PEN, 1, time);
        feed(ctx, device, codes::EV_ABS, codes::ABS_X, x, time);
        feed(ctx, device, codes::EV_ABS, codes::ABS_Y, y, time);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, time);
    }

    fn proximity_out(ctx: &Context, device: &Device, time: u32) {
        feed(ctx, device, codes::EV_KEY, codes::BTN_TOOL_PEN, 0, time);
        feed(ctx, device, codes::EV_SYN, codes::SYN_REPORT, 0, time);
    }

    #[test]
    fn proximity_in_reports_tool_and_axes() {
        let ctx = test_context((100, 100));
        let device = tablet(&ctx);

        proximity_in(&ctx, &device, 50, 1000, 0);

        match ctx.next_event().unwrap() {
            Event::TabletToolUpdate(e) => assert_eq!(e.tool(), TabletTool::Pen),
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        match ctx.next_event().unwrap() {
            Event::TabletAxis(e) => {
                assert!(e.axis_has_changed(TabletAxis::X));
                assert!(e.axis_has_changed(TabletAxis::Y));
                assert!(e.axis_value(TabletAxis::X) < e.axis_value(TabletAxis::Y));
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn proximity_out_is_idempotent() {
        let ctx = test_context((100, 100));
        let device = tablet(&ctx);

        proximity_in(&ctx, &device, 10, 10, 0);
        ctx.drain_events();

        proximity_out(&ctx, &device, 1);
        assert_eq!(ctx.peek_event_type(), Some(EventType::TabletProximityOut));
        ctx.drain_events();

        // A second proximity out yields no duplicate events.
        proximity_out(&ctx, &device, 2);
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn proximity_out_releases_pressed_buttons() {
        let ctx = test_context((100, 100));
        let device = tablet(&ctx);

        proximity_in(&ctx, &device, 10, 10, 0);
        feed(&ctx, &device, codes::EV_KEY, codes::BTN_STYLUS, 1, 1);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 1);
        ctx.drain_events();

        proximity_out(&ctx, &device, 2);

        match ctx.next_event().unwrap() {
            Event::TabletButton(e) => {
                assert_eq!(e.button(), u32::from(codes::BTN_STYLUS));
                assert_eq!(e.state(), ButtonState::Released);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
        assert_eq!(ctx.peek_event_type(), Some(EventType::TabletProximityOut));
    }

    #[test]
    fn axis_events_only_in_proximity() {
        let ctx = test_context((100, 100));
        let device = tablet(&ctx);

        feed(&ctx, &device, codes::EV_ABS, codes::ABS_X, 700, 0);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 0);
        assert!(ctx.next_event().is_none());
    }

    #[test]
    fn stylus_button_while_in_proximity() {
        let ctx = test_context((100, 100));
        let device = tablet(&ctx);

        proximity_in(&ctx, &device, 10, 10, 0);
        ctx.drain_events();

        feed(&ctx, &device, codes::EV_KEY, codes::BTN_STYLUS, 1, 1);
        feed(&ctx, &device, codes::EV_SYN, codes::SYN_REPORT, 0, 1);

        match ctx.next_event().unwrap() {
            Event::TabletButton(e) => {
                assert_eq!(e.button(), u32::from(codes::BTN_STYLUS));
                assert_eq!(e.state(), ButtonState::Pressed);
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }
}
