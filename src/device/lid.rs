//! The lid switch dispatch.
//!
//! Tracks `SW_LID` and pairs with a keyboard on the same seat. While the
//! lid is closed a listener sits on the paired keyboard; the first key event
//! forces the lid back open. This covers laptops whose switch sticks in the
//! closed position: touching the keyboard proves the lid cannot be closed.

use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::context::Context;
use crate::device::{Device, DeviceCaps, DeviceDispatch, DeviceInner, KeyListener};
use crate::evdev::{self, codes, InputEvent};
use crate::events::{Switch, SwitchState};

/// How trustworthy a lid switch's state is, from the
/// `LIBINPUT_ATTR_LID_SWITCH_RELIABILITY` device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SwitchReliability {
    /// The switch state cannot be trusted at startup; assume open and only
    /// react to future transitions.
    #[default]
    Unknown,
    /// The kernel state reflects reality and is synced at device add.
    Reliable,
}

impl SwitchReliability {
    /// Parses the property value; unrecognized values log a warning and
    /// fall back to [`SwitchReliability::Unknown`].
    pub(crate) fn from_property(device: &str, value: Option<&str>) -> SwitchReliability {
        match value {
            None | Some("unknown") => SwitchReliability::Unknown,
            Some("reliable") => SwitchReliability::Reliable,
            Some(other) => {
                warn!(device, value = other, "switch reliability set to unknown value");
                SwitchReliability::Unknown
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct LidSwitchDispatch {
    lid_is_closed: bool,
    paired_keyboard: Option<Weak<DeviceInner>>,
    listener_installed: bool,
}

impl LidSwitchDispatch {
    pub(crate) fn new() -> LidSwitchDispatch {
        LidSwitchDispatch {
            lid_is_closed: false,
            paired_keyboard: None,
            listener_installed: false,
        }
    }

    fn paired_keyboard(&self) -> Option<Rc<DeviceInner>> {
        self.paired_keyboard.as_ref().and_then(Weak::upgrade)
    }

    /// Installs or removes the key listener on the paired keyboard so that
    /// it is present iff the lid is closed.
    fn toggle_keyboard_listener(&mut self, device: &Device, is_closed: bool) {
        let Some(keyboard) = self.paired_keyboard() else {
            return;
        };

        if is_closed && !self.listener_installed {
            keyboard.listeners.borrow_mut().push(KeyListener {
                lid: Rc::downgrade(&device.inner),
            });
            self.listener_installed = true;
        } else if !is_closed && self.listener_installed {
            remove_listener(&keyboard, device);
            self.listener_installed = false;
        }
    }

    fn process_switch(&mut self, ctx: &Context, device: &Device, e: &InputEvent, time: u32) {
        if e.code != codes::SW_LID {
            return;
        }

        let is_closed = e.value != 0;
        if self.lid_is_closed == is_closed {
            return;
        }

        self.toggle_keyboard_listener(device, is_closed);
        self.lid_is_closed = is_closed;

        ctx.switch_notify_toggle(
            device,
            time,
            Switch::Lid,
            if is_closed { SwitchState::On } else { SwitchState::Off },
        );
    }

    /// Called through the key listener: a key on the paired keyboard was
    /// pressed while the lid claims to be closed. Forces the lid open.
    /// Returns `true` when the listener should be removed.
    pub(crate) fn handle_paired_key(&mut self, ctx: &Context, device: &Device, time: u32) -> bool {
        if !self.lid_is_closed {
            return false;
        }

        self.lid_is_closed = false;
        self.listener_installed = false;
        ctx.switch_notify_toggle(device, time, Switch::Lid, SwitchState::Off);
        true
    }

    fn pair_keyboard(&mut self, device: &Device, keyboard: &Device) {
        if !keyboard.inner.caps.get().contains(DeviceCaps::KEYBOARD) {
            return;
        }

        // A later candidate only replaces an existing pairing if it sits on
        // the internal PS/2 bus.
        if let Some(current) = self.paired_keyboard() {
            if keyboard.bustype() != codes::BUS_I8042 {
                return;
            }
            if self.listener_installed {
                remove_listener(&current, device);
                self.listener_installed = false;
            }
        }

        self.paired_keyboard = Some(Rc::downgrade(&keyboard.inner));
        debug!(
            lid = device.sysname(),
            keyboard = keyboard.sysname(),
            "lid: keyboard paired"
        );

        if self.lid_is_closed {
            self.toggle_keyboard_listener(device, true);
        }
    }
}

fn remove_listener(keyboard: &Rc<DeviceInner>, lid: &Device) {
    keyboard
        .listeners
        .borrow_mut()
        .retain(|listener| !listener.lid.ptr_eq(&Rc::downgrade(&lid.inner)));
}

impl DeviceDispatch for LidSwitchDispatch {
    fn process(&mut self, ctx: &Context, device: &Device, event: &InputEvent, time: u32) {
        match event.kind {
            codes::EV_SW => self.process_switch(ctx, device, event, time),
            codes::EV_SYN => {}
            _ => {
                debug!(
                    device = device.sysname(),
                    kind = event.kind,
                    "unexpected event type on lid switch"
                );
            }
        }
    }

    fn device_added(&mut self, device: &Device, added: &Device) {
        self.pair_keyboard(device, added);
    }

    fn device_removed(&mut self, device: &Device, removed: &Device) {
        if let Some(paired) = self.paired_keyboard() {
            if Rc::ptr_eq(&paired, &removed.inner) {
                if self.listener_installed {
                    remove_listener(&removed.inner, device);
                    self.listener_installed = false;
                }
                self.paired_keyboard = None;
            }
        }
    }

    fn sync_initial_state(&mut self, ctx: &Context, device: &Device) {
        // A broken switch stuck in the closed position must not disable the
        // keyboard forever; only trust the initial kernel state when the
        // device is known reliable.
        let is_closed = match device.inner.lid_reliability {
            SwitchReliability::Unknown => false,
            SwitchReliability::Reliable => {
                let mut switches = [0u8; codes::SW_CNT / 8];
                evdev::query_switches(device.inner.fd, &mut switches).is_ok()
                    && evdev::bit_is_set(&switches, codes::SW_LID as usize)
            }
        };

        if is_closed {
            self.lid_is_closed = true;
            self.toggle_keyboard_listener(device, true);
            ctx.switch_notify_toggle(device, ctx.now_ms(), Switch::Lid, SwitchState::On);
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

    fn lid_and_keyboard(ctx: &Context) -> (Device, Device) {
        let keyboard = TestDeviceBuilder::new()
            .sysname("event-kbd")
            .caps(DeviceCaps::KEYBOARD)
            .build(ctx);
        let lid = TestDeviceBuilder::new()
            .sysname("event-lid")
            .kind(DispatchKind::LidSwitch)
            .build(ctx);
        ctx.drain_events();
        (lid, keyboard)
    }

    fn toggle_states(ctx: &Context) -> Vec<(SwitchState, u32)> {
        std::iter::from_fn(|| ctx.next_event())
            .filter_map(|event| match event {
                Event::SwitchToggle(e) => Some((e.state(), e.time())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn toggles_on_transitions_only() {
        let ctx = test_context((100, 100));
        let (lid, _keyboard) = lid_and_keyboard(&ctx);

        for value in [1, 1, 0, 0, 1] {
            feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, value, 10);
            feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 10);
        }

        let states: Vec<SwitchState> = toggle_states(&ctx).into_iter().map(|(s, _)| s).collect();
        assert_eq!(
            states,
            vec![SwitchState::On, SwitchState::Off, SwitchState::On]
        );
    }

    #[test]
    fn typing_on_paired_keyboard_opens_lid() {
        let ctx = test_context((100, 100));
        let (lid, keyboard) = lid_and_keyboard(&ctx);

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 1, 100);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 100);
        assert_eq!(keyboard.inner.listeners.borrow().len(), 1);

        feed(&ctx, &keyboard, codes::EV_KEY, 30, 1, 250);
        feed(&ctx, &keyboard, codes::EV_SYN, codes::SYN_REPORT, 0, 250);

        // The listener removed itself.
        assert_eq!(keyboard.inner.listeners.borrow().len(), 0);

        let toggles = toggle_states(&ctx);
        assert_eq!(toggles, vec![(SwitchState::On, 100), (SwitchState::Off, 250)]);

        // Further typing produces no more toggles.
        feed(&ctx, &keyboard, codes::EV_KEY, 31, 1, 300);
        feed(&ctx, &keyboard, codes::EV_SYN, codes::SYN_REPORT, 0, 300);
        assert!(toggle_states(&ctx).is_empty());
    }

    #[test]
    fn listener_follows_lid_state() {
        let ctx = test_context((100, 100));
        let (lid, keyboard) = lid_and_keyboard(&ctx);

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 1, 0);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 0);
        assert_eq!(keyboard.inner.listeners.borrow().len(), 1);

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 0, 1);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 1);
        assert_eq!(keyboard.inner.listeners.borrow().len(), 0);
    }

    #[test]
    fn i8042_keyboard_replaces_pairing() {
        let ctx = test_context((100, 100));
        let (lid, _usb_keyboard) = lid_and_keyboard(&ctx);

        let internal = TestDeviceBuilder::new()
            .sysname("event-internal-kbd")
            .caps(DeviceCaps::KEYBOARD)
            .bustype(codes::BUS_I8042)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 1, 0);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        // The listener sits on the internal keyboard, not the USB one.
        assert_eq!(internal.inner.listeners.borrow().len(), 1);
    }

    #[test]
    fn non_i8042_keyboard_does_not_replace_pairing() {
        let ctx = test_context((100, 100));
        let (lid, first) = lid_and_keyboard(&ctx);

        let second = TestDeviceBuilder::new()
            .sysname("event-kbd2")
            .caps(DeviceCaps::KEYBOARD)
            .build(&ctx);
        ctx.drain_events();

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 1, 0);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 0);

        assert_eq!(first.inner.listeners.borrow().len(), 1);
        assert_eq!(second.inner.listeners.borrow().len(), 0);
    }

    #[test]
    fn keyboard_removal_clears_pairing() {
        let ctx = test_context((100, 100));
        let (lid, keyboard) = lid_and_keyboard(&ctx);

        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 1, 0);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 0);
        assert_eq!(keyboard.inner.listeners.borrow().len(), 1);

        ctx.remove_device(&keyboard, crate::device::RemovalKind::Removed);
        assert_eq!(keyboard.inner.listeners.borrow().len(), 0);

        // Typing-equivalent events on the removed keyboard do nothing, and
        // the lid still reacts to its own switch.
        ctx.drain_events();
        feed(&ctx, &lid, codes::EV_SW, codes::SW_LID, 0, 5);
        feed(&ctx, &lid, codes::EV_SYN, codes::SYN_REPORT, 0, 5);
        assert_eq!(
            toggle_states(&ctx),
            vec![(SwitchState::Off, 5)]
        );
    }

    #[test]
    fn unreliable_switch_assumes_open() {
        let ctx = test_context((100, 100));
        let lid = TestDeviceBuilder::new()
            .kind(DispatchKind::LidSwitch)
            .lid_reliability(SwitchReliability::Unknown)
            .build(&ctx);

        let had_toggle = std::iter::from_fn(|| ctx.next_event())
            .any(|event| event.event_type() == EventType::SwitchToggle);
        assert!(!had_toggle);
        let _ = lid;
    }

    #[test]
    fn reliability_property_parsing() {
        assert_eq!(
            SwitchReliability::from_property("d", Some("reliable")),
            SwitchReliability::Reliable
        );
        assert_eq!(
            SwitchReliability::from_property("d", Some("unknown")),
            SwitchReliability::Unknown
        );
        assert_eq!(
            SwitchReliability::from_property("d", None),
            SwitchReliability::Unknown
        );
        assert_eq!(
            SwitchReliability::from_property("d", Some("banana")),
            SwitchReliability::Unknown
        );
    }
}
