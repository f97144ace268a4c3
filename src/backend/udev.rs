//! udev based device discovery.
//!
//! Enumerates `event*` devices in the input subsystem for one seat and
//! follows hotplug through a netlink monitor registered with the
//! multiplexer. Device properties (seat assignment, calibration, output
//! mapping, switch reliability) come from the udev database.

use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{info, warn};
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use crate::backend::{properties_from_udev, DEFAULT_SEAT};
use crate::context::Context;
use crate::device::{self, RemovalKind};
use crate::source::{SourceId, SourceKind};

pub(crate) struct UdevBackend {
    seat_id: String,
    monitor: Option<MonitorSocket>,
    monitor_source: Option<SourceId>,
}

impl std::fmt::Debug for UdevBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdevBackend")
            .field("seat_id", &self.seat_id)
            .field("monitoring", &self.monitor.is_some())
            .finish()
    }
}

impl UdevBackend {
    pub(crate) fn new(seat_id: &str) -> UdevBackend {
        UdevBackend {
            seat_id: seat_id.to_owned(),
            monitor: None,
            monitor_source: None,
        }
    }

    pub(crate) fn enable(&mut self, ctx: &Context) -> io::Result<()> {
        if self.monitor.is_some() {
            return Ok(());
        }

        let monitor = MonitorBuilder::new()?.match_subsystem("input")?.listen()?;
        let source = ctx
            .poller()
            .add_fd(monitor.as_raw_fd(), SourceKind::Monitor)?;
        self.monitor = Some(monitor);
        self.monitor_source = Some(source);

        if let Err(err) = self.add_devices(ctx) {
            self.disable(ctx);
            return Err(err);
        }

        Ok(())
    }

    pub(crate) fn disable(&mut self, ctx: &Context) {
        if let Some(source) = self.monitor_source.take() {
            ctx.poller().remove(source);
        }
        self.monitor = None;

        for device in ctx.take_devices() {
            ctx.remove_device(&device, RemovalKind::Suspended);
        }
    }

    fn add_devices(&mut self, ctx: &Context) -> io::Result<()> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("input")?;

        for device in enumerator.scan_devices()? {
            self.device_added(ctx, &device);
        }
        Ok(())
    }

    fn device_added(&mut self, ctx: &Context, udev_device: &udev::Device) {
        let sysname = udev_device.sysname().to_string_lossy().into_owned();
        if !sysname.starts_with("event") {
            return;
        }

        let device_seat = udev_device
            .property_value("ID_SEAT")
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or(DEFAULT_SEAT);
        if device_seat != self.seat_id {
            return;
        }

        let Some(devnode) = udev_device.devnode().map(Path::to_owned) else {
            return;
        };

        let properties = properties_from_udev(&sysname, udev_device);
        let seat = ctx.get_or_create_seat(&properties.seat_physical, &properties.seat_logical);

        // Non-blocking mode so the read loop can drain the fd until EAGAIN.
        let fd = match ctx.open_restricted(&devnode, libc::O_RDWR | libc::O_NONBLOCK) {
            Ok(fd) => fd,
            Err(errno) => {
                info!(path = %devnode.display(), errno, "opening input device failed");
                return;
            }
        };

        match device::create_device(ctx, &seat, &devnode, &sysname, fd, &properties) {
            Ok(Some(_)) => {}
            Ok(None) => {
                ctx.close_restricted(fd);
                info!(path = %devnode.display(), "not using input device");
            }
            Err(err) => {
                ctx.close_restricted(fd);
                info!(path = %devnode.display(), error = %err, "failed to create input device");
            }
        }
    }

    fn device_removed(&mut self, ctx: &Context, udev_device: &udev::Device) {
        let Some(devnode) = udev_device.devnode() else {
            return;
        };

        let device = ctx.find_device_by_devnode(devnode);
        if let Some(device) = device {
            info!(device = device.sysname(), path = %devnode.display(), "input device removed");
            ctx.remove_device(&device, RemovalKind::Removed);
        }
    }

    /// Drains the monitor after the multiplexer reported it readable.
    pub(crate) fn handle_monitor(&mut self, ctx: &Context) {
        let Some(monitor) = self.monitor.clone() else {
            return;
        };

        for event in monitor {
            if !event.sysname().to_string_lossy().starts_with("event") {
                continue;
            }

            match event.event_type() {
                EventType::Add => self.device_added(ctx, &event.device()),
                EventType::Remove => self.device_removed(ctx, &event.device()),
                _ => {
                    warn!(event = ?event.event_type(), "unhandled udev event");
                }
            }
        }
    }
}
