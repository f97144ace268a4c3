//! Path based device discovery.
//!
//! Opens a fixed list of device nodes through the host interface. There is
//! no hotplug; suspend removes every device and resume re-opens the list.

use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::context::Context;
use crate::device::{self, RemovalKind};

#[derive(Debug)]
pub(crate) struct PathBackend {
    paths: Vec<PathBuf>,
}

impl PathBackend {
    pub(crate) fn new(paths: Vec<PathBuf>) -> PathBackend {
        PathBackend { paths }
    }

    pub(crate) fn enable(&mut self, ctx: &Context) -> io::Result<()> {
        let mut failed = 0usize;
        for path in &self.paths {
            if enable_device(ctx, path).is_err() {
                failed += 1;
            }
        }

        if failed > 0 {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{failed} device(s) could not be enabled"),
            ))
        } else {
            Ok(())
        }
    }

    pub(crate) fn disable(&mut self, ctx: &Context) {
        for device in ctx.take_devices() {
            ctx.remove_device(&device, RemovalKind::Suspended);
        }
    }
}

fn enable_device(ctx: &Context, devnode: &Path) -> io::Result<()> {
    let sysname = devnode
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("unknown")
        .to_owned();

    let properties = crate::backend::properties_for_devnode(&sysname);
    let seat = ctx.get_or_create_seat(&properties.seat_physical, &properties.seat_logical);

    let fd = ctx
        .open_restricted(devnode, libc::O_RDWR | libc::O_NONBLOCK)
        .map_err(|errno| {
            info!(path = %devnode.display(), errno, "opening input device failed");
            io::Error::from_raw_os_error(errno)
        })?;

    match device::create_device(ctx, &seat, devnode, &sysname, fd, &properties) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => {
            ctx.close_restricted(fd);
            info!(path = %devnode.display(), "not using input device");
            Err(io::Error::new(io::ErrorKind::Unsupported, "device not handled"))
        }
        Err(err) => {
            ctx.close_restricted(fd);
            info!(path = %devnode.display(), error = %err, "failed to create input device");
            Err(io::Error::new(io::ErrorKind::Other, err))
        }
    }
}
