#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

//! # indev: an input device abstraction for Linux display stacks
//!
//! This crate consumes raw kernel input reports from evdev character
//! devices, interprets them into a stream of typed logical events (keyboard
//! keys, pointer motion and buttons, touch points with slot identity,
//! tablet tools, lid switch toggles) and delivers them to a single host
//! process, typically a wayland compositor, a shell or a test harness.
//!
//! ## Structure of the crate
//!
//! Everything revolves around the [`Context`]: it owns the seats, the
//! devices and a single wait fd multiplexing every device. The host only
//! provides an [`Interface`] for privilege-mediated opening of device nodes
//! and for the current screen extents; classification, per-device protocol
//! handling, multi-touch reconstruction and pointer acceleration live
//! inside the crate. Devices are found either through udev
//! ([`Context::from_udev`]) or from an explicit list of device nodes
//! ([`Context::from_paths`]).
//!
//! The host loop is: poll [`Context::as_fd`](std::os::fd::AsFd) for read
//! readiness, call [`Context::dispatch`], then drain
//! [`Context::next_event`]. The context also implements
//! [`calloop::EventSource`], so it can be inserted into a [`calloop`] event
//! loop directly and deliver [`Event`]s through the loop callback.
//!
//! ```no_run
//! use indev::{Context, Device, Interface};
//! use std::os::fd::RawFd;
//! use std::path::Path;
//!
//! struct Host;
//!
//! impl Interface for Host {
//!     fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<RawFd, i32> {
//!         // open through logind, a setuid helper, ...
//!         # Err(-1)
//!     }
//!     fn close_restricted(&mut self, fd: RawFd) {
//!         # let _ = fd;
//!     }
//!     fn screen_dimensions(&mut self, _device: &Device) -> (i32, i32) {
//!         (1920, 1080)
//!     }
//! }
//!
//! let ctx = Context::from_udev(Host, "seat0").unwrap();
//! loop {
//!     // wait for readiness on ctx.as_fd(), then:
//!     ctx.dispatch().unwrap();
//!     while let Some(event) = ctx.next_event() {
//!         println!("{:?}", event);
//!     }
//! }
//! ```
//!
//! ## Logging
//!
//! The crate emits log output through [`tracing`]; install a subscriber
//! such as `tracing-subscriber` in the host to see it.

pub(crate) mod backend;
pub(crate) mod context;
pub(crate) mod device;
pub(crate) mod evdev;
pub mod events;
pub(crate) mod filter;
pub(crate) mod seat;
pub(crate) mod source;
pub mod utils;

pub use crate::context::{Context, ContextError, Interface};
pub use crate::device::{Device, DeviceCapability, DeviceError, Leds};
pub use crate::evdev::InputEvent;
pub use crate::events::{Event, EventType};
pub use crate::seat::Seat;
pub use crate::utils::Fixed;
