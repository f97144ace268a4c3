//! `EVIOCG*` ioctl wrappers.

// The kernel ABI structs carry fields the crate never reads; they still
// have to be present for the ioctl layouts to match.
#![allow(non_camel_case_types, dead_code)]

use nix::{convert_ioctl_res, ioctl_read, ioctl_read_buf, request_code_read};

/// `struct input_id` from `linux/input.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InputId {
    pub bustype: u16,
    pub vendor: u16,
    pub product: u16,
    pub version: u16,
}

/// `struct input_absinfo` from `linux/input.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AbsInfo {
    pub value: i32,
    pub minimum: i32,
    pub maximum: i32,
    pub fuzz: i32,
    pub flat: i32,
    pub resolution: i32,
}

ioctl_read!(eviocgid, b'E', 0x02, InputId);
ioctl_read_buf!(eviocgname, b'E', 0x06, u8);
ioctl_read_buf!(eviocgkey, b'E', 0x18, u8);
ioctl_read_buf!(eviocgsw, b'E', 0x1b, u8);

/// `EVIOCGBIT(ev, len)`: the event-type bitmask for `ev == 0`, otherwise the
/// code bitmask for event type `ev`.
pub(crate) unsafe fn eviocgbit(fd: libc::c_int, ev: u32, buf: &mut [u8]) -> nix::Result<i32> {
    convert_ioctl_res!(libc::ioctl(
        fd,
        request_code_read!(b'E', 0x20 + ev, buf.len()) as libc::c_ulong,
        buf.as_mut_ptr()
    ))
}

/// `EVIOCGABS(abs)`.
pub(crate) unsafe fn eviocgabs(fd: libc::c_int, abs: u32, info: &mut AbsInfo) -> nix::Result<i32> {
    convert_ioctl_res!(libc::ioctl(
        fd,
        request_code_read!(b'E', 0x40 + abs, std::mem::size_of::<AbsInfo>()) as libc::c_ulong,
        info as *mut AbsInfo
    ))
}
