//! Device discovery backends.
//!
//! A backend decides which devices enter the context: the path backend
//! opens an explicit list of device nodes, the udev backend enumerates the
//! `input` subsystem and follows hotplug through a netlink monitor. Both
//! funnel into the same device creation path and read the same device
//! properties.

pub(crate) mod path;
#[cfg(feature = "backend_udev")]
pub(crate) mod udev;

use crate::device::lid::SwitchReliability;

pub(crate) const DEFAULT_SEAT: &str = "seat0";
pub(crate) const DEFAULT_SEAT_NAME: &str = "default";

/// Device properties supplied by the discovery mechanism.
#[derive(Debug, Clone)]
pub(crate) struct DeviceProperties {
    pub seat_physical: String,
    pub seat_logical: String,
    pub calibration: Option<[f32; 6]>,
    pub output_name: Option<String>,
    pub lid_reliability: SwitchReliability,
}

impl Default for DeviceProperties {
    fn default() -> DeviceProperties {
        DeviceProperties {
            seat_physical: DEFAULT_SEAT.to_owned(),
            seat_logical: DEFAULT_SEAT_NAME.to_owned(),
            calibration: None,
            output_name: None,
            lid_reliability: SwitchReliability::Unknown,
        }
    }
}

/// Parses the `WL_CALIBRATION` property: six whitespace separated floats
/// forming the top two rows of a 3x3 affine transform.
pub(crate) fn parse_calibration(value: &str) -> Option<[f32; 6]> {
    let mut out = [0.0f32; 6];
    let mut parts = value.split_whitespace();
    for slot in &mut out {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Reads device properties through udev.
#[cfg(feature = "backend_udev")]
pub(crate) fn properties_from_udev(sysname: &str, device: &::udev::Device) -> DeviceProperties {
    use tracing::info;

    let get = |name: &str| {
        device
            .property_value(name)
            .and_then(std::ffi::OsStr::to_str)
            .map(str::to_owned)
    };

    let calibration = get("WL_CALIBRATION").as_deref().and_then(parse_calibration);
    if let Some(calibration) = calibration {
        info!(device = sysname, ?calibration, "applying calibration");
    }

    DeviceProperties {
        seat_physical: get("ID_SEAT").unwrap_or_else(|| DEFAULT_SEAT.to_owned()),
        seat_logical: get("WL_SEAT").unwrap_or_else(|| DEFAULT_SEAT_NAME.to_owned()),
        calibration,
        output_name: get("WL_OUTPUT"),
        lid_reliability: SwitchReliability::from_property(
            sysname,
            get("LIBINPUT_ATTR_LID_SWITCH_RELIABILITY").as_deref(),
        ),
    }
}

/// Properties for a bare devnode, looked up through sysfs when udev support
/// is compiled in.
pub(crate) fn properties_for_devnode(sysname: &str) -> DeviceProperties {
    #[cfg(feature = "backend_udev")]
    {
        let syspath = std::path::PathBuf::from(format!("/sys/class/input/{sysname}"));
        if let Ok(device) = ::udev::Device::from_syspath(&syspath) {
            return properties_from_udev(sysname, &device);
        }
    }
    let _ = sysname;
    DeviceProperties::default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn calibration_parses_six_floats() {
        assert_eq!(
            parse_calibration("1 0 0 0 1 0"),
            Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
        );
        assert_eq!(
            parse_calibration("  1.5\t-2.0 0.25 0 1 7 "),
            Some([1.5, -2.0, 0.25, 0.0, 1.0, 7.0])
        );
    }

    #[test]
    fn calibration_rejects_malformed_values() {
        assert_eq!(parse_calibration(""), None);
        assert_eq!(parse_calibration("1 2 3 4 5"), None);
        assert_eq!(parse_calibration("1 2 3 4 5 6 7"), None);
        assert_eq!(parse_calibration("1 2 3 4 5 banana"), None);
    }
}
