// SPDX-License-Identifier: GPL-3.0-only

//! Control set cache, built once per open

use crate::backends::device::{CaptureDevice, ControlInfo, MenuOption};
use crate::backends::v4l2::controls::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Controls probed one by one when the driver cannot enumerate
const WELL_KNOWN_CONTROLS: &[u32] = &[
    V4L2_CID_BRIGHTNESS,
    V4L2_CID_CONTRAST,
    V4L2_CID_SATURATION,
    V4L2_CID_HUE,
    V4L2_CID_AUTO_WHITE_BALANCE,
    V4L2_CID_GAMMA,
    V4L2_CID_AUTOGAIN,
    V4L2_CID_GAIN,
    V4L2_CID_POWER_LINE_FREQUENCY,
    V4L2_CID_WHITE_BALANCE_TEMPERATURE,
    V4L2_CID_SHARPNESS,
    V4L2_CID_BACKLIGHT_COMPENSATION,
    V4L2_CID_EXPOSURE_AUTO,
    V4L2_CID_EXPOSURE_ABSOLUTE,
    V4L2_CID_FOCUS_ABSOLUTE,
    V4L2_CID_FOCUS_AUTO,
    V4L2_CID_ZOOM_ABSOLUTE,
];

/// One entry of a menu control, keyed by the value to set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub index: u32,
    pub option: MenuOption,
}

/// Cached description of one device control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlDescriptor {
    pub id: u32,
    pub name: String,
    pub kind: ControlKind,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    /// Valid menu entries in index order (menu controls only)
    pub menu: Vec<MenuEntry>,
}

impl ControlDescriptor {
    fn from_info(info: ControlInfo) -> Self {
        Self {
            id: info.id,
            kind: info.ctrl_type.into(),
            name: info.name,
            minimum: info.minimum,
            maximum: info.maximum,
            step: info.step,
            default_value: info.default_value,
            flags: info.flags,
            menu: Vec::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_READ_ONLY != 0
    }

    /// Value cannot currently be changed (e.g. manual exposure under auto mode)
    pub fn is_inactive(&self) -> bool {
        self.flags & V4L2_CTRL_FLAG_INACTIVE != 0
    }

    /// Label for a menu value
    pub fn menu_label(&self, value: i32) -> Option<String> {
        self.menu
            .iter()
            .find(|entry| entry.index as i32 == value)
            .map(|entry| match &entry.option {
                MenuOption::Label(label) => label.clone(),
                MenuOption::Value(v) => v.to_string(),
            })
    }
}

fn describe(device: &dyn CaptureDevice, info: ControlInfo) -> Option<ControlDescriptor> {
    if info.flags & V4L2_CTRL_FLAG_DISABLED != 0 {
        return None;
    }
    let mut descriptor = ControlDescriptor::from_info(info);
    match descriptor.kind {
        ControlKind::Class => return None,
        kind if kind.has_menu() => {
            let (lo, hi) = (descriptor.minimum.max(0), descriptor.maximum.max(0));
            descriptor.menu = (lo as u32..=hi as u32)
                .filter_map(|index| {
                    device
                        .query_menu(descriptor.id, index)
                        .ok()
                        .map(|option| MenuEntry { index, option })
                })
                .collect();
        }
        _ => {}
    }
    Some(descriptor)
}

/// Enumerate the device's controls in driver order
pub fn enumerate_controls(device: &dyn CaptureDevice) -> Vec<ControlDescriptor> {
    let mut controls = Vec::new();
    let mut id = 0;
    let mut walked = false;
    while let Ok(info) = device.query_control(next_control(id)) {
        walked = true;
        if info.id <= id {
            break;
        }
        id = info.id;
        controls.extend(describe(device, info));
    }

    if !walked {
        debug!("Control enumeration unsupported, probing well-known controls");
        controls.extend(
            WELL_KNOWN_CONTROLS
                .iter()
                .filter_map(|&cid| device.query_control(cid).ok())
                .filter_map(|info| describe(device, info)),
        );
    }

    debug!(count = controls.len(), "Enumerated device controls");
    controls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::virtual_device::VirtualDevice;

    #[test]
    fn test_disabled_controls_skipped() {
        let dev = VirtualDevice::new();
        let controls = enumerate_controls(&dev);
        assert_eq!(controls.len(), 6);
        assert!(controls.iter().all(|c| c.id != V4L2_CID_GAMMA));
    }

    #[test]
    fn test_menu_entries_skip_gaps() {
        let dev = VirtualDevice::new();
        let controls = enumerate_controls(&dev);
        let exposure = controls
            .iter()
            .find(|c| c.id == V4L2_CID_EXPOSURE_AUTO)
            .unwrap();
        assert_eq!(exposure.kind, ControlKind::Menu);
        let indices: Vec<u32> = exposure.menu.iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert_eq!(exposure.menu_label(3).as_deref(), Some("Aperture Priority Mode"));
        assert_eq!(exposure.menu_label(0), None);
    }

    #[test]
    fn test_integer_menu_values() {
        let dev = VirtualDevice::new();
        let controls = enumerate_controls(&dev);
        let zoom = controls
            .iter()
            .find(|c| c.id == V4L2_CID_ZOOM_ABSOLUTE)
            .unwrap();
        assert_eq!(zoom.menu[2].option, MenuOption::Value(400));
        assert_eq!(zoom.menu_label(1).as_deref(), Some("200"));
    }
}
