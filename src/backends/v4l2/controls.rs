// SPDX-License-Identifier: GPL-3.0-only

//! V4L2 camera control interface
//!
//! Control ids, type tags and the raw query/get/set calls on an open
//! device descriptor.

use super::ioctl::{
    V4L2_CTRL_FLAG_NEXT_CTRL, V4l2Control, V4l2Querymenu, V4l2Queryctrl, VIDIOC_G_CTRL,
    VIDIOC_QUERYCTRL, VIDIOC_QUERYMENU, VIDIOC_S_CTRL, c_str, xioctl,
};
use crate::backends::device::{ControlInfo, MenuOption};
use crate::errors::PipelineResult;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use tracing::debug;

// ===== V4L2 Control Class Bases =====
const V4L2_CTRL_CLASS_USER: u32 = 0x00980000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;

// ===== V4L2 Control IDs (User Class) =====

pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_HUE: u32 = V4L2_CID_BASE + 3;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAMMA: u32 = V4L2_CID_BASE + 16;
pub const V4L2_CID_AUTOGAIN: u32 = V4L2_CID_BASE + 18;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
/// Mains frequency filter (menu: disabled / 50 Hz / 60 Hz / auto)
pub const V4L2_CID_POWER_LINE_FREQUENCY: u32 = V4L2_CID_BASE + 24;
/// White balance temperature in Kelvin
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
pub const V4L2_CID_BACKLIGHT_COMPENSATION: u32 = V4L2_CID_BASE + 28;

// ===== V4L2 Control IDs (Camera Class) =====

/// Exposure mode: Auto, Manual, Shutter Priority, Aperture Priority
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Absolute exposure time in 100us units
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;
pub const V4L2_CID_FOCUS_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 10;
pub const V4L2_CID_FOCUS_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 12;
pub const V4L2_CID_ZOOM_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 13;

// ===== V4L2 Control Types =====
pub const V4L2_CTRL_TYPE_INTEGER: u32 = 1;
pub const V4L2_CTRL_TYPE_BOOLEAN: u32 = 2;
pub const V4L2_CTRL_TYPE_MENU: u32 = 3;
pub const V4L2_CTRL_TYPE_BUTTON: u32 = 4;
pub const V4L2_CTRL_TYPE_INTEGER64: u32 = 5;
pub const V4L2_CTRL_TYPE_CTRL_CLASS: u32 = 6;
pub const V4L2_CTRL_TYPE_INTEGER_MENU: u32 = 9;

// ===== V4L2 Control Flags =====
pub const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;
pub const V4L2_CTRL_FLAG_READ_ONLY: u32 = 0x0004;
pub const V4L2_CTRL_FLAG_INACTIVE: u32 = 0x0010;

/// Control type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    Integer,
    Boolean,
    Menu,
    Button,
    Integer64,
    /// Class heading, not a settable control
    Class,
    IntegerMenu,
    Unknown(u32),
}

impl From<u32> for ControlKind {
    fn from(value: u32) -> Self {
        match value {
            V4L2_CTRL_TYPE_INTEGER => ControlKind::Integer,
            V4L2_CTRL_TYPE_BOOLEAN => ControlKind::Boolean,
            V4L2_CTRL_TYPE_MENU => ControlKind::Menu,
            V4L2_CTRL_TYPE_BUTTON => ControlKind::Button,
            V4L2_CTRL_TYPE_INTEGER64 => ControlKind::Integer64,
            V4L2_CTRL_TYPE_CTRL_CLASS => ControlKind::Class,
            V4L2_CTRL_TYPE_INTEGER_MENU => ControlKind::IntegerMenu,
            other => ControlKind::Unknown(other),
        }
    }
}

impl ControlKind {
    pub fn has_menu(&self) -> bool {
        matches!(self, ControlKind::Menu | ControlKind::IntegerMenu)
    }
}

/// Query one control; OR `id` with [`V4L2_CTRL_FLAG_NEXT_CTRL`] to walk the set
pub fn query_control(fd: RawFd, id: u32) -> PipelineResult<ControlInfo> {
    let mut qctrl = V4l2Queryctrl {
        id,
        ctrl_type: 0,
        name: [0; 32],
        minimum: 0,
        maximum: 0,
        step: 0,
        default_value: 0,
        flags: 0,
        reserved: [0; 2],
    };
    unsafe { xioctl(fd, "VIDIOC_QUERYCTRL", VIDIOC_QUERYCTRL, &mut qctrl as *mut V4l2Queryctrl)? };

    Ok(ControlInfo {
        id: qctrl.id,
        name: c_str(&qctrl.name),
        ctrl_type: qctrl.ctrl_type,
        minimum: qctrl.minimum,
        maximum: qctrl.maximum,
        step: qctrl.step,
        default_value: qctrl.default_value,
        flags: qctrl.flags,
    })
}

/// Query one menu entry of a menu or integer-menu control
pub fn query_menu(fd: RawFd, id: u32, index: u32, kind: ControlKind) -> PipelineResult<MenuOption> {
    let mut qmenu = V4l2Querymenu {
        id,
        index,
        name: [0; 32],
        reserved: 0,
    };
    unsafe { xioctl(fd, "VIDIOC_QUERYMENU", VIDIOC_QUERYMENU, &mut qmenu as *mut V4l2Querymenu)? };

    let name = qmenu.name;
    Ok(match kind {
        ControlKind::IntegerMenu => {
            let mut value = [0u8; 8];
            value.copy_from_slice(&name[..8]);
            MenuOption::Value(i64::from_ne_bytes(value))
        }
        _ => MenuOption::Label(c_str(&name)),
    })
}

pub fn get_control(fd: RawFd, id: u32) -> PipelineResult<i32> {
    let mut ctrl = V4l2Control { id, value: 0 };
    unsafe { xioctl(fd, "VIDIOC_G_CTRL", VIDIOC_G_CTRL, &mut ctrl as *mut V4l2Control)? };
    Ok(ctrl.value)
}

/// Set a control; returns the value the driver kept
pub fn set_control(fd: RawFd, id: u32, value: i32) -> PipelineResult<i32> {
    let mut ctrl = V4l2Control { id, value };
    unsafe { xioctl(fd, "VIDIOC_S_CTRL", VIDIOC_S_CTRL, &mut ctrl as *mut V4l2Control)? };

    if ctrl.value != value {
        debug!(
            control_id = id,
            requested = value,
            actual = ctrl.value,
            "V4L2 control value was clamped"
        );
    }
    Ok(ctrl.value)
}

/// The flag used to enumerate controls in driver order
pub const fn next_control(after: u32) -> u32 {
    after | V4L2_CTRL_FLAG_NEXT_CTRL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_id_values() {
        assert_eq!(V4L2_CID_BRIGHTNESS, 0x00980900);
        assert_eq!(V4L2_CID_GAIN, 0x00980913);
        assert_eq!(V4L2_CID_POWER_LINE_FREQUENCY, 0x00980918);
        assert_eq!(V4L2_CID_EXPOSURE_AUTO, 0x009a0901);
        assert_eq!(V4L2_CID_EXPOSURE_ABSOLUTE, 0x009a0902);
    }

    #[test]
    fn test_control_kind_conversion() {
        assert_eq!(ControlKind::from(1), ControlKind::Integer);
        assert_eq!(ControlKind::from(3), ControlKind::Menu);
        assert_eq!(ControlKind::from(9), ControlKind::IntegerMenu);
        assert_eq!(ControlKind::from(99), ControlKind::Unknown(99));
        assert!(ControlKind::IntegerMenu.has_menu());
        assert!(!ControlKind::Boolean.has_menu());
    }

    #[test]
    fn test_next_control_flag() {
        assert_eq!(next_control(0), 0x8000_0000);
        assert_eq!(next_control(V4L2_CID_GAIN) & !0x8000_0000, V4L2_CID_GAIN);
    }
}
