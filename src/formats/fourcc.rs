// SPDX-License-Identifier: GPL-3.0-only

//! Four-character device format codes

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Four-byte pixel format code as reported by the capture device
///
/// Stored in memory order, so `FourCc::new(b"YUYV").as_u32()` equals the
/// kernel's `v4l2_fourcc('Y', 'U', 'Y', 'V')`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Little-endian integer form used by the kernel ABI
    pub const fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

impl FromStr for FourCc {
    type Err = String;

    /// Parse a code of one to four ASCII characters, padding with spaces ("Y16" -> "Y16 ")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !s.is_ascii() {
            return Err(format!("invalid FourCC {:?}", s));
        }
        let mut code = [b' '; 4];
        code[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(code))
    }
}

impl From<v4l::FourCC> for FourCc {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCc> for v4l::FourCC {
    fn from(fourcc: FourCc) -> Self {
        v4l::FourCC::new(&fourcc.0)
    }
}

impl Serialize for FourCc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FourCc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_integer_form() {
        // v4l2_fourcc('Y','U','Y','V')
        assert_eq!(FourCc::new(b"YUYV").as_u32(), 0x5659_5559);
        assert_eq!(FourCc::from_u32(0x5659_5559), FourCc::new(b"YUYV"));
    }

    #[test]
    fn test_parse_pads_short_codes() {
        assert_eq!("Y16".parse::<FourCc>().unwrap(), FourCc::new(b"Y16 "));
        assert!("TOOLONG".parse::<FourCc>().is_err());
        assert!("".parse::<FourCc>().is_err());
    }

    #[test]
    fn test_display_masks_unprintable() {
        assert_eq!(FourCc([b'A', 0, b'B', b'C']).to_string(), "A.BC");
    }
}
