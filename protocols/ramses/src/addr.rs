// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Device addresses and the three-slot address form rule.

use std::fmt;
use std::str::FromStr;

/// The identifier of a device, rendered as `TT:NNNNNN`.
///
/// On the wire the identifier is packed into 3 octets: the upper 6 bits carry
/// the device type, the lower 18 bits the serial number. The placeholder slot
/// `--:------` is expressed by [`DeviceId::NONE`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId {
    dev_type: u8,
    number: u32,
}

/// The identifier of the local gateway when none has been learnt yet.
pub const HGI_DEV_ID: DeviceId = DeviceId::new(18, 730);

/// The broadcast/null device, `63:262142`.
pub const NUL_DEV_ID: DeviceId = DeviceId::new(63, 262142);

impl DeviceId {
    /// The `--:------` placeholder slot.
    pub const NONE: DeviceId = DeviceId {
        dev_type: 0xff,
        number: 0xffffff,
    };

    pub const fn new(dev_type: u8, number: u32) -> DeviceId {
        DeviceId { dev_type, number }
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_nul(&self) -> bool {
        *self == NUL_DEV_ID
    }

    /// The two-digit type prefix.
    pub fn dev_type(&self) -> u8 {
        self.dev_type
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn class(&self) -> DeviceClass {
        DeviceClass::from_dev_type(self.dev_type)
    }

    /// Decode from the 3-octet wire form carried in payloads.
    pub fn from_wire(raw: &[u8]) -> Result<DeviceId, AddrError> {
        if raw.len() < 3 {
            Err(AddrError::TooShort(raw.len()))
        } else {
            let val = ((raw[0] as u32) << 16) | ((raw[1] as u32) << 8) | (raw[2] as u32);
            Ok(DeviceId {
                dev_type: (val >> 18) as u8,
                number: val & 0x3ffff,
            })
        }
    }

    /// Encode to the 3-octet wire form carried in payloads. Serial numbers
    /// wider than 18 bits cannot occur on the wire and are truncated.
    pub fn to_wire(&self) -> [u8; 3] {
        let val = ((self.dev_type as u32) << 18) | (self.number & 0x3ffff);
        [(val >> 16) as u8, (val >> 8) as u8, val as u8]
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "--:------")
        } else {
            write!(f, "{:02}:{:06}", self.dev_type(), self.number())
        }
    }
}

impl FromStr for DeviceId {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "--:------" {
            return Ok(Self::NONE);
        }
        let mut parts = s.splitn(2, ':');
        let (t, n) = match (parts.next(), parts.next()) {
            (Some(t), Some(n)) if t.len() == 2 && n.len() == 6 => (t, n),
            _ => return Err(AddrError::Malformed(s.to_string())),
        };
        let dev_type = t
            .parse::<u8>()
            .map_err(|_| AddrError::Malformed(s.to_string()))?;
        let number = n
            .parse::<u32>()
            .map_err(|_| AddrError::Malformed(s.to_string()))?;
        Ok(Self::new(dev_type, number))
    }
}

/// The capability class of a device, keyed by its type prefix.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceClass {
    /// Radiator valve actuator (HR80/HR92).
    Trv,
    /// Temperature control system controller.
    Ctl,
    /// Underfloor heating controller (HCE80).
    Ufc,
    /// Room thermostat/sensor.
    Thm,
    /// DHW wireless sensor (CS92).
    DhwSensor,
    /// OpenTherm bridge (R8810A).
    Otb,
    /// Wireless relay (BDR91).
    Bdr,
    /// External weather sensor.
    Ext,
    /// The local serial gateway (HGI80/evofw3).
    Hgi,
    /// Programmer, a controller without zoning.
    Prg,
    /// Internet gateway (RFG100).
    Rfg,
    /// HVAC ventilation unit.
    Fan,
    /// HVAC CO2/humidity sensor.
    HvacSensor,
    /// Catch-all for unrecognised prefixes.
    Dev,
}

impl DeviceClass {
    pub fn from_dev_type(dev_type: u8) -> DeviceClass {
        match dev_type {
            0 | 4 => Self::Trv,
            1 => Self::Ctl,
            2 => Self::Ufc,
            3 | 12 | 22 | 34 => Self::Thm,
            7 => Self::DhwSensor,
            10 => Self::Otb,
            13 => Self::Bdr,
            17 => Self::Ext,
            18 => Self::Hgi,
            23 => Self::Prg,
            30 => Self::Rfg,
            20 | 29 | 32 | 37 => Self::Fan,
            31 | 39 => Self::HvacSensor,
            _ => Self::Dev,
        }
    }

    /// Whether this class can own a temperature control system.
    pub fn is_controller_class(&self) -> bool {
        matches!(self, Self::Ctl | Self::Prg | Self::Ufc)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Trv => "TRV",
            Self::Ctl => "CTL",
            Self::Ufc => "UFC",
            Self::Thm => "THM",
            Self::DhwSensor => "DHW",
            Self::Otb => "OTB",
            Self::Bdr => "BDR",
            Self::Ext => "EXT",
            Self::Hgi => "HGI",
            Self::Prg => "PRG",
            Self::Rfg => "RFG",
            Self::Fan => "FAN",
            Self::HvacSensor => "CO2",
            Self::Dev => "DEV",
        };
        write!(f, "{}", label)
    }
}

/// Source and destination extracted from the three address slots.
///
/// Exactly two forms are canonical. An announcement repeats the source in the
/// third slot with an empty second slot; a directed frame carries source and
/// destination in the first two slots with an empty third. Anything else is
/// rejected.
pub fn extract_addrs(addrs: &[DeviceId; 3]) -> Result<(DeviceId, DeviceId), AddrError> {
    let [a0, a1, a2] = *addrs;

    if a1.is_none() && !a0.is_none() && a0 == a2 {
        // Announcement: the third slot mirrors the source.
        Ok((a0, a2))
    } else if !a0.is_none() && !a1.is_none() && a2.is_none() {
        Ok((a0, a1))
    } else {
        Err(AddrError::InvalidForm([a0, a1, a2]))
    }
}

/// The error to parse or combine device addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Insufficient data to parse, 3 octets at least.
    TooShort(usize),
    /// The text form does not match `TT:NNNNNN` or the placeholder.
    Malformed(String),
    /// The three slots match neither canonical form.
    InvalidForm([DeviceId; 3]),
}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(length) => write!(f, "device id of {} octets is too short", length),
            Self::Malformed(s) => write!(f, "malformed device id: {}", s),
            Self::InvalidForm(addrs) => write!(
                f,
                "invalid address form: {} {} {}",
                addrs[0], addrs[1], addrs[2]
            ),
        }
    }
}

impl std::error::Error for AddrError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn device_id_text_roundtrip() {
        ["01:145039", "18:000730", "63:262142", "13:049798", "--:------"]
            .iter()
            .for_each(|s| {
                let id = DeviceId::from_str(s).unwrap();
                assert_eq!(&id.to_string(), s);
            });
    }

    #[test]
    fn device_id_wire_roundtrip() {
        let id = DeviceId::from_str("01:054173").unwrap();
        assert_eq!(id.to_wire(), [0x04, 0xd3, 0x9d]);
        assert_eq!(DeviceId::from_wire(&[0x04, 0xd3, 0x9d]).unwrap(), id);
    }

    #[test]
    fn device_id_rejects_garbage() {
        ["01-145039", "1:145039", "01:14503", "XX:123456", ""]
            .iter()
            .for_each(|s| {
                assert!(DeviceId::from_str(s).is_err(), "{}", s);
            });
    }

    #[test]
    fn class_of_known_prefixes() {
        assert_eq!(DeviceClass::from_dev_type(1), DeviceClass::Ctl);
        assert_eq!(DeviceClass::from_dev_type(4), DeviceClass::Trv);
        assert_eq!(DeviceClass::from_dev_type(10), DeviceClass::Otb);
        assert_eq!(DeviceClass::from_dev_type(34), DeviceClass::Thm);
        assert_eq!(DeviceClass::from_dev_type(99), DeviceClass::Dev);
    }

    #[test]
    fn addr_form_announcement() {
        let a = DeviceId::from_str("01:145039").unwrap();
        let (src, dst) = extract_addrs(&[a, DeviceId::NONE, a]).unwrap();
        assert_eq!(src, a);
        assert_eq!(dst, a);
    }

    #[test]
    fn addr_form_directed() {
        let a = DeviceId::from_str("18:000730").unwrap();
        let b = DeviceId::from_str("01:145039").unwrap();
        let (src, dst) = extract_addrs(&[a, b, DeviceId::NONE]).unwrap();
        assert_eq!((src, dst), (a, b));
    }

    #[test]
    fn addr_form_rejects_others() {
        let a = DeviceId::from_str("18:000730").unwrap();
        let b = DeviceId::from_str("01:145039").unwrap();
        assert!(extract_addrs(&[a, b, a]).is_err());
        assert!(extract_addrs(&[a, DeviceId::NONE, b]).is_err());
        assert!(extract_addrs(&[DeviceId::NONE, a, b]).is_err());
        assert!(extract_addrs(&[DeviceId::NONE, DeviceId::NONE, DeviceId::NONE]).is_err());
    }
}
