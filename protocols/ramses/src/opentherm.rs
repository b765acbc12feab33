// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! OpenTherm frames as encapsulated by the 3220 opcode.

use serde::Serialize;

/// The message type carried in the upper nibble of the second octet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OtMsgType {
    ReadData,
    WriteData,
    InvalidData,
    Reserved,
    ReadAck,
    WriteAck,
    DataInvalid,
    UnknownDataId,
}

impl OtMsgType {
    fn from_wire(val: u8) -> OtMsgType {
        match (val >> 4) & 0x07 {
            0 => Self::ReadData,
            1 => Self::WriteData,
            2 => Self::InvalidData,
            3 => Self::Reserved,
            4 => Self::ReadAck,
            5 => Self::WriteAck,
            6 => Self::DataInvalid,
            _ => Self::UnknownDataId,
        }
    }

    /// Whether a reply of this type tells us the boiler knows the data-id.
    pub fn is_supported_reply(&self) -> bool {
        matches!(self, Self::ReadAck | Self::WriteAck)
    }

    /// Whether a reply of this type tells us the boiler does not.
    pub fn is_unsupported_reply(&self) -> bool {
        matches!(self, Self::DataInvalid | Self::UnknownDataId | Self::Reserved)
    }
}

/// How the 16-bit data value of a data-id is interpreted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OtValueFormat {
    /// Signed 8.8 fixed point.
    F8_8,
    U16,
    /// Two independent octets.
    U8Pair,
    Flags,
}

const OT_DATA_IDS: &[(u8, &str, OtValueFormat)] = &[
    (0x00, "status", OtValueFormat::Flags),
    (0x01, "control_setpoint", OtValueFormat::F8_8),
    (0x03, "slave_config", OtValueFormat::Flags),
    (0x05, "fault_flags", OtValueFormat::Flags),
    (0x0e, "max_rel_modulation", OtValueFormat::F8_8),
    (0x11, "rel_modulation_level", OtValueFormat::F8_8),
    (0x12, "ch_water_pressure", OtValueFormat::F8_8),
    (0x13, "dhw_flow_rate", OtValueFormat::F8_8),
    (0x19, "boiler_output_temp", OtValueFormat::F8_8),
    (0x1a, "dhw_temp", OtValueFormat::F8_8),
    (0x1b, "outside_temp", OtValueFormat::F8_8),
    (0x1c, "boiler_return_temp", OtValueFormat::F8_8),
    (0x30, "dhw_setpoint_bounds", OtValueFormat::U8Pair),
    (0x31, "ch_setpoint_bounds", OtValueFormat::U8Pair),
    (0x38, "dhw_setpoint", OtValueFormat::F8_8),
    (0x39, "max_ch_setpoint", OtValueFormat::F8_8),
    (0x73, "oem_diagnostic_code", OtValueFormat::U16),
    (0x74, "burner_starts", OtValueFormat::U16),
    (0x78, "burner_hours", OtValueFormat::U16),
    (0x7d, "opentherm_version_slave", OtValueFormat::F8_8),
    (0x7f, "slave_product_version", OtValueFormat::U8Pair),
];

/// Data-ids polled once per schema cycle: version and capability facts.
pub const SCHEMA_MSG_IDS: &[u8] = &[0x03, 0x7d, 0x7f];

/// Data-ids polled once per params cycle: configured bounds and setpoints.
pub const PARAMS_MSG_IDS: &[u8] = &[0x0e, 0x30, 0x31, 0x38, 0x39];

/// Data-ids polled every status cycle.
pub const STATUS_MSG_IDS: &[u8] = &[0x00, 0x05, 0x11, 0x12, 0x13, 0x19, 0x1a, 0x1b, 0x1c];

fn lookup(msg_id: u8) -> Option<&'static (u8, &'static str, OtValueFormat)> {
    OT_DATA_IDS.iter().find(|(id, _, _)| *id == msg_id)
}

/// One decoded OpenTherm frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtFrame {
    pub msg_type: OtMsgType,
    pub msg_id: u8,
    pub msg_name: Option<&'static str>,
    pub raw_value: u16,
    /// The numeric reading for f8.8 and u16 formats of acknowledged reads.
    pub value: Option<f64>,
}

impl OtFrame {
    pub fn from_wire(raw: &[u8]) -> Result<OtFrame, String> {
        if raw.len() < 5 {
            return Err(format!("opentherm frame of {} octets is too short", raw.len()));
        }
        let msg_type = OtMsgType::from_wire(raw[1]);
        let msg_id = raw[2];
        let raw_value = u16::from_be_bytes([raw[3], raw[4]]);

        let value = match (msg_type.is_supported_reply(), lookup(msg_id)) {
            (true, Some((_, _, OtValueFormat::F8_8))) => {
                Some(raw_value as i16 as f64 / 256.0)
            }
            (true, Some((_, _, OtValueFormat::U16))) => Some(raw_value as f64),
            _ => None,
        };

        Ok(OtFrame {
            msg_type,
            msg_id,
            msg_name: lookup(msg_id).map(|(_, name, _)| *name),
            raw_value,
            value,
        })
    }

    /// The firmware substitutes these two sentinels for data-ids it has
    /// learnt the boiler will never answer.
    pub fn is_deprecation_sentinel(raw: &[u8]) -> bool {
        (raw.len() >= 5 && raw[2..5] == [0x12, 0x19, 0x80])
            || (raw.len() >= 5 && raw[3..5] == [0x47, 0xab])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_ack_f8_8() {
        // Read-Ack of boiler_output_temp, 54.5 degrees.
        let frame = OtFrame::from_wire(&[0x00, 0x40, 0x19, 0x36, 0x80]).unwrap();
        assert_eq!(frame.msg_type, OtMsgType::ReadAck);
        assert_eq!(frame.msg_name, Some("boiler_output_temp"));
        assert_eq!(frame.value, Some(54.5));
    }

    #[test]
    fn unknown_data_id_reply() {
        let frame = OtFrame::from_wire(&[0x00, 0x70, 0x63, 0x00, 0x00]).unwrap();
        assert_eq!(frame.msg_type, OtMsgType::UnknownDataId);
        assert!(frame.msg_type.is_unsupported_reply());
        assert_eq!(frame.value, None);
    }

    #[test]
    fn deprecation_sentinels() {
        assert!(OtFrame::is_deprecation_sentinel(&[0x00, 0x40, 0x12, 0x19, 0x80]));
        assert!(OtFrame::is_deprecation_sentinel(&[0x00, 0x40, 0x11, 0x47, 0xab]));
        assert!(!OtFrame::is_deprecation_sentinel(&[0x00, 0x40, 0x19, 0x36, 0x80]));
    }

    #[test]
    fn polling_sets_are_disjoint_from_schema() {
        SCHEMA_MSG_IDS.iter().for_each(|id| {
            assert!(!STATUS_MSG_IDS.contains(id));
        });
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(OtFrame::from_wire(&[0x00, 0x40, 0x19]).is_err());
    }
}
