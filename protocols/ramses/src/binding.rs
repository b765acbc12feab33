// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The 1FC9 pairing grammar: triples, payload builders and capability sets.
//!
//! The timed three-way handshake itself lives in the runtime; this module
//! owns what goes on the wire.

use std::fmt;

use serde::Serialize;

use super::{
    addr::{DeviceClass, DeviceId},
    bytes_to_hex,
    codes::Code,
};

/// One element of a 1FC9 payload: the index or domain being bound, the
/// opcode on offer, and the offering device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindTriple {
    pub idx: u8,
    pub code: Code,
    pub device_id: DeviceId,
}

impl BindTriple {
    pub fn from_wire(raw: &[u8]) -> Result<BindTriple, String> {
        if raw.len() < 6 {
            return Err(format!("bind triple of {} octets is too short", raw.len()));
        }
        let device_id = DeviceId::from_wire(&raw[3..6]).map_err(|e| e.to_string())?;
        Ok(BindTriple {
            idx: raw[0],
            code: Code(u16::from_be_bytes([raw[1], raw[2]])),
            device_id,
        })
    }

    pub fn to_wire(&self) -> [u8; 6] {
        let code = self.code.0.to_be_bytes();
        let dev = self.device_id.to_wire();
        [self.idx, code[0], code[1], dev[0], dev[1], dev[2]]
    }
}

/// The codes a device of the given class may offer in a handshake.
pub fn offerable_codes(class: DeviceClass) -> &'static [Code] {
    match class {
        DeviceClass::Thm => &[Code::ZONE_TEMP, Code::SETPOINT],
        DeviceClass::Ext => &[Code::OUTDOOR_SENSOR],
        DeviceClass::DhwSensor => &[Code::DHW_TEMP],
        DeviceClass::Bdr => &[Code::ACTUATOR_STATE, Code::RELAY_DEMAND],
        DeviceClass::Hgi => &[
            Code::ZONE_TEMP,
            Code::SETPOINT,
            Code::OUTDOOR_SENSOR,
            Code::DHW_TEMP,
            Code::ACTUATOR_STATE,
        ],
        _ => &[],
    }
}

/// Validate that `code` may be offered by `class` before a handshake leaves
/// the idle state.
pub fn check_offerable(class: DeviceClass, code: Code) -> Result<(), BindError> {
    if offerable_codes(class).contains(&code) {
        Ok(())
    } else {
        Err(BindError::NotOfferable(class, code))
    }
}

/// The opening `I` payload: the offered code plus the mandatory trailing
/// 1FC9 triple naming the offeror.
pub fn offer_payload(code: Code, idx: u8, device_id: DeviceId) -> String {
    let triples = [
        BindTriple { idx, code, device_id },
        BindTriple {
            idx,
            code: Code::RF_BIND,
            device_id,
        },
    ];
    triples.iter().flat_map(|t| t.to_wire()).map(|b| format!("{:02X}", b)).collect()
}

/// The answering `W` payload: the accepted code paired with the acceptor's
/// preferred index or domain.
pub fn accept_payload(code: Code, idx: u8, device_id: DeviceId) -> String {
    bytes_to_hex(&BindTriple { idx, code, device_id }.to_wire())
}

/// The closing `I` payload, sent by the offeror to the acceptor.
pub fn confirm_payload(code: Code, idx: u8, device_id: DeviceId) -> String {
    bytes_to_hex(&BindTriple { idx, code, device_id }.to_wire())
}

/// The error raised before a handshake starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// The class has no business offering this code.
    NotOfferable(DeviceClass, Code),
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOfferable(class, code) => {
                write!(f, "a {} device cannot offer {}", class, code)
            }
        }
    }
}

impl std::error::Error for BindError {}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn triple_wire_roundtrip() {
        let triple = BindTriple {
            idx: 0xfc,
            code: Code::RELAY_DEMAND,
            device_id: DeviceId::from_str("01:054173").unwrap(),
        };
        assert_eq!(bytes_to_hex(&triple.to_wire()), "FC000804D39D");
        assert_eq!(BindTriple::from_wire(&triple.to_wire()).unwrap(), triple);
    }

    #[test]
    fn offer_carries_trailing_bind_triple() {
        let dev = DeviceId::from_str("34:021943").unwrap();
        let payload = offer_payload(Code::ZONE_TEMP, 0, dev);
        assert_eq!(payload.len(), 24);
        assert!(payload.starts_with("0030C9"));
        assert!(payload[12..].starts_with("001FC9"));
    }

    #[test]
    fn capability_sets_gate_offers() {
        assert!(check_offerable(DeviceClass::Thm, Code::ZONE_TEMP).is_ok());
        assert!(check_offerable(DeviceClass::Bdr, Code::ZONE_TEMP).is_err());
        assert!(check_offerable(DeviceClass::Trv, Code::ZONE_TEMP).is_err());
    }
}
