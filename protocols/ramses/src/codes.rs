// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The opcode registry: names, staleness horizons and origination rules.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::Verb;

/// A RAMSES opcode, rendered as 4 upper-hex digits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Code(pub u16);

impl Code {
    pub const RF_UNKNOWN: Code = Code(0x0001);
    pub const OUTDOOR_SENSOR: Code = Code(0x0002);
    pub const ZONE_NAME: Code = Code(0x0004);
    pub const SYSTEM_ZONES: Code = Code(0x0005);
    pub const SCHEDULE_SYNC: Code = Code(0x0006);
    pub const RELAY_DEMAND: Code = Code(0x0008);
    pub const RELAY_FAILSAFE: Code = Code(0x0009);
    pub const ZONE_CONFIG: Code = Code(0x000a);
    pub const ZONE_ACTUATORS: Code = Code(0x000c);
    pub const RF_CHECK: Code = Code(0x0016);
    pub const LANGUAGE: Code = Code(0x0100);
    pub const FAN_PARAMS: Code = Code(0x0150);
    pub const ZONE_SCHEDULE: Code = Code(0x0404);
    pub const SYSTEM_FAULT: Code = Code(0x0418);
    pub const DHW_PARAMS: Code = Code(0x10a0);
    pub const DEVICE_INFO: Code = Code(0x10e0);
    pub const BATTERY_STATE: Code = Code(0x1060);
    pub const MAX_CH_SETPOINT: Code = Code(0x1081);
    pub const UNKNOWN_1090: Code = Code(0x1090);
    pub const TPI_PARAMS: Code = Code(0x1100);
    pub const DHW_TEMP: Code = Code(0x1260);
    pub const OUTDOOR_TEMP: Code = Code(0x1290);
    pub const DHW_FLOW_RATE: Code = Code(0x12f0);
    pub const WINDOW_STATE: Code = Code(0x12b0);
    pub const CH_PRESSURE: Code = Code(0x1300);
    pub const SYSTEM_SYNC: Code = Code(0x1f09);
    pub const DHW_MODE: Code = Code(0x1f41);
    pub const RF_BIND: Code = Code(0x1fc9);
    pub const NOW_NEXT_SETPOINT: Code = Code(0x2249);
    pub const UFH_SETPOINT: Code = Code(0x22c9);
    pub const BOILER_SETPOINT: Code = Code(0x22d9);
    pub const SETPOINT: Code = Code(0x2309);
    pub const ZONE_MODE: Code = Code(0x2349);
    pub const OTB_STATE: Code = Code(0x2401);
    pub const SYSTEM_MODE: Code = Code(0x2e04);
    pub const ZONE_TEMP: Code = Code(0x30c9);
    pub const MYSTERY_3120: Code = Code(0x3120);
    pub const DATETIME: Code = Code(0x313f);
    pub const HEAT_DEMAND: Code = Code(0x3150);
    pub const FAN_STATE: Code = Code(0x31d9);
    pub const VENT_STATE: Code = Code(0x31da);
    pub const VENT_DEMAND: Code = Code(0x31e0);
    pub const BOILER_OUTPUT_TEMP: Code = Code(0x3200);
    pub const BOILER_RETURN_TEMP: Code = Code(0x3210);
    pub const OPENTHERM: Code = Code(0x3220);
    pub const OTB_SYNC: Code = Code(0x3221);
    pub const OTB_COUNTER: Code = Code(0x3223);
    pub const ACTUATOR_SYNC: Code = Code(0x3b00);
    pub const ACTUATOR_STATE: Code = Code(0x3ef0);
    pub const ACTUATOR_CYCLE: Code = Code(0x3ef1);
}

impl serde::Serialize for Code {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for Code {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase()) {
            Err(CodeError::Malformed(s.to_string()))
        } else {
            u16::from_str_radix(s, 16)
                .map(Code)
                .map_err(|_| CodeError::Malformed(s.to_string()))
        }
    }
}

/// The error to parse an opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Not 4 upper-hex digits.
    Malformed(String),
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(s) => write!(f, "malformed opcode: {}", s),
        }
    }
}

impl std::error::Error for CodeError {}

impl Code {
    /// A human-oriented label, or the hex digits when unnamed.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::RF_UNKNOWN => "rf_unknown",
            Self::OUTDOOR_SENSOR => "outdoor_sensor",
            Self::ZONE_NAME => "zone_name",
            Self::SYSTEM_ZONES => "system_zones",
            Self::SCHEDULE_SYNC => "schedule_sync",
            Self::RELAY_DEMAND => "relay_demand",
            Self::RELAY_FAILSAFE => "relay_failsafe",
            Self::ZONE_CONFIG => "zone_config",
            Self::ZONE_ACTUATORS => "zone_actuators",
            Self::RF_CHECK => "rf_check",
            Self::LANGUAGE => "language",
            Self::ZONE_SCHEDULE => "zone_schedule",
            Self::SYSTEM_FAULT => "system_fault",
            Self::DHW_PARAMS => "dhw_params",
            Self::DEVICE_INFO => "device_info",
            Self::BATTERY_STATE => "battery_state",
            Self::MAX_CH_SETPOINT => "max_ch_setpoint",
            Self::TPI_PARAMS => "tpi_params",
            Self::DHW_TEMP => "dhw_temp",
            Self::OUTDOOR_TEMP => "outdoor_temp",
            Self::DHW_FLOW_RATE => "dhw_flow_rate",
            Self::WINDOW_STATE => "window_state",
            Self::CH_PRESSURE => "ch_water_pressure",
            Self::SYSTEM_SYNC => "system_sync",
            Self::DHW_MODE => "dhw_mode",
            Self::RF_BIND => "rf_bind",
            Self::NOW_NEXT_SETPOINT => "now_next_setpoint",
            Self::UFH_SETPOINT => "ufh_setpoint",
            Self::BOILER_SETPOINT => "boiler_setpoint",
            Self::SETPOINT => "setpoint",
            Self::ZONE_MODE => "zone_mode",
            Self::SYSTEM_MODE => "system_mode",
            Self::ZONE_TEMP => "zone_temp",
            Self::DATETIME => "datetime",
            Self::HEAT_DEMAND => "heat_demand",
            Self::FAN_STATE => "fan_state",
            Self::VENT_STATE => "vent_state",
            Self::VENT_DEMAND => "vent_demand",
            Self::BOILER_OUTPUT_TEMP => "boiler_output_temp",
            Self::BOILER_RETURN_TEMP => "boiler_return_temp",
            Self::OPENTHERM => "opentherm_msg",
            Self::ACTUATOR_SYNC => "actuator_sync",
            Self::ACTUATOR_STATE => "actuator_state",
            Self::ACTUATOR_CYCLE => "actuator_cycle",
            _ => "unknown",
        }
    }

    /// The staleness horizon of a message carrying this code, or `None` for
    /// codes whose content never goes stale (schema-like facts and faults).
    pub fn lifetime(&self) -> Option<Duration> {
        match *self {
            Self::ZONE_NAME
            | Self::ZONE_CONFIG
            | Self::ZONE_ACTUATORS
            | Self::SYSTEM_ZONES
            | Self::DEVICE_INFO
            | Self::RF_BIND
            | Self::LANGUAGE
            | Self::SYSTEM_FAULT => None,
            Self::SYSTEM_SYNC => Some(Duration::from_secs(3 * 60)),
            Self::OPENTHERM | Self::ACTUATOR_CYCLE => Some(Duration::from_secs(5 * 60)),
            Self::ZONE_SCHEDULE => Some(Duration::from_secs(5 * 60)),
            Self::ZONE_TEMP | Self::SETPOINT | Self::HEAT_DEMAND | Self::RELAY_DEMAND => {
                Some(Duration::from_secs(60 * 60))
            }
            _ => Some(Duration::from_secs(60 * 60)),
        }
    }

    /// Whether an inform of this code is only ever originated by a
    /// controller, which is what eavesdrop promotion keys on.
    pub fn only_from_ctl(&self, verb: Verb) -> bool {
        match *self {
            Self::SYSTEM_SYNC | Self::SYSTEM_MODE | Self::SYSTEM_FAULT | Self::SYSTEM_ZONES => true,
            Self::SETPOINT | Self::TPI_PARAMS | Self::DATETIME | Self::ZONE_CONFIG => {
                verb == Verb::I
            }
            Self::ZONE_ACTUATORS => verb == Verb::Rp,
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_text_roundtrip() {
        ["1F09", "30C9", "0004", "3EF1"].iter().for_each(|s| {
            let code = Code::from_str(s).unwrap();
            assert_eq!(&code.to_string(), s);
        });
    }

    #[test]
    fn code_rejects_lowercase_and_length() {
        assert!(Code::from_str("1f09").is_err());
        assert!(Code::from_str("1F0").is_err());
        assert!(Code::from_str("1F099").is_err());
        assert!(Code::from_str("1G09").is_err());
    }

    #[test]
    fn controller_only_codes() {
        assert!(Code::SYSTEM_SYNC.only_from_ctl(Verb::I));
        assert!(Code::SETPOINT.only_from_ctl(Verb::I));
        assert!(!Code::SETPOINT.only_from_ctl(Verb::W));
        assert!(!Code::ZONE_TEMP.only_from_ctl(Verb::I));
    }

    #[test]
    fn schema_codes_do_not_expire() {
        assert!(Code::ZONE_NAME.lifetime().is_none());
        assert!(Code::SYSTEM_FAULT.lifetime().is_none());
        assert!(Code::ZONE_TEMP.lifetime().is_some());
    }
}
