// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Payload decoders, dispatched by opcode.
//!
//! Each decoder consumes the raw octets of a payload and produces a typed
//! record, an indexed record, or an array of fixed-size records. A decoder
//! failure never discards the frame; the caller keeps it as unparsed.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use super::{
    addr::DeviceId,
    binding::BindTriple,
    codes::Code,
    hex_to_bytes,
    opentherm::OtFrame,
    Verb,
};

/// Zone indices run `00..0B`; these are the three actuator domains.
pub const DOMAIN_DHW_HTG: u8 = 0xf9;
pub const DOMAIN_DHW: u8 = 0xfa;
pub const DOMAIN_HTG: u8 = 0xfc;

pub const MAX_ZONES: u8 = 12;

/// Whether an index octet addresses a zone or one of the known domains.
pub fn is_valid_index(idx: u8) -> bool {
    idx < MAX_ZONES || matches!(idx, DOMAIN_DHW_HTG | DOMAIN_DHW | DOMAIN_HTG)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneTemp {
    pub idx: u8,
    pub temp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneSetpoint {
    pub idx: u8,
    pub setpoint: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneConfig {
    pub idx: u8,
    pub flags: u8,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
}

/// Operating mode of a zone or of stored hot water.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneMode {
    FollowSchedule,
    AdvancedOverride,
    PermanentOverride,
    Countdown,
    TemporaryOverride,
}

impl ZoneMode {
    fn from_wire(val: u8) -> Option<ZoneMode> {
        match val {
            0 => Some(Self::FollowSchedule),
            1 => Some(Self::AdvancedOverride),
            2 => Some(Self::PermanentOverride),
            3 => Some(Self::Countdown),
            4 => Some(Self::TemporaryOverride),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            Self::FollowSchedule => 0,
            Self::AdvancedOverride => 1,
            Self::PermanentOverride => 2,
            Self::Countdown => 3,
            Self::TemporaryOverride => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneModeSet {
    pub idx: u8,
    pub setpoint: Option<f64>,
    pub mode: ZoneMode,
    pub until: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneName {
    pub idx: u8,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneDevices {
    pub idx: u8,
    /// The role the listed devices play for the zone (actuator, sensor, ...).
    pub role: u8,
    pub devices: Vec<DeviceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoneList {
    pub zone_kind: u8,
    /// Bit N set when zone N is configured.
    pub mask: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatDemand {
    pub idx: u8,
    pub demand: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayDemand {
    pub idx: u8,
    pub demand: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RelayFailsafe {
    pub idx: u8,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UfhSetpoint {
    pub idx: u8,
    pub temp_low: Option<f64>,
    pub temp_high: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryState {
    pub idx: u8,
    pub level: Option<f64>,
    pub low: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorState {
    pub modulation_level: Option<f64>,
    pub ch_active: Option<bool>,
    pub dhw_active: Option<bool>,
    pub flame_active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorCycle {
    pub countdown_secs: u16,
    pub cycle_secs: u16,
    pub modulation_level: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorSync {
    pub idx: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DhwMode {
    pub idx: u8,
    pub active: Option<bool>,
    pub mode: ZoneMode,
    pub until: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DhwParams {
    pub idx: u8,
    pub setpoint: Option<f64>,
    pub overrun_mins: u8,
    pub differential: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemSync {
    /// Seconds until the controller's next sync broadcast.
    pub remaining_secs: f64,
}

/// Operating mode of the whole installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemModeKind {
    Auto,
    HeatOff,
    EcoBoost,
    Away,
    DayOff,
    DayOffEco,
    AutoWithReset,
    Custom,
}

impl SystemModeKind {
    fn from_wire(val: u8) -> Option<SystemModeKind> {
        match val {
            0 => Some(Self::Auto),
            1 => Some(Self::HeatOff),
            2 => Some(Self::EcoBoost),
            3 => Some(Self::Away),
            4 => Some(Self::DayOff),
            5 => Some(Self::DayOffEco),
            6 => Some(Self::AutoWithReset),
            7 => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn to_wire(&self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::HeatOff => 1,
            Self::EcoBoost => 2,
            Self::Away => 3,
            Self::DayOff => 4,
            Self::DayOffEco => 5,
            Self::AutoWithReset => 6,
            Self::Custom => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemMode {
    pub mode: SystemModeKind,
    pub until: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemTime {
    pub idx: u8,
    pub dtm: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TpiParams {
    pub idx: u8,
    /// Boiler cycles per hour.
    pub cycle_rate: f64,
    pub min_on_mins: f64,
    pub min_off_mins: f64,
    pub proportional_band_width: Option<f64>,
}

/// A single measurement keyed by index: temperatures, pressures, flow rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measure {
    pub idx: u8,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NowNext {
    pub idx: u8,
    pub setpoint_now: Option<f64>,
    pub setpoint_next: Option<f64>,
    pub countdown_mins: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowState {
    pub idx: u8,
    pub open: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RfCheck {
    pub idx: u8,
    pub strength: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    /// Hardware/firmware octets, not further interpreted.
    pub unknown: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Language {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleFragment {
    pub idx: u8,
    /// 0x20 for a heating zone schedule, 0x23 for stored hot water.
    pub kind: u8,
    pub frag_idx: u8,
    /// Zero until the first reply reveals the total.
    pub frag_cnt: u8,
    #[serde(skip)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleSync {
    pub change_counter: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultState {
    Fault,
    Restore,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    BatteryLow,
    CommsFault,
    SensorFault,
    SensorError,
    ActuatorFault,
    Other,
}

impl FaultKind {
    fn from_wire(val: u8) -> FaultKind {
        match val {
            0x04 => Self::BatteryLow,
            0x06 => Self::CommsFault,
            0x0a => Self::SensorFault,
            0x0b => Self::SensorError,
            0x0c => Self::ActuatorFault,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaultEntry {
    pub state: FaultState,
    pub kind: FaultKind,
    pub device_class: u8,
    pub device_id: DeviceId,
    pub dtm: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaultLogEntry {
    pub log_idx: u8,
    /// `None` marks the end of the log.
    pub entry: Option<FaultEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FanState {
    pub idx: u8,
    pub fan_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VentState {
    pub idx: u8,
    pub co2_ppm: Option<u16>,
    pub indoor_humidity: Option<f64>,
}

/// A parsed payload. Array variants carry one element per fixed-size record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    ZoneTemps(Vec<ZoneTemp>),
    Setpoints(Vec<ZoneSetpoint>),
    ZoneConfigs(Vec<ZoneConfig>),
    ZoneMode(ZoneModeSet),
    ZoneName(ZoneName),
    ZoneDevices(ZoneDevices),
    ZoneList(ZoneList),
    HeatDemands(Vec<HeatDemand>),
    RelayDemand(RelayDemand),
    RelayFailsafe(RelayFailsafe),
    UfhSetpoints(Vec<UfhSetpoint>),
    BatteryState(BatteryState),
    ActuatorState(ActuatorState),
    ActuatorCycle(ActuatorCycle),
    ActuatorSync(ActuatorSync),
    OutdoorSensor(Measure),
    DhwTemp(ZoneTemp),
    DhwMode(DhwMode),
    DhwParams(DhwParams),
    SystemSync(SystemSync),
    SystemMode(SystemMode),
    SystemTime(SystemTime),
    TpiParams(TpiParams),
    Measure(Measure),
    NowNext(NowNext),
    WindowState(WindowState),
    RfCheck(RfCheck),
    RfBind(Vec<BindTriple>),
    DeviceInfo(DeviceInfo),
    Language(Language),
    ScheduleFragment(ScheduleFragment),
    ScheduleSync(ScheduleSync),
    FaultLogEntry(FaultLogEntry),
    OpenTherm(OtFrame),
    FanState(FanState),
    VentState(VentState),
    /// Known frame, unknown opcode; the payload is surfaced verbatim.
    Raw(String),
    /// A decoder rejected the payload; the frame is kept.
    Unparsed { hex: String, reason: String },
}

impl Payload {
    /// The zone/domain/circuit index this payload addresses, when it has
    /// exactly one.
    pub fn index(&self) -> Option<u8> {
        fn single<T, F: Fn(&T) -> u8>(v: &[T], f: F) -> Option<u8> {
            match v {
                [one] => Some(f(one)),
                _ => None,
            }
        }
        match self {
            Self::ZoneTemps(v) => single(v, |r| r.idx),
            Self::Setpoints(v) => single(v, |r| r.idx),
            Self::ZoneConfigs(v) => single(v, |r| r.idx),
            Self::HeatDemands(v) => single(v, |r| r.idx),
            Self::UfhSetpoints(v) => single(v, |r| r.idx),
            Self::ZoneMode(r) => Some(r.idx),
            Self::ZoneName(r) => Some(r.idx),
            Self::ZoneDevices(r) => Some(r.idx),
            Self::RelayDemand(r) => Some(r.idx),
            Self::RelayFailsafe(r) => Some(r.idx),
            Self::BatteryState(r) => Some(r.idx),
            Self::ActuatorSync(r) => Some(r.idx),
            Self::DhwTemp(r) => Some(r.idx),
            Self::DhwMode(r) => Some(r.idx),
            Self::DhwParams(r) => Some(r.idx),
            Self::SystemTime(r) => Some(r.idx),
            Self::TpiParams(r) => Some(r.idx),
            Self::Measure(r) => Some(r.idx),
            Self::NowNext(r) => Some(r.idx),
            Self::WindowState(r) => Some(r.idx),
            Self::RfCheck(r) => Some(r.idx),
            Self::OutdoorSensor(r) => Some(r.idx),
            Self::ScheduleFragment(r) => Some(r.idx),
            Self::FaultLogEntry(r) => Some(r.log_idx),
            Self::FanState(r) => Some(r.idx),
            Self::VentState(r) => Some(r.idx),
            _ => None,
        }
    }
}

/// A signed 16-bit centi-degree temperature; `0x7FFF` is null.
pub fn parse_temp(raw: &[u8]) -> Result<Option<f64>, PayloadError> {
    if raw.len() < 2 {
        return Err(PayloadError::TooShort(raw.len()));
    }
    let val = u16::from_be_bytes([raw[0], raw[1]]);
    if val == 0x7fff {
        Ok(None)
    } else {
        Ok(Some(val as i16 as f64 / 100.0))
    }
}

/// Encode a centi-degree temperature, `None` as the null sentinel.
pub fn temp_to_wire(temp: Option<f64>) -> [u8; 2] {
    match temp {
        Some(t) => ((t * 100.0).round() as i16 as u16).to_be_bytes(),
        None => [0x7f, 0xff],
    }
}

/// A percentage in half-percent steps; `0xEF` and `0xFF` are null.
pub fn parse_percent(val: u8) -> Option<f64> {
    match val {
        0xef | 0xff => None,
        v => Some(v.min(0xc8) as f64 / 200.0),
    }
}

pub fn percent_to_wire(pct: Option<f64>) -> u8 {
    match pct {
        Some(p) => (p.max(0.0).min(1.0) * 200.0).round() as u8,
        None => 0xff,
    }
}

/// `0x00` false, `0xC8` true, anything else null.
pub fn parse_bool(val: u8) -> Option<bool> {
    match val {
        0x00 => Some(false),
        0xc8 => Some(true),
        _ => None,
    }
}

/// Minutes since midnight, 16-bit little-endian.
pub fn parse_le_minutes(raw: &[u8]) -> Result<u16, PayloadError> {
    if raw.len() < 2 {
        Err(PayloadError::TooShort(raw.len()))
    } else {
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }
}

/// The 7-octet datetime: seconds, minutes, hours, day, month, year (BE16).
/// All-ones and all-zeroes are both null.
pub fn parse_dtm7(raw: &[u8]) -> Result<Option<NaiveDateTime>, PayloadError> {
    if raw.len() < 7 {
        return Err(PayloadError::TooShort(raw.len()));
    }
    if raw[..7].iter().all(|&b| b == 0xff) || raw[..7].iter().all(|&b| b == 0x00) {
        return Ok(None);
    }
    let year = u16::from_be_bytes([raw[5], raw[6]]) as i32;
    NaiveDate::from_ymd_opt(year, raw[4] as u32, raw[3] as u32)
        .and_then(|d| d.and_hms_opt(raw[2] as u32, raw[1] as u32, raw[0] as u32))
        .map(Some)
        .ok_or_else(|| PayloadError::BadValue(format!("datetime: {:02X?}", &raw[..7])))
}

pub fn dtm7_to_wire(dtm: Option<NaiveDateTime>) -> [u8; 7] {
    use chrono::{Datelike, Timelike};
    match dtm {
        None => [0xff; 7],
        Some(t) => {
            let year = (t.year() as u16).to_be_bytes();
            [
                t.second() as u8,
                t.minute() as u8,
                t.hour() as u8,
                t.day() as u8,
                t.month() as u8,
                year[0],
                year[1],
            ]
        }
    }
}

fn check_len(raw: &[u8], at_least: usize) -> Result<(), PayloadError> {
    if raw.len() < at_least {
        Err(PayloadError::TooShort(raw.len()))
    } else {
        Ok(())
    }
}

fn records(raw: &[u8], size: usize) -> Result<std::slice::Chunks<'_, u8>, PayloadError> {
    if raw.is_empty() || raw.len() % size != 0 {
        Err(PayloadError::BadRecordLength(raw.len()))
    } else {
        Ok(raw.chunks(size))
    }
}

/// Decode one payload. Requests carry context only and are not decoded.
pub fn parse_payload(code: Code, verb: Verb, hex: &str) -> Result<Payload, PayloadError> {
    let raw = hex_to_bytes(hex).ok_or(PayloadError::OddLength)?;

    if verb == Verb::Rq {
        return Ok(Payload::Raw(hex.to_string()));
    }

    match code {
        Code::ZONE_TEMP => records(&raw, 3)?
            .map(|r| parse_temp(&r[1..]).map(|temp| ZoneTemp { idx: r[0], temp }))
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::ZoneTemps),
        Code::SETPOINT => records(&raw, 3)?
            .map(|r| parse_temp(&r[1..]).map(|setpoint| ZoneSetpoint { idx: r[0], setpoint }))
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Setpoints),
        Code::ZONE_CONFIG => records(&raw, 6)?
            .map(|r| {
                Ok(ZoneConfig {
                    idx: r[0],
                    flags: r[1],
                    min_temp: parse_temp(&r[2..4])?,
                    max_temp: parse_temp(&r[4..6])?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::ZoneConfigs),
        Code::ZONE_MODE => {
            check_len(&raw, 7)?;
            let mode = ZoneMode::from_wire(raw[3])
                .ok_or_else(|| PayloadError::BadValue(format!("zone mode: {:02X}", raw[3])))?;
            let until = if raw.len() >= 14 {
                parse_dtm7(&raw[7..14])?
            } else {
                None
            };
            Ok(Payload::ZoneMode(ZoneModeSet {
                idx: raw[0],
                setpoint: parse_temp(&raw[1..3])?,
                mode,
                until,
            }))
        }
        Code::ZONE_NAME => {
            check_len(&raw, 2)?;
            let name = if raw.len() <= 2 || raw[2] == 0x7f {
                None
            } else {
                let text: String = raw[2..]
                    .iter()
                    .take_while(|&&b| b != 0x00)
                    .map(|&b| b as char)
                    .filter(|c| c.is_ascii() && !c.is_ascii_control())
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            };
            Ok(Payload::ZoneName(ZoneName { idx: raw[0], name }))
        }
        Code::ZONE_ACTUATORS => {
            check_len(&raw, 2)?;
            if (raw.len() - 2) % 3 != 0 {
                return Err(PayloadError::BadRecordLength(raw.len()));
            }
            let devices = raw[2..]
                .chunks(3)
                .filter(|r| *r != [0x7f, 0xff, 0xff])
                .map(|r| DeviceId::from_wire(r).map_err(|e| PayloadError::BadValue(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Payload::ZoneDevices(ZoneDevices {
                idx: raw[0],
                role: raw[1],
                devices,
            }))
        }
        Code::SYSTEM_ZONES => {
            check_len(&raw, 4)?;
            Ok(Payload::ZoneList(ZoneList {
                zone_kind: raw[1],
                mask: u16::from_le_bytes([raw[2], raw[3]]),
            }))
        }
        Code::HEAT_DEMAND => records(&raw, 2)?
            .map(|r| {
                Ok(HeatDemand {
                    idx: r[0],
                    demand: parse_percent(r[1]),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::HeatDemands),
        Code::RELAY_DEMAND => {
            check_len(&raw, 2)?;
            Ok(Payload::RelayDemand(RelayDemand {
                idx: raw[0],
                demand: parse_percent(raw[1]),
            }))
        }
        Code::RELAY_FAILSAFE => {
            check_len(&raw, 2)?;
            Ok(Payload::RelayFailsafe(RelayFailsafe {
                idx: raw[0],
                enabled: raw[1] != 0,
            }))
        }
        Code::UFH_SETPOINT => records(&raw, 6)?
            .map(|r| {
                Ok(UfhSetpoint {
                    idx: r[0],
                    temp_low: parse_temp(&r[1..3])?,
                    temp_high: parse_temp(&r[3..5])?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::UfhSetpoints),
        Code::BATTERY_STATE => {
            check_len(&raw, 3)?;
            Ok(Payload::BatteryState(BatteryState {
                idx: raw[0],
                level: parse_percent(raw[1]),
                low: raw[2] == 0x00,
            }))
        }
        Code::ACTUATOR_STATE => {
            check_len(&raw, 3)?;
            let (ch, dhw, flame) = if raw.len() >= 6 {
                (
                    Some(raw[3] & 0x02 != 0),
                    Some(raw[3] & 0x04 != 0),
                    Some(raw[3] & 0x08 != 0),
                )
            } else {
                (None, None, None)
            };
            Ok(Payload::ActuatorState(ActuatorState {
                modulation_level: parse_percent(raw[1]),
                ch_active: ch,
                dhw_active: dhw,
                flame_active: flame,
            }))
        }
        Code::ACTUATOR_CYCLE => {
            check_len(&raw, 6)?;
            Ok(Payload::ActuatorCycle(ActuatorCycle {
                countdown_secs: u16::from_be_bytes([raw[1], raw[2]]),
                cycle_secs: u16::from_be_bytes([raw[3], raw[4]]),
                modulation_level: parse_percent(raw[5]),
            }))
        }
        Code::ACTUATOR_SYNC => {
            check_len(&raw, 1)?;
            Ok(Payload::ActuatorSync(ActuatorSync { idx: raw[0] }))
        }
        Code::OUTDOOR_SENSOR => {
            check_len(&raw, 3)?;
            Ok(Payload::OutdoorSensor(Measure {
                idx: raw[0],
                value: parse_temp(&raw[1..3])?,
            }))
        }
        Code::DHW_TEMP => {
            check_len(&raw, 3)?;
            Ok(Payload::DhwTemp(ZoneTemp {
                idx: raw[0],
                temp: parse_temp(&raw[1..3])?,
            }))
        }
        Code::DHW_MODE => {
            check_len(&raw, 3)?;
            let mode = ZoneMode::from_wire(raw[2])
                .ok_or_else(|| PayloadError::BadValue(format!("dhw mode: {:02X}", raw[2])))?;
            let until = if raw.len() >= 13 {
                parse_dtm7(&raw[6..13])?
            } else {
                None
            };
            Ok(Payload::DhwMode(DhwMode {
                idx: raw[0],
                active: parse_bool(raw[1]),
                mode,
                until,
            }))
        }
        Code::DHW_PARAMS => {
            check_len(&raw, 6)?;
            Ok(Payload::DhwParams(DhwParams {
                idx: raw[0],
                setpoint: parse_temp(&raw[1..3])?,
                overrun_mins: raw[3],
                differential: parse_temp(&raw[4..6])?,
            }))
        }
        Code::SYSTEM_SYNC => {
            check_len(&raw, 3)?;
            Ok(Payload::SystemSync(SystemSync {
                remaining_secs: u16::from_be_bytes([raw[1], raw[2]]) as f64 / 10.0,
            }))
        }
        Code::SYSTEM_MODE => {
            check_len(&raw, 8)?;
            let mode = SystemModeKind::from_wire(raw[0])
                .ok_or_else(|| PayloadError::BadValue(format!("system mode: {:02X}", raw[0])))?;
            Ok(Payload::SystemMode(SystemMode {
                mode,
                until: parse_dtm7(&raw[1..8])?,
            }))
        }
        Code::DATETIME => {
            check_len(&raw, 9)?;
            let dtm = parse_dtm7(&raw[2..9])?
                .ok_or_else(|| PayloadError::BadValue("null datetime".to_string()))?;
            Ok(Payload::SystemTime(SystemTime { idx: raw[0], dtm }))
        }
        Code::TPI_PARAMS => {
            check_len(&raw, 5)?;
            let band = if raw.len() >= 7 {
                parse_temp(&raw[5..7])?
            } else {
                None
            };
            Ok(Payload::TpiParams(TpiParams {
                idx: raw[0],
                cycle_rate: raw[1] as f64 / 4.0,
                min_on_mins: raw[2] as f64 / 4.0,
                min_off_mins: raw[3] as f64 / 4.0,
                proportional_band_width: band,
            }))
        }
        Code::BOILER_SETPOINT
        | Code::MAX_CH_SETPOINT
        | Code::OUTDOOR_TEMP
        | Code::CH_PRESSURE
        | Code::DHW_FLOW_RATE
        | Code::BOILER_OUTPUT_TEMP
        | Code::BOILER_RETURN_TEMP
        | Code::UNKNOWN_1090 => {
            check_len(&raw, 3)?;
            Ok(Payload::Measure(Measure {
                idx: raw[0],
                value: parse_temp(&raw[1..3])?,
            }))
        }
        Code::NOW_NEXT_SETPOINT => {
            check_len(&raw, 7)?;
            Ok(Payload::NowNext(NowNext {
                idx: raw[0],
                setpoint_now: parse_temp(&raw[1..3])?,
                setpoint_next: parse_temp(&raw[3..5])?,
                countdown_mins: parse_le_minutes(&raw[5..7])?,
            }))
        }
        Code::WINDOW_STATE => {
            check_len(&raw, 3)?;
            let open = match u16::from_be_bytes([raw[1], raw[2]]) {
                0x0000 => Some(false),
                0xc800 => Some(true),
                _ => None,
            };
            Ok(Payload::WindowState(WindowState { idx: raw[0], open }))
        }
        Code::RF_CHECK => {
            check_len(&raw, 2)?;
            Ok(Payload::RfCheck(RfCheck {
                idx: raw[0],
                strength: raw[1],
            }))
        }
        Code::RF_BIND => records(&raw, 6)?
            .map(|r| BindTriple::from_wire(r).map_err(PayloadError::BadValue))
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::RfBind),
        Code::DEVICE_INFO => {
            check_len(&raw, 2)?;
            let split = raw.len().min(18);
            let description: String = raw[split..]
                .iter()
                .take_while(|&&b| b != 0x00)
                .map(|&b| b as char)
                .filter(|c| c.is_ascii() && !c.is_ascii_control())
                .collect();
            Ok(Payload::DeviceInfo(DeviceInfo {
                unknown: super::bytes_to_hex(&raw[..split]),
                description,
            }))
        }
        Code::LANGUAGE => {
            check_len(&raw, 3)?;
            Ok(Payload::Language(Language {
                code: raw[1..3].iter().map(|&b| b as char).collect(),
            }))
        }
        Code::ZONE_SCHEDULE => {
            check_len(&raw, 6)?;
            Ok(Payload::ScheduleFragment(ScheduleFragment {
                idx: raw[0],
                kind: raw[1],
                frag_idx: raw[4],
                frag_cnt: raw[5],
                data: raw[6..].to_vec(),
            }))
        }
        Code::SCHEDULE_SYNC => {
            check_len(&raw, 4)?;
            Ok(Payload::ScheduleSync(ScheduleSync {
                change_counter: u16::from_be_bytes([raw[2], raw[3]]),
            }))
        }
        Code::SYSTEM_FAULT => {
            check_len(&raw, 16)?;
            let log_idx = raw[1];
            let device_id = DeviceId::from_wire(&raw[6..9])
                .map_err(|e| PayloadError::BadValue(e.to_string()))?;
            let dtm = parse_dtm7(&raw[9..16])?;
            let entry = match dtm {
                Some(dtm) if device_id != DeviceId::from_wire(&[0x7f, 0xff, 0xff]).unwrap() => {
                    Some(FaultEntry {
                        state: match raw[2] {
                            0x00 => FaultState::Fault,
                            0xc0 => FaultState::Restore,
                            _ => FaultState::Unknown,
                        },
                        kind: FaultKind::from_wire(raw[3]),
                        device_class: raw[4],
                        device_id,
                        dtm,
                    })
                }
                _ => None,
            };
            Ok(Payload::FaultLogEntry(FaultLogEntry { log_idx, entry }))
        }
        Code::OPENTHERM => OtFrame::from_wire(&raw)
            .map(Payload::OpenTherm)
            .map_err(PayloadError::BadValue),
        Code::FAN_STATE => {
            check_len(&raw, 3)?;
            Ok(Payload::FanState(FanState {
                idx: raw[0],
                fan_rate: parse_percent(raw[2]),
            }))
        }
        Code::VENT_STATE => {
            check_len(&raw, 6)?;
            let co2 = match u16::from_be_bytes([raw[2], raw[3]]) {
                0x7fff => None,
                v => Some(v),
            };
            Ok(Payload::VentState(VentState {
                idx: raw[0],
                co2_ppm: co2,
                indoor_humidity: parse_percent(raw[4]),
            }))
        }
        _ => Ok(Payload::Raw(hex.to_string())),
    }
}

/// The error to decode a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The hex string has an odd number of digits.
    OddLength,
    /// Insufficient octets for the fixed fields.
    TooShort(usize),
    /// Not a valid concatenation of fixed-size records.
    BadRecordLength(usize),
    BadValue(String),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OddLength => write!(f, "odd number of hex digits"),
            Self::TooShort(len) => write!(f, "payload of {} octets is too short", len),
            Self::BadRecordLength(len) => {
                write!(f, "payload of {} octets is not a whole number of records", len)
            }
            Self::BadValue(s) => write!(f, "invalid field: {}", s),
        }
    }
}

impl std::error::Error for PayloadError {}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(code: Code, hex: &str) -> Payload {
        parse_payload(code, Verb::Rp, hex).unwrap()
    }

    #[test]
    fn temp_sentinels() {
        assert_eq!(parse_temp(&[0x07, 0xd0]).unwrap(), Some(20.0));
        assert_eq!(parse_temp(&[0x7f, 0xff]).unwrap(), None);
        assert_eq!(parse_temp(&[0xff, 0x38]).unwrap(), Some(-2.0));
        assert_eq!(temp_to_wire(Some(20.0)), [0x07, 0xd0]);
        assert_eq!(temp_to_wire(None), [0x7f, 0xff]);
    }

    #[test]
    fn percent_sentinels() {
        assert_eq!(parse_percent(0x64), Some(0.5));
        assert_eq!(parse_percent(0xc8), Some(1.0));
        assert_eq!(parse_percent(0xef), None);
        assert_eq!(parse_percent(0xff), None);
    }

    #[test]
    fn zone_temp_single_and_array() {
        match parse(Code::ZONE_TEMP, "0007D0") {
            Payload::ZoneTemps(v) => {
                assert_eq!(v, vec![ZoneTemp { idx: 0, temp: Some(20.0) }]);
            }
            p => panic!("{:?}", p),
        }
        match parse(Code::ZONE_TEMP, "0007D00107D2027FFF") {
            Payload::ZoneTemps(v) => {
                assert_eq!(v.len(), 3);
                assert_eq!(v[1].temp, Some(20.02));
                assert_eq!(v[2].temp, None);
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn zone_temp_rejects_ragged_payload() {
        assert_eq!(
            parse_payload(Code::ZONE_TEMP, Verb::Rp, "0007"),
            Err(PayloadError::BadRecordLength(2))
        );
    }

    #[test]
    fn heat_demand_domain() {
        match parse(Code::HEAT_DEMAND, "FC5C") {
            Payload::HeatDemands(v) => {
                assert_eq!(v[0].idx, DOMAIN_HTG);
                assert_eq!(v[0].demand, Some(0.46));
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn battery_state() {
        match parse(Code::BATTERY_STATE, "006400") {
            Payload::BatteryState(b) => {
                assert_eq!(b.level, Some(0.5));
                assert!(b.low);
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn system_sync_remaining() {
        match parse(Code::SYSTEM_SYNC, "FF04B5") {
            Payload::SystemSync(s) => assert_eq!(s.remaining_secs, 120.5),
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn system_mode_with_and_without_until() {
        match parse(Code::SYSTEM_MODE, "03FFFFFFFFFFFFFF") {
            Payload::SystemMode(m) => {
                assert_eq!(m.mode, SystemModeKind::Away);
                assert_eq!(m.until, None);
            }
            p => panic!("{:?}", p),
        }
        match parse(Code::SYSTEM_MODE, "040000170C0A07E7") {
            Payload::SystemMode(m) => {
                assert_eq!(m.mode, SystemModeKind::DayOff);
                let until = m.until.unwrap();
                assert_eq!(until.to_string(), "2023-10-12 23:00:00");
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn zone_mode_rejects_unknown_mode() {
        assert!(matches!(
            parse_payload(Code::ZONE_MODE, Verb::Rp, "0007D009FFFFFF"),
            Err(PayloadError::BadValue(_))
        ));
    }

    #[test]
    fn zone_actuators_skips_absent_slots() {
        match parse(Code::ZONE_ACTUATORS, "000004D39D7FFFFF") {
            Payload::ZoneDevices(z) => {
                assert_eq!(z.devices.len(), 1);
                assert_eq!(z.devices[0].to_string(), "01:054173");
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn bind_triples() {
        match parse(Code::RF_BIND, "FC000804D39DFC315004D39D") {
            Payload::RfBind(v) => {
                assert_eq!(v.len(), 2);
                assert_eq!(v[0].idx, 0xfc);
                assert_eq!(v[0].code, Code::RELAY_DEMAND);
                assert_eq!(v[0].device_id.to_string(), "01:054173");
                assert_eq!(v[1].code, Code::HEAT_DEMAND);
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn schedule_fragment_header() {
        match parse(Code::ZONE_SCHEDULE, "01200008010368656C6C6F") {
            Payload::ScheduleFragment(f) => {
                assert_eq!(f.idx, 1);
                assert_eq!(f.frag_idx, 1);
                assert_eq!(f.frag_cnt, 3);
                assert_eq!(f.data, b"hello");
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn fault_log_entry_and_terminator() {
        match parse(Code::SYSTEM_FAULT, "000300060400 04D39D 001E0C150A07E7".replace(' ', "").as_str()) {
            Payload::FaultLogEntry(e) => {
                assert_eq!(e.log_idx, 3);
                let entry = e.entry.unwrap();
                assert_eq!(entry.kind, FaultKind::CommsFault);
                assert_eq!(entry.state, FaultState::Fault);
                assert_eq!(entry.device_id.to_string(), "01:054173");
            }
            p => panic!("{:?}", p),
        }
        match parse(Code::SYSTEM_FAULT, "000000000000 7FFFFF 00000000000000".replace(' ', "").as_str()) {
            Payload::FaultLogEntry(e) => {
                assert_eq!(e.log_idx, 0);
                assert!(e.entry.is_none());
            }
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn unknown_code_is_raw() {
        assert_eq!(
            parse(Code(0x7fff), "DEADBEEF"),
            Payload::Raw("DEADBEEF".to_string())
        );
    }

    #[test]
    fn requests_are_not_decoded() {
        assert_eq!(
            parse_payload(Code::ZONE_TEMP, Verb::Rq, "00").unwrap(),
            Payload::Raw("00".to_string())
        );
    }

    #[test]
    fn index_of_single_and_array() {
        assert_eq!(parse(Code::ZONE_TEMP, "0207D0").index(), Some(2));
        assert_eq!(parse(Code::ZONE_TEMP, "0007D00107D2").index(), None);
        assert_eq!(parse(Code::RELAY_DEMAND, "FA32").index(), Some(0xfa));
    }
}
