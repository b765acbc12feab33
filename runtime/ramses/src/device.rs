// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The device half of the entity fabric.
//!
//! Every device keeps the last message seen per opcode and derives its view
//! of the world lazily from that cache. Capability traits read the cache;
//! a device class decides which trait views make up its status.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use ramses_protocols::{
    addr::{DeviceClass, DeviceId},
    codes::Code,
    command::{Command, Priority},
    message::Message,
    opentherm::{self, OtFrame},
    parsers::Payload,
    Verb,
};

use super::error::RamsesError;

/// The three recurring discovery cycles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Discover {
    Schema,
    Params,
    Status,
}

impl Discover {
    pub const ALL: [Discover; 3] = [Self::Schema, Self::Params, Self::Status];

    pub fn interval(&self) -> Duration {
        match self {
            Self::Schema => Duration::from_secs(24 * 3600),
            Self::Params => Duration::from_secs(6 * 3600),
            Self::Status => Duration::from_secs(60),
        }
    }

    fn slot(&self) -> usize {
        match self {
            Self::Schema => 0,
            Self::Params => 1,
            Self::Status => 2,
        }
    }
}

/// What a device asks the gateway to do after consuming a message.
pub enum DeviceEffect {
    /// The device revealed itself as a controller; a system is wanted.
    PromotedController,
    Send(Command),
}

/// Whether the boiler behind an OpenTherm bridge answers a data-id.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OtSupport {
    /// One unsupported-looking reply seen; one more deprecates it.
    Suspect,
    Unsupported,
    Supported,
}

#[derive(Default)]
struct OtbState {
    supported: HashMap<u8, OtSupport>,
    msgs: HashMap<u8, Message>,
}

#[derive(Default)]
struct UfhState {
    /// Circuit index to the zone it serves.
    circuits: HashMap<u8, u8>,
    setpoints: Option<Message>,
}

/// Which entity a device reports into, besides its controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parent {
    Zone(u8),
    Dhw(u8),
    System(u8),
}

pub struct Device {
    pub id: DeviceId,
    class: DeviceClass,
    msgs: HashMap<Code, Message>,
    last_dtm: Option<DateTime<Utc>>,
    ctl: Option<DeviceId>,
    parent: Option<Parent>,
    is_controller: Option<bool>,
    faulty_until: Option<DateTime<Utc>>,
    otb: Option<OtbState>,
    ufh: Option<UfhState>,
    next_discover: [Option<Instant>; 3],
}

impl Device {
    pub fn new(id: DeviceId) -> Device {
        debug!(%id, class = %id.class(), "creating a device");
        let class = id.class();
        Device {
            id,
            class,
            msgs: HashMap::new(),
            last_dtm: None,
            ctl: None,
            parent: None,
            is_controller: if class == DeviceClass::Ufc {
                Some(true)
            } else {
                None
            },
            faulty_until: None,
            otb: if class == DeviceClass::Otb {
                Some(OtbState::default())
            } else {
                None
            },
            ufh: if class == DeviceClass::Ufc {
                Some(UfhState::default())
            } else {
                None
            },
            next_discover: [None; 3],
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn ctl(&self) -> Option<DeviceId> {
        self.ctl
    }

    pub fn parent(&self) -> Option<Parent> {
        self.parent
    }

    pub fn is_controller(&self) -> bool {
        self.is_controller == Some(true)
    }

    /// Ignore the device's messages until `until` after a dispatch error.
    pub fn set_faulty_until(&mut self, until: DateTime<Utc>) {
        warn!(id = %self.id, "device marked faulty");
        self.faulty_until = Some(until);
    }

    /// Assign the parent controller, once.
    pub fn set_ctl(&mut self, ctl: DeviceId) -> Result<(), RamsesError> {
        match self.ctl {
            Some(current) if current == ctl => Ok(()),
            Some(current) => Err(RamsesError::CorruptState(format!(
                "{} changed controller: {} to {}",
                self.id, current, ctl
            ))),
            None => {
                debug!(id = %self.id, %ctl, "controller now set");
                self.ctl = Some(ctl);
                Ok(())
            }
        }
    }

    /// Assign the parent zone/domain, once. A conflicting second assignment
    /// is corrupt state.
    pub fn set_parent(&mut self, parent: Parent) -> Result<(), RamsesError> {
        match self.parent {
            Some(current) if current == parent => Ok(()),
            Some(current) => Err(RamsesError::CorruptState(format!(
                "{} changed parent: {:?} to {:?}",
                self.id, current, parent
            ))),
            None => {
                debug!(id = %self.id, ?parent, "parent now set");
                self.parent = Some(parent);
                Ok(())
            }
        }
    }

    /// Consume one message from this device.
    pub fn handle_msg(&mut self, msg: &Message) -> Result<Vec<DeviceEffect>, RamsesError> {
        if let Some(until) = self.faulty_until {
            if msg.dtm() < until {
                return Ok(Vec::new());
            }
            self.faulty_until = None;
        }

        // Per-device timestamps are monotone; replays of older traffic are
        // dropped here.
        if let Some(last) = self.last_dtm {
            if msg.dtm() < last {
                debug!(id = %self.id, "out-of-order message dropped");
                return Ok(Vec::new());
            }
        }
        self.last_dtm = Some(msg.dtm());

        self.reclass_on_signature(msg);

        let mut effects = Vec::new();

        if msg.verb() == Verb::I
            && msg.code().only_from_ctl(Verb::I)
            && msg.src() == msg.dst()
        {
            match self.is_controller {
                Some(false) => {
                    return Err(RamsesError::CorruptState(format!(
                        "{} shows controller traffic but is bound to {}",
                        self.id,
                        self.ctl.map(|c| c.to_string()).unwrap_or_default()
                    )));
                }
                None => {
                    info!(id = %self.id, code = %msg.code(), "promoted to controller");
                    self.is_controller = Some(true);
                    effects.push(DeviceEffect::PromotedController);
                }
                Some(true) => {}
            }
        }

        match (&msg.payload, msg.code()) {
            (Payload::OpenTherm(frame), _) => self.handle_opentherm(msg, frame),
            (Payload::ZoneDevices(zd), code)
                if code == Code::ZONE_ACTUATORS && self.class == DeviceClass::Ufc =>
            {
                if let Some(ufh) = self.ufh.as_mut() {
                    ufh.circuits.insert(zd.idx, zd.role);
                }
                self.msgs.insert(msg.code(), msg.clone());
            }
            (Payload::UfhSetpoints(_), _) if self.class == DeviceClass::Ufc => {
                if let Some(ufh) = self.ufh.as_mut() {
                    ufh.setpoints = Some(msg.clone());
                }
            }
            _ => {
                self.msgs.insert(msg.code(), msg.clone());
            }
        }

        // A relay announcing its state is asked for its cycle, gently.
        if self.class == DeviceClass::Bdr
            && msg.code() == Code::ACTUATOR_STATE
            && msg.verb() == Verb::I
        {
            effects.push(DeviceEffect::Send(
                Command::get_actuator_cycle(self.id)
                    .with_priority(Priority::Low)
                    .with_retries(1),
            ));
        }

        // A DHW sensor reading prompts the controller's view of it.
        if self.class == DeviceClass::DhwSensor
            && msg.code() == Code::DHW_TEMP
            && msg.verb() == Verb::I
        {
            if let Some(ctl) = self.ctl {
                effects.push(DeviceEffect::Send(Command::get_dhw_temp(ctl)));
            }
        }

        Ok(effects)
    }

    /// A 30-type device does not reveal whether it is an internet gateway or
    /// a ventilation unit until its traffic does.
    fn reclass_on_signature(&mut self, msg: &Message) {
        if self.class != DeviceClass::Rfg && self.class != DeviceClass::Dev {
            return;
        }
        if self.id.dev_type() != 30 {
            return;
        }
        let reclassed = match (msg.verb(), msg.code()) {
            (Verb::I, c) | (Verb::Rp, c)
                if matches!(c, Code::FAN_STATE | Code::VENT_STATE | Code::VENT_DEMAND) =>
            {
                Some(DeviceClass::Fan)
            }
            (Verb::Rq, c)
                if matches!(c, Code::SCHEDULE_SYNC | Code::SYSTEM_FAULT | Code::OPENTHERM) =>
            {
                Some(DeviceClass::Rfg)
            }
            (Verb::W, Code::DATETIME) => Some(DeviceClass::Rfg),
            _ => None,
        };
        if let Some(class) = reclassed {
            if self.class != class {
                info!(id = %self.id, from = %self.class, to = %class, "device reclassed");
                self.class = class;
            }
        }
    }

    fn handle_opentherm(&mut self, msg: &Message, frame: &OtFrame) {
        let otb = match self.otb.as_mut() {
            Some(otb) => otb,
            None => return,
        };

        let raw = (0..msg.pkt.payload.len())
            .step_by(2)
            .filter_map(|i| u8::from_str_radix(&msg.pkt.payload[i..i + 2], 16).ok())
            .collect::<Vec<u8>>();

        if OtFrame::is_deprecation_sentinel(&raw) || frame.msg_type.is_unsupported_reply() {
            let state = otb.supported.entry(frame.msg_id).or_insert(OtSupport::Suspect);
            match *state {
                OtSupport::Suspect => {
                    warn!(
                        msg_id = %format!("{:02X}", frame.msg_id),
                        "opentherm data-id appears unsupported, deprecating"
                    );
                    *state = OtSupport::Unsupported;
                }
                OtSupport::Supported => *state = OtSupport::Suspect,
                OtSupport::Unsupported => {}
            }
        } else if frame.msg_type.is_supported_reply() {
            otb.supported.insert(frame.msg_id, OtSupport::Supported);
            otb.msgs.insert(frame.msg_id, msg.clone());
        }
    }

    fn ot_supported(&self, msg_id: u8) -> bool {
        self.otb
            .as_ref()
            .and_then(|otb| otb.supported.get(&msg_id))
            .map_or(true, |s| *s != OtSupport::Unsupported)
    }

    fn ot_value(&self, msg_id: u8) -> Option<f64> {
        let otb = self.otb.as_ref()?;
        if !self.ot_supported(msg_id) {
            return None;
        }
        match &otb.msgs.get(&msg_id)?.payload {
            Payload::OpenTherm(frame) => frame.value,
            _ => None,
        }
    }

    /// The discovery cycles now due, advancing their schedules. A fresh
    /// device spreads its first cycles by a delay derived from its id, so a
    /// restart does not burst.
    pub fn due_discovery(&mut self, now: Instant) -> Vec<Discover> {
        let spread = Duration::from_secs(10 + (self.id.number() % 11) as u64);
        let mut due = Vec::new();
        for kind in Discover::ALL.iter() {
            let slot = kind.slot();
            let next = self.next_discover[slot].get_or_insert(match kind {
                Discover::Schema => now,
                Discover::Params => now + spread,
                Discover::Status => now + spread + Duration::from_secs(1),
            });
            if *next <= now {
                *next = now + kind.interval();
                due.push(*kind);
            }
        }
        due
    }

    /// The commands one discovery cycle asks for.
    pub fn discover(&self, kind: Discover) -> Vec<Command> {
        let mut cmds = Vec::new();
        match (kind, self.class) {
            (_, DeviceClass::Hgi) => {}
            (Discover::Schema, DeviceClass::Otb) => {
                cmds.push(Command::get_device_info(self.id));
                for &id in opentherm::SCHEMA_MSG_IDS {
                    if self.ot_supported(id) {
                        cmds.push(Command::get_opentherm_data(self.id, id));
                    }
                }
            }
            (Discover::Params, DeviceClass::Otb) => {
                for &id in opentherm::PARAMS_MSG_IDS {
                    if self.ot_supported(id) {
                        cmds.push(Command::get_opentherm_data(self.id, id));
                    }
                }
            }
            (Discover::Status, DeviceClass::Otb) => {
                for &id in opentherm::STATUS_MSG_IDS {
                    if self.ot_supported(id) {
                        cmds.push(Command::get_opentherm_data(self.id, id).with_retries(0));
                    }
                }
            }
            (Discover::Schema, DeviceClass::Ufc) => {
                for idx in 0..8 {
                    cmds.push(Command::get_zone_actuators(self.id, idx, 0x00));
                }
            }
            (Discover::Schema, _) => {
                if !self.msgs.contains_key(&Code::DEVICE_INFO) {
                    cmds.push(Command::get_device_info(self.id));
                }
                cmds.push(Command::get_rf_bind(self.id));
            }
            (Discover::Status, DeviceClass::Bdr) => {
                cmds.push(
                    Command::get_relay_demand(self.id)
                        .with_priority(Priority::Low)
                        .with_retries(1),
                );
            }
            (Discover::Status, _) => {
                cmds.push(Command::get_rf_check(self.id));
            }
            (Discover::Params, _) => {}
        }
        cmds
    }

    /// The fixed facts of the device.
    pub fn schema(&self) -> Value {
        let mut map = json!({
            "class": self.class.to_string(),
        });
        if let Some(Payload::DeviceInfo(info)) = self.msgs.get(&Code::DEVICE_INFO).map(|m| &m.payload)
        {
            map["device_info"] = json!(info);
        }
        if let Some(Payload::RfBind(triples)) = self.msgs.get(&Code::RF_BIND).map(|m| &m.payload) {
            map["rf_bind"] = json!(triples);
        }
        map
    }

    /// The configurable attributes of the device.
    pub fn params(&self) -> Value {
        match self.class {
            DeviceClass::Ufc => {
                let setpoints = self
                    .ufh
                    .as_ref()
                    .and_then(|u| u.setpoints.as_ref())
                    .map(|m| match &m.payload {
                        Payload::UfhSetpoints(v) => json!(v),
                        _ => Value::Null,
                    })
                    .unwrap_or(Value::Null);
                json!({ "circuits": setpoints })
            }
            _ => json!({}),
        }
    }

    /// The state attributes of the device: the union of its capability
    /// trait views.
    pub fn status(&self) -> Value {
        let mut map = serde_json::Map::new();
        match self.class {
            DeviceClass::Thm => {
                map.insert("temperature".into(), json!(self.temperature()));
                map.insert("setpoint".into(), json!(self.setpoint()));
                map.insert("battery_state".into(), json!(self.battery_state()));
            }
            DeviceClass::Trv => {
                map.insert("temperature".into(), json!(self.temperature()));
                map.insert("setpoint".into(), json!(self.setpoint()));
                map.insert("heat_demand".into(), json!(self.heat_demand()));
                map.insert("battery_state".into(), json!(self.battery_state()));
                map.insert("window_open".into(), json!(self.window_open()));
            }
            DeviceClass::Bdr => {
                map.insert("relay_demand".into(), json!(self.relay_demand()));
                map.insert("actuator_state".into(), json!(self.actuator_state()));
                map.insert("actuator_cycle".into(), json!(self.actuator_cycle()));
            }
            DeviceClass::DhwSensor => {
                map.insert("temperature".into(), json!(self.temperature()));
                map.insert("battery_state".into(), json!(self.battery_state()));
            }
            DeviceClass::Ext => {
                map.insert("temperature".into(), json!(self.temperature()));
            }
            DeviceClass::Otb => {
                map.insert("modulation_level".into(), json!(self.modulation_level()));
                map.insert("heat_demand".into(), json!(self.heat_demand()));
                map.insert("boiler_output_temp".into(), json!(self.ot_value(0x19)));
                map.insert("boiler_return_temp".into(), json!(self.ot_value(0x1c)));
                map.insert("boiler_setpoint".into(), json!(self.ot_value(0x01)));
                map.insert("ch_water_pressure".into(), json!(self.ot_value(0x12)));
                map.insert("dhw_flow_rate".into(), json!(self.ot_value(0x13)));
                map.insert("dhw_temp".into(), json!(self.ot_value(0x1a)));
                map.insert("outside_temp".into(), json!(self.ot_value(0x1b)));
            }
            DeviceClass::Ufc => {
                map.insert("heat_demand".into(), json!(self.heat_demand()));
                let circuits: HashMap<String, u8> = self
                    .ufh
                    .as_ref()
                    .map(|u| {
                        u.circuits
                            .iter()
                            .map(|(k, v)| (format!("{:02X}", k), *v))
                            .collect()
                    })
                    .unwrap_or_default();
                map.insert("circuits".into(), json!(circuits));
            }
            DeviceClass::Fan => {
                if let Some(Payload::FanState(f)) =
                    self.msgs.get(&Code::FAN_STATE).map(|m| &m.payload)
                {
                    map.insert("fan_rate".into(), json!(f.fan_rate));
                }
                if let Some(Payload::VentState(v)) =
                    self.msgs.get(&Code::VENT_STATE).map(|m| &m.payload)
                {
                    map.insert("co2_ppm".into(), json!(v.co2_ppm));
                    map.insert("indoor_humidity".into(), json!(v.indoor_humidity));
                }
            }
            _ => {}
        }
        Value::Object(map)
    }
}

/// Read access to the per-opcode message cache.
pub trait MessageCache {
    fn cached(&self, code: Code) -> Option<&Message>;
}

impl MessageCache for Device {
    fn cached(&self, code: Code) -> Option<&Message> {
        self.msgs.get(&code)
    }
}

pub trait HasBattery: MessageCache {
    fn battery_low(&self) -> Option<bool> {
        match &self.cached(Code::BATTERY_STATE)?.payload {
            Payload::BatteryState(b) => Some(b.low),
            _ => None,
        }
    }

    fn battery_state(&self) -> Option<Value> {
        match &self.cached(Code::BATTERY_STATE)?.payload {
            Payload::BatteryState(b) => serde_json::to_value(b).ok(),
            _ => None,
        }
    }
}

pub trait HasTemperature: MessageCache {
    fn temperature(&self) -> Option<f64> {
        if let Some(msg) = self.cached(Code::ZONE_TEMP) {
            if let Payload::ZoneTemps(v) = &msg.payload {
                if let [one] = v.as_slice() {
                    return one.temp;
                }
            }
        }
        if let Some(msg) = self.cached(Code::DHW_TEMP) {
            if let Payload::DhwTemp(t) = &msg.payload {
                return t.temp;
            }
        }
        match self.cached(Code::OUTDOOR_SENSOR).map(|m| &m.payload) {
            Some(Payload::OutdoorSensor(m)) => m.value,
            _ => None,
        }
    }
}

pub trait HasSetpoint: MessageCache {
    fn setpoint(&self) -> Option<f64> {
        match &self.cached(Code::SETPOINT)?.payload {
            Payload::Setpoints(v) => match v.as_slice() {
                [one] => one.setpoint,
                _ => None,
            },
            _ => None,
        }
    }
}

pub trait HasHeatDemand: MessageCache {
    fn heat_demand(&self) -> Option<f64> {
        match &self.cached(Code::HEAT_DEMAND)?.payload {
            Payload::HeatDemands(v) => match v.as_slice() {
                [one] => one.demand,
                _ => None,
            },
            _ => None,
        }
    }
}

pub trait HasRelayDemand: MessageCache {
    fn relay_demand(&self) -> Option<f64> {
        match &self.cached(Code::RELAY_DEMAND)?.payload {
            Payload::RelayDemand(r) => r.demand,
            _ => None,
        }
    }
}

pub trait HasActuator: MessageCache {
    fn actuator_state(&self) -> Option<Value> {
        match &self.cached(Code::ACTUATOR_STATE)?.payload {
            Payload::ActuatorState(s) => serde_json::to_value(s).ok(),
            _ => None,
        }
    }

    fn actuator_cycle(&self) -> Option<Value> {
        match &self.cached(Code::ACTUATOR_CYCLE)?.payload {
            Payload::ActuatorCycle(c) => serde_json::to_value(c).ok(),
            _ => None,
        }
    }

    fn modulation_level(&self) -> Option<f64> {
        match &self.cached(Code::ACTUATOR_STATE)?.payload {
            Payload::ActuatorState(s) => s.modulation_level,
            _ => None,
        }
    }
}

pub trait HasWindowState: MessageCache {
    fn window_open(&self) -> Option<bool> {
        match &self.cached(Code::WINDOW_STATE)?.payload {
            Payload::WindowState(w) => w.open,
            _ => None,
        }
    }
}

impl HasBattery for Device {}
impl HasTemperature for Device {}
impl HasSetpoint for Device {}
impl HasHeatDemand for Device {}
impl HasRelayDemand for Device {}
impl HasActuator for Device {}
impl HasWindowState for Device {}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use ramses_protocols::packet::Packet;
    use std::str::FromStr;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap()
    }

    fn msg_at(line: &str, dtm: DateTime<Utc>) -> Message {
        Message::new(Packet::from_line(line, dtm).unwrap())
    }

    fn msg(line: &str) -> Message {
        msg_at(line, now())
    }

    #[test]
    fn controller_promotion_on_announce() {
        let id = DeviceId::from_str("01:145039").unwrap();
        let mut dev = Device::new(id);
        let effects = dev
            .handle_msg(&msg(
                "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            ))
            .unwrap();
        assert!(dev.is_controller());
        assert!(matches!(
            effects.as_slice(),
            [DeviceEffect::PromotedController]
        ));

        // A second sync does not promote twice.
        let effects = dev
            .handle_msg(&msg_at(
                "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
                now() + chrono::Duration::seconds(10),
            ))
            .unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn reparenting_is_corrupt_state() {
        let id = DeviceId::from_str("04:056053").unwrap();
        let mut dev = Device::new(id);
        dev.set_parent(Parent::Zone(1)).unwrap();
        dev.set_parent(Parent::Zone(1)).unwrap();
        assert!(matches!(
            dev.set_parent(Parent::Zone(2)),
            Err(RamsesError::CorruptState(_))
        ));
    }

    #[test]
    fn controller_change_is_corrupt_state() {
        let id = DeviceId::from_str("04:056053").unwrap();
        let mut dev = Device::new(id);
        dev.set_ctl(DeviceId::from_str("01:145039").unwrap()).unwrap();
        assert!(matches!(
            dev.set_ctl(DeviceId::from_str("01:999999").unwrap()),
            Err(RamsesError::CorruptState(_))
        ));
    }

    #[test]
    fn out_of_order_messages_are_dropped() {
        let id = DeviceId::from_str("34:021943").unwrap();
        let mut dev = Device::new(id);
        dev.handle_msg(&msg_at(
            " I --- 34:021943 --:------ 34:021943 30C9 003 0007D0",
            now(),
        ))
        .unwrap();
        dev.handle_msg(&msg_at(
            " I --- 34:021943 --:------ 34:021943 30C9 003 000802",
            now() - chrono::Duration::seconds(30),
        ))
        .unwrap();
        assert_eq!(dev.temperature(), Some(20.0));
    }

    #[test]
    fn capability_views_read_the_cache() {
        let id = DeviceId::from_str("34:021943").unwrap();
        let mut dev = Device::new(id);
        dev.handle_msg(&msg(" I --- 34:021943 --:------ 34:021943 30C9 003 0007D0"))
            .unwrap();
        dev.handle_msg(&msg_at(
            " I --- 34:021943 --:------ 34:021943 1060 003 006401",
            now() + chrono::Duration::seconds(1),
        ))
        .unwrap();

        assert_eq!(dev.temperature(), Some(20.0));
        assert_eq!(dev.battery_low(), Some(false));
        let status = dev.status();
        assert_eq!(status["temperature"], json!(20.0));
    }

    #[test]
    fn otb_deprecates_after_two_strikes() {
        let id = DeviceId::from_str("10:048122").unwrap();
        let mut dev = Device::new(id);

        // Unknown-DataId reply for ch_water_pressure, twice.
        let line = "045 RP --- 10:048122 18:000730 --:------ 3220 005 0070120000";
        dev.handle_msg(&msg(line)).unwrap();
        assert!(dev.ot_supported(0x12));
        assert!(dev
            .discover(Discover::Status)
            .iter()
            .any(|cmd| cmd.payload == "0000120000"));

        dev.handle_msg(&msg_at(line, now() + chrono::Duration::seconds(5)))
            .unwrap();
        assert!(!dev.ot_supported(0x12));

        // Deprecated ids are no longer polled.
        let polled: Vec<Command> = Discover::ALL
            .iter()
            .flat_map(|kind| dev.discover(*kind))
            .collect();
        assert!(!polled.is_empty());
        assert!(polled.iter().all(|cmd| cmd.payload != "0000120000"));
    }

    #[test]
    fn otb_records_supported_readings() {
        let id = DeviceId::from_str("10:048122").unwrap();
        let mut dev = Device::new(id);
        // Read-Ack of boiler_output_temp = 54.5.
        dev.handle_msg(&msg(
            "045 RP --- 10:048122 18:000730 --:------ 3220 005 0040193680",
        ))
        .unwrap();
        assert_eq!(dev.ot_value(0x19), Some(54.5));
        assert_eq!(dev.status()["boiler_output_temp"], json!(54.5));
    }

    #[test]
    fn discovery_cycles_spread_and_repeat() {
        let id = DeviceId::from_str("34:021943").unwrap();
        let mut dev = Device::new(id);
        let t0 = Instant::now();

        let due = dev.due_discovery(t0);
        assert_eq!(due, vec![Discover::Schema]);

        // The id-derived spread delays params/status by 10..=20 s.
        let due = dev.due_discovery(t0 + Duration::from_secs(25));
        assert!(due.contains(&Discover::Params));
        assert!(due.contains(&Discover::Status));

        let due = dev.due_discovery(t0 + Duration::from_secs(26));
        assert!(due.is_empty());

        let due = dev.due_discovery(t0 + Duration::from_secs(90));
        assert_eq!(due, vec![Discover::Status]);
    }

    #[test]
    fn rfg_and_fan_reclassing() {
        let id = DeviceId::from_str("30:082155").unwrap();
        let mut dev = Device::new(id);
        assert_eq!(dev.class(), DeviceClass::Rfg);

        dev.handle_msg(&msg(" I --- 30:082155 --:------ 30:082155 31D9 003 000A32"))
            .unwrap();
        assert_eq!(dev.class(), DeviceClass::Fan);
    }
}
