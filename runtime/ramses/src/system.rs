// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The temperature control system: zones, stored hot water, domain
//! actuators and the fault log, all hanging off one controller.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use ramses_protocols::{
    addr::DeviceId,
    codes::Code,
    command::Command,
    message::Message,
    parsers::{
        FaultEntry, Payload, ZoneConfig, ZoneModeSet, DOMAIN_DHW, DOMAIN_DHW_HTG, DOMAIN_HTG,
        MAX_ZONES,
    },
};

use super::error::RamsesError;
use super::fetch::Schedule;

/// Device roles carried in the second octet of a 000C exchange.
pub const ROLE_ACTUATOR: u8 = 0x00;
pub const ROLE_SENSOR: u8 = 0x04;
pub const ROLE_DHW_SENSOR: u8 = 0x0d;
pub const ROLE_DHW_VALVE: u8 = 0x0a;
pub const ROLE_DHW_VALVE_HTG: u8 = 0x0b;
pub const ROLE_HTG_RELAY: u8 = 0x0f;

/// What a system asks the gateway to do after consuming a message.
#[derive(Debug)]
pub enum SystemEffect {
    /// A 000C reply listed member devices; the gateway owns creation and
    /// parenting.
    AssignDevices {
        idx: u8,
        role: u8,
        devices: Vec<DeviceId>,
    },
}

/// One heating zone of a system.
#[derive(Default)]
pub struct Zone {
    pub idx: u8,
    name: Option<String>,
    sensor: Option<DeviceId>,
    actuators: Vec<DeviceId>,
    temperature: Option<f64>,
    setpoint: Option<f64>,
    config: Option<ZoneConfig>,
    mode: Option<ZoneModeSet>,
    heat_demand: Option<f64>,
    window_open: Option<bool>,
    pub schedule: Option<Schedule>,
}

impl Zone {
    fn new(idx: u8) -> Zone {
        Zone {
            idx,
            ..Default::default()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn sensor(&self) -> Option<DeviceId> {
        self.sensor
    }

    pub fn actuators(&self) -> &[DeviceId] {
        &self.actuators
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }

    pub fn heat_demand(&self) -> Option<f64> {
        self.heat_demand
    }

    /// Assign the zone sensor, once.
    pub fn set_sensor(&mut self, sensor: DeviceId) -> Result<(), RamsesError> {
        match self.sensor {
            Some(current) if current == sensor => Ok(()),
            Some(current) => Err(RamsesError::CorruptState(format!(
                "zone {:02X} changed sensor: {} to {}",
                self.idx, current, sensor
            ))),
            None => {
                self.sensor = Some(sensor);
                Ok(())
            }
        }
    }

    fn add_actuator(&mut self, id: DeviceId) {
        if !self.actuators.contains(&id) {
            self.actuators.push(id);
        }
    }

    pub fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "sensor": self.sensor.map(|id| id.to_string()),
            "actuators": self.actuators.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        })
    }

    pub fn params(&self) -> Value {
        json!({
            "config": self.config,
            "mode": self.mode,
        })
    }

    pub fn status(&self) -> Value {
        json!({
            "temperature": self.temperature,
            "setpoint": self.setpoint,
            "heat_demand": self.heat_demand,
            "window_open": self.window_open,
        })
    }
}

/// The stored-hot-water pseudo-zone on domains F9/FA.
#[derive(Default)]
pub struct DhwZone {
    sensor: Option<DeviceId>,
    valve: Option<DeviceId>,
    valve_htg: Option<DeviceId>,
    temperature: Option<f64>,
    msgs: HashMap<Code, Message>,
}

impl DhwZone {
    pub fn sensor(&self) -> Option<DeviceId> {
        self.sensor
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn schema(&self) -> Value {
        json!({
            "sensor": self.sensor.map(|id| id.to_string()),
            "valve": self.valve.map(|id| id.to_string()),
            "valve_htg": self.valve_htg.map(|id| id.to_string()),
        })
    }

    pub fn params(&self) -> Value {
        match self.msgs.get(&Code::DHW_PARAMS).map(|m| &m.payload) {
            Some(Payload::DhwParams(p)) => json!(p),
            _ => Value::Null,
        }
    }

    pub fn status(&self) -> Value {
        let mode = match self.msgs.get(&Code::DHW_MODE).map(|m| &m.payload) {
            Some(Payload::DhwMode(m)) => json!(m),
            _ => Value::Null,
        };
        json!({
            "temperature": self.temperature,
            "mode": mode,
        })
    }
}

pub struct System {
    pub ctl: DeviceId,
    msgs: HashMap<Code, Message>,
    zones: BTreeMap<u8, Zone>,
    dhw: Option<DhwZone>,
    htg_relay: Option<DeviceId>,
    htg_demand: Option<f64>,
    fault_log: BTreeMap<u8, FaultEntry>,
}

/// The fault log holds the most recent entries only.
const MAX_FAULT_ENTRIES: usize = 64;

impl System {
    pub fn new(ctl: DeviceId) -> System {
        debug!(%ctl, "creating a system");
        System {
            ctl,
            msgs: HashMap::new(),
            zones: BTreeMap::new(),
            dhw: None,
            htg_relay: None,
            htg_demand: None,
            fault_log: BTreeMap::new(),
        }
    }

    pub fn zone(&self, idx: u8) -> Option<&Zone> {
        self.zones.get(&idx)
    }

    pub fn zone_mut(&mut self, idx: u8) -> Option<&mut Zone> {
        self.zones.get_mut(&idx)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn dhw(&self) -> Option<&DhwZone> {
        self.dhw.as_ref()
    }

    pub fn htg_relay(&self) -> Option<DeviceId> {
        self.htg_relay
    }

    pub fn fault_log(&self) -> impl Iterator<Item = (&u8, &FaultEntry)> {
        self.fault_log.iter()
    }

    fn zone_entry(&mut self, idx: u8) -> Option<&mut Zone> {
        if idx >= MAX_ZONES {
            debug!(idx, "index beyond the zone range, ignored");
            return None;
        }
        Some(self.zones.entry(idx).or_insert_with(|| Zone::new(idx)))
    }

    fn dhw_entry(&mut self) -> &mut DhwZone {
        self.dhw.get_or_insert_with(DhwZone::default)
    }

    /// Consume one message routed up from the controller.
    pub fn handle_msg(&mut self, msg: &Message) -> Result<Vec<SystemEffect>, RamsesError> {
        let mut effects = Vec::new();

        match &msg.payload {
            Payload::ZoneTemps(temps) => {
                for t in temps {
                    if let Some(zone) = self.zone_entry(t.idx) {
                        zone.temperature = t.temp;
                    }
                }
            }
            Payload::Setpoints(setpoints) => {
                for s in setpoints {
                    if let Some(zone) = self.zone_entry(s.idx) {
                        zone.setpoint = s.setpoint;
                    }
                }
            }
            Payload::ZoneConfigs(configs) => {
                for c in configs {
                    if let Some(zone) = self.zone_entry(c.idx) {
                        zone.config = Some(*c);
                    }
                }
            }
            Payload::ZoneMode(mode) => {
                if let Some(zone) = self.zone_entry(mode.idx) {
                    zone.mode = Some(*mode);
                }
            }
            Payload::ZoneName(name) => {
                if let Some(zone) = self.zone_entry(name.idx) {
                    zone.name = name.name.clone();
                }
            }
            Payload::WindowState(w) => {
                if let Some(zone) = self.zone_entry(w.idx) {
                    zone.window_open = w.open;
                }
            }
            Payload::HeatDemands(demands) => {
                for d in demands {
                    match d.idx {
                        DOMAIN_HTG => self.htg_demand = d.demand,
                        DOMAIN_DHW | DOMAIN_DHW_HTG => {}
                        idx => {
                            if let Some(zone) = self.zone_entry(idx) {
                                zone.heat_demand = d.demand;
                            }
                        }
                    }
                }
            }
            Payload::ZoneList(list) => {
                for idx in 0..MAX_ZONES {
                    if list.mask & (1 << idx) != 0 {
                        self.zone_entry(idx);
                    }
                }
                self.msgs.insert(msg.code(), msg.clone());
            }
            Payload::ZoneDevices(zd) => {
                self.assign_members(zd.idx, zd.role, &zd.devices)?;
                effects.push(SystemEffect::AssignDevices {
                    idx: zd.idx,
                    role: zd.role,
                    devices: zd.devices.clone(),
                });
            }
            Payload::DhwTemp(t) => {
                self.dhw_entry().temperature = t.temp;
            }
            Payload::DhwMode(_) | Payload::DhwParams(_) => {
                self.dhw_entry().msgs.insert(msg.code(), msg.clone());
            }
            Payload::FaultLogEntry(entry) => {
                if let Some(fault) = entry.entry {
                    if self.fault_log.len() < MAX_FAULT_ENTRIES
                        || self.fault_log.contains_key(&entry.log_idx)
                    {
                        self.fault_log.insert(entry.log_idx, fault);
                    } else {
                        warn!(log_idx = entry.log_idx, "fault log full, entry dropped");
                    }
                }
            }
            Payload::SystemSync(_)
            | Payload::SystemMode(_)
            | Payload::SystemTime(_)
            | Payload::TpiParams(_)
            | Payload::ScheduleSync(_)
            | Payload::RelayDemand(_) => {
                self.msgs.insert(msg.code(), msg.clone());
            }
            _ => {}
        }

        Ok(effects)
    }

    fn assign_members(
        &mut self,
        idx: u8,
        role: u8,
        devices: &[DeviceId],
    ) -> Result<(), RamsesError> {
        match role {
            ROLE_SENSOR => {
                if let (Some(zone), Some(&sensor)) = (self.zone_entry(idx), devices.first()) {
                    zone.set_sensor(sensor)?;
                }
            }
            ROLE_ACTUATOR => {
                if let Some(zone) = self.zone_entry(idx) {
                    devices.iter().for_each(|&id| zone.add_actuator(id));
                }
            }
            ROLE_DHW_SENSOR => {
                self.dhw_entry().sensor = devices.first().copied();
            }
            ROLE_DHW_VALVE => {
                self.dhw_entry().valve = devices.first().copied();
            }
            ROLE_DHW_VALVE_HTG => {
                self.dhw_entry().valve_htg = devices.first().copied();
            }
            ROLE_HTG_RELAY => {
                self.htg_relay = devices.first().copied();
            }
            _ => debug!(role, "unrecognised member role"),
        }
        Ok(())
    }

    /// The commands one discovery cycle asks of the controller.
    pub fn discover(&self, kind: super::device::Discover) -> Vec<Command> {
        use super::device::Discover;

        let mut cmds = Vec::new();
        match kind {
            Discover::Schema => {
                cmds.push(Command::get_system_zones(self.ctl, 0x00));
                for idx in self.zones.keys() {
                    cmds.push(Command::get_zone_name(self.ctl, *idx));
                    cmds.push(Command::get_zone_actuators(self.ctl, *idx, ROLE_ACTUATOR));
                    cmds.push(Command::get_zone_actuators(self.ctl, *idx, ROLE_SENSOR));
                }
            }
            Discover::Params => {
                cmds.push(Command::get_tpi_params(self.ctl));
                for idx in self.zones.keys() {
                    cmds.push(Command::get_zone_config(self.ctl, *idx));
                }
                if self.dhw.is_some() {
                    cmds.push(Command::get_dhw_params(self.ctl));
                }
            }
            Discover::Status => {
                cmds.push(Command::get_system_mode(self.ctl));
                if self.dhw.is_some() {
                    cmds.push(Command::get_dhw_mode(self.ctl));
                }
            }
        }
        cmds
    }

    pub fn schema(&self) -> Value {
        let zones: serde_json::Map<String, Value> = self
            .zones
            .iter()
            .map(|(idx, z)| (format!("{:02X}", idx), z.schema()))
            .collect();
        json!({
            "controller": self.ctl.to_string(),
            "zones": zones,
            "stored_hotwater": self.dhw.as_ref().map(|d| d.schema()),
            "heating_relay": self.htg_relay.map(|id| id.to_string()),
        })
    }

    pub fn params(&self) -> Value {
        let zones: serde_json::Map<String, Value> = self
            .zones
            .iter()
            .map(|(idx, z)| (format!("{:02X}", idx), z.params()))
            .collect();
        let tpi = match self.msgs.get(&Code::TPI_PARAMS).map(|m| &m.payload) {
            Some(Payload::TpiParams(p)) => json!(p),
            _ => Value::Null,
        };
        json!({
            "zones": zones,
            "stored_hotwater": self.dhw.as_ref().map(|d| d.params()),
            "tpi_params": tpi,
        })
    }

    pub fn status(&self) -> Value {
        let zones: serde_json::Map<String, Value> = self
            .zones
            .iter()
            .map(|(idx, z)| (format!("{:02X}", idx), z.status()))
            .collect();
        let mode = match self.msgs.get(&Code::SYSTEM_MODE).map(|m| &m.payload) {
            Some(Payload::SystemMode(m)) => json!(m),
            _ => Value::Null,
        };
        let faults: Vec<Value> = self
            .fault_log
            .iter()
            .map(|(idx, entry)| json!({ "log_idx": idx, "entry": entry }))
            .collect();
        json!({
            "mode": mode,
            "zones": zones,
            "stored_hotwater": self.dhw.as_ref().map(|d| d.status()),
            "heating_demand": self.htg_demand,
            "fault_log": faults,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ramses_protocols::packet::Packet;
    use std::str::FromStr;

    fn ctl() -> DeviceId {
        DeviceId::from_str("01:145039").unwrap()
    }

    fn msg(line: &str) -> Message {
        let dtm = Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap();
        Message::new(Packet::from_line(line, dtm).unwrap())
    }

    #[test]
    fn zone_array_fans_out() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045  I --- 01:145039 --:------ 01:145039 30C9 009 0007D00107D2027FFF",
        ))
        .unwrap();

        assert_eq!(sys.zone(0).unwrap().temperature(), Some(20.0));
        assert_eq!(sys.zone(1).unwrap().temperature(), Some(20.02));
        assert_eq!(sys.zone(2).unwrap().temperature(), None);
    }

    #[test]
    fn zone_indices_beyond_range_are_ignored() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045  I --- 01:145039 --:------ 01:145039 30C9 003 0C07D0",
        ))
        .unwrap();
        assert!(sys.zones().next().is_none());
    }

    #[test]
    fn domain_heat_demand_goes_to_the_relay_view() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045  I --- 01:145039 --:------ 01:145039 3150 002 FC5C",
        ))
        .unwrap();
        assert!(sys.zones().next().is_none());
        assert_eq!(sys.status()["heating_demand"], serde_json::json!(0.46));
    }

    #[test]
    fn member_roles_are_assigned() {
        let mut sys = System::new(ctl());
        // Zone 00 sensor.
        let effects = sys
            .handle_msg(&msg(
                "045 RP --- 01:145039 18:000730 --:------ 000C 005 0004086CB7",
            ))
            .unwrap();
        assert_eq!(sys.zone(0).unwrap().sensor().unwrap().to_string(), "02:027831");
        assert!(matches!(
            effects.as_slice(),
            [SystemEffect::AssignDevices { role: ROLE_SENSOR, .. }]
        ));

        // Heating relay on domain FC.
        sys.handle_msg(&msg(
            "045 RP --- 01:145039 18:000730 --:------ 000C 005 FC0F34C286",
        ))
        .unwrap();
        assert_eq!(sys.htg_relay().unwrap().to_string(), "13:049798");
    }

    #[test]
    fn sensor_conflict_is_corrupt_state() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045 RP --- 01:145039 18:000730 --:------ 000C 005 0004086CB7",
        ))
        .unwrap();
        let err = sys
            .handle_msg(&msg(
                "045 RP --- 01:145039 18:000730 --:------ 000C 005 000434C286",
            ))
            .unwrap_err();
        assert!(matches!(err, RamsesError::CorruptState(_)));
    }

    #[test]
    fn fault_log_accumulates() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045 RP --- 01:145039 18:000730 --:------ 0418 016 00030006040004D39D001E0C150A07E7",
        ))
        .unwrap();
        assert_eq!(sys.fault_log().count(), 1);

        // The terminator does not add an entry.
        sys.handle_msg(&msg(
            "045 RP --- 01:145039 18:000730 --:------ 0418 016 000400000000 7FFFFF 00000000000000"
                .replace(' ', "")
                .as_str(),
        ))
        .unwrap();
        assert_eq!(sys.fault_log().count(), 1);
    }

    #[test]
    fn zone_list_creates_zones() {
        let mut sys = System::new(ctl());
        sys.handle_msg(&msg(
            "045 RP --- 01:145039 18:000730 --:------ 0005 004 00000700",
        ))
        .unwrap();
        let zones: Vec<u8> = sys.zones().map(|z| z.idx).collect();
        assert_eq!(zones, vec![0, 1, 2]);
    }
}
