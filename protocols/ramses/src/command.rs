// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Builders for outbound packets. Every frame the engine transmits is
//! composed here, never by ad-hoc callers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;

use super::{
    addr::{DeviceId, HGI_DEV_ID},
    binding,
    bytes_to_hex,
    codes::Code,
    message::Message,
    packet::Packet,
    parsers::{dtm7_to_wire, percent_to_wire, temp_to_wire, ZoneMode, SystemModeKind},
    Verb,
};

/// Transmit priority. `Asap` preempts a pending send.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Default,
    High,
    Asap,
}

/// Per-packet quality of service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Qos {
    pub priority: Priority,
    /// Additional attempts after the first transmission.
    pub retries: u8,
    /// Deadline for the expected reply, and for the echo.
    pub timeout: Duration,
}

impl Default for Qos {
    fn default() -> Self {
        Qos {
            priority: Priority::Default,
            retries: 3,
            timeout: Duration::from_secs(3),
        }
    }
}

/// What completes a command once its echo has been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyExpectation {
    pub verbs: Vec<Verb>,
    pub code: Code,
    /// Expected source of the reply; `None` is a wildcard (binding offers).
    pub src: Option<DeviceId>,
    pub idx: Option<u8>,
}

impl ReplyExpectation {
    pub fn matches(&self, msg: &Message) -> bool {
        self.verbs.contains(&msg.verb())
            && self.code == msg.code()
            && self.src.map_or(true, |src| msg.src() == src)
            && self.idx.map_or(true, |idx| msg.idx() == Some(idx))
    }
}

/// An outbound frame with QoS and an optional expected-reply filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub verb: Verb,
    pub seqn: Option<u8>,
    pub addrs: [DeviceId; 3],
    pub code: Code,
    /// Upper-hex payload.
    pub payload: String,
    pub qos: Qos,
    pub expect: Option<ReplyExpectation>,
}

impl Command {
    fn request(dst: DeviceId, code: Code, payload: String) -> Command {
        Command {
            verb: Verb::Rq,
            seqn: None,
            addrs: [HGI_DEV_ID, dst, DeviceId::NONE],
            code,
            payload,
            qos: Qos::default(),
            expect: Some(ReplyExpectation {
                verbs: vec![Verb::Rp],
                code,
                src: Some(dst),
                idx: None,
            }),
        }
    }

    fn request_idx(dst: DeviceId, code: Code, idx: u8, payload: String) -> Command {
        let mut cmd = Self::request(dst, code, payload);
        if let Some(expect) = cmd.expect.as_mut() {
            expect.idx = Some(idx);
        }
        cmd
    }

    fn write(dst: DeviceId, code: Code, payload: String) -> Command {
        Command {
            verb: Verb::W,
            seqn: None,
            addrs: [HGI_DEV_ID, dst, DeviceId::NONE],
            code,
            payload,
            qos: Qos::default(),
            expect: Some(ReplyExpectation {
                verbs: vec![Verb::I, Verb::Rp],
                code,
                src: Some(dst),
                idx: None,
            }),
        }
    }

    fn announce(src: DeviceId, code: Code, payload: String) -> Command {
        Command {
            verb: Verb::I,
            seqn: None,
            addrs: [src, DeviceId::NONE, src],
            code,
            payload,
            qos: Qos::default(),
            expect: None,
        }
    }

    fn inform(src: DeviceId, dst: DeviceId, code: Code, payload: String) -> Command {
        Command {
            verb: Verb::I,
            seqn: None,
            addrs: [src, dst, DeviceId::NONE],
            code,
            payload,
            qos: Qos::default(),
            expect: None,
        }
    }

    pub fn with_qos(mut self, qos: Qos) -> Command {
        self.qos = qos;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Command {
        self.qos.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Command {
        self.qos.retries = retries;
        self
    }

    pub fn with_expect(mut self, expect: Option<ReplyExpectation>) -> Command {
        self.expect = expect;
        self
    }

    pub fn src(&self) -> DeviceId {
        self.addrs[0]
    }

    pub fn dst(&self) -> DeviceId {
        if self.addrs[1].is_none() {
            self.addrs[2]
        } else {
            self.addrs[1]
        }
    }

    /// Substitute the learnt gateway address for the placeholder. Aliased
    /// source devices are left untouched.
    pub fn readdress(&mut self, gwy_id: DeviceId) {
        for slot in self.addrs.iter_mut() {
            if *slot == HGI_DEV_ID {
                *slot = gwy_id;
            }
        }
        if let Some(expect) = self.expect.as_mut() {
            if expect.src == Some(HGI_DEV_ID) {
                expect.src = Some(gwy_id);
            }
        }
    }

    /// The canonical serial line, without terminator.
    pub fn to_line(&self) -> String {
        let seqn = match self.seqn {
            Some(n) => format!("{:02X}", n),
            None => "---".to_string(),
        };
        format!(
            "{} {} {} {} {} {} {:03} {}",
            self.verb,
            seqn,
            self.addrs[0],
            self.addrs[1],
            self.addrs[2],
            self.code,
            self.payload.len() / 2,
            self.payload,
        )
    }

    /// Whether an inbound frame is this command's own echo.
    pub fn matches_echo(&self, pkt: &Packet) -> bool {
        self.verb == pkt.verb
            && self.seqn == pkt.seqn
            && self.addrs == pkt.addrs
            && self.code == pkt.code
            && self.payload == pkt.payload
    }

    // -- zone operations

    pub fn get_zone_temp(ctl: DeviceId, idx: u8) -> Command {
        Self::request_idx(ctl, Code::ZONE_TEMP, idx, format!("{:02X}", idx))
    }

    pub fn set_zone_setpoint(ctl: DeviceId, idx: u8, setpoint: f64) -> Command {
        let mut payload = format!("{:02X}", idx);
        payload.push_str(&bytes_to_hex(&temp_to_wire(Some(setpoint))));
        Self::write(ctl, Code::SETPOINT, payload)
    }

    pub fn get_zone_config(ctl: DeviceId, idx: u8) -> Command {
        Self::request_idx(ctl, Code::ZONE_CONFIG, idx, format!("{:02X}", idx))
    }

    pub fn get_zone_name(ctl: DeviceId, idx: u8) -> Command {
        Self::request_idx(ctl, Code::ZONE_NAME, idx, format!("{:02X}00", idx))
    }

    pub fn set_zone_mode(
        ctl: DeviceId,
        idx: u8,
        mode: ZoneMode,
        setpoint: Option<f64>,
        until: Option<NaiveDateTime>,
    ) -> Result<Command, CommandError> {
        if until.is_some() && mode != ZoneMode::TemporaryOverride {
            return Err(CommandError::InvalidArgument(
                "an until datetime needs a temporary override".to_string(),
            ));
        }
        let mut payload = format!("{:02X}", idx);
        payload.push_str(&bytes_to_hex(&temp_to_wire(setpoint)));
        payload.push_str(&format!("{:02X}FFFFFF", mode.to_wire()));
        if let Some(until) = until {
            payload.push_str(&bytes_to_hex(&dtm7_to_wire(Some(until))));
        }
        Ok(Self::write(ctl, Code::ZONE_MODE, payload))
    }

    pub fn get_zone_actuators(ctl: DeviceId, idx: u8, role: u8) -> Command {
        Self::request_idx(
            ctl,
            Code::ZONE_ACTUATORS,
            idx,
            format!("{:02X}{:02X}", idx, role),
        )
    }

    pub fn get_system_zones(ctl: DeviceId, zone_kind: u8) -> Command {
        Self::request(ctl, Code::SYSTEM_ZONES, format!("00{:02X}", zone_kind))
    }

    // -- relay and actuator operations

    pub fn get_relay_demand(dev: DeviceId) -> Command {
        Self::request(dev, Code::RELAY_DEMAND, "00".to_string())
    }

    pub fn put_actuator_state(from: DeviceId, demand: Option<f64>) -> Command {
        let payload = format!("00{:02X}FF", percent_to_wire(demand));
        Self::announce(from, Code::ACTUATOR_STATE, payload).with_priority(Priority::High)
    }

    pub fn put_actuator_cycle(
        from: DeviceId,
        dst: DeviceId,
        demand: Option<f64>,
        countdown_secs: u16,
        cycle_secs: u16,
    ) -> Command {
        let mut payload = "00".to_string();
        payload.push_str(&bytes_to_hex(&countdown_secs.to_be_bytes()));
        payload.push_str(&bytes_to_hex(&cycle_secs.to_be_bytes()));
        payload.push_str(&format!("{:02X}FF", percent_to_wire(demand)));
        Command {
            verb: Verb::Rp,
            seqn: None,
            addrs: [from, dst, DeviceId::NONE],
            code: Code::ACTUATOR_CYCLE,
            payload,
            qos: Qos::default(),
            expect: None,
        }
    }

    // -- stored hot water

    pub fn get_dhw_temp(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::DHW_TEMP, "00".to_string())
    }

    pub fn get_dhw_mode(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::DHW_MODE, "00".to_string())
    }

    pub fn set_dhw_mode(
        ctl: DeviceId,
        active: bool,
        mode: ZoneMode,
        until: Option<NaiveDateTime>,
    ) -> Result<Command, CommandError> {
        if until.is_some() && mode != ZoneMode::TemporaryOverride {
            return Err(CommandError::InvalidArgument(
                "an until datetime needs a temporary override".to_string(),
            ));
        }
        let mut payload = format!(
            "00{:02X}{:02X}FFFFFF",
            if active { 0xc8 } else { 0x00 },
            mode.to_wire()
        );
        if let Some(until) = until {
            payload.push_str(&bytes_to_hex(&dtm7_to_wire(Some(until))));
        }
        Ok(Self::write(ctl, Code::DHW_MODE, payload))
    }

    pub fn get_dhw_params(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::DHW_PARAMS, "00".to_string())
    }

    // -- system operations

    pub fn get_tpi_params(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::TPI_PARAMS, "FC".to_string())
    }

    pub fn get_system_mode(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::SYSTEM_MODE, "FF".to_string())
    }

    pub fn set_system_mode(
        ctl: DeviceId,
        mode: SystemModeKind,
        until: Option<NaiveDateTime>,
    ) -> Command {
        let mut payload = format!("{:02X}", mode.to_wire());
        payload.push_str(&bytes_to_hex(&dtm7_to_wire(until)));
        Self::write(ctl, Code::SYSTEM_MODE, payload)
    }

    pub fn get_system_time(ctl: DeviceId) -> Command {
        Self::request(ctl, Code::DATETIME, "00".to_string())
    }

    pub fn set_system_time(ctl: DeviceId, dtm: NaiveDateTime) -> Command {
        let mut payload = "0000".to_string();
        payload.push_str(&bytes_to_hex(&dtm7_to_wire(Some(dtm))));
        Self::write(ctl, Code::DATETIME, payload)
    }

    // -- schedule and fault log

    pub fn get_schedule_fragment(ctl: DeviceId, idx: u8, frag_idx: u8, frag_cnt: u8) -> Command {
        Self::request_idx(
            ctl,
            Code::ZONE_SCHEDULE,
            idx,
            format!("{:02X}200008{:02X}{:02X}", idx, frag_idx, frag_cnt),
        )
    }

    pub fn set_schedule_fragment(
        ctl: DeviceId,
        idx: u8,
        frag_idx: u8,
        frag_cnt: u8,
        data: &[u8],
    ) -> Command {
        let mut payload = format!(
            "{:02X}2000{:02X}{:02X}{:02X}",
            idx,
            data.len(),
            frag_idx,
            frag_cnt
        );
        payload.push_str(&bytes_to_hex(data));
        Self::write(ctl, Code::ZONE_SCHEDULE, payload)
    }

    pub fn get_fault_log_entry(ctl: DeviceId, log_idx: u8) -> Command {
        Self::request_idx(
            ctl,
            Code::SYSTEM_FAULT,
            log_idx,
            format!("00{:02X}", log_idx),
        )
    }

    // -- devices

    pub fn get_opentherm_data(otb: DeviceId, msg_id: u8) -> Command {
        Self::request(otb, Code::OPENTHERM, format!("0000{:02X}0000", msg_id))
    }

    pub fn get_device_info(dev: DeviceId) -> Command {
        Self::request(dev, Code::DEVICE_INFO, "00".to_string())
    }

    pub fn get_rf_bind(dev: DeviceId) -> Command {
        Self::request(dev, Code::RF_BIND, "00".to_string())
    }

    pub fn get_actuator_cycle(dev: DeviceId) -> Command {
        Self::request(dev, Code::ACTUATOR_CYCLE, "00".to_string())
    }

    pub fn get_rf_check(dev: DeviceId) -> Command {
        Self::request(dev, Code::RF_CHECK, "00FF".to_string())
    }

    pub fn put_sensor_temp(from: DeviceId, temp: Option<f64>) -> Command {
        let mut payload = "00".to_string();
        payload.push_str(&bytes_to_hex(&temp_to_wire(temp)));
        Self::announce(from, Code::ZONE_TEMP, payload)
    }

    pub fn put_outdoor_temp(from: DeviceId, temp: Option<f64>) -> Command {
        let mut payload = "00".to_string();
        payload.push_str(&bytes_to_hex(&temp_to_wire(temp)));
        payload.push_str("01");
        Self::announce(from, Code::OUTDOOR_SENSOR, payload)
    }

    // -- pairing handshake

    pub fn put_bind_offer(from: DeviceId, code: Code, idx: u8) -> Result<Command, CommandError> {
        binding::check_offerable(from.class(), code).map_err(CommandError::Bind)?;
        let cmd = Self::announce(from, Code::RF_BIND, binding::offer_payload(code, idx, from));
        Ok(cmd.with_expect(Some(ReplyExpectation {
            verbs: vec![Verb::W],
            code: Code::RF_BIND,
            src: None,
            idx: None,
        })))
    }

    pub fn put_bind_accept(from: DeviceId, dst: DeviceId, code: Code, idx: u8) -> Command {
        let payload = binding::accept_payload(code, idx, from);
        Command {
            verb: Verb::W,
            seqn: None,
            addrs: [from, dst, DeviceId::NONE],
            code: Code::RF_BIND,
            payload,
            qos: Qos::default(),
            expect: Some(ReplyExpectation {
                verbs: vec![Verb::I],
                code: Code::RF_BIND,
                src: Some(dst),
                idx: None,
            }),
        }
    }

    pub fn put_bind_confirm(from: DeviceId, dst: DeviceId, code: Code, idx: u8) -> Command {
        Self::inform(from, dst, Code::RF_BIND, binding::confirm_payload(code, idx, from))
    }

    /// Parse an operator-supplied command such as `"RQ 01:145038 1F09 00"`.
    /// One address sends from the gateway; two or three give the slots
    /// explicitly.
    pub fn from_raw(s: &str) -> Result<Command, CommandError> {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(CommandError::InvalidRaw(s.to_string()));
        }

        let verb = Verb::from_str(tokens.remove(0))
            .map_err(|_| CommandError::InvalidRaw(s.to_string()))?;

        let seqn = if DeviceId::from_str(tokens[0]).is_err() && tokens[0] != "---" {
            let t = tokens.remove(0);
            Some(u8::from_str_radix(t, 16).map_err(|_| CommandError::InvalidRaw(s.to_string()))?)
        } else {
            if tokens[0] == "---" {
                tokens.remove(0);
            }
            None
        };

        let payload = tokens.pop().unwrap().to_string();
        let mut code_tok = tokens
            .pop()
            .ok_or_else(|| CommandError::InvalidRaw(s.to_string()))?;
        // Tolerate a pasted packet line, which carries the octet count.
        if code_tok.len() == 3 && code_tok.bytes().all(|b| b.is_ascii_digit()) {
            if code_tok.parse::<usize>() != Ok(payload.len() / 2) {
                return Err(CommandError::InvalidRaw(s.to_string()));
            }
            code_tok = tokens
                .pop()
                .ok_or_else(|| CommandError::InvalidRaw(s.to_string()))?;
        }
        let code =
            Code::from_str(code_tok).map_err(|_| CommandError::InvalidRaw(s.to_string()))?;

        let mut ids = Vec::new();
        for t in tokens {
            ids.push(DeviceId::from_str(t).map_err(|_| CommandError::InvalidRaw(s.to_string()))?);
        }
        let addrs = match ids.as_slice() {
            [dst] => [HGI_DEV_ID, *dst, DeviceId::NONE],
            [a0, a1] => [*a0, *a1, DeviceId::NONE],
            [a0, a1, a2] => [*a0, *a1, *a2],
            _ => return Err(CommandError::InvalidRaw(s.to_string())),
        };

        if payload.len() % 2 != 0
            || !payload
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase())
        {
            return Err(CommandError::InvalidRaw(s.to_string()));
        }

        let expect = match verb {
            Verb::Rq => Some(ReplyExpectation {
                verbs: vec![Verb::Rp],
                code,
                src: Some(if addrs[1].is_none() { addrs[2] } else { addrs[1] }),
                idx: None,
            }),
            _ => None,
        };

        Ok(Command {
            verb,
            seqn,
            addrs,
            code,
            payload,
            qos: Qos::default(),
            expect,
        }
        .with_priority(Priority::High))
    }
}

/// The error to build a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    InvalidArgument(String),
    InvalidRaw(String),
    Bind(binding::BindError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            Self::InvalidRaw(s) => write!(f, "unusable command: {}", s),
            Self::Bind(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ctl() -> DeviceId {
        DeviceId::from_str("01:145039").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap()
    }

    #[test]
    fn get_zone_temp_line() {
        let cmd = Command::get_zone_temp(ctl(), 0);
        assert_eq!(
            cmd.to_line(),
            "RQ --- 18:000730 01:145039 --:------ 30C9 001 00"
        );
        let expect = cmd.expect.unwrap();
        assert_eq!(expect.code, Code::ZONE_TEMP);
        assert_eq!(expect.src, Some(ctl()));
        assert_eq!(expect.idx, Some(0));
    }

    #[test]
    fn expected_reply_matches_s2_exchange() {
        let cmd = Command::get_zone_temp(ctl(), 0);
        let reply = Message::new(
            Packet::from_line(
                "045 RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0",
                now(),
            )
            .unwrap(),
        );
        assert!(cmd.expect.as_ref().unwrap().matches(&reply));

        let other_zone = Message::new(
            Packet::from_line(
                "045 RP --- 01:145039 18:000730 --:------ 30C9 003 0107D0",
                now(),
            )
            .unwrap(),
        );
        assert!(!cmd.expect.as_ref().unwrap().matches(&other_zone));
    }

    #[test]
    fn echo_matching_is_exact() {
        let cmd = Command::get_zone_temp(ctl(), 0);
        let echo = Packet::from_line(&cmd.to_line(), now()).unwrap();
        assert!(cmd.matches_echo(&echo));

        let other = Packet::from_line(
            "RQ --- 18:000730 01:145039 --:------ 30C9 001 01",
            now(),
        )
        .unwrap();
        assert!(!cmd.matches_echo(&other));
    }

    #[test]
    fn readdress_replaces_placeholder_only() {
        let gwy = DeviceId::from_str("18:140805").unwrap();
        let mut cmd = Command::get_zone_temp(ctl(), 0);
        cmd.readdress(gwy);
        assert_eq!(cmd.addrs[0], gwy);
        assert_eq!(cmd.addrs[1], ctl());

        let faked = DeviceId::from_str("34:021943").unwrap();
        let mut cmd = Command::put_sensor_temp(faked, Some(19.5));
        cmd.readdress(gwy);
        assert_eq!(cmd.addrs[0], faked);
    }

    #[test]
    fn set_zone_mode_validates_until() {
        assert!(Command::set_zone_mode(ctl(), 0, ZoneMode::PermanentOverride, Some(21.0), None)
            .is_ok());
        let until = Utc
            .with_ymd_and_hms(2023, 10, 21, 22, 0, 0)
            .unwrap()
            .naive_utc();
        assert!(
            Command::set_zone_mode(ctl(), 0, ZoneMode::FollowSchedule, None, Some(until)).is_err()
        );
    }

    #[test]
    fn bind_offer_is_gated_by_class() {
        let thm = DeviceId::from_str("34:021943").unwrap();
        let bdr = DeviceId::from_str("13:049798").unwrap();
        assert!(Command::put_bind_offer(thm, Code::ZONE_TEMP, 0).is_ok());
        assert!(matches!(
            Command::put_bind_offer(bdr, Code::ZONE_TEMP, 0),
            Err(CommandError::Bind(_))
        ));
    }

    #[test]
    fn raw_command_forms() {
        let cmd = Command::from_raw("RQ 01:145038 1F09 00").unwrap();
        assert_eq!(
            cmd.to_line(),
            "RQ --- 18:000730 01:145038 --:------ 1F09 001 00"
        );
        assert_eq!(cmd.qos.priority, Priority::High);

        let cmd = Command::from_raw(" I --- 01:145038 --:------ 01:145038 1F09 003 FF04B5");
        assert!(cmd.is_ok());

        assert!(Command::from_raw("ZZ 01:145038 1F09 00").is_err());
        assert!(Command::from_raw("RQ 01:145038 1F09").is_err());
    }

    #[test]
    fn schedule_fragment_request_payload() {
        let cmd = Command::get_schedule_fragment(ctl(), 1, 2, 4);
        assert_eq!(cmd.payload, "012000080204");
    }

    #[test]
    fn opentherm_query_payload() {
        let cmd = Command::get_opentherm_data(DeviceId::from_str("10:048122").unwrap(), 0x19);
        assert_eq!(cmd.payload, "0000190000");
    }
}
