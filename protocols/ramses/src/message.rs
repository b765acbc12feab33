// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! A packet with its opcode-parsed payload and staleness horizon.

use chrono::{DateTime, Utc};

use super::{
    addr::DeviceId,
    codes::Code,
    packet::Packet,
    parsers::{parse_payload, Payload},
    Verb,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub pkt: Packet,
    pub payload: Payload,
}

impl Message {
    /// Parse the packet's payload. Decoder failures are confined: the frame
    /// is kept with [`Payload::Unparsed`].
    pub fn new(pkt: Packet) -> Message {
        let payload = match parse_payload(pkt.code, pkt.verb, &pkt.payload) {
            Ok(payload) => payload,
            Err(err) => Payload::Unparsed {
                hex: pkt.payload.clone(),
                reason: err.to_string(),
            },
        };
        Message { pkt, payload }
    }

    pub fn src(&self) -> DeviceId {
        self.pkt.src
    }

    pub fn dst(&self) -> DeviceId {
        self.pkt.dst
    }

    pub fn code(&self) -> Code {
        self.pkt.code
    }

    pub fn verb(&self) -> Verb {
        self.pkt.verb
    }

    pub fn dtm(&self) -> DateTime<Utc> {
        self.pkt.dtm
    }

    /// The zone/domain index the payload addresses, when it has exactly one.
    pub fn idx(&self) -> Option<u8> {
        self.payload.index()
    }

    pub fn is_parsed(&self) -> bool {
        !matches!(self.payload, Payload::Unparsed { .. })
    }

    /// Whether the content is past the staleness horizon of its code.
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        match self.code().lifetime() {
            None => false,
            Some(horizon) => now
                .signed_duration_since(self.pkt.dtm)
                .to_std()
                .map(|age| age > horizon)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parsers::ZoneTemp;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap()
    }

    fn msg(line: &str) -> Message {
        Message::new(Packet::from_line(line, now()).unwrap())
    }

    #[test]
    fn reply_parses_to_zone_temp() {
        let msg = msg("045 RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0");
        assert_eq!(
            msg.payload,
            Payload::ZoneTemps(vec![ZoneTemp {
                idx: 0,
                temp: Some(20.0)
            }])
        );
        assert_eq!(msg.idx(), Some(0));
        assert!(msg.is_parsed());
    }

    #[test]
    fn decoder_failure_is_confined() {
        // 30C9 with a ragged record length.
        let msg = msg("045 RP --- 01:145039 18:000730 --:------ 30C9 002 0007");
        assert!(!msg.is_parsed());
        match &msg.payload {
            Payload::Unparsed { hex, .. } => assert_eq!(hex, "0007"),
            p => panic!("{:?}", p),
        }
    }

    #[test]
    fn expiry_follows_code_horizon() {
        let msg = msg("045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5");
        assert!(!msg.has_expired(now()));
        assert!(msg.has_expired(now() + chrono::Duration::minutes(10)));

        // Schema-like facts never expire.
        let msg = self::msg("045 RP --- 01:145039 18:000730 --:------ 0004 004 01004B4E");
        assert!(!msg.has_expired(now() + chrono::Duration::days(400)));
    }

    #[test]
    fn timestamps_precede_horizon() {
        let msg = msg("045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5");
        assert!(!msg.has_expired(now() - chrono::Duration::hours(1)));
    }
}
