// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The line codec: one ASCII serial line to one canonical packet and back.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};

use super::{
    addr::{extract_addrs, AddrError, DeviceId},
    codes::{Code, CodeError},
    Verb,
};

/// The largest payload the adaptors will carry, in octets.
pub const MAX_PAYLOAD_OCTETS: usize = 48;

/// A decoded frame with its receive timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub dtm: DateTime<Utc>,
    /// Receive signal strength as reported by the adaptor, when present.
    pub rssi: Option<u8>,
    pub verb: Verb,
    pub seqn: Option<u8>,
    /// The three slots as they appeared on the wire.
    pub addrs: [DeviceId; 3],
    /// Source, per the address form rule.
    pub src: DeviceId,
    /// Destination, per the address form rule. An announcement mirrors the
    /// source here.
    pub dst: DeviceId,
    pub code: Code,
    /// Upper-hex, even length.
    pub payload: String,
}

impl Packet {
    /// Whether a received line is adaptor chatter rather than a frame.
    ///
    /// Evofw3 firmware emits `!` configuration echoes and `#` banners.
    pub fn is_gateway_chatter(line: &str) -> bool {
        let line = line.trim();
        line.is_empty() || line.starts_with('!') || line.starts_with('#')
    }

    /// Decode one serial line. `dtm` is the receive time; a timestamp token
    /// at the head of the line (packet-log replay) takes precedence.
    pub fn from_line(line: &str, dtm: DateTime<Utc>) -> Result<Packet, PacketError> {
        let mut dtm = dtm;
        let mut tokens = line.split_whitespace().peekable();

        if let Some(&tok) = tokens.peek() {
            if let Some(t) = parse_dtm_token(tok, &dtm) {
                dtm = t;
                tokens.next();
            }
        }

        let mut rssi = None;
        if let Some(&tok) = tokens.peek() {
            if tok.len() == 3 && tok.bytes().all(|b| b.is_ascii_digit()) {
                rssi = tok.parse::<u8>().ok();
                if rssi.is_none() {
                    return Err(PacketError::InvalidRssi(tok.to_string()));
                }
                tokens.next();
            }
        }

        let verb = tokens
            .next()
            .ok_or(PacketError::Truncated)
            .and_then(|t| Verb::from_str(t).map_err(|_| PacketError::InvalidVerb(t.to_string())))?;

        let seqn = match tokens.next().ok_or(PacketError::Truncated)? {
            "---" => None,
            t if t.len() == 2 => Some(
                u8::from_str_radix(t, 16).map_err(|_| PacketError::InvalidSeqn(t.to_string()))?,
            ),
            // HGI80s render the sequence number in decimal.
            t if t.len() == 3 && t.bytes().all(|b| b.is_ascii_digit()) => {
                Some(t.parse::<u8>().map_err(|_| PacketError::InvalidSeqn(t.to_string()))?)
            }
            t => return Err(PacketError::InvalidSeqn(t.to_string())),
        };

        let mut addrs = [DeviceId::NONE; 3];
        for slot in addrs.iter_mut() {
            let t = tokens.next().ok_or(PacketError::Truncated)?;
            *slot = DeviceId::from_str(t).map_err(PacketError::Addr)?;
        }
        let (src, dst) = extract_addrs(&addrs).map_err(PacketError::Addr)?;

        let code = tokens
            .next()
            .ok_or(PacketError::Truncated)
            .and_then(|t| Code::from_str(t).map_err(PacketError::Code))?;

        let len = tokens
            .next()
            .ok_or(PacketError::Truncated)
            .and_then(|t| {
                t.parse::<usize>()
                    .map_err(|_| PacketError::InvalidLength(t.to_string()))
            })?;
        if len > MAX_PAYLOAD_OCTETS {
            return Err(PacketError::InvalidLength(len.to_string()));
        }

        let payload = tokens.next().unwrap_or("").to_string();
        if tokens.next().is_some() {
            return Err(PacketError::TrailingGarbage);
        }
        if payload.len() != len * 2 {
            return Err(PacketError::LengthMismatch {
                declared: len,
                actual: payload.len(),
            });
        }
        if !payload
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase())
        {
            return Err(PacketError::InvalidPayload(payload));
        }

        Ok(Packet {
            dtm,
            rssi,
            verb,
            seqn,
            addrs,
            src,
            dst,
            code,
            payload,
        })
    }

    pub fn payload_octets(&self) -> usize {
        self.payload.len() / 2
    }

    /// Equality used by the echo matcher: everything the adaptor retransmits
    /// verbatim, ignoring timestamps and signal strength.
    pub fn echo_matches(&self, other: &Packet) -> bool {
        self.verb == other.verb
            && self.seqn == other.seqn
            && self.addrs == other.addrs
            && self.code == other.code
            && self.payload == other.payload
    }
}

impl fmt::Display for Packet {
    /// The canonical line, without timestamp or RSSI.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seqn = match self.seqn {
            Some(n) => format!("{:02X}", n),
            None => "---".to_string(),
        };
        write!(
            f,
            "{} {} {} {} {} {} {:03} {}",
            self.verb,
            seqn,
            self.addrs[0],
            self.addrs[1],
            self.addrs[2],
            self.code,
            self.payload_octets(),
            self.payload,
        )
    }
}

/// A leading `HHMMSS.mmm` or RFC 3339 token, when one is present.
fn parse_dtm_token(tok: &str, fallback: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(tok) {
        return Some(t.with_timezone(&Utc));
    }
    if tok.len() >= 7 && tok.as_bytes()[6] == b'.' && tok[..6].bytes().all(|b| b.is_ascii_digit())
    {
        if let Ok(t) = NaiveTime::parse_from_str(tok, "%H%M%S%.f") {
            return Utc
                .from_utc_datetime(&fallback.date_naive().and_time(t))
                .into();
        }
    }
    None
}

/// The error to decode a serial line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The line ended before all fields were seen.
    Truncated,
    /// Token after the payload.
    TrailingGarbage,
    InvalidRssi(String),
    InvalidVerb(String),
    InvalidSeqn(String),
    Addr(AddrError),
    Code(CodeError),
    InvalidLength(String),
    /// Declared octet count disagrees with the hex digits present.
    LengthMismatch { declared: usize, actual: usize },
    InvalidPayload(String),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "line truncated"),
            Self::TrailingGarbage => write!(f, "unexpected token after payload"),
            Self::InvalidRssi(t) => write!(f, "invalid rssi: {}", t),
            Self::InvalidVerb(t) => write!(f, "invalid verb: {}", t),
            Self::InvalidSeqn(t) => write!(f, "invalid seqn: {}", t),
            Self::Addr(e) => write!(f, "{}", e),
            Self::Code(e) => write!(f, "{}", e),
            Self::InvalidLength(t) => write!(f, "invalid length: {}", t),
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "declared {} octets but {} hex digits present",
                declared, actual
            ),
            Self::InvalidPayload(t) => write!(f, "invalid payload hex: {}", t),
        }
    }
}

impl std::error::Error for PacketError {}

#[cfg(test)]
mod test {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap()
    }

    #[test]
    fn decode_announcement() {
        let pkt = Packet::from_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        )
        .unwrap();
        assert_eq!(pkt.rssi, Some(45));
        assert_eq!(pkt.verb, Verb::I);
        assert_eq!(pkt.seqn, None);
        assert_eq!(pkt.src.to_string(), "01:145039");
        assert_eq!(pkt.dst, pkt.src);
        assert_eq!(pkt.code, Code::SYSTEM_SYNC);
        assert_eq!(pkt.payload, "FF04B5");
    }

    #[test]
    fn decode_directed() {
        let pkt = Packet::from_line(
            "RQ --- 18:000730 01:145039 --:------ 30C9 001 00",
            now(),
        )
        .unwrap();
        assert_eq!(pkt.rssi, None);
        assert_eq!(pkt.verb, Verb::Rq);
        assert_eq!(pkt.src.to_string(), "18:000730");
        assert_eq!(pkt.dst.to_string(), "01:145039");
    }

    #[test]
    fn decode_encode_identity() {
        [
            " I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            "RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0",
            " W 1C 13:049798 01:054173 --:------ 1FC9 006 003EF034C286",
        ]
        .iter()
        .for_each(|line| {
            let pkt = Packet::from_line(line, now()).unwrap();
            assert_eq!(&pkt.to_string(), line);
            let again = Packet::from_line(&pkt.to_string(), now()).unwrap();
            assert_eq!(again, pkt);
        });
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = Packet::from_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04",
            now(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            PacketError::LengthMismatch {
                declared: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn bad_address_form_is_rejected() {
        assert!(matches!(
            Packet::from_line(
                "045  I --- 01:145039 --:------ 02:000921 1F09 003 FF04B5",
                now(),
            ),
            Err(PacketError::Addr(_))
        ));
    }

    #[test]
    fn lowercase_payload_is_rejected() {
        assert!(matches!(
            Packet::from_line(
                "045  I --- 01:145039 --:------ 01:145039 1F09 003 ff04b5",
                now(),
            ),
            Err(PacketError::InvalidPayload(_))
        ));
    }

    #[test]
    fn chatter_is_recognised() {
        assert!(Packet::is_gateway_chatter("# evofw3 0.7.1"));
        assert!(Packet::is_gateway_chatter("!V"));
        assert!(Packet::is_gateway_chatter("  "));
        assert!(!Packet::is_gateway_chatter(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5"
        ));
    }

    #[test]
    fn timestamp_token_takes_precedence() {
        let pkt = Packet::from_line(
            "2023-10-21T08:00:00.123Z 045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        )
        .unwrap();
        assert_eq!(pkt.dtm.to_rfc3339(), "2023-10-21T08:00:00.123+00:00");

        let pkt = Packet::from_line(
            "093045.500 045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        )
        .unwrap();
        assert_eq!(pkt.dtm.format("%H%M%S").to_string(), "093045");
    }
}
