// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod addr;
pub mod binding;
pub mod codes;
pub mod command;
pub mod message;
pub mod opentherm;
pub mod packet;
pub mod parsers;

use std::fmt;
use std::str::FromStr;

/// The verb of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Inform, unsolicited.
    I,
    /// Request.
    Rq,
    /// Reply.
    Rp,
    /// Write.
    W,
}

impl Verb {
    /// The canonical two-character wire form, space-padded for `I` and `W`.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::I => " I",
            Self::Rq => "RQ",
            Self::Rp => "RP",
            Self::W => " W",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

impl FromStr for Verb {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "I" => Ok(Self::I),
            "RQ" => Ok(Self::Rq),
            "RP" => Ok(Self::Rp),
            "W" => Ok(Self::W),
            _ => Err(()),
        }
    }
}

/// Decode an even-length upper-hex string into octets.
pub(crate) fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Encode octets as an upper-hex string.
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verb_wire_forms() {
        assert_eq!(Verb::I.as_wire(), " I");
        assert_eq!(Verb::W.as_wire(), " W");
        assert_eq!(Verb::from_str("I"), Ok(Verb::I));
        assert_eq!(Verb::from_str("RP"), Ok(Verb::Rp));
        assert!(Verb::from_str("XX").is_err());
    }

    #[test]
    fn hex_helpers_roundtrip() {
        let bytes = hex_to_bytes("0007D0").unwrap();
        assert_eq!(bytes, vec![0x00, 0x07, 0xd0]);
        assert_eq!(bytes_to_hex(&bytes), "0007D0");
        assert!(hex_to_bytes("ABC").is_none());
    }
}
