// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use ramses_protocols::{command::CommandError, packet::PacketError};
use thiserror::Error;

/// The error kinds of the gateway runtime.
#[derive(Debug, Error)]
pub enum RamsesError {
    /// A serial line the codec rejected; dropped by the caller.
    #[error("invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    /// An entity invariant was violated mid-run; the gateway stops.
    #[error("the system state is inconsistent: {0} (try restarting the gateway)")]
    CorruptState(String),

    /// A second controller appeared without a known-device list to allow it.
    #[error("there is more than one controller: {0} (use a known-device list to allow this)")]
    MultipleController(String),

    /// Retries exhausted; also delivered to callbacks as a null message.
    #[error("command expired: {0}")]
    ExpiredCallback(String),

    #[error("binding failed: {0}")]
    BindingFailed(String),

    #[error("serial port: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(String),

    #[error("command: {0}")]
    Command(#[from] CommandError),
}
