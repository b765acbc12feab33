// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Runtime for RAMSES-II heating/HVAC installations behind an HGI80 or
//! evofw3-compatible serial radio adaptor: serial transport, the transmit
//! engine, the entity fabric and the service glue around them.

pub mod binding;
pub mod device;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod system;
pub mod transmit;
pub mod transport;

pub use ramses_protocols as protocols;
