// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto
pub mod cmdline;
pub mod dispatcher;

use clap::ValueEnum;

/// The level to debug runtime.
#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Debug
    }
}

pub trait RuntimeOperation<T>: Sized {
    type Error: std::fmt::Display;

    fn new(arg: T, log_level: Option<LogLevel>) -> Result<Self, Self::Error>;
    fn listen(&mut self) -> Result<(), Self::Error>;
    fn run(&mut self) -> Result<(), Self::Error>;
}
