// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Chunked fetchers: zone schedules over 0404 and the fault log over 0418.
//!
//! A fetcher is a small state machine driven by the gateway's dispatch
//! path. It owns its completion callback and fires it exactly once, with
//! the assembled record or an expiry.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use ramses_protocols::{
    addr::DeviceId,
    command::Command,
    parsers::{FaultEntry, FaultLogEntry, ScheduleFragment},
};

use super::error::RamsesError;

/// A fetch that makes no progress for this long has lost a chunk.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(9);

/// Largest fragment body a 0404 write carries.
const MAX_FRAGMENT_OCTETS: usize = 38;

/// The assembled schedule of one zone, fragments concatenated in order.
/// Switchpoint decoding is left to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub zone_idx: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FetchState {
    Requesting,
    Assembling,
    Done,
    Failed,
}

pub type ScheduleCallback = Box<dyn FnOnce(Result<Schedule, RamsesError>) + Send>;
pub type FaultLogCallback = Box<dyn FnOnce(Result<Vec<(u8, FaultEntry)>, RamsesError>) + Send>;

pub struct ScheduleFetcher {
    ctl: DeviceId,
    zone_idx: u8,
    state: FetchState,
    frags: BTreeMap<u8, Vec<u8>>,
    total: Option<u8>,
    deadline: Instant,
    callback: Option<ScheduleCallback>,
}

impl ScheduleFetcher {
    /// Kick off a fetch: the first command asks for fragment 1, which also
    /// reveals the total.
    pub fn start(
        ctl: DeviceId,
        zone_idx: u8,
        callback: ScheduleCallback,
        now: Instant,
    ) -> (ScheduleFetcher, Command) {
        let fetcher = ScheduleFetcher {
            ctl,
            zone_idx,
            state: FetchState::Requesting,
            frags: BTreeMap::new(),
            total: None,
            deadline: now + FETCH_TIMEOUT,
            callback: Some(callback),
        };
        let cmd = Command::get_schedule_fragment(ctl, zone_idx, 1, 0);
        (fetcher, cmd)
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, FetchState::Done | FetchState::Failed)
    }

    fn first_missing(&self) -> Option<u8> {
        let total = self.total?;
        (1..=total).find(|idx| !self.frags.contains_key(idx))
    }

    /// Feed one 0404 reply. Returns the follow-up request while fragments
    /// are missing; completion fires the callback.
    pub fn on_fragment(&mut self, frag: &ScheduleFragment) -> Option<Command> {
        if frag.idx != self.zone_idx || self.is_finished() {
            return None;
        }
        if frag.frag_idx == 0 {
            return None;
        }

        self.state = FetchState::Assembling;
        if frag.frag_cnt > 0 {
            self.total = Some(frag.frag_cnt);
        }
        self.frags.insert(frag.frag_idx, frag.data.clone());

        match self.first_missing() {
            None if self.total.is_some() => {
                let data = self.frags.values().flatten().copied().collect();
                self.state = FetchState::Done;
                debug!(zone_idx = self.zone_idx, "schedule assembled");
                if let Some(cb) = self.callback.take() {
                    cb(Ok(Schedule {
                        zone_idx: self.zone_idx,
                        data,
                    }));
                }
                None
            }
            Some(missing) => Some(Command::get_schedule_fragment(
                self.ctl,
                self.zone_idx,
                missing,
                self.total.unwrap_or(0),
            )),
            None => None,
        }
    }

    /// Fail the fetch once its deadline passes.
    pub fn check_deadline(&mut self, now: Instant) {
        if self.is_finished() || now < self.deadline {
            return;
        }
        self.state = FetchState::Failed;
        debug!(zone_idx = self.zone_idx, "schedule fetch expired");
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::ExpiredCallback(format!(
                "schedule fetch for zone {:02X}",
                self.zone_idx
            ))));
        }
    }

    /// Cancel on shutdown.
    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.state = FetchState::Failed;
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::ExpiredCallback(format!(
                "schedule fetch for zone {:02X} cancelled",
                self.zone_idx
            ))));
        }
    }
}

/// Split a schedule into the write commands of one 0404 upload.
pub fn push_schedule_cmds(ctl: DeviceId, zone_idx: u8, data: &[u8]) -> Vec<Command> {
    let chunks: Vec<&[u8]> = data.chunks(MAX_FRAGMENT_OCTETS).collect();
    let total = chunks.len() as u8;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            Command::set_schedule_fragment(ctl, zone_idx, (i + 1) as u8, total, chunk)
        })
        .collect()
}

pub struct FaultLogFetcher {
    ctl: DeviceId,
    state: FetchState,
    entries: Vec<(u8, FaultEntry)>,
    next_idx: u8,
    deadline: Instant,
    callback: Option<FaultLogCallback>,
}

/// The controller serves at most this many entries.
const MAX_LOG_ENTRIES: u8 = 64;

impl FaultLogFetcher {
    pub fn start(
        ctl: DeviceId,
        callback: FaultLogCallback,
        now: Instant,
    ) -> (FaultLogFetcher, Command) {
        let fetcher = FaultLogFetcher {
            ctl,
            state: FetchState::Requesting,
            entries: Vec::new(),
            next_idx: 0,
            deadline: now + FETCH_TIMEOUT,
            callback: Some(callback),
        };
        let cmd = Command::get_fault_log_entry(ctl, 0);
        (fetcher, cmd)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, FetchState::Done | FetchState::Failed)
    }

    /// Feed one 0418 reply; `None` in the entry ends the log.
    pub fn on_entry(&mut self, entry: &FaultLogEntry, now: Instant) -> Option<Command> {
        if self.is_finished() || entry.log_idx != self.next_idx {
            return None;
        }

        match entry.entry {
            Some(fault) => {
                self.entries.push((entry.log_idx, fault));
                self.next_idx += 1;
                self.deadline = now + FETCH_TIMEOUT;
                if self.next_idx >= MAX_LOG_ENTRIES {
                    self.complete();
                    None
                } else {
                    self.state = FetchState::Assembling;
                    Some(Command::get_fault_log_entry(self.ctl, self.next_idx))
                }
            }
            None => {
                self.complete();
                None
            }
        }
    }

    fn complete(&mut self) {
        self.state = FetchState::Done;
        debug!(entries = self.entries.len(), "fault log assembled");
        if let Some(cb) = self.callback.take() {
            cb(Ok(std::mem::take(&mut self.entries)));
        }
    }

    pub fn check_deadline(&mut self, now: Instant) {
        if self.is_finished() || now < self.deadline {
            return;
        }
        self.state = FetchState::Failed;
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::ExpiredCallback(
                "fault log fetch".to_string(),
            )));
        }
    }

    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.state = FetchState::Failed;
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::ExpiredCallback(
                "fault log fetch cancelled".to_string(),
            )));
        }
    }
}
