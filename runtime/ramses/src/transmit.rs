// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The transmit engine: one cooperative owner of the send path.
//!
//! Commands queue by priority, go out one at a time, and complete through
//! the receive path: first the adaptor's echo of the frame, then the
//! expected reply when the command has one. Every wait carries a deadline;
//! expiry consumes a retry slot or fails the command.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use ramses_protocols::{command::{Command, Priority}, message::Message};

use super::transport::CmdCallback;

/// Wait on the adaptor echoing a written frame back.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Smallest gap between consecutive writes.
pub const MIN_TX_GAP: Duration = Duration::from_millis(20);

/// The window over which the duty-cycle budget is accounted.
const DUTY_WINDOW: Duration = Duration::from_secs(3600);

/// Serial line rate in octets per second (115200 baud, 8-N-1).
const LINE_RATE: f64 = 11_520.0;

struct Pending {
    cmd: Command,
    callback: Option<CmdCallback>,
    retries_left: u8,
    seq: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then oldest submission.
        self.cmd
            .qos
            .priority
            .cmp(&other.cmd.qos.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum TxState {
    AwaitingEcho,
    AwaitingReply,
}

struct InFlight {
    cmd: Command,
    callback: Option<CmdCallback>,
    retries_left: u8,
    seq: u64,
    state: TxState,
    deadline: Instant,
}

/// How an inbound frame relates to the engine's own traffic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The echo of the frame the engine just wrote. Delivered downstream
    /// exactly once, here.
    Echo,
    /// The reply that completed the in-flight command.
    Reply,
    /// Ordinary traffic.
    Other,
}

pub struct TransmitEngine {
    queue: BinaryHeap<Pending>,
    in_flight: Option<InFlight>,
    next_seq: u64,
    last_tx: Option<Instant>,
    /// (write time, octets) of every write inside the duty window.
    window: VecDeque<(Instant, usize)>,
    window_octets: usize,
    budget_octets: usize,
}

impl TransmitEngine {
    /// `duty_cycle` is the share of line-rate airtime allowed over any
    /// rolling hour, 0.01 by default.
    pub fn new(duty_cycle: f64) -> TransmitEngine {
        TransmitEngine {
            queue: BinaryHeap::new(),
            in_flight: None,
            next_seq: 0,
            last_tx: None,
            window: VecDeque::new(),
            window_octets: 0,
            budget_octets: (LINE_RATE * DUTY_WINDOW.as_secs_f64() * duty_cycle) as usize,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    pub fn queued(&self) -> usize {
        self.queue.len() + self.in_flight.is_some() as usize
    }

    /// Enqueue a command. `Asap` preempts a pending wait: the in-flight
    /// packet returns to the queue and keeps its remaining retry slots.
    pub fn submit(&mut self, cmd: Command, callback: Option<CmdCallback>) {
        if cmd.qos.priority == Priority::Asap {
            if let Some(fl) = self.in_flight.take() {
                debug!(line = %fl.cmd.to_line(), "send preempted");
                self.queue.push(Pending {
                    cmd: fl.cmd,
                    callback: fl.callback,
                    retries_left: fl.retries_left,
                    seq: fl.seq,
                });
            }
        }

        let retries_left = cmd.qos.retries;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Pending {
            cmd,
            callback,
            retries_left,
            seq,
        });
    }

    fn evict_window(&mut self, now: Instant) {
        while let Some(&(t, n)) = self.window.front() {
            if now.duration_since(t) >= DUTY_WINDOW {
                self.window.pop_front();
                self.window_octets -= n;
            } else {
                break;
            }
        }
    }

    /// The moment the pacing rules next allow a write of `octets`.
    fn earliest_tx(&mut self, now: Instant, octets: usize) -> Instant {
        let mut at = now;
        if let Some(last) = self.last_tx {
            at = at.max(last + MIN_TX_GAP);
        }
        self.evict_window(now);
        if self.window_octets + octets > self.budget_octets {
            // Deferred until enough of the window has aged out; never drop.
            let mut freed = self.window_octets;
            for &(t, n) in self.window.iter() {
                freed -= n;
                if freed + octets <= self.budget_octets {
                    at = at.max(t + DUTY_WINDOW);
                    break;
                }
            }
        }
        at
    }

    /// Take the line to write now, if the queue and pacing allow one.
    pub fn poll_send(&mut self, now: Instant) -> Option<String> {
        if self.in_flight.is_some() || self.queue.is_empty() {
            return None;
        }

        let line = self.queue.peek().unwrap().cmd.to_line();
        let octets = line.len() + 2;
        if self.earliest_tx(now, octets) > now {
            return None;
        }

        let pending = self.queue.pop().unwrap();
        trace!(line = %line, retries_left = pending.retries_left, "transmitting");

        self.window.push_back((now, octets));
        self.window_octets += octets;
        self.last_tx = Some(now);
        self.in_flight = Some(InFlight {
            cmd: pending.cmd,
            callback: pending.callback,
            retries_left: pending.retries_left,
            seq: pending.seq,
            state: TxState::AwaitingEcho,
            deadline: now + ECHO_TIMEOUT,
        });
        Some(line)
    }

    /// The next instant the run loop must call back: a wait deadline or the
    /// earliest permitted send.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        if let Some(fl) = &self.in_flight {
            return Some(fl.deadline);
        }
        if self.queue.is_empty() {
            return None;
        }
        let octets = self.queue.peek().map(|p| p.cmd.to_line().len() + 2).unwrap();
        Some(self.earliest_tx(now, octets))
    }

    /// Expire a blown echo/reply wait: requeue while retry slots remain,
    /// fail the command otherwise.
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired = match &self.in_flight {
            Some(fl) if now >= fl.deadline => true,
            _ => false,
        };
        if !expired {
            return;
        }

        let fl = self.in_flight.take().unwrap();
        if fl.retries_left > 0 {
            debug!(line = %fl.cmd.to_line(), retries_left = fl.retries_left - 1, "retrying");
            self.queue.push(Pending {
                cmd: fl.cmd,
                callback: fl.callback,
                retries_left: fl.retries_left - 1,
                seq: fl.seq,
            });
        } else {
            debug!(line = %fl.cmd.to_line(), "expired");
            if let Some(cb) = fl.callback {
                cb(None);
            }
        }
    }

    /// Relate an inbound message to the in-flight command, dispatching its
    /// callback on completion.
    pub fn handle_msg(&mut self, msg: &Message, now: Instant) -> Disposition {
        enum Action {
            Ignore,
            EchoAwaitReply,
            EchoComplete,
            ReplyComplete,
        }

        let action = match &self.in_flight {
            None => Action::Ignore,
            Some(fl) => match fl.state {
                TxState::AwaitingEcho if fl.cmd.matches_echo(&msg.pkt) => {
                    if fl.cmd.expect.is_some() {
                        Action::EchoAwaitReply
                    } else {
                        Action::EchoComplete
                    }
                }
                TxState::AwaitingReply
                    if fl.cmd.expect.as_ref().map_or(false, |e| e.matches(msg)) =>
                {
                    Action::ReplyComplete
                }
                _ => Action::Ignore,
            },
        };

        match action {
            Action::Ignore => Disposition::Other,
            Action::EchoAwaitReply => {
                let fl = self.in_flight.as_mut().unwrap();
                fl.state = TxState::AwaitingReply;
                fl.deadline = now + fl.cmd.qos.timeout;
                Disposition::Echo
            }
            Action::EchoComplete => {
                let fl = self.in_flight.take().unwrap();
                if let Some(cb) = fl.callback {
                    cb(Some(msg.clone()));
                }
                Disposition::Echo
            }
            Action::ReplyComplete => {
                let fl = self.in_flight.take().unwrap();
                if let Some(cb) = fl.callback {
                    cb(Some(msg.clone()));
                }
                Disposition::Reply
            }
        }
    }

    /// Cancel everything; every callback gets a null message.
    pub fn shutdown(&mut self) {
        if let Some(fl) = self.in_flight.take() {
            if let Some(cb) = fl.callback {
                cb(None);
            }
        }
        while let Some(pending) = self.queue.pop() {
            if let Some(cb) = pending.callback {
                cb(None);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ramses_protocols::addr::DeviceId;
    use ramses_protocols::packet::Packet;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    fn ctl() -> DeviceId {
        DeviceId::from_str("01:145039").unwrap()
    }

    fn msg_of(line: &str) -> Message {
        let dtm = Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap();
        Message::new(Packet::from_line(line, dtm).unwrap())
    }

    fn recorder() -> (Arc<Mutex<Vec<Option<Message>>>>, CmdCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let cb: CmdCallback = Box::new(move |msg| cloned.lock().unwrap().push(msg));
        (seen, cb)
    }

    #[test]
    fn priority_orders_transmissions() {
        let mut engine = TransmitEngine::new(0.01);
        let t0 = Instant::now();

        engine.submit(
            Command::get_zone_temp(ctl(), 1).with_priority(Priority::Low),
            None,
        );
        engine.submit(
            Command::get_zone_temp(ctl(), 2).with_priority(Priority::High),
            None,
        );

        let first = engine.poll_send(t0).unwrap();
        assert!(first.ends_with("30C9 001 02"), "{}", first);

        // Complete the first exchange, then the low one goes.
        let echo = msg_of(&first);
        assert_eq!(engine.handle_msg(&echo, t0), Disposition::Echo);
        let reply = msg_of("045 RP --- 01:145039 18:000730 --:------ 30C9 003 0207D0");
        assert_eq!(engine.handle_msg(&reply, t0), Disposition::Reply);

        let second = engine.poll_send(t0 + MIN_TX_GAP).unwrap();
        assert!(second.ends_with("30C9 001 01"), "{}", second);
    }

    #[test]
    fn ties_break_in_submission_order() {
        let mut engine = TransmitEngine::new(0.01);
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 3), None);
        engine.submit(Command::get_zone_temp(ctl(), 4), None);

        let first = engine.poll_send(t0).unwrap();
        assert!(first.ends_with("30C9 001 03"), "{}", first);
    }

    #[test]
    fn retries_are_exhausted_then_expired() {
        let mut engine = TransmitEngine::new(0.01);
        let (seen, cb) = recorder();
        let t0 = Instant::now();

        engine.submit(
            Command::get_zone_temp(ctl(), 0).with_retries(2),
            Some(cb),
        );

        let mut writes = 0;
        let mut now = t0;
        loop {
            if engine.poll_send(now).is_some() {
                writes += 1;
            }
            if engine.is_idle() {
                break;
            }
            now += ECHO_TIMEOUT + Duration::from_millis(100);
            engine.handle_timeout(now);
        }

        assert_eq!(writes, 3);
        assert_eq!(seen.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn no_echo_with_zero_retries_expires_quickly() {
        let mut engine = TransmitEngine::new(0.01);
        let (seen, cb) = recorder();
        let t0 = Instant::now();

        engine.submit(
            Command::get_zone_temp(ctl(), 0).with_retries(0),
            Some(cb),
        );
        assert!(engine.poll_send(t0).is_some());
        assert_eq!(engine.next_deadline(t0), Some(t0 + ECHO_TIMEOUT));

        engine.handle_timeout(t0 + ECHO_TIMEOUT + Duration::from_millis(100));
        assert!(engine.is_idle());
        assert_eq!(seen.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn echo_then_reply_completes_with_message() {
        let mut engine = TransmitEngine::new(0.01);
        let (seen, cb) = recorder();
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 0), Some(cb));
        let line = engine.poll_send(t0).unwrap();

        assert_eq!(engine.handle_msg(&msg_of(&line), t0), Disposition::Echo);

        let reply = msg_of("045 RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0");
        assert_eq!(engine.handle_msg(&reply, t0), Disposition::Reply);
        assert!(engine.is_idle());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_some());
    }

    #[test]
    fn unrelated_traffic_is_other() {
        let mut engine = TransmitEngine::new(0.01);
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 0), None);
        engine.poll_send(t0).unwrap();

        let other = msg_of("045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5");
        assert_eq!(engine.handle_msg(&other, t0), Disposition::Other);
    }

    #[test]
    fn min_gap_paces_consecutive_writes() {
        let mut engine = TransmitEngine::new(0.01);
        let t0 = Instant::now();

        // A command without an expected reply completes on its echo.
        engine.submit(
            Command::put_bind_confirm(ctl(), ctl(), ramses_protocols::codes::Code::ZONE_TEMP, 0),
            None,
        );
        let line = engine.poll_send(t0).unwrap();
        engine.handle_msg(&msg_of(&line), t0);

        engine.submit(Command::get_zone_temp(ctl(), 1), None);
        assert!(engine.poll_send(t0).is_none());
        assert!(engine.poll_send(t0 + MIN_TX_GAP).is_some());
    }

    #[test]
    fn duty_cycle_defers_but_never_drops() {
        // A budget of ~one small frame per hour.
        let mut engine = TransmitEngine::new(0.000002);
        assert!(engine.budget_octets >= 50 && engine.budget_octets < 100);
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 0), None);
        let line = engine.poll_send(t0).unwrap();
        engine.handle_msg(&msg_of(&line), t0);
        let reply = msg_of("045 RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0");
        engine.handle_msg(&reply, t0);

        engine.submit(Command::get_zone_temp(ctl(), 1), None);
        assert!(engine.poll_send(t0 + Duration::from_secs(1)).is_none());

        // The send is deferred to the reopening of the window, not dropped.
        let at = engine.next_deadline(t0 + Duration::from_secs(1)).unwrap();
        assert!(at >= t0 + DUTY_WINDOW);
        assert!(engine.poll_send(at).is_some());
    }

    #[test]
    fn asap_preempts_pending_wait() {
        let mut engine = TransmitEngine::new(0.01);
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 0).with_retries(1), None);
        let first = engine.poll_send(t0).unwrap();
        assert!(first.ends_with("30C9 001 00"), "{}", first);

        engine.submit(
            Command::get_zone_temp(ctl(), 5).with_priority(Priority::Asap),
            None,
        );

        // The preempting command goes out next; the preempted one returns to
        // the queue with its retry slots intact.
        let next = engine.poll_send(t0 + MIN_TX_GAP).unwrap();
        assert!(next.ends_with("30C9 001 05"), "{}", next);
        engine.handle_msg(&msg_of(&next), t0 + MIN_TX_GAP);
        let reply = msg_of("045 RP --- 01:145039 18:000730 --:------ 30C9 003 0507D0");
        engine.handle_msg(&reply, t0 + MIN_TX_GAP);

        let again = engine.poll_send(t0 + MIN_TX_GAP * 2).unwrap();
        assert!(again.ends_with("30C9 001 00"), "{}", again);
    }

    #[test]
    fn shutdown_completes_everything_with_null() {
        let mut engine = TransmitEngine::new(0.01);
        let (seen, cb1) = recorder();
        let cloned = seen.clone();
        let cb2: CmdCallback = Box::new(move |msg| cloned.lock().unwrap().push(msg));
        let t0 = Instant::now();

        engine.submit(Command::get_zone_temp(ctl(), 0), Some(cb1));
        engine.poll_send(t0).unwrap();
        engine.submit(Command::get_zone_temp(ctl(), 1), Some(cb2));

        engine.shutdown();
        assert!(engine.is_idle());
        assert_eq!(seen.lock().unwrap().as_slice(), &[None, None]);
    }
}
