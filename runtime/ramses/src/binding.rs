// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The timed three-way pairing handshake over 1FC9.
//!
//! Either side may drive it: an offeror announces its capability and waits
//! to be accepted; an acceptor listens for offers and answers them. The
//! wire grammar lives in the protocol crate.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use ramses_protocols::{
    addr::DeviceId,
    binding::check_offerable,
    codes::Code,
    command::Command,
    message::Message,
    parsers::Payload,
    Verb,
};

use super::error::RamsesError;

/// The offeror hears back within this window.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(3);

/// The acceptor keeps listening for this long.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindState {
    Idle,
    Offered,
    Accepted,
    Confirmed,
    Failed,
}

/// Fires once with the id of the peer the handshake bound to.
pub type BindCallback = Box<dyn FnOnce(Result<DeviceId, RamsesError>) + Send>;

/// The offeror side: sends the opening `I`, waits for a `W`, confirms.
pub struct BindRequest {
    pub dev: DeviceId,
    pub code: Code,
    pub idx: u8,
    state: BindState,
    deadline: Instant,
    callback: Option<BindCallback>,
}

impl BindRequest {
    /// Validate the capability and compose the opening announcement.
    pub fn start(
        dev: DeviceId,
        code: Code,
        idx: u8,
        callback: BindCallback,
        now: Instant,
    ) -> Result<(BindRequest, Command), RamsesError> {
        check_offerable(dev.class(), code)
            .map_err(|e| RamsesError::BindingFailed(e.to_string()))?;

        let cmd = Command::put_bind_offer(dev, code, idx)?;
        info!(%dev, %code, "binding: offering");
        Ok((
            BindRequest {
                dev,
                code,
                idx,
                state: BindState::Offered,
                deadline: now + OFFER_TIMEOUT,
                callback: Some(callback),
            },
            cmd,
        ))
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, BindState::Confirmed | BindState::Failed)
    }

    /// Feed the accepting `W`; the returned command is the closing confirm.
    /// The state moves by assignment, never by comparison.
    pub fn on_accept(&mut self, msg: &Message) -> Option<Command> {
        if self.state != BindState::Offered {
            return None;
        }
        if msg.verb() != Verb::W || msg.code() != Code::RF_BIND || msg.dst() != self.dev {
            return None;
        }

        let ctl = msg.src();
        self.state = BindState::Accepted;
        debug!(dev = %self.dev, %ctl, "binding: accepted");

        let confirm = Command::put_bind_confirm(self.dev, ctl, self.code, self.idx);
        self.state = BindState::Confirmed;
        if let Some(cb) = self.callback.take() {
            cb(Ok(ctl));
        }
        Some(confirm)
    }

    pub fn check_deadline(&mut self, now: Instant) {
        if self.is_finished() || now < self.deadline {
            return;
        }
        self.state = BindState::Failed;
        debug!(dev = %self.dev, "binding: offer timed out");
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::BindingFailed(format!(
                "no controller accepted {} from {}",
                self.code, self.dev
            ))));
        }
    }

    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.state = BindState::Failed;
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::BindingFailed("cancelled".to_string())));
        }
    }
}

/// The acceptor side: a wildcard listener for offers of one code.
pub struct BindWait {
    pub dev: DeviceId,
    pub code: Code,
    pub idx: u8,
    state: BindState,
    deadline: Instant,
    offeror: Option<DeviceId>,
    callback: Option<BindCallback>,
}

impl BindWait {
    pub fn start(
        dev: DeviceId,
        code: Code,
        idx: u8,
        callback: BindCallback,
        now: Instant,
    ) -> Result<BindWait, RamsesError> {
        check_offerable(dev.class(), code)
            .map_err(|e| RamsesError::BindingFailed(e.to_string()))?;

        info!(%dev, %code, "binding: waiting for an offer");
        Ok(BindWait {
            dev,
            code,
            idx,
            state: BindState::Idle,
            deadline: now + WAIT_TIMEOUT,
            offeror: None,
            callback: Some(callback),
        })
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, BindState::Confirmed | BindState::Failed)
    }

    /// Feed inbound 1FC9 traffic. An offer of our code yields the answering
    /// `W`, retransmitted by the engine until the closing `I` arrives.
    pub fn on_msg(&mut self, msg: &Message) -> Option<Command> {
        if self.is_finished() || msg.code() != Code::RF_BIND {
            return None;
        }

        match (self.state, msg.verb()) {
            (BindState::Idle, Verb::I) | (BindState::Offered, Verb::I)
                if msg.src() == msg.dst() =>
            {
                let offered = match &msg.payload {
                    Payload::RfBind(triples) => triples.iter().any(|t| t.code == self.code),
                    _ => false,
                };
                if !offered {
                    return None;
                }
                let offeror = msg.src();
                self.offeror = Some(offeror);
                self.state = BindState::Offered;
                debug!(dev = %self.dev, %offeror, "binding: answering an offer");

                Some(Command::put_bind_accept(self.dev, offeror, self.code, self.idx))
            }
            (BindState::Offered, Verb::I) if Some(msg.src()) == self.offeror => {
                // The closing inform from the offeror.
                self.state = BindState::Confirmed;
                info!(dev = %self.dev, offeror = %msg.src(), "binding: confirmed");
                if let Some(cb) = self.callback.take() {
                    cb(Ok(msg.src()));
                }
                None
            }
            _ => None,
        }
    }

    pub fn check_deadline(&mut self, now: Instant) {
        if self.is_finished() || now < self.deadline {
            return;
        }
        self.state = BindState::Failed;
        debug!(dev = %self.dev, "binding: wait timed out");
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::BindingFailed(format!(
                "no offer of {} within the window",
                self.code
            ))));
        }
    }

    pub fn cancel(&mut self) {
        if self.is_finished() {
            return;
        }
        self.state = BindState::Failed;
        if let Some(cb) = self.callback.take() {
            cb(Err(RamsesError::BindingFailed("cancelled".to_string())));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ramses_protocols::packet::Packet;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    fn msg(line: &str) -> Message {
        let dtm = Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap();
        Message::new(Packet::from_line(line, dtm).unwrap())
    }

    type Seen = Arc<Mutex<Vec<Result<DeviceId, String>>>>;

    fn recorder() -> (Seen, BindCallback) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        let cb: BindCallback =
            Box::new(move |res| cloned.lock().unwrap().push(res.map_err(|e| e.to_string())));
        (seen, cb)
    }

    #[test]
    fn offeror_walks_offer_accept_confirm() {
        let dev = DeviceId::from_str("34:021943").unwrap();
        let t0 = Instant::now();
        let (seen, cb) = recorder();

        let (mut bind, offer) =
            BindRequest::start(dev, Code::ZONE_TEMP, 0, cb, t0).unwrap();
        assert_eq!(bind.state(), BindState::Offered);
        assert!(offer.to_line().contains("1FC9"));

        // The controller answers with a W pairing our code to its zone.
        let accept = msg(" W --- 01:054173 34:021943 --:------ 1FC9 006 03230904D39D");
        let confirm = bind.on_accept(&accept).unwrap();
        assert_eq!(bind.state(), BindState::Confirmed);
        assert!(confirm.to_line().starts_with(" I --- 34:021943 01:054173"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap().to_string(), "01:054173");
    }

    #[test]
    fn offeror_times_out_to_failed() {
        let dev = DeviceId::from_str("34:021943").unwrap();
        let t0 = Instant::now();
        let (seen, cb) = recorder();

        let (mut bind, _offer) =
            BindRequest::start(dev, Code::ZONE_TEMP, 0, cb, t0).unwrap();
        bind.check_deadline(t0 + OFFER_TIMEOUT + Duration::from_millis(1));
        assert_eq!(bind.state(), BindState::Failed);
        assert!(seen.lock().unwrap()[0].is_err());
    }

    #[test]
    fn offer_of_unsupported_code_is_refused_before_idle_is_left() {
        let dev = DeviceId::from_str("13:049798").unwrap();
        let (_seen, cb) = recorder();
        assert!(matches!(
            BindRequest::start(dev, Code::ZONE_TEMP, 0, cb, Instant::now()),
            Err(RamsesError::BindingFailed(_))
        ));
    }

    #[test]
    fn acceptor_answers_offer_and_confirms() {
        let t0 = Instant::now();
        let (seen, cb) = recorder();

        // A controller-side wait for a relay state; HGI class carries all
        // bindable codes, a controller would accept rather than offer.
        let mut wait = BindWait::start(
            DeviceId::from_str("18:000730").unwrap(),
            Code::ACTUATOR_STATE,
            0,
            cb,
            t0,
        )
        .unwrap();

        let offer = msg(
            " I --- 13:049798 --:------ 13:049798 1FC9 012 003EF034C286001FC934C286",
        );
        let answer = wait.on_msg(&offer).unwrap();
        assert_eq!(wait.state(), BindState::Offered);
        assert!(answer.to_line().starts_with(" W --- 18:000730 13:049798"));

        let confirm = msg(" I --- 13:049798 18:000730 --:------ 1FC9 006 003EF034C286");
        assert!(wait.on_msg(&confirm).is_none());
        assert_eq!(wait.state(), BindState::Confirmed);
        assert_eq!(
            seen.lock().unwrap()[0].as_ref().unwrap().to_string(),
            "13:049798"
        );
    }

    #[test]
    fn acceptor_ignores_offers_of_other_codes() {
        let t0 = Instant::now();
        let (_seen, cb) = recorder();
        let mut wait = BindWait::start(
            DeviceId::from_str("18:000730").unwrap(),
            Code::ACTUATOR_STATE,
            0,
            cb,
            t0,
        )
        .unwrap();

        let offer = msg(" I --- 07:045960 --:------ 07:045960 1FC9 012 0012601CB388001FC91CB388");
        assert!(wait.on_msg(&offer).is_none());
        assert_eq!(wait.state(), BindState::Idle);
    }
}
