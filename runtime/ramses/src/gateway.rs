// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! The gateway: owner of the entity arena, the transmit engine and the run
//! loop that drives them from one thread.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde_json::{json, Value};
use tracing::{debug, debug_span, info, warn, Level};

use ramses_protocols::{
    addr::{DeviceClass, DeviceId},
    codes::Code,
    command::Command,
    message::Message,
    packet::Packet,
    parsers::{Payload, DOMAIN_DHW, DOMAIN_DHW_HTG, DOMAIN_HTG, MAX_ZONES},
    Verb,
};
use runtime_core::{dispatcher::Dispatcher, LogLevel, RuntimeOperation};

use super::binding::{BindCallback, BindRequest, BindWait};
use super::device::{Device, DeviceEffect, Parent};
use super::error::RamsesError;
use super::fetch::{
    push_schedule_cmds, FaultLogCallback, FaultLogFetcher, ScheduleCallback, ScheduleFetcher,
};
use super::system::{
    System, SystemEffect, ROLE_ACTUATOR, ROLE_DHW_SENSOR, ROLE_DHW_VALVE, ROLE_DHW_VALVE_HTG,
    ROLE_HTG_RELAY, ROLE_SENSOR,
};
use super::transmit::TransmitEngine;
use super::transport::{
    start_replay, CmdCallback, Event, LineSink, PacketLog, SerialTransport,
};

/// Where the frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Bidirectional serial adaptor.
    Serial { port: String },
    /// Serial adaptor, receive only.
    SerialListen { port: String },
    /// Packet-log replay; the write side stays disabled.
    Replay { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,
    pub packet_log: Option<PathBuf>,
    /// Devices the caller vouches for. With `enforce_known_list`, traffic
    /// from any other address is dropped before parsing.
    pub known_list: HashSet<DeviceId>,
    pub enforce_known_list: bool,
    pub enable_eavesdrop: bool,
    pub disable_sending: bool,
    pub disable_discovery: bool,
    pub evofw_flag: Option<u8>,
    /// Share of line-rate airtime allowed over any rolling hour.
    pub duty_cycle: f64,
    /// Raw commands fired once the loop is up.
    pub exec_cmds: Vec<String>,
    /// One-shot fault log fetch against this controller.
    pub get_faults: Option<DeviceId>,
    /// One-shot schedule fetch of (controller, zone).
    pub get_schedule: Option<(DeviceId, u8)>,
    /// Stop once the one-shot scripts above have completed.
    pub oneshot: bool,
    /// State snapshot to restore before listening.
    pub restore_state: Option<PathBuf>,
    pub show_schema: bool,
    pub show_params: bool,
    pub show_status: bool,
    pub show_state: bool,
}

impl Config {
    pub fn new(source: Source) -> Config {
        Config {
            source,
            packet_log: None,
            known_list: HashSet::new(),
            enforce_known_list: false,
            enable_eavesdrop: false,
            disable_sending: false,
            disable_discovery: false,
            evofw_flag: None,
            duty_cycle: 0.01,
            exec_cmds: Vec::new(),
            get_faults: None,
            get_schedule: None,
            oneshot: false,
            restore_state: None,
            show_schema: false,
            show_params: false,
            show_status: false,
            show_state: false,
        }
    }

    fn validate(&self) -> Result<(), RamsesError> {
        if self.enforce_known_list && self.known_list.is_empty() {
            return Err(RamsesError::Config(
                "an enforced known-device list must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.duty_cycle) || self.duty_cycle == 0.0 {
            return Err(RamsesError::Config(format!(
                "duty cycle {} out of range",
                self.duty_cycle
            )));
        }
        Ok(())
    }

    fn can_send(&self) -> bool {
        !self.disable_sending && matches!(self.source, Source::Serial { .. })
    }
}

enum Sink {
    Serial(SerialTransport),
    Suppressed,
    #[cfg(test)]
    Mem(super::transport::test_support::MemSink),
}

impl Sink {
    fn write_line(&mut self, line: &str) -> Result<(), RamsesError> {
        match self {
            Self::Serial(serial) => serial.write_line(line),
            Self::Suppressed => {
                debug!(line, "write suppressed");
                Ok(())
            }
            #[cfg(test)]
            Self::Mem(sink) => sink.write_line(line),
        }
    }
}

/// A typed listener record; matching is linear but the vector is bounded.
struct Subscription {
    verb: Option<Verb>,
    code: Option<Code>,
    src: Option<DeviceId>,
    idx: Option<u8>,
    deadline: Option<Instant>,
    callback: Box<dyn FnMut(&Message) + Send>,
}

impl Subscription {
    fn matches(&self, msg: &Message) -> bool {
        self.verb.map_or(true, |v| v == msg.verb())
            && self.code.map_or(true, |c| c == msg.code())
            && self.src.map_or(true, |s| s == msg.src())
            && self.idx.map_or(true, |i| Some(i) == msg.idx())
    }
}

/// Cool-off before a faulty device's messages are honoured again.
fn faulty_cool_off() -> chrono::Duration {
    chrono::Duration::seconds(60)
}

const EVENT_QUEUE_DEPTH: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_millis(250);

pub struct Gateway {
    cfg: Config,
    tx: SyncSender<Event>,
    rx: Receiver<Event>,
    sink: Sink,
    engine: TransmitEngine,
    devices: HashMap<DeviceId, Device>,
    device_order: Vec<DeviceId>,
    systems: BTreeMap<DeviceId, System>,
    hgi_id: Option<DeviceId>,
    listeners: Vec<Subscription>,
    clients: Vec<SyncSender<Message>>,
    schedule_fetchers: HashMap<(DeviceId, u8), ScheduleFetcher>,
    schedule_waiting: HashMap<(DeviceId, u8), VecDeque<ScheduleCallback>>,
    fault_fetchers: HashMap<DeviceId, FaultLogFetcher>,
    bind_requests: Vec<BindRequest>,
    bind_waits: Vec<BindWait>,
    pkt_db: BTreeMap<(DeviceId, Code, Option<u8>), Packet>,
    pkt_log: Option<PacketLog>,
    dispatchers: Vec<Dispatcher>,
    reader: Option<thread::JoinHandle<()>>,
    fatal: Option<RamsesError>,
}

impl RuntimeOperation<Config> for Gateway {
    type Error = RamsesError;

    fn new(cfg: Config, log_level: Option<LogLevel>) -> Result<Self, Self::Error> {
        if let Some(level) = log_level {
            let fmt_level = match level {
                LogLevel::Debug => Level::DEBUG,
                LogLevel::Trace => Level::TRACE,
            };
            tracing_subscriber::fmt().with_max_level(fmt_level).init();
        }

        cfg.validate()?;

        let sink = match &cfg.source {
            Source::Serial { port } | Source::SerialListen { port } => {
                Sink::Serial(SerialTransport::open(port, cfg.evofw_flag)?)
            }
            Source::Replay { .. } => Sink::Suppressed,
        };

        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let engine = TransmitEngine::new(cfg.duty_cycle);

        Ok(Gateway {
            cfg,
            tx,
            rx,
            sink,
            engine,
            devices: HashMap::new(),
            device_order: Vec::new(),
            systems: BTreeMap::new(),
            hgi_id: None,
            listeners: Vec::new(),
            clients: Vec::new(),
            schedule_fetchers: HashMap::new(),
            schedule_waiting: HashMap::new(),
            fault_fetchers: HashMap::new(),
            bind_requests: Vec::new(),
            bind_waits: Vec::new(),
            pkt_db: BTreeMap::new(),
            pkt_log: None,
            dispatchers: Vec::new(),
            reader: None,
            fatal: None,
        })
    }

    fn listen(&mut self) -> Result<(), Self::Error> {
        if let Some(path) = &self.cfg.packet_log {
            self.pkt_log = Some(PacketLog::create(path)?);
        }

        if let Some(path) = self.cfg.restore_state.take() {
            let text = std::fs::read_to_string(path)?;
            let state: Value = serde_json::from_str(&text)
                .map_err(|e| RamsesError::Config(format!("unusable state snapshot: {}", e)))?;
            self.set_state(&state)?;
        }

        let mut dispatcher = Dispatcher::run("system event dispatcher".to_string())
            .map_err(|e| RamsesError::Config(e.to_string()))?;
        for signum in [Signal::SIGINT, Signal::SIGTERM] {
            let tx = self.tx.clone();
            dispatcher.attach_signal_handler(signum, move || {
                let _ = tx.send(Event::Shutdown);
                glib::ControlFlow::Break
            });
        }
        let tx = self.tx.clone();
        dispatcher.attach_interval_handler(TICK_INTERVAL, move || {
            let _ = tx.send(Event::Tick);
            glib::ControlFlow::Continue
        });
        self.dispatchers.push(dispatcher);

        match self.cfg.source.clone() {
            Source::Serial { .. } | Source::SerialListen { .. } => {
                if let Sink::Serial(serial) = &self.sink {
                    self.reader = Some(serial.start_reader(self.tx.clone())?);
                }
            }
            Source::Replay { path } => {
                self.reader = Some(start_replay(path, self.tx.clone())?);
            }
        }

        self.spawn_scripts()?;

        Ok(())
    }

    fn run(&mut self) -> Result<(), Self::Error> {
        let enter = debug_span!("event").entered();
        loop {
            let now = Instant::now();
            self.pump(now)?;
            if let Some(err) = self.fatal.take() {
                enter.exit();
                self.shutdown();
                return Err(err);
            }

            let wait = self
                .engine
                .next_deadline(Instant::now())
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_WAIT)
                .min(IDLE_WAIT);

            match self.rx.recv_timeout(wait) {
                Ok(Event::Line(line, dtm)) => self.on_line(&line, dtm),
                Ok(Event::Command(cmd, callback)) => self.submit_cmd(cmd, callback),
                Ok(Event::Tick) => {}
                Ok(Event::Shutdown) => break,
                Ok(Event::Eof) => {
                    info!("input exhausted");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        enter.exit();

        self.shutdown();
        self.report();
        Ok(())
    }
}

impl Gateway {
    #[cfg(test)]
    pub(crate) fn new_for_test(cfg: Config) -> (Gateway, super::transport::test_support::MemSink) {
        let sink = super::transport::test_support::MemSink::default();
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let engine = TransmitEngine::new(cfg.duty_cycle);
        let gwy = Gateway {
            cfg,
            tx,
            rx,
            sink: Sink::Mem(sink.clone()),
            engine,
            devices: HashMap::new(),
            device_order: Vec::new(),
            systems: BTreeMap::new(),
            hgi_id: None,
            listeners: Vec::new(),
            clients: Vec::new(),
            schedule_fetchers: HashMap::new(),
            schedule_waiting: HashMap::new(),
            fault_fetchers: HashMap::new(),
            bind_requests: Vec::new(),
            bind_waits: Vec::new(),
            pkt_db: BTreeMap::new(),
            pkt_log: None,
            dispatchers: Vec::new(),
            reader: None,
            fatal: None,
        };
        (gwy, sink)
    }

    /// A cloneable submission handle for other threads.
    pub fn sender(&self) -> SyncSender<Event> {
        self.tx.clone()
    }

    /// Kick off the operator's one-shot scripts. In oneshot mode the loop
    /// stops once the last of them completes.
    fn spawn_scripts(&mut self) -> Result<(), RamsesError> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let outstanding = Arc::new(AtomicUsize::new(0));
        let oneshot = self.cfg.oneshot;
        let finish = {
            let tx = self.tx.clone();
            let outstanding = outstanding.clone();
            move || {
                if oneshot && outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let _ = tx.send(Event::Shutdown);
                }
            }
        };

        for raw in std::mem::take(&mut self.cfg.exec_cmds) {
            let cmd = Command::from_raw(&raw)?;
            outstanding.fetch_add(1, Ordering::SeqCst);
            let finish = finish.clone();
            self.submit_cmd(
                cmd,
                Some(Box::new(move |msg| {
                    if let Some(msg) = msg {
                        println!("{}", msg.pkt);
                    }
                    finish();
                })),
            );
        }

        if let Some(ctl) = self.cfg.get_faults {
            outstanding.fetch_add(1, Ordering::SeqCst);
            let finish = finish.clone();
            self.get_fault_log(
                ctl,
                Box::new(move |res| {
                    match res {
                        Ok(entries) => {
                            println!("{}", serde_json::to_string_pretty(&json!(entries)).unwrap())
                        }
                        Err(err) => eprintln!("{}", err),
                    }
                    finish();
                }),
            );
        }

        if let Some((ctl, zone_idx)) = self.cfg.get_schedule {
            outstanding.fetch_add(1, Ordering::SeqCst);
            let finish = finish.clone();
            self.get_schedule(
                ctl,
                zone_idx,
                Box::new(move |res| {
                    match res {
                        Ok(schedule) => println!(
                            "{}",
                            serde_json::to_string_pretty(&json!(schedule)).unwrap()
                        ),
                        Err(err) => eprintln!("{}", err),
                    }
                    finish();
                }),
            );
        }

        if oneshot && outstanding.load(Ordering::SeqCst) == 0 {
            let _ = self.tx.send(Event::Shutdown);
        }
        Ok(())
    }

    /// Subscribe a message stream; every accepted message is forwarded.
    pub fn create_client(&mut self) -> Receiver<Message> {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        self.clients.push(tx);
        rx
    }

    /// Install a typed listener.
    pub fn add_listener<F>(
        &mut self,
        verb: Option<Verb>,
        code: Option<Code>,
        src: Option<DeviceId>,
        idx: Option<u8>,
        deadline: Option<Instant>,
        callback: F,
    ) where
        F: FnMut(&Message) + Send + 'static,
    {
        self.listeners.push(Subscription {
            verb,
            code,
            src,
            idx,
            deadline,
            callback: Box::new(callback),
        });
    }

    /// Queue a command. With sending disabled the callback completes with a
    /// null message straight away.
    pub fn submit_cmd(&mut self, mut cmd: Command, callback: Option<CmdCallback>) {
        if !self.cfg.can_send() {
            debug!(line = %cmd.to_line(), "sending disabled, command dropped");
            if let Some(cb) = callback {
                cb(None);
            }
            return;
        }
        if let Some(gwy_id) = self.hgi_id {
            cmd.readdress(gwy_id);
        }
        self.engine.submit(cmd, callback);
    }

    /// Fetch the schedule of one zone; concurrent fetches for the same zone
    /// serialise behind each other.
    pub fn get_schedule(&mut self, ctl: DeviceId, zone_idx: u8, callback: ScheduleCallback) {
        let key = (ctl, zone_idx);
        if self.schedule_fetchers.contains_key(&key) {
            self.schedule_waiting
                .entry(key)
                .or_insert_with(VecDeque::new)
                .push_back(callback);
            return;
        }
        let (fetcher, cmd) = ScheduleFetcher::start(ctl, zone_idx, callback, Instant::now());
        self.schedule_fetchers.insert(key, fetcher);
        self.submit_cmd(cmd, None);
    }

    /// Upload the schedule of one zone; the callback fires when the last
    /// fragment's write completes.
    pub fn set_schedule(
        &mut self,
        ctl: DeviceId,
        zone_idx: u8,
        data: &[u8],
        callback: Option<CmdCallback>,
    ) {
        let mut cmds = push_schedule_cmds(ctl, zone_idx, data);
        let last = cmds.pop();
        for cmd in cmds {
            self.submit_cmd(cmd, None);
        }
        if let Some(cmd) = last {
            self.submit_cmd(cmd, callback);
        }
    }

    pub fn get_fault_log(&mut self, ctl: DeviceId, callback: FaultLogCallback) {
        if self.fault_fetchers.contains_key(&ctl) {
            callback(Err(RamsesError::ExpiredCallback(
                "a fault log fetch is already running".to_string(),
            )));
            return;
        }
        let (fetcher, cmd) = FaultLogFetcher::start(ctl, callback, Instant::now());
        self.fault_fetchers.insert(ctl, fetcher);
        self.submit_cmd(cmd, None);
    }

    /// Offer a capability for pairing.
    pub fn start_binding_offer(
        &mut self,
        dev: DeviceId,
        code: Code,
        idx: u8,
        callback: BindCallback,
    ) -> Result<(), RamsesError> {
        let (bind, cmd) = BindRequest::start(dev, code, idx, callback, Instant::now())?;
        self.bind_requests.push(bind);
        self.submit_cmd(cmd, None);
        Ok(())
    }

    /// Wait for a pairing offer.
    pub fn start_binding_wait(
        &mut self,
        dev: DeviceId,
        code: Code,
        idx: u8,
        callback: BindCallback,
    ) -> Result<(), RamsesError> {
        let wait = BindWait::start(dev, code, idx, callback, Instant::now())?;
        self.bind_waits.push(wait);
        Ok(())
    }

    pub fn system_by_id(&self, ctl: DeviceId) -> Option<&System> {
        self.systems.get(&ctl)
    }

    pub fn device_by_id(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// Periodic housekeeping: engine deadlines, the write slot, fetch and
    /// binding expiry, discovery.
    fn pump(&mut self, now: Instant) -> Result<(), RamsesError> {
        self.engine.handle_timeout(now);

        self.pump_fetchers(now);
        self.pump_bindings(now);
        self.pump_discovery(now);

        if self.cfg.can_send() {
            if let Some(line) = self.engine.poll_send(now) {
                self.sink.write_line(&line)?;
            }
        }

        self.listeners
            .retain(|l| l.deadline.map_or(true, |d| now < d));

        Ok(())
    }

    fn pump_fetchers(&mut self, now: Instant) {
        for fetcher in self.schedule_fetchers.values_mut() {
            fetcher.check_deadline(now);
        }
        let finished: Vec<(DeviceId, u8)> = self
            .schedule_fetchers
            .iter()
            .filter(|(_, f)| f.is_finished())
            .map(|(k, _)| *k)
            .collect();
        for key in finished {
            self.schedule_fetchers.remove(&key);
            let next = self
                .schedule_waiting
                .get_mut(&key)
                .and_then(|q| q.pop_front());
            if let Some(callback) = next {
                let (fetcher, cmd) =
                    ScheduleFetcher::start(key.0, key.1, callback, now);
                self.schedule_fetchers.insert(key, fetcher);
                self.submit_cmd(cmd, None);
            }
        }

        for fetcher in self.fault_fetchers.values_mut() {
            fetcher.check_deadline(now);
        }
        self.fault_fetchers.retain(|_, f| !f.is_finished());
    }

    fn pump_bindings(&mut self, now: Instant) {
        for bind in self.bind_requests.iter_mut() {
            bind.check_deadline(now);
        }
        self.bind_requests.retain(|b| !b.is_finished());
        for wait in self.bind_waits.iter_mut() {
            wait.check_deadline(now);
        }
        self.bind_waits.retain(|w| !w.is_finished());
    }

    fn pump_discovery(&mut self, now: Instant) {
        if self.cfg.disable_discovery || !self.cfg.can_send() {
            return;
        }
        let mut cmds = Vec::new();
        let order = self.device_order.clone();
        for id in order {
            let due = match self.devices.get_mut(&id) {
                Some(dev) => dev.due_discovery(now),
                None => continue,
            };
            for kind in due {
                if let Some(dev) = self.devices.get(&id) {
                    cmds.extend(dev.discover(kind));
                }
                if let Some(sys) = self.systems.get(&id) {
                    cmds.extend(sys.discover(kind));
                }
            }
        }
        for cmd in cmds {
            self.submit_cmd(cmd, None);
        }
    }

    /// Consume one serial line: frame, admit, parse, echo-match, dispatch.
    fn on_line(&mut self, line: &str, dtm: DateTime<Utc>) {
        if Packet::is_gateway_chatter(line) {
            debug!(line, "gateway chatter");
            return;
        }

        let pkt = match Packet::from_line(line, dtm) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!(%err, line, "packet dropped");
                return;
            }
        };

        if self.hgi_id.is_none() && pkt.src.class() == DeviceClass::Hgi {
            info!(id = %pkt.src, "gateway address learnt");
            self.hgi_id = Some(pkt.src);
        }

        // The known-device list guards the fabric before any parsing.
        if self.cfg.enforce_known_list
            && pkt.src.class() != DeviceClass::Hgi
            && !self.cfg.known_list.contains(&pkt.src)
        {
            debug!(src = %pkt.src, "unknown device, packet dropped");
            return;
        }

        if let Some(log) = self.pkt_log.as_mut() {
            if let Err(err) = log.append(&pkt) {
                warn!(%err, "packet log write failed");
            }
        }

        let msg = Message::new(pkt);
        self.pkt_db
            .insert((msg.src(), msg.code(), msg.idx()), msg.pkt.clone());

        // The engine sees every frame first: echoes and expected replies
        // complete the in-flight command, then flow downstream like any
        // other traffic. The write path itself never delivers.
        self.engine.handle_msg(&msg, Instant::now());

        if let Err(err) = self.dispatch(&msg) {
            match err {
                err @ RamsesError::CorruptState(_) | err @ RamsesError::MultipleController(_) => {
                    self.fatal = Some(err);
                }
                err => {
                    warn!(%err, src = %msg.src(), "device dispatch failed");
                    if let Some(dev) = self.devices.get_mut(&msg.src()) {
                        dev.set_faulty_until(msg.dtm() + faulty_cool_off());
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, msg: &Message) -> Result<(), RamsesError> {
        let mut i = 0;
        while i < self.listeners.len() {
            if self.listeners[i].matches(msg) {
                (self.listeners[i].callback)(msg);
            }
            i += 1;
        }

        self.feed_fetchers(msg);
        self.feed_bindings(msg);

        self.clients.retain(|c| c.try_send(msg.clone()).is_ok());

        // The gateway's own frames do not enter the fabric.
        if msg.src().class() == DeviceClass::Hgi {
            return Ok(());
        }

        self.dispatch_to_entities(msg)
    }

    fn feed_fetchers(&mut self, msg: &Message) {
        let mut follow_ups = Vec::new();

        if let Payload::ScheduleFragment(frag) = &msg.payload {
            if msg.verb() == Verb::Rp {
                let key = (msg.src(), frag.idx);
                if let Some(fetcher) = self.schedule_fetchers.get_mut(&key) {
                    if let Some(cmd) = fetcher.on_fragment(frag) {
                        follow_ups.push(cmd);
                    }
                }
            }
        }

        if let Payload::FaultLogEntry(entry) = &msg.payload {
            if msg.verb() == Verb::Rp {
                if let Some(fetcher) = self.fault_fetchers.get_mut(&msg.src()) {
                    if let Some(cmd) = fetcher.on_entry(entry, Instant::now()) {
                        follow_ups.push(cmd);
                    }
                }
            }
        }

        for cmd in follow_ups {
            self.submit_cmd(cmd, None);
        }
    }

    fn feed_bindings(&mut self, msg: &Message) {
        if msg.code() != Code::RF_BIND {
            return;
        }
        let mut follow_ups = Vec::new();
        for bind in self.bind_requests.iter_mut() {
            if let Some(cmd) = bind.on_accept(msg) {
                follow_ups.push(cmd);
            }
        }
        for wait in self.bind_waits.iter_mut() {
            if let Some(cmd) = wait.on_msg(msg) {
                follow_ups.push(cmd);
            }
        }
        for cmd in follow_ups {
            self.submit_cmd(cmd, None);
        }
    }

    fn ensure_device(&mut self, id: DeviceId) -> &mut Device {
        if !self.devices.contains_key(&id) {
            self.devices.insert(id, Device::new(id));
            self.device_order.push(id);
        }
        self.devices.get_mut(&id).unwrap()
    }

    fn ensure_system(&mut self, ctl: DeviceId) -> Result<(), RamsesError> {
        if self.systems.contains_key(&ctl) {
            return Ok(());
        }
        if !self.systems.is_empty()
            && !(self.cfg.enforce_known_list && self.cfg.known_list.contains(&ctl))
        {
            let existing = self.systems.keys().next().unwrap();
            return Err(RamsesError::MultipleController(format!(
                "{} joins {}",
                ctl, existing
            )));
        }
        self.ensure_device(ctl).set_ctl(ctl)?;
        self.systems.insert(ctl, System::new(ctl));
        Ok(())
    }

    fn dispatch_to_entities(&mut self, msg: &Message) -> Result<(), RamsesError> {
        let src = msg.src();

        let effects = self.ensure_device(src).handle_msg(msg)?;
        for effect in effects {
            match effect {
                DeviceEffect::PromotedController => self.ensure_system(src)?,
                DeviceEffect::Send(cmd) => self.submit_cmd(cmd, None),
            }
        }

        // Controller traffic flows into its system.
        if self.systems.contains_key(&src) {
            let sys_effects = self.systems.get_mut(&src).unwrap().handle_msg(msg)?;
            for effect in sys_effects {
                match effect {
                    SystemEffect::AssignDevices { idx, role, devices } => {
                        self.assign_members(src, idx, role, &devices)?;
                    }
                }
            }
            return Ok(());
        }

        // A member device naming a zone binds itself there, once.
        if self.cfg.enable_eavesdrop {
            if let Some(idx) = msg.idx() {
                if idx < MAX_ZONES
                    && self.devices[&src].ctl().is_some()
                    && !self.devices[&src].is_controller()
                {
                    self.ensure_device(src).set_parent(Parent::Zone(idx))?;
                }
            }
        }

        // Member traffic the controller's system also wants to see.
        if let Some(ctl) = self.devices[&src].ctl() {
            if matches!(
                msg.code(),
                Code::HEAT_DEMAND | Code::ZONE_TEMP | Code::DHW_TEMP
            ) {
                if let Some(sys) = self.systems.get_mut(&ctl) {
                    sys.handle_msg(msg)?;
                }
            }
        }

        Ok(())
    }

    fn assign_members(
        &mut self,
        ctl: DeviceId,
        idx: u8,
        role: u8,
        members: &[DeviceId],
    ) -> Result<(), RamsesError> {
        for &id in members {
            if self.cfg.enforce_known_list && !self.cfg.known_list.contains(&id) {
                debug!(%id, "unlisted member device skipped");
                continue;
            }
            let parent = match role {
                ROLE_SENSOR | ROLE_ACTUATOR => Parent::Zone(idx),
                ROLE_DHW_SENSOR | ROLE_DHW_VALVE => Parent::Dhw(DOMAIN_DHW),
                ROLE_DHW_VALVE_HTG => Parent::Dhw(DOMAIN_DHW_HTG),
                ROLE_HTG_RELAY => Parent::System(DOMAIN_HTG),
                _ => continue,
            };
            let dev = self.ensure_device(id);
            dev.set_ctl(ctl)?;
            dev.set_parent(parent)?;
        }
        Ok(())
    }

    /// Cancel everything in reverse dependency order, completing callbacks
    /// with null messages.
    fn shutdown(&mut self) {
        for fetcher in self.schedule_fetchers.values_mut() {
            fetcher.cancel();
        }
        self.schedule_fetchers.clear();
        for queue in self.schedule_waiting.values_mut() {
            while let Some(cb) = queue.pop_front() {
                cb(Err(RamsesError::ExpiredCallback("shutdown".to_string())));
            }
        }
        for fetcher in self.fault_fetchers.values_mut() {
            fetcher.cancel();
        }
        self.fault_fetchers.clear();
        for bind in self.bind_requests.iter_mut() {
            bind.cancel();
        }
        self.bind_requests.clear();
        for wait in self.bind_waits.iter_mut() {
            wait.cancel();
        }
        self.bind_waits.clear();

        self.engine.shutdown();

        if let Sink::Serial(serial) = &mut self.sink {
            serial.stop();
        }
        for dispatcher in self.dispatchers.iter_mut() {
            dispatcher.stop();
        }
        for _ in self.rx.try_iter() {}
        self.dispatchers.clear();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn report(&self) {
        if self.cfg.show_schema {
            println!("{}", serde_json::to_string_pretty(&self.schema()).unwrap());
        }
        if self.cfg.show_params {
            println!("{}", serde_json::to_string_pretty(&self.params()).unwrap());
        }
        if self.cfg.show_status {
            println!("{}", serde_json::to_string_pretty(&self.status()).unwrap());
        }
        if self.cfg.show_state {
            println!(
                "{}",
                serde_json::to_string_pretty(&self.get_state()).unwrap()
            );
        }
    }

    /// The installation topology.
    pub fn schema(&self) -> Value {
        let systems: serde_json::Map<String, Value> = self
            .systems
            .iter()
            .map(|(id, sys)| (id.to_string(), sys.schema()))
            .collect();
        let orphans: serde_json::Map<String, Value> = self
            .device_order
            .iter()
            .filter(|id| self.devices[id].ctl().is_none())
            .map(|id| (id.to_string(), self.devices[id].schema()))
            .collect();
        json!({
            "gateway": self.hgi_id.map(|id| id.to_string()),
            "systems": systems,
            "orphans": orphans,
        })
    }

    pub fn params(&self) -> Value {
        let systems: serde_json::Map<String, Value> = self
            .systems
            .iter()
            .map(|(id, sys)| (id.to_string(), sys.params()))
            .collect();
        let devices: serde_json::Map<String, Value> = self
            .device_order
            .iter()
            .map(|id| (id.to_string(), self.devices[id].params()))
            .collect();
        json!({ "systems": systems, "devices": devices })
    }

    pub fn status(&self) -> Value {
        let systems: serde_json::Map<String, Value> = self
            .systems
            .iter()
            .map(|(id, sys)| (id.to_string(), sys.status()))
            .collect();
        let devices: serde_json::Map<String, Value> = self
            .device_order
            .iter()
            .map(|id| (id.to_string(), self.devices[id].status()))
            .collect();
        json!({ "systems": systems, "devices": devices })
    }

    /// The restorable snapshot: topology plus the last packet per
    /// (source, opcode, index).
    pub fn get_state(&self) -> Value {
        let packets: serde_json::Map<String, Value> = self
            .pkt_db
            .values()
            .map(|pkt| {
                (
                    pkt.dtm
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    json!(pkt.to_string()),
                )
            })
            .collect();
        json!({
            "schema": self.schema(),
            "packets": packets,
        })
    }

    /// Replay a snapshot through the parser in timestamp order, transport
    /// bypassed.
    pub fn set_state(&mut self, state: &Value) -> Result<(), RamsesError> {
        let packets = state
            .get("packets")
            .and_then(|p| p.as_object())
            .ok_or_else(|| RamsesError::Config("snapshot has no packets".to_string()))?;

        let mut entries: Vec<(DateTime<Utc>, &str)> = Vec::new();
        for (dtm, line) in packets {
            let dtm = DateTime::parse_from_rfc3339(dtm)
                .map_err(|e| RamsesError::Config(format!("unusable snapshot dtm: {}", e)))?
                .with_timezone(&Utc);
            let line = line
                .as_str()
                .ok_or_else(|| RamsesError::Config("snapshot line is not text".to_string()))?;
            entries.push((dtm, line));
        }
        entries.sort_by_key(|(dtm, _)| *dtm);

        for (dtm, line) in entries {
            match Packet::from_line(line, dtm) {
                Ok(pkt) => {
                    let msg = Message::new(pkt);
                    self.pkt_db
                        .insert((msg.src(), msg.code(), msg.idx()), msg.pkt.clone());
                    if let Err(err) = self.dispatch_to_entities(&msg) {
                        return Err(err);
                    }
                }
                Err(err) => debug!(%err, line, "snapshot line dropped"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 21, 9, 30, 0).unwrap()
    }

    fn test_cfg() -> Config {
        Config::new(Source::Serial {
            port: "/dev/null".to_string(),
        })
    }

    fn gwy() -> (Gateway, super::super::transport::test_support::MemSink) {
        let mut cfg = test_cfg();
        cfg.disable_discovery = true;
        Gateway::new_for_test(cfg)
    }

    #[test]
    fn controller_announce_creates_a_system() {
        let (mut gwy, _sink) = gwy();
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );

        let ctl = DeviceId::from_str("01:145039").unwrap();
        assert!(gwy.system_by_id(ctl).is_some());
        assert_eq!(gwy.system_by_id(ctl).unwrap().zones().count(), 0);
        assert!(gwy.device_by_id(ctl).unwrap().is_controller());
    }

    #[test]
    fn second_controller_is_fatal_without_a_known_list() {
        let (mut gwy, _sink) = gwy();
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );
        gwy.on_line(
            "045  I --- 01:999999 --:------ 01:999999 1F09 003 FF04B5",
            now() + chrono::Duration::seconds(1),
        );
        assert!(matches!(
            gwy.fatal,
            Some(RamsesError::MultipleController(_))
        ));
    }

    #[test]
    fn known_list_admits_two_controllers() {
        let mut cfg = test_cfg();
        cfg.disable_discovery = true;
        cfg.enforce_known_list = true;
        cfg.known_list
            .insert(DeviceId::from_str("01:145039").unwrap());
        cfg.known_list
            .insert(DeviceId::from_str("01:999999").unwrap());
        let (mut gwy, _sink) = Gateway::new_for_test(cfg);

        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );
        gwy.on_line(
            "045  I --- 01:999999 --:------ 01:999999 1F09 003 FF04B5",
            now() + chrono::Duration::seconds(1),
        );
        assert!(gwy.fatal.is_none());
        assert_eq!(gwy.systems.len(), 2);
    }

    #[test]
    fn unknown_devices_are_dropped_before_parsing() {
        let mut cfg = test_cfg();
        cfg.disable_discovery = true;
        cfg.enforce_known_list = true;
        cfg.known_list
            .insert(DeviceId::from_str("01:145039").unwrap());
        let (mut gwy, _sink) = Gateway::new_for_test(cfg);

        gwy.on_line(
            "045  I --- 01:999999 --:------ 01:999999 1F09 003 FF04B5",
            now(),
        );
        assert!(gwy.devices.is_empty());
        assert!(gwy.pkt_db.is_empty());
    }

    #[test]
    fn zone_temp_request_completes_through_echo_and_reply() {
        let (mut gwy, sink) = gwy();
        let ctl = DeviceId::from_str("01:145039").unwrap();

        // The controller is known from its sync broadcast.
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now() - chrono::Duration::seconds(5),
        );

        let seen: Arc<Mutex<Vec<Option<Message>>>> = Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        gwy.submit_cmd(
            Command::get_zone_temp(ctl, 0),
            Some(Box::new(move |msg| cloned.lock().unwrap().push(msg))),
        );

        gwy.pump(Instant::now()).unwrap();
        let written = sink.0.lock().unwrap().clone();
        assert_eq!(written.len(), 1);

        // The echo arrives, then the reply.
        gwy.on_line(&written[0].clone(), now());
        gwy.on_line(
            "045 RP --- 01:145039 18:000730 --:------ 30C9 003 0007D0",
            now() + chrono::Duration::seconds(1),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let reply = seen[0].as_ref().unwrap();
        assert_eq!(reply.code(), Code::ZONE_TEMP);

        // The reply also updated the zone's view.
        let zone_temp = gwy
            .system_by_id(ctl)
            .and_then(|sys| sys.zone(0))
            .and_then(|z| z.temperature());
        assert_eq!(zone_temp, Some(20.0));
    }

    #[test]
    fn gateway_address_is_learnt_from_traffic() {
        let (mut gwy, _sink) = gwy();
        gwy.on_line(
            "RQ --- 18:140805 01:145039 --:------ 30C9 001 00",
            now(),
        );
        assert_eq!(gwy.hgi_id.unwrap().to_string(), "18:140805");
    }

    #[test]
    fn member_assignment_parents_devices_once() {
        let (mut gwy, _sink) = gwy();
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );
        gwy.on_line(
            "045 RP --- 01:145039 18:000730 --:------ 000C 005 00040939FD",
            now() + chrono::Duration::seconds(1),
        );

        let sensor = DeviceId::from_str("02:080381").unwrap();
        let dev = gwy.device_by_id(sensor).unwrap();
        assert_eq!(dev.ctl().unwrap().to_string(), "01:145039");
        assert_eq!(dev.parent(), Some(Parent::Zone(0)));

        // A conflicting assignment is corrupt state.
        gwy.on_line(
            "045 RP --- 01:145039 18:000730 --:------ 000C 005 01040939FD",
            now() + chrono::Duration::seconds(2),
        );
        assert!(matches!(gwy.fatal, Some(RamsesError::CorruptState(_))));
    }

    #[test]
    fn state_roundtrip_restores_the_fabric() {
        let (mut gwy, _sink) = gwy();
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 30C9 003 0007D0",
            now() + chrono::Duration::seconds(1),
        );
        let state = gwy.get_state();
        assert_eq!(state["packets"].as_object().unwrap().len(), 2);

        let (mut restored, _sink) = self::gwy();
        restored.set_state(&state).unwrap();
        let ctl = DeviceId::from_str("01:145039").unwrap();
        assert!(restored.system_by_id(ctl).is_some());
        assert_eq!(
            restored
                .system_by_id(ctl)
                .and_then(|sys| sys.zone(0))
                .and_then(|z| z.temperature()),
            Some(20.0)
        );
    }

    #[test]
    fn listeners_match_typed_filters() {
        let (mut gwy, _sink) = gwy();
        let hits: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let cloned = hits.clone();
        gwy.add_listener(
            Some(Verb::I),
            Some(Code::SYSTEM_SYNC),
            None,
            None,
            None,
            move |_msg| {
                *cloned.lock().unwrap() += 1;
            },
        );

        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 1F09 003 FF04B5",
            now(),
        );
        gwy.on_line(
            "045  I --- 01:145039 --:------ 01:145039 30C9 003 0007D0",
            now() + chrono::Duration::seconds(1),
        );
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn schedule_fetch_round_trip() {
        let (mut gwy, sink) = gwy();
        let ctl = DeviceId::from_str("01:145039").unwrap();

        let seen: Arc<Mutex<Vec<Result<super::super::fetch::Schedule, String>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let cloned = seen.clone();
        gwy.get_schedule(
            ctl,
            1,
            Box::new(move |res| {
                cloned.lock().unwrap().push(res.map_err(|e| e.to_string()))
            }),
        );
        gwy.pump(Instant::now()).unwrap();
        assert!(sink.0.lock().unwrap()[0].contains("0404"));

        gwy.on_line(
            "045 RP --- 01:145039 18:000730 --:------ 0404 008 012000020102AABB",
            now(),
        );
        // The follow-up for fragment 2 is queued; let it out and answer.
        gwy.pump(Instant::now() + Duration::from_millis(50)).unwrap();
        gwy.on_line(
            "045 RP --- 01:145039 18:000730 --:------ 0404 008 012000020202CCDD",
            now() + chrono::Duration::seconds(1),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let schedule = seen[0].as_ref().unwrap();
        assert_eq!(schedule.data, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    }
}
