// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Serial transport, packet-log replay and the packet-log writer.
//!
//! A reader thread frames the byte stream at `\r\n` and posts each line to
//! the runtime's event channel; the write side is funneled through the
//! transmit engine's single in-flight discipline.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use ramses_protocols::{command::Command, message::Message, packet::Packet};

use super::error::RamsesError;

/// What the reader threads and the public API post to the run loop.
pub enum Event {
    /// One framed serial line with its receive time.
    Line(String, DateTime<Utc>),
    /// A command submitted from outside the loop.
    Command(Command, Option<CmdCallback>),
    /// Periodic housekeeping.
    Tick,
    Shutdown,
    /// The replay source is exhausted, or the adaptor vanished.
    Eof,
}

/// Completion callback of a command: the completing message, or `None` when
/// retries were exhausted or the gateway shut down.
pub type CmdCallback = Box<dyn FnOnce(Option<Message>) + Send>;

/// The write half handed to the transmit engine.
pub trait LineSink: Send {
    fn write_line(&mut self, line: &str) -> Result<(), RamsesError>;
}

/// A sink for replay and read-only modes; writes are rejected.
pub struct NullSink;

impl LineSink for NullSink {
    fn write_line(&mut self, line: &str) -> Result<(), RamsesError> {
        debug!(line, "write suppressed");
        Ok(())
    }
}

const BAUD_RATE: u32 = 115_200;
const OPEN_ATTEMPTS: u32 = 3;
const READ_TIMEOUT: Duration = Duration::from_millis(250);

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    running: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open the adaptor 115200-8-N-1, retrying with a linear backoff. The
    /// optional evofw flag octet is written verbatim once open.
    pub fn open(path: &str, evofw_flag: Option<u8>) -> Result<SerialTransport, RamsesError> {
        let mut last_err = None;
        for attempt in 1..=OPEN_ATTEMPTS {
            match serialport::new(path, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .timeout(READ_TIMEOUT)
                .open()
            {
                Ok(mut port) => {
                    if let Some(flag) = evofw_flag {
                        port.write_all(&[flag]).map_err(RamsesError::Io)?;
                    }
                    return Ok(SerialTransport {
                        port,
                        running: Arc::new(AtomicBool::new(true)),
                    });
                }
                Err(err) => {
                    warn!(%err, attempt, "failed to open {}", path);
                    last_err = Some(err);
                    thread::sleep(Duration::from_millis(500 * attempt as u64));
                }
            }
        }
        Err(RamsesError::Config(format!(
            "cannot open {}: {}",
            path,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Launch the reader thread. Each `\r\n`-terminated line becomes an
    /// [`Event::Line`]; a vanished adaptor posts [`Event::Eof`].
    pub fn start_reader(&self, tx: SyncSender<Event>) -> Result<thread::JoinHandle<()>, RamsesError> {
        let mut port = self.port.try_clone().map_err(|e| {
            RamsesError::Config(format!("cannot clone port handle: {}", e))
        })?;
        let running = self.running.clone();

        let th = thread::spawn(move || {
            let mut pending: Vec<u8> = Vec::new();
            let mut buf = [0u8; 256];
            while running.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                            let mut line: Vec<u8> = pending.drain(..=pos).collect();
                            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                                line.pop();
                            }
                            let line = String::from_utf8_lossy(&line).into_owned();
                            if tx.send(Event::Line(line, Utc::now())).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        warn!(%err, "serial read failed");
                        let _ = tx.send(Event::Eof);
                        return;
                    }
                }
            }
        });
        Ok(th)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl LineSink for SerialTransport {
    fn write_line(&mut self, line: &str) -> Result<(), RamsesError> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\r\n")?;
        self.port.flush()?;
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replay a packet log: every line is posted in order, carrying its recorded
/// timestamp; the write side stays disabled.
pub fn start_replay<P: AsRef<Path>>(
    path: P,
    tx: SyncSender<Event>,
) -> Result<thread::JoinHandle<()>, RamsesError> {
    let file = File::open(path.as_ref())?;

    let th = thread::spawn(move || {
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if tx.send(Event::Line(line, Utc::now())).is_err() {
                return;
            }
        }
        let _ = tx.send(Event::Eof);
    });
    Ok(th)
}

/// Append-only packet log: `ISO8601 <canonical line>` per accepted packet.
pub struct PacketLog {
    file: File,
}

impl PacketLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<PacketLog, RamsesError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(PacketLog { file })
    }

    pub fn append(&mut self, pkt: &Packet) -> Result<(), RamsesError> {
        writeln!(
            self.file,
            "{} {}",
            pkt.dtm.to_rfc3339_opts(SecondsFormat::Millis, true),
            pkt
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records written lines for inspection.
    #[derive(Clone, Default)]
    pub struct MemSink(pub Arc<Mutex<Vec<String>>>);

    impl LineSink for MemSink {
        fn write_line(&mut self, line: &str) -> Result<(), RamsesError> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }
}
