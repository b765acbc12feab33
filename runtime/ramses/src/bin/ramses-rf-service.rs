// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use ramses_protocols::addr::DeviceId;
use ramses_runtime::gateway::{Config, Gateway, Source};
use runtime_core::{cmdline::ServiceCmd, LogLevel};

#[derive(Parser)]
#[clap(name = "ramses-rf-service")]
struct Arguments {
    #[clap(subcommand)]
    op: Operation,

    /// The level to debug runtime, disabled as a default.
    #[clap(long, short, value_enum, global = true)]
    log_level: Option<LogLevel>,

    /// Once skips discovery, twice also disables sending.
    #[clap(long, short = 'r', global = true, parse(from_occurrences))]
    reduce_processing: u64,

    /// Append every accepted packet to this file.
    #[clap(long, global = true)]
    packet_log: Option<PathBuf>,

    /// JSON configuration carrying the known-device list.
    #[clap(long, short = 'c', global = true)]
    config_file: Option<PathBuf>,

    /// Restore this state snapshot before listening.
    #[clap(long, short = 'k', global = true)]
    client_state: Option<PathBuf>,

    /// Print the installation topology on exit.
    #[clap(long, global = true)]
    show_schema: bool,

    /// Print the configurable attributes on exit.
    #[clap(long, global = true)]
    show_params: bool,

    /// Print the state attributes on exit.
    #[clap(long, global = true)]
    show_status: bool,

    /// Print the restorable state snapshot on exit.
    #[clap(long, global = true)]
    show_state: bool,
}

#[derive(Subcommand)]
enum Operation {
    /// Rebuild the model from a packet log; nothing is transmitted.
    Parse {
        input_file: PathBuf,
    },
    /// Attach to the adaptor, discover and track the installation.
    Monitor {
        serial_port: String,

        /// e.g. 'RQ 01:123456 1F09 00'
        #[clap(long, short = 'x')]
        exec_cmd: Option<String>,
    },
    /// Attach to the adaptor receive-only.
    Listen {
        serial_port: String,
    },
    /// Run one-shot scripts against the installation, then exit.
    Execute {
        serial_port: String,

        /// e.g. 'RQ 01:123456 1F09 00'
        #[clap(long, short = 'x')]
        exec_cmd: Option<String>,

        /// Walk the fault log of this controller.
        #[clap(long, value_name = "CTL")]
        get_faults: Option<String>,

        /// Fetch the schedule of one zone.
        #[clap(long, number_of_values = 2, value_names = &["CTL", "ZONE"])]
        get_schedule: Option<Vec<String>>,
    },
}

/// The optional JSON configuration file.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    known_list: Vec<String>,
    #[serde(default)]
    enforce_known_list: bool,
    #[serde(default)]
    enable_eavesdrop: bool,
    evofw_flag: Option<u8>,
    duty_cycle: Option<f64>,
}

fn bail(msg: String) -> ! {
    eprintln!("{}", msg);
    std::process::exit(libc::EXIT_FAILURE)
}

fn parse_dev_id(s: &str) -> DeviceId {
    DeviceId::from_str(s).unwrap_or_else(|err| bail(format!("{}", err)))
}

struct RamsesServiceCmd;

impl ServiceCmd<Arguments, Config, Gateway> for RamsesServiceCmd {
    fn params(args: &Arguments) -> (Config, Option<LogLevel>) {
        let source = match &args.op {
            Operation::Parse { input_file } => Source::Replay {
                path: input_file.clone(),
            },
            Operation::Monitor { serial_port, .. } | Operation::Execute { serial_port, .. } => {
                Source::Serial {
                    port: serial_port.clone(),
                }
            }
            Operation::Listen { serial_port } => Source::SerialListen {
                port: serial_port.clone(),
            },
        };

        let mut cfg = Config::new(source);
        cfg.packet_log = args.packet_log.clone();
        cfg.restore_state = args.client_state.clone();
        cfg.show_schema = args.show_schema;
        cfg.show_params = args.show_params;
        cfg.show_status = args.show_status;
        cfg.show_state = args.show_state;
        cfg.disable_discovery = args.reduce_processing >= 1;
        cfg.disable_sending = args.reduce_processing >= 2;

        if let Some(path) = &args.config_file {
            let text = std::fs::read_to_string(path)
                .unwrap_or_else(|err| bail(format!("cannot read {}: {}", path.display(), err)));
            let file: ConfigFile = serde_json::from_str(&text)
                .unwrap_or_else(|err| bail(format!("unusable {}: {}", path.display(), err)));

            cfg.known_list = file
                .known_list
                .iter()
                .map(|s| parse_dev_id(s))
                .collect::<HashSet<_>>();
            cfg.enforce_known_list = file.enforce_known_list;
            cfg.enable_eavesdrop = file.enable_eavesdrop;
            cfg.evofw_flag = file.evofw_flag;
            if let Some(duty_cycle) = file.duty_cycle {
                cfg.duty_cycle = duty_cycle;
            }
        }

        match &args.op {
            Operation::Monitor { exec_cmd, .. } => {
                cfg.exec_cmds.extend(exec_cmd.iter().cloned());
            }
            Operation::Execute {
                exec_cmd,
                get_faults,
                get_schedule,
                ..
            } => {
                cfg.oneshot = true;
                cfg.disable_discovery = true;
                cfg.exec_cmds.extend(exec_cmd.iter().cloned());
                cfg.get_faults = get_faults.as_deref().map(parse_dev_id);
                cfg.get_schedule = get_schedule.as_ref().map(|pair| {
                    let ctl = parse_dev_id(&pair[0]);
                    let zone_idx = u8::from_str_radix(&pair[1], 16)
                        .unwrap_or_else(|_| bail(format!("unusable zone index: {}", pair[1])));
                    (ctl, zone_idx)
                });
            }
            _ => {}
        }

        (cfg, args.log_level)
    }
}

fn main() {
    RamsesServiceCmd::run()
}
