mod config;
mod host;
mod logging;
mod probe;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, Overrides};
use host::{Host, HostOptions};
use probe::{ProbeParams, ProbeRsPort};
use rtt_relay::{Bridge, MemoryAccessPort, Rtt};
use signal_hook::consts::signal;
use std::io::prelude::*;
use std::io::{stdin, stdout};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::level_filters::LevelFilter;

#[derive(Debug, PartialEq, Eq, Clone)]
enum ProbeInfo {
    Number(usize),
    List,
}

impl std::str::FromStr for ProbeInfo {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<ProbeInfo, &'static str> {
        if s == "list" {
            Ok(ProbeInfo::List)
        } else if let Ok(n) = s.parse::<usize>() {
            Ok(ProbeInfo::Number(n))
        } else {
            Err("Invalid probe number.")
        }
    }
}

fn parse_u64(input: &str) -> Result<u64, std::num::ParseIntError> {
    parse_int::parse(input)
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "rtthost",
    about = "RTT console for microcontrollers, optionally relaying a channel to SEGGER SystemView over TCP.",
    version
)]
struct Opts {
    #[clap(long, help = "Config file (toml, json or yaml). Defaults to .rtthost.* in the working directory.")]
    config: Option<PathBuf>,

    #[clap(short, long, help = "Specify probe number or 'list' to list probes.")]
    probe: Option<ProbeInfo>,

    #[clap(short, long, help = "Target chip type. Leave unspecified to auto-detect.")]
    chip: Option<String>,

    #[clap(short, long, help = "List RTT channels and exit.")]
    list: bool,

    #[clap(long, value_parser = parse_u64, help = "Start of the RAM scanned for the control block.")]
    ram_start: Option<u64>,

    #[clap(long, help = "Size of the RAM scanned for the control block, in KiB.")]
    ram_size: Option<usize>,

    #[clap(long, help = "Channel used for the console.")]
    console: Option<usize>,

    #[clap(short, long, help = "Relay a channel to SystemView over TCP.")]
    bridge: bool,

    #[clap(long, help = "Channel relayed by the bridge.")]
    bridge_channel: Option<usize>,

    #[clap(long, help = "TCP port of the bridge.")]
    bridge_port: Option<u16>,

    #[clap(long, help = "Log the duration of every poll cycle.")]
    cycle_time: bool,

    #[clap(long, help = "Log level (off, error, warn, info, debug, trace). Falls back to RUST_LOG, then WARN.")]
    log_level: Option<LevelFilter>,

    #[clap(long, help = "Write a JSON log to this file.")]
    log_file: Option<PathBuf>,
}

fn main() {
    std::process::exit(match run(Opts::parse()) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:?}");
            1
        }
    });
}

fn run(opts: Opts) -> Result<()> {
    let probe = match opts.probe {
        Some(ProbeInfo::List) => {
            probe::list_probes(stdout(), &probe::available_probes());
            return Ok(());
        }
        Some(ProbeInfo::Number(n)) => Some(n),
        None => None,
    };

    let config = Config::load(
        opts.config.as_deref(),
        Overrides {
            probe,
            chip: opts.chip,
            ram_start: opts.ram_start,
            ram_size_kib: opts.ram_size,
            console_channel: opts.console,
            bridge: opts.bridge,
            bridge_channel: opts.bridge_channel,
            bridge_port: opts.bridge_port,
            show_cycle_time: opts.cycle_time,
            log_level: opts.log_level,
            log_file: opts.log_file,
        },
    )?;

    let _log_guard = logging::setup_logging(config.log_file.as_deref(), config.log_level)?;
    tracing::debug!("{config:#?}");

    let mut port = ProbeRsPort::open(&ProbeParams {
        probe: config.probe,
        chip: config.chip.clone(),
        idcode_address: config.idcode_address,
    })
    .context("Error opening the target")?;

    let id_code = port.identify().context("Error reading the device ID")?;
    tracing::info!("Device ID: {id_code:#010x}");

    eprintln!("Attaching to RTT...");

    let mut rtt = Rtt::locate(&mut port, &config.scan).context("Error attaching to RTT")?;
    eprintln!("Found control block at {:#010x}", rtt.ptr());

    let channels = rtt.describe(&mut port)?;
    if opts.list {
        for channel in channels {
            println!("  {channel}");
        }
        return Ok(());
    }

    if let Ok((up, down)) = rtt.buffer_sizes(config.console_channel) {
        tracing::info!("Console buffers: up {up} bytes, down {down} bytes");
    }

    let exit = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal::SIGINT, exit.clone())?;

    let bridge = if config.bridge.enabled {
        let bridge = Bridge::spawn(config.bridge.server.clone(), exit.clone())
            .context("Error starting the bridge")?;
        eprintln!(
            "Relaying channel {} on {}",
            config.bridge.channel,
            bridge.local_addr()
        );
        Some(bridge)
    } else {
        None
    };

    let stdin = stdin_channel();

    let mut host = Host::new(
        rtt,
        stdout(),
        HostOptions {
            console_channel: config.console_channel,
            bridge_channel: config.bridge.enabled.then_some(config.bridge.channel),
            read: config.read.clone(),
            push_mode: config.push_mode,
            show_cycle_time: config.show_cycle_time,
        },
    );

    let result = host.run(&mut port, &exit, Some(&stdin), bridge.as_ref());
    if let Err(err) = &result {
        tracing::error!("Stopping: {err:#}");
    }

    exit.store(true, Ordering::Relaxed);
    if let Some(bridge) = bridge {
        bridge.join()?;
    }
    port.close()?;

    result
}

/// Reads stdin on its own thread. The channel is bounded, so the thread blocks while the target
/// does not consume the console input.
fn stdin_channel() -> Receiver<Vec<u8>> {
    let (tx, rx) = sync_channel(16);

    thread::spawn(move || {
        let mut buf = [0u8; 1024];

        loop {
            match stdin().read(&mut buf[..]) {
                // End of input
                Ok(0) => break,
                Ok(count) => {
                    if tx.send(buf[..count].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!("Error reading from stdin, input disabled: {err}");
                    break;
                }
            }
        }
    });

    rx
}
