// shacklink test application -- connects to an Icom networked
// transceiver (IC-705 class), keeps the link up, and prints radio
// events as they arrive. Stands in for the status dashboard and serial
// bridge collaborators while exercising the protocol engine end to end.
//
// Usage:
//   shacklink-test-app --address ic-705.local --username kilo --password secret
//   shacklink-test-app --address 192.168.1.30 -u kilo -p secret --set-data-tx
//   shacklink-test-app --address 192.168.1.30 -u kilo -p secret --debug-packets -v

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use shacklink::{Config, RadioEvent};

/// shacklink test application -- network remote control for Icom rigs.
#[derive(Parser)]
#[command(name = "shacklink-test-app", version, about)]
struct Cli {
    /// Radio hostname or address.
    #[arg(short = 'a', long, default_value = "IC-705")]
    address: String,

    /// Login username.
    #[arg(short = 'u', long)]
    username: String,

    /// Login password.
    #[arg(short = 'p', long)]
    password: String,

    /// CI-V address of the radio (hex, e.g. 0xa4).
    #[arg(short = 'c', long, default_value = "0xa4")]
    civ_address: String,

    /// CI-V address of this controller (hex, e.g. 0xe0).
    #[arg(short = 'z', long, default_value = "0xe0")]
    controller_address: String,

    /// Expose the radio's serial stream on this TCP port.
    #[arg(short = 't', long, default_value_t = 4531)]
    serial_tcp_port: u16,

    /// Also expose the serial stream as a local pseudo-terminal.
    #[arg(short = 's', long)]
    enable_serial_device: bool,

    /// TCP port for the external rigctld subprocess.
    #[arg(short = 'r', long, default_value_t = 4532)]
    rigctld_port: u16,

    /// Status refresh interval in milliseconds.
    #[arg(short = 'i', long, default_value_t = 150)]
    log_interval: u64,

    /// Automatically enable data mode on TX.
    #[arg(short = 'd', long)]
    set_data_tx: bool,

    /// Show CI-V packets for debugging.
    #[arg(short = 'D', long)]
    debug_packets: bool,

    /// Enable verbose (debug) logging.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn parse_civ_addr(s: &str) -> Result<u8> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(trimmed, 16).with_context(|| format!("invalid CI-V address '{s}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if cli.verbose {
                    "shacklink=debug,shacklink_proto=debug,shacklink_civ=debug".into()
                } else {
                    "shacklink=info".into()
                }
            }),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config {
        host: cli.address,
        username: cli.username,
        password: cli.password,
        civ_address: parse_civ_addr(&cli.civ_address)?,
        controller_address: parse_civ_addr(&cli.controller_address)?,
        serial_tcp_port: cli.serial_tcp_port,
        enable_serial_device: cli.enable_serial_device,
        rigctld_port: cli.rigctld_port,
        log_interval: Duration::from_millis(cli.log_interval),
        set_data_mode_on_tx: cli.set_data_tx,
        debug_packets: cli.debug_packets,
        ..Config::default()
    };

    let (events_tx, mut events) = tokio::sync::broadcast::channel(256);
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("(missed {n} events)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let result = shacklink::run(config, events_tx)
        .await
        .context("radio link failed");
    printer.abort();
    result
}

fn print_event(event: &RadioEvent) {
    match event {
        RadioEvent::FrequencyChanged { freq_hz } => {
            println!("freq     {:.6} MHz", *freq_hz as f64 / 1_000_000.0);
        }
        RadioEvent::SubFrequencyChanged { freq_hz } => {
            println!("sub freq {:.6} MHz", *freq_hz as f64 / 1_000_000.0);
        }
        RadioEvent::ModeChanged { mode, data, filter } => {
            let data = if *data { "-D" } else { "" };
            println!("mode     {mode}{data} {filter}");
        }
        RadioEvent::SubModeChanged { mode, data, filter } => {
            let data = if *data { "-D" } else { "" };
            println!("sub mode {mode}{data} {filter}");
        }
        RadioEvent::PttChanged { ptt, tune } => {
            let state = match (ptt, tune) {
                (true, _) => "TX",
                (_, true) => "TUNE",
                _ => "RX",
            };
            println!("ptt      {state}");
        }
        RadioEvent::SplitChanged(split) => println!("split    {split}"),
        RadioEvent::TuningStepChanged { step_hz } => println!("step     {step_hz} Hz"),
        RadioEvent::SMeter { label, .. } => println!("s-meter  {label}"),
        RadioEvent::Swr { swr } => println!("swr      {swr:.1}:1"),
        RadioEvent::Vd { volts } => println!("vd       {volts:.1} V"),
        RadioEvent::Ovf(on) => println!("ovf      {}", if *on { "OVF" } else { "ok" }),
        RadioEvent::PowerChanged(v) => println!("power    {v}"),
        RadioEvent::RfGainChanged(v) => println!("rf gain  {v}"),
        RadioEvent::SquelchChanged(v) => println!("squelch  {v}"),
        RadioEvent::NrChanged { enabled, level } => {
            println!("nr       {} {level}", if *enabled { "on" } else { "off" });
        }
        RadioEvent::PreampChanged(v) => println!("preamp   {v}"),
        RadioEvent::AgcChanged(agc) => println!("agc      {agc}"),
        RadioEvent::Status { battery, .. } => println!("battery  {battery}"),
        RadioEvent::Connected => println!("connected"),
        RadioEvent::Disconnected => println!("disconnected"),
        RadioEvent::Reconnecting { attempt } => println!("reconnecting (attempt {attempt})"),
    }
}
