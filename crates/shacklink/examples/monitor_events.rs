//! Monitor real-time radio events.
//!
//! Demonstrates subscribing to the event stream and printing events as
//! they arrive: frequency changes, mode changes, PTT transitions,
//! meter readings, and connection status. Useful for building
//! real-time displays or debugging the link.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p shacklink --example monitor_events -- <host> <user> <password>
//! ```

use std::time::Duration;

use shacklink::{Config, RadioClient, RadioEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = Config {
        host: args.next().unwrap_or_else(|| "IC-705".into()),
        username: args.next().unwrap_or_default(),
        password: args.next().unwrap_or_default(),
        ..Config::default()
    };

    println!("Connecting to {}...", config.host);
    let client = RadioClient::connect(config).await?;
    println!("Connected: {}\n", client.radio_name());

    let mut events = client.subscribe();
    println!("Monitoring for 60 seconds...");
    println!("(Turn the VFO knob, change modes, or key PTT to generate events)\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let stamp = format!("{:>4}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());
                match event {
                    RadioEvent::FrequencyChanged { freq_hz } => {
                        println!("{stamp} frequency  {:.3} MHz", freq_hz as f64 / 1e6);
                    }
                    RadioEvent::ModeChanged { mode, data, filter } => {
                        let d = if data { "-D" } else { "" };
                        println!("{stamp} mode       {mode}{d} {filter}");
                    }
                    RadioEvent::PttChanged { ptt, tune } => {
                        let state = if ptt {
                            "TX"
                        } else if tune {
                            "TUNE"
                        } else {
                            "RX"
                        };
                        println!("{stamp} ptt        {state}");
                    }
                    RadioEvent::SMeter { label, .. } => {
                        println!("{stamp} s-meter    {label}");
                    }
                    RadioEvent::Swr { swr } => {
                        println!("{stamp} swr        {swr:.1}:1");
                    }
                    RadioEvent::Disconnected => {
                        println!("{stamp} disconnected");
                        break;
                    }
                    other => {
                        println!("{stamp} {other:?}");
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {n} events due to lag)");
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
            Err(_) => break, // monitoring period elapsed
        }
    }

    println!("\nMonitoring complete.");
    client.shutdown().await;
    Ok(())
}
