//! SMOV Speed Control Tool
//!
//! Connects to a motor controller, then sends a speed command once a second
//! until the controller stops accepting them or reports a failure.
//!
//! Usage:
//!   cargo run --example speed_control -- [OPTIONS] [PORT]
//!
//! Options:
//!   --speed VALUE     Speed to send (default: 120)
//!   --count N         Stop after N accepted commands (default: run until failure)
//!   --interval MS     Pause between commands in ms (default: 1000)
//!   --no-settle       Skip the boot delay after opening the port
//!
//! Without PORT the first discovered device is used. Set RUST_LOG=smov_core=debug
//! to see the protocol traffic.

use anyhow::{bail, Context, Result};
use smov_core::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        eprintln!("fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut port = None;
    let mut speed = 120i16;
    let mut count = None;
    let mut interval_ms = 1000u64;
    let mut config = ConnectionConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--speed" | "-s" => {
                i += 1;
                speed = args.get(i).context("--speed needs a value")?.parse()?;
            }
            "--count" | "-n" => {
                i += 1;
                count = Some(args.get(i).context("--count needs a value")?.parse::<u32>()?);
            }
            "--interval" | "-i" => {
                i += 1;
                interval_ms = args.get(i).context("--interval needs a value")?.parse()?;
            }
            "--no-settle" => {
                config.settle_delay_ms = 0;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            arg if !arg.starts_with('-') => {
                port = Some(DevicePath::from(arg));
            }
            other => {
                eprintln!("Unknown option: {}", other);
            }
        }
        i += 1;
    }

    let port = match port {
        Some(p) => p,
        None => {
            let devices = list_devices();
            for d in &devices {
                println!("found device {}", d);
            }
            match devices.into_iter().next() {
                Some(d) => d,
                None => bail!("No devices could be found, try plugging one in"),
            }
        }
    };

    println!("Connecting to {}...", port);
    let (sender, faults) = match connect(&port, &config) {
        Ok(handles) => handles,
        Err(e) => bail!(explain(e.kind())),
    };
    println!(
        "Connected, protocol version {}, speed range {}..={}",
        faults.version(),
        sender.limits().min,
        sender.limits().max
    );

    let interval = Duration::from_millis(interval_ms);
    let mut sent = 0u32;
    while count.map_or(true, |n| sent < n) {
        if !sender.submit_speed(speed) {
            // Busy or refused: either way a real failure shows up on the fault handle
            if !faults.current_error().is_ok() || !sender.is_connected() {
                break;
            }
            if !sender.limits().contains(speed) {
                println!("speed {} is outside the device range", speed);
                break;
            }
            std::thread::sleep(interval / 10);
            continue;
        }
        sent += 1;
        println!("speed {} sent ({})", speed, sent);
        std::thread::sleep(interval);
    }

    let err = faults.current_error();
    let (tx_bytes, rx_bytes, tx_packets, rx_packets) = faults.counters();
    println!(
        "tx {} bytes / {} packets, rx {} bytes / {} packets, {} rejected",
        tx_bytes,
        tx_packets,
        rx_bytes,
        rx_packets,
        faults.rejected_commands()
    );
    sender.teardown();

    if !err.is_ok() {
        bail!(explain(err));
    }
    Ok(())
}

/// Human-readable failure with the detail each kind carries
fn explain(err: ErrorKind) -> String {
    match err {
        ErrorKind::CommunicationFailure(code) => format!(
            "{}\n  => {}",
            err.describe(),
            std::io::Error::from_raw_os_error(code)
        ),
        ErrorKind::UnsupportedVersion(version) => {
            format!("{}\n  => version was {}", err.describe(), version)
        }
        ErrorKind::DeviceFault(code) => format!("{}\n  => code {:#06x}", err.describe(), code),
        ErrorKind::Ok => err.describe().to_string(),
    }
}

fn print_help() {
    println!("SMOV Speed Control Tool");
    println!();
    println!("Usage: speed_control [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  -s, --speed VALUE     Speed to send (default: 120)");
    println!("  -n, --count N         Stop after N accepted commands");
    println!("  -i, --interval MS     Pause between commands in ms (default: 1000)");
    println!("      --no-settle       Skip the boot delay after opening the port");
    println!("  -h, --help            Show this help");
}
