// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Small bus monitor: connects to a bus, flips the service into monitor mode
//! and prints every message it sees.

use std::sync::Arc;

use clap::Parser;

use ipc_service::{BusAddress, IpcService, MonitorEvent, MonitorEventType};

#[derive(Parser)]
#[command(about = "Print all traffic visible on a message bus")]
struct Args {
    /// Bus to monitor: "session", "system", or a "unix:path=..." address.
    #[arg(short, long, default_value = "session")]
    bus: String,

    /// Service name to claim for the monitoring connection.
    #[arg(short, long, default_value = "busmon.probe")]
    service_name: String,

    /// Optional match rules to restrict the captured traffic.
    rules: Vec<String>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    let address: BusAddress = match args.bus.parse() {
        Ok(address) => address,
        Err(e) => {
            eprintln!("bad bus selector: {e}");
            std::process::exit(1);
        }
    };

    let service = match IpcService::new(&address, &args.service_name, -1) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("failed to connect to the bus: {e}");
            std::process::exit(1);
        }
    };

    service.start();

    let result = service.enable_monitor(
        &args.rules,
        Arc::new(|event: MonitorEvent| {
            let kind = match event.event_type {
                MonitorEventType::MethodCall => "call",
                MonitorEventType::MethodReturn => "return",
                MonitorEventType::Signal => "signal",
                MonitorEventType::Error => "error",
            };

            println!(
                "{kind:>6} serial={} {} -> {} {} {}.{} {:?}",
                event.serial,
                pretty(&event.sender),
                pretty(&event.destination),
                pretty(&event.path),
                pretty(&event.interface),
                pretty(&event.member),
                event.args,
            );
        }),
    );
    if let Err(e) = result {
        eprintln!("failed to enable monitor mode: {e}");
        std::process::exit(1);
    }

    println!("monitoring {address}, press Ctrl-C to stop");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn pretty(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}
