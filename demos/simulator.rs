//! MicroPulse hardware simulator
//!
//! Serves the instrument protocol on a local port so the driver and the
//! stand-alone demo can run without hardware.
//!
//! # Usage
//!
//! ```bash
//! # 8-bit, 100 samples x 5 A-scans on 127.0.0.1:1067
//! cargo run --example simulator
//!
//! # 16-bit roller probe geometry on a custom port
//! cargo run --example simulator 1068 4 2000 61
//!
//! # Then, in another terminal
//! cargo run --example standalone 127.0.0.1:1068 tests/data/roller_probe.mps
//! ```

use peak_micropulse::protocol::SampleMode;
use peak_micropulse::simulator::{PeakSimulator, SimulatorConfig};
use peak_micropulse::Result;
use std::env;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let port = args.first().and_then(|p| p.parse().ok()).unwrap_or(1067);
    let mode = match args.get(1).map(String::as_str) {
        Some(dof) => SampleMode::from_code(dof.parse().unwrap_or(0))?,
        None => SampleMode::EightBit,
    };
    let ascan_length = args.get(2).and_then(|n| n.parse().ok()).unwrap_or(100);
    let num_a_scans = args.get(3).and_then(|n| n.parse().ok()).unwrap_or(5);

    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_port(port)
            .with_sample_mode(mode)
            .with_ascan_length(ascan_length)
            .with_num_a_scans(num_a_scans),
    )?;
    println!("[INFO] Simulator listening on {}", simulator.local_addr());
    println!("[INFO] Press Ctrl+C to stop\n");

    let mut last_requests = 0;
    loop {
        thread::sleep(Duration::from_secs(1));
        let requests = simulator.data_request_count();
        if requests != last_requests {
            let (gate_start, gate_end) = simulator.gates();
            info!(
                resets = simulator.reset_count(),
                config_lines = simulator.config_lines_count(),
                requests,
                responses = simulator.response_count(),
                gate_start,
                gate_end,
                digitisation_rate = simulator.digitisation_rate(),
                "Simulator activity"
            );
            last_requests = requests;
        }
    }
}
