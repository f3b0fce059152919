//! Stand-alone acquisition against a MicroPulse / LTPA instrument
//!
//! Loads an MPS file, resets and configures the instrument, takes one
//! synchronous acquisition and then runs continuous acquisition for a few
//! seconds, printing the peak amplitude of each new result.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 10.1.1.2:1067, tests/data/roller_probe.mps, instrument default rate
//! cargo run --example standalone
//!
//! # Custom instrument, MPS file and digitisation rate
//! cargo run --example standalone 127.0.0.1:1067 my_probe.mps 25
//!
//! # Library logs
//! RUST_LOG=peak_micropulse=debug cargo run --example standalone
//! ```

use peak_micropulse::io::{HandlerConfig, PeakHandler};
use peak_micropulse::protocol::AcquisitionResult;
use peak_micropulse::Result;
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();

    if let Err(e) = run() {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "10.1.1.2:1067".to_string());
    let mps = args
        .next()
        .unwrap_or_else(|| "tests/data/roller_probe.mps".to_string());
    let rate = args.next().and_then(|r| r.parse().ok()).unwrap_or(0);

    let mut handler = PeakHandler::new(HandlerConfig::new(addr).with_digitisation_rate(rate));
    let geometry = handler.read_mps_file(&mps)?;
    info!(
        mps = %mps,
        dof = geometry.sample_mode().code(),
        ascan_length = geometry.ascan_length(),
        num_a_scans = geometry.num_a_scans(),
        packet_length = geometry.packet_length(),
        "MPS loaded"
    );

    let status = handler.connect()?;
    info!(
        family = ?status.family(),
        digitisation_rate = status.actual_digitisation_rate,
        "Instrument reset"
    );
    handler.send_mps_configuration()?;

    let started = Instant::now();
    let result = handler.send_data_request()?;
    info!(
        ascans = result.ascans.len(),
        max_amplitude = result.max_amplitude,
        elapsed = ?started.elapsed(),
        "Synchronous acquisition"
    );

    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&rejected);
    handler.start_async_acquisition_with(move |ok| {
        if !ok {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    })?;

    let mut latest = AcquisitionResult::default();
    let mut received = 0usize;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if handler.get_latest_data(&mut latest) {
            received += 1;
            println!(
                "[RESULT #{}] {} A-scans, peak amplitude {}",
                received,
                latest.ascans.len(),
                latest.max_amplitude
            );
        }
        thread::sleep(Duration::from_millis(20));
    }
    handler.stop_async_acquisition()?;

    let rejected = rejected.load(Ordering::Relaxed);
    if rejected > 0 {
        warn!(rejected, "Some acquisition cycles were rejected");
    }
    info!(received, "Continuous acquisition finished");

    handler.disconnect()
}
