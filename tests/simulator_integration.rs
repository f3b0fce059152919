//! End-to-end tests: PeakHandler against PeakSimulator over loopback TCP

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use peak_micropulse::io::{HandlerConfig, PeakHandler};
use peak_micropulse::protocol::{
    AcquisitionResult, Geometry, ReconstructionConfig, SampleMode, SystemFamily,
};
use peak_micropulse::simulator::{PeakSimulator, SimulatorConfig};
use peak_micropulse::PeakError;

const IMMERSION_8_BIT: &str = "Immersion_5MHz_128EL_Long_8_bit_mod.mps";
const ROLLER_16_BIT: &str = "roller_probe.mps";

fn data(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn handler_config(simulator: &PeakSimulator) -> HandlerConfig {
    HandlerConfig::new(simulator.local_addr().to_string())
        .with_digitisation_rate(50)
        .with_reset_settle(Duration::ZERO)
}

/// Read the MPS file, connect, reset and forward the configuration
fn connect_handler(simulator: &PeakSimulator, mps: &str) -> PeakHandler {
    let mut handler = PeakHandler::new(handler_config(simulator));
    handler.read_mps_file(data(mps)).unwrap();
    handler.connect().unwrap();
    handler.send_mps_configuration().unwrap();
    handler
}

/// Handler on the small 100 x 5 8-bit geometry used by the async tests
fn small_handler(simulator: &PeakSimulator) -> PeakHandler {
    let mut handler = connect_handler(simulator, IMMERSION_8_BIT);
    handler.set_geometry(Geometry::new(SampleMode::EightBit, 100, 5));
    handler
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn counting_callback() -> (Arc<AtomicUsize>, Arc<AtomicUsize>, impl FnMut(bool) + Send + 'static) {
    let ok = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let (ok_cb, failed_cb) = (Arc::clone(&ok), Arc::clone(&failed));
    let callback = move |valid: bool| {
        if valid {
            ok_cb.fetch_add(1, Ordering::SeqCst);
        } else {
            failed_cb.fetch_add(1, Ordering::SeqCst);
        }
    };
    (ok, failed, callback)
}

#[test]
fn test_sync_round_trip_eight_bit() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_ascan_length(775)
            .with_num_a_scans(49),
    )
    .unwrap();
    let mut handler = connect_handler(&simulator, IMMERSION_8_BIT);

    let result = handler.send_data_request().unwrap();

    assert_eq!(result.ascans.len(), 49);
    assert_eq!(result.ascan_length, 775);
    assert_eq!(result.num_a_scans, 49);
    assert_eq!(result.digitisation_rate, 50);
    assert_eq!(result.max_amplitude, 99);

    let first = &result.ascans[0];
    assert_eq!(first.header.dof, 1);
    assert_eq!(first.header.test_no, 1);
    assert_eq!(first.amps.len(), 775);
    for (i, &amp) in first.amps.iter().enumerate() {
        assert_eq!(amp, (i % 100) as i32, "sample {}", i);
    }
    assert_eq!(result.ascans[48].header.test_no, 49);
    assert_eq!(result.ascans[48].header.channel, 48);

    assert_eq!(simulator.reset_count(), 1);
    assert_eq!(simulator.data_request_count(), 1);
    assert_eq!(simulator.config_lines_count(), handler.commands().len());
    assert_eq!(simulator.gates(), (16, 791));
}

#[test]
fn test_sync_round_trip_sixteen_bit() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_sample_mode(SampleMode::SixteenBit)
            .with_ascan_length(2000)
            .with_num_a_scans(61),
    )
    .unwrap();
    let mut handler = connect_handler(&simulator, ROLLER_16_BIT);

    let result = handler.send_data_request().unwrap();

    assert_eq!(result.ascans.len(), 61);
    assert_eq!(result.max_amplitude, 999);

    let first = &result.ascans[0];
    assert_eq!(first.header.dof, 4);
    assert_eq!(first.amps.len(), 2000);
    for (i, &amp) in first.amps.iter().enumerate() {
        assert_eq!(amp, (i % 1000) as i32, "sample {}", i);
    }
}

#[test]
fn test_reset_reports_device_status() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = PeakHandler::new(handler_config(&simulator).with_digitisation_rate(25));

    let status = handler.connect().unwrap();

    assert_eq!(status.family(), SystemFamily::Ltpa);
    assert_eq!(status.default_digitisation_rate, 50);
    assert_eq!(status.actual_digitisation_rate, 25);
    assert_eq!(handler.digitisation_rate(), 25);
    assert_eq!(handler.device_status(), Some(&status));
    assert_eq!(simulator.digitisation_rate(), 25);
}

#[test]
fn test_reconstruction_configuration_in_results() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);
    handler.set_reconstruction_configuration(ReconstructionConfig {
        n_elements: 64,
        element_pitch: 0.6,
        vel_material: 5900.0,
        ..Default::default()
    });

    let result = handler.send_data_request().unwrap();

    assert_eq!(result.reconstruction.n_elements, 64);
    assert_eq!(result.reconstruction.element_pitch, 0.6);
    assert_eq!(result.reconstruction.vel_material, 5900.0);
}

#[test]
fn test_repeated_sync_requests() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_ascan_length(775)
            .with_num_a_scans(49),
    )
    .unwrap();
    let mut handler = connect_handler(&simulator, IMMERSION_8_BIT);

    for i in 0..100 {
        let result = handler.send_data_request();
        assert!(result.is_ok(), "request {} failed: {:?}", i, result.err());
    }

    assert_eq!(simulator.data_request_count(), 100);
    assert_eq!(simulator.response_count(), 100);
}

#[test]
fn test_geometry_mismatch_rejects_request() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_sample_mode(SampleMode::SixteenBit),
    )
    .unwrap();
    let mut handler = small_handler(&simulator);

    let err = handler.send_data_request().unwrap_err();

    assert!(matches!(
        err,
        PeakError::DofMismatch {
            expected: 1,
            actual: 4
        }
    ));
    assert!(err.is_protocol());
}

#[test]
fn test_async_basic() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);
    let (ok, failed, callback) = counting_callback();

    handler.start_async_acquisition_with(callback).unwrap();
    assert!(handler.is_acquiring());
    let reached = wait_until(Duration::from_secs(10), || {
        ok.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst) >= 10
    });
    handler.stop_async_acquisition().unwrap();

    assert!(reached);
    assert!(!handler.is_acquiring());
    assert!(ok.load(Ordering::SeqCst) >= 10);
}

#[test]
fn test_async_first_poll_sees_result() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);

    let mut out = AcquisitionResult::default();
    assert!(!handler.get_latest_data(&mut out));

    handler.start_async_acquisition().unwrap();
    let got = wait_until(Duration::from_secs(10), || handler.get_latest_data(&mut out));
    handler.stop_async_acquisition().unwrap();

    assert!(got);
    assert_eq!(out.ascans.len(), 5);
    assert_eq!(out.ascan_length, 100);
    assert_eq!(out.digitisation_rate, 50);
}

#[test]
fn test_async_concurrent_readers() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);
    handler.start_async_acquisition().unwrap();

    let latest = handler.latest_handle();
    let mut first = AcquisitionResult::default();
    assert!(wait_until(Duration::from_secs(30), || latest.take(&mut first)));

    let successes = AtomicUsize::new(0);
    let malformed = AtomicUsize::new(0);
    thread::scope(|s| {
        for _ in 0..2 {
            let latest = Arc::clone(&latest);
            let (successes, malformed) = (&successes, &malformed);
            s.spawn(move || {
                for _ in 0..1000 {
                    let mut out = AcquisitionResult::default();
                    if latest.take(&mut out) {
                        successes.fetch_add(1, Ordering::SeqCst);
                        if out.ascans.len() != 5 {
                            malformed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
    });

    handler.stop_async_acquisition().unwrap();

    assert_eq!(malformed.load(Ordering::SeqCst), 0);
    assert!(successes.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_async_rapid_start_stop() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);

    for _ in 0..50 {
        handler.start_async_acquisition().unwrap();
        thread::sleep(Duration::from_millis(10));
        handler.stop_async_acquisition().unwrap();
    }

    handler.start_async_acquisition().unwrap();
    let mut out = AcquisitionResult::default();
    let got = wait_until(Duration::from_secs(5), || handler.get_latest_data(&mut out));
    handler.stop_async_acquisition().unwrap();

    assert!(got);
    assert_eq!(out.ascans.len(), 5);

    // Synchronous path still framed correctly after the last cancellation
    let result = handler.send_data_request().unwrap();
    assert_eq!(result.ascans.len(), 5);
    assert_eq!(result.ascans[0].header.test_no, 1);
}

#[test]
fn test_async_start_is_idempotent() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);

    handler.start_async_acquisition().unwrap();
    handler.start_async_acquisition().unwrap();
    assert!(matches!(
        handler.send_data_request(),
        Err(PeakError::AcquisitionActive)
    ));
    handler.stop_async_acquisition().unwrap();
    handler.stop_async_acquisition().unwrap();

    assert!(handler.send_data_request().is_ok());
}

#[test]
fn test_async_callback_verification() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);
    let (ok, failed, callback) = counting_callback();

    handler.start_async_acquisition_with(callback).unwrap();
    wait_until(Duration::from_secs(10), || ok.load(Ordering::SeqCst) >= 20);
    handler.stop_async_acquisition().unwrap();

    assert!(ok.load(Ordering::SeqCst) >= 20);
    assert_eq!(failed.load(Ordering::SeqCst), 0);
}

#[test]
fn test_async_no_callbacks_after_stop() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = small_handler(&simulator);
    let (ok, failed, callback) = counting_callback();

    handler.start_async_acquisition_with(callback).unwrap();
    wait_until(Duration::from_secs(10), || ok.load(Ordering::SeqCst) >= 3);
    handler.stop_async_acquisition().unwrap();

    let total = ok.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst);
    let mut out = AcquisitionResult::default();
    handler.get_latest_data(&mut out);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(ok.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst), total);
    assert!(!handler.get_latest_data(&mut out));
}

#[test]
fn test_async_rejected_cycles_publish_nothing() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_sample_mode(SampleMode::SixteenBit),
    )
    .unwrap();
    let mut handler = small_handler(&simulator);
    let (ok, failed, callback) = counting_callback();

    handler.start_async_acquisition_with(callback).unwrap();
    wait_until(Duration::from_secs(10), || failed.load(Ordering::SeqCst) >= 3);
    handler.stop_async_acquisition().unwrap();

    assert!(failed.load(Ordering::SeqCst) >= 3);
    assert_eq!(ok.load(Ordering::SeqCst), 0);
    let mut out = AcquisitionResult::default();
    assert!(!handler.get_latest_data(&mut out));
}

#[test]
fn test_large_packet_stress() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_sample_mode(SampleMode::SixteenBit)
            .with_ascan_length(4000)
            .with_num_a_scans(128),
    )
    .unwrap();

    let mut handler = PeakHandler::new(handler_config(&simulator).with_recv_buffer_size(1 << 20));
    handler.set_geometry(Geometry::new(SampleMode::SixteenBit, 4000, 128));
    handler.connect().unwrap();

    for i in 0..50 {
        let result = handler.send_data_request();
        assert!(result.is_ok(), "request {} failed: {:?}", i, result.as_ref().err());
        assert_eq!(result.unwrap().ascans.len(), 128);
    }
}

#[test]
fn test_simulator_restart() {
    let config = SimulatorConfig::default()
        .with_ascan_length(775)
        .with_num_a_scans(49);

    {
        let simulator = PeakSimulator::start(config.clone()).unwrap();
        let mut handler = connect_handler(&simulator, IMMERSION_8_BIT);
        assert!(handler.send_data_request().is_ok());
    }

    let simulator = PeakSimulator::start(config).unwrap();
    let mut handler = connect_handler(&simulator, IMMERSION_8_BIT);
    assert!(handler.send_data_request().is_ok());
    assert_eq!(simulator.data_request_count(), 1);
}

#[test]
fn test_response_latency_respects_acquisition_window() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_processing_delay(Duration::from_millis(20)),
    )
    .unwrap();
    let mut handler = small_handler(&simulator);

    let started = Instant::now();
    handler.send_data_request().unwrap();

    assert!(started.elapsed() >= simulator.response_delay());
}

#[test]
fn test_slower_rate_never_answers_faster() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();

    let mut fast = PeakHandler::new(handler_config(&simulator));
    fast.connect().unwrap();
    let fast_delay = simulator.response_delay();
    drop(fast);

    let mut slow = PeakHandler::new(handler_config(&simulator).with_digitisation_rate(25));
    slow.connect().unwrap();
    let slow_delay = simulator.response_delay();

    assert!(slow_delay > fast_delay);
}

#[test]
fn test_back_to_back_triggers_are_paced() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_processing_delay(Duration::from_millis(20)),
    )
    .unwrap();
    let geometry = Geometry::new(SampleMode::EightBit, 100, 5);
    let mut stream = TcpStream::connect(simulator.local_addr()).unwrap();

    let started = Instant::now();
    stream.write_all(b"CALS 1\r\nCALS 1\r\nCALS 1\r\n").unwrap();
    let mut responses = vec![0u8; 3 * geometry.packet_length()];
    stream.read_exact(&mut responses).unwrap();

    assert!(started.elapsed() >= simulator.response_delay() * 3);
    assert_eq!(simulator.data_request_count(), 3);
    assert_eq!(simulator.response_count(), 3);
}

#[test]
fn test_reset_after_stop_mid_acquisition() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_processing_delay(Duration::from_millis(500)),
    )
    .unwrap();
    let mut handler = PeakHandler::new(
        handler_config(&simulator).with_read_timeout(Duration::from_secs(3)),
    );
    handler.set_geometry(Geometry::new(SampleMode::EightBit, 100, 5));
    handler.connect().unwrap();

    // Stop while the instrument is still acquiring the first response
    handler.start_async_acquisition().unwrap();
    thread::sleep(Duration::from_millis(100));
    handler.stop_async_acquisition().unwrap();

    let status = handler.send_reset(0).unwrap();
    assert_eq!(status.actual_digitisation_rate, 50);
    assert_eq!(simulator.reset_count(), 2);

    let result = handler.send_data_request().unwrap();
    assert_eq!(result.ascans.len(), 5);
    assert_eq!(result.ascans[0].header.test_no, 1);
}

#[test]
fn test_mps_reset_line_keeps_framing() {
    let simulator = PeakSimulator::start(SimulatorConfig::default()).unwrap();
    let mut handler = PeakHandler::new(handler_config(&simulator));
    handler.load_mps("RST\nDOF 1\nGATS 1 0 100\nSWP 1 1 - 5\n".parse().unwrap());

    handler.connect().unwrap();
    handler.send_mps_configuration().unwrap();

    for _ in 0..2 {
        let result = handler.send_data_request().unwrap();
        assert_eq!(result.ascans.len(), 5);
        assert_eq!(result.ascans[0].header.test_no, 1);
    }
    assert_eq!(simulator.reset_count(), 2);
    assert_eq!(simulator.config_lines_count(), 3);
}

#[test]
fn test_sixteen_bit_file_with_reset_line() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default()
            .with_sample_mode(SampleMode::SixteenBit)
            .with_ascan_length(2000)
            .with_num_a_scans(61),
    )
    .unwrap();
    let mut handler = connect_handler(&simulator, ROLLER_16_BIT);

    assert_eq!(handler.commands()[0], "RST");
    assert_eq!(simulator.reset_count(), 2);
    assert_eq!(simulator.config_lines_count(), handler.commands().len() - 1);
    assert_eq!(handler.send_data_request().unwrap().ascans.len(), 61);
}

#[test]
fn test_timed_out_request_does_not_shift_framing() {
    let simulator = PeakSimulator::start(
        SimulatorConfig::default().with_processing_delay(Duration::from_millis(300)),
    )
    .unwrap();
    let mut handler = PeakHandler::new(
        handler_config(&simulator).with_read_timeout(Duration::from_millis(100)),
    );
    handler.set_geometry(Geometry::new(SampleMode::EightBit, 100, 5));
    handler.connect().unwrap();

    assert!(matches!(handler.send_data_request(), Err(PeakError::Io(_))));

    // The late response is discarded; the next one is read whole
    handler.set_read_timeout(None).unwrap();
    let result = handler.send_data_request().unwrap();
    assert_eq!(result.ascans.len(), 5);
    assert_eq!(result.ascans[0].header.test_no, 1);
    assert_eq!(simulator.response_count(), 2);

    let result = handler.send_data_request().unwrap();
    assert_eq!(result.ascans.len(), 5);
    assert_eq!(simulator.response_count(), 3);
}
