//! End-to-end sweep runs against the simulated and mock instruments.

use memristor_daq::instrument::{scpi, InstrumentController, RampProfile};
use memristor_daq::sweep::{SweepEngine, SweepEvent, SweepParameters, SweepStatus};
use memristor_daq::transport::{MockCall, MockTransport, SimulatedTransport};
use memristor_daq::SweepError;
use std::sync::Arc;
use std::time::Duration;

async fn mock_engine(mock: &MockTransport) -> SweepEngine {
    let controller = Arc::new(InstrumentController::new(RampProfile::default()));
    controller
        .connect(Box::new(mock.clone()), "GPIB0::24::INSTR")
        .await
        .unwrap();
    SweepEngine::new(controller)
}

fn params(start: f64, stop: f64, step: f64, delay: f64) -> SweepParameters {
    SweepParameters {
        start_voltage: start,
        stop_voltage: stop,
        step_voltage: step,
        delay_seconds: delay,
        current_compliance_amps: 0.01,
    }
}

#[tokio::test(start_paused = true)]
async fn test_simulated_forward_sweep() {
    let controller = Arc::new(InstrumentController::new(RampProfile::default()));
    controller
        .connect(
            Box::new(SimulatedTransport::new().with_settling(Duration::ZERO)),
            "SIM::2400::INSTR",
        )
        .await
        .unwrap();
    let engine = SweepEngine::new(controller);

    let result = engine.run(params(0.0, 1.0, 0.1, 0.0)).await.unwrap();

    assert_eq!(result.status(), SweepStatus::Completed);
    assert_eq!(result.len(), 11);
    for (i, sample) in result.iter().enumerate() {
        assert!((sample.voltage - i as f64 * 0.1).abs() < 1e-9);
        if sample.voltage > 0.0 {
            let ratio = sample.current / sample.voltage;
            assert!(
                (0.0..=0.0012 + 1e-9).contains(&ratio),
                "ratio {} at {} V",
                ratio,
                sample.voltage
            );
        }
    }
    assert_eq!(result.voltages()[10], 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_descending_sweep_voltages() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    let result = engine.run(params(1.0, -1.0, -0.5, 0.0)).await.unwrap();

    assert_eq!(result.status(), SweepStatus::Completed);
    assert_eq!(result.voltages(), vec![1.0, 0.5, 0.0, -0.5, -1.0]);
    assert_eq!(mock.level(), 0.0);
}

#[tokio::test]
async fn test_zero_compliance_touches_nothing() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    mock.clear_log();

    let mut bad = params(0.0, 1.0, 0.1, 0.0);
    bad.current_compliance_amps = 0.0;
    let result = engine.run(bad).await.unwrap();

    assert_eq!(result.status(), SweepStatus::Failed);
    assert!(matches!(result.error(), Some(SweepError::Validation(_))));
    assert!(result.is_empty());
    assert!(mock.call_log().is_empty());
}

#[tokio::test]
async fn test_out_of_range_level_fails_validation() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    mock.clear_log();

    let result = engine.run(params(1e30, 1e30, 0.0, 0.0)).await.unwrap();

    assert_eq!(result.status(), SweepStatus::Failed);
    assert!(matches!(result.error(), Some(SweepError::Validation(_))));
    assert!(result.is_empty());
    assert!(mock.call_log().is_empty());
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_third_reading_failure() {
    let mock = MockTransport::new();
    mock.fail_reading(3);
    let engine = mock_engine(&mock).await;

    let result = engine.run(params(0.0, 1.0, 0.1, 0.0)).await.unwrap();

    assert_eq!(result.status(), SweepStatus::Failed);
    assert!(matches!(result.error(), Some(SweepError::Measurement(_))));
    assert_eq!(result.len(), 2);
    assert_eq!(mock.level(), 0.0);

    // Exactly one ramp to zero follows the failed reading
    let log = mock.call_log();
    let failed_at = log
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, MockCall::Query(q) if q == scpi::MEASURE_CURRENT))
        .map(|(i, _)| i)
        .nth(2)
        .unwrap();
    let readbacks_after = log[failed_at..]
        .iter()
        .filter(|c| matches!(c, MockCall::Query(q) if q == scpi::VOLTAGE_LEVEL_QUERY))
        .count();
    assert_eq!(readbacks_after, 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_allows_at_most_one_extra_sample() {
    for k in [0usize, 3, 7] {
        let mock = MockTransport::new();
        let engine = mock_engine(&mock).await;
        let mut events = engine.subscribe();
        let handle = engine.start(params(0.0, 1.0, 0.1, 0.01)).unwrap();

        loop {
            match events.recv().await.unwrap() {
                SweepEvent::Sample(p) if p.index == k => {
                    handle.request_abort();
                    break;
                }
                SweepEvent::Finished { .. } => panic!("sweep finished before abort"),
                _ => {}
            }
        }

        let result = handle.wait().await.unwrap();
        assert_eq!(result.status(), SweepStatus::Aborted);
        assert!(
            result.len() == k + 1 || result.len() == k + 2,
            "abort after sample {} left {} samples",
            k,
            result.len()
        );
        assert!(result.error().is_none());
        assert_eq!(mock.level(), 0.0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_terminal_status_ends_at_zero() {
    // Completed
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    let result = engine.run(params(0.5, 1.5, 0.25, 0.0)).await.unwrap();
    assert_eq!(result.status(), SweepStatus::Completed);
    assert_eq!(mock.level(), 0.0);
    assert_eq!(
        engine.controller().last_commanded_voltage().await,
        Some(0.0)
    );

    // Aborted
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    let handle = engine.start(params(-1.0, 1.0, 0.1, 0.0)).unwrap();
    handle.request_abort();
    assert_eq!(handle.wait().await.unwrap().status(), SweepStatus::Aborted);
    assert_eq!(mock.level(), 0.0);

    // Failed
    let mock = MockTransport::new();
    mock.fail_reading(5);
    let engine = mock_engine(&mock).await;
    let result = engine.run(params(-1.0, 1.0, 0.1, 0.0)).await.unwrap();
    assert_eq!(result.status(), SweepStatus::Failed);
    assert_eq!(mock.level(), 0.0);
    assert!(!mock.output_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_ramp_to_start_failure() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    // Five configuration writes succeed, the first ramp write fails
    mock.fail_writes_after(5);

    let result = engine.run(params(1.0, 2.0, 0.1, 0.0)).await.unwrap();
    assert_eq!(result.status(), SweepStatus::Failed);
    assert!(matches!(result.error(), Some(SweepError::Instrument(_))));
    assert!(result.is_empty());
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_second_sweep_is_busy() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    let first = engine.start(params(0.0, 1.0, 0.1, 0.05)).unwrap();

    let err = engine.start(params(0.0, 0.5, 0.1, 0.0)).err();
    assert_eq!(err, Some(SweepError::Busy));

    let result = first.wait().await.unwrap();
    assert_eq!(result.status(), SweepStatus::Completed);
    assert_eq!(result.len(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_snapshots_track_progress() {
    let mock = MockTransport::new();
    let engine = mock_engine(&mock).await;
    let handle = engine.start(params(0.0, 0.4, 0.1, 0.01)).unwrap();
    let mut snapshots = handle.snapshots();

    let mut seen = 0;
    while snapshots.changed().await.is_ok() {
        let snap = snapshots.borrow_and_update().clone();
        assert!(snap.completed_points >= seen);
        seen = snap.completed_points;
        if snap.status.is_terminal() {
            break;
        }
    }
    assert_eq!(seen, 5);
    assert_eq!(handle.wait().await.unwrap().len(), 5);
}
