//! E2E tests for playback/capture calibration
//!
//! Covers the hit counting that decides between correcting and converging,
//! and a full session over an in-memory loopback where the calibrator has
//! to pull the pulse to the start of the capture window and then derive the
//! microphone distance from the inter-channel offset.

mod common;

use approx::assert_relative_eq;
use common::{wait_for, Loopback};
use sonar::controller::SonarView;
use sonar::sync::{Peaks, SyncAction, SyncParams, SyncPhase, SyncState};
use sonar::{Rect, Sonar, SonarConfig, SonarController};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: usize = 3840;

fn params(positive_hits: u32, derive_baseline: bool) -> SyncParams {
    let mut config = SonarConfig::default();
    config.calibration.positive_hits = positive_hits;
    config.calibration.derive_baseline = derive_baseline;
    SyncParams::from(&config)
}

fn feed(state: &mut SyncState, peaks: Peaks, times: u32) -> Vec<SyncAction> {
    (0..times).map(|_| state.observe(peaks, WINDOW)).collect()
}

/// Aligned pulses converge after exactly `positive_hits` stable observations
#[test]
fn test_converges_after_positive_hits() {
    for a in [0usize, 1, 2] {
        let mut state = SyncState::new(params(3, false));
        let actions = feed(&mut state, Peaks { a, b: a + 10 }, 3);
        assert_eq!(
            actions,
            vec![
                SyncAction::Pending,
                SyncAction::Pending,
                SyncAction::Converge { baseline: None }
            ],
            "peak at {}",
            a
        );
        assert!(state.is_converged());

        // Inert afterwards
        assert_eq!(state.observe(Peaks { a: 2000, b: 2000 }, WINDOW), SyncAction::Pending);
    }
}

/// Misaligned pulses ask for the delay that wraps them to the window start
#[test]
fn test_correction_delay_wraps_to_window_start() {
    for a in [3usize, 1000, 2840, WINDOW - 1] {
        let mut state = SyncState::new(params(2, true));
        let actions = feed(&mut state, Peaks { a, b: (a + 10) % WINDOW }, 2);
        assert_eq!(actions[0], SyncAction::Pending);
        assert_eq!(
            actions[1],
            SyncAction::Correct {
                delay: (WINDOW - a) % WINDOW
            },
            "peak at {}",
            a
        );
        assert!(!state.is_converged());
        assert_eq!(state.tracked(), Some(Peaks { a: 0, b: 10 }));
    }
}

/// Drift within tolerance keeps counting, larger jumps restart
#[test]
fn test_unstable_position_restarts_count() {
    let mut state = SyncState::new(params(3, false));
    assert_eq!(state.observe(Peaks { a: 500, b: 510 }, WINDOW), SyncAction::Pending);
    assert_eq!(state.observe(Peaks { a: 514, b: 496 }, WINDOW), SyncAction::Pending);
    assert_eq!(state.hits(), 2);

    // 15 frames is already outside the (exclusive) tolerance
    assert_eq!(state.observe(Peaks { a: 515, b: 510 }, WINDOW), SyncAction::Pending);
    assert_eq!(state.hits(), 1);
    assert_eq!(state.tracked(), Some(Peaks { a: 515, b: 510 }));
}

/// Baseline comes from the shorter way around the channel offset
#[test]
fn test_baseline_from_wrapped_offset() {
    let per_frame = 340.29 / 48000.0;

    let mut state = SyncState::new(params(1, true));
    match state.observe(Peaks { a: 0, b: 10 }, WINDOW) {
        SyncAction::Converge {
            baseline: Some(meters),
        } => assert_relative_eq!(meters, 10.0 * per_frame, max_relative = 1e-5),
        other => panic!("expected convergence, got {:?}", other),
    }

    // B leads A across the window boundary by 7 frames
    let mut state = SyncState::new(params(1, true));
    match state.observe(Peaks { a: 2, b: WINDOW - 5 }, WINDOW) {
        SyncAction::Converge {
            baseline: Some(meters),
        } => assert_relative_eq!(meters, 7.0 * per_frame, max_relative = 1e-5),
        other => panic!("expected convergence, got {:?}", other),
    }
}

/// A live session over a loopback line converges and measures the baseline
#[test]
fn test_loopback_session_converges() {
    let mut config = SonarConfig {
        capture_retry_ms: Some(1),
        canvas_width: 32,
        canvas_height: 24,
        workers: 2,
        ..Default::default()
    };
    config.calibration.adjust_interval_pulses = 1;
    assert_eq!(config.window_frames(), WINDOW);

    let loopback = Loopback::new(1000, 1010, WINDOW * 2, WINDOW);
    let (view, _snapshots) = SonarView::new(Rect::sized(32, 24), 4);
    let view = Arc::new(view);
    let mut sonar = Sonar::new(config, Arc::clone(&view) as Arc<dyn SonarController>)
        .expect("valid config");

    sonar
        .start(loopback.microphones(), loopback.speaker())
        .expect("session starts");

    let converged = wait_for(Duration::from_secs(20), || {
        sonar.sync_phase() == Some(SyncPhase::Converged)
    });
    assert!(converged, "calibration did not converge, phase {:?}", sonar.sync_phase());

    assert_relative_eq!(sonar.baseline(), 10.0 / 48000.0 * 340.29, max_relative = 1e-4);
    assert!(view.received() > 0);

    let stats = sonar.stop().expect("clean stop");
    assert!(stats.windows > 0);
    assert!(stats.pulses > 1);
}
