//! Tests for session lifecycle: cancellation escalation, outcome latching,
//! and teardown exclusivity.

use rig_script::capability::Capability;
use rig_script::config::Settings;
use rig_script::devices;
use rig_script::error::BridgeError;
use rig_script::scripting::RhaiRuntime;
use rig_script::session::{Outcome, SessionController, SessionPlan};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn standard_plan() -> SessionPlan {
    let mut plan = SessionPlan::new(
        Arc::new(RhaiRuntime::new()),
        Arc::new(devices::standard_manifest().unwrap()),
    );
    for (identifier, capability) in devices::standard_capabilities() {
        plan = plan.with_capability(identifier, capability);
    }
    plan
}

fn fast_settings() -> Settings {
    Settings {
        stop_grace_period: Duration::from_millis(200),
        completion_poll_interval: Duration::from_millis(20),
        interrupt_poll_interval: Duration::from_millis(5),
        ..Settings::default()
    }
}

/// A capability whose shutdown hook takes a while, keeping teardown visible.
struct SlowShutdown {
    delay: Duration,
}

impl Capability for SlowShutdown {
    fn type_name(&self) -> &'static str {
        "SlowShutdown"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn shutdown(&self) {
        std::thread::sleep(self.delay);
    }
}

#[tokio::test]
async fn test_non_yielding_script_is_forced_to_stop_within_grace_period() {
    let controller = Arc::new(SessionController::new(fast_settings()));

    let runner = controller.clone();
    let handle = tokio::spawn(async move {
        runner
            .begin("stubborn", "loop { sleep_ms(20); }", standard_plan())
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    controller.request_stop();
    let report = handle.await.unwrap().unwrap();

    // Forced termination, not a crash, and bounded by grace + poll slack.
    assert_eq!(report.outcome, Outcome::Stopped);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "forced stop took too long: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_cooperative_script_stops_normally_within_grace() {
    // Generous grace period: this test is about the cooperative path, and
    // must not race the escalation on a slow machine.
    let controller = Arc::new(SessionController::new(Settings {
        stop_grace_period: Duration::from_secs(30),
        ..fast_settings()
    }));

    let runner = controller.clone();
    let handle = tokio::spawn(async move {
        runner
            .begin(
                "polite",
                "while !stop_requested() { sleep_ms(10); }",
                standard_plan(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.request_stop();
    let report = handle.await.unwrap().unwrap();

    // The script honored the request during the grace window, so this is an
    // ordinary completion, not a forced one.
    assert_eq!(report.outcome, Outcome::Normal);
}

#[tokio::test]
async fn test_second_begin_rejected_while_running() {
    let controller = Arc::new(SessionController::new(fast_settings()));

    let runner = controller.clone();
    let handle = tokio::spawn(async move {
        runner.begin("first", "sleep_ms(400);", standard_plan()).await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = controller.begin("second", "let x = 1;", standard_plan()).await;
    assert!(matches!(second, Err(BridgeError::SessionActive(_))));

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Normal);
}

#[tokio::test]
async fn test_second_begin_rejected_during_teardown_then_accepted() {
    let controller = Arc::new(SessionController::new(fast_settings()));

    let runner = controller.clone();
    let handle = tokio::spawn(async move {
        let plan = standard_plan().with_capability(
            "slow",
            Arc::new(SlowShutdown {
                delay: Duration::from_millis(500),
            }) as Arc<dyn Capability>,
        );
        runner.begin("first", "let x = 1;", plan).await
    });

    // By now the trivial script has finished and teardown is mid-flight in
    // the slow shutdown hook.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let during = controller.begin("second", "let x = 1;", standard_plan()).await;
    assert!(matches!(during, Err(BridgeError::TeardownPending)));

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.outcome, Outcome::Normal);

    // Once teardown has completed, a fresh session is accepted.
    let after = controller
        .begin("third", "let x = 2;", standard_plan())
        .await
        .unwrap();
    assert_eq!(after.outcome, Outcome::Normal);
}

#[tokio::test]
async fn test_duplicate_capability_identifier_rejects_the_session() {
    let controller = SessionController::new(fast_settings());
    let plan = standard_plan()
        .with_capability("claw", Arc::new(devices::MockMotor::new()) as Arc<dyn Capability>)
        .with_capability("claw", Arc::new(devices::MockMotor::new()) as Arc<dyn Capability>);

    let result = controller.begin("dupes", "let x = 1;", plan).await;
    assert!(matches!(result, Err(BridgeError::DuplicateCapability(_))));

    // The controller is back to idle: a clean plan runs fine.
    let report = controller
        .begin("retry", "let x = 1;", standard_plan())
        .await
        .unwrap();
    assert_eq!(report.outcome, Outcome::Normal);
}

#[tokio::test]
async fn test_stop_request_with_no_session_is_a_no_op() {
    let controller = SessionController::new(fast_settings());
    controller.request_stop();

    let report = controller
        .begin("later", "let x = 1;", standard_plan())
        .await
        .unwrap();
    // The earlier request does not leak into the new session.
    assert_eq!(report.outcome, Outcome::Normal);
}

#[tokio::test]
async fn test_report_carries_timing_and_name() {
    let controller = SessionController::new(fast_settings());
    let report = controller
        .begin("timed", "sleep_ms(50);", standard_plan())
        .await
        .unwrap();

    assert_eq!(report.name, "timed");
    assert!(report.duration >= Duration::from_millis(50));
    assert!(report.warnings.is_empty());
}
