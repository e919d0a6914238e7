//! Mock rig devices used by the tests and the script runner.
//!
//! Each type here is a capability wrapper in miniature: it validates its
//! arguments, reports invalid ones as deduplicated non-fatal warnings with a
//! safe fallback, and leaves every fatal decision to the session controller.

use crate::capability::Capability;
use crate::session::SessionHandle;
use std::any::Any;
use std::sync::Mutex;
use std::time::Instant;

/// A motor with a power property in `[-1, 1]` and a direction.
pub struct MockMotor {
    power: Mutex<f64>,
    direction: Mutex<String>,
}

impl MockMotor {
    pub fn new() -> Self {
        Self {
            power: Mutex::new(0.0),
            direction: Mutex::new("forward".to_string()),
        }
    }

    pub fn power(&self) -> f64 {
        *self.power.lock().unwrap()
    }

    /// Apply a power value, clamping invalid requests to a safe one.
    ///
    /// Out-of-range and non-finite values are script mistakes, not host
    /// failures: they warn once and the session continues.
    pub fn set_power(&self, session: &SessionHandle, requested: f64) -> f64 {
        let applied = if !requested.is_finite() {
            session.warn_once(format!("Motor power {requested} is not a number; using 0"));
            0.0
        } else if !(-1.0..=1.0).contains(&requested) {
            session.warn_once(format!(
                "Motor power {requested} is outside [-1, 1]; clamping"
            ));
            requested.clamp(-1.0, 1.0)
        } else {
            requested
        };
        *self.power.lock().unwrap() = applied;
        applied
    }

    pub fn direction(&self) -> String {
        self.direction.lock().unwrap().clone()
    }

    /// The dispatcher has already canonicalized the variant string.
    pub fn set_direction(&self, direction: &str) {
        *self.direction.lock().unwrap() = direction.to_string();
    }
}

impl Default for MockMotor {
    fn default() -> Self {
        Self::new()
    }
}

impl Capability for MockMotor {
    fn type_name(&self) -> &'static str {
        "Motor"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn shutdown(&self) {
        *self.power.lock().unwrap() = 0.0;
        tracing::info!("motor stopped at teardown");
    }
}

/// A distance sensor whose reading the host (or a test) sets directly.
pub struct MockRangeSensor {
    distance_mm: Mutex<f64>,
}

impl MockRangeSensor {
    pub fn new() -> Self {
        Self {
            distance_mm: Mutex::new(0.0),
        }
    }

    pub fn distance_mm(&self) -> f64 {
        *self.distance_mm.lock().unwrap()
    }

    pub fn set_distance_mm(&self, distance_mm: f64) {
        *self.distance_mm.lock().unwrap() = distance_mm;
    }
}

impl Default for MockRangeSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Capability for MockRangeSensor {
    fn type_name(&self) -> &'static str {
        "RangeSensor"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A stopwatch created by scripts through the creation path and passed back
/// as a native handle.
pub struct ElapsedTimer {
    started: Mutex<Instant>,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(Instant::now()),
        }
    }

    pub fn seconds(&self) -> f64 {
        self.started.lock().unwrap().elapsed().as_secs_f64()
    }

    pub fn reset(&self) {
        *self.started.lock().unwrap() = Instant::now();
    }
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::session::SessionShared;

    fn session() -> SessionHandle {
        SessionHandle::new(SessionShared::new("mock-test", Settings::default()))
    }

    #[test]
    fn test_motor_accepts_valid_power() {
        let motor = MockMotor::new();
        assert_eq!(motor.set_power(&session(), 0.5), 0.5);
        assert_eq!(motor.power(), 0.5);
    }

    #[test]
    fn test_motor_clamps_and_warns_on_invalid_power() {
        let motor = MockMotor::new();
        let session = session();

        assert_eq!(motor.set_power(&session, 2.5), 1.0);
        assert_eq!(motor.set_power(&session, f64::NAN), 0.0);
    }

    #[test]
    fn test_motor_shutdown_zeroes_power() {
        let motor = MockMotor::new();
        motor.set_power(&session(), 0.8);
        motor.shutdown();
        assert_eq!(motor.power(), 0.0);
    }

    #[test]
    fn test_timer_runs_and_resets() {
        let timer = ElapsedTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(timer.seconds() >= 0.02);

        timer.reset();
        assert!(timer.seconds() < 0.02);
    }
}
