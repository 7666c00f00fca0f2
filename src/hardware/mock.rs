//! Mock Hardware Implementations
//!
//! Simulated drivers for tests and dry runs. All delays use
//! `tokio::time::sleep`, never `std::thread::sleep`, so paused-clock tests
//! stay deterministic.
//!
//! # Available Mocks
//!
//! - `MockDriver` - Stateful device (pump, valve, heater) recording every call
//! - `MockSensor` - Sensor producing a configurable sequence of readings
//!
//! Both drivers are moved into the executor for a run; keep a [`CallLog`]
//! handle to inspect what happened afterwards.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

use crate::component::StateMap;
use crate::error::DriverError;
use crate::hardware::{Driver, DriverCapabilities};

/// One driver invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    /// `acquire`
    Acquire,
    /// `apply` with the mapping it was given
    Apply(StateMap),
    /// `read`
    Read,
    /// `release`
    Release,
}

/// A recorded call and the (tokio) instant it was made.
#[derive(Debug, Clone)]
pub struct DriverCall {
    /// When the call started.
    pub at: Instant,
    /// Which call.
    pub kind: CallKind,
}

/// Shared view of a mock's call history.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<RwLock<Vec<DriverCall>>>);

impl CallLog {
    async fn push(&self, kind: CallKind) {
        self.0.write().await.push(DriverCall {
            at: Instant::now(),
            kind,
        });
    }

    /// Every call so far.
    pub async fn calls(&self) -> Vec<DriverCall> {
        self.0.read().await.clone()
    }

    /// Every mapping passed to `apply`, in call order.
    pub async fn applied(&self) -> Vec<StateMap> {
        self.0
            .read()
            .await
            .iter()
            .filter_map(|c| match &c.kind {
                CallKind::Apply(state) => Some(state.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of calls matching `kind`.
    pub async fn count(&self, kind: fn(&CallKind) -> bool) -> usize {
        self.0.read().await.iter().filter(|c| kind(&c.kind)).count()
    }
}

// =============================================================================
// MockDriver - Simulated Stateful Device
// =============================================================================

/// Mock stateful device
///
/// Simulates a device with:
/// - Configurable apply latency
/// - Injectable failures on acquire, the n-th apply, or release
/// - Enforcement of the acquire/release lifecycle
///
/// # Example
///
/// ```rust,ignore
/// let pump = MockDriver::new("pump1").with_apply_delay(Duration::from_millis(50));
/// let log = pump.call_log();
/// // ... run the executor ...
/// assert_eq!(log.applied().await.len(), 4);
/// ```
pub struct MockDriver {
    name: String,
    apply_delay: Duration,
    fail_acquire: bool,
    fail_release: bool,
    fail_on_apply: Option<usize>,
    panic_on_apply: Option<usize>,
    applies: usize,
    acquired: bool,
    log: CallLog,
}

impl MockDriver {
    /// Create a mock that succeeds instantly on every call
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            apply_delay: Duration::ZERO,
            fail_acquire: false,
            fail_release: false,
            fail_on_apply: None,
            panic_on_apply: None,
            applies: 0,
            acquired: false,
            log: CallLog::default(),
        }
    }

    /// Every `apply` takes `delay` before returning
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = delay;
        self
    }

    /// The `n`-th apply (1-based) fails with a device error
    pub fn failing_apply(mut self, n: usize) -> Self {
        self.fail_on_apply = Some(n);
        self
    }

    /// The `n`-th apply (1-based) panics
    pub fn panicking_apply(mut self, n: usize) -> Self {
        self.panic_on_apply = Some(n);
        self
    }

    /// `acquire` fails with a device error
    pub fn failing_acquire(mut self) -> Self {
        self.fail_acquire = true;
        self
    }

    /// `release` fails with a device error
    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Handle on the call history, usable after the driver is moved
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            apply: true,
            read: false,
        }
    }

    async fn acquire(&mut self) -> Result<(), DriverError> {
        self.log.push(CallKind::Acquire).await;
        if self.fail_acquire {
            return Err(DriverError::Device(format!("{}: device not responding", self.name)));
        }
        self.acquired = true;
        debug!("MockDriver {}: acquired", self.name);
        Ok(())
    }

    async fn release(&mut self) -> Result<(), DriverError> {
        self.log.push(CallKind::Release).await;
        if !self.acquired {
            return Err(DriverError::NotAcquired);
        }
        self.acquired = false;
        if self.fail_release {
            return Err(DriverError::Device(format!("{}: port close failed", self.name)));
        }
        debug!("MockDriver {}: released", self.name);
        Ok(())
    }

    async fn apply(&mut self, state: &StateMap) -> Result<(), DriverError> {
        self.log.push(CallKind::Apply(state.clone())).await;
        if !self.acquired {
            return Err(DriverError::NotAcquired);
        }
        self.applies += 1;

        if !self.apply_delay.is_zero() {
            sleep(self.apply_delay).await;
        }
        if self.panic_on_apply == Some(self.applies) {
            panic!("MockDriver {}: simulated driver panic", self.name);
        }
        if self.fail_on_apply == Some(self.applies) {
            return Err(DriverError::Device(format!(
                "{}: simulated failure on apply #{}",
                self.name, self.applies
            )));
        }

        let values: Vec<String> = state.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        info!("MockDriver {}: {}", self.name, values.join(", "));
        Ok(())
    }
}

// =============================================================================
// MockSensor - Simulated Sensor
// =============================================================================

/// Mock sensor
///
/// Returns the configured readings in a cycle, or an increasing counter
/// (`0, 1, 2, ...`) when none are configured.
pub struct MockSensor {
    name: String,
    readings: Vec<serde_json::Value>,
    reads: usize,
    read_delay: Duration,
    fail_on_read: Option<usize>,
    acquired: bool,
    log: CallLog,
}

impl MockSensor {
    /// Create a mock sensor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readings: Vec::new(),
            reads: 0,
            read_delay: Duration::ZERO,
            fail_on_read: None,
            acquired: false,
            log: CallLog::default(),
        }
    }

    /// Readings returned in turn, cycling
    pub fn with_readings(mut self, readings: Vec<serde_json::Value>) -> Self {
        self.readings = readings;
        self
    }

    /// Every `read` takes `delay` before returning
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// The `n`-th read (1-based) fails with a device error
    pub fn failing_read(mut self, n: usize) -> Self {
        self.fail_on_read = Some(n);
        self
    }

    /// Handle on the call history, usable after the driver is moved
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl Driver for MockSensor {
    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            apply: false,
            read: true,
        }
    }

    async fn acquire(&mut self) -> Result<(), DriverError> {
        self.log.push(CallKind::Acquire).await;
        self.acquired = true;
        Ok(())
    }

    async fn release(&mut self) -> Result<(), DriverError> {
        self.log.push(CallKind::Release).await;
        if !self.acquired {
            return Err(DriverError::NotAcquired);
        }
        self.acquired = false;
        Ok(())
    }

    async fn read(&mut self) -> Result<serde_json::Value, DriverError> {
        self.log.push(CallKind::Read).await;
        if !self.acquired {
            return Err(DriverError::NotAcquired);
        }
        let index = self.reads;
        self.reads += 1;

        if !self.read_delay.is_zero() {
            sleep(self.read_delay).await;
        }
        if self.fail_on_read == Some(self.reads) {
            return Err(DriverError::Device(format!("{}: read failed", self.name)));
        }

        let value = if self.readings.is_empty() {
            json!(index)
        } else {
            self.readings[index % self.readings.len()].clone()
        };
        debug!("MockSensor {}: read {}", self.name, value);
        Ok(value)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Value;

    fn state(setting: i64) -> StateMap {
        StateMap::from([("setting".to_string(), Value::Integer(setting))])
    }

    #[tokio::test]
    async fn test_mock_driver_requires_acquire() {
        let mut driver = MockDriver::new("valve1");
        assert!(matches!(
            driver.apply(&state(1)).await,
            Err(DriverError::NotAcquired)
        ));

        driver.acquire().await.unwrap();
        driver.apply(&state(1)).await.unwrap();
        driver.release().await.unwrap();

        let log = driver.call_log();
        assert_eq!(log.applied().await, vec![state(1), state(1)]);
        assert_eq!(log.count(|k| matches!(k, CallKind::Release)).await, 1);
    }

    #[tokio::test]
    async fn test_mock_driver_fails_on_nth_apply() {
        let mut driver = MockDriver::new("pump1").failing_apply(2);
        driver.acquire().await.unwrap();
        assert!(driver.apply(&state(1)).await.is_ok());
        assert!(matches!(
            driver.apply(&state(2)).await,
            Err(DriverError::Device(_))
        ));
        assert!(driver.apply(&state(3)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_driver_apply_delay() {
        let mut driver = MockDriver::new("pump1").with_apply_delay(Duration::from_secs(2));
        driver.acquire().await.unwrap();
        let start = Instant::now();
        driver.apply(&state(1)).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_mock_driver_failing_acquire() {
        let mut driver = MockDriver::new("pump1").failing_acquire();
        assert!(driver.acquire().await.is_err());
        assert!(matches!(driver.release().await, Err(DriverError::NotAcquired)));
    }

    #[tokio::test]
    async fn test_mock_sensor_readings() {
        let mut sensor = MockSensor::new("ir").with_readings(vec![json!(1.0), json!(2.0)]);
        sensor.acquire().await.unwrap();
        assert_eq!(sensor.read().await.unwrap(), json!(1.0));
        assert_eq!(sensor.read().await.unwrap(), json!(2.0));
        assert_eq!(sensor.read().await.unwrap(), json!(1.0));

        let mut counter = MockSensor::new("thermo").failing_read(2);
        counter.acquire().await.unwrap();
        assert_eq!(counter.read().await.unwrap(), json!(0));
        assert!(counter.read().await.is_err());
    }
}
