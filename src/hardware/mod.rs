//! Hardware driver contract.
//!
//! A [`Driver`] is the executor's only handle on a physical device. It is
//! owned by exactly one component task for the duration of a run:
//!
//! - `acquire` is called once per run; `release` is called once whenever
//!   `acquire` succeeded, on every exit path.
//! - `apply` pushes a full attribute mapping. Stateful components only.
//! - `read` returns one JSON value. Sensors only. Timestamping and logging
//!   are the executor's job.
//!
//! Drivers do not schedule anything themselves.

use async_trait::async_trait;

use crate::component::{ActiveComponent, Capability, StateMap};
use crate::error::DriverError;

pub mod mock;
pub mod serial;

/// What a driver implements beyond acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverCapabilities {
    /// `apply` is implemented.
    pub apply: bool,
    /// `read` is implemented.
    pub read: bool,
}

/// Async handle on one physical device; see the module docs for the call contract.
#[async_trait]
pub trait Driver: Send {
    /// Which optional operations this driver implements.
    fn capabilities(&self) -> DriverCapabilities;

    /// Opens and initializes the device.
    async fn acquire(&mut self) -> Result<(), DriverError>;

    /// Closes the device. Only called after a successful `acquire`.
    async fn release(&mut self) -> Result<(), DriverError>;

    /// Pushes a full attribute mapping to the device.
    async fn apply(&mut self, _state: &StateMap) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("apply"))
    }

    /// Takes one reading.
    async fn read(&mut self) -> Result<serde_json::Value, DriverError> {
        Err(DriverError::Unsupported("read"))
    }
}

/// Checks that `driver` can serve `component`.
///
/// The component must be facially valid, a stateful component needs `apply`,
/// and a sensor needs `read`.
pub fn validate_binding(component: &ActiveComponent, driver: &dyn Driver) -> Result<(), String> {
    if !component.validate() {
        return Err("component base state is missing or invalid".into());
    }
    let caps = driver.capabilities();
    match component.capability() {
        Capability::Stateful if !caps.apply => Err("driver does not implement apply".into()),
        Capability::Sensor if !caps.read => Err("driver does not implement read".into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockDriver, MockSensor};
    use super::*;

    #[test]
    fn bindings_follow_capability() {
        let pump = ActiveComponent::pump("pump1").unwrap();
        let sensor = ActiveComponent::sensor("ir").unwrap();

        assert!(validate_binding(&pump, &MockDriver::new("pump1")).is_ok());
        assert!(validate_binding(&pump, &MockSensor::new("pump1")).is_err());
        assert!(validate_binding(&sensor, &MockSensor::new("ir")).is_ok());
        assert!(validate_binding(&sensor, &MockDriver::new("ir")).is_err());
    }
}
