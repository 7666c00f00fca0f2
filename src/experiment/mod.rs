//! Experiment files.
//!
//! Loads a TOML experiment document (see [`document`]) and turns it into the
//! three things a run needs:
//!
//! - an [`Apparatus`] built from `[[components]]` and `[[connections]]`
//! - a [`Protocol`] built from `[[procedures]]`
//! - a [`DriverMap`] built from each component's `driver` table
//!
//! # Example
//!
//! ```rust,ignore
//! use rust_flowlab::experiment::Experiment;
//!
//! let experiment = Experiment::load("prime.toml")?;
//! let schedule = experiment.protocol()?.compile()?;
//! let drivers = experiment.drivers(false)?;
//! ```

pub mod document;

pub use document::{ComponentKind, ComponentSpec, DriverSpec, ExperimentFile, ProcedureSpec};

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::apparatus::{Apparatus, Tube};
use crate::component::{ActiveComponent, Component};
use crate::error::{AppResult, FlowError};
use crate::executor::DriverMap;
use crate::hardware::mock::{MockDriver, MockSensor};
use crate::hardware::serial::SerialDriver;
use crate::hardware::Driver;
use crate::protocol::{Protocol, Step};

/// A parsed experiment with its apparatus assembled.
#[derive(Debug)]
pub struct Experiment {
    document: ExperimentFile,
    apparatus: Apparatus,
}

impl Experiment {
    /// Reads and assembles an experiment file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let experiment = Self::from_toml_str(&text)?;
        info!(
            path = %path.display(),
            components = experiment.document.components.len(),
            procedures = experiment.document.procedures.len(),
            "Loaded experiment"
        );
        Ok(experiment)
    }

    /// Parses an experiment from TOML text and builds its apparatus.
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let document: ExperimentFile =
            toml::from_str(text).map_err(|e| FlowError::Experiment(e.to_string()))?;
        let apparatus = build_apparatus(&document)?;
        Ok(Self {
            document,
            apparatus,
        })
    }

    /// The parsed document.
    pub fn document(&self) -> &ExperimentFile {
        &self.document
    }

    /// The apparatus described by the document.
    pub fn apparatus(&self) -> &Apparatus {
        &self.apparatus
    }

    /// Builds the protocol over this experiment's apparatus.
    pub fn protocol(&self) -> AppResult<Protocol<'_>> {
        let section = &self.document.protocol;
        let mut protocol = Protocol::new(&self.apparatus)?;
        if let Some(name) = &section.name {
            protocol = protocol.named(name.clone());
        }
        if !section.warn_unused {
            protocol = protocol.quiet();
        }
        if let Some(duration) = &section.duration {
            protocol.set_duration(duration)?;
        }

        for (index, spec) in self.document.procedures.iter().enumerate() {
            let targets = spec.targets();
            if targets.is_empty() {
                return Err(FlowError::Experiment(format!(
                    "procedure #{} names no component",
                    index + 1
                )));
            }
            protocol.add_all(targets, to_step(spec))?;
        }
        Ok(protocol)
    }

    /// Instantiates one driver per active component.
    ///
    /// With `dry_run` every component gets a mock regardless of its
    /// configured driver. Otherwise components without a `driver` table are
    /// left unbound so the executor reports them before acquiring anything.
    pub fn drivers(&self, dry_run: bool) -> AppResult<DriverMap> {
        let mut drivers = DriverMap::new();
        for spec in self.document.components.iter().filter(|c| c.kind.is_active()) {
            let sensor = matches!(spec.kind, ComponentKind::Sensor);
            let driver: Box<dyn Driver> = match (&spec.driver, dry_run) {
                (_, true) | (Some(DriverSpec::Mock { .. }), false) => mock_driver(spec, sensor),
                (Some(DriverSpec::Serial(config)), false) => {
                    Box::new(SerialDriver::new(config.clone())?)
                }
                (None, false) => {
                    debug!(component = %spec.name, "No driver configured");
                    continue;
                }
            };
            drivers.insert(spec.name.clone(), driver);
        }
        Ok(drivers)
    }
}

fn mock_driver(spec: &ComponentSpec, sensor: bool) -> Box<dyn Driver> {
    let (delay, readings) = match &spec.driver {
        Some(DriverSpec::Mock {
            apply_delay,
            readings,
        }) => (apply_delay.unwrap_or_default(), readings.clone()),
        _ => Default::default(),
    };
    if sensor {
        Box::new(MockSensor::new(&spec.name).with_readings(readings))
    } else {
        Box::new(MockDriver::new(&spec.name).with_apply_delay(delay))
    }
}

fn to_step(spec: &ProcedureSpec) -> Step {
    let mut step = Step::new();
    if let Some(start) = &spec.start {
        step = step.at(start.clone());
    }
    if let Some(stop) = &spec.stop {
        step = step.until(stop.clone());
    }
    if let Some(duration) = &spec.duration {
        step = step.lasting(duration.clone());
    }
    for (attribute, value) in &spec.set {
        step = step.set(attribute.clone(), value.clone());
    }
    step
}

fn build_apparatus(document: &ExperimentFile) -> AppResult<Apparatus> {
    let mut apparatus = match &document.protocol.name {
        Some(name) => Apparatus::named(name.clone()),
        None => Apparatus::new(),
    };

    for spec in &document.components {
        if !spec.kind.is_active() && spec.driver.is_some() {
            return Err(FlowError::Experiment(format!(
                "'{}' is a passive component and cannot have a driver",
                spec.name
            )));
        }

        let name = spec.name.clone();
        let active = match &spec.kind {
            ComponentKind::Pump => ActiveComponent::pump(name)?,
            ComponentKind::Valve { mapping, idle } => {
                ActiveComponent::valve(name, mapping.clone(), idle.clone())?
            }
            ComponentKind::TempControl => ActiveComponent::temp_control(name)?,
            ComponentKind::Sensor => ActiveComponent::sensor(name)?,
            ComponentKind::Vessel { description } => {
                let vessel = match description {
                    Some(d) => Component::vessel(d.clone()),
                    None => Component::new("Vessel"),
                };
                apparatus.add_component(vessel.named(name))?;
                continue;
            }
            ComponentKind::Mixer => {
                apparatus.add_component(Component::new("Mixer").named(name))?;
                continue;
            }
            ComponentKind::Fitting { kind } => {
                apparatus.add_component(Component::new(kind.clone()).named(name))?;
                continue;
            }
        };
        let active = match spec.driver.as_ref().and_then(DriverSpec::resource) {
            Some(resource) => active.with_resource(resource),
            None => active,
        };
        apparatus.add_component(Arc::new(active))?;
    }

    for connection in &document.connections {
        let tube = &connection.tube;
        let tube = Tube::new(&tube.length, &tube.id, &tube.od, tube.material.clone())?;
        apparatus.connect(&connection.from, &connection.to, tube)?;
    }
    Ok(apparatus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ProtocolDuration;
    use crate::error::{ApparatusError, CompileError};
    use std::time::Duration;

    const PRIME: &str = r#"
[protocol]
name = "prime"
duration = "30 s"

[[components]]
name = "water"
type = "vessel"
description = "degassed water"

[[components]]
name = "pump1"
type = "pump"
driver = { type = "mock" }

[[components]]
name = "ir"
type = "sensor"
driver = { type = "mock", readings = [0.1, 0.2] }

[[connections]]
from = "water"
to = "pump1"
tube = { length = "20 cm", id = "1 mm", od = "1/16 in" }

[[connections]]
from = "pump1"
to = "ir"
tube = { length = "10 cm", id = "1 mm", od = "1/16 in" }

[[procedures]]
component = "pump1"
start = "10 s"
stop = "20 s"
set = { rate = "5 mL/min" }
"#;

    #[test]
    fn builds_apparatus_and_protocol() {
        let experiment = Experiment::from_toml_str(PRIME).unwrap();
        assert_eq!(experiment.apparatus().name(), "prime");
        assert_eq!(experiment.apparatus().connections().len(), 2);

        let protocol = experiment.protocol().unwrap();
        assert_eq!(protocol.name(), "prime");
        assert_eq!(
            protocol.duration(),
            ProtocolDuration::Fixed(Duration::from_secs(30))
        );

        let schedule = protocol.compile().unwrap();
        let pump = schedule.timeline("pump1").unwrap();
        assert_eq!(pump.procedures.len(), 3);
        assert_eq!(pump.procedures[1].start, Duration::from_secs(10));
        assert_eq!(pump.procedures[1].end, Duration::from_secs(20));
        assert!(schedule.timeline("ir").is_some());
    }

    #[test]
    fn dry_run_binds_every_active_component() {
        let experiment = Experiment::from_toml_str(PRIME).unwrap();
        let drivers = experiment.drivers(true).unwrap();
        assert_eq!(drivers.len(), 2);
        assert!(drivers["ir"].capabilities().read);
        assert!(drivers["pump1"].capabilities().apply);
    }

    #[test]
    fn components_without_driver_stay_unbound() {
        let text = PRIME.replace("driver = { type = \"mock\" }\n", "");
        let experiment = Experiment::from_toml_str(&text).unwrap();
        let drivers = experiment.drivers(false).unwrap();
        assert!(!drivers.contains_key("pump1"));
        assert!(drivers.contains_key("ir"));
    }

    #[test]
    fn serial_ports_are_exclusive() {
        let text = r#"
[[components]]
name = "pump1"
type = "pump"
driver = { type = "serial", port = "/dev/ttyUSB0" }

[[components]]
name = "pump2"
type = "pump"
driver = { type = "serial", port = "/dev/ttyUSB0" }

[[connections]]
from = "pump1"
to = "pump2"
tube = { length = "5 cm", id = "0.5 mm", od = "1/16 in" }
"#;
        let experiment = Experiment::from_toml_str(text).unwrap();
        assert!(matches!(
            experiment.protocol(),
            Err(FlowError::Apparatus(ApparatusError::SharedResource { .. }))
        ));
    }

    #[test]
    fn malformed_files_are_reported() {
        assert!(matches!(
            Experiment::from_toml_str("[[components]]\nname = 3"),
            Err(FlowError::Experiment(_))
        ));

        let passive_driver = r#"
[[components]]
name = "water"
type = "vessel"
driver = { type = "mock" }
"#;
        assert!(matches!(
            Experiment::from_toml_str(passive_driver),
            Err(FlowError::Experiment(_))
        ));

        let bad_attribute = PRIME.replace("rate = \"5 mL/min\"", "speed = \"5 mL/min\"");
        let experiment = Experiment::from_toml_str(&bad_attribute).unwrap();
        assert!(matches!(
            experiment.protocol().and_then(|p| Ok(p.compile()?)),
            Err(FlowError::Compile(CompileError::InvalidAttribute { .. }))
        ));
    }
}
