//! Experiment file model.
//!
//! An experiment file is a TOML document describing the apparatus, the
//! driver behind each active component, and the protocol:
//!
//! ```toml
//! [protocol]
//! name = "prime"
//! duration = "30 seconds"   # or "auto"; omit to infer from closed procedures
//!
//! [[components]]
//! name = "water"
//! type = "vessel"
//! description = "degassed water"
//!
//! [[components]]
//! name = "pump1"
//! type = "pump"
//! driver = { type = "mock" }
//!
//! [[connections]]
//! from = "water"
//! to = "pump1"
//! tube = { length = "20 cm", id = "1 mm", od = "1/16 in", material = "PFA" }
//!
//! [[procedures]]
//! component = "pump1"
//! start = "10 s"
//! stop = "20 s"
//! set = { rate = "5 mL/min" }
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::component::RawValue;
use crate::hardware::serial::SerialConfig;

/// Top-level experiment document
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    /// `[protocol]` table
    #[serde(default)]
    pub protocol: ProtocolSection,
    /// `[[components]]` entries, added in order
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    /// `[[connections]]` entries
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
    /// `[[procedures]]` entries, added in order
    #[serde(default)]
    pub procedures: Vec<ProcedureSpec>,
}

/// `[protocol]` table
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolSection {
    /// Protocol and apparatus name
    pub name: Option<String>,
    /// `"auto"` or a time quantity
    pub duration: Option<String>,
    /// Warn about stateful components no procedure uses
    #[serde(default = "default_true")]
    pub warn_unused: bool,
}

fn default_true() -> bool {
    true
}

/// One apparatus node
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSpec {
    /// Unique component name
    pub name: String,
    /// Kind and kind-specific settings, tagged by `type`
    #[serde(flatten)]
    pub kind: ComponentKind,
    /// Required for active components unless the run is a dry run
    #[serde(default)]
    pub driver: Option<DriverSpec>,
}

/// Component kinds understood by experiment files
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentKind {
    /// Pump with a `rate` attribute
    Pump,
    /// Multi-port valve with a `setting` attribute
    Valve {
        /// Position name to port number
        mapping: BTreeMap<String, i64>,
        /// Base-state position (name or port)
        idle: RawValue,
    },
    /// Heater with `temp` and `active` attributes
    TempControl,
    /// Read-only sensor
    Sensor,
    /// Passive reagent or product vessel
    Vessel {
        /// Contents, e.g. `"toluene"`
        #[serde(default)]
        description: Option<String>,
    },
    /// Passive mixing tee
    Mixer,
    /// Any other passive fitting, named by `kind`
    Fitting {
        /// Free-form kind name
        kind: String,
    },
}

impl ComponentKind {
    /// Whether the kind becomes an active component
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ComponentKind::Pump
                | ComponentKind::Valve { .. }
                | ComponentKind::TempControl
                | ComponentKind::Sensor
        )
    }
}

/// Driver selection for an active component
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverSpec {
    /// Simulated device
    Mock {
        /// Latency of every apply
        #[serde(default, with = "humantime_serde")]
        apply_delay: Option<Duration>,
        /// Cycled sensor readings
        #[serde(default)]
        readings: Vec<serde_json::Value>,
    },
    /// Templated line protocol over a serial port
    Serial(SerialConfig),
}

impl DriverSpec {
    /// Physical resource claimed by this driver, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            DriverSpec::Mock { .. } => None,
            DriverSpec::Serial(config) => Some(&config.port),
        }
    }
}

/// One tube between two components
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSpec {
    /// Upstream component
    pub from: String,
    /// Downstream component
    pub to: String,
    /// Tube geometry
    pub tube: TubeSpec,
}

/// Tube geometry as quantity strings
#[derive(Debug, Clone, Deserialize)]
pub struct TubeSpec {
    /// e.g. `"1 m"`
    pub length: String,
    /// Inner diameter
    pub id: String,
    /// Outer diameter
    pub od: String,
    /// Defaults to PFA
    #[serde(default = "default_material")]
    pub material: String,
}

fn default_material() -> String {
    "PFA".to_string()
}

/// One `add` call
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcedureSpec {
    /// Single target
    #[serde(default)]
    pub component: Option<String>,
    /// Several targets sharing the same step
    #[serde(default)]
    pub components: Vec<String>,
    /// Start time, defaults to 0
    #[serde(default)]
    pub start: Option<String>,
    /// Stop time; exclusive with `duration`
    #[serde(default)]
    pub stop: Option<String>,
    /// Length from start; exclusive with `stop`
    #[serde(default)]
    pub duration: Option<String>,
    /// Attribute assignments
    #[serde(default)]
    pub set: BTreeMap<String, RawValue>,
}

impl ProcedureSpec {
    /// Every targeted component, single and list forms combined.
    pub fn targets(&self) -> Vec<&str> {
        self.component
            .iter()
            .chain(self.components.iter())
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_components_and_drivers() {
        let file: ExperimentFile = toml::from_str(
            r#"
[protocol]
duration = "auto"

[[components]]
name = "valve1"
type = "valve"
mapping = { reactor = 1, waste = 2 }
idle = "waste"
driver = { type = "mock", apply_delay = "20ms" }

[[components]]
name = "pump1"
type = "pump"

[components.driver]
type = "serial"
port = "/dev/ttyUSB0"

[[components.driver.commands]]
attribute = "rate"
template = "FLOW {value}"

[[components]]
name = "outlet"
type = "fitting"
kind = "BackPressureRegulator"

[[procedures]]
components = ["pump1"]
stop = "1 min"
set = { rate = "1 mL/min" }
"#,
        )
        .unwrap();

        assert_eq!(file.protocol.duration.as_deref(), Some("auto"));
        assert!(file.protocol.warn_unused);
        assert_eq!(file.components.len(), 3);
        match &file.components[0].kind {
            ComponentKind::Valve { mapping, idle } => {
                assert_eq!(mapping["waste"], 2);
                assert_eq!(idle, &RawValue::from("waste"));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        match &file.components[0].driver {
            Some(DriverSpec::Mock { apply_delay, .. }) => {
                assert_eq!(*apply_delay, Some(Duration::from_millis(20)))
            }
            other => panic!("unexpected driver: {other:?}"),
        }
        assert_eq!(
            file.components[1].driver.as_ref().and_then(|d| d.resource()),
            Some("/dev/ttyUSB0")
        );
        assert!(!file.components[2].kind.is_active());
        assert_eq!(file.procedures[0].targets(), vec!["pump1"]);
    }

    #[test]
    fn unknown_procedure_keys_are_rejected() {
        let result: Result<ExperimentFile, _> = toml::from_str(
            r#"
[[procedures]]
component = "pump1"
rate = "1 mL/min"
"#,
        );
        assert!(result.is_err());
    }
}
