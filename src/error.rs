//! Custom error types for the application.
//!
//! Every failure the crate can report lives here, grouped by the stage that
//! produces it. Using the `thiserror` crate, each stage gets its own enum and
//! the top-level `FlowError` consolidates them so callers can use `?` across
//! stage boundaries.
//!
//! ## Error Hierarchy
//!
//! - **`UnitParseError`**: a quantity string could not be parsed. Raised
//!   immediately and never retried.
//! - **`CompileError`**: everything that can go wrong between declaring a
//!   protocol and obtaining a schedule (unknown attributes, dimension
//!   mismatches, overlapping assignments, timing mistakes). Compilation is
//!   all-or-nothing: no partial schedule is ever produced.
//! - **`ApparatusError`**: structural problems in the apparatus graph, such as
//!   duplicate names or two components claiming the same physical line.
//! - **`DriverError`**: hardware I/O failures raised by drivers during
//!   `acquire`/`apply`/`read`/`release`. These are isolated per component by
//!   the executor.
//! - **`RunFailed`**: aggregate returned once every component of a run has
//!   been released, listing the components that ended in error.
//! - **`StorageError`**: failures writing the experiment data log.
//! - **`ConfigError`**: lives in [`crate::config`], next to the figment loader.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FlowError>;

/// Top-level error returned by the library's entry points.
#[derive(Error, Debug)]
pub enum FlowError {
    /// A quantity string could not be parsed.
    #[error(transparent)]
    UnitParse(#[from] UnitParseError),

    /// Protocol compilation failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The apparatus graph is invalid.
    #[error(transparent)]
    Apparatus(#[from] ApparatusError),

    /// A driver call failed outside a run.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// One or more components failed during a run.
    #[error(transparent)]
    RunFailed(#[from] RunFailed),

    /// The data log or a rendered schedule could not be written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A scheduled component has no driver.
    #[error("No driver bound to component '{0}'")]
    MissingDriver(String),

    /// A driver lacks a capability its component needs.
    #[error("Driver bound to component '{component}' is not valid for it: {reason}")]
    InvalidBinding {
        /// Component the driver was bound to.
        component: String,
        /// Missing capability.
        reason: String,
    },

    /// The schedule runs past the end of the run clock.
    #[error("Run duration {0:?} cannot be represented by the run clock")]
    DurationOutOfRange(Duration),

    /// The experiment file is malformed or inconsistent.
    #[error("Experiment file error: {0}")]
    Experiment(String),

    /// Reading an experiment or config file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A quantity string that the unit registry could not understand.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Cannot parse quantity '{input}': {reason}")]
pub struct UnitParseError {
    /// The offending input, verbatim.
    pub input: String,
    /// Human-readable cause.
    pub reason: String,
}

impl UnitParseError {
    /// Creates an error for `input`.
    pub fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Short description of a raw procedure, used to name both sides of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureSummary {
    /// Insertion index of the procedure within its protocol.
    pub index: usize,
    /// Start offset.
    pub start: Duration,
    /// `None` when the stop time was left open and could not be resolved.
    pub stop: Option<Duration>,
    /// Attributes the procedure sets.
    pub attributes: Vec<String>,
}

impl fmt::Display for ProcedureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{:?}, ", self.index, self.start)?;
        match self.stop {
            Some(stop) => write!(f, "{:?})", stop)?,
            None => write!(f, "open)")?,
        }
        write!(f, " {{{}}}", self.attributes.join(", "))
    }
}

/// Errors raised while declaring or compiling a protocol.
///
/// Field names are shared across variants: `component` is always the target
/// component's name and `reason` a human-readable cause.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    UnitParse(#[from] UnitParseError),

    /// The attribute is not part of the component's schema.
    #[error("Invalid attribute '{attribute}' for {component}. Valid attributes are [{}]", .valid.join(", "))]
    InvalidAttribute {
        component: String,
        attribute: String,
        valid: Vec<String>,
    },

    /// A quantity has the wrong physical dimension.
    #[error("Bad dimensionality of '{attribute}' for {component}: expected {expected} but got {found}")]
    DimensionMismatch {
        component: String,
        attribute: String,
        expected: String,
        found: String,
    },

    /// A value is not of the attribute's kind.
    #[error("Bad type for '{attribute}' on {component}: expected {expected}, got {found}")]
    TypeMismatch {
        component: String,
        attribute: String,
        expected: String,
        found: String,
    },

    /// Two procedures set the same attribute over intersecting ranges.
    #[error("Conflicting procedures on {component}: {first} overlaps {second}")]
    ProcedureConflict {
        component: String,
        first: ProcedureSummary,
        second: ProcedureSummary,
    },

    #[error("{component} is not an active component of {apparatus}")]
    UnknownComponent { component: String, apparatus: String },

    #[error("{0} is a sensor and cannot be the target of a procedure")]
    SensorTargeted(String),

    #[error("No attributes supplied for {0}. An empty procedure does not change any state")]
    EmptyProcedure(String),

    #[error("Invalid timing for {component}: {reason}")]
    InvalidTiming { component: String, reason: String },

    /// A start or end lies past the protocol duration. `edge` is `"start"` or `"end"`.
    #[error("Procedure on {component} cannot {edge} at {at:?}, which is outside the protocol duration ({duration:?})")]
    OutOfRange {
        component: String,
        edge: &'static str,
        at: Duration,
        duration: Duration,
    },

    #[error("Unable to determine protocol duration: {0}")]
    UndeterminedDuration(String),

    #[error("Cannot infer when the procedure on {component} starting at {start:?} stops: no later procedure sets any of its attributes and the protocol duration is unset")]
    AmbiguousStop { component: String, start: Duration },

    /// A heater procedure turns heating on without a temperature.
    #[error("Incomplete procedure for {component}: {reason}")]
    IncompleteProcedure { component: String, reason: String },

    #[error("Invalid base state for {component}: {reason}")]
    InvalidBaseState { component: String, reason: String },
}

/// Errors raised while building or validating an apparatus.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApparatusError {
    /// Names must be unique within an apparatus.
    #[error("A component named '{0}' is already part of the apparatus")]
    DuplicateName(String),

    /// No node by that name.
    #[error("No component named '{0}' in the apparatus")]
    UnknownComponent(String),

    /// The graph has more than one connected part. Holds the apparatus name.
    #[error("Unable to validate {0}: not all components are connected")]
    Disconnected(String),

    /// Two components name the same physical resource.
    #[error("Components '{first}' and '{second}' are both configured against resource '{resource}'")]
    SharedResource {
        /// The contested resource, e.g. a serial port.
        resource: String,
        /// First component claiming it.
        first: String,
        /// Second component claiming it.
        second: String,
    },

    /// Bad tube geometry or units.
    #[error("Invalid tube: {0}")]
    InvalidTube(String),

    /// A valve setting mapping is empty or its idle setting is missing.
    #[error("Invalid setting mapping for '{component}': {reason}")]
    InvalidMapping {
        /// The valve.
        component: String,
        /// What is wrong with the mapping.
        reason: String,
    },

    /// A tube dimension could not be parsed.
    #[error(transparent)]
    UnitParse(#[from] UnitParseError),
}

/// Errors raised by hardware drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device reported or caused a failure.
    #[error("Device error: {0}")]
    Device(String),

    /// The driver does not implement this operation.
    #[error("Driver does not support '{0}'")]
    Unsupported(&'static str),

    /// An operation exceeded its time bound.
    #[error("'{operation}' timed out after {after:?}")]
    Timeout {
        /// `"acquire"`, `"restore"` or a device command.
        operation: &'static str,
        /// The bound that was exceeded.
        after: Duration,
    },

    /// Called before `acquire` succeeded.
    #[error("Resource has not been acquired")]
    NotAcquired,

    /// The device's reply did not match the expected pattern.
    #[error("Unexpected response from device: {0}")]
    Protocol(String),

    /// The driver needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

/// Aggregate failure of a run, surfaced only after every component was released.
#[derive(Error, Debug)]
pub struct RunFailed {
    /// Component name paired with the error that forced it into restoration.
    pub failures: Vec<(String, DriverError)>,
}

impl RunFailed {
    /// Names of the failing components, in report order.
    pub fn components(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

impl fmt::Display for RunFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run failed for {} component(s):", self.failures.len())?;
        for (name, err) in &self.failures {
            write!(f, " [{}: {}]", name, err)?;
        }
        Ok(())
    }
}

/// Errors raised while writing logs or rendering schedules.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The format was compiled out; see the `storage_csv` feature.
    #[error("Storage format '{0}' is not available in this build")]
    FormatUnavailable(String),
}
