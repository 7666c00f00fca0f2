//! Protocol declaration.
//!
//! A [`Protocol`] accumulates timed [`Step`]s against the active components of
//! an [`Apparatus`] and hands them to the [`Compiler`]. Timing is parsed when
//! a step is added; attribute values are left raw until compilation.
//!
//! ```rust,ignore
//! let mut protocol = Protocol::new(&apparatus)?.with_duration(Duration::from_secs(30));
//! protocol.add("pump1", Step::new().at("10 s").until("20 s").set("rate", "5 mL/min"))?;
//! let schedule = protocol.compile()?;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::apparatus::{Apparatus, Node};
use crate::compiler::{Compiler, ProtocolDuration, RawProcedure};
use crate::component::{ActiveComponent, AttributeKind, RawValue};
use crate::error::{ApparatusError, AppResult, CompileError};
use crate::schedule::{RenderFormat, Schedule};
use crate::units::{Dimension, QuantityParser, UnitRegistry};

static PROTOCOL_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A point in (or span of) protocol time.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeSpec {
    /// An exact offset.
    Elapsed(Duration),
    /// A time quantity such as `"5 seconds"` or `"1.5 min"`.
    Text(String),
}

impl TimeSpec {
    fn resolve(&self, parser: &dyn QuantityParser) -> Result<Duration, CompileError> {
        match self {
            TimeSpec::Elapsed(d) => Ok(*d),
            TimeSpec::Text(text) => Ok(parser.parse_duration(text)?),
        }
    }
}

impl From<Duration> for TimeSpec {
    fn from(value: Duration) -> Self {
        TimeSpec::Elapsed(value)
    }
}

impl From<&str> for TimeSpec {
    fn from(value: &str) -> Self {
        TimeSpec::Text(value.to_string())
    }
}

impl From<String> for TimeSpec {
    fn from(value: String) -> Self {
        TimeSpec::Text(value)
    }
}

/// One timed state assignment, before it is attached to a component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Step {
    start: Option<TimeSpec>,
    stop: Option<TimeSpec>,
    duration: Option<TimeSpec>,
    values: BTreeMap<String, RawValue>,
}

impl Step {
    /// A step starting at the beginning of the protocol with no stop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start time. Defaults to the beginning of the protocol.
    pub fn at(mut self, start: impl Into<TimeSpec>) -> Self {
        self.start = Some(start.into());
        self
    }

    /// Absolute stop time. Mutually exclusive with [`Step::lasting`].
    pub fn until(mut self, stop: impl Into<TimeSpec>) -> Self {
        self.stop = Some(stop.into());
        self
    }

    /// Stop relative to the start. Mutually exclusive with [`Step::until`].
    pub fn lasting(mut self, duration: impl Into<TimeSpec>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    /// Assigns `attribute` for the duration of the step.
    pub fn set(mut self, attribute: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.values.insert(attribute.into(), value.into());
        self
    }
}

/// An ordered collection of procedures for one apparatus.
#[derive(Debug)]
pub struct Protocol<'a> {
    apparatus: &'a Apparatus,
    name: String,
    duration: ProtocolDuration,
    procedures: Vec<RawProcedure>,
    warn_unused: bool,
}

impl<'a> Protocol<'a> {
    /// Creates a protocol named `Protocol_<n>`. The apparatus is validated first.
    pub fn new(apparatus: &'a Apparatus) -> Result<Self, ApparatusError> {
        apparatus.validate()?;
        Ok(Self {
            apparatus,
            name: format!(
                "Protocol_{}",
                PROTOCOL_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            duration: ProtocolDuration::Unset,
            procedures: Vec::new(),
            warn_unused: true,
        })
    }

    /// Replaces the auto-generated `Protocol_<n>` name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fixes the total duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = ProtocolDuration::Fixed(duration);
        self
    }

    /// Sets the duration from text: `"auto"` or a time quantity.
    pub fn set_duration(&mut self, duration: &str) -> Result<(), CompileError> {
        self.duration = if duration.trim() == "auto" {
            ProtocolDuration::Auto
        } else {
            ProtocolDuration::Fixed(UnitRegistry::global().parse_duration(duration)?)
        };
        Ok(())
    }

    /// Silences the warning about stateful components no procedure touches.
    pub fn quiet(mut self) -> Self {
        self.warn_unused = false;
        self
    }

    /// Protocol name; the compiled schedule carries it.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How the total duration will be determined.
    pub fn duration(&self) -> ProtocolDuration {
        self.duration
    }

    /// Procedures in insertion order.
    pub fn procedures(&self) -> &[RawProcedure] {
        &self.procedures
    }

    /// Adds `step` for one component.
    ///
    /// # Errors
    ///
    /// The component must be a stateful member of the apparatus, the step must
    /// set at least one attribute, and at most one of stop and duration may be
    /// given.
    pub fn add(&mut self, component: &str, step: Step) -> Result<(), CompileError> {
        let target = match self.apparatus.node(component) {
            Some(Node::Active(c)) if c.is_sensor() => {
                return Err(CompileError::SensorTargeted(component.to_string()))
            }
            Some(Node::Active(c)) => c,
            _ => {
                return Err(CompileError::UnknownComponent {
                    component: component.to_string(),
                    apparatus: self.apparatus.name().to_string(),
                })
            }
        };

        if step.values.is_empty() {
            return Err(CompileError::EmptyProcedure(component.to_string()));
        }
        if step.stop.is_some() && step.duration.is_some() {
            return Err(CompileError::InvalidTiming {
                component: component.to_string(),
                reason: "provide one of stop and duration, not both".into(),
            });
        }

        let parser = UnitRegistry::global();
        let start = match &step.start {
            Some(spec) => spec.resolve(parser)?,
            None => Duration::ZERO,
        };
        let stop = match (&step.stop, &step.duration) {
            (Some(stop), _) => Some(stop.resolve(parser)?),
            (None, Some(length)) => {
                let length = length.resolve(parser)?;
                let stop = start
                    .checked_add(length)
                    .ok_or_else(|| CompileError::InvalidTiming {
                        component: component.to_string(),
                        reason: "start plus duration overflows".into(),
                    })?;
                Some(stop)
            }
            (None, None) => None,
        };

        let values = complete_heater_state(target, step.values)?;

        self.procedures.push(RawProcedure {
            id: self.procedures.len(),
            component: component.to_string(),
            start,
            stop,
            values,
        });
        Ok(())
    }

    /// Adds the same step to several components.
    pub fn add_all<'c>(
        &mut self,
        components: impl IntoIterator<Item = &'c str>,
        step: Step,
    ) -> Result<(), CompileError> {
        for component in components {
            self.add(component, step.clone())?;
        }
        Ok(())
    }

    /// Compiles with the process-wide unit registry.
    pub fn compile(&self) -> Result<Schedule, CompileError> {
        self.compile_with(UnitRegistry::global())
    }

    /// Compiles with a custom quantity parser.
    pub fn compile_with(&self, parser: &dyn QuantityParser) -> Result<Schedule, CompileError> {
        let mut schedule = Compiler::new(parser)
            .warn_unused(self.warn_unused)
            .compile(self.apparatus, &self.procedures, self.duration)?;
        schedule.name = self.name.clone();
        Ok(schedule)
    }

    /// Compiles and renders the schedule.
    pub fn render(&self, format: RenderFormat) -> AppResult<String> {
        Ok(self.compile()?.render(format)?)
    }
}

/// Heaters expose a `temp` setpoint and an `active` switch. Setting only the
/// temperature switches the heater on; switching it off without a
/// temperature resets the setpoint to 0 degC.
fn complete_heater_state(
    component: &ActiveComponent,
    mut values: BTreeMap<String, RawValue>,
) -> Result<BTreeMap<String, RawValue>, CompileError> {
    let attributes = component.attributes();
    let is_heater = matches!(
        attributes.get("temp"),
        Some(AttributeKind::Quantity(Dimension::Temperature))
    ) && matches!(attributes.get("active"), Some(AttributeKind::Bool));
    if !is_heater {
        return Ok(values);
    }

    match (values.contains_key("temp"), values.get("active")) {
        (true, None) => {
            values.insert("active".into(), RawValue::Bool(true));
        }
        (false, Some(RawValue::Bool(false))) => {
            values.insert("temp".into(), RawValue::from("0 degC"));
        }
        (false, Some(RawValue::Bool(true))) => {
            return Err(CompileError::IncompleteProcedure {
                component: component.name().to_string(),
                reason: "activated without a temperature setting; specify 'temp'".into(),
            })
        }
        _ => {}
    }
    Ok(values)
}
