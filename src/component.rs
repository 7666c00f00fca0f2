//! Apparatus components and their schedulable state.
//!
//! A [`Component`] is an inert node (a vessel, a mixer) that only carries an
//! identity. An [`ActiveComponent`] additionally declares a schema of
//! attributes, a base (idle) state, and one capability tag:
//!
//! - [`Capability::Stateful`] components accept state changes (`apply`).
//! - [`Capability::Sensor`] components produce readings (`read`) and are never
//!   the target of a procedure.
//!
//! The capability is resolved once at construction; there is no subtype
//! hierarchy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::CompileError;
use crate::units::{Dimension, Quantity, QuantityParser, UnitRegistry};

/// Resolved attribute mapping pushed to a driver.
pub type StateMap = BTreeMap<String, Value>;

static AUTO_NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn auto_name(kind: &str) -> String {
    format!("{}_{}", kind, AUTO_NAME_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// An attribute value as written by the user, before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// `true` or `false`.
    Bool(bool),
    /// A bare integer, e.g. a valve port number.
    Integer(i64),
    /// Anything else: a quantity like `"5 mL/min"` or a setting name.
    Text(String),
}

impl RawValue {
    fn type_name(&self) -> &'static str {
        match self {
            RawValue::Bool(_) => "boolean",
            RawValue::Integer(_) => "integer",
            RawValue::Text(_) => "text",
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Integer(value)
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Bool(b) => write!(f, "{}", b),
            RawValue::Integer(i) => write!(f, "{}", i),
            RawValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A resolved, validated attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// A parsed physical quantity.
    Quantity(Quantity),
    /// A boolean flag.
    Bool(bool),
    /// An integer, including resolved settings.
    Integer(i64),
    /// Free text.
    Text(String),
}

impl Value {
    /// The quantity, if this is one.
    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            Value::Quantity(q) => Some(q),
            _ => None,
        }
    }

    /// The flag, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Quantity(q) => write!(f, "{}", q),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// What an attribute accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    /// A quantity string of the given dimension.
    Quantity(Dimension),
    /// A boolean.
    Bool,
    /// An integer.
    Integer,
    /// Free text.
    Text,
    /// Named positions (e.g. valve ports) mapped to integers. Raw integers are accepted too.
    Setting(BTreeMap<String, i64>),
}

impl AttributeKind {
    fn describe(&self) -> String {
        match self {
            AttributeKind::Quantity(dim) => dim.to_string(),
            AttributeKind::Bool => "boolean".into(),
            AttributeKind::Integer => "integer".into(),
            AttributeKind::Text => "text".into(),
            AttributeKind::Setting(map) => format!(
                "one of [{}] or an integer",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

/// Capability tag of an active component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accepts scheduled state via `apply`.
    Stateful,
    /// Only read, never scheduled.
    Sensor,
}

/// An inert apparatus node (vessel, mixer, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    name: String,
    kind: String,
    description: Option<String>,
}

impl Component {
    /// Creates a component of `kind` with an auto-generated name such as `Mixer_3`.
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            name: auto_name(&kind),
            kind,
            description: None,
        }
    }

    /// A vessel holding `description` (e.g. `"p-toluenesulfinate 2M in DMAc"`).
    pub fn vessel(description: impl Into<String>) -> Self {
        Self::new("Vessel").with_description(description)
    }

    /// Replaces the auto-generated name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attaches a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Unique name within an apparatus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind such as `Mixer` or `Vessel`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Shared handle to a component's live attribute mapping.
///
/// The executor writes through it during a run; the user may edit it only
/// before a run starts.
#[derive(Debug, Clone, Default)]
pub struct LiveState(Arc<RwLock<StateMap>>);

impl LiveState {
    fn new(state: StateMap) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    /// Snapshot of the current mapping.
    pub fn snapshot(&self) -> StateMap {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Overlays `state` on the live mapping.
    pub fn update(&self, state: &StateMap) {
        let mut live = self.0.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in state {
            live.insert(key.clone(), value.clone());
        }
    }
}

/// A component with schedulable attributes and a base state.
#[derive(Debug)]
pub struct ActiveComponent {
    name: String,
    kind: String,
    capability: Capability,
    attributes: BTreeMap<String, AttributeKind>,
    base_state: StateMap,
    resource: Option<String>,
    live: LiveState,
}

impl ActiveComponent {
    /// Starts building an active component of `kind`.
    pub fn builder(kind: impl Into<String>) -> ActiveComponentBuilder {
        ActiveComponentBuilder {
            kind: kind.into(),
            name: None,
            capability: Capability::Stateful,
            attributes: BTreeMap::new(),
            base: Vec::new(),
            resource: None,
        }
    }

    /// A pump with a `rate` attribute idling at `0 mL/min`.
    pub fn pump(name: impl Into<String>) -> Result<Self, CompileError> {
        Self::builder("Pump")
            .named(name)
            .attribute("rate", AttributeKind::Quantity(Dimension::VolumetricFlowRate))
            .base("rate", "0 mL/min")
            .build()
    }

    /// A multi-port valve whose `setting` accepts the named ports in `mapping`.
    pub fn valve(
        name: impl Into<String>,
        mapping: BTreeMap<String, i64>,
        idle: impl Into<RawValue>,
    ) -> Result<Self, CompileError> {
        Self::builder("Valve")
            .named(name)
            .attribute("setting", AttributeKind::Setting(mapping))
            .base("setting", idle)
            .build()
    }

    /// A temperature controller, off and at `0 degC` when idle.
    pub fn temp_control(name: impl Into<String>) -> Result<Self, CompileError> {
        Self::builder("TempControl")
            .named(name)
            .attribute("temp", AttributeKind::Quantity(Dimension::Temperature))
            .attribute("active", AttributeKind::Bool)
            .base("temp", "0 degC")
            .base("active", false)
            .build()
    }

    /// A sensor with no schedulable attributes.
    pub fn sensor(name: impl Into<String>) -> Result<Self, CompileError> {
        Self::builder("Sensor").named(name).sensor().build()
    }

    /// Records the physical resource (serial line, address) the driver will own.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Unique name within an apparatus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind such as `Pump` or `Valve`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Whether the component is scheduled or only read.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Shorthand for a `Sensor` capability.
    pub fn is_sensor(&self) -> bool {
        self.capability == Capability::Sensor
    }

    /// Schedulable attributes and what each accepts.
    pub fn attributes(&self) -> &BTreeMap<String, AttributeKind> {
        &self.attributes
    }

    /// The idle state held outside procedures and restored after a run.
    pub fn base_state(&self) -> &StateMap {
        &self.base_state
    }

    /// Physical resource (serial line, MAC address, ...) the component's driver owns.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Last state successfully applied to the device.
    pub fn live(&self) -> &LiveState {
        &self.live
    }

    /// Resolves one raw attribute value against this component's schema.
    pub fn resolve(
        &self,
        attribute: &str,
        raw: &RawValue,
        parser: &dyn QuantityParser,
    ) -> Result<Value, CompileError> {
        let kind = self
            .attributes
            .get(attribute)
            .ok_or_else(|| CompileError::InvalidAttribute {
                component: self.name.clone(),
                attribute: attribute.to_string(),
                valid: self.attributes.keys().cloned().collect(),
            })?;
        resolve_value(&self.name, attribute, kind, raw, parser)
    }

    /// Resolves a whole raw mapping.
    pub fn resolve_all(
        &self,
        values: &BTreeMap<String, RawValue>,
        parser: &dyn QuantityParser,
    ) -> Result<StateMap, CompileError> {
        values
            .iter()
            .map(|(attr, raw)| Ok((attr.clone(), self.resolve(attr, raw, parser)?)))
            .collect()
    }

    /// Facial validity: base-state keys are declared attributes of the right
    /// type, and a stateful component has a non-empty base state.
    pub fn validate(&self) -> bool {
        if self.capability == Capability::Stateful && self.base_state.is_empty() {
            return false;
        }
        self.base_state.iter().all(|(attr, value)| {
            match (self.attributes.get(attr), value) {
                (Some(AttributeKind::Quantity(dim)), Value::Quantity(q)) => q.dimension() == *dim,
                (Some(AttributeKind::Bool), Value::Bool(_)) => true,
                (Some(AttributeKind::Integer | AttributeKind::Setting(_)), Value::Integer(_)) => {
                    true
                }
                (Some(AttributeKind::Text), Value::Text(_)) => true,
                _ => false,
            }
        })
    }
}

impl fmt::Display for ActiveComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

fn resolve_value(
    component: &str,
    attribute: &str,
    kind: &AttributeKind,
    raw: &RawValue,
    parser: &dyn QuantityParser,
) -> Result<Value, CompileError> {
    let type_mismatch = || CompileError::TypeMismatch {
        component: component.to_string(),
        attribute: attribute.to_string(),
        expected: kind.describe(),
        found: format!("{} ({})", raw, raw.type_name()),
    };

    match (kind, raw) {
        (AttributeKind::Quantity(expected), RawValue::Text(text)) => {
            let quantity = parser.parse(text)?;
            if quantity.dimension() != *expected {
                return Err(CompileError::DimensionMismatch {
                    component: component.to_string(),
                    attribute: attribute.to_string(),
                    expected: expected.to_string(),
                    found: quantity.dimension().to_string(),
                });
            }
            Ok(Value::Quantity(quantity))
        }
        (AttributeKind::Bool, RawValue::Bool(b)) => Ok(Value::Bool(*b)),
        (AttributeKind::Integer, RawValue::Integer(i)) => Ok(Value::Integer(*i)),
        (AttributeKind::Text, RawValue::Text(s)) => Ok(Value::Text(s.clone())),
        (AttributeKind::Setting(_), RawValue::Integer(i)) => Ok(Value::Integer(*i)),
        (AttributeKind::Setting(mapping), RawValue::Text(name)) => mapping
            .get(name)
            .map(|port| Value::Integer(*port))
            .ok_or_else(type_mismatch),
        _ => Err(type_mismatch()),
    }
}

/// Builder for [`ActiveComponent`]; the base state is validated on `build`.
#[derive(Debug, Clone)]
pub struct ActiveComponentBuilder {
    kind: String,
    name: Option<String>,
    capability: Capability,
    attributes: BTreeMap<String, AttributeKind>,
    base: Vec<(String, RawValue)>,
    resource: Option<String>,
}

impl ActiveComponentBuilder {
    /// Names the component. Required.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Declares a schedulable attribute.
    pub fn attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.insert(name.into(), kind);
        self
    }

    /// Adds `attribute = value` to the base state.
    pub fn base(mut self, attribute: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.base.push((attribute.into(), value.into()));
        self
    }

    /// Records the physical resource the driver will own.
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Marks the component as a sensor.
    pub fn sensor(mut self) -> Self {
        self.capability = Capability::Sensor;
        self
    }

    /// Builds with the process-wide unit registry.
    pub fn build(self) -> Result<ActiveComponent, CompileError> {
        self.build_with(UnitRegistry::global())
    }

    /// Builds, resolving the base state with `parser`.
    pub fn build_with(self, parser: &dyn QuantityParser) -> Result<ActiveComponent, CompileError> {
        let name = self.name.unwrap_or_else(|| auto_name(&self.kind));

        if self.capability == Capability::Stateful && self.base.is_empty() {
            return Err(CompileError::InvalidBaseState {
                component: name,
                reason: "a stateful component must declare a base state".into(),
            });
        }

        let mut base_state = StateMap::new();
        for (attribute, raw) in &self.base {
            let kind = self.attributes.get(attribute).ok_or_else(|| {
                CompileError::InvalidBaseState {
                    component: name.clone(),
                    reason: format!("'{}' is not a declared attribute", attribute),
                }
            })?;
            let value = resolve_value(&name, attribute, kind, raw, parser)?;
            base_state.insert(attribute.clone(), value);
        }

        Ok(ActiveComponent {
            live: LiveState::new(base_state.clone()),
            name,
            kind: self.kind,
            capability: self.capability,
            attributes: self.attributes,
            base_state,
            resource: self.resource,
        })
    }
}
