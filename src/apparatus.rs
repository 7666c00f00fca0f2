//! The apparatus graph: components plus the tubes that connect them.
//!
//! Only the checks the compiler and executor depend on live here: unique
//! names, connectivity, and exclusive ownership of physical resources. Two
//! active components configured against the same serial line (or device
//! address) are rejected at validation time rather than discovered by the
//! executor.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::component::{ActiveComponent, AttributeKind, Component};
use crate::error::ApparatusError;
use crate::units::{Dimension, Quantity, QuantityParser, UnitRegistry};

static APPARATUS_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A node of the apparatus graph.
#[derive(Debug, Clone)]
pub enum Node {
    /// Plain hardware with no state, e.g. a mixer or vessel.
    Passive(Component),
    /// A controllable or readable device.
    Active(Arc<ActiveComponent>),
}

impl Node {
    /// Name of the underlying component.
    pub fn name(&self) -> &str {
        match self {
            Node::Passive(c) => c.name(),
            Node::Active(c) => c.name(),
        }
    }

    /// Kind of the underlying component, e.g. `Pump`.
    pub fn kind(&self) -> &str {
        match self {
            Node::Passive(c) => c.kind(),
            Node::Active(c) => c.kind(),
        }
    }
}

impl From<Component> for Node {
    fn from(component: Component) -> Self {
        Node::Passive(component)
    }
}

impl From<ActiveComponent> for Node {
    fn from(component: ActiveComponent) -> Self {
        Node::Active(Arc::new(component))
    }
}

impl From<Arc<ActiveComponent>> for Node {
    fn from(component: Arc<ActiveComponent>) -> Self {
        Node::Active(component)
    }
}

/// A length of tubing between two components.
#[derive(Debug, Clone, PartialEq)]
pub struct Tube {
    length: Quantity,
    inner_diameter: Quantity,
    outer_diameter: Quantity,
    material: String,
}

impl Tube {
    /// Parses and checks the tube geometry. The outer diameter must exceed the inner one.
    pub fn new(
        length: &str,
        inner_diameter: &str,
        outer_diameter: &str,
        material: impl Into<String>,
    ) -> Result<Self, ApparatusError> {
        let registry = UnitRegistry::global();
        let parse_length = |s: &str| -> Result<Quantity, ApparatusError> {
            let q = registry.parse(s)?;
            if q.dimension() != Dimension::Length {
                return Err(ApparatusError::InvalidTube(format!(
                    "{} is an invalid unit of measurement for length",
                    q.unit()
                )));
            }
            Ok(q)
        };

        let length = parse_length(length)?;
        let inner_diameter = parse_length(inner_diameter)?;
        let outer_diameter = parse_length(outer_diameter)?;

        if outer_diameter.si_value() <= inner_diameter.si_value() {
            return Err(ApparatusError::InvalidTube(format!(
                "outer diameter {} must be greater than inner diameter {}",
                outer_diameter, inner_diameter
            )));
        }
        if length.si_value() < outer_diameter.si_value() {
            warn!(
                length = %length,
                "Tube length is less than its diameter. Make sure that this is not in error."
            );
        }

        Ok(Self {
            length,
            inner_diameter,
            outer_diameter,
            material: material.into(),
        })
    }

    /// Tube length.
    pub fn length(&self) -> &Quantity {
        &self.length
    }

    /// Inner diameter.
    pub fn inner_diameter(&self) -> &Quantity {
        &self.inner_diameter
    }

    /// Outer diameter.
    pub fn outer_diameter(&self) -> &Quantity {
        &self.outer_diameter
    }

    /// Tube material, e.g. `PFA`.
    pub fn material(&self) -> &str {
        &self.material
    }

    /// Internal volume in millilitres.
    pub fn volume_ml(&self) -> f64 {
        let radius = self.inner_diameter.si_value() / 2.0;
        PI * radius * radius * self.length.si_value() * 1e6
    }
}

/// A directed connection `from -> to` through `tube`.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Upstream component.
    pub from: String,
    /// Downstream component.
    pub to: String,
    /// Tubing between the two.
    pub tube: Tube,
}

/// A unique network of components.
#[derive(Debug, Clone)]
pub struct Apparatus {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    connections: Vec<Connection>,
}

impl Default for Apparatus {
    fn default() -> Self {
        Self::new()
    }
}

impl Apparatus {
    /// Creates an empty apparatus named `Apparatus_<n>`.
    pub fn new() -> Self {
        Self::named(format!(
            "Apparatus_{}",
            APPARATUS_COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    /// Creates an empty apparatus with an explicit name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            connections: Vec::new(),
        }
    }

    /// Apparatus name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a component. Names must be unique within the apparatus.
    pub fn add_component(&mut self, node: impl Into<Node>) -> Result<(), ApparatusError> {
        let node = node.into();
        if self.index.contains_key(node.name()) {
            return Err(ApparatusError::DuplicateName(node.name().to_string()));
        }
        self.index.insert(node.name().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Connects two already-added components.
    pub fn connect(&mut self, from: &str, to: &str, tube: Tube) -> Result<(), ApparatusError> {
        for name in [from, to] {
            if !self.index.contains_key(name) {
                return Err(ApparatusError::UnknownComponent(name.to_string()));
            }
        }
        self.connections.push(Connection {
            from: from.to_string(),
            to: to.to_string(),
            tube,
        });
        Ok(())
    }

    /// Components in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Connections in insertion order.
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Whether a component of that name was added.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Looks up any component by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Looks up an active component by name.
    pub fn active(&self, name: &str) -> Option<&Arc<ActiveComponent>> {
        match self.node(name)? {
            Node::Active(c) => Some(c),
            Node::Passive(_) => None,
        }
    }

    /// Active components keyed by name.
    pub fn active_components(&self) -> BTreeMap<&str, &Arc<ActiveComponent>> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Active(c) => Some((c.name(), c)),
                Node::Passive(_) => None,
            })
            .collect()
    }

    /// Total tubing volume in millilitres.
    pub fn tubing_volume_ml(&self) -> f64 {
        self.connections.iter().map(|c| c.tube.volume_ml()).sum()
    }

    /// Ensures the apparatus is usable by a protocol.
    ///
    /// # Errors
    ///
    /// - `Disconnected` when more than one component exists and the undirected
    ///   graph is not connected.
    /// - `InvalidMapping` when a setting attribute has no positions or maps two
    ///   names to the same port.
    /// - `SharedResource` when two active components claim the same resource.
    pub fn validate(&self) -> Result<(), ApparatusError> {
        if self.nodes.len() > 1 && !self.is_connected() {
            return Err(ApparatusError::Disconnected(self.name.clone()));
        }

        for component in self.active_components().values() {
            validate_mappings(component)?;
        }

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for component in self.active_components().values() {
            let Some(resource) = component.resource() else {
                continue;
            };
            if let Some(first) = owners.insert(resource, component.name()) {
                return Err(ApparatusError::SharedResource {
                    resource: resource.to_string(),
                    first: first.to_string(),
                    second: component.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for c in &self.connections {
            adjacency.entry(&c.from).or_default().push(&c.to);
            adjacency.entry(&c.to).or_default().push(&c.from);
        }

        let Some(first) = self.nodes.first() else {
            return true;
        };
        let mut seen = HashSet::from([first.name()]);
        let mut queue = VecDeque::from([first.name()]);
        while let Some(name) = queue.pop_front() {
            for next in adjacency.get(name).into_iter().flatten() {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.len() == self.nodes.len()
    }

    /// Human-readable description, one connection per line.
    pub fn describe(&self) -> String {
        let describe_node = |name: &str| match self.node(name) {
            Some(Node::Passive(c)) if c.kind() == "Vessel" => match c.description() {
                Some(d) => format!("a vessel containing {}", d),
                None => format!("vessel {}", c.name()),
            },
            Some(node) => format!("{} {}", node.kind(), node.name()),
            None => name.to_string(),
        };

        self.connections
            .iter()
            .map(|c| {
                format!(
                    "{} is connected to {} using {} tubing (length {}, ID {}, OD {}).",
                    describe_node(&c.from),
                    describe_node(&c.to),
                    c.tube.material(),
                    c.tube.length(),
                    c.tube.inner_diameter(),
                    c.tube.outer_diameter()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn validate_mappings(component: &ActiveComponent) -> Result<(), ApparatusError> {
    for (attribute, kind) in component.attributes() {
        let AttributeKind::Setting(mapping) = kind else {
            continue;
        };
        if mapping.is_empty() {
            return Err(ApparatusError::InvalidMapping {
                component: component.name().to_string(),
                reason: format!("'{}' declares no positions", attribute),
            });
        }
        let mut ports = HashSet::new();
        for (position, port) in mapping {
            if !ports.insert(*port) {
                return Err(ApparatusError::InvalidMapping {
                    component: component.name().to_string(),
                    reason: format!(
                        "port {} of '{}' is named twice (again as '{}')",
                        port, attribute, position
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tefzel(length: &str) -> Tube {
        Tube::new(length, "1.0 mm", "1/16 in", "Tefzel").unwrap()
    }

    #[test]
    fn tube_rejects_bad_geometry() {
        assert!(matches!(
            Tube::new("20 cm", "2 mm", "1 mm", "PFA"),
            Err(ApparatusError::InvalidTube(_))
        ));
        assert!(matches!(
            Tube::new("20 mL", "1 mm", "2 mm", "PFA"),
            Err(ApparatusError::InvalidTube(_))
        ));
    }

    #[test]
    fn tube_volume() {
        let tube = Tube::new("100 cm", "1 mm", "2 mm", "PFA").unwrap();
        // pi * (0.5 mm)^2 * 1000 mm = 785.4 uL
        assert!((tube.volume_ml() - 0.785_398).abs() < 1e-5);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut a = Apparatus::named("rig");
        a.add_component(ActiveComponent::pump("pump1").unwrap())
            .unwrap();
        let err = a
            .add_component(Component::new("Mixer").named("pump1"))
            .unwrap_err();
        assert_eq!(err, ApparatusError::DuplicateName("pump1".into()));
    }

    #[test]
    fn disconnected_apparatus_fails_validation() {
        let mut a = Apparatus::named("rig");
        a.add_component(Component::vessel("water").named("water")).unwrap();
        a.add_component(ActiveComponent::pump("pump1").unwrap()).unwrap();
        a.add_component(Component::new("Mixer").named("mixer")).unwrap();
        a.connect("water", "pump1", tefzel("20 cm")).unwrap();
        assert!(matches!(a.validate(), Err(ApparatusError::Disconnected(_))));

        a.connect("pump1", "mixer", tefzel("20 cm")).unwrap();
        assert!(a.validate().is_ok());
        assert!(a.describe().contains("a vessel containing water"));
    }

    #[test]
    fn shared_resources_are_rejected() {
        let mut a = Apparatus::named("rig");
        let pump = |name: &str| {
            ActiveComponent::builder("Pump")
                .named(name)
                .attribute(
                    "rate",
                    AttributeKind::Quantity(Dimension::VolumetricFlowRate),
                )
                .base("rate", "0 mL/min")
                .resource("/dev/ttyUSB0")
                .build()
                .unwrap()
        };
        a.add_component(pump("a")).unwrap();
        a.add_component(pump("b")).unwrap();
        a.connect("a", "b", tefzel("10 cm")).unwrap();
        assert!(matches!(
            a.validate(),
            Err(ApparatusError::SharedResource { .. })
        ));
    }

    #[test]
    fn valve_ports_must_be_unique() {
        let mapping = BTreeMap::from([("reactor".to_string(), 1), ("collect".to_string(), 1)]);
        let mut a = Apparatus::named("rig");
        a.add_component(ActiveComponent::valve("valve1", mapping, 1).unwrap())
            .unwrap();
        assert!(matches!(
            a.validate(),
            Err(ApparatusError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn connect_requires_known_components() {
        let mut a = Apparatus::named("rig");
        a.add_component(Component::new("Mixer").named("mixer")).unwrap();
        assert_eq!(
            a.connect("mixer", "ghost", tefzel("1 m")).unwrap_err(),
            ApparatusError::UnknownComponent("ghost".into())
        );
    }
}
