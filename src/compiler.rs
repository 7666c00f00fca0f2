//! Protocol compiler.
//!
//! [`Compiler::compile`] turns raw timed procedures into a [`Schedule`]:
//!
//! 1. Resolve the protocol duration (fixed, `auto`, or unset).
//! 2. Group procedures by target component and sort them by start time.
//! 3. Resolve every attribute value against the component schema. This is the
//!    only place the unit parser is called.
//! 4. Infer open stop times and validate timing.
//! 5. Reject same-attribute overlaps, naming both procedures.
//! 6. Cut `[0, duration]` at every start and stop, overlaying the covering
//!    procedures on the base state. Uncovered segments carry the base state.
//!
//! Compilation is all-or-nothing; the first error aborts it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::apparatus::{Apparatus, Node};
use crate::component::{ActiveComponent, RawValue, StateMap};
use crate::error::{CompileError, ProcedureSummary};
use crate::schedule::{CompiledTimeline, Origin, Procedure, Schedule};
use crate::units::QuantityParser;

/// A timed assignment as declared by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProcedure {
    /// Insertion index within the protocol.
    pub id: usize,
    /// Target component.
    pub component: String,
    /// Offset from the run origin.
    pub start: Duration,
    /// `None` continues until the next procedure setting one of the same
    /// attributes, or the end of the protocol.
    pub stop: Option<Duration>,
    /// Attribute assignments, unresolved.
    pub values: BTreeMap<String, RawValue>,
}

impl RawProcedure {
    fn summary(&self, stop: Option<Duration>) -> ProcedureSummary {
        ProcedureSummary {
            index: self.id,
            start: self.start,
            stop,
            attributes: self.values.keys().cloned().collect(),
        }
    }

    fn shares_attribute(&self, other: &RawProcedure) -> bool {
        self.values.keys().any(|k| other.values.contains_key(k))
    }
}

/// How the protocol's total duration is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolDuration {
    /// Set explicitly; every procedure must fit inside it.
    Fixed(Duration),
    /// The latest explicit stop of any procedure.
    Auto,
    /// Every procedure must close, either explicitly or by a following
    /// procedure; the duration is the latest stop.
    #[default]
    Unset,
}

/// A raw procedure after value resolution and stop inference.
struct Resolved<'r> {
    raw: &'r RawProcedure,
    stop: Duration,
    state: StateMap,
}

/// Compiles raw procedures against an apparatus.
pub struct Compiler<'p> {
    parser: &'p dyn QuantityParser,
    warn_unused: bool,
}

impl<'p> Compiler<'p> {
    /// A compiler resolving quantities through `parser`.
    pub fn new(parser: &'p dyn QuantityParser) -> Self {
        Self {
            parser,
            warn_unused: true,
        }
    }

    /// Toggles the warning emitted for stateful components no procedure uses.
    pub fn warn_unused(mut self, enabled: bool) -> Self {
        self.warn_unused = enabled;
        self
    }

    /// Compiles `procedures` into a schedule covering every active component.
    pub fn compile(
        &self,
        apparatus: &Apparatus,
        procedures: &[RawProcedure],
        duration: ProtocolDuration,
    ) -> Result<Schedule, CompileError> {
        let mut groups: BTreeMap<&str, Vec<&RawProcedure>> = BTreeMap::new();
        for raw in procedures {
            let component = self.target(apparatus, raw)?;
            if raw.values.is_empty() {
                return Err(CompileError::EmptyProcedure(component.name().to_string()));
            }
            groups.entry(component.name()).or_default().push(raw);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|p| (p.start, p.id));
        }

        let fixed = match duration {
            ProtocolDuration::Fixed(d) => Some(d),
            ProtocolDuration::Auto => Some(
                procedures
                    .iter()
                    .filter_map(|p| p.stop)
                    .max()
                    .ok_or_else(|| {
                        CompileError::UndeterminedDuration(
                            "'auto' requires at least one procedure with an explicit stop".into(),
                        )
                    })?,
            ),
            ProtocolDuration::Unset => None,
        };

        let mut resolved: BTreeMap<&str, Vec<Resolved<'_>>> = BTreeMap::new();
        for (name, group) in &groups {
            let component = apparatus
                .active(name)
                .ok_or_else(|| self.unknown(apparatus, name))?;
            resolved.insert(*name, self.resolve_group(component, group, fixed)?);
        }

        let duration = match fixed {
            Some(d) => d,
            None => resolved
                .values()
                .flatten()
                .map(|r| r.stop)
                .max()
                .ok_or_else(|| {
                    CompileError::UndeterminedDuration(
                        "no procedures were added and no duration was given".into(),
                    )
                })?,
        };

        let mut timelines = BTreeMap::new();
        for (name, component) in apparatus.active_components() {
            let timeline = match resolved.get(name) {
                Some(group) => {
                    check_timing(component, group, duration)?;
                    check_conflicts(component, group)?;
                    CompiledTimeline {
                        component: Arc::clone(component),
                        procedures: segments(component, group, duration),
                    }
                }
                None => {
                    if self.warn_unused && !component.is_sensor() {
                        warn!(
                            component = %name,
                            "{} is an active component but was not used in this protocol", component
                        );
                    }
                    CompiledTimeline::base_only(Arc::clone(component), duration)
                }
            };
            debug!(
                component = %name,
                segments = timeline.procedures.len(),
                "compiled timeline"
            );
            timelines.insert(name.to_string(), timeline);
        }

        Ok(Schedule {
            name: apparatus.name().to_string(),
            duration,
            timelines,
        })
    }

    fn target<'a>(
        &self,
        apparatus: &'a Apparatus,
        raw: &RawProcedure,
    ) -> Result<&'a Arc<ActiveComponent>, CompileError> {
        match apparatus.node(&raw.component) {
            Some(Node::Active(c)) if c.is_sensor() => {
                Err(CompileError::SensorTargeted(raw.component.clone()))
            }
            Some(Node::Active(c)) => Ok(c),
            _ => Err(self.unknown(apparatus, &raw.component)),
        }
    }

    fn unknown(&self, apparatus: &Apparatus, name: &str) -> CompileError {
        CompileError::UnknownComponent {
            component: name.to_string(),
            apparatus: apparatus.name().to_string(),
        }
    }

    fn resolve_group<'r>(
        &self,
        component: &ActiveComponent,
        group: &[&'r RawProcedure],
        protocol_end: Option<Duration>,
    ) -> Result<Vec<Resolved<'r>>, CompileError> {
        let mut out = Vec::with_capacity(group.len());
        for (i, raw) in group.iter().enumerate() {
            let state = component.resolve_all(&raw.values, self.parser)?;

            let stop = match raw.stop {
                Some(stop) => stop,
                None => {
                    let next = group[i + 1..]
                        .iter()
                        .find(|later| later.start > raw.start && later.shares_attribute(raw));
                    match (next, protocol_end) {
                        (Some(next), _) => {
                            info!(
                                component = %component.name(),
                                stop = ?next.start,
                                "inferring stop as the start of the next procedure"
                            );
                            next.start
                        }
                        (None, Some(end)) => {
                            info!(
                                component = %component.name(),
                                stop = ?end,
                                "inferring stop as the end of the protocol"
                            );
                            end
                        }
                        (None, None) => {
                            return Err(CompileError::AmbiguousStop {
                                component: component.name().to_string(),
                                start: raw.start,
                            })
                        }
                    }
                }
            };

            out.push(Resolved { raw, stop, state });
        }
        Ok(out)
    }
}

fn check_timing(
    component: &ActiveComponent,
    group: &[Resolved<'_>],
    duration: Duration,
) -> Result<(), CompileError> {
    for r in group {
        let (start, stop) = (r.raw.start, r.stop);
        if start > duration {
            return Err(CompileError::OutOfRange {
                component: component.name().to_string(),
                edge: "start",
                at: start,
                duration,
            });
        }
        if stop > duration {
            return Err(CompileError::OutOfRange {
                component: component.name().to_string(),
                edge: "end",
                at: stop,
                duration,
            });
        }
        if start > stop {
            return Err(CompileError::InvalidTiming {
                component: component.name().to_string(),
                reason: format!(
                    "start ({:?}) must not be after stop ({:?})",
                    start, stop
                ),
            });
        }
        if start == stop {
            return Err(CompileError::InvalidTiming {
                component: component.name().to_string(),
                reason: format!("procedure #{} has zero length at {:?}", r.raw.id, start),
            });
        }
    }
    Ok(())
}

/// Same-attribute procedures conflict when their ranges intersect or they
/// start at the same instant.
fn check_conflicts(
    component: &ActiveComponent,
    group: &[Resolved<'_>],
) -> Result<(), CompileError> {
    for (i, first) in group.iter().enumerate() {
        for second in &group[i + 1..] {
            if second.raw.start >= first.stop && second.raw.start != first.raw.start {
                continue;
            }
            if first.raw.shares_attribute(second.raw) {
                return Err(CompileError::ProcedureConflict {
                    component: component.name().to_string(),
                    first: first.raw.summary(Some(first.stop)),
                    second: second.raw.summary(Some(second.stop)),
                });
            }
        }
    }
    Ok(())
}

fn segments(
    component: &ActiveComponent,
    group: &[Resolved<'_>],
    duration: Duration,
) -> Vec<Procedure> {
    let mut cuts = BTreeSet::from([Duration::ZERO, duration]);
    for r in group {
        cuts.insert(r.raw.start);
        cuts.insert(r.stop);
    }
    let cuts: Vec<Duration> = cuts.into_iter().collect();

    cuts.windows(2)
        .map(|w| {
            let (start, end) = (w[0], w[1]);
            let mut state = component.base_state().clone();
            let mut origin = Origin::Base;
            for r in group.iter().filter(|r| r.raw.start <= start && start < r.stop) {
                origin = Origin::Scheduled;
                for (k, v) in &r.state {
                    state.insert(k.clone(), v.clone());
                }
            }
            Procedure {
                start,
                end,
                state,
                origin,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apparatus::Tube;
    use crate::component::{Component, Value};
    use crate::units::UnitRegistry;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn raw(id: usize, component: &str, start: u64, stop: Option<u64>, values: &[(&str, RawValue)]) -> RawProcedure {
        RawProcedure {
            id,
            component: component.into(),
            start: secs(start),
            stop: stop.map(secs),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn rig() -> Apparatus {
        let tube = || Tube::new("10 cm", "1 mm", "2 mm", "PFA").unwrap();
        let mut a = Apparatus::named("rig");
        a.add_component(ActiveComponent::pump("pump1").unwrap()).unwrap();
        a.add_component(ActiveComponent::pump("pump2").unwrap()).unwrap();
        a.add_component(Component::new("Mixer").named("mixer")).unwrap();
        a.add_component(ActiveComponent::sensor("ir").unwrap()).unwrap();
        a.connect("pump1", "mixer", tube()).unwrap();
        a.connect("pump2", "mixer", tube()).unwrap();
        a.connect("mixer", "ir", tube()).unwrap();
        a
    }

    fn compile(procs: &[RawProcedure], duration: ProtocolDuration) -> Result<Schedule, CompileError> {
        Compiler::new(UnitRegistry::global()).compile(&rig(), procs, duration)
    }

    fn rate_of(p: &Procedure) -> f64 {
        p.state["rate"].as_quantity().unwrap().to("mL/min").unwrap()
    }

    #[test]
    fn fills_gaps_with_base_state() {
        let s = compile(
            &[raw(0, "pump1", 10, Some(20), &[("rate", "5 mL/min".into())])],
            ProtocolDuration::Fixed(secs(30)),
        )
        .unwrap();
        s.check_partition().unwrap();

        let p = &s.timeline("pump1").unwrap().procedures;
        assert_eq!(p.len(), 3);
        assert_eq!((p[1].start, p[1].end), (secs(10), secs(20)));
        assert_eq!(rate_of(&p[0]), 0.0);
        assert_eq!(rate_of(&p[1]), 5.0);
        assert_eq!(rate_of(&p[2]), 0.0);

        // untouched components get a single base segment
        let p2 = &s.timeline("pump2").unwrap().procedures;
        assert_eq!(p2.len(), 1);
        assert_eq!(p2[0].origin, Origin::Base);
        assert_eq!(s.timeline("ir").unwrap().procedures.len(), 1);
    }

    #[test]
    fn open_stop_runs_to_next_procedure_or_end() {
        let s = compile(
            &[
                raw(0, "pump1", 0, None, &[("rate", "1 mL/min".into())]),
                raw(1, "pump1", 10, None, &[("rate", "2 mL/min".into())]),
            ],
            ProtocolDuration::Fixed(secs(60)),
        )
        .unwrap();
        let p = &s.timeline("pump1").unwrap().procedures;
        assert_eq!(p.len(), 2);
        assert_eq!(p[0].end, secs(10));
        assert_eq!(p[1].end, secs(60));
        assert_eq!(rate_of(&p[1]), 2.0);
    }

    #[test]
    fn unset_duration_needs_closed_procedures() {
        let err = compile(
            &[raw(0, "pump1", 0, None, &[("rate", "1 mL/min".into())])],
            ProtocolDuration::Unset,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::AmbiguousStop { .. }));

        let s = compile(
            &[
                raw(0, "pump1", 0, None, &[("rate", "1 mL/min".into())]),
                raw(1, "pump1", 5, Some(15), &[("rate", "2 mL/min".into())]),
            ],
            ProtocolDuration::Unset,
        )
        .unwrap();
        assert_eq!(s.duration, secs(15));
    }

    #[test]
    fn auto_duration_uses_latest_stop() {
        let s = compile(
            &[
                raw(0, "pump1", 0, Some(40), &[("rate", "1 mL/min".into())]),
                raw(1, "pump2", 0, None, &[("rate", "1 mL/min".into())]),
            ],
            ProtocolDuration::Auto,
        )
        .unwrap();
        assert_eq!(s.duration, secs(40));
        assert_eq!(s.timeline("pump2").unwrap().procedures[0].end, secs(40));

        let err = compile(
            &[raw(0, "pump1", 0, None, &[("rate", "1 mL/min".into())])],
            ProtocolDuration::Auto,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UndeterminedDuration(_)));
    }

    #[test]
    fn same_attribute_overlap_is_a_conflict() {
        let err = compile(
            &[
                raw(0, "pump1", 0, Some(10), &[("rate", "1 mL/min".into())]),
                raw(1, "pump1", 5, Some(15), &[("rate", "2 mL/min".into())]),
            ],
            ProtocolDuration::Fixed(secs(30)),
        )
        .unwrap_err();
        match err {
            CompileError::ProcedureConflict { first, second, .. } => {
                assert_eq!(first.index, 0);
                assert_eq!(second.index, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // same start is a conflict even when both are open
        let err = compile(
            &[
                raw(0, "pump1", 5, None, &[("rate", "1 mL/min".into())]),
                raw(1, "pump1", 5, None, &[("rate", "2 mL/min".into())]),
            ],
            ProtocolDuration::Fixed(secs(30)),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::ProcedureConflict { .. }));
    }

    #[test]
    fn touching_procedures_do_not_conflict() {
        let s = compile(
            &[
                raw(0, "pump1", 0, Some(10), &[("rate", "1 mL/min".into())]),
                raw(1, "pump1", 10, Some(20), &[("rate", "2 mL/min".into())]),
            ],
            ProtocolDuration::Fixed(secs(20)),
        )
        .unwrap();
        assert_eq!(s.timeline("pump1").unwrap().procedures.len(), 2);
    }

    #[test]
    fn timing_is_validated() {
        let fixed = ProtocolDuration::Fixed(secs(30));
        let err = compile(&[raw(0, "pump1", 20, Some(10), &[("rate", "1 mL/min".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTiming { .. }));

        let err = compile(&[raw(0, "pump1", 0, Some(40), &[("rate", "1 mL/min".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::OutOfRange { edge: "end", .. }));

        let err = compile(&[raw(0, "pump1", 30, None, &[("rate", "1 mL/min".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidTiming { .. }));
    }

    #[test]
    fn targets_are_checked() {
        let fixed = ProtocolDuration::Fixed(secs(30));
        let err = compile(&[raw(0, "ir", 0, None, &[("rate", "1 mL/min".into())])], fixed)
            .unwrap_err();
        assert_eq!(err, CompileError::SensorTargeted("ir".into()));

        let err = compile(&[raw(0, "mixer", 0, None, &[("rate", "1 mL/min".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownComponent { .. }));

        let err = compile(&[raw(0, "pump1", 0, None, &[])], fixed).unwrap_err();
        assert!(matches!(err, CompileError::EmptyProcedure(_)));
    }

    #[test]
    fn values_are_resolved_at_compile_time() {
        let fixed = ProtocolDuration::Fixed(secs(30));
        let err = compile(&[raw(0, "pump1", 0, None, &[("rate", "5 mL".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::DimensionMismatch { .. }));

        let err = compile(&[raw(0, "pump1", 0, None, &[("rate", "five".into())])], fixed)
            .unwrap_err();
        assert!(matches!(err, CompileError::UnitParse(_)));
    }

    #[test]
    #[tracing_test::traced_test]
    fn unused_components_are_reported() {
        compile(
            &[raw(0, "pump1", 0, None, &[("rate", "1 mL/min".into())])],
            ProtocolDuration::Fixed(secs(10)),
        )
        .unwrap();
        assert!(logs_contain("pump2 is an active component but was not used"));
        assert!(!logs_contain("ir is an active component"));

        Compiler::new(UnitRegistry::global())
            .warn_unused(false)
            .compile(&rig(), &[], ProtocolDuration::Fixed(secs(10)))
            .unwrap();
        assert!(!logs_contain("pump1 is an active component"));
    }

    #[test]
    fn zero_duration_yields_single_point() {
        let s = compile(&[], ProtocolDuration::Fixed(Duration::ZERO)).unwrap();
        s.check_partition().unwrap();
        let p = &s.timeline("pump1").unwrap().procedures;
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].state["rate"], Value::Quantity(UnitRegistry::global().parse("0 mL/min").unwrap()));
    }
}
