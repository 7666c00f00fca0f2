//! Compiled schedules.
//!
//! A [`Schedule`] holds one [`CompiledTimeline`] per active component of the
//! apparatus. Each timeline is a gapless, non-overlapping list of
//! [`Procedure`]s covering `[0, duration]`: every segment is half-open
//! `[start, end)` except the last, which is closed at `duration`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::component::{ActiveComponent, StateMap};
use crate::error::StorageError;

/// Where a compiled procedure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Injected base state (gap filler or bookend).
    Base,
    /// At least one user procedure covers this segment.
    Scheduled,
}

/// One resolved segment of a component's timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    /// Inclusive start, from the run origin.
    pub start: Duration,
    /// Exclusive end. The last segment ends at the protocol duration.
    pub end: Duration,
    /// Full attribute mapping to apply at `start`.
    pub state: StateMap,
    /// Whether user procedures contributed.
    pub origin: Origin,
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?}) ", self.start, self.end)?;
        let values: Vec<String> = self
            .state
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", values.join(", "))
    }
}

/// The ordered procedures of one component.
#[derive(Debug, Clone)]
pub struct CompiledTimeline {
    /// The component this timeline drives.
    pub component: Arc<ActiveComponent>,
    /// Contiguous segments covering the whole run.
    pub procedures: Vec<Procedure>,
}

impl CompiledTimeline {
    /// A timeline holding the component's base state for the whole run.
    pub fn base_only(component: Arc<ActiveComponent>, duration: Duration) -> Self {
        let procedures = vec![Procedure {
            start: Duration::ZERO,
            end: duration,
            state: component.base_state().clone(),
            origin: Origin::Base,
        }];
        Self {
            component,
            procedures,
        }
    }

    /// Procedures that came from user declarations.
    pub fn scheduled(&self) -> impl Iterator<Item = &Procedure> {
        self.procedures
            .iter()
            .filter(|p| p.origin == Origin::Scheduled)
    }

    /// Checks that the procedures partition `[0, duration]`.
    pub fn check_partition(&self, duration: Duration) -> Result<(), String> {
        let Some(first) = self.procedures.first() else {
            return Err("timeline is empty".into());
        };
        if first.start != Duration::ZERO {
            return Err(format!("timeline starts at {:?}", first.start));
        }
        for pair in self.procedures.windows(2) {
            if pair[0].end != pair[1].start {
                return Err(format!(
                    "segment ending at {:?} is followed by one starting at {:?}",
                    pair[0].end, pair[1].start
                ));
            }
        }
        for p in &self.procedures {
            if p.end < p.start || (p.end == p.start && duration != Duration::ZERO) {
                return Err(format!("empty or inverted segment {}", p));
            }
        }
        let last_end = self.procedures.last().map(|p| p.end).unwrap_or_default();
        if last_end != duration {
            return Err(format!(
                "timeline ends at {:?}, expected {:?}",
                last_end, duration
            ));
        }
        Ok(())
    }

    /// The procedure in force at `t`. The final instant belongs to the last segment.
    pub fn active_at(&self, t: Duration) -> Option<&Procedure> {
        let last = self.procedures.last()?;
        if t == last.end {
            return Some(last);
        }
        self.procedures.iter().find(|p| p.start <= t && t < p.end)
    }
}

/// Output format for [`Schedule::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    /// Pretty-printed JSON.
    Json,
    /// YAML.
    Yaml,
}

/// The compiled form of a protocol, ready for execution.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Name of the compiled protocol.
    pub name: String,
    /// Total run length.
    pub duration: Duration,
    /// One timeline per active component, keyed by name.
    pub timelines: BTreeMap<String, CompiledTimeline>,
}

impl Schedule {
    /// Timeline of one component.
    pub fn timeline(&self, component: &str) -> Option<&CompiledTimeline> {
        self.timelines.get(component)
    }

    /// Checks every timeline's partition of `[0, duration]`.
    pub fn check_partition(&self) -> Result<(), String> {
        for (name, timeline) in &self.timelines {
            timeline
                .check_partition(self.duration)
                .map_err(|e| format!("{}: {}", name, e))?;
        }
        Ok(())
    }

    /// Renders as pretty JSON, times in seconds.
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(&self.document())?)
    }

    /// Renders as YAML, times in seconds.
    pub fn to_yaml(&self) -> Result<String, StorageError> {
        Ok(serde_yaml::to_string(&self.document())?)
    }

    /// Renders in `format`.
    pub fn render(&self, format: RenderFormat) -> Result<String, StorageError> {
        match format {
            RenderFormat::Json => self.to_json(),
            RenderFormat::Yaml => self.to_yaml(),
        }
    }

    fn document(&self) -> ScheduleDocument<'_> {
        ScheduleDocument {
            name: &self.name,
            duration: self.duration.as_secs_f64(),
            components: self
                .timelines
                .iter()
                .map(|(name, timeline)| {
                    let entries = timeline
                        .procedures
                        .iter()
                        .map(|p| ProcedureEntry {
                            start: p.start.as_secs_f64(),
                            stop: p.end.as_secs_f64(),
                            origin: p.origin,
                            state: &p.state,
                        })
                        .collect();
                    (name.as_str(), entries)
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ScheduleDocument<'a> {
    name: &'a str,
    /// seconds
    duration: f64,
    components: BTreeMap<&'a str, Vec<ProcedureEntry<'a>>>,
}

#[derive(Serialize)]
struct ProcedureEntry<'a> {
    start: f64,
    stop: f64,
    origin: Origin,
    state: &'a StateMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Value;
    use crate::units::{QuantityParser, UnitRegistry};

    fn rate(s: &str) -> StateMap {
        let q = UnitRegistry::global().parse(s).unwrap();
        StateMap::from([("rate".to_string(), Value::Quantity(q))])
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn pump_timeline() -> CompiledTimeline {
        let pump = Arc::new(ActiveComponent::pump("pump1").unwrap());
        CompiledTimeline {
            component: pump,
            procedures: vec![
                Procedure {
                    start: secs(0),
                    end: secs(10),
                    state: rate("0 mL/min"),
                    origin: Origin::Base,
                },
                Procedure {
                    start: secs(10),
                    end: secs(20),
                    state: rate("5 mL/min"),
                    origin: Origin::Scheduled,
                },
                Procedure {
                    start: secs(20),
                    end: secs(30),
                    state: rate("0 mL/min"),
                    origin: Origin::Base,
                },
            ],
        }
    }

    #[test]
    fn partition_is_checked() {
        let mut timeline = pump_timeline();
        assert!(timeline.check_partition(secs(30)).is_ok());
        assert!(timeline.check_partition(secs(40)).is_err());

        timeline.procedures[1].start = secs(11);
        assert!(timeline.check_partition(secs(30)).is_err());
    }

    #[test]
    fn active_at_includes_the_final_instant() {
        let timeline = pump_timeline();
        assert_eq!(timeline.active_at(secs(10)).unwrap().origin, Origin::Scheduled);
        assert_eq!(timeline.active_at(secs(20)).unwrap().origin, Origin::Base);
        assert_eq!(timeline.active_at(secs(30)).unwrap().start, secs(20));
        assert!(timeline.active_at(secs(31)).is_none());
    }

    #[test]
    fn renders_json_and_yaml_in_seconds() {
        let schedule = Schedule {
            name: "Protocol_test".into(),
            duration: secs(30),
            timelines: BTreeMap::from([("pump1".to_string(), pump_timeline())]),
        };

        let json: serde_json::Value = serde_json::from_str(&schedule.to_json().unwrap()).unwrap();
        assert_eq!(json["duration"], 30.0);
        assert_eq!(json["components"]["pump1"][1]["start"], 10.0);
        assert_eq!(json["components"]["pump1"][1]["state"]["rate"], "5 mL/min");
        assert_eq!(json["components"]["pump1"][2]["origin"], "base");

        let yaml = schedule.render(RenderFormat::Yaml).unwrap();
        assert!(yaml.contains("pump1"));
        assert!(yaml.contains("5 mL/min"));
    }
}
