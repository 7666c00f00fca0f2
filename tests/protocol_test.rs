//! End-to-end compilation through the public API: apparatus, protocol, schedule.

use rust_flowlab::component::{AttributeKind, Value};
use rust_flowlab::error::{CompileError, FlowError};
use rust_flowlab::experiment::Experiment;
use rust_flowlab::schedule::Origin;
use rust_flowlab::{ActiveComponent, Apparatus, Component, Protocol, RenderFormat, Step, Tube};
use std::io::Write;
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn tube() -> Tube {
    Tube::new("10 cm", "1 mm", "1/16 in", "PFA").unwrap()
}

/// Two pumps feeding a mixer, a heated reactor coil, and an inline IR cell.
fn flow_rig() -> Apparatus {
    let mut a = Apparatus::named("sulfonylation");
    a.add_component(Component::vessel("p-toluenesulfinate 2M in DMAc").named("sulfinate"))
        .unwrap();
    a.add_component(Component::vessel("methyl iodide").named("electrophile"))
        .unwrap();
    a.add_component(ActiveComponent::pump("pump1").unwrap()).unwrap();
    a.add_component(ActiveComponent::pump("pump2").unwrap()).unwrap();
    a.add_component(Component::new("Mixer").named("tee")).unwrap();
    a.add_component(ActiveComponent::temp_control("heater").unwrap())
        .unwrap();
    a.add_component(ActiveComponent::sensor("ir").unwrap()).unwrap();
    a.connect("sulfinate", "pump1", tube()).unwrap();
    a.connect("electrophile", "pump2", tube()).unwrap();
    a.connect("pump1", "tee", tube()).unwrap();
    a.connect("pump2", "tee", tube()).unwrap();
    a.connect("tee", "heater", tube()).unwrap();
    a.connect("heater", "ir", tube()).unwrap();
    a
}

fn rate(state: &rust_flowlab::component::StateMap) -> f64 {
    state["rate"].as_quantity().unwrap().to("mL/min").unwrap()
}

#[test]
fn test_pump_procedure_is_bookended_by_base_state() {
    let rig = flow_rig();
    let mut protocol = Protocol::new(&rig).unwrap().with_duration(secs(30));
    protocol
        .add("pump1", Step::new().at("10 s").until("20 s").set("rate", "5 mL/min"))
        .unwrap();
    let schedule = protocol.compile().unwrap();
    schedule.check_partition().unwrap();

    let p = &schedule.timeline("pump1").unwrap().procedures;
    let spans: Vec<_> = p.iter().map(|p| (p.start, p.end)).collect();
    assert_eq!(
        spans,
        vec![(secs(0), secs(10)), (secs(10), secs(20)), (secs(20), secs(30))]
    );
    assert_eq!(
        p.iter().map(|p| rate(&p.state)).collect::<Vec<_>>(),
        vec![0.0, 5.0, 0.0]
    );
    assert_eq!(
        p.iter().map(|p| p.origin).collect::<Vec<_>>(),
        vec![Origin::Base, Origin::Scheduled, Origin::Base]
    );
}

#[test]
fn test_every_timeline_partitions_the_run() {
    let rig = flow_rig();
    let mut protocol = Protocol::new(&rig).unwrap().with_duration(secs(120));
    protocol
        .add_all(
            ["pump1", "pump2"],
            Step::new().at(secs(5)).lasting("1 min").set("rate", "0.5 mL/min"),
        )
        .unwrap();
    protocol
        .add("heater", Step::new().set("temp", "60 degC"))
        .unwrap();
    let schedule = protocol.compile().unwrap();

    for (name, timeline) in &schedule.timelines {
        timeline
            .check_partition(schedule.duration)
            .unwrap_or_else(|e| panic!("{} does not partition the run: {}", name, e));
    }

    // open heater procedure runs to the end of the protocol, switched on
    let heater = &schedule.timeline("heater").unwrap().procedures;
    assert_eq!(heater.len(), 1);
    assert_eq!(heater[0].end, secs(120));
    assert_eq!(heater[0].state["active"], Value::Bool(true));

    // sensors are never scheduled but still get a timeline
    let ir = &schedule.timeline("ir").unwrap().procedures;
    assert_eq!(ir.len(), 1);
    assert_eq!(ir[0].origin, Origin::Base);
}

#[test]
fn test_unused_components_hold_base_state() {
    let rig = flow_rig();
    let protocol = Protocol::new(&rig).unwrap().quiet().with_duration(secs(60));
    let schedule = protocol.compile().unwrap();

    for timeline in schedule.timelines.values() {
        assert_eq!(timeline.procedures.len(), 1);
        let only = &timeline.procedures[0];
        assert_eq!((only.start, only.end), (secs(0), secs(60)));
        assert_eq!(&only.state, timeline.component.base_state());
    }
}

#[test]
fn test_disjoint_attributes_may_overlap() {
    let valve = ActiveComponent::builder("Valve")
        .named("valve1")
        .attribute("position", AttributeKind::Integer)
        .attribute("flush", AttributeKind::Bool)
        .base("position", 1i64)
        .base("flush", false)
        .build()
        .unwrap();
    let mut rig = Apparatus::named("flush_rig");
    rig.add_component(valve).unwrap();

    let mut protocol = Protocol::new(&rig).unwrap().with_duration(secs(20));
    protocol
        .add("valve1", Step::new().at("0 s").until("10 s").set("position", 2i64))
        .unwrap();
    protocol
        .add("valve1", Step::new().at("5 s").until("15 s").set("flush", true))
        .unwrap();
    let schedule = protocol.compile().unwrap();

    let p = &schedule.timeline("valve1").unwrap().procedures;
    let segments: Vec<_> = p
        .iter()
        .map(|p| {
            (
                p.start.as_secs(),
                p.state["position"].as_integer().unwrap(),
                p.state["flush"].as_bool().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        segments,
        vec![(0, 2, false), (5, 2, true), (10, 1, true), (15, 1, false)]
    );
}

#[test]
fn test_same_attribute_overlap_is_rejected() {
    let rig = flow_rig();
    let mut protocol = Protocol::new(&rig).unwrap().with_duration(secs(60));
    protocol
        .add("pump1", Step::new().at("0 s").until("30 s").set("rate", "1 mL/min"))
        .unwrap();
    protocol
        .add("pump1", Step::new().at("20 s").until("40 s").set("rate", "2 mL/min"))
        .unwrap();

    match protocol.compile() {
        Err(CompileError::ProcedureConflict {
            component,
            first,
            second,
        }) => {
            assert_eq!(component, "pump1");
            assert_eq!(first.start, secs(0));
            assert_eq!(second.start, secs(20));
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[test]
fn test_compile_errors_are_reported_not_partial() {
    let rig = flow_rig();

    let mut unknown = Protocol::new(&rig).unwrap().with_duration(secs(10));
    unknown
        .add("pump1", Step::new().set("speed", "1 mL/min"))
        .unwrap();
    match unknown.compile() {
        Err(CompileError::InvalidAttribute {
            attribute, valid, ..
        }) => {
            assert_eq!(attribute, "speed");
            assert_eq!(valid, vec!["rate".to_string()]);
        }
        other => panic!("expected InvalidAttribute, got {:?}", other),
    }

    let mut dimension = Protocol::new(&rig).unwrap().with_duration(secs(10));
    dimension
        .add("heater", Step::new().set("temp", "5 mL/min"))
        .unwrap();
    assert!(matches!(
        dimension.compile(),
        Err(CompileError::DimensionMismatch { .. })
    ));

    let mut late = Protocol::new(&rig).unwrap().with_duration(secs(10));
    late.add("pump1", Step::new().at("5 s").until("1 min").set("rate", "1 mL/min"))
        .unwrap();
    assert!(matches!(
        late.compile(),
        Err(CompileError::OutOfRange { edge: "end", .. })
    ));

    let mut sensor = Protocol::new(&rig).unwrap();
    assert!(matches!(
        sensor.add("ir", Step::new().set("rate", "1 mL/min")),
        Err(CompileError::SensorTargeted(_))
    ));
    assert!(matches!(
        sensor.add("tee", Step::new().set("rate", "1 mL/min")),
        Err(CompileError::UnknownComponent { .. })
    ));
}

#[test]
fn test_auto_duration_ends_at_last_stop() {
    let rig = flow_rig();
    let mut protocol = Protocol::new(&rig).unwrap().quiet();
    protocol.set_duration("auto").unwrap();
    protocol
        .add("pump1", Step::new().at("30 s").lasting("90 s").set("rate", "1 mL/min"))
        .unwrap();
    let schedule = protocol.compile().unwrap();
    assert_eq!(schedule.duration, secs(120));
    assert_eq!(
        schedule.timeline("pump1").unwrap().procedures.last().unwrap().end,
        secs(120)
    );
}

#[test]
fn test_rendered_schedule_document() {
    let rig = flow_rig();
    let mut protocol = Protocol::new(&rig)
        .unwrap()
        .named("prime")
        .quiet()
        .with_duration(secs(30));
    protocol
        .add("pump1", Step::new().at("10 s").until("20 s").set("rate", "5 mL/min"))
        .unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&protocol.render(RenderFormat::Json).unwrap()).unwrap();
    assert_eq!(json["name"], "prime");
    assert_eq!(json["duration"], 30.0);
    let pump = json["components"]["pump1"].as_array().unwrap();
    assert_eq!(pump.len(), 3);
    assert_eq!(pump[1]["start"], 10.0);
    assert_eq!(pump[1]["origin"], "scheduled");
    assert_eq!(pump[1]["state"]["rate"], "5 mL/min");

    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&protocol.render(RenderFormat::Yaml).unwrap()).unwrap();
    assert_eq!(yaml["name"].as_str(), Some("prime"));
}

#[test]
fn test_experiment_file_compiles() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[protocol]
name = "quench"
duration = "auto"

[[components]]
name = "quench"
type = "vessel"

[[components]]
name = "pump1"
type = "pump"
driver = {{ type = "mock" }}

[[components]]
name = "valve1"
type = "valve"
mapping = {{ reactor = 1, waste = 2 }}
idle = "waste"
driver = {{ type = "mock" }}

[[connections]]
from = "quench"
to = "pump1"
tube = {{ length = "30 cm", id = "0.03 in", od = "1/16 in" }}

[[connections]]
from = "pump1"
to = "valve1"
tube = {{ length = "10 cm", id = "0.03 in", od = "1/16 in" }}

[[procedures]]
components = ["valve1"]
start = "0 s"
stop = "2 min"
set = {{ setting = "reactor" }}

[[procedures]]
component = "pump1"
start = "30 s"
duration = "1 min"
set = {{ rate = "250 uL/min" }}
"#
    )
    .unwrap();

    let experiment = Experiment::load(file.path()).unwrap();
    assert!(experiment.apparatus().tubing_volume_ml() > 0.0);

    let schedule = experiment.protocol().unwrap().compile().unwrap();
    assert_eq!(schedule.name, "quench");
    assert_eq!(schedule.duration, secs(120));

    let valve = &schedule.timeline("valve1").unwrap().procedures;
    assert_eq!(valve[0].state["setting"], Value::Integer(1));

    let pump = &schedule.timeline("pump1").unwrap().procedures;
    assert_eq!(pump.len(), 3);
    assert!((rate(&pump[1].state) - 0.25).abs() < 1e-9);
}

#[test]
fn test_missing_experiment_file_is_io_error() {
    assert!(matches!(
        Experiment::load("/nonexistent/experiment.toml"),
        Err(FlowError::Io(_))
    ));
}

#[test]
fn test_bundled_experiment_compiles() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("experiments")
        .join("sulfonylation.toml");
    let experiment = Experiment::load(path).unwrap();
    let schedule = experiment.protocol().unwrap().compile().unwrap();
    schedule.check_partition().unwrap();
    assert_eq!(schedule.duration, secs(12 * 60));

    let coil = &schedule.timeline("coil").unwrap().procedures;
    assert_eq!(coil.len(), 1);
    assert_eq!(coil[0].state["active"], Value::Bool(true));

    // the serial pump is bound but not opened until acquired
    let drivers = experiment.drivers(false).unwrap();
    assert_eq!(drivers.len(), 5);
    assert_eq!(experiment.drivers(true).unwrap().len(), 5);
}
