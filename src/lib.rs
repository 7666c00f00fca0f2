//! Core library for rust_flowlab.
//!
//! Describes a continuous-flow apparatus, compiles timed protocols against it
//! into per-component schedules, and executes those schedules on hardware
//! with one async task per device.
//!
//! The layers, bottom-up:
//!
//! - [`units`]: physical quantities and the unit registry
//! - [`component`] and [`apparatus`]: the device graph
//! - [`protocol`] and [`compiler`]: procedure declaration and compilation into a [`schedule::Schedule`]
//! - [`hardware`] and [`executor`]: drivers and the concurrent run engine
//! - [`data`]: the per-run experiment data log
//! - [`experiment`]: TOML experiment files tying all of the above together

pub mod apparatus;
pub mod compiler;
pub mod component;
pub mod config;
pub mod data;
pub mod error;
pub mod executor;
pub mod experiment;
pub mod hardware;
pub mod protocol;
pub mod schedule;
pub mod telemetry;
pub mod units;

pub use apparatus::{Apparatus, Tube};
pub use component::{ActiveComponent, Component, Value};
pub use error::{AppResult, FlowError};
pub use executor::{Executor, RunReport};
pub use protocol::{Protocol, Step};
pub use schedule::{RenderFormat, Schedule};
pub use units::{Quantity, UnitRegistry};
