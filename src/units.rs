//! Physical quantities and the process-wide unit registry.
//!
//! Attribute values such as `"5 mL/min"` or `"25 degC"` are parsed into a
//! [`Quantity`]: a magnitude tagged with the unit it was written in and the
//! [`Dimension`] that unit measures. The registry is built once, lazily, and is
//! read-only afterwards; the compiler receives it through the
//! [`QuantityParser`] trait so tests can substitute their own.
//!
//! # Supported expressions
//!
//! ```text
//! 5 mL/min        volumetric flow rate
//! 0.2 g/min       mass flow rate
//! 30 seconds      time (also s, ms, min, h, ...)
//! 1/16 in         fractional magnitudes
//! 2 M             concentration (mol/L)
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::UnitParseError;

/// Physical dimension measured by a quantity.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Dimensionless,
    Time,
    Length,
    Mass,
    Volume,
    Temperature,
    Pressure,
    Amount,
    Frequency,
    Velocity,
    Concentration,
    VolumetricFlowRate,
    MassFlowRate,
    MolarFlowRate,
}

impl Dimension {
    /// Dimension of `numerator / denominator`, when it is one we model.
    fn ratio(numerator: Dimension, denominator: Dimension) -> Option<Dimension> {
        use Dimension::*;
        match (numerator, denominator) {
            (Volume, Time) => Some(VolumetricFlowRate),
            (Mass, Time) => Some(MassFlowRate),
            (Amount, Time) => Some(MolarFlowRate),
            (Length, Time) => Some(Velocity),
            (Amount, Volume) => Some(Concentration),
            (Dimensionless, Time) => Some(Frequency),
            (dim, Dimensionless) => Some(dim),
            _ => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Dimensionless => "dimensionless",
            Dimension::Time => "time",
            Dimension::Length => "length",
            Dimension::Mass => "mass",
            Dimension::Volume => "volume",
            Dimension::Temperature => "temperature",
            Dimension::Pressure => "pressure",
            Dimension::Amount => "amount of substance",
            Dimension::Frequency => "frequency",
            Dimension::Velocity => "velocity",
            Dimension::Concentration => "concentration",
            Dimension::VolumetricFlowRate => "volumetric flow rate",
            Dimension::MassFlowRate => "mass flow rate",
            Dimension::MolarFlowRate => "molar flow rate",
        };
        f.write_str(name)
    }
}

/// A unit known to the registry: `si = magnitude * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct UnitDef {
    dimension: Dimension,
    scale: f64,
    offset: f64,
}

impl UnitDef {
    const fn linear(dimension: Dimension, scale: f64) -> Self {
        Self {
            dimension,
            scale,
            offset: 0.0,
        }
    }
}

/// A parsed, immutable physical quantity.
#[derive(Debug, Clone)]
pub struct Quantity {
    magnitude: f64,
    unit: String,
    def: UnitDef,
}

impl Quantity {
    /// Number as written, in the written unit.
    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Unit expression exactly as written, e.g. `"mL/min"`.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Physical dimension of the unit.
    pub fn dimension(&self) -> Dimension {
        self.def.dimension
    }

    /// Value in coherent SI units (m, kg, s, K, Pa, mol and their ratios).
    pub fn si_value(&self) -> f64 {
        self.magnitude * self.def.scale + self.def.offset
    }

    /// Magnitude expressed in `unit`, which must measure the same dimension.
    ///
    /// ```rust,ignore
    /// let rate = UnitRegistry::global().parse("0.5 mL/s")?;
    /// assert_eq!(rate.to("mL/min")?, 30.0);
    /// ```
    pub fn to(&self, unit: &str) -> Result<f64, UnitParseError> {
        let target = UnitRegistry::global().unit(unit)?;
        if target.dimension != self.def.dimension {
            return Err(UnitParseError::new(
                unit,
                format!(
                    "cannot convert {} to a unit of {}",
                    self.def.dimension, target.dimension
                ),
            ));
        }
        Ok((self.si_value() - target.offset) / target.scale)
    }

    /// Converts a time quantity into a `Duration`. Yields `None` for other
    /// dimensions and for times a `Duration` cannot hold.
    pub fn to_duration(&self) -> Option<Duration> {
        if self.def.dimension != Dimension::Time {
            return None;
        }
        Duration::try_from_secs_f64(self.si_value()).ok()
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        if self.def.dimension != other.def.dimension {
            return false;
        }
        let (a, b) = (self.si_value(), other.si_value());
        (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs()).max(1.0) * 8.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{}", self.magnitude)
        } else {
            write!(f, "{} {}", self.magnitude, self.unit)
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        UnitRegistry::global()
            .parse(&text)
            .map_err(serde::de::Error::custom)
    }
}

/// The unit-parsing service consumed by the compiler.
pub trait QuantityParser: Send + Sync {
    /// Parses a quantity string such as `"5 mL/min"`.
    fn parse(&self, input: &str) -> Result<Quantity, UnitParseError>;

    /// Parses a time quantity into a `Duration`.
    fn parse_duration(&self, input: &str) -> Result<Duration, UnitParseError> {
        let quantity = self.parse(input)?;
        if quantity.dimension() != Dimension::Time {
            return Err(UnitParseError::new(
                input,
                format!("expected a time, got {}", quantity.dimension()),
            ));
        }
        quantity
            .to_duration()
            .ok_or_else(|| {
                UnitParseError::new(input, "time must be non-negative and within range")
            })
    }
}

#[allow(clippy::unwrap_used)]
static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<num>[+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)(?:\s*/\s*(?P<den>\d+\.?\d*))?\s*(?P<unit>.*?)\s*$",
    )
    .unwrap()
});

static GLOBAL: Lazy<UnitRegistry> = Lazy::new(UnitRegistry::standard);

/// Table of known units. Read-only once constructed.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    units: HashMap<&'static str, UnitDef>,
}

impl UnitRegistry {
    /// The lazily-initialized process-wide registry.
    pub fn global() -> &'static UnitRegistry {
        &GLOBAL
    }

    /// Registry with the laboratory units a flow apparatus deals with.
    pub fn standard() -> Self {
        use Dimension::*;
        let mut units = HashMap::new();
        let mut add = |names: &[&'static str], def: UnitDef| {
            for name in names {
                units.insert(*name, def);
            }
        };

        add(&["s", "sec", "secs", "second", "seconds"], UnitDef::linear(Time, 1.0));
        add(&["ms", "millisecond", "milliseconds"], UnitDef::linear(Time, 1e-3));
        add(&["min", "mins", "minute", "minutes"], UnitDef::linear(Time, 60.0));
        add(&["h", "hr", "hrs", "hour", "hours"], UnitDef::linear(Time, 3600.0));
        add(&["day", "days"], UnitDef::linear(Time, 86_400.0));

        add(&["m", "meter", "meters", "metre", "metres"], UnitDef::linear(Length, 1.0));
        add(&["km"], UnitDef::linear(Length, 1e3));
        add(&["cm", "centimeter", "centimeters"], UnitDef::linear(Length, 1e-2));
        add(&["mm", "millimeter", "millimeters"], UnitDef::linear(Length, 1e-3));
        add(&["um", "µm", "micrometer", "micrometers"], UnitDef::linear(Length, 1e-6));
        add(&["in", "inch", "inches"], UnitDef::linear(Length, 0.0254));
        add(&["ft", "foot", "feet"], UnitDef::linear(Length, 0.3048));

        add(&["kg", "kilogram", "kilograms"], UnitDef::linear(Mass, 1.0));
        add(&["g", "gram", "grams"], UnitDef::linear(Mass, 1e-3));
        add(&["mg", "milligram", "milligrams"], UnitDef::linear(Mass, 1e-6));
        add(&["ug", "µg", "microgram", "micrograms"], UnitDef::linear(Mass, 1e-9));

        add(&["L", "l", "liter", "liters", "litre", "litres"], UnitDef::linear(Volume, 1e-3));
        add(&["mL", "ml", "milliliter", "milliliters", "cc"], UnitDef::linear(Volume, 1e-6));
        add(&["uL", "ul", "µL", "µl", "microliter", "microliters"], UnitDef::linear(Volume, 1e-9));

        add(&["K", "kelvin"], UnitDef::linear(Temperature, 1.0));
        add(
            &["degC", "°C", "celsius"],
            UnitDef {
                dimension: Temperature,
                scale: 1.0,
                offset: 273.15,
            },
        );
        add(
            &["degF", "°F", "fahrenheit"],
            UnitDef {
                dimension: Temperature,
                scale: 5.0 / 9.0,
                offset: 273.15 - 32.0 * 5.0 / 9.0,
            },
        );

        add(&["Pa", "pascal"], UnitDef::linear(Pressure, 1.0));
        add(&["kPa"], UnitDef::linear(Pressure, 1e3));
        add(&["MPa"], UnitDef::linear(Pressure, 1e6));
        add(&["bar"], UnitDef::linear(Pressure, 1e5));
        add(&["mbar"], UnitDef::linear(Pressure, 1e2));
        add(&["psi"], UnitDef::linear(Pressure, 6_894.757_293_168));
        add(&["atm"], UnitDef::linear(Pressure, 101_325.0));

        add(&["mol", "mole", "moles"], UnitDef::linear(Amount, 1.0));
        add(&["mmol"], UnitDef::linear(Amount, 1e-3));
        add(&["umol", "µmol"], UnitDef::linear(Amount, 1e-6));

        add(&["M", "molar"], UnitDef::linear(Concentration, 1e3));
        add(&["mM", "millimolar"], UnitDef::linear(Concentration, 1.0));

        add(&["Hz", "hertz"], UnitDef::linear(Frequency, 1.0));
        add(&["rpm"], UnitDef::linear(Frequency, 1.0 / 60.0));

        add(&["percent", "%"], UnitDef::linear(Dimensionless, 1e-2));

        Self { units }
    }

    /// Resolves a unit expression (`"mL/min"`, `"degC"`, `""`) to its definition.
    fn unit(&self, expr: &str) -> Result<UnitDef, UnitParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(UnitDef::linear(Dimension::Dimensionless, 1.0));
        }
        match expr.split_once('/') {
            None => self.simple_unit(expr),
            Some((num, den)) => {
                let (num, den) = (num.trim(), den.trim());
                if num.is_empty() || den.is_empty() || den.contains('/') {
                    return Err(UnitParseError::new(expr, "malformed unit ratio"));
                }
                let num_def = self.simple_unit(num)?;
                let den_def = self.simple_unit(den)?;
                if num_def.offset != 0.0 || den_def.offset != 0.0 {
                    return Err(UnitParseError::new(
                        expr,
                        "offset units cannot appear in a ratio",
                    ));
                }
                let dimension =
                    Dimension::ratio(num_def.dimension, den_def.dimension).ok_or_else(|| {
                        UnitParseError::new(
                            expr,
                            format!(
                                "unsupported ratio of {} to {}",
                                num_def.dimension, den_def.dimension
                            ),
                        )
                    })?;
                Ok(UnitDef::linear(dimension, num_def.scale / den_def.scale))
            }
        }
    }

    fn simple_unit(&self, name: &str) -> Result<UnitDef, UnitParseError> {
        self.units
            .get(name)
            .copied()
            .ok_or_else(|| UnitParseError::new(name, "unknown unit"))
    }
}

impl QuantityParser for UnitRegistry {
    fn parse(&self, input: &str) -> Result<Quantity, UnitParseError> {
        let caps = QUANTITY_RE
            .captures(input)
            .ok_or_else(|| UnitParseError::new(input, "expected '<number> <unit>'"))?;

        let mut magnitude: f64 = caps["num"]
            .parse()
            .map_err(|_| UnitParseError::new(input, "invalid magnitude"))?;
        if let Some(den) = caps.name("den") {
            let den: f64 = den
                .as_str()
                .parse()
                .map_err(|_| UnitParseError::new(input, "invalid fraction"))?;
            if den == 0.0 {
                return Err(UnitParseError::new(input, "division by zero"));
            }
            magnitude /= den;
        }

        let unit = caps["unit"].to_string();
        let def = self
            .unit(&unit)
            .map_err(|err| UnitParseError::new(input, err.reason))?;

        Ok(Quantity {
            magnitude,
            unit,
            def,
        })
    }
}
