//! Typed identifiers for geographic units, exposure models, and pollutants.
//!
//! Model names arrive as strings (`aermod`, `unif5`, `tria10`) at the CLI and
//! config boundary and are parsed exactly once into [`ExposureModel`].
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{invalid, AirqError, Result};

/// Raw facility identifier. Many facids can share one group representative.
pub type FacId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geounit {
    House,
    Block,
    Patzip,
    Monitor,
    Grid,
}

impl Geounit {
    pub const ALL: [Geounit; 5] = [
        Geounit::House,
        Geounit::Block,
        Geounit::Patzip,
        Geounit::Monitor,
        Geounit::Grid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Geounit::House => "house",
            Geounit::Block => "block",
            Geounit::Patzip => "patzip",
            Geounit::Monitor => "monitor",
            Geounit::Grid => "grid",
        }
    }

    /// First letter of the name, used as the leading character of artifact names.
    pub fn initial(&self) -> char {
        match self {
            Geounit::House => 'h',
            Geounit::Block => 'b',
            Geounit::Patzip => 'p',
            Geounit::Monitor => 'm',
            Geounit::Grid => 'g',
        }
    }

    pub fn from_initial(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.initial() == c)
    }

    /// Units coarser than grid cells and houses carry more per-job overhead.
    pub fn is_coarse(&self) -> bool {
        !matches!(self, Geounit::Grid | Geounit::House)
    }
}

impl fmt::Display for Geounit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Geounit {
    type Err = AirqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.name() == s)
            .ok_or_else(|| invalid(format!("Geo-Unit '{s}' not supported")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
    Uniform,
    Triangle,
    Epanechnikov,
    Triweight,
}

impl KernelKind {
    pub const ALL: [KernelKind; 4] = [
        KernelKind::Uniform,
        KernelKind::Triangle,
        KernelKind::Epanechnikov,
        KernelKind::Triweight,
    ];

    /// Four-letter prefix used in model names (`unif5`).
    pub fn short_name(&self) -> &'static str {
        match self {
            KernelKind::Uniform => "unif",
            KernelKind::Triangle => "tria",
            KernelKind::Epanechnikov => "epan",
            KernelKind::Triweight => "triw",
        }
    }

    /// Upper-case letter used in artifact names.
    pub fn letter(&self) -> char {
        match self {
            KernelKind::Uniform => 'U',
            KernelKind::Triangle => 'T',
            KernelKind::Epanechnikov => 'E',
            KernelKind::Triweight => 'W',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.letter() == c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExposureModel {
    /// The external AERMOD dispersion model.
    Dispersion,
    /// A closed-form polar kernel centered on the facility.
    Kernel {
        kind: KernelKind,
        bandwidth_km: u32,
    },
}

impl fmt::Display for ExposureModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposureModel::Dispersion => f.write_str("aermod"),
            ExposureModel::Kernel { kind, bandwidth_km } => {
                write!(f, "{}{}", kind.short_name(), bandwidth_km)
            }
        }
    }
}

impl FromStr for ExposureModel {
    type Err = AirqError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "aermod" {
            return Ok(ExposureModel::Dispersion);
        }
        let not_valid = || invalid(format!("Model '{s}' not valid"));
        let kind = KernelKind::ALL
            .into_iter()
            .find(|k| s.starts_with(k.short_name()))
            .ok_or_else(not_valid)?;
        let band = &s[kind.short_name().len()..];
        if band.is_empty() || !band.chars().all(|c| c.is_ascii_digit()) {
            return Err(not_valid());
        }
        let bandwidth_km: u32 = band.parse().map_err(|_| not_valid())?;
        if bandwidth_km == 0 {
            return Err(not_valid());
        }
        Ok(ExposureModel::Kernel { kind, bandwidth_km })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criteria {
    Nox,
    Co,
    Rog,
    Sox,
    Tsp,
}

impl Criteria {
    pub const ALL: [Criteria; 5] = [
        Criteria::Nox,
        Criteria::Co,
        Criteria::Rog,
        Criteria::Sox,
        Criteria::Tsp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Criteria::Nox => "nox",
            Criteria::Co => "co",
            Criteria::Rog => "rog",
            Criteria::Sox => "sox",
            Criteria::Tsp => "tsp",
        }
    }
}

/// Criteria pollutants are reported quarterly in tons, toxics annually in pounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pollutant {
    Criteria(Criteria),
    Toxic(String),
}

impl Pollutant {
    pub fn is_quarterly(&self) -> bool {
        matches!(self, Pollutant::Criteria(_))
    }
}

impl Default for Pollutant {
    fn default() -> Self {
        Pollutant::Criteria(Criteria::Nox)
    }
}

impl fmt::Display for Pollutant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pollutant::Criteria(c) => f.write_str(c.name()),
            Pollutant::Toxic(name) => f.write_str(name),
        }
    }
}

impl FromStr for Pollutant {
    type Err = AirqError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(c) = Criteria::ALL.into_iter().find(|c| c.name() == s) {
            return Ok(Pollutant::Criteria(c));
        }
        if s.is_empty()
            || !s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid(format!("Pollutant '{s}' not valid")));
        }
        Ok(Pollutant::Toxic(s.to_string()))
    }
}
