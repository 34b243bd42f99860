//! Upstream input tables (receptors, stacks, emissions, firm groups) and the
//! polars column helpers the rest of the crate reads them with.
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{invalid, AirqError, Result};
use crate::model::{FacId, Geounit, Pollutant};

pub const UTM_EAST: &str = "utm_east";
pub const UTM_NORTH: &str = "utm_north";

pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    if !path.is_file() {
        return Err(AirqError::MissingArtifact(path.to_path_buf()));
    }
    let file = File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

pub fn column<'a>(frame: &'a DataFrame, name: &str) -> Result<&'a Series> {
    Ok(frame.column(name)?.as_materialized_series())
}

pub fn f64_values(frame: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = column(frame, name)?.cast(&DataType::Float64)?;
    series
        .f64()?
        .into_iter()
        .map(|v| v.ok_or_else(|| invalid(format!("Column '{name}' has missing values"))))
        .collect()
}

pub fn f64_options(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = column(frame, name)?.cast(&DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}

/// Like [`f64_values`], with gaps read as zero.
pub fn f64_values_or_zero(frame: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let series = column(frame, name)?.cast(&DataType::Float64)?;
    Ok(series.f64()?.into_iter().map(|v| v.unwrap_or(0.0)).collect())
}

pub fn i64_values(frame: &DataFrame, name: &str) -> Result<Vec<i64>> {
    let series = column(frame, name)?.cast(&DataType::Int64)?;
    series
        .i64()?
        .into_iter()
        .map(|v| v.ok_or_else(|| invalid(format!("Column '{name}' has missing values"))))
        .collect()
}

pub fn string_values(frame: &DataFrame, name: &str) -> Result<Vec<String>> {
    let series = column(frame, name)?.cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or_default().to_string())
        .collect())
}

/// `(utm_east, utm_north)` as the 32-bit integer key cached tables are indexed by.
pub fn utm_keys(frame: &DataFrame) -> Result<Vec<(i32, i32)>> {
    let east = i64_values(frame, UTM_EAST)?;
    let north = i64_values(frame, UTM_NORTH)?;
    Ok(east
        .into_iter()
        .zip(north)
        .map(|(e, n)| (e as i32, n as i32))
        .collect())
}

/// A receptor location in UTM meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Receptor {
    pub utm_east: f64,
    pub utm_north: f64,
}

impl Receptor {
    pub fn new(utm_east: f64, utm_north: f64) -> Self {
        Self { utm_east, utm_north }
    }

    /// Truncated to whole meters, matching how model output is indexed.
    pub fn key(&self) -> (i32, i32) {
        (self.utm_east as i32, self.utm_north as i32)
    }

    pub fn distance_m(&self, (east, north): (f64, f64)) -> f64 {
        (self.utm_east - east).hypot(self.utm_north - north)
    }
}

/// Drops repeated coordinates, keeping first occurrences in order.
pub fn dedup_receptors(receptors: Vec<Receptor>) -> Vec<Receptor> {
    let mut seen = FxHashSet::default();
    receptors
        .into_iter()
        .filter(|r| seen.insert((r.utm_east.to_bits(), r.utm_north.to_bits())))
        .collect()
}

/// Physical stack parameters for one emission point.
#[derive(Debug, Clone, PartialEq)]
pub struct Stack {
    pub facid: FacId,
    pub utm_east: f64,
    pub utm_north: f64,
    /// meters
    pub height: f64,
    /// Kelvin
    pub exit_temp: f64,
    /// meters per second
    pub exit_velocity: f64,
    /// meters
    pub diameter: f64,
    pub emit_share: f64,
}

/// Meteorology and population metadata the dispersion model needs per facility.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteMeta {
    pub pop1990: i64,
    pub metsite_code: String,
    pub metsite_z: f64,
    pub metsite_year: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StackTable {
    stacks: BTreeMap<FacId, Vec<Stack>>,
    meta: FxHashMap<FacId, SiteMeta>,
}

impl StackTable {
    /// Groups stacks by facility, keeping input order within a facility.
    /// The first stack's metadata stands for the whole facility.
    pub fn from_parts(rows: Vec<(Stack, SiteMeta)>) -> Self {
        let mut table = Self::default();
        for (stack, meta) in rows {
            table.meta.entry(stack.facid).or_insert(meta);
            table.stacks.entry(stack.facid).or_default().push(stack);
        }
        table
    }

    pub fn from_frame(frame: &DataFrame) -> Result<Self> {
        let facid = i64_values(frame, "facid")?;
        let east = f64_values(frame, UTM_EAST)?;
        let north = f64_values(frame, UTM_NORTH)?;
        let height = f64_values(frame, "stack_ht")?;
        let temp = f64_values(frame, "stack_temp")?;
        let veloc = f64_values(frame, "stack_veloc")?;
        let diam = f64_values(frame, "stack_diam")?;
        let share = f64_values(frame, "emit_share")?;
        let pop = i64_values(frame, "pop1990")?;
        let code = string_values(frame, "metsite_code")?;
        let z = f64_values(frame, "metsite_z")?;
        let year = i64_values(frame, "metsite_year")?;

        let rows = (0..frame.height())
            .map(|i| {
                (
                    Stack {
                        facid: facid[i],
                        utm_east: east[i],
                        utm_north: north[i],
                        height: height[i],
                        exit_temp: temp[i],
                        exit_velocity: veloc[i],
                        diameter: diam[i],
                        emit_share: share[i],
                    },
                    SiteMeta {
                        pop1990: pop[i],
                        metsite_code: code[i].clone(),
                        metsite_z: z[i],
                        metsite_year: year[i] as i32,
                    },
                )
            })
            .collect();
        Ok(Self::from_parts(rows))
    }

    /// Sorted facility ids.
    pub fn facids(&self) -> Vec<FacId> {
        self.stacks.keys().copied().collect()
    }

    pub fn for_facility(&self, facid: FacId) -> &[Stack] {
        self.stacks.get(&facid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_stacks(&self, facid: FacId) -> usize {
        self.for_facility(facid).len()
    }

    pub fn meta(&self, facid: FacId) -> Option<&SiteMeta> {
        self.meta.get(&facid)
    }

    /// Mean stack location of a facility.
    pub fn centroid(&self, facid: FacId) -> Option<(f64, f64)> {
        let stacks = self.for_facility(facid);
        if stacks.is_empty() {
            return None;
        }
        let n = stacks.len() as f64;
        let east = stacks.iter().map(|s| s.utm_east).sum::<f64>() / n;
        let north = stacks.iter().map(|s| s.utm_north).sum::<f64>() / n;
        Some((east, north))
    }
}

/// One emissions observation. `quarter` is `None` for annual toxics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionRecord {
    pub facid: FacId,
    pub year: i32,
    pub quarter: Option<u8>,
    /// tons for criteria pollutants, pounds for toxics
    pub amount: f64,
}

/// Maps raw facids onto their group representative.
#[derive(Debug, Clone, Default)]
pub struct FirmGroups {
    rep: FxHashMap<FacId, FacId>,
}

impl FirmGroups {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (FacId, FacId)>) -> Self {
        Self {
            rep: pairs.into_iter().collect(),
        }
    }

    /// Ungrouped facids represent themselves.
    pub fn representative(&self, facid: FacId) -> FacId {
        self.rep.get(&facid).copied().unwrap_or(facid)
    }
}

/// Reader for the cleaned tables produced upstream under `data_path`.
#[derive(Debug, Clone)]
pub struct InputTables {
    data_path: PathBuf,
}

impl InputTables {
    pub fn new(data_path: &Path) -> Self {
        Self {
            data_path: data_path.to_path_buf(),
        }
    }

    pub fn receptors_path(&self, geounit: Geounit) -> PathBuf {
        self.data_path.join(format!("receptors_{geounit}.parquet"))
    }

    pub fn stacks_path(&self) -> PathBuf {
        self.data_path.join("stacks.parquet")
    }

    pub fn emissions_path(&self, pollutant: &Pollutant) -> PathBuf {
        match pollutant {
            Pollutant::Criteria(_) => self.data_path.join(format!("emissions_{pollutant}.parquet")),
            Pollutant::Toxic(_) => self.data_path.join(format!("toxics_{pollutant}.parquet")),
        }
    }

    pub fn electrics_path(&self) -> PathBuf {
        self.data_path.join("electric_facids.parquet")
    }

    pub fn firm_groups_path(&self) -> PathBuf {
        self.data_path.join("firm_groups.parquet")
    }

    /// Deduplicated receptor coordinates of a geounit.
    pub fn receptors(&self, geounit: Geounit) -> Result<Vec<Receptor>> {
        let frame = read_parquet(&self.receptors_path(geounit))?;
        let east = f64_values(&frame, UTM_EAST)?;
        let north = f64_values(&frame, UTM_NORTH)?;
        let receptors = east
            .into_iter()
            .zip(north)
            .map(|(e, n)| Receptor::new(e, n))
            .collect();
        Ok(dedup_receptors(receptors))
    }

    pub fn stacks(&self) -> Result<StackTable> {
        StackTable::from_frame(&read_parquet(&self.stacks_path())?)
    }

    pub fn emissions(&self, pollutant: &Pollutant) -> Result<Vec<EmissionRecord>> {
        let frame = read_parquet(&self.emissions_path(pollutant))?;
        let facid = i64_values(&frame, "facid")?;
        let year = i64_values(&frame, "year")?;
        let (quarter, amount) = match pollutant {
            Pollutant::Criteria(_) => (
                i64_values(&frame, "quarter")?
                    .into_iter()
                    .map(|q| Some(q as u8))
                    .collect(),
                f64_values_or_zero(&frame, "tons")?,
            ),
            Pollutant::Toxic(_) => (vec![None; frame.height()], f64_values_or_zero(&frame, "lbs")?),
        };
        Ok((0..frame.height())
            .map(|i| EmissionRecord {
                facid: facid[i],
                year: year[i] as i32,
                quarter: quarter[i],
                amount: amount[i],
            })
            .collect())
    }

    /// Facilities that are electric utilities.
    pub fn electric_facids(&self) -> Result<Vec<FacId>> {
        let frame = read_parquet(&self.electrics_path())?;
        let mut facids = i64_values(&frame, "facid")?;
        facids.sort_unstable();
        facids.dedup();
        Ok(facids)
    }

    /// Identity grouping when no crosswalk has been produced.
    pub fn firm_groups(&self) -> Result<FirmGroups> {
        let path = self.firm_groups_path();
        if !path.is_file() {
            return Ok(FirmGroups::default());
        }
        let frame = read_parquet(&path)?;
        let facid = i64_values(&frame, "facid")?;
        let rep = i64_values(&frame, "group_rep")?;
        Ok(FirmGroups::from_pairs(facid.into_iter().zip(rep)))
    }
}
