//! Receptor counts per facility and the CPU budget they imply for cluster jobs.
use std::collections::BTreeMap;

use polars::prelude::*;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::codec::MAX_CHUNKS;
use crate::config::Config;
use crate::env::Environment;
use crate::error::{invalid, Result};
use crate::model::{FacId, Geounit};
use crate::progress_bar;
use crate::store::Radius;
use crate::table::{i64_values, Receptor, StackTable};

/// Receptors within range of each facility.
pub type UnitCounts = BTreeMap<FacId, u64>;

pub fn radius_m(config: &Config, radius: Radius) -> f64 {
    let km = match radius {
        Radius::Default => config.radius_km,
        Radius::Alternate => config.alt_radius_km,
    };
    km * 1000.0
}

pub fn within_radius(receptor: &Receptor, center: (f64, f64), radius_m: f64) -> bool {
    receptor.distance_m(center) <= radius_m
}

pub fn count_units_within(
    receptors: &[Receptor],
    stacks: &StackTable,
    facids: &[FacId],
    radius_m: f64,
) -> UnitCounts {
    let progress = progress_bar(facids.len(), "Counting units");

    let counts = facids
        .par_iter()
        .filter_map(|&facid| {
            let center = stacks.centroid(facid)?;
            let units = receptors
                .iter()
                .filter(|r| within_radius(r, center, radius_m))
                .count() as u64;
            progress.inc(1);
            Some((facid, units))
        })
        .collect();
    progress.finish_and_clear();
    counts
}

/// Facilities the alternate radius may be run for. An explicit list must be a
/// subset of the configured ones.
fn alt_radius_facilities(config: &Config, facility_list: Option<&[FacId]>) -> Result<Vec<FacId>> {
    match facility_list {
        None => Ok(config.alt_radius_facilities.clone()),
        Some(list) if list.iter().all(|f| config.uses_alt_radius(*f)) => Ok(list.to_vec()),
        Some(_) => Err(invalid("Passed firm list conflicts with alternate radius")),
    }
}

fn units_path_stem(geounit: Geounit, radius: Radius) -> String {
    let tag = if radius.is_alternate() { "alt" } else { "default" };
    format!("units_{geounit}_{tag}")
}

fn units_to_frame(units: &UnitCounts) -> DataFrame {
    let facids: Vec<i64> = units.keys().copied().collect();
    let counts: Vec<i64> = units.values().map(|&u| u as i64).collect();
    [
        Series::new("facid".into(), facids),
        Series::new("units".into(), counts),
    ]
    .into_iter()
    .collect()
}

fn units_from_frame(frame: &DataFrame) -> Result<UnitCounts> {
    let facids = i64_values(frame, "facid")?;
    let counts = i64_values(frame, "units")?;
    Ok(facids
        .into_iter()
        .zip(counts)
        .map(|(f, u)| (f, u.max(0) as u64))
        .collect())
}

/// Receptor count per facility, cached per `(geounit, radius)`. Requests for a
/// subset of facilities are computed fresh and never cached.
pub fn count_units(
    env: &Environment,
    geounit: Geounit,
    facility_list: Option<&[FacId]>,
    radius: Radius,
) -> Result<UnitCounts> {
    let cache_path = env.store.table_path(&units_path_stem(geounit, radius));
    if facility_list.is_none() {
        if let Some(frame) = env.store.try_read(&cache_path)? {
            debug!("Loaded unit counts from {}", cache_path.display());
            return units_from_frame(&frame);
        }
    }

    let stacks = env.inputs.stacks()?;
    let facids = match (radius, facility_list) {
        (Radius::Alternate, list) => alt_radius_facilities(&env.config, list)?,
        (Radius::Default, Some(list)) => list.to_vec(),
        (Radius::Default, None) => stacks.facids(),
    };
    let receptors = env.inputs.receptors(geounit)?;
    info!(
        "Counting {geounit} receptors near {} facilities ({} receptors)",
        facids.len(),
        receptors.len()
    );
    let units = count_units_within(&receptors, &stacks, &facids, radius_m(&env.config, radius));

    if facility_list.is_none() {
        env.store.write(&cache_path, &mut units_to_frame(&units))?;
    }
    Ok(units)
}

/// Dense 0-based index over every facid seen in the emissions data, used as a
/// short token in scheduler job names.
#[derive(Debug, Clone, Default)]
pub struct FirmIndex {
    ids: Vec<FacId>,
}

impl FirmIndex {
    pub fn new(facids: impl IntoIterator<Item = FacId>) -> Self {
        let mut ids: Vec<FacId> = facids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    pub fn firm_id(&self, facid: FacId) -> Option<usize> {
        self.ids.binary_search(&facid).ok()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacilityResources {
    pub facid: FacId,
    pub firm_id: usize,
    pub units: u64,
    pub num_stacks: usize,
    /// minutes
    pub cpu_per_stack: f64,
    /// minutes
    pub total_cpu: f64,
    pub num_chunks: u32,
}

/// Jobs needed to keep each under the time limit, never more than one per stack.
pub fn num_chunks_for(total_cpu: f64, job_limit_minutes: f64, num_stacks: usize) -> u32 {
    if total_cpu <= 0.0 || num_stacks == 0 {
        return 0;
    }
    let raw = (total_cpu / job_limit_minutes).ceil().max(1.0) as u32;
    raw.min(num_stacks as u32).min(MAX_CHUNKS)
}

/// Per-facility CPU estimate. Facilities with no receptors in range, or
/// absent from the emissions table, are dropped.
pub fn estimate_resources(
    config: &Config,
    units: &UnitCounts,
    stacks: &StackTable,
    firm_index: &FirmIndex,
    facility_list: Option<&[FacId]>,
) -> Result<Vec<FacilityResources>> {
    let selected: Vec<(FacId, u64)> = match facility_list {
        None => units.iter().map(|(&f, &u)| (f, u)).collect(),
        Some(list) => list
            .iter()
            .map(|f| {
                units
                    .get(f)
                    .map(|&u| (*f, u))
                    .ok_or_else(|| invalid(format!("No unit count for facility {f}")))
            })
            .collect::<Result<_>>()?,
    };

    let mut out = Vec::with_capacity(selected.len());
    for (facid, units) in selected {
        let num_stacks = stacks.num_stacks(facid);
        if num_stacks == 0 {
            continue;
        }
        let cpu_per_stack = units as f64 * config.cpu_seconds_per_unit / 60.0;
        if cpu_per_stack <= 0.0 {
            continue;
        }
        let Some(firm_id) = firm_index.firm_id(facid) else {
            warn!("Facility {facid} has no emissions records, no jobs planned");
            continue;
        };
        let total_cpu = cpu_per_stack * num_stacks as f64;
        out.push(FacilityResources {
            facid,
            firm_id,
            units,
            num_stacks,
            cpu_per_stack,
            total_cpu,
            num_chunks: num_chunks_for(total_cpu, config.job_time_limit_minutes, num_stacks),
        });
    }
    Ok(out)
}
