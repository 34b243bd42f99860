//! Panels built from other panels: the electric and non-electric split of a
//! full panel, and geounit panels cut out of the grid.
use polars::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::aggregate::{load_full_exposure, sum_all_firms, AggregateTarget};
use crate::env::Environment;
use crate::error::{invalid, Result};
use crate::model::{FacId, Geounit};
use crate::store::{ArtifactKey, Radius};
use crate::table::{column, f64_values_or_zero, i64_values, utm_keys, Receptor, UTM_EAST, UTM_NORTH};

/// Spacing of the grid geounit's receptors, meters.
pub const GRID_SIZE_M: f64 = 100.0;

const QUARTER: &str = "quarter";

pub fn round_nearest(x: f64, step: f64) -> f64 {
    (x / step).round() * step
}

/// Which side of the electric-utility split a panel covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectricSplit {
    Electric,
    NonElectric,
}

impl ElectricSplit {
    pub fn from_flag(flag: u8) -> Result<Self> {
        match flag {
            1 => Ok(ElectricSplit::Electric),
            0 => Ok(ElectricSplit::NonElectric),
            _ => Err(invalid(format!("Electric flag must be 0 or 1, got {flag}"))),
        }
    }

    pub fn flag(&self) -> u8 {
        match self {
            ElectricSplit::Electric => 1,
            ElectricSplit::NonElectric => 0,
        }
    }
}

impl AggregateTarget {
    pub fn electric_stem(&self, geounit: Geounit, split: ElectricSplit) -> String {
        format!("{}_el{}", self.cache_stem(geounit), split.flag())
    }
}

fn is_key_column(name: &str) -> bool {
    name == UTM_EAST || name == UTM_NORTH || name == QUARTER
}

/// `(utm_east, utm_north, quarter)` per row; annual panels use quarter 0.
fn panel_keys(frame: &DataFrame) -> Result<Vec<(i32, i32, i32)>> {
    let quarter = if frame.get_column_index(QUARTER).is_some() {
        i64_values(frame, QUARTER)?
    } else {
        vec![0; frame.height()]
    };
    Ok(utm_keys(frame)?
        .into_iter()
        .zip(quarter)
        .map(|((e, n), q)| (e, n, q as i32))
        .collect())
}

/// `full - part`, aligned on the panel keys. The rows and year columns of
/// `full` make up the result; cells `part` lacks subtract nothing.
pub fn subtract_panels(full: &DataFrame, part: &DataFrame) -> Result<DataFrame> {
    let part_rows: FxHashMap<(i32, i32, i32), usize> = panel_keys(part)?
        .into_iter()
        .enumerate()
        .map(|(i, k)| (k, i))
        .collect();
    let rows: Vec<Option<usize>> = panel_keys(full)?
        .iter()
        .map(|k| part_rows.get(k).copied())
        .collect();
    let matched = rows.iter().flatten().count();
    if matched < part.height() {
        debug!(
            "{} rows of the subtracted panel are not in the full panel",
            part.height() - matched
        );
    }

    let part_names = part.get_column_names_str();
    let mut columns = Vec::with_capacity(full.width());
    for name in full.get_column_names_str() {
        if is_key_column(name) {
            columns.push(column(full, name)?.clone());
            continue;
        }
        let mut values = f64_values_or_zero(full, name)?;
        if part_names.contains(&name) {
            let minus = f64_values_or_zero(part, name)?;
            for (v, row) in values.iter_mut().zip(&rows) {
                if let Some(r) = row {
                    *v -= minus[*r];
                }
            }
        }
        columns.push(Series::new(name.into(), values));
    }
    Ok(columns.into_iter().collect())
}

/// The panel over `electrics` (electric utilities) or over everything else.
/// Both sides are cached next to the full panel with an `_el1` / `_el0` suffix.
pub fn load_electric_exposure(
    env: &Environment,
    geounit: Geounit,
    target: &AggregateTarget,
    split: ElectricSplit,
    electrics: &[FacId],
    parallel: bool,
) -> Result<DataFrame> {
    let path = env.store.table_path(&target.electric_stem(geounit, split));
    if let Some(frame) = env.store.try_read(&path)? {
        debug!("Loaded cached exposure from {}", path.display());
        return Ok(frame);
    }
    let mut frame = match split {
        ElectricSplit::Electric => {
            sum_all_firms(env, geounit, target, Some(electrics), parallel)?.to_frame()
        }
        ElectricSplit::NonElectric => {
            let full = load_full_exposure(env, geounit, target, parallel)?;
            let electric = load_electric_exposure(
                env,
                geounit,
                target,
                ElectricSplit::Electric,
                electrics,
                parallel,
            )?;
            subtract_panels(&full, &electric)?
        }
    };
    env.store.write(&path, &mut frame)?;
    info!("Cached exposure at {}", path.display());
    Ok(frame)
}

/// Pairs each receptor's own key with the grid cell it falls in. House
/// receptors already sit on grid points; everything else is rounded.
pub fn grid_cells(receptors: &[Receptor], geounit: Geounit) -> Vec<((i32, i32), (i32, i32))> {
    let mut cells: Vec<_> = receptors
        .iter()
        .map(|r| {
            let cell = match geounit {
                Geounit::House | Geounit::Grid => r.key(),
                _ => Receptor::new(
                    round_nearest(r.utm_east, GRID_SIZE_M),
                    round_nearest(r.utm_north, GRID_SIZE_M),
                )
                .key(),
            };
            (r.key(), cell)
        })
        .collect();
    cells.sort_unstable();
    cells.dedup();
    cells
}

/// The rows of `grid` at each receptor's cell, relabelled with the receptor's
/// own coordinates. Receptors off the grid are dropped.
pub fn cut_from_grid(grid: &DataFrame, cells: &[((i32, i32), (i32, i32))]) -> Result<DataFrame> {
    let mut by_cell: FxHashMap<(i32, i32), Vec<IdxSize>> = FxHashMap::default();
    for (i, key) in utm_keys(grid)?.into_iter().enumerate() {
        by_cell.entry(key).or_default().push(i as IdxSize);
    }
    let mut idx = Vec::new();
    let mut east = Vec::new();
    let mut north = Vec::new();
    for (own, cell) in cells {
        for &row in by_cell.get(cell).map(Vec::as_slice).unwrap_or(&[]) {
            idx.push(row);
            east.push(own.0);
            north.push(own.1);
        }
    }
    let mut frame = grid.take(&IdxCa::from_vec("idx".into(), idx))?;
    frame.replace(UTM_EAST, Series::new(UTM_EAST.into(), east))?;
    frame.replace(UTM_NORTH, Series::new(UTM_NORTH.into(), north))?;
    Ok(frame)
}

/// The full panel of `geounit` taken from the grid panel rather than summed
/// over facility artifacts. Cached under the same name as the summed panel.
pub fn load_exposure_from_grids(
    env: &Environment,
    geounit: Geounit,
    target: &AggregateTarget,
    parallel: bool,
) -> Result<DataFrame> {
    if geounit == Geounit::Grid {
        return load_full_exposure(env, geounit, target, parallel);
    }
    let path = env.store.table_path(&target.cache_stem(geounit));
    if let Some(frame) = env.store.try_read(&path)? {
        debug!("Loaded cached exposure from {}", path.display());
        return Ok(frame);
    }
    let grid = load_full_exposure(env, Geounit::Grid, target, parallel)?;
    let cells = grid_cells(&env.inputs.receptors(geounit)?, geounit);
    let mut frame = cut_from_grid(&grid, &cells)?;
    info!(
        "{} of {} {geounit} receptors fall on the grid",
        frame.height() / target.shape().periods(),
        cells.len()
    );
    env.store.write(&path, &mut frame)?;
    Ok(frame)
}

/// Builds and caches a facility's house artifact from its grid artifact.
/// `None` when the grid artifact is not on disk either.
pub fn house_artifact_from_grid(
    env: &Environment,
    key: ArtifactKey,
    radius: Radius,
    house_keys: &[(i32, i32)],
) -> Result<Option<DataFrame>> {
    let grid_key = ArtifactKey {
        geounit: Geounit::Grid,
        ..key
    };
    let Some(grid) = env.store.try_read(&env.store.path_for(&grid_key, radius)?)? else {
        return Ok(None);
    };
    let cells: Vec<_> = house_keys.iter().map(|&k| (k, k)).collect();
    let mut frame = cut_from_grid(&grid, &cells)?;
    let path = env.store.path_for(&ArtifactKey { geounit: Geounit::House, ..key }, radius)?;
    env.store.write(&path, &mut frame)?;
    debug!("Cut {} from the grid artifact", path.display());
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExposureModel, Pollutant};
    use crate::table::f64_values;

    fn panel(rows: &[(i32, i32, i32, f64)]) -> DataFrame {
        [
            Series::new(UTM_EAST.into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            Series::new(UTM_NORTH.into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
            Series::new(QUARTER.into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()),
            Series::new("1994".into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn electric_names() {
        let target = AggregateTarget::new(ExposureModel::Dispersion, Pollutant::default());
        assert_eq!(
            target.electric_stem(Geounit::Block, ElectricSplit::Electric),
            "blocks_aermod_nox_el1"
        );
        assert_eq!(
            target.electric_stem(Geounit::Block, ElectricSplit::from_flag(0).unwrap()),
            "blocks_aermod_nox_el0"
        );
        assert!(ElectricSplit::from_flag(2).is_err());
    }

    #[test]
    fn subtraction_aligns_on_keys() {
        let full = panel(&[(0, 0, 1, 5.0), (0, 0, 2, 6.0), (10, 0, 1, 7.0)]);
        let part = panel(&[(10, 0, 1, 2.0), (0, 0, 2, 1.5), (99, 99, 1, 9.0)]);
        let diff = subtract_panels(&full, &part).unwrap();
        assert_eq!(diff.height(), 3);
        assert_eq!(f64_values(&diff, "1994").unwrap(), vec![5.0, 4.5, 5.0]);
        assert_eq!(f64_values(&diff, QUARTER).unwrap(), vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn non_house_receptors_round_to_cells() {
        let receptors = [Receptor::new(1049.0, 3.0), Receptor::new(1151.7, -60.0)];
        let cells = grid_cells(&receptors, Geounit::Block);
        assert_eq!(cells, vec![((1049, 3), (1000, 0)), ((1151, -60), (1200, -100))]);
        let houses = grid_cells(&[Receptor::new(1000.0, 0.0)], Geounit::House);
        assert_eq!(houses, vec![((1000, 0), (1000, 0))]);
    }

    #[test]
    fn cutting_relabels_and_drops_off_grid() {
        let grid = panel(&[(1000, 0, 1, 1.0), (1000, 0, 2, 2.0), (1100, 0, 1, 3.0), (1100, 0, 2, 4.0)]);
        let cells = [((1049, 3), (1000, 0)), ((1151, 0), (1200, 0))];
        let cut = cut_from_grid(&grid, &cells).unwrap();
        assert_eq!(utm_keys(&cut).unwrap(), vec![(1049, 3), (1049, 3)]);
        assert_eq!(f64_values(&cut, "1994").unwrap(), vec![1.0, 2.0]);
    }
}
