//! Emission-weighted exposure summed over facilities.
//!
//! Each facility's raw normalized exposure is aligned to the full receptor
//! index of a geounit and multiplied by its emission rate in grams per second
//! through an outer product across time. The result is a receptor (by quarter,
//! for criteria pollutants) by year panel.
use indicatif::ProgressBar;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::prelude::*;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::driver::{KERNEL_COLUMN, QUARTER_COLUMNS};
use crate::env::Environment;
use crate::error::{AirqError, Result};
use crate::model::{ExposureModel, FacId, Geounit, Pollutant};
use crate::panels::house_artifact_from_grid;
use crate::progress_bar;
use crate::resources::count_units;
use crate::store::{ArtifactKey, Radius};
use crate::table::{f64_options, f64_values_or_zero, utm_keys, EmissionRecord, FirmGroups, Receptor, UTM_EAST, UTM_NORTH};

pub const GRAMS_PER_POUND: f64 = 453.59237;
pub const POUNDS_PER_TON: f64 = 2000.0;
pub const SECONDS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0;

pub fn tons_per_year_to_grams_per_second(tons: f64) -> f64 {
    tons * POUNDS_PER_TON * GRAMS_PER_POUND / SECONDS_PER_YEAR
}

/// Quarterly tonnage as an annualized rate.
pub fn tons_per_quarter_to_grams_per_second(tons: f64) -> f64 {
    tons_per_year_to_grams_per_second(tons * 4.0)
}

pub fn pounds_per_year_to_grams_per_second(pounds: f64) -> f64 {
    pounds * GRAMS_PER_POUND / SECONDS_PER_YEAR
}

/// Five decimals, the precision the dispersion model writes.
pub fn round5(x: f64) -> f64 {
    (x * 1e5).round() / 1e5
}

/// Time resolution of an aggregate panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateShape {
    Quarterly,
    Annual,
}

impl AggregateShape {
    pub fn periods(&self) -> usize {
        match self {
            AggregateShape::Quarterly => 4,
            AggregateShape::Annual => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateTarget {
    pub model: ExposureModel,
    pub pollutant: Pollutant,
}

impl AggregateTarget {
    pub fn new(model: ExposureModel, pollutant: Pollutant) -> Self {
        Self { model, pollutant }
    }

    pub fn shape(&self) -> AggregateShape {
        if self.pollutant.is_quarterly() {
            AggregateShape::Quarterly
        } else {
            AggregateShape::Annual
        }
    }

    /// Stem of the cached panel in the primary root.
    pub fn cache_stem(&self, geounit: Geounit) -> String {
        format!("{geounit}s_{}_{}", self.model, self.pollutant)
    }
}

/// Emission rates in grams per second, `periods x years` per facility. Gaps are zero.
#[derive(Debug, Clone)]
pub struct EmissionRates {
    years: Vec<i32>,
    rates: FxHashMap<FacId, Array2<f64>>,
}

impl EmissionRates {
    pub fn from_records(records: &[EmissionRecord], years: &[i32], shape: AggregateShape) -> Self {
        let first = years.first().copied().unwrap_or_default();
        let mut rates: FxHashMap<FacId, Array2<f64>> = FxHashMap::default();
        for rec in records {
            let col = (rec.year - first) as usize;
            if rec.year < first || col >= years.len() {
                continue;
            }
            let (row, rate) = match (shape, rec.quarter) {
                (AggregateShape::Quarterly, Some(q @ 1..=4)) => {
                    (q as usize - 1, tons_per_quarter_to_grams_per_second(rec.amount))
                }
                (AggregateShape::Annual, None) => (0, pounds_per_year_to_grams_per_second(rec.amount)),
                _ => continue,
            };
            rates
                .entry(rec.facid)
                .or_insert_with(|| Array2::zeros((shape.periods(), years.len())))[[row, col]] += rate;
        }
        Self {
            years: years.to_vec(),
            rates,
        }
    }

    pub fn get(&self, facid: FacId) -> Option<&Array2<f64>> {
        self.rates.get(&facid)
    }

    pub fn years(&self) -> &[i32] {
        &self.years
    }
}

/// Row of every receptor of a geounit, keyed by truncated UTM meters.
#[derive(Debug, Clone)]
pub struct ReceptorIndex {
    keys: Vec<(i32, i32)>,
    rows: FxHashMap<(i32, i32), usize>,
}

impl ReceptorIndex {
    pub fn new(receptors: &[Receptor]) -> Self {
        let mut keys: Vec<(i32, i32)> = receptors.iter().map(Receptor::key).collect();
        keys.sort_unstable();
        keys.dedup();
        let rows = keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        Self { keys, rows }
    }

    pub fn row(&self, key: (i32, i32)) -> Option<usize> {
        self.rows.get(&key).copied()
    }

    pub fn keys(&self) -> &[(i32, i32)] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Summed exposure; row `r * periods + p` is receptor `r` in period `p`.
#[derive(Debug, Clone)]
pub struct ExposurePanel {
    pub keys: Vec<(i32, i32)>,
    pub shape: AggregateShape,
    pub years: Vec<i32>,
    pub values: Array2<f64>,
}

impl ExposurePanel {
    pub fn to_frame(&self) -> DataFrame {
        let periods = self.shape.periods();
        let east: Vec<i32> = self
            .keys
            .iter()
            .flat_map(|k| std::iter::repeat(k.0).take(periods))
            .collect();
        let north: Vec<i32> = self
            .keys
            .iter()
            .flat_map(|k| std::iter::repeat(k.1).take(periods))
            .collect();
        let mut columns = vec![
            Series::new(UTM_EAST.into(), east),
            Series::new(UTM_NORTH.into(), north),
        ];
        if self.shape == AggregateShape::Quarterly {
            let quarter: Vec<i32> = (0..self.keys.len()).flat_map(|_| 1..=4).collect();
            columns.push(Series::new("quarter".into(), quarter));
        }
        for (j, year) in self.years.iter().enumerate() {
            columns.push(Series::new(
                year.to_string().into(),
                self.values.column(j).to_vec(),
            ));
        }
        columns.into_iter().collect()
    }
}

fn outer(a: &Array1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    a.view().insert_axis(Axis(1)).dot(&b.insert_axis(Axis(0)))
}

/// Adds `contribution` (one row per artifact row) into period `period` of `total`.
fn scatter(
    total: &mut Array2<f64>,
    rows: &[Option<usize>],
    contribution: &Array2<f64>,
    periods: usize,
    period: usize,
) {
    for (i, row) in rows.iter().enumerate() {
        if let Some(r) = row {
            let mut dst = total.row_mut(r * periods + period);
            dst += &contribution.row(i);
        }
    }
}

/// Mean over the quarters present in each row; a row with none is zero.
fn quarter_mean(frame: &DataFrame) -> Result<Array1<f64>> {
    let mut sum = vec![0.0; frame.height()];
    let mut count = vec![0u32; frame.height()];
    for name in QUARTER_COLUMNS {
        for (i, v) in f64_options(frame, name)?.into_iter().enumerate() {
            if let Some(v) = v {
                sum[i] += v;
                count[i] += 1;
            }
        }
    }
    Ok(sum
        .into_iter()
        .zip(count)
        .map(|(s, n)| if n > 0 { s / n as f64 } else { 0.0 })
        .collect())
}

/// Adds one facility's emission-weighted exposure into `total`.
pub fn add_firm_exposure(
    total: &mut Array2<f64>,
    frame: &DataFrame,
    target: &AggregateTarget,
    rate: &Array2<f64>,
    index: &ReceptorIndex,
    kernel_calibration: f64,
) -> Result<()> {
    let rows: Vec<Option<usize>> = utm_keys(frame)?
        .into_iter()
        .map(|k| index.row(k))
        .collect();
    let missing = rows.iter().filter(|r| r.is_none()).count();
    if missing > 0 {
        debug!("{missing} artifact receptors are not in the receptor index");
    }

    let shape = target.shape();
    let periods = shape.periods();
    match (target.model, shape) {
        (ExposureModel::Dispersion, AggregateShape::Quarterly) => {
            for (q, name) in QUARTER_COLUMNS.iter().enumerate() {
                let exposure = Array1::from(f64_values_or_zero(frame, name)?);
                let contribution = outer(&exposure, rate.row(q)).mapv(round5);
                scatter(total, &rows, &contribution, periods, q);
            }
        }
        (ExposureModel::Dispersion, AggregateShape::Annual) => {
            let exposure = quarter_mean(frame)?;
            let contribution = outer(&exposure, rate.row(0)).mapv(round5);
            scatter(total, &rows, &contribution, periods, 0);
        }
        (ExposureModel::Kernel { .. }, _) => {
            let exposure = Array1::from(f64_values_or_zero(frame, KERNEL_COLUMN)?);
            for p in 0..periods {
                let contribution = outer(&exposure, rate.row(p)) * kernel_calibration;
                scatter(total, &rows, &contribution, periods, p);
            }
        }
    }
    Ok(())
}

/// Shared read-only state of one aggregation run.
struct Aggregation<'a> {
    env: &'a Environment,
    geounit: Geounit,
    target: &'a AggregateTarget,
    rates: EmissionRates,
    index: ReceptorIndex,
    groups: FirmGroups,
}

impl Aggregation<'_> {
    fn zeros(&self) -> Array2<f64> {
        Array2::zeros((
            self.index.len() * self.target.shape().periods(),
            self.rates.years().len(),
        ))
    }

    /// Sums `facids`. Facilities without emissions or without an artifact on
    /// disk contribute nothing. A missing house artifact is cut from the grid
    /// artifact when that exists.
    fn sum_firms(&self, facids: &[FacId], progress: &ProgressBar) -> Result<Array2<f64>> {
        let mut total = self.zeros();
        for &facid in facids {
            progress.inc(1);
            let Some(rate) = self.rates.get(facid) else {
                warn!("No {} emissions for facility {facid}, skipping", self.target.pollutant);
                continue;
            };
            let key =
                ArtifactKey::new(self.geounit, self.target.model, facid, None).grouped(&self.groups);
            let radius = Radius::from_flag(self.env.config.uses_alt_radius(key.facid));
            let path = self.env.store.path_for(&key, radius)?;
            let frame = match self.env.store.try_read(&path)? {
                Some(frame) => Some(frame),
                None if self.geounit == Geounit::House
                    && self.target.model == ExposureModel::Dispersion =>
                {
                    house_artifact_from_grid(self.env, key, radius, self.index.keys())?
                }
                None => None,
            };
            let Some(frame) = frame else {
                warn!("No artifact for facility {facid} at {}, skipping", path.display());
                continue;
            };
            add_firm_exposure(
                &mut total,
                &frame,
                self.target,
                rate,
                &self.index,
                self.env.config.kernel_calibration,
            )?;
        }
        Ok(total)
    }
}

/// Facilities aggregated when no list is given: every facility with receptors
/// in range for the dispersion model, every facility with stacks for kernels.
pub fn default_facility_list(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
) -> Result<Vec<FacId>> {
    match model {
        ExposureModel::Dispersion => Ok(count_units(env, geounit, None, Radius::Default)?
            .into_iter()
            .filter(|&(_, units)| units > 0)
            .map(|(facid, _)| facid)
            .collect()),
        ExposureModel::Kernel { .. } => Ok(env.inputs.stacks()?.facids()),
    }
}

/// Worker count for parallel aggregation; grid panels are memory heavy.
pub fn num_workers(geounit: Geounit) -> usize {
    match geounit {
        Geounit::Grid => 2,
        _ => 4,
    }
}

pub fn sum_all_firms(
    env: &Environment,
    geounit: Geounit,
    target: &AggregateTarget,
    facility_list: Option<&[FacId]>,
    parallel: bool,
) -> Result<ExposurePanel> {
    let facids = match facility_list {
        Some(list) => list.to_vec(),
        None => default_facility_list(env, geounit, target.model)?,
    };
    let years = env.config.get_years();
    let records = env.inputs.emissions(&target.pollutant)?;
    let agg = Aggregation {
        env,
        geounit,
        target,
        rates: EmissionRates::from_records(&records, &years, target.shape()),
        index: ReceptorIndex::new(&env.inputs.receptors(geounit)?),
        groups: env.inputs.firm_groups()?,
    };
    info!(
        "Aggregating {} facilities over {} {geounit} receptors",
        facids.len(),
        agg.index.len()
    );

    let progress = progress_bar(facids.len(), format!("{geounit} {}", target.model));
    let values = if parallel && facids.len() > 1 {
        let workers = num_workers(geounit);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| AirqError::WorkerFailed(e.to_string()))?;
        let chunk_len = facids.len().div_ceil(workers).max(1);
        let partials = pool.install(|| {
            facids
                .par_chunks(chunk_len)
                .map(|part| agg.sum_firms(part, &progress))
                .collect::<Result<Vec<_>>>()
        })?;
        partials
            .into_iter()
            .fold(agg.zeros(), |acc, partial| acc + partial)
    } else {
        agg.sum_firms(&facids, &progress)?
    };
    progress.finish();

    Ok(ExposurePanel {
        keys: agg.index.keys.clone(),
        shape: target.shape(),
        years,
        values,
    })
}

/// The aggregate panel for `(geounit, target)`, read from cache or built and cached.
pub fn load_full_exposure(
    env: &Environment,
    geounit: Geounit,
    target: &AggregateTarget,
    parallel: bool,
) -> Result<DataFrame> {
    let path = env.store.table_path(&target.cache_stem(geounit));
    if let Some(frame) = env.store.try_read(&path)? {
        debug!("Loaded cached exposure from {}", path.display());
        return Ok(frame);
    }
    let mut frame = sum_all_firms(env, geounit, target, None, parallel)?.to_frame();
    env.store.write(&path, &mut frame)?;
    info!("Cached exposure at {}", path.display());
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Criteria, KernelKind};
    use approx::assert_relative_eq;
    use ndarray::array;

    fn frame(rows: &[(i32, i32, [f32; 4])]) -> DataFrame {
        let mut columns = vec![
            Series::new(UTM_EAST.into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
            Series::new(UTM_NORTH.into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        ];
        for (q, name) in QUARTER_COLUMNS.iter().enumerate() {
            columns.push(Series::new(
                (*name).into(),
                rows.iter().map(|r| r.2[q]).collect::<Vec<_>>(),
            ));
        }
        columns.into_iter().collect()
    }

    #[test]
    fn unit_conversions() {
        assert_relative_eq!(
            tons_per_year_to_grams_per_second(1.0),
            2000.0 * 453.59237 / (365.25 * 24.0 * 3600.0),
            max_relative = 1e-12
        );
        assert_relative_eq!(tons_per_year_to_grams_per_second(1.0), 0.028746, max_relative = 1e-5);
        assert_relative_eq!(
            pounds_per_year_to_grams_per_second(1.0),
            453.59237 / (365.25 * 24.0 * 3600.0),
            max_relative = 1e-12
        );
        assert_relative_eq!(
            tons_per_quarter_to_grams_per_second(0.25),
            tons_per_year_to_grams_per_second(1.0)
        );
        assert_eq!(round5(0.123456789), 0.12346);
    }

    #[test]
    fn rates_fill_gaps_with_zero() {
        let records = [
            EmissionRecord { facid: 1, year: 1995, quarter: Some(2), amount: 0.25 },
            EmissionRecord { facid: 1, year: 1995, quarter: Some(2), amount: 0.25 },
            EmissionRecord { facid: 1, year: 2010, quarter: Some(1), amount: 9.0 },
            EmissionRecord { facid: 2, year: 1994, quarter: None, amount: 9.0 },
        ];
        let rates = EmissionRates::from_records(&records, &[1994, 1995], AggregateShape::Quarterly);
        let r = rates.get(1).unwrap();
        assert_eq!(r.dim(), (4, 2));
        assert_relative_eq!(r[[1, 1]], tons_per_year_to_grams_per_second(2.0));
        assert_eq!(r.sum(), r[[1, 1]]);
        assert!(rates.get(2).is_none());
    }

    #[test]
    fn quarterly_dispersion_outer_product() {
        let index = ReceptorIndex::new(&[
            Receptor::new(0.0, 0.0),
            Receptor::new(10.0, 0.0),
            Receptor::new(20.0, 0.0),
        ]);
        let target = AggregateTarget::new(ExposureModel::Dispersion, Pollutant::Criteria(Criteria::Nox));
        let raw = frame(&[(10, 0, [1.0, 2.0, 3.0, 4.0])]);
        let rate = array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0], [0.5, 0.0]];
        let mut total = Array2::zeros((12, 2));
        add_firm_exposure(&mut total, &raw, &target, &rate, &index, 1e7).unwrap();

        // Receptor 1, quarters 1..4 are rows 4..8.
        assert_eq!(total.row(4).to_vec(), vec![1.0, 2.0]);
        assert_eq!(total.row(6).to_vec(), vec![3.0, 6.0]);
        assert_eq!(total.row(7).to_vec(), vec![2.0, 0.0]);
        assert_eq!(total.sum(), 1.0 + 2.0 + 2.0 + 4.0 + 3.0 + 6.0 + 2.0);
    }

    #[test]
    fn toxics_use_the_quarter_mean() {
        let index = ReceptorIndex::new(&[Receptor::new(0.0, 0.0)]);
        let target = AggregateTarget::new(ExposureModel::Dispersion, Pollutant::Toxic("benzene".into()));
        assert_eq!(target.shape(), AggregateShape::Annual);
        let raw = frame(&[(0, 0, [1.0, 2.0, 3.0, 4.0]), (99, 99, [9.0; 4])]);
        let mut total = Array2::zeros((1, 1));
        add_firm_exposure(&mut total, &raw, &target, &array![[2.0]], &index, 1e7).unwrap();
        assert_relative_eq!(total[[0, 0]], 5.0);
    }

    #[test]
    fn missing_quarters_are_left_out_of_the_mean() {
        let index = ReceptorIndex::new(&[Receptor::new(0.0, 0.0), Receptor::new(5.0, 0.0)]);
        let target = AggregateTarget::new(ExposureModel::Dispersion, Pollutant::Toxic("benzene".into()));
        let raw: DataFrame = [
            Series::new(UTM_EAST.into(), [0i32, 5]),
            Series::new(UTM_NORTH.into(), [0i32, 0]),
            Series::new("q1".into(), [Some(1.0f32), None]),
            Series::new("q2".into(), [Some(2.0f32), None]),
            Series::new("q3".into(), [Some(3.0f32), None]),
            Series::new("q4".into(), [None::<f32>, None]),
        ]
        .into_iter()
        .collect();
        let mut total = Array2::zeros((2, 1));
        add_firm_exposure(&mut total, &raw, &target, &array![[1.0]], &index, 1e7).unwrap();
        assert_relative_eq!(total[[0, 0]], 2.0);
        assert_eq!(total[[1, 0]], 0.0);
    }

    #[test]
    fn kernels_are_calibrated() {
        let index = ReceptorIndex::new(&[Receptor::new(0.0, 0.0)]);
        let model = ExposureModel::Kernel {
            kind: KernelKind::Uniform,
            bandwidth_km: 5,
        };
        let target = AggregateTarget::new(model, Pollutant::Criteria(Criteria::Co));
        let raw: DataFrame = [
            Series::new(UTM_EAST.into(), [0i32]),
            Series::new(UTM_NORTH.into(), [0i32]),
            Series::new(KERNEL_COLUMN.into(), [2e-8f64]),
        ]
        .into_iter()
        .collect();
        let rate = Array2::from_elem((4, 1), 0.5);
        let mut total = Array2::zeros((4, 1));
        add_firm_exposure(&mut total, &raw, &target, &rate, &index, 1e7).unwrap();
        for q in 0..4 {
            assert_relative_eq!(total[[q, 0]], 0.1, max_relative = 1e-12);
        }
    }

    #[test]
    fn panel_frame_layout() {
        let panel = ExposurePanel {
            keys: vec![(1, 2), (3, 4)],
            shape: AggregateShape::Quarterly,
            years: vec![1994, 1995],
            values: Array2::from_shape_fn((8, 2), |(i, j)| (i * 10 + j) as f64),
        };
        let df = panel.to_frame();
        assert_eq!(df.height(), 8);
        assert_eq!(
            df.get_column_names_str(),
            vec!["utm_east", "utm_north", "quarter", "1994", "1995"]
        );
        assert_eq!(f64_values_or_zero(&df, "quarter").unwrap()[5], 2.0);
        assert_eq!(f64_values_or_zero(&df, "utm_east").unwrap()[4], 3.0);
        assert_eq!(f64_values_or_zero(&df, "1995").unwrap()[7], 71.0);
        assert_eq!(target_stem(), "houses_aermod_nox");
    }

    fn target_stem() -> String {
        AggregateTarget::new(ExposureModel::Dispersion, Pollutant::default()).cache_stem(Geounit::House)
    }
}
