//! Runs one facility-chunk job end to end and persists its raw normalized exposure.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, info};

use crate::aermod::{run_model, AermodInput, ModelExecutable, OutputRecord};
use crate::chunks::select_chunk;
use crate::codec::ChunkInfo;
use crate::env::Environment;
use crate::error::{invalid, AirqError, Result};
use crate::kernels::polar_density;
use crate::model::{ExposureModel, FacId, Geounit, KernelKind};
use crate::progress_bar;
use crate::resources::{radius_m, within_radius};
use crate::store::{ArtifactKey, Radius};
use crate::table::{Receptor, UTM_EAST, UTM_NORTH};

pub const QUARTER_COLUMNS: [&str; 4] = ["q1", "q2", "q3", "q4"];
pub const KERNEL_COLUMN: &str = "exposure";

/// Progress of a single job, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    PrepareInputs,
    InvokeModel,
    ParseOutput,
    Normalize,
    Persist,
}

/// How a job finished. Failures are returned as errors and leave no artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done(PathBuf),
    Skipped(PathBuf),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    pub overwrite: bool,
    pub radius: Radius,
    pub keep_scratch: bool,
}

pub fn quarter_of_month(month: u8) -> usize {
    (month as usize - 1) / 3 + 1
}

/// Receptors in range of `center`. Block receptors get a padded radius.
pub fn receptors_in_range(
    env: &Environment,
    geounit: Geounit,
    receptors: &[Receptor],
    center: (f64, f64),
    radius: Radius,
) -> Vec<Receptor> {
    let mut limit = radius_m(&env.config, radius);
    if geounit == Geounit::Block {
        limit += env.config.block_radius_pad_km * 1000.0;
    }
    receptors
        .iter()
        .filter(|r| within_radius(r, center, limit))
        .copied()
        .collect()
}

/// Mean concentration per receptor and quarter as a wide `q1..q4` table,
/// sorted by `(utm_east, utm_north)`.
pub fn normalize_output(records: &[OutputRecord]) -> Result<DataFrame> {
    let mut cells: BTreeMap<(i32, i32), [(f64, u32); 4]> = BTreeMap::new();
    for r in records {
        let key = (r.utm_east as i32, r.utm_north as i32);
        let q = quarter_of_month(r.month) - 1;
        let cell = &mut cells.entry(key).or_insert([(0.0, 0); 4])[q];
        cell.0 += r.concentration as f32 as f64;
        cell.1 += 1;
    }

    let east: Vec<i32> = cells.keys().map(|k| k.0).collect();
    let north: Vec<i32> = cells.keys().map(|k| k.1).collect();
    let mut columns = vec![
        Series::new(UTM_EAST.into(), east),
        Series::new(UTM_NORTH.into(), north),
    ];
    for (q, name) in QUARTER_COLUMNS.iter().enumerate() {
        let means: Vec<Option<f32>> = cells
            .values()
            .map(|c| {
                let (sum, n) = c[q];
                (n > 0).then(|| (sum / n as f64) as f32)
            })
            .collect();
        columns.push(Series::new((*name).into(), means));
    }
    Ok(columns.into_iter().collect())
}

/// Kernel density around the facility centroid, zero rows dropped.
pub fn kernel_exposure(
    receptors: &[Receptor],
    center: (f64, f64),
    kind: KernelKind,
    bandwidth_km: u32,
) -> DataFrame {
    let h = bandwidth_km as f64 * 1000.0;
    let density = polar_density(receptors, h, kind, center);
    let mut east = Vec::new();
    let mut north = Vec::new();
    let mut exposure = Vec::new();
    for (r, d) in receptors.iter().zip(density) {
        if d > 0.0 {
            let (e, n) = r.key();
            east.push(e);
            north.push(n);
            exposure.push(d);
        }
    }
    [
        Series::new(UTM_EAST.into(), east),
        Series::new(UTM_NORTH.into(), north),
        Series::new(KERNEL_COLUMN.into(), exposure),
    ]
    .into_iter()
    .collect()
}

/// Runs `(geounit, model, facid, chunk)` and writes its artifact. An existing
/// artifact is left alone unless `overwrite` is set.
pub fn run_and_write(
    env: &Environment,
    exe: &dyn ModelExecutable,
    geounit: Geounit,
    model: ExposureModel,
    facid: FacId,
    chunk: Option<ChunkInfo>,
    opts: DriverOptions,
) -> Result<JobOutcome> {
    let groups = env.inputs.firm_groups()?;
    let key = ArtifactKey::new(geounit, model, facid, chunk).grouped(&groups);
    let path = env.store.path_for(&key, opts.radius)?;
    if env.store.exists(&path) && !opts.overwrite {
        debug!("{} exists, skipping", path.display());
        return Ok(JobOutcome::Skipped(path));
    }

    debug!("{facid}: {:?}", Stage::PrepareInputs);
    let stacks = env.inputs.stacks()?;
    let center = stacks
        .centroid(facid)
        .ok_or_else(|| invalid(format!("No stacks for facility {facid}")))?;
    let receptors = receptors_in_range(
        env,
        geounit,
        &env.inputs.receptors(geounit)?,
        center,
        opts.radius,
    );

    let mut frame = match model {
        ExposureModel::Dispersion => {
            if receptors.is_empty() {
                return Err(invalid(format!(
                    "No {geounit} receptors in range of facility {facid}"
                )));
            }
            let meta = stacks
                .meta(facid)
                .ok_or_else(|| invalid(format!("No site metadata for facility {facid}")))?;
            let chunk_stacks = select_chunk(stacks.for_facility(facid), chunk)?;
            let input = AermodInput::new(&env.config, facid, meta, chunk_stacks, receptors);

            debug!("{facid}: {:?}", Stage::InvokeModel);
            let records = run_model(
                exe,
                &input,
                &env.config.aermod.scratch_path,
                opts.keep_scratch,
            )?;
            debug!("{facid}: {:?} read {} records", Stage::ParseOutput, records.len());

            debug!("{facid}: {:?}", Stage::Normalize);
            normalize_output(&records)?
        }
        ExposureModel::Kernel { kind, bandwidth_km } => {
            if chunk.is_some_and(|c| c.num_chunks > 1) {
                return Err(invalid(format!("Kernel model '{model}' is never chunked")));
            }
            debug!("{facid}: {:?}", Stage::InvokeModel);
            // Out of range of every receptor leaves an empty table.
            kernel_exposure(&receptors, center, kind, bandwidth_km)
        }
    };

    debug!("{facid}: {:?}", Stage::Persist);
    env.store.write(&path, &mut frame)?;
    Ok(JobOutcome::Done(path))
}

/// Computes a kernel model locally for many facilities and returns the count
/// of artifacts written. The first failure stops the batch.
pub fn run_kernel_batch(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
    facids: &[FacId],
    opts: DriverOptions,
) -> Result<usize> {
    let ExposureModel::Kernel { .. } = model else {
        return Err(invalid(format!("'{model}' is not a kernel model")));
    };

    let progress = progress_bar(facids.len(), format!("{geounit} {model}"));

    let mut written = 0;
    for &facid in facids {
        let outcome = run_and_write(env, &NoModel, geounit, model, facid, None, opts)?;
        if let JobOutcome::Done(_) = outcome {
            written += 1;
        }
        progress.inc(1);
    }
    progress.finish();
    info!("Wrote {written} {geounit} {model} artifacts");
    Ok(written)
}

/// Kernel models never reach the external executable.
struct NoModel;

impl ModelExecutable for NoModel {
    fn execute(&self, _input: &AermodInput, _workdir: &Path) -> Result<()> {
        Err(AirqError::ModelFailed(
            "no dispersion model configured".to_string(),
        ))
    }
}
