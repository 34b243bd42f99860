//! Sums a facility's chunk artifacts into one combined artifact.
use std::collections::BTreeMap;
use std::path::PathBuf;

use human_bytes::human_bytes;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::codec::{self, ChunkInfo};
use crate::env::Environment;
use crate::error::{AirqError, Result};
use crate::model::{ExposureModel, FacId, Geounit};
use crate::progress_bar;
use crate::store::{ArtifactKey, Radius};
use crate::table::{f64_values_or_zero, utm_keys, UTM_EAST, UTM_NORTH};

#[derive(Debug, Clone, Copy, Default)]
pub struct CombineOptions {
    pub overwrite: bool,
    /// Delete source chunks once every facility has been combined.
    pub clean: bool,
    pub radius: Radius,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombineReport {
    pub combined: usize,
    pub skipped: usize,
    pub deleted_files: usize,
    pub deleted_bytes: u64,
}

/// Element-wise sum of chunk tables sharing one index and column set.
/// A single chunk comes back untouched.
pub fn combine_frames(facid: FacId, mut chunks: Vec<(u32, DataFrame)>) -> Result<DataFrame> {
    if chunks.is_empty() {
        return Err(AirqError::IncompleteChunks {
            facid,
            found: 0,
            expected: 1,
        });
    }
    if chunks.len() == 1 {
        return Ok(chunks.remove(0).1);
    }

    let (_, base) = &chunks[0];
    let names: Vec<String> = base
        .get_column_names_str()
        .into_iter()
        .map(str::to_string)
        .collect();
    let index = utm_keys(base)?;
    for (chunk_id, frame) in &chunks[1..] {
        let same_columns = frame
            .get_column_names_str()
            .into_iter()
            .eq(names.iter().map(String::as_str));
        if !same_columns || utm_keys(frame)? != index {
            return Err(AirqError::ShapeMismatch {
                facid,
                chunk_id: *chunk_id,
            });
        }
    }

    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        let original = base.column(name)?;
        if name == UTM_EAST || name == UTM_NORTH {
            columns.push(original.as_materialized_series().clone());
            continue;
        }
        let mut total = vec![0.0f64; base.height()];
        for (_, frame) in &chunks {
            for (acc, v) in total.iter_mut().zip(f64_values_or_zero(frame, name)?) {
                *acc += v;
            }
        }
        let summed = Series::new(name.as_str().into(), total).cast(original.dtype())?;
        columns.push(summed);
    }
    Ok(columns.into_iter().collect())
}

/// Reads every chunk of `facid` and sums them.
pub fn combine_chunks(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
    facid: FacId,
    num_chunks: u32,
    radius: Radius,
) -> Result<DataFrame> {
    let facid = env.inputs.firm_groups()?.representative(facid);
    let mut frames = Vec::with_capacity(num_chunks as usize);
    for chunk in ChunkInfo::all(num_chunks)? {
        let key = ArtifactKey::new(geounit, model, facid, Some(chunk));
        if let Some(frame) = env.store.try_read(&env.store.path_for(&key, radius)?)? {
            frames.push((chunk.chunk_id, frame));
        }
    }
    if frames.len() < num_chunks as usize {
        return Err(AirqError::IncompleteChunks {
            facid,
            found: frames.len(),
            expected: num_chunks,
        });
    }
    combine_frames(facid, frames)
}

/// Chunk artifacts on disk for `(geounit, model)`, grouped by `(facid, num_chunks)`.
pub fn find_chunk_sets(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
    radius: Radius,
) -> Result<BTreeMap<(FacId, u32), Vec<PathBuf>>> {
    let pattern = env.store.chunk_pattern(geounit, model, radius)?;
    let mut sets: BTreeMap<(FacId, u32), Vec<PathBuf>> = BTreeMap::new();
    for path in env.store.enumerate(&pattern)? {
        let name = path.to_string_lossy();
        let (facid, chunk) = codec::decode(&name)?;
        // Skip stray files that only look like chunk names.
        let expected = codec::file_name(geounit, model, facid, Some(chunk))?;
        if path.file_name().is_some_and(|f| f.to_string_lossy() != expected) {
            continue;
        }
        sets.entry((facid, chunk.num_chunks)).or_default().push(path);
    }
    Ok(sets)
}

/// Combines every chunked facility of `(geounit, model)`. Source chunks are
/// deleted only when `clean` is set, every facility combined, and `confirm`
/// agrees.
pub fn combine_all(
    env: &Environment,
    geounit: Geounit,
    model: ExposureModel,
    opts: CombineOptions,
    confirm: &mut dyn FnMut(&str) -> bool,
) -> Result<CombineReport> {
    let sets = find_chunk_sets(env, geounit, model, opts.radius)?;
    info!("Found {} chunked facilities for {geounit} {model}", sets.len());

    let mut report = CombineReport::default();
    let progress = progress_bar(sets.len(), "Combining");
    for (&(facid, num_chunks), paths) in &sets {
        let key = ArtifactKey::new(geounit, model, facid, None);
        let target = env.store.path_for(&key, opts.radius)?;
        if env.store.exists(&target) && !opts.overwrite {
            debug!("{} exists, skipping", target.display());
            report.skipped += 1;
        } else {
            debug!("Combining {} chunks of facility {facid}", paths.len());
            let mut frame = combine_chunks(env, geounit, model, facid, num_chunks, opts.radius)?;
            env.store.write(&target, &mut frame)?;
            report.combined += 1;
        }
        progress.inc(1);
    }
    progress.finish();

    let sources: Vec<&PathBuf> = sets.values().flatten().collect();
    if opts.clean && !sources.is_empty() {
        let prompt = format!("Delete {} chunk files?", sources.len());
        if confirm(&prompt) {
            for path in sources {
                match env.store.remove(path) {
                    Ok(bytes) => {
                        report.deleted_files += 1;
                        report.deleted_bytes += bytes;
                    }
                    Err(e) => warn!("Could not delete {}: {e}", path.display()),
                }
            }
            println!(
                "Deleted {} files, {}",
                report.deleted_files,
                human_bytes(report.deleted_bytes as f64)
            );
        }
    }
    Ok(report)
}
