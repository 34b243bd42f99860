//! Shared fixtures: a temporary data directory with small input tables and a
//! stand-in for the dispersion binary.
#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use airq::aermod::{AermodInput, ModelExecutable};
use airq::config::Config;
use airq::env::Environment;
use airq::error::Result;
use airq::model::{FacId, Geounit};
use airq::table::InputTables;
use polars::prelude::*;

/// One stack row: `(facid, east, north, height, emit_share)`.
pub type StackRow = (FacId, f64, f64, f64, f64);

pub fn environment(dir: &Path) -> Environment {
    let mut config = Config::default();
    config.data_path = dir.join("data");
    config.storage.primary = dir.join("airq");
    config.storage.local_chunks = dir.join("chunks");
    config.aermod.scratch_path = dir.join("scratch");
    std::fs::create_dir_all(&config.data_path).unwrap();
    Environment::new(config)
}

fn write(path: &Path, mut frame: DataFrame) {
    let mut file = File::create(path).unwrap();
    ParquetWriter::new(&mut file).finish(&mut frame).unwrap();
}

pub fn write_stacks(inputs: &InputTables, rows: &[StackRow]) {
    let n = rows.len();
    let frame: DataFrame = [
        Series::new("facid".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        Series::new("utm_east".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        Series::new("utm_north".into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()),
        Series::new("stack_ht".into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()),
        Series::new("stack_temp".into(), vec![400.0f64; n]),
        Series::new("stack_veloc".into(), vec![12.0f64; n]),
        Series::new("stack_diam".into(), vec![2.0f64; n]),
        Series::new("emit_share".into(), rows.iter().map(|r| r.4).collect::<Vec<_>>()),
        Series::new("pop1990".into(), vec![8863164i64; n]),
        Series::new("metsite_code".into(), vec!["burk"; n]),
        Series::new("metsite_z".into(), vec![175.0f64; n]),
        Series::new("metsite_year".into(), vec![9i64; n]),
    ]
    .into_iter()
    .collect();
    write(&inputs.stacks_path(), frame);
}

pub fn write_receptors(inputs: &InputTables, geounit: Geounit, points: &[(f64, f64)]) {
    let frame: DataFrame = [
        Series::new("utm_east".into(), points.iter().map(|p| p.0).collect::<Vec<_>>()),
        Series::new("utm_north".into(), points.iter().map(|p| p.1).collect::<Vec<_>>()),
    ]
    .into_iter()
    .collect();
    write(&inputs.receptors_path(geounit), frame);
}

/// Quarterly NOx tonnage rows: `(facid, year, quarter, tons)`.
pub fn write_nox(inputs: &InputTables, rows: &[(FacId, i64, i64, f64)]) {
    let frame: DataFrame = [
        Series::new("facid".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        Series::new("year".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
        Series::new("quarter".into(), rows.iter().map(|r| r.2).collect::<Vec<_>>()),
        Series::new("tons".into(), rows.iter().map(|r| r.3).collect::<Vec<_>>()),
    ]
    .into_iter()
    .collect();
    write(&inputs.emissions_path(&Default::default()), frame);
}

/// Group crosswalk rows: `(facid, group_rep)`.
pub fn write_firm_groups(inputs: &InputTables, pairs: &[(FacId, FacId)]) {
    let frame: DataFrame = [
        Series::new("facid".into(), pairs.iter().map(|p| p.0).collect::<Vec<_>>()),
        Series::new("group_rep".into(), pairs.iter().map(|p| p.1).collect::<Vec<_>>()),
    ]
    .into_iter()
    .collect();
    write(&inputs.firm_groups_path(), frame);
}

/// Writes a post file where each source contributes
/// `base(height) * month * emit_share` at every receptor, with `base` 1.0 for
/// stacks 10 m tall and 0.5 for anything else.
pub struct StubModel;

impl ModelExecutable for StubModel {
    fn execute(&self, input: &AermodInput, workdir: &Path) -> Result<()> {
        let mut out = String::from("* AERMOD stand-in\n* X Y AVERAGE CONC ZELEV ZHILL ZFLAG AVE GRP DATE\n");
        for r in &input.receptors {
            for month in 1..=12u32 {
                let conc: f64 = input
                    .sources
                    .iter()
                    .map(|s| {
                        let base = if s.height == 10.0 { 1.0 } else { 0.5 };
                        base * month as f64 * s.emit_share
                    })
                    .sum();
                let _ = writeln!(
                    out,
                    "{:14.5} {:14.5} {:13.5}      0.00      0.00      0.00  MONTH    ALL      09{:02}3124",
                    r.utm_east, r.utm_north, conc, month
                );
            }
        }
        std::fs::write(workdir.join(&input.output_file), out)?;
        Ok(())
    }
}

/// Runs, but leaves an empty output file behind.
pub struct EmptyModel;

impl ModelExecutable for EmptyModel {
    fn execute(&self, input: &AermodInput, workdir: &Path) -> Result<()> {
        std::fs::write(workdir.join(&input.output_file), "")?;
        Ok(())
    }
}
