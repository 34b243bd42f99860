//! Emission-weighted aggregation over cached facility artifacts.
mod common;

use airq::aggregate::{
    load_full_exposure, round5, sum_all_firms, tons_per_quarter_to_grams_per_second, AggregateTarget,
};
use airq::driver::{run_and_write, DriverOptions, JobOutcome, QUARTER_COLUMNS};
use airq::env::Environment;
use airq::model::{ExposureModel, Geounit, Pollutant};
use airq::panels::{load_electric_exposure, load_exposure_from_grids, ElectricSplit};
use airq::store::{ArtifactKey, Radius};
use airq::table::{f64_values, utm_keys};
use approx::assert_relative_eq;
use common::{environment, write_firm_groups, write_nox, write_receptors, write_stacks, StubModel};
use polars::prelude::*;

fn setup(dir: &std::path::Path) -> Environment {
    let env = environment(dir);
    write_stacks(
        &env.inputs,
        &[
            (1, 0.0, 0.0, 10.0, 1.0),
            (2, 500.0, 0.0, 10.0, 1.0),
            (3, 800.0, 0.0, 10.0, 1.0),
        ],
    );
    write_receptors(&env.inputs, Geounit::House, &[(1000.0, 0.0), (2000.0, 0.0)]);
    write_nox(
        &env.inputs,
        &[
            (1, 1994, 1, 1.0),
            (1, 1994, 3, 2.0),
            (1, 1995, 1, 0.5),
            (2, 1994, 1, 4.0),
            (3, 1994, 1, 8.0),
        ],
    );

    // Facility 1 has been modelled; 2 and 3 never were.
    write_raw(
        &env,
        Geounit::House,
        1,
        &[(1000, 0, [2.0, 0.0, 0.5, 0.0]), (2000, 0, [1.0, 0.0, 0.25, 0.0])],
    );
    env
}

/// A dispersion artifact with rows `(east, north, [q1..q4])`.
fn write_raw(env: &Environment, geounit: Geounit, facid: i64, rows: &[(i32, i32, [f32; 4])]) {
    let mut columns = vec![
        Series::new("utm_east".into(), rows.iter().map(|r| r.0).collect::<Vec<_>>()),
        Series::new("utm_north".into(), rows.iter().map(|r| r.1).collect::<Vec<_>>()),
    ];
    for (q, name) in QUARTER_COLUMNS.iter().enumerate() {
        columns.push(Series::new((*name).into(), rows.iter().map(|r| r.2[q]).collect::<Vec<_>>()));
    }
    let mut raw: DataFrame = columns.into_iter().collect();
    let key = ArtifactKey::new(geounit, ExposureModel::Dispersion, facid, None);
    env.store
        .write(&env.store.path_for(&key, Radius::Default).unwrap(), &mut raw)
        .unwrap();
}

fn nox() -> AggregateTarget {
    AggregateTarget::new(ExposureModel::Dispersion, Pollutant::default())
}

#[test]
fn missing_artifacts_contribute_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());

    let with_missing = sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 2, 3]), false).unwrap();
    let without = sum_all_firms(&env, Geounit::House, &nox(), Some(&[1]), false).unwrap();
    assert_eq!(with_missing.values, without.values);
    assert_eq!(with_missing.keys, vec![(1000, 0), (2000, 0)]);

    // Receptor (1000, 0), quarter 1, 1994.
    let expected = round5(2.0 * tons_per_quarter_to_grams_per_second(1.0));
    assert_relative_eq!(with_missing.values[[0, 0]], expected);
    // Quarter 3 of 1994 at the second receptor.
    let expected = round5(0.25 * tons_per_quarter_to_grams_per_second(2.0));
    assert_relative_eq!(with_missing.values[[6, 0]], expected);
    // Nothing emitted in 1996.
    assert_eq!(with_missing.values.column(2).sum(), 0.0);
}

#[test]
fn parallel_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());

    let sequential = sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 2, 3]), false).unwrap();
    let parallel = sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 2, 3]), true).unwrap();
    assert_eq!(sequential.values.dim(), parallel.values.dim());
    for (a, b) in sequential.values.iter().zip(parallel.values.iter()) {
        assert_relative_eq!(a, b, max_relative = 1e-12);
    }
}

#[test]
fn full_exposure_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());

    let frame = load_full_exposure(&env, Geounit::House, &nox(), false).unwrap();
    assert_eq!(frame.height(), 8);
    assert_eq!(frame.width(), 3 + env.config.get_years().len());

    let cache = env.store.table_path("houses_aermod_nox");
    assert!(env.store.exists(&cache));
    let cached = load_full_exposure(&env, Geounit::House, &nox(), true).unwrap();
    assert!(cached.equals(&frame));
    assert_relative_eq!(
        f64_values(&cached, "1994").unwrap()[0],
        round5(2.0 * tons_per_quarter_to_grams_per_second(1.0))
    );
}

#[test]
fn toxics_without_emissions_table_fail() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());
    let target = AggregateTarget::new(ExposureModel::Dispersion, "benzene".parse().unwrap());
    assert!(sum_all_firms(&env, Geounit::House, &target, Some(&[1]), false).is_err());
}

#[test]
fn one_unreadable_artifact_fails_the_parallel_sum() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());
    let key = ArtifactKey::new(Geounit::House, ExposureModel::Dispersion, 2, None);
    let path = env.store.path_for(&key, Radius::Default).unwrap();
    std::fs::write(&path, b"not a parquet file").unwrap();

    assert!(sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 2, 3]), true).is_err());
    assert!(sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 3]), true).is_ok());
}

#[test]
fn grouped_facilities_are_stored_under_their_representative() {
    let dir = tempfile::tempdir().unwrap();
    let env = environment(dir.path());
    write_stacks(&env.inputs, &[(5, 0.0, 0.0, 10.0, 1.0)]);
    write_receptors(&env.inputs, Geounit::House, &[(1000.0, 0.0)]);
    write_nox(&env.inputs, &[(5, 1994, 1, 1.0)]);
    write_firm_groups(&env.inputs, &[(5, 7)]);

    let outcome = run_and_write(
        &env,
        &StubModel,
        Geounit::House,
        ExposureModel::Dispersion,
        5,
        None,
        DriverOptions::default(),
    )
    .unwrap();
    let JobOutcome::Done(path) = outcome else {
        panic!("expected a new artifact");
    };
    assert_eq!(path.file_name().unwrap(), "hA7.parquet");

    let panel = sum_all_firms(&env, Geounit::House, &nox(), Some(&[5]), false).unwrap();
    // Quarter one averages months 1 to 3 to 2.0.
    let expected = round5(2.0 * tons_per_quarter_to_grams_per_second(1.0));
    assert_relative_eq!(panel.values[[0, 0]], expected, max_relative = 1e-6);
}

#[test]
fn electric_split_partitions_the_full_panel() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());
    write_raw(
        &env,
        Geounit::House,
        2,
        &[(1000, 0, [1.0, 0.0, 0.0, 0.0]), (2000, 0, [0.5, 0.0, 0.0, 0.0])],
    );

    let full = load_full_exposure(&env, Geounit::House, &nox(), false).unwrap();
    let electric =
        load_electric_exposure(&env, Geounit::House, &nox(), ElectricSplit::Electric, &[2], false).unwrap();
    let other =
        load_electric_exposure(&env, Geounit::House, &nox(), ElectricSplit::NonElectric, &[2], false)
            .unwrap();
    let rest = sum_all_firms(&env, Geounit::House, &nox(), Some(&[1, 3]), false)
        .unwrap()
        .to_frame();

    assert_eq!(utm_keys(&other).unwrap(), utm_keys(&full).unwrap());
    for year in ["1994", "1995"] {
        let f = f64_values(&full, year).unwrap();
        let e = f64_values(&electric, year).unwrap();
        let o = f64_values(&other, year).unwrap();
        let r = f64_values(&rest, year).unwrap();
        for i in 0..f.len() {
            assert_relative_eq!(e[i] + o[i], f[i], epsilon = 1e-12);
            assert_relative_eq!(o[i], r[i], epsilon = 1e-12);
        }
    }
    assert!(f64_values(&electric, "1994").unwrap()[0] > 0.0);
    for stem in ["houses_aermod_nox_el1", "houses_aermod_nox_el0"] {
        assert!(env.store.exists(&env.store.table_path(stem)));
    }
}

#[test]
fn house_artifacts_are_cut_from_grid_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());
    // Facility 2 only has a grid artifact; one of its cells holds no house.
    write_raw(
        &env,
        Geounit::Grid,
        2,
        &[(1000, 0, [1.0, 0.0, 0.0, 0.0]), (1500, 0, [7.0, 0.0, 0.0, 0.0])],
    );

    let panel = sum_all_firms(&env, Geounit::House, &nox(), Some(&[2]), false).unwrap();
    let expected = round5(tons_per_quarter_to_grams_per_second(4.0));
    assert_relative_eq!(panel.values[[0, 0]], expected);
    assert_eq!(panel.values.sum(), expected);

    let house = ArtifactKey::new(Geounit::House, ExposureModel::Dispersion, 2, None);
    let cached = env
        .store
        .read(&env.store.path_for(&house, Radius::Default).unwrap())
        .unwrap();
    assert_eq!(utm_keys(&cached).unwrap(), vec![(1000, 0)]);
}

#[test]
fn block_panel_from_the_grid_panel() {
    let dir = tempfile::tempdir().unwrap();
    let env = setup(dir.path());
    write_receptors(&env.inputs, Geounit::Grid, &[(1000.0, 0.0), (2000.0, 0.0)]);
    write_raw(
        &env,
        Geounit::Grid,
        1,
        &[(1000, 0, [2.0, 0.0, 0.5, 0.0]), (2000, 0, [1.0, 0.0, 0.25, 0.0])],
    );
    // The second block rounds to a cell the grid does not have.
    write_receptors(&env.inputs, Geounit::Block, &[(1049.0, 3.0), (5151.0, 0.0)]);

    let grid = load_full_exposure(&env, Geounit::Grid, &nox(), false).unwrap();
    let blocks = load_exposure_from_grids(&env, Geounit::Block, &nox(), false).unwrap();
    assert_eq!(blocks.height(), 4);
    assert_eq!(utm_keys(&blocks).unwrap(), vec![(1049, 3); 4]);
    assert_eq!(
        f64_values(&blocks, "1994").unwrap(),
        f64_values(&grid, "1994").unwrap()[..4].to_vec()
    );
    assert!(env.store.exists(&env.store.table_path("blocks_aermod_nox")));
}
