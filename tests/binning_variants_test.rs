//! Bin-shape guarantees across the three accumulator variants, and the
//! multi-tracer combination sweep.

mod common;

use quadcov::mc_integration::{run_covariance, run_legendre, run_power};
use quadcov::params::BinningMode;

use common::{setup, test_parameters, uniform_catalog};

#[test]
fn legendre_variant_shapes_and_finiteness() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut par = test_parameters(dir.path());
    par.mode = BinningMode::Legendre;
    par.nbin = 3;
    par.mbin = 2;
    par.max_loops = 2;

    let catalog = uniform_catalog(100, par.boxsize, 3, 1);
    let ts = setup(&par, catalog.clone(), catalog, 0.3);
    let result = run_legendre(&par, &ts.grids, &ts.cfs, &ts.rds, &ts.scs, (1, 1, 1, 1), 1, 1)
        .expect("legendre run");

    let nbins = par.nbin * par.mbin;
    assert_eq!(result.c2.len(), nbins);
    assert_eq!(result.c3.len(), nbins * nbins);
    assert_eq!(result.c4.len(), nbins * nbins);
    assert!(result.c2.iter().all(|v| v.is_finite()));
    assert!(result.c4.iter().all(|v| v.is_finite()));
    assert!(result.c2.iter().any(|&v| v != 0.0));
    assert!(dir
        .path()
        .join("CovMatrices")
        .join("c2_n3_m2_11_full.txt")
        .exists());
}

#[test]
fn power_variant_shapes_and_output_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut par = test_parameters(dir.path());
    par.mode = BinningMode::Power;
    par.nbin = 2;
    par.mbin = 2;
    par.kmin = 0.05;
    par.kmax = 0.25;
    par.power_norm = 2.0;
    par.max_loops = 2;

    let catalog = uniform_catalog(100, par.boxsize, 9, 1);
    let ts = setup(&par, catalog.clone(), catalog, 0.3);
    let result = run_power(&par, &ts.grids, &ts.cfs, &ts.rds, &ts.scs, (1, 1, 1, 1), 1, 1)
        .expect("power run");

    let nbins = par.nbin * par.mbin;
    assert_eq!(result.c2.len(), nbins);
    assert_eq!(result.c3.len(), nbins * nbins);
    assert_eq!(result.c4.len(), nbins * nbins);
    assert!(result.c2.iter().all(|v| v.is_finite()));
    assert!(result.c2.iter().any(|&v| v != 0.0));
    assert!(dir
        .path()
        .join("PowerCovMatrices")
        .join("c2_n2_m2_11_full.txt")
        .exists());
}

#[test]
fn multi_tracer_sweep_covers_seven_combinations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut par = test_parameters(dir.path());
    par.multi_tracers = true;
    par.max_loops = 1;
    par.n2 = 2;
    par.n3 = 1;
    par.n4 = 1;

    let catalog1 = uniform_catalog(60, par.boxsize, 1, 1);
    let catalog2 = uniform_catalog(60, par.boxsize, 2, 1);
    let ts = setup(&par, catalog1, catalog2, 0.2);
    let results = run_covariance(&par, &ts.grids, &ts.cfs, &ts.rds, None, &ts.scs)
        .expect("multi-tracer sweep");

    assert_eq!(results.len(), 7);
    let cov = dir.path().join("CovMatrices");
    for suffix in ["1111", "1112", "1122", "1222", "2222", "1121", "1212"] {
        let name = format!("c4_n2_m1_{suffix}_full.txt");
        assert!(cov.join(&name).exists(), "missing {name}");
    }
    // Every combination carries the full bin shape.
    let nbins = par.nbin * par.mbin;
    for result in &results {
        assert_eq!(result.c2.len(), nbins);
        assert_eq!(result.c4.len(), nbins * nbins);
    }
}
