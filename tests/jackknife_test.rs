//! Jackknife-array consistency of the angular variant.

mod common;

use quadcov::jackknife::JackknifeWeights;
use quadcov::mc_integration::run_angular;
use quadcov::params::BinningMode;

use common::{setup, test_parameters, uniform_catalog};

#[test]
fn region_resolved_c2_sums_to_plain_c2() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut par = test_parameters(dir.path());
    par.mode = BinningMode::Angular { jackknife: true };
    par.max_loops = 4;
    par.n2 = 6;

    let n_jk = 4;
    let nbins = par.nbin * par.mbin;
    let catalog = uniform_catalog(140, par.boxsize, 77, n_jk);
    let ts = setup(&par, catalog.clone(), catalog, 0.3);
    let jk = JackknifeWeights::uniform(n_jk, nbins);
    let jks = [jk.clone(), jk.clone(), jk];

    let result = run_angular(
        &par,
        &ts.grids,
        &ts.cfs,
        &ts.rds,
        Some(&jks),
        (1, 1, 1, 1),
        1,
        1,
    )
    .expect("jackknife run");

    assert_eq!(result.n_jk, n_jk);
    assert_eq!(result.c2_regions.len(), n_jk * nbins);
    for bin in 0..nbins {
        let region_sum: f64 = (0..n_jk)
            .map(|region| result.c2_regions[region * nbins + bin])
            .sum();
        let plain = result.c2[bin];
        let tol = 1e-6 * plain.abs().max(1e-30);
        assert!(
            (region_sum - plain).abs() <= tol,
            "bin {bin}: region sum {region_sum:.12e} vs {plain:.12e}"
        );
    }

    // Corrected jackknife arrays exist, are finite, and were emitted.
    assert_eq!(result.c2_jack.len(), nbins);
    assert_eq!(result.c4_jack.len(), nbins * nbins);
    assert!(result.c2_jack.iter().all(|v| v.is_finite()));
    assert!(result.c4_jack.iter().all(|v| v.is_finite()));
    assert!(result.c4_jack.iter().any(|&v| v != 0.0));
    let jack_dir = dir.path().join("CovMatricesJack");
    for name in ["c2j_n2_m1_11_full.txt", "c4j_n2_m1_1111_full.txt", "c2r_n2_m1_11_full.txt"] {
        assert!(jack_dir.join(name).exists(), "missing jackknife output {name}");
    }
}

#[test]
fn jackknife_convergence_gate_includes_c4j() {
    // With ξ ≡ 0 both C4 and its jackknife variant vanish, so the gated
    // convergence still trips and the frobenius history carries the
    // jackknife deltas.
    let dir = tempfile::tempdir().expect("tempdir");
    let mut par = test_parameters(dir.path());
    par.mode = BinningMode::Angular { jackknife: true };
    par.max_loops = 15;

    let n_jk = 3;
    let nbins = par.nbin * par.mbin;
    let catalog = uniform_catalog(90, par.boxsize, 13, n_jk);
    let ts = setup(&par, catalog.clone(), catalog, 0.0);
    let jk = JackknifeWeights::uniform(n_jk, nbins);
    let jks = [jk.clone(), jk.clone(), jk];

    let result = run_angular(
        &par,
        &ts.grids,
        &ts.cfs,
        &ts.rds,
        Some(&jks),
        (1, 1, 1, 1),
        1,
        1,
    )
    .expect("gated run");

    assert!(result
        .counts
        .frob_history
        .iter()
        .all(|d| d.c4j.is_some()));
    assert_eq!(result.counts.loops_executed, 10);
    assert!(result.counts.loops_skipped > 0);
}
