//! Shared fixtures for the end-to-end sampling tests: synthetic uniform
//! catalogs in a periodic box and small-but-real table sets.

#![allow(dead_code)]

use std::path::Path;

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use quadcov::correlation::CorrelationFunction;
use quadcov::grid::{Grid, Particle};
use quadcov::params::{BinningMode, Parameters};
use quadcov::random_draws::RandomDraws;
use quadcov::survey::SurveyCorrection;

/// Uniform random catalog with unit weights, alternating random
/// partitions and random jackknife regions.
pub fn uniform_catalog(n: usize, boxsize: f64, seed: u64, n_jk: usize) -> Vec<Particle> {
    let mut rng = Pcg64::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let mut p = Particle::new(
                Vector3::new(
                    rng.gen_range(0.0..boxsize),
                    rng.gen_range(0.0..boxsize),
                    rng.gen_range(0.0..boxsize),
                ),
                1.0,
            );
            p.class = if rng.gen_bool(0.5) { 1 } else { 2 };
            p.jk = rng.gen_range(0..n_jk.max(1));
            p
        })
        .collect()
}

/// Small deterministic configuration writing under `out`.
pub fn test_parameters(out: &Path) -> Parameters {
    Parameters {
        nbin: 2,
        mbin: 1,
        rmin: 0.0,
        rmax: 30.0,
        n2: 4,
        n3: 2,
        n4: 2,
        max_loops: 3,
        nthread: 1,
        out_file: out.to_path_buf(),
        mode: BinningMode::Angular { jackknife: false },
        seed: Some(42),
        rescale: 1.0,
        xi_cut: 30.0,
        boxsize: 100.0,
        nside: 5,
        periodic: true,
        verbose: false,
        ..Parameters::default()
    }
}

pub struct TestSetup {
    pub grids: [Grid; 2],
    pub cfs: [CorrelationFunction; 3],
    pub rds: [RandomDraws; 3],
    pub scs: [SurveyCorrection; 3],
}

/// Grids plus constant-ξ table sets for both tracers.
pub fn setup(par: &Parameters, catalog1: Vec<Particle>, catalog2: Vec<Particle>, xi: f64) -> TestSetup {
    let grids = [
        Grid::new(catalog1, par.boxsize, par.nside, par.periodic),
        Grid::new(catalog2, par.boxsize, par.nside, par.periodic),
    ];
    let cf = CorrelationFunction::constant(xi);
    let cfs = [cf.clone(), cf.clone(), cf];
    let rds = [
        RandomDraws::new(par, &cfs[0]),
        RandomDraws::new(par, &cfs[1]),
        RandomDraws::new(par, &cfs[2]),
    ];
    let scs = [
        SurveyCorrection::identity(par.nbin),
        SurveyCorrection::identity(par.nbin),
        SurveyCorrection::identity(par.nbin),
    ];
    TestSetup { grids, cfs, rds, scs }
}

/// Minimum-image separation in a periodic cube.
pub fn min_image_r(a: &Vector3<f64>, b: &Vector3<f64>, boxsize: f64) -> f64 {
    let mut r2 = 0.0;
    for axis in 0..3 {
        let mut d = (a[axis] - b[axis]).abs();
        if d > boxsize / 2.0 {
            d = boxsize - d;
        }
        r2 += d * d;
    }
    r2.sqrt()
}
