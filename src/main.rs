//! Covariance integral runner: load catalogs and ξ tables, build the
//! grids and proposal distributions, then sweep the requested tracer
//! combinations (see `Cli` below for all run parameters).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use quadcov::correlation::CorrelationFunction;
use quadcov::error::{QuadcovError, Result};
use quadcov::grid::{Grid, Particle};
use quadcov::jackknife::JackknifeWeights;
use quadcov::mc_integration::{
    run_angular, run_legendre, run_power, tracer_combinations,
};
use quadcov::params::{BinningMode, Parameters};
use quadcov::random_draws::RandomDraws;
use quadcov::survey::SurveyCorrection;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Binning {
    Angular,
    Legendre,
    Power,
}

#[derive(Parser, Debug)]
#[command(about = "Monte Carlo covariance matrices for binned clustering statistics")]
struct Cli {
    /// Primary tracer catalog (x y z w [jackknife-region] rows)
    #[arg(long)]
    input: PathBuf,

    /// Second tracer catalog for multi-tracer runs
    #[arg(long)]
    input2: Option<PathBuf>,

    /// ξ table for the (1,1) auto correlation
    #[arg(long)]
    cor: PathBuf,

    /// ξ table for the (2,2) auto correlation (defaults to --cor)
    #[arg(long)]
    cor2: Option<PathBuf>,

    /// ξ table for the (1,2) cross correlation (defaults to --cor)
    #[arg(long)]
    cor_cross: Option<PathBuf>,

    /// Jackknife weight table (region-per-row) for the (1,1) pairs
    #[arg(long)]
    jackknife_weights: Option<PathBuf>,

    /// Survey correction coefficients (bin-per-row, Legendre/Power)
    #[arg(long)]
    survey_correction: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "./out")]
    out: PathBuf,

    #[arg(long, value_enum, default_value_t = Binning::Angular)]
    binning: Binning,

    /// Accumulate jackknife arrays (angular binning only)
    #[arg(long, default_value_t = false)]
    jackknife: bool,

    #[arg(long, default_value_t = 8)]
    nbin: usize,

    #[arg(long, default_value_t = 4)]
    mbin: usize,

    #[arg(long, default_value_t = 0.0)]
    rmin: f64,

    #[arg(long, default_value_t = 120.0)]
    rmax: f64,

    #[arg(long, default_value_t = 0.01)]
    kmin: f64,

    #[arg(long, default_value_t = 0.3)]
    kmax: f64,

    #[arg(long, default_value_t = 10)]
    n2: usize,

    #[arg(long, default_value_t = 5)]
    n3: usize,

    #[arg(long, default_value_t = 5)]
    n4: usize,

    #[arg(long, default_value_t = 60)]
    max_loops: usize,

    #[arg(long, default_value_t = 4)]
    nthread: usize,

    #[arg(long, default_value_t = false)]
    multi_tracers: bool,

    #[arg(long, default_value_t = 1.0)]
    power_norm: f64,

    /// Cubic box side length
    #[arg(long, default_value_t = 400.0)]
    boxsize: f64,

    /// Cells per box side
    #[arg(long, default_value_t = 20)]
    nside: usize,

    /// Disable periodic wrapping of the box
    #[arg(long, default_value_t = false)]
    no_periodic: bool,

    /// Fixed process seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Proposal cube radius as a multiple of rmax
    #[arg(long, default_value_t = 1.0)]
    rescale: f64,

    /// Radius of the ξ-weighted proposal cube
    #[arg(long, default_value_t = 200.0)]
    xi_cut: f64,

    #[arg(long, default_value_t = false)]
    quiet: bool,
}

impl Cli {
    fn to_parameters(&self) -> Parameters {
        let mode = match self.binning {
            Binning::Angular => BinningMode::Angular { jackknife: self.jackknife },
            Binning::Legendre => BinningMode::Legendre,
            Binning::Power => BinningMode::Power,
        };
        Parameters {
            nbin: self.nbin,
            mbin: self.mbin,
            rmin: self.rmin,
            rmax: self.rmax,
            kmin: self.kmin,
            kmax: self.kmax,
            n2: self.n2,
            n3: self.n3,
            n4: self.n4,
            max_loops: self.max_loops,
            nthread: self.nthread,
            multi_tracers: self.multi_tracers,
            out_file: self.out.clone(),
            power_norm: self.power_norm,
            mode,
            seed: self.seed,
            rescale: self.rescale,
            xi_cut: self.xi_cut,
            boxsize: self.boxsize,
            nside: self.nside,
            periodic: !self.no_periodic,
            verbose: !self.quiet,
            ..Parameters::default()
        }
    }
}

/// Read `x y z w [jk]` rows and assign the two random partitions used by
/// the partitioned pair probabilities.
fn read_particles(path: &PathBuf, seed: u64) -> Result<Vec<Particle>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(QuadcovError::Csv)?;

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let mut particles = Vec::new();
    for record in reader.records() {
        let record = record?;
        let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 4 {
            return Err(QuadcovError::Table {
                path: path.clone(),
                reason: format!("need x y z w columns, got {}", fields.len()),
            });
        }
        let parse = |s: &str| -> Result<f64> {
            s.parse::<f64>().map_err(|e| QuadcovError::Table {
                path: path.clone(),
                reason: format!("bad float {s:?}: {e}"),
            })
        };
        let mut part = Particle::new(
            Vector3::new(parse(fields[0])?, parse(fields[1])?, parse(fields[2])?),
            parse(fields[3])?,
        );
        if let Some(jk) = fields.get(4) {
            part.jk = jk.parse::<usize>().map_err(|e| QuadcovError::Table {
                path: path.clone(),
                reason: format!("bad region id {jk:?}: {e}"),
            })?;
        }
        part.class = if rng.gen_bool(0.5) { 1 } else { 2 };
        particles.push(part);
    }
    if particles.is_empty() {
        return Err(QuadcovError::Table {
            path: path.clone(),
            reason: "no particles".into(),
        });
    }
    Ok(particles)
}

fn run(cli: &Cli) -> Result<()> {
    let par = cli.to_parameters();
    par.validate();
    println!("Configuration:\n{par:#?}");

    let class_seed = par.seed.unwrap_or(0xC0FFEE);
    let particles1 = read_particles(&cli.input, class_seed)?;
    let particles2 = match &cli.input2 {
        Some(path) => read_particles(path, class_seed ^ 1)?,
        None => particles1.clone(),
    };
    assert!(
        cli.input2.is_some() || !par.multi_tracers,
        "multi-tracer runs need a second catalog"
    );

    let grids = [
        Grid::new(particles1, par.boxsize, par.nside, par.periodic),
        Grid::new(particles2, par.boxsize, par.nside, par.periodic),
    ];
    println!(
        "Gridded {} + {} particles into {}³ cells (max occupancy {}).",
        grids[0].np,
        grids[1].np,
        par.nside,
        grids[0].maxnp.max(grids[1].maxnp)
    );

    let cf11 = CorrelationFunction::from_file(&cli.cor)?;
    let cf22 = match &cli.cor2 {
        Some(path) => CorrelationFunction::from_file(path)?,
        None => cf11.clone(),
    };
    let cf12 = match &cli.cor_cross {
        Some(path) => CorrelationFunction::from_file(path)?,
        None => cf11.clone(),
    };
    let cfs = [cf11, cf22, cf12];

    let rds = [
        RandomDraws::new(&par, &cfs[0]),
        RandomDraws::new(&par, &cfs[1]),
        RandomDraws::new(&par, &cfs[2]),
    ];
    println!(
        "Built proposal tables over {} (1/r²) and {} (ξ) cell offsets.",
        rds[0].cube_support(),
        rds[0].xi_support()
    );

    let nbins = par.nbin * par.mbin;
    let jks = match (&cli.jackknife_weights, par.mode) {
        (Some(path), BinningMode::Angular { jackknife: true }) => {
            let jk = JackknifeWeights::from_file(path, nbins)?;
            Some([jk.clone(), jk.clone(), jk])
        }
        (None, BinningMode::Angular { jackknife: true }) => {
            // Region count from the catalog tags; equal weights.
            let n_jk = grids[0].p.iter().map(|p| p.jk).max().unwrap_or(0) + 1;
            let jk = JackknifeWeights::uniform(n_jk, nbins);
            Some([jk.clone(), jk.clone(), jk])
        }
        _ => None,
    };

    let scs = match &cli.survey_correction {
        Some(path) => {
            let sc = SurveyCorrection::from_file(path, par.nbin)?;
            [sc.clone(), sc.clone(), sc]
        }
        None => [
            SurveyCorrection::identity(par.nbin),
            SurveyCorrection::identity(par.nbin),
            SurveyCorrection::identity(par.nbin),
        ],
    };

    let combos = tracer_combinations(par.multi_tracers);
    let tot_iter = combos.len();
    let bar = ProgressBar::new(tot_iter as u64);
    bar.set_style(
        ProgressStyle::with_template(" {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}]")
            .expect("progress bar template"),
    );

    for (idx, &combo) in combos.iter().enumerate() {
        let iter_no = idx + 1;
        match par.mode {
            BinningMode::Angular { .. } => {
                run_angular(&par, &grids, &cfs, &rds, jks.as_ref(), combo, iter_no, tot_iter)?;
            }
            BinningMode::Legendre => {
                run_legendre(&par, &grids, &cfs, &rds, &scs, combo, iter_no, tot_iter)?;
            }
            BinningMode::Power => {
                run_power(&par, &grids, &cfs, &rds, &scs, combo, iter_no, tot_iter)?;
            }
        }
        bar.inc(1);
    }
    bar.finish();

    println!(
        "Covariance integrals complete → {}",
        par.out_file.display()
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
