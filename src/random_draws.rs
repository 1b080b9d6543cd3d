//! Biased integer cell‑displacement sampler for the quadruplet loop.
//!
//! Two discrete distributions over a cube of cell offsets: one ∝ 1/r²
//! (matching the radial falloff of pair counts, used for the j draw) and
//! one ∝ |ξ(r)| (used for the k and l draws). Each draw returns the
//! displacement together with the ratio of its proposal probability to
//! uniform sampling over the same support; the accumulators divide by it.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::correlation::CorrelationFunction;
use crate::params::Parameters;

struct CubeDistribution {
    deltas: Vec<[i64; 3]>,
    /// Normalized selection probability per displacement, all > 0.
    probs: Vec<f64>,
    index: WeightedIndex<f64>,
}

/// Probability floor keeping every supported displacement drawable; a
/// zero proposal probability would blow up the importance weight.
const PROB_FLOOR: f64 = 1.0e-12;

impl CubeDistribution {
    fn build(half_width: i64, cellsize: f64, weight_of: impl Fn(f64) -> f64) -> Self {
        let mut deltas = Vec::new();
        let mut weights = Vec::new();
        for dx in -half_width..=half_width {
            for dy in -half_width..=half_width {
                for dz in -half_width..=half_width {
                    let r = cellsize
                        * ((dx * dx + dy * dy + dz * dz) as f64).sqrt();
                    deltas.push([dx, dy, dz]);
                    weights.push(weight_of(r).max(PROB_FLOOR));
                }
            }
        }
        let total: f64 = weights.iter().sum();
        let probs: Vec<f64> = weights.iter().map(|w| w / total).collect();
        let index = WeightedIndex::new(&weights)
            .expect("displacement cube has positive total weight");
        Self { deltas, probs, index }
    }

    #[inline]
    fn draw(&self, rng: &mut impl Rng) -> ([i64; 3], f64) {
        let idx = self.index.sample(rng);
        // Ratio to the uniform proposal over the same support.
        let p = self.probs[idx] * self.deltas.len() as f64;
        ([self.deltas[idx][0], self.deltas[idx][1], self.deltas[idx][2]], p)
    }
}

pub struct RandomDraws {
    cube: CubeDistribution,
    xi: CubeDistribution,
}

impl RandomDraws {
    /// Table construction. The 1/r² cube spans `rescale · rmax`; the ξ cube
    /// spans `xi_cut`. The central cell uses the half‑cell radius so its
    /// weight stays finite.
    pub fn new(par: &Parameters, cf: &CorrelationFunction) -> Self {
        let cellsize = par.cellsize();
        let cube_half = ((par.rescale * par.rmax) / cellsize).ceil().max(1.0) as i64;
        let xi_half = (par.xi_cut / cellsize).ceil().max(1.0) as i64;

        let floor_r = cellsize * 0.5;
        let cube = CubeDistribution::build(cube_half, cellsize, |r| {
            1.0 / r.max(floor_r).powi(2)
        });
        let xi = CubeDistribution::build(xi_half, cellsize, |r| {
            cf.xi_r(r.max(floor_r)).abs()
        });
        Self { cube, xi }
    }

    /// Displacement ∝ 1/r² and its probability ratio to uniform.
    #[inline]
    pub fn random_cubedraw(&self, rng: &mut impl Rng) -> ([i64; 3], f64) {
        self.cube.draw(rng)
    }

    /// Displacement ∝ |ξ(r)| and its probability ratio to uniform.
    #[inline]
    pub fn random_xidraw(&self, rng: &mut impl Rng) -> ([i64; 3], f64) {
        self.xi.draw(rng)
    }

    /// Support size of the 1/r² proposal cube.
    pub fn cube_support(&self) -> usize {
        self.cube.deltas.len()
    }

    /// Support size of the ξ proposal cube.
    pub fn xi_support(&self) -> usize {
        self.xi.deltas.len()
    }
}
