//! Run‑time configuration for the covariance integrator
//! (single source of truth, see `Parameters` below).

use std::path::PathBuf;

/// Which output binning the accumulators use.
///
/// The covariance of the binned correlation‑function estimator can be
/// accumulated in (r, µ) bins, projected onto even Legendre multipoles,
/// or transformed into Fourier k‑bins. The choice changes the shape of
/// the accumulator arrays and the per‑quad kernel, not the sampling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinningMode {
    /// (radial bin) × (µ bin), optionally with jackknife‑region arrays.
    Angular { jackknife: bool },
    /// (radial bin) × (even multipole ℓ = 0, 2, …).
    Legendre,
    /// (k bin) × (even multipole), with a survey‑window correction.
    Power,
}

/// Run‑time configuration (single source of truth).
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Number of radial separation bins (k bins in `Power` mode).
    pub nbin: usize,
    /// Number of angular / multipole / Fourier bins.
    pub mbin: usize,
    /// Radial bin range.
    pub rmin: f64,
    pub rmax: f64,
    /// µ bin range (µ = |cosine to the line of sight|).
    pub mumin: f64,
    pub mumax: f64,
    /// k bin range, used by the `Power` variant only.
    pub kmin: f64,
    pub kmax: f64,
    /// Monte Carlo branching factors: j, k, l draws per primary cell visit.
    pub n2: usize,
    pub n3: usize,
    pub n4: usize,
    /// Number of outer sampling iterations.
    pub max_loops: usize,
    /// Worker thread count.
    pub nthread: usize,
    /// Run all 7 tracer index combinations instead of the auto term only.
    pub multi_tracers: bool,
    /// Output directory; variant subdirectories are created below it.
    pub out_file: PathBuf,
    /// Survey normalization for the `Power` variant.
    pub power_norm: f64,
    /// Binning variant.
    pub mode: BinningMode,
    /// Process‑level seed; `None` draws one from the OS entropy pool.
    pub seed: Option<u64>,
    /// Multiplier on `rmax` bounding the 1/r² proposal cube.
    pub rescale: f64,
    /// Radius bounding the ξ‑weighted proposal cube.
    pub xi_cut: f64,
    /// Cubic box side length.
    pub boxsize: f64,
    /// Cells per box side.
    pub nside: usize,
    /// Periodic wrapping of cell lookups and separations.
    pub periodic: bool,
    /// Emit per‑cell progress and per‑loop timing lines.
    pub verbose: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            nbin:          8,
            mbin:          4,
            rmin:          0.0,
            rmax:          120.0,
            mumin:         0.0,
            mumax:         1.0,
            kmin:          0.01,
            kmax:          0.3,
            n2:            10,
            n3:            5,
            n4:            5,
            max_loops:     60,
            nthread:       4,
            multi_tracers: false,
            out_file:      PathBuf::from("./out"),
            power_norm:    1.0,
            mode:          BinningMode::Angular { jackknife: false },
            seed:          None,
            rescale:       1.0,
            xi_cut:        200.0,
            boxsize:       400.0,
            nside:         20,
            periodic:      true,
            verbose:       true,
        }
    }
}

impl Parameters {
    /// Abort on configurations the sampler cannot run with.
    /// These are caller bugs, not recoverable states.
    pub fn validate(&self) {
        assert!(self.nbin > 0, "need at least one radial bin");
        assert!(self.mbin > 0, "need at least one angular bin");
        assert!(self.rmax > self.rmin, "empty radial range");
        assert!(
            self.n2 > 0 && self.n3 > 0 && self.n4 > 0,
            "branching factors must be nonzero"
        );
        assert!(self.max_loops > 0, "need at least one loop");
        assert!(self.nthread > 0, "need at least one thread");
        assert!(self.nside > 1, "grid must have more than one cell per side");
        assert!(self.boxsize > 0.0, "box must have positive extent");
        if self.mode == BinningMode::Power {
            assert!(self.kmax > self.kmin && self.kmin > 0.0, "empty k range");
            assert!(self.power_norm > 0.0, "power normalization must be positive");
        }
    }

    /// Radial bin width.
    #[inline]
    pub fn dr(&self) -> f64 {
        (self.rmax - self.rmin) / self.nbin as f64
    }

    /// µ bin width.
    #[inline]
    pub fn dmu(&self) -> f64 {
        (self.mumax - self.mumin) / self.mbin as f64
    }

    /// Side length of one grid cell.
    #[inline]
    pub fn cellsize(&self) -> f64 {
        self.boxsize / self.nside as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_validate() {
        Parameters::default().validate();
    }

    #[test]
    #[should_panic(expected = "branching factors")]
    fn zero_branching_factor_is_fatal() {
        let par = Parameters {
            n3: 0,
            ..Parameters::default()
        };
        par.validate();
    }

    #[test]
    fn bin_widths() {
        let par = Parameters {
            nbin: 10,
            mbin: 5,
            rmin: 20.0,
            rmax: 120.0,
            ..Parameters::default()
        };
        assert!((par.dr() - 10.0).abs() < 1e-12);
        assert!((par.dmu() - 0.2).abs() < 1e-12);
    }
}
