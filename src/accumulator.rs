//! Shared machinery for the per‑thread integral accumulators.
//!
//! The three binning variants (angular µ bins, Legendre multipoles,
//! Fourier k bins) share the sampling contract: `second`, `third` and
//! `fourth` fold one j/k/l draw into the C2/C3/C4 partial sums for every
//! particle of the primary cell, reusing scratch buffers sized by the
//! largest cell. Everything bin‑shape specific lives in the variant
//! modules; everything else is here.

use std::fs;
use std::io;
use std::path::PathBuf;

use nalgebra::Vector3;

use crate::grid::Particle;
use crate::params::Parameters;

/// Separation and |cosine to the line of sight| for one pair. The line of
/// sight is the z axis of the box.
#[inline]
pub fn pair_sep_mu(a: &Vector3<f64>, b: &Vector3<f64>) -> (f64, f64) {
    let sep = a - b;
    let r = sep.norm();
    if r <= 0.0 {
        return (0.0, 0.0);
    }
    (r, (sep.z / r).abs())
}

/// Uniform radial × µ binning.
#[derive(Debug, Clone, Copy)]
pub struct BinEdges {
    pub nbin: usize,
    pub mbin: usize,
    pub rmin: f64,
    pub rmax: f64,
    dr: f64,
    mumin: f64,
    dmu: f64,
}

impl BinEdges {
    pub fn from_params(par: &Parameters) -> Self {
        Self {
            nbin: par.nbin,
            mbin: par.mbin,
            rmin: par.rmin,
            rmax: par.rmax,
            dr: par.dr(),
            mumin: par.mumin,
            dmu: par.dmu(),
        }
    }

    /// Radial bin, `None` outside the binned range.
    #[inline]
    pub fn radial(&self, r: f64) -> Option<usize> {
        if r < self.rmin || r >= self.rmax {
            return None;
        }
        let bin = ((r - self.rmin) / self.dr) as usize;
        Some(bin.min(self.nbin - 1))
    }

    /// µ bin; the closed upper edge folds into the last bin.
    #[inline]
    pub fn mu_bin(&self, mu: f64) -> Option<usize> {
        if mu < self.mumin {
            return None;
        }
        let bin = ((mu - self.mumin) / self.dmu) as usize;
        if bin >= self.mbin {
            // µ = mumax exactly.
            if mu <= self.mumin + self.dmu * self.mbin as f64 {
                return Some(self.mbin - 1);
            }
            return None;
        }
        Some(bin)
    }

    /// Flat (radial, µ) bin.
    #[inline]
    pub fn pair_bin(&self, r: f64, mu: f64) -> Option<usize> {
        let rb = self.radial(r)?;
        let mb = self.mu_bin(mu)?;
        Some(rb * self.mbin + mb)
    }

    /// Total flat bins.
    #[inline]
    pub fn nbins(&self) -> usize {
        self.nbin * self.mbin
    }
}

/// Composed draw probabilities for one j draw. The partitioned marginals
/// are meaningful in the angular variant only; the others read `p2`.
#[derive(Debug, Clone, Copy)]
pub struct PairProbs {
    pub p2: f64,
    pub p21: f64,
    pub p22: f64,
}

/// Per‑thread buffers reused across all draws of one primary cell,
/// dimensioned by the largest cell of the primary grid. Allocated once
/// per worker; the four‑deep sampling loop only indexes into them.
#[derive(Debug)]
pub struct Scratch {
    /// Flat pair bin of (i, j), `None` for self pairs and out‑of‑range
    /// separations; later kernels skip those slots.
    pub bin_ij: Vec<Option<usize>>,
    pub w_ij: Vec<f64>,
    pub xi_ik: Vec<f64>,
    pub w_ijk: Vec<f64>,
    /// Variant basis values per primary particle (`kernel_width` each):
    /// Legendre stores the (2ℓ+1)·P_ℓ(µ_ij) ladder, the power variant the
    /// full (k bin, multipole) window block. Empty in the angular variant.
    pub poly_ij: Vec<f64>,
    /// Per‑pair scalar factor (window correction) cached by `second`.
    pub factor_ij: Vec<f64>,
}

impl Scratch {
    pub fn new(maxnp: usize, kernel_width: usize) -> Self {
        Self {
            bin_ij: vec![None; maxnp],
            w_ij: vec![0.0; maxnp],
            xi_ik: vec![0.0; maxnp],
            w_ijk: vec![0.0; maxnp],
            poly_ij: vec![0.0; maxnp * kernel_width],
            factor_ij: vec![0.0; maxnp],
        }
    }
}

/// Relative Frobenius changes of the running means after folding one more
/// loop, the convergence proxy of the outer loop.
#[derive(Debug, Clone, Copy)]
pub struct FrobDeltas {
    pub c2: f64,
    pub c3: f64,
    pub c4: f64,
    pub c2j: Option<f64>,
    pub c3j: Option<f64>,
    pub c4j: Option<f64>,
}

/// Convergence gate: C4 (and C4 jackknife where present) below 1%.
pub const CONVERGENCE_TOL: f64 = 0.01;

impl FrobDeltas {
    pub fn converged(&self) -> bool {
        self.c4 < CONVERGENCE_TOL && self.c4j.map_or(true, |v| v < CONVERGENCE_TOL)
    }
}

/// ‖A_{n} − A_{n+1}‖ / ‖A_{n+1}‖ where A_n = sum/n and A_{n+1} includes
/// one more loop's partial sums. An empty history reports full change.
pub fn rel_frobenius(sum: &[f64], local: &[f64], n_prev: usize) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    let inv_new = 1.0 / (n_prev + 1) as f64;
    for (s, l) in sum.iter().zip(local) {
        let prev = if n_prev == 0 { 0.0 } else { s / n_prev as f64 };
        let new = (s + l) * inv_new;
        num += (prev - new) * (prev - new);
        den += new * new;
    }
    if den == 0.0 {
        // An identically zero array has not changed; anything shrinking
        // onto zero counts as full change.
        return if num == 0.0 { 0.0 } else { 1.0 };
    }
    (num / den).sqrt()
}

#[inline]
pub fn add_arrays(dst: &mut [f64], src: &[f64]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[inline]
pub fn scale_array(arr: &mut [f64], factor: f64) {
    for v in arr.iter_mut() {
        *v *= factor;
    }
}

/// Output naming shared by the variants: directory, suffix strings built
/// from the tracer index combination, matrix emission.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub dir: PathBuf,
    pub jack_dir: Option<PathBuf>,
    pub nbin: usize,
    pub mbin: usize,
    pub suffix2: String,
    pub suffix3: String,
    pub suffix4: String,
}

impl OutputSpec {
    pub fn new(
        par: &Parameters,
        subdir: &str,
        jack_subdir: Option<&str>,
        combo: (usize, usize, usize, usize),
    ) -> Self {
        let (i1, i2, i3, i4) = combo;
        Self {
            dir: par.out_file.join(subdir),
            jack_dir: jack_subdir.map(|d| par.out_file.join(d)),
            nbin: par.nbin,
            mbin: par.mbin,
            suffix2: format!("{i1}{i2}"),
            suffix3: format!("{i1}{i2}{i3}"),
            suffix4: format!("{i1}{i2}{i3}{i4}"),
        }
    }

    fn file_name(&self, array: &str, suffix: &str, tag: &str) -> String {
        format!(
            "{array}_n{}_m{}_{suffix}_{tag}.txt",
            self.nbin, self.mbin
        )
    }

    /// Emit one flat array as a whitespace‑delimited matrix with `ncols`
    /// values per row (row‑major, radial‑major).
    pub fn write_matrix(
        &self,
        dir: &PathBuf,
        array: &str,
        suffix: &str,
        tag: &str,
        data: &[f64],
        ncols: usize,
    ) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name(array, suffix, tag));
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b' ')
            .from_path(&path)
            .map_err(io::Error::other)?;
        for row in data.chunks(ncols) {
            let record: Vec<String> = row.iter().map(|v| format!("{v:.12e}")).collect();
            wtr.write_record(&record).map_err(io::Error::other)?;
        }
        wtr.flush()
    }

    /// Sidecar with the attempted pair/triple/quad totals.
    pub fn write_counts(&self, pairs: u64, triples: u64, quads: u64) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!(
            "total_counts_n{}_m{}_{}.txt",
            self.nbin, self.mbin, self.suffix4
        ));
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b' ')
            .from_path(&path)
            .map_err(io::Error::other)?;
        wtr.write_record([pairs.to_string(), triples.to_string(), quads.to_string()])
            .map_err(io::Error::other)?;
        wtr.flush()
    }
}

/// Per‑thread integral accumulator. One implementation per binning
/// variant; the sampling driver is generic over this trait and never
/// inspects bin shapes.
pub trait Integrals: Send {
    /// New empty accumulator with the same configuration and shared
    /// tables; used to mint the per‑thread locals.
    fn fresh(&self) -> Self
    where
        Self: Sized;

    /// Columns per primary particle in `Scratch::poly_ij`.
    fn kernel_width(&self) -> usize;

    /// Fold one j draw into C2 for every primary particle, leaving the
    /// pair bins and weights in scratch for the deeper kernels.
    fn second(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pid_j: usize,
        probs: PairProbs,
        scratch: &mut Scratch,
    );

    /// Fold one k draw into C3; stores ξ_ik and the triple weight.
    #[allow(clippy::too_many_arguments)]
    fn third(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pk: &Particle,
        pid_j: usize,
        pid_k: usize,
        p3: f64,
        scratch: &mut Scratch,
    );

    /// Fold one l draw into C4.
    #[allow(clippy::too_many_arguments)]
    fn fourth(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pk: &Particle,
        pl: &Particle,
        pid_j: usize,
        pid_k: usize,
        pid_l: usize,
        p4: f64,
        scratch: &mut Scratch,
    );

    /// Element‑wise addition of another accumulator's partial sums.
    fn sum_ints(&mut self, other: &Self)
    where
        Self: Sized;

    /// Zero all sums and counts.
    fn reset(&mut self);

    /// Divide by grid norms and attempted sample counts.
    fn normalize(&mut self, norms: [f64; 4], pairs: f64, triples: f64, quads: f64);

    /// Fold `local` in and report the relative Frobenius change of the
    /// running means; `n_prev` loops were folded before this one.
    fn frobenius_difference_sum(&mut self, local: &Self, n_prev: usize) -> FrobDeltas
    where
        Self: Sized;

    /// Accepted contribution counts (cnt2, cnt3, cnt4).
    fn counts(&self) -> (u64, u64, u64);

    fn c2(&self) -> &[f64];
    fn c3(&self) -> &[f64];
    fn c4(&self) -> &[f64];

    fn output(&self) -> &OutputSpec;

    /// Emit C2/C3/C4 under the variant directory.
    fn save_integrals(&self, tag: &str) -> io::Result<()>;

    /// Emit the jackknife arrays; no‑op for variants without them.
    fn save_jackknife_integrals(&self, _tag: &str) -> io::Result<()> {
        Ok(())
    }

    fn has_jackknife(&self) -> bool {
        false
    }
}
