//! Fourier k‑bin integral accumulator for power‑spectrum covariance.
//!
//! A pair at separation r contributes to every (k bin, multipole) slot
//! through the window (2ℓ+1)·P_ℓ(µ)·j_ℓ(k_a·r), evaluated at the bin
//! center. `second` caches the full window block per primary particle;
//! contributions beyond the configured real‑space support are dropped.

use std::io;

use crate::accumulator::{
    add_arrays, pair_sep_mu, rel_frobenius, scale_array, FrobDeltas, Integrals, OutputSpec,
    PairProbs, Scratch,
};
use crate::correlation::CorrelationFunction;
use crate::grid::Particle;
use crate::legendre::legendre_even;
use crate::params::Parameters;
use crate::survey::SurveyCorrection;

/// Spherical Bessel function j_n(x), series for small arguments and
/// upward recurrence otherwise (stable for the low orders used here).
pub fn spherical_bessel(n: usize, x: f64) -> f64 {
    if x < 0.5 {
        // j_n(x) = xⁿ/(2n+1)!! · (1 − x²/(2(2n+3)) + x⁴/(8(2n+3)(2n+5)) − …)
        let mut double_fact = 1.0;
        for k in 0..n {
            double_fact *= (2 * k + 3) as f64;
        }
        let a = (2 * n + 3) as f64;
        let b = (2 * n + 5) as f64;
        let x2 = x * x;
        return x.powi(n as i32) / double_fact
            * (1.0 - x2 / (2.0 * a) + x2 * x2 / (8.0 * a * b));
    }
    let j0 = x.sin() / x;
    if n == 0 {
        return j0;
    }
    let j1 = x.sin() / (x * x) - x.cos() / x;
    if n == 1 {
        return j1;
    }
    let (mut prev, mut curr) = (j0, j1);
    for m in 1..n {
        let next = (2.0 * m as f64 + 1.0) / x * curr - prev;
        prev = curr;
        curr = next;
    }
    curr
}

/// Uniform k bins over [kmin, kmax], evaluated at bin centers.
#[derive(Debug, Clone, Copy)]
struct KBins {
    nbin: usize,
    kmin: f64,
    dk: f64,
}

impl KBins {
    fn center(&self, bin: usize) -> f64 {
        self.kmin + (bin as f64 + 0.5) * self.dk
    }
}

pub struct PowerIntegrals<'a> {
    kbins: KBins,
    mbin: usize,
    /// Real‑space support of the Fourier kernels.
    rmax: f64,
    power_norm: f64,
    cf12: &'a CorrelationFunction,
    cf13: &'a CorrelationFunction,
    cf24: &'a CorrelationFunction,
    sc12: &'a SurveyCorrection,
    sc23: &'a SurveyCorrection,
    sc34: &'a SurveyCorrection,
    c2: Vec<f64>,
    c3: Vec<f64>,
    c4: Vec<f64>,
    cnt2: u64,
    cnt3: u64,
    cnt4: u64,
    /// Window block for the k/l side of a triple or quad.
    side_kernel: Vec<f64>,
    poly_buf: Vec<f64>,
    out: OutputSpec,
}

impl<'a> PowerIntegrals<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        par: &Parameters,
        cf12: &'a CorrelationFunction,
        cf13: &'a CorrelationFunction,
        cf24: &'a CorrelationFunction,
        sc12: &'a SurveyCorrection,
        sc23: &'a SurveyCorrection,
        sc34: &'a SurveyCorrection,
        combo: (usize, usize, usize, usize),
    ) -> Self {
        let kbins = KBins {
            nbin: par.nbin,
            kmin: par.kmin,
            dk: (par.kmax - par.kmin) / par.nbin as f64,
        };
        let nbins = par.nbin * par.mbin;
        Self {
            kbins,
            mbin: par.mbin,
            rmax: par.rmax,
            power_norm: par.power_norm,
            cf12,
            cf13,
            cf24,
            sc12,
            sc23,
            sc34,
            c2: vec![0.0; nbins],
            c3: vec![0.0; nbins * nbins],
            c4: vec![0.0; nbins * nbins],
            cnt2: 0,
            cnt3: 0,
            cnt4: 0,
            side_kernel: vec![0.0; nbins],
            poly_buf: vec![0.0; par.mbin],
            out: OutputSpec::new(par, "PowerCovMatrices", None, combo),
        }
    }

    #[inline]
    fn nbins(&self) -> usize {
        self.kbins.nbin * self.mbin
    }

    /// Fill one (k bin, multipole) window block for a pair at (r, µ).
    fn fill_kernel(
        kbins: KBins,
        mbin: usize,
        sc: &SurveyCorrection,
        r: f64,
        mu: f64,
        poly_buf: &mut [f64],
        out: &mut [f64],
    ) {
        legendre_even(mu, mbin, poly_buf);
        for a in 0..kbins.nbin {
            let k = kbins.center(a);
            let window = sc.inv_phi(a, mu);
            for (p, &poly) in poly_buf.iter().take(mbin).enumerate() {
                out[a * mbin + p] = poly * spherical_bessel(2 * p, k * r) * window;
            }
        }
    }

    #[inline]
    fn in_support(&self, r: f64) -> bool {
        r > 0.0 && r < self.rmax
    }
}

impl<'a> Integrals for PowerIntegrals<'a> {
    fn fresh(&self) -> Self {
        Self {
            kbins: self.kbins,
            mbin: self.mbin,
            rmax: self.rmax,
            power_norm: self.power_norm,
            cf12: self.cf12,
            cf13: self.cf13,
            cf24: self.cf24,
            sc12: self.sc12,
            sc23: self.sc23,
            sc34: self.sc34,
            c2: vec![0.0; self.c2.len()],
            c3: vec![0.0; self.c3.len()],
            c4: vec![0.0; self.c4.len()],
            cnt2: 0,
            cnt3: 0,
            cnt4: 0,
            side_kernel: vec![0.0; self.side_kernel.len()],
            poly_buf: vec![0.0; self.poly_buf.len()],
            out: self.out.clone(),
        }
    }

    fn kernel_width(&self) -> usize {
        self.nbins()
    }

    fn second(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pid_j: usize,
        probs: PairProbs,
        scratch: &mut Scratch,
    ) {
        let width = self.nbins();
        for (i, pi) in prim.iter().enumerate() {
            scratch.bin_ij[i] = None;
            if prim_ids[i] == pid_j {
                continue;
            }
            let (r, mu) = pair_sep_mu(&pi.pos, &pj.pos);
            if !self.in_support(r) {
                continue;
            }
            let wij = pi.w * pj.w;
            scratch.bin_ij[i] = Some(0);
            scratch.w_ij[i] = wij;
            let block = &mut scratch.poly_ij[i * width..(i + 1) * width];
            Self::fill_kernel(
                self.kbins,
                self.mbin,
                self.sc12,
                r,
                mu,
                &mut self.poly_buf,
                block,
            );

            let xi12 = self.cf12.xi(r, mu);
            let common = wij * wij * (1.0 + xi12) / probs.p2;
            for (slot, &kernel) in block.iter().enumerate() {
                self.c2[slot] += common * kernel;
            }
            self.cnt2 += 1;
        }
    }

    fn third(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        _pj: &Particle,
        pk: &Particle,
        _pid_j: usize,
        pid_k: usize,
        p3: f64,
        scratch: &mut Scratch,
    ) {
        let width = self.nbins();
        for (i, pi) in prim.iter().enumerate() {
            scratch.w_ijk[i] = 0.0;
            if scratch.bin_ij[i].is_none() {
                continue;
            }
            if prim_ids[i] == pid_k {
                continue;
            }
            let (r_ik, mu_ik) = pair_sep_mu(&pi.pos, &pk.pos);
            let xi_ik = self.cf13.xi(r_ik, mu_ik);
            let wijk = scratch.w_ij[i] * pk.w;
            scratch.xi_ik[i] = xi_ik;
            scratch.w_ijk[i] = wijk;

            if !self.in_support(r_ik) {
                continue;
            }
            let mut side = std::mem::take(&mut self.side_kernel);
            Self::fill_kernel(
                self.kbins,
                self.mbin,
                self.sc23,
                r_ik,
                mu_ik,
                &mut self.poly_buf,
                &mut side,
            );

            let common = wijk * pi.w * xi_ik / p3;
            let block = &scratch.poly_ij[i * width..(i + 1) * width];
            for (ap, &kernel_ij) in block.iter().enumerate() {
                let row = ap * width;
                let lead = common * kernel_ij;
                for (bq, &kernel_ik) in side.iter().enumerate() {
                    self.c3[row + bq] += lead * kernel_ik;
                }
            }
            self.side_kernel = side;
            self.cnt3 += 1;
        }
    }

    fn fourth(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pk: &Particle,
        pl: &Particle,
        _pid_j: usize,
        _pid_k: usize,
        pid_l: usize,
        p4: f64,
        scratch: &mut Scratch,
    ) {
        let width = self.nbins();
        let (r_kl, mu_kl) = pair_sep_mu(&pk.pos, &pl.pos);
        if !self.in_support(r_kl) {
            return;
        }
        let (r_jl, mu_jl) = pair_sep_mu(&pj.pos, &pl.pos);
        let xi_jl = self.cf24.xi(r_jl, mu_jl);
        let mut side = std::mem::take(&mut self.side_kernel);
        Self::fill_kernel(
            self.kbins,
            self.mbin,
            self.sc34,
            r_kl,
            mu_kl,
            &mut self.poly_buf,
            &mut side,
        );

        for (i, _pi) in prim.iter().enumerate() {
            if scratch.bin_ij[i].is_none() || scratch.w_ijk[i] == 0.0 || prim_ids[i] == pid_l {
                continue;
            }
            let common = scratch.w_ijk[i] * pl.w * scratch.xi_ik[i] * xi_jl / p4;
            let block = &scratch.poly_ij[i * width..(i + 1) * width];
            for (ap, &kernel_ij) in block.iter().enumerate() {
                let row = ap * width;
                let lead = common * kernel_ij;
                for (bq, &kernel_kl) in side.iter().enumerate() {
                    self.c4[row + bq] += lead * kernel_kl;
                }
            }
            self.cnt4 += 1;
        }
        self.side_kernel = side;
    }

    fn sum_ints(&mut self, other: &Self) {
        add_arrays(&mut self.c2, &other.c2);
        add_arrays(&mut self.c3, &other.c3);
        add_arrays(&mut self.c4, &other.c4);
        self.cnt2 += other.cnt2;
        self.cnt3 += other.cnt3;
        self.cnt4 += other.cnt4;
    }

    fn reset(&mut self) {
        self.c2.fill(0.0);
        self.c3.fill(0.0);
        self.c4.fill(0.0);
        self.cnt2 = 0;
        self.cnt3 = 0;
        self.cnt4 = 0;
    }

    fn normalize(&mut self, norms: [f64; 4], pairs: f64, triples: f64, quads: f64) {
        let [n1, n2, n3, n4] = norms;
        // The survey power normalization divides the covariance once per
        // spectrum estimate, i.e. squared overall.
        let pn2 = self.power_norm * self.power_norm;
        scale_array(&mut self.c2, 1.0 / (pairs.max(1.0) * n1 * n2 * pn2));
        scale_array(&mut self.c3, 1.0 / (triples.max(1.0) * n1 * n2 * n3 * pn2));
        scale_array(&mut self.c4, 1.0 / (quads.max(1.0) * n1 * n2 * n3 * n4 * pn2));
    }

    fn frobenius_difference_sum(&mut self, local: &Self, n_prev: usize) -> FrobDeltas {
        let deltas = FrobDeltas {
            c2: rel_frobenius(&self.c2, &local.c2, n_prev),
            c3: rel_frobenius(&self.c3, &local.c3, n_prev),
            c4: rel_frobenius(&self.c4, &local.c4, n_prev),
            c2j: None,
            c3j: None,
            c4j: None,
        };
        self.sum_ints(local);
        deltas
    }

    fn counts(&self) -> (u64, u64, u64) {
        (self.cnt2, self.cnt3, self.cnt4)
    }

    fn c2(&self) -> &[f64] {
        &self.c2
    }

    fn c3(&self) -> &[f64] {
        &self.c3
    }

    fn c4(&self) -> &[f64] {
        &self.c4
    }

    fn output(&self) -> &OutputSpec {
        &self.out
    }

    fn save_integrals(&self, tag: &str) -> io::Result<()> {
        let nbins = self.nbins();
        let dir = self.out.dir.clone();
        self.out
            .write_matrix(&dir, "c2", &self.out.suffix2, tag, &self.c2, self.mbin)?;
        self.out
            .write_matrix(&dir, "c3", &self.out.suffix3, tag, &self.c3, nbins)?;
        self.out
            .write_matrix(&dir, "c4", &self.out.suffix4, tag, &self.c4, nbins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn bessel_small_and_moderate_arguments() {
        // j0(x) = sin x / x.
        assert!((spherical_bessel(0, 1.3) - 1.3_f64.sin() / 1.3).abs() < 1e-12);
        // Series limit at x → 0.
        assert!((spherical_bessel(0, 1e-6) - 1.0).abs() < 1e-9);
        assert!(spherical_bessel(2, 1e-6) < 1e-11);
        // j2 closed form at x = 2.
        let x: f64 = 2.0;
        let j2 = (3.0 / (x * x * x) - 1.0 / x) * x.sin() - 3.0 / (x * x) * x.cos();
        assert!((spherical_bessel(2, x) - j2).abs() < 1e-12);
    }

    #[test]
    fn bessel_series_matches_recurrence_at_crossover() {
        for n in [0usize, 1, 2, 3] {
            let below = spherical_bessel(n, 0.5 * (1.0 - 1e-9));
            let above = spherical_bessel(n, 0.5 * (1.0 + 1e-9));
            assert!(
                (below - above).abs() < 1e-4 * below.abs().max(1e-9),
                "order {n}: {below} vs {above}"
            );
        }
    }

    fn test_parameters() -> Parameters {
        Parameters {
            nbin: 2,
            mbin: 2,
            rmin: 0.0,
            rmax: 50.0,
            kmin: 0.05,
            kmax: 0.25,
            power_norm: 1.0,
            ..Parameters::default()
        }
    }

    #[test]
    fn pair_feeds_every_k_bin() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.0);
        let sc = SurveyCorrection::identity(2);
        let mut acc = PowerIntegrals::new(&par, &cf, &cf, &cf, &sc, &sc, &sc, (1, 1, 1, 1));
        let mut scratch = Scratch::new(2, acc.kernel_width());

        let prim = vec![Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0)];
        let ids = vec![0];
        let pj = Particle::new(Vector3::new(10.0, 0.0, 0.0), 1.0);
        let probs = PairProbs { p2: 1.0, p21: 1.0, p22: 1.0 };
        acc.second(&prim, &ids, &pj, 5, probs, &mut scratch);

        // Monopole slots carry j0(k_a · 10) exactly.
        let j0_low = spherical_bessel(0, 0.1 * 10.0);
        let j0_high = spherical_bessel(0, 0.2 * 10.0);
        assert!((acc.c2()[0] - j0_low).abs() < 1e-12);
        assert!((acc.c2()[2] - j0_high).abs() < 1e-12);
        // µ = 0 quadrupole: (2ℓ+1)P_2(0) = −2.5.
        assert!((acc.c2()[1] + 2.5 * spherical_bessel(2, 1.0)).abs() < 1e-12);
    }

    #[test]
    fn out_of_support_pairs_are_dropped() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.0);
        let sc = SurveyCorrection::identity(2);
        let mut acc = PowerIntegrals::new(&par, &cf, &cf, &cf, &sc, &sc, &sc, (1, 1, 1, 1));
        let mut scratch = Scratch::new(2, acc.kernel_width());

        let prim = vec![Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0)];
        let ids = vec![0];
        let pj = Particle::new(Vector3::new(80.0, 0.0, 0.0), 1.0);
        let probs = PairProbs { p2: 1.0, p21: 1.0, p22: 1.0 };
        acc.second(&prim, &ids, &pj, 5, probs, &mut scratch);
        assert_eq!(scratch.bin_ij[0], None);
        assert!(acc.c2().iter().all(|&v| v == 0.0));
        assert_eq!(acc.counts().0, 0);
    }
}
