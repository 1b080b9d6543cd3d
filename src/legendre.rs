//! Legendre‑multipole integral accumulator.
//!
//! Pairs are binned radially; the µ dependence is projected onto even
//! multipoles ℓ = 0, 2, …, 2(mbin−1). `second` caches the weighted
//! (2ℓ+1)·P_ℓ(µ_ij) ladder and the inverse window factor per primary
//! particle so the deeper kernels reuse them for the ij side.

use std::io;

use crate::accumulator::{
    add_arrays, pair_sep_mu, rel_frobenius, scale_array, BinEdges, FrobDeltas, Integrals,
    OutputSpec, PairProbs, Scratch,
};
use crate::correlation::CorrelationFunction;
use crate::grid::Particle;
use crate::params::Parameters;
use crate::survey::SurveyCorrection;

/// (2ℓ+1)·P_ℓ(µ) for even ℓ = 0, 2, …, 2(count−1), by upward recurrence
/// over all orders.
pub fn legendre_even(mu: f64, count: usize, out: &mut [f64]) {
    debug_assert!(out.len() >= count);
    let lmax = 2 * (count.saturating_sub(1));
    let mut p_prev = 1.0; // P_0
    let mut p_curr = mu; // P_1
    out[0] = 1.0;
    for ell in 1..=lmax {
        if ell > 1 {
            let l = (ell - 1) as f64;
            let next = ((2.0 * l + 1.0) * mu * p_curr - l * p_prev) / (l + 1.0);
            p_prev = p_curr;
            p_curr = next;
        }
        if ell % 2 == 0 {
            out[ell / 2] = (2.0 * ell as f64 + 1.0) * p_curr;
        }
    }
}

pub struct LegendreIntegrals<'a> {
    bins: BinEdges,
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
    /// Reused ladder for the k/l side of a triple or quad.
    side_poly: Vec<f64>,
    out: OutputSpec,
}

impl<'a> LegendreIntegrals<'a> {
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
        let bins = BinEdges::from_params(par);
        let nbins = bins.nbins();
        Self {
            bins,
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
            side_poly: vec![0.0; par.mbin],
            out: OutputSpec::new(par, "CovMatrices", None, combo),
        }
    }
}

impl<'a> Integrals for LegendreIntegrals<'a> {
    fn fresh(&self) -> Self {
        Self {
            bins: self.bins,
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
            side_poly: vec![0.0; self.side_poly.len()],
            out: self.out.clone(),
        }
    }

    fn kernel_width(&self) -> usize {
        self.bins.mbin
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
        let mbin = self.bins.mbin;
        for (i, pi) in prim.iter().enumerate() {
            scratch.bin_ij[i] = None;
            if prim_ids[i] == pid_j {
                continue;
            }
            let (r, mu) = pair_sep_mu(&pi.pos, &pj.pos);
            let Some(rbin) = self.bins.radial(r) else {
                continue;
            };
            let wij = pi.w * pj.w;
            scratch.bin_ij[i] = Some(rbin);
            scratch.w_ij[i] = wij;
            scratch.factor_ij[i] = self.sc12.inv_phi(rbin, mu);
            let ladder = &mut scratch.poly_ij[i * mbin..(i + 1) * mbin];
            legendre_even(mu, mbin, ladder);

            let xi12 = self.cf12.xi(r, mu);
            let common = wij * wij * (1.0 + xi12) * scratch.factor_ij[i] / probs.p2;
            for (p, &poly) in ladder.iter().enumerate() {
                self.c2[rbin * mbin + p] += common * poly;
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
        let mbin = self.bins.mbin;
        let nbins = self.bins.nbins();
        for (i, pi) in prim.iter().enumerate() {
            scratch.w_ijk[i] = 0.0;
            let Some(rbin_ij) = scratch.bin_ij[i] else {
                continue;
            };
            if prim_ids[i] == pid_k {
                continue;
            }
            let (r_ik, mu_ik) = pair_sep_mu(&pi.pos, &pk.pos);
            let xi_ik = self.cf13.xi(r_ik, mu_ik);
            let wijk = scratch.w_ij[i] * pk.w;
            scratch.xi_ik[i] = xi_ik;
            scratch.w_ijk[i] = wijk;

            let Some(rbin_ik) = self.bins.radial(r_ik) else {
                continue;
            };
            let side_factor = self.sc23.inv_phi(rbin_ik, mu_ik);
            legendre_even(mu_ik, mbin, &mut self.side_poly);

            let common =
                wijk * pi.w * xi_ik * scratch.factor_ij[i] * side_factor / p3;
            let ladder = &scratch.poly_ij[i * mbin..(i + 1) * mbin];
            for (p, &poly_ij) in ladder.iter().enumerate() {
                let row = (rbin_ij * mbin + p) * nbins + rbin_ik * mbin;
                for (q, &poly_ik) in self.side_poly.iter().enumerate() {
                    self.c3[row + q] += common * poly_ij * poly_ik;
                }
            }
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
        let mbin = self.bins.mbin;
        let nbins = self.bins.nbins();
        let (r_kl, mu_kl) = pair_sep_mu(&pk.pos, &pl.pos);
        let Some(rbin_kl) = self.bins.radial(r_kl) else {
            return;
        };
        let (r_jl, mu_jl) = pair_sep_mu(&pj.pos, &pl.pos);
        let xi_jl = self.cf24.xi(r_jl, mu_jl);
        let side_factor = self.sc34.inv_phi(rbin_kl, mu_kl);
        legendre_even(mu_kl, mbin, &mut self.side_poly);

        for (i, _pi) in prim.iter().enumerate() {
            let Some(rbin_ij) = scratch.bin_ij[i] else {
                continue;
            };
            if scratch.w_ijk[i] == 0.0 || prim_ids[i] == pid_l {
                continue;
            }
            let common = scratch.w_ijk[i] * pl.w * scratch.xi_ik[i] * xi_jl
                * scratch.factor_ij[i]
                * side_factor
                / p4;
            let ladder = &scratch.poly_ij[i * mbin..(i + 1) * mbin];
            for (p, &poly_ij) in ladder.iter().enumerate() {
                let row = (rbin_ij * mbin + p) * nbins + rbin_kl * mbin;
                for (q, &poly_kl) in self.side_poly.iter().enumerate() {
                    self.c4[row + q] += common * poly_ij * poly_kl;
                }
            }
            self.cnt4 += 1;
        }
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
        scale_array(&mut self.c2, 1.0 / (pairs.max(1.0) * n1 * n2));
        scale_array(&mut self.c3, 1.0 / (triples.max(1.0) * n1 * n2 * n3));
        scale_array(&mut self.c4, 1.0 / (quads.max(1.0) * n1 * n2 * n3 * n4));
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
        let nbins = self.bins.nbins();
        let dir = self.out.dir.clone();
        self.out
            .write_matrix(&dir, "c2", &self.out.suffix2, tag, &self.c2, self.bins.mbin)?;
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
    fn ladder_matches_closed_forms() {
        let mut out = [0.0; 3];
        for mu in [0.0, 0.3, 0.77, 1.0] {
            legendre_even(mu, 3, &mut out);
            let p2 = 0.5 * (3.0 * mu * mu - 1.0);
            let p4 = 0.125 * (35.0 * mu.powi(4) - 30.0 * mu * mu + 3.0);
            assert!((out[0] - 1.0).abs() < 1e-12);
            assert!((out[1] - 5.0 * p2).abs() < 1e-12);
            assert!((out[2] - 9.0 * p4).abs() < 1e-12);
        }
    }

    #[test]
    fn monopole_only_reduces_to_radial_binning() {
        let par = Parameters {
            nbin: 3,
            mbin: 1,
            rmin: 0.0,
            rmax: 30.0,
            ..Parameters::default()
        };
        let cf = CorrelationFunction::constant(0.0);
        let sc = SurveyCorrection::identity(3);
        let mut acc = LegendreIntegrals::new(&par, &cf, &cf, &cf, &sc, &sc, &sc, (1, 1, 1, 1));
        let mut scratch = Scratch::new(4, acc.kernel_width());

        let prim = vec![Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0)];
        let ids = vec![0];
        let pj = Particle::new(Vector3::new(0.0, 0.0, 15.0), 1.0);
        let probs = PairProbs { p2: 0.5, p21: 0.5, p22: 0.5 };
        acc.second(&prim, &ids, &pj, 7, probs, &mut scratch);

        // r = 15 → radial bin 1; P_0 ladder is 1, so c2 = w²/p2.
        assert!((acc.c2()[1] - 2.0).abs() < 1e-12);
        assert_eq!(acc.c2().iter().filter(|&&v| v != 0.0).count(), 1);
    }

    #[test]
    fn window_correction_scales_contributions() {
        let par = Parameters {
            nbin: 1,
            mbin: 1,
            rmin: 0.0,
            rmax: 30.0,
            ..Parameters::default()
        };
        let cf = CorrelationFunction::constant(0.0);
        let flat = SurveyCorrection::identity(1);
        let halved = SurveyCorrection::from_coeffs(vec![2.0], 1, 1);
        let mut plain = LegendreIntegrals::new(&par, &cf, &cf, &cf, &flat, &flat, &flat, (1, 1, 1, 1));
        let mut corrected =
            LegendreIntegrals::new(&par, &cf, &cf, &cf, &halved, &halved, &halved, (1, 1, 1, 1));
        let mut scratch = Scratch::new(4, 1);

        let prim = vec![Particle::new(Vector3::new(0.0, 0.0, 0.0), 1.0)];
        let ids = vec![0];
        let pj = Particle::new(Vector3::new(10.0, 0.0, 0.0), 1.0);
        let probs = PairProbs { p2: 1.0, p21: 1.0, p22: 1.0 };
        plain.second(&prim, &ids, &pj, 7, probs, &mut scratch);
        corrected.second(&prim, &ids, &pj, 7, probs, &mut scratch);

        assert!((corrected.c2()[0] - 0.5 * plain.c2()[0]).abs() < 1e-12);
    }
}
