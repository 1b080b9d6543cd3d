//! (radial × µ)‑binned integral accumulator, with optional jackknife
//! region arrays.
//!
//! The jackknife block carries three kinds of arrays:
//! • corrected c2j/c3j/c4j with the Σ_A (q_A − w_aA)(q_A − w_bA) algebra,
//!   using the precomputed bin‑pair product‑weight tables;
//! • a region‑resolved split c2r of the plain C2 (q_A disaggregation, so
//!   the region sum reproduces C2 exactly);
//! • per‑region RR pair counts and EE correlation estimates, the latter
//!   built from same‑partition pairs with the partitioned marginals.

use std::io;

use crate::accumulator::{
    add_arrays, pair_sep_mu, rel_frobenius, scale_array, BinEdges, FrobDeltas, Integrals,
    OutputSpec, PairProbs, Scratch,
};
use crate::correlation::CorrelationFunction;
use crate::grid::Particle;
use crate::jackknife::JackknifeWeights;
use crate::params::Parameters;

/// Jackknife tables and arrays attached to an angular accumulator.
#[derive(Debug, Clone)]
pub struct JackknifePiece<'a> {
    jk12: &'a JackknifeWeights,
    jk23: &'a JackknifeWeights,
    jk34: &'a JackknifeWeights,
    pw12_12: &'a [f64],
    pw12_23: &'a [f64],
    pw12_34: &'a [f64],
    n_jk: usize,
    c2j: Vec<f64>,
    c3j: Vec<f64>,
    c4j: Vec<f64>,
    /// Region‑resolved C2, `n_jk × nbins`.
    c2r: Vec<f64>,
    rr: Vec<f64>,
    ee: Vec<f64>,
}

impl<'a> JackknifePiece<'a> {
    pub fn new(
        nbins: usize,
        jk12: &'a JackknifeWeights,
        jk23: &'a JackknifeWeights,
        jk34: &'a JackknifeWeights,
        pw12_12: &'a [f64],
        pw12_23: &'a [f64],
        pw12_34: &'a [f64],
    ) -> Self {
        let n_jk = jk12.n_jk;
        Self {
            jk12,
            jk23,
            jk34,
            pw12_12,
            pw12_23,
            pw12_34,
            n_jk,
            c2j: vec![0.0; nbins],
            c3j: vec![0.0; nbins * nbins],
            c4j: vec![0.0; nbins * nbins],
            c2r: vec![0.0; n_jk * nbins],
            rr: vec![0.0; n_jk * nbins],
            ee: vec![0.0; n_jk * nbins],
        }
    }

    fn reset(&mut self) {
        for arr in [
            &mut self.c2j,
            &mut self.c3j,
            &mut self.c4j,
            &mut self.c2r,
            &mut self.rr,
            &mut self.ee,
        ] {
            arr.fill(0.0);
        }
    }
}

pub struct AngularIntegrals<'a> {
    bins: BinEdges,
    cf12: &'a CorrelationFunction,
    cf13: &'a CorrelationFunction,
    cf24: &'a CorrelationFunction,
    c2: Vec<f64>,
    c3: Vec<f64>,
    c4: Vec<f64>,
    cnt2: u64,
    cnt3: u64,
    cnt4: u64,
    jack: Option<JackknifePiece<'a>>,
    out: OutputSpec,
}

impl<'a> AngularIntegrals<'a> {
    pub fn new(
        par: &Parameters,
        cf12: &'a CorrelationFunction,
        cf13: &'a CorrelationFunction,
        cf24: &'a CorrelationFunction,
        jack: Option<JackknifePiece<'a>>,
        combo: (usize, usize, usize, usize),
    ) -> Self {
        let bins = BinEdges::from_params(par);
        let nbins = bins.nbins();
        let jack_subdir = jack.as_ref().map(|_| "CovMatricesJack");
        Self {
            bins,
            cf12,
            cf13,
            cf24,
            c2: vec![0.0; nbins],
            c3: vec![0.0; nbins * nbins],
            c4: vec![0.0; nbins * nbins],
            cnt2: 0,
            cnt3: 0,
            cnt4: 0,
            jack,
            out: OutputSpec::new(par, "CovMatrices", jack_subdir, combo),
        }
    }

    /// Region‑resolved C2, `n_jk × nbins` row‑major; empty without
    /// jackknife arrays.
    pub fn c2_regions(&self) -> &[f64] {
        self.jack.as_ref().map_or(&[], |j| &j.c2r)
    }

    pub fn c2_jack(&self) -> &[f64] {
        self.jack.as_ref().map_or(&[], |j| &j.c2j)
    }

    pub fn c3_jack(&self) -> &[f64] {
        self.jack.as_ref().map_or(&[], |j| &j.c3j)
    }

    pub fn c4_jack(&self) -> &[f64] {
        self.jack.as_ref().map_or(&[], |j| &j.c4j)
    }

    pub fn n_jk(&self) -> usize {
        self.jack.as_ref().map_or(0, |j| j.n_jk)
    }
}

impl<'a> Integrals for AngularIntegrals<'a> {
    fn fresh(&self) -> Self {
        let jack = self.jack.as_ref().map(|j| {
            JackknifePiece::new(
                self.bins.nbins(),
                j.jk12,
                j.jk23,
                j.jk34,
                j.pw12_12,
                j.pw12_23,
                j.pw12_34,
            )
        });
        Self {
            bins: self.bins,
            cf12: self.cf12,
            cf13: self.cf13,
            cf24: self.cf24,
            c2: vec![0.0; self.c2.len()],
            c3: vec![0.0; self.c3.len()],
            c4: vec![0.0; self.c4.len()],
            cnt2: 0,
            cnt3: 0,
            cnt4: 0,
            jack,
            out: self.out.clone(),
        }
    }

    fn kernel_width(&self) -> usize {
        0
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
        let nbins = self.bins.nbins();
        for (i, pi) in prim.iter().enumerate() {
            scratch.bin_ij[i] = None;
            if prim_ids[i] == pid_j {
                continue;
            }
            let (r, mu) = pair_sep_mu(&pi.pos, &pj.pos);
            let Some(bin) = self.bins.pair_bin(r, mu) else {
                continue;
            };
            let wij = pi.w * pj.w;
            scratch.bin_ij[i] = Some(bin);
            scratch.w_ij[i] = wij;

            let xi12 = self.cf12.xi(r, mu);
            let c2v = wij * wij * (1.0 + xi12) / probs.p2;
            self.c2[bin] += c2v;
            self.cnt2 += 1;

            if let Some(jack) = self.jack.as_mut() {
                let (ai, aj) = (pi.jk, pj.jk);
                // Σ_A (q_A − w_aA)² with q_A the half split over the two
                // member regions.
                let qq = 0.5 * (1.0 + f64::from(ai == aj));
                let wq = jack.jk12.weight(ai, bin) + jack.jk12.weight(aj, bin);
                let pw = jack.pw12_12[bin * nbins + bin];
                jack.c2j[bin] += c2v * (qq - wq + pw);

                jack.c2r[ai * nbins + bin] += 0.5 * c2v;
                jack.c2r[aj * nbins + bin] += 0.5 * c2v;

                let rrv = wij / probs.p2;
                jack.rr[ai * nbins + bin] += 0.5 * rrv;
                jack.rr[aj * nbins + bin] += 0.5 * rrv;

                // Correlation estimate from same‑partition pairs, each
                // partition unbiased under its own marginal; halve the
                // two‑partition double count.
                if pi.class == pj.class {
                    let marginal = if pi.class == 2 { probs.p22 } else { probs.p21 };
                    if marginal > 0.0 {
                        let eev = 0.5 * wij * xi12 / marginal;
                        jack.ee[ai * nbins + bin] += 0.5 * eev;
                        jack.ee[aj * nbins + bin] += 0.5 * eev;
                    }
                }
            }
        }
    }

    fn third(
        &mut self,
        prim: &[Particle],
        prim_ids: &[usize],
        pj: &Particle,
        pk: &Particle,
        _pid_j: usize,
        pid_k: usize,
        p3: f64,
        scratch: &mut Scratch,
    ) {
        let nbins = self.bins.nbins();
        for (i, pi) in prim.iter().enumerate() {
            scratch.w_ijk[i] = 0.0;
            let Some(bin_ij) = scratch.bin_ij[i] else {
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

            let Some(bin_ik) = self.bins.pair_bin(r_ik, mu_ik) else {
                continue;
            };
            let c3v = wijk * pi.w * xi_ik / p3;
            self.c3[bin_ij * nbins + bin_ik] += c3v;
            self.cnt3 += 1;

            if let Some(jack) = self.jack.as_mut() {
                let (ai, aj, ak) = (pi.jk, pj.jk, pk.jk);
                let qq = 0.25
                    * (1.0
                        + f64::from(ai == ak)
                        + f64::from(ai == aj)
                        + f64::from(aj == ak));
                let qw = 0.5 * (jack.jk23.weight(ai, bin_ik) + jack.jk23.weight(aj, bin_ik));
                let wq = 0.5 * (jack.jk12.weight(ai, bin_ij) + jack.jk12.weight(ak, bin_ij));
                let pw = jack.pw12_23[bin_ij * nbins + bin_ik];
                jack.c3j[bin_ij * nbins + bin_ik] += c3v * (qq - qw - wq + pw);
            }
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
        let nbins = self.bins.nbins();
        let (r_kl, mu_kl) = pair_sep_mu(&pk.pos, &pl.pos);
        let Some(bin_kl) = self.bins.pair_bin(r_kl, mu_kl) else {
            return;
        };
        let (r_jl, mu_jl) = pair_sep_mu(&pj.pos, &pl.pos);
        let xi_jl = self.cf24.xi(r_jl, mu_jl);

        for (i, pi) in prim.iter().enumerate() {
            let Some(bin_ij) = scratch.bin_ij[i] else {
                continue;
            };
            if scratch.w_ijk[i] == 0.0 || prim_ids[i] == pid_l {
                continue;
            }
            let c4v = scratch.w_ijk[i] * pl.w * scratch.xi_ik[i] * xi_jl / p4;
            self.c4[bin_ij * nbins + bin_kl] += c4v;
            self.cnt4 += 1;

            if let Some(jack) = self.jack.as_mut() {
                let (ai, aj, ak, al) = (pi.jk, pj.jk, pk.jk, pl.jk);
                let qq = 0.25
                    * (f64::from(ai == ak)
                        + f64::from(ai == al)
                        + f64::from(aj == ak)
                        + f64::from(aj == al));
                let qw = 0.5 * (jack.jk34.weight(ai, bin_kl) + jack.jk34.weight(aj, bin_kl));
                let wq = 0.5 * (jack.jk12.weight(ak, bin_ij) + jack.jk12.weight(al, bin_ij));
                let pw = jack.pw12_34[bin_ij * nbins + bin_kl];
                jack.c4j[bin_ij * nbins + bin_kl] += c4v * (qq - qw - wq + pw);
            }
        }
    }

    fn sum_ints(&mut self, other: &Self) {
        add_arrays(&mut self.c2, &other.c2);
        add_arrays(&mut self.c3, &other.c3);
        add_arrays(&mut self.c4, &other.c4);
        self.cnt2 += other.cnt2;
        self.cnt3 += other.cnt3;
        self.cnt4 += other.cnt4;
        if let (Some(a), Some(b)) = (self.jack.as_mut(), other.jack.as_ref()) {
            add_arrays(&mut a.c2j, &b.c2j);
            add_arrays(&mut a.c3j, &b.c3j);
            add_arrays(&mut a.c4j, &b.c4j);
            add_arrays(&mut a.c2r, &b.c2r);
            add_arrays(&mut a.rr, &b.rr);
            add_arrays(&mut a.ee, &b.ee);
        }
    }

    fn reset(&mut self) {
        self.c2.fill(0.0);
        self.c3.fill(0.0);
        self.c4.fill(0.0);
        self.cnt2 = 0;
        self.cnt3 = 0;
        self.cnt4 = 0;
        if let Some(jack) = self.jack.as_mut() {
            jack.reset();
        }
    }

    fn normalize(&mut self, norms: [f64; 4], pairs: f64, triples: f64, quads: f64) {
        let [n1, n2, n3, n4] = norms;
        let f2 = 1.0 / (pairs.max(1.0) * n1 * n2);
        let f3 = 1.0 / (triples.max(1.0) * n1 * n2 * n3);
        let f4 = 1.0 / (quads.max(1.0) * n1 * n2 * n3 * n4);
        scale_array(&mut self.c2, f2);
        scale_array(&mut self.c3, f3);
        scale_array(&mut self.c4, f4);
        if let Some(jack) = self.jack.as_mut() {
            scale_array(&mut jack.c2j, f2);
            scale_array(&mut jack.c3j, f3);
            scale_array(&mut jack.c4j, f4);
            scale_array(&mut jack.c2r, f2);
            scale_array(&mut jack.rr, f2);
            scale_array(&mut jack.ee, f2);
        }
    }

    fn frobenius_difference_sum(&mut self, local: &Self, n_prev: usize) -> FrobDeltas {
        let deltas = FrobDeltas {
            c2: rel_frobenius(&self.c2, &local.c2, n_prev),
            c3: rel_frobenius(&self.c3, &local.c3, n_prev),
            c4: rel_frobenius(&self.c4, &local.c4, n_prev),
            c2j: self
                .jack
                .as_ref()
                .zip(local.jack.as_ref())
                .map(|(a, b)| rel_frobenius(&a.c2j, &b.c2j, n_prev)),
            c3j: self
                .jack
                .as_ref()
                .zip(local.jack.as_ref())
                .map(|(a, b)| rel_frobenius(&a.c3j, &b.c3j, n_prev)),
            c4j: self
                .jack
                .as_ref()
                .zip(local.jack.as_ref())
                .map(|(a, b)| rel_frobenius(&a.c4j, &b.c4j, n_prev)),
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

    fn save_jackknife_integrals(&self, tag: &str) -> io::Result<()> {
        let Some(jack) = self.jack.as_ref() else {
            return Ok(());
        };
        let nbins = self.bins.nbins();
        let dir = self.out.jack_dir.clone().expect("jackknife output directory");
        self.out
            .write_matrix(&dir, "c2j", &self.out.suffix2, tag, &jack.c2j, self.bins.mbin)?;
        self.out
            .write_matrix(&dir, "c3j", &self.out.suffix3, tag, &jack.c3j, nbins)?;
        self.out
            .write_matrix(&dir, "c4j", &self.out.suffix4, tag, &jack.c4j, nbins)?;
        self.out
            .write_matrix(&dir, "c2r", &self.out.suffix2, tag, &jack.c2r, nbins)?;
        self.out
            .write_matrix(&dir, "RR", &self.out.suffix2, tag, &jack.rr, nbins)?;
        self.out
            .write_matrix(&dir, "EE", &self.out.suffix2, tag, &jack.ee, nbins)
    }

    fn has_jackknife(&self) -> bool {
        self.jack.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn test_parameters() -> Parameters {
        Parameters {
            nbin: 3,
            mbin: 2,
            rmin: 0.5,
            rmax: 30.5,
            ..Parameters::default()
        }
    }

    fn probe_particles() -> (Vec<Particle>, Vec<usize>) {
        let mut prim = Vec::new();
        for k in 0..4 {
            let mut p = Particle::new(Vector3::new(0.0, 0.0, k as f64 * 3.0), 1.0 + k as f64 * 0.1);
            p.jk = k % 2;
            p.class = 1 + (k % 2) as u8;
            prim.push(p);
        }
        let ids = vec![0, 1, 2, 3];
        (prim, ids)
    }

    fn probs() -> PairProbs {
        PairProbs {
            p2: 0.01,
            p21: 0.02,
            p22: 0.03,
        }
    }

    #[test]
    fn second_fills_scratch_and_c2() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.0);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, None, (1, 1, 1, 1));
        let mut scratch = Scratch::new(8, acc.kernel_width());
        let (prim, ids) = probe_particles();
        let mut pj = Particle::new(Vector3::new(0.0, 0.0, 39.0), 2.0);
        pj.jk = 1;

        acc.second(&prim, &ids, &pj, 99, probs(), &mut scratch);

        // Only particle 3 (30 away along z) is inside rmax; µ = 1 lands in
        // the last µ bin.
        assert_eq!(scratch.bin_ij[0], None); // r = 39 out of range
        assert_eq!(scratch.bin_ij[1], None); // r = 36
        assert_eq!(scratch.bin_ij[2], None); // r = 33
        assert_eq!(scratch.bin_ij[3], Some(2 * 2 + 1)); // r = 30 → last radial bin
        let (cnt2, _, _) = acc.counts();
        assert_eq!(cnt2, 1);
        let expected = (1.3 * 2.0) * (1.3 * 2.0) / 0.01;
        assert!((acc.c2()[5] - expected).abs() / expected < 1e-12);
    }

    #[test]
    fn self_pair_is_skipped_by_id() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.0);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, None, (1, 1, 1, 1));
        let mut scratch = Scratch::new(8, 0);
        let (prim, ids) = probe_particles();
        // pj is literally particle 1 of the primary list.
        let pj = prim[1];
        acc.second(&prim, &ids, &pj, 1, probs(), &mut scratch);
        assert_eq!(scratch.bin_ij[1], None);
    }

    #[test]
    fn sum_of_region_resolved_c2_matches_plain_c2() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.3);
        let jk = JackknifeWeights::uniform(4, 6);
        let pw = jk.product_weights.clone();
        let piece = JackknifePiece::new(6, &jk, &jk, &jk, &pw, &pw, &pw);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, Some(piece), (1, 1, 1, 1));
        let mut scratch = Scratch::new(8, 0);
        let (mut prim, ids) = probe_particles();
        prim[2].jk = 3;

        for z in [2.0_f64, 7.5, 18.0, 26.0] {
            let mut pj = Particle::new(Vector3::new(1.0, 2.0, z), 0.7);
            pj.jk = (z as usize) % 4;
            acc.second(&prim, &ids, &pj, 50, probs(), &mut scratch);
        }

        let nbins = 6;
        let regions = acc.c2_regions().to_vec();
        for bin in 0..nbins {
            let region_sum: f64 = (0..acc.n_jk()).map(|a| regions[a * nbins + bin]).sum();
            let plain = acc.c2()[bin];
            assert!(
                (region_sum - plain).abs() <= 1e-12 * plain.abs().max(1.0),
                "bin {bin}: {region_sum} vs {plain}"
            );
        }
    }

    #[test]
    fn kernels_compose_and_sum_ints_reproduces() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.2);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, None, (1, 1, 1, 1));
        let mut scratch = Scratch::new(8, 0);
        let (prim, ids) = probe_particles();
        let pj = Particle::new(Vector3::new(0.0, 5.0, 2.0), 1.0);
        let pk = Particle::new(Vector3::new(4.0, 0.0, 6.0), 0.9);
        let pl = Particle::new(Vector3::new(4.0, 3.0, 9.0), 1.1);

        acc.second(&prim, &ids, &pj, 10, probs(), &mut scratch);
        acc.third(&prim, &ids, &pj, &pk, 10, 11, 1.0e-4, &mut scratch);
        acc.fourth(&prim, &ids, &pj, &pk, &pl, 10, 11, 12, 1.0e-6, &mut scratch);

        let (cnt2, cnt3, cnt4) = acc.counts();
        assert!(cnt2 > 0 && cnt3 > 0 && cnt4 > 0);
        assert!(acc.c4().iter().any(|&v| v != 0.0));

        // Folding into an empty accumulator reproduces the arrays.
        let mut other = acc.fresh();
        other.sum_ints(&acc);
        assert_eq!(other.c2(), acc.c2());
        assert_eq!(other.c3(), acc.c3());
        assert_eq!(other.c4(), acc.c4());
        assert_eq!(other.counts(), acc.counts());

        // Reset zeroes everything.
        other.reset();
        assert!(other.c2().iter().all(|&v| v == 0.0));
        assert!(other.c3().iter().all(|&v| v == 0.0));
        assert!(other.c4().iter().all(|&v| v == 0.0));
        assert_eq!(other.counts(), (0, 0, 0));
    }

    #[test]
    fn collision_ids_are_skipped_downstream() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.2);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, None, (1, 1, 1, 1));
        let mut scratch = Scratch::new(8, 0);
        let (prim, ids) = probe_particles();
        let pj = Particle::new(Vector3::new(0.0, 5.0, 2.0), 1.0);
        let pk = prim[2];

        acc.second(&prim, &ids, &pj, 10, probs(), &mut scratch);
        // k collides with primary particle 2: that slot must not feed C4.
        acc.third(&prim, &ids, &pj, &pk, 10, 2, 1.0e-4, &mut scratch);
        assert_eq!(scratch.w_ijk[2], 0.0);
    }

    #[test]
    fn normalize_divides_by_counts_and_norms() {
        let par = test_parameters();
        let cf = CorrelationFunction::constant(0.0);
        let mut acc = AngularIntegrals::new(&par, &cf, &cf, &cf, None, (1, 1, 1, 1));
        acc.c2[0] = 8.0;
        acc.c3[0] = 27.0;
        acc.c4[0] = 64.0;
        acc.normalize([2.0, 2.0, 3.0, 4.0], 2.0, 3.0, 4.0);
        assert!((acc.c2()[0] - 1.0).abs() < 1e-12);
        assert!((acc.c3()[0] - 27.0 / (3.0 * 12.0)).abs() < 1e-12);
        assert!((acc.c4()[0] - 64.0 / (4.0 * 48.0)).abs() < 1e-12);
    }
}
