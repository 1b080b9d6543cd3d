//! Jackknife region weights for the resampled covariance arrays.
//!
//! For every (bin a, region A) a precomputed weight w_aA gives the share
//! of pair counts region A carries in bin a. The accumulators need the
//! per‑region weights and the bin‑pair product tables Σ_A w_aA · w_bA,
//! which are expensive enough to precompute once per tracer combination.

use std::path::Path;

use crate::error::{QuadcovError, Result};

#[derive(Debug, Clone)]
pub struct JackknifeWeights {
    /// w_aA, region‑major: `weights[region * nbins + bin]`.
    weights: Vec<f64>,
    pub n_jk: usize,
    pub nbins: usize,
    /// Σ_A w_aA · w_bA for this weight set against itself, `nbins²` flat.
    pub product_weights: Vec<f64>,
}

impl JackknifeWeights {
    pub fn new(weights: Vec<f64>, n_jk: usize, nbins: usize) -> Self {
        assert_eq!(weights.len(), n_jk * nbins, "weight block shape");
        let mut jk = Self {
            weights,
            n_jk,
            nbins,
            product_weights: Vec::new(),
        };
        jk.product_weights = jk.product_with(&jk.clone());
        jk
    }

    /// Equal weights 1/n_jk in every bin; test geometry and the limit of a
    /// survey with identical regions.
    pub fn uniform(n_jk: usize, nbins: usize) -> Self {
        Self::new(vec![1.0 / n_jk as f64; n_jk * nbins], n_jk, nbins)
    }

    /// Load a region‑per‑row table: `region_id w_0 w_1 … w_{nbins−1}`.
    pub fn from_file(path: &Path, nbins: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b' ')
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(QuadcovError::Csv)?;

        let mut weights = Vec::new();
        let mut n_jk = 0usize;
        for record in reader.records() {
            let record = record?;
            let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != nbins + 1 {
                return Err(QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: format!("expected {} weight columns", nbins),
                });
            }
            for s in &fields[1..] {
                let w = s.parse::<f64>().map_err(|e| QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: format!("bad float {s:?}: {e}"),
                })?;
                weights.push(w);
            }
            n_jk += 1;
        }
        if n_jk == 0 {
            return Err(QuadcovError::Table {
                path: path.to_path_buf(),
                reason: "no regions".into(),
            });
        }
        Ok(Self::new(weights, n_jk, nbins))
    }

    /// w_aA for one region and bin.
    #[inline]
    pub fn weight(&self, region: usize, bin: usize) -> f64 {
        self.weights[region * self.nbins + bin]
    }

    /// Cross product table Σ_A w_aA · other_bA, `nbins²` flat with the
    /// first index from `self`.
    pub fn product_with(&self, other: &JackknifeWeights) -> Vec<f64> {
        assert_eq!(self.nbins, other.nbins);
        assert_eq!(self.n_jk, other.n_jk);
        let nbins = self.nbins;
        let mut table = vec![0.0; nbins * nbins];
        for region in 0..self.n_jk {
            let row_a = &self.weights[region * nbins..(region + 1) * nbins];
            let row_b = &other.weights[region * nbins..(region + 1) * nbins];
            for (a, &wa) in row_a.iter().enumerate() {
                let out = &mut table[a * nbins..(a + 1) * nbins];
                for (b, &wb) in row_b.iter().enumerate() {
                    out[b] += wa * wb;
                }
            }
        }
        table
    }
}
