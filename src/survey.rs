//! Survey window‑function corrections for the multipole binning variants.
//!
//! The correction Φ(r, µ) is stored as a low‑order polynomial in µ per
//! radial bin; the accumulators multiply by its inverse per pair. Periodic
//! boxes use the identity correction.

use std::path::Path;

use crate::error::{QuadcovError, Result};

#[derive(Debug, Clone)]
pub struct SurveyCorrection {
    /// `n_param` polynomial coefficients per radial bin, row‑major.
    coeffs: Vec<f64>,
    n_param: usize,
    nbin: usize,
}

impl SurveyCorrection {
    /// Φ ≡ 1 everywhere: periodic‑box geometry.
    pub fn identity(nbin: usize) -> Self {
        let n_param = 1;
        Self {
            coeffs: vec![1.0; nbin],
            n_param,
            nbin,
        }
    }

    pub fn from_coeffs(coeffs: Vec<f64>, n_param: usize, nbin: usize) -> Self {
        assert_eq!(coeffs.len(), n_param * nbin, "coefficient block shape");
        assert!(n_param >= 1);
        Self { coeffs, n_param, nbin }
    }

    /// Load per‑bin polynomial coefficients, one whitespace‑delimited row
    /// per radial bin.
    pub fn from_file(path: &Path, nbin: usize) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b' ')
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(QuadcovError::Csv)?;

        let mut coeffs = Vec::new();
        let mut n_param = 0usize;
        for record in reader.records() {
            let record = record?;
            let row: Vec<f64> = record
                .iter()
                .filter(|f| !f.is_empty())
                .map(|s| {
                    s.parse::<f64>().map_err(|e| QuadcovError::Table {
                        path: path.to_path_buf(),
                        reason: format!("bad float {s:?}: {e}"),
                    })
                })
                .collect::<Result<_>>()?;
            if row.is_empty() {
                continue;
            }
            if n_param == 0 {
                n_param = row.len();
            } else if n_param != row.len() {
                return Err(QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: "ragged coefficient rows".into(),
                });
            }
            coeffs.extend(row);
        }
        if coeffs.len() != n_param * nbin {
            return Err(QuadcovError::Table {
                path: path.to_path_buf(),
                reason: format!("expected {nbin} rows of coefficients"),
            });
        }
        Ok(Self { coeffs, n_param, nbin })
    }

    /// 1/Φ(bin, µ). The window never vanishes on a sane survey; a zero
    /// evaluation indicates a broken correction table.
    pub fn inv_phi(&self, bin: usize, mu: f64) -> f64 {
        debug_assert!(bin < self.nbin);
        let row = &self.coeffs[bin * self.n_param..(bin + 1) * self.n_param];
        let mut phi = 0.0;
        let mut pow = 1.0;
        for &coef in row {
            phi += coef * pow;
            pow *= mu;
        }
        1.0 / phi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_unity() {
        let sc = SurveyCorrection::identity(4);
        for bin in 0..4 {
            for mu in [0.0, 0.3, 0.99] {
                assert!((sc.inv_phi(bin, mu) - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn polynomial_evaluation() {
        // Φ(µ) = 1 + µ² in bin 0, constant 2 in bin 1.
        let sc = SurveyCorrection::from_coeffs(vec![1.0, 0.0, 1.0, 2.0, 0.0, 0.0], 3, 2);
        assert!((sc.inv_phi(0, 0.5) - 1.0 / 1.25).abs() < 1e-12);
        assert!((sc.inv_phi(1, 0.9) - 0.5).abs() < 1e-12);
    }
}
