//! Two‑point correlation function ξ evaluated by table interpolation.
//!
//! Tables are either 1‑D in r or 2‑D in (r, µ); evaluation is linear /
//! bilinear with clamped ends. Beyond the last tabulated r the function
//! decays with the r⁻² tail of the last two table points, which is enough
//! for the proposal tables and the sparse large‑r kernel calls.

use std::path::Path;

use crate::error::{QuadcovError, Result};

#[derive(Debug, Clone)]
pub struct CorrelationFunction {
    r: Vec<f64>,
    /// Row‑major (r‑major) values, `n_mu` per radius.
    xi: Vec<f64>,
    n_mu: usize,
}

impl CorrelationFunction {
    /// 1‑D table in r.
    pub fn from_table(r: Vec<f64>, xi: Vec<f64>) -> Self {
        assert_eq!(r.len(), xi.len(), "radius and value columns differ");
        assert!(r.len() >= 2, "need at least two table rows");
        Self { r, xi, n_mu: 1 }
    }

    /// 2‑D table: one row of `n_mu` values per radius, µ sampled uniformly
    /// on [0, 1) at bin centers.
    pub fn from_table_2d(r: Vec<f64>, xi: Vec<f64>, n_mu: usize) -> Self {
        assert!(n_mu >= 1);
        assert_eq!(r.len() * n_mu, xi.len(), "value block shape mismatch");
        assert!(r.len() >= 2, "need at least two table rows");
        Self { r, xi, n_mu }
    }

    /// ξ ≡ c everywhere; test helper and null‑model input.
    pub fn constant(value: f64) -> Self {
        Self::from_table(vec![0.0, 1.0e4], vec![value, value])
    }

    /// Load a whitespace‑delimited table. Each record is `r xi_0 [xi_1 …]`,
    /// with one ξ column per µ bin.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b' ')
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(QuadcovError::Csv)?;

        let mut r = Vec::new();
        let mut xi = Vec::new();
        let mut n_mu = 0usize;
        for record in reader.records() {
            let record = record?;
            let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
            if fields.is_empty() {
                continue;
            }
            let parse = |s: &str| -> Result<f64> {
                s.parse::<f64>().map_err(|e| QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: format!("bad float {s:?}: {e}"),
                })
            };
            r.push(parse(fields[0])?);
            let row: Vec<f64> = fields[1..]
                .iter()
                .map(|s| parse(s))
                .collect::<Result<_>>()?;
            if row.is_empty() {
                return Err(QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: "record with no ξ columns".into(),
                });
            }
            if n_mu == 0 {
                n_mu = row.len();
            } else if n_mu != row.len() {
                return Err(QuadcovError::Table {
                    path: path.to_path_buf(),
                    reason: "ragged ξ columns".into(),
                });
            }
            xi.extend(row);
        }
        if r.len() < 2 {
            return Err(QuadcovError::Table {
                path: path.to_path_buf(),
                reason: "need at least two rows".into(),
            });
        }
        Ok(Self { r, xi, n_mu })
    }

    /// Number of µ columns in the table.
    pub fn n_mu(&self) -> usize {
        self.n_mu
    }

    /// Largest tabulated radius.
    pub fn rmax(&self) -> f64 {
        *self.r.last().unwrap_or(&0.0)
    }

    /// Bracketing index and fraction for radius `r`.
    fn locate(&self, r: f64) -> (usize, f64) {
        let n = self.r.len();
        if r <= self.r[0] {
            return (0, 0.0);
        }
        if r >= self.r[n - 1] {
            return (n - 2, 1.0);
        }
        // Tables are small; a scan beats a partition_point here only for
        // the densest tables, but binary search keeps worst cases flat.
        let hi = self.r.partition_point(|&x| x < r).max(1);
        let lo = hi - 1;
        let frac = (r - self.r[lo]) / (self.r[hi] - self.r[lo]);
        (lo, frac)
    }

    fn column(&self, mu: f64) -> (usize, usize, f64) {
        if self.n_mu == 1 {
            return (0, 0, 0.0);
        }
        // Columns sample µ bin centers on [0, 1).
        let x = mu.clamp(0.0, 1.0) * self.n_mu as f64 - 0.5;
        if x <= 0.0 {
            return (0, 0, 0.0);
        }
        if x >= (self.n_mu - 1) as f64 {
            return (self.n_mu - 1, self.n_mu - 1, 0.0);
        }
        let lo = x.floor() as usize;
        (lo, lo + 1, x - lo as f64)
    }

    /// ξ(r, µ); bilinear in (r, µ) for 2‑D tables.
    pub fn xi(&self, r: f64, mu: f64) -> f64 {
        let tail = self.tail_factor(r);
        let (lo, frac) = self.locate(r.min(self.rmax()));
        let (c0, c1, cfrac) = self.column(mu);
        let at = |row: usize, col: usize| self.xi[row * self.n_mu + col];
        let lo_val = at(lo, c0) * (1.0 - cfrac) + at(lo, c1) * cfrac;
        let hi_val = at(lo + 1, c0) * (1.0 - cfrac) + at(lo + 1, c1) * cfrac;
        tail * (lo_val * (1.0 - frac) + hi_val * frac)
    }

    /// µ‑averaged ξ(r).
    pub fn xi_r(&self, r: f64) -> f64 {
        let tail = self.tail_factor(r);
        let (lo, frac) = self.locate(r.min(self.rmax()));
        let row = |idx: usize| -> f64 {
            let s: f64 = self.xi[idx * self.n_mu..(idx + 1) * self.n_mu].iter().sum();
            s / self.n_mu as f64
        };
        tail * (row(lo) * (1.0 - frac) + row(lo + 1) * frac)
    }

    #[inline]
    fn tail_factor(&self, r: f64) -> f64 {
        let rmax = self.rmax();
        if r > rmax {
            (rmax / r).powi(2)
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_interpolation() {
        let cf = CorrelationFunction::from_table(vec![0.0, 10.0, 20.0], vec![1.0, 0.5, 0.25]);
        assert!((cf.xi_r(5.0) - 0.75).abs() < 1e-12);
        assert!((cf.xi_r(15.0) - 0.375).abs() < 1e-12);
        // Clamped below the first point.
        assert!((cf.xi_r(0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tail_decays_as_r_squared() {
        let cf = CorrelationFunction::from_table(vec![0.0, 100.0], vec![1.0, 0.1]);
        let at_edge = cf.xi_r(100.0);
        let beyond = cf.xi_r(200.0);
        assert!((beyond - at_edge * 0.25).abs() < 1e-12);
    }

    #[test]
    fn bilinear_in_mu() {
        // Two µ columns: ξ grows with µ.
        let cf = CorrelationFunction::from_table_2d(
            vec![0.0, 10.0],
            vec![0.0, 1.0, 0.0, 1.0],
            2,
        );
        // Column centers at µ = 0.25, 0.75.
        assert!((cf.xi(5.0, 0.25) - 0.0).abs() < 1e-12);
        assert!((cf.xi(5.0, 0.75) - 1.0).abs() < 1e-12);
        assert!((cf.xi(5.0, 0.5) - 0.5).abs() < 1e-12);
        // µ average.
        assert!((cf.xi_r(5.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn constant_table() {
        let cf = CorrelationFunction::constant(0.2);
        for r in [0.0, 1.0, 50.0, 5000.0] {
            assert!((cf.xi(r, 0.3) - 0.2 * cf.tail_factor(r) / 1.0).abs() < 1e-9);
        }
        assert!((cf.xi(500.0, 0.0) - 0.2 * (1.0e4_f64 / 500.0).powi(2).min(1.0)).abs() < 1e-9);
    }
}
