//! Uniform 3D cell grid over one tracer catalog
//! • Particle : position, weight, partition tag, jackknife region
//! • Cell     : (start, count) window into the cell‑sorted particle array
//! • Grid     : cell‑sorted particles, filled‑cell list, periodic lookups
//! ------------------------------------------------------------------

use nalgebra::Vector3;
use rand::Rng;

/// One catalog entry. Immutable after the grid is built.
#[derive(Debug, Clone, Copy)]
pub struct Particle {
    pub pos: Vector3<f64>,
    pub w: f64,
    /// Random‑partition tag, 1 or 2. Pairs drawn within one partition use
    /// that partition's marginal probability.
    pub class: u8,
    /// Jackknife region id; ignored unless jackknife arrays are enabled.
    pub jk: usize,
}

impl Particle {
    pub fn new(pos: Vector3<f64>, w: f64) -> Self {
        Self { pos, w, class: 1, jk: 0 }
    }
}

/// Window into the cell‑sorted particle array, with per‑partition counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cell {
    pub start: usize,
    pub np: usize,
    pub np1: usize,
    pub np2: usize,
}

/// Outcome of drawing a random particle from a (possibly out‑of‑grid) cell.
#[derive(Debug, Clone, Copy)]
pub struct CellDraw {
    pub particle: Particle,
    /// Global id of the drawn particle (index into `Grid::p`).
    pub pid: usize,
    /// Occupancy of the cell the particle came from.
    pub np: usize,
    pub np1: usize,
    pub np2: usize,
}

/// Uniform cubic cell grid holding one tracer's particles sorted by cell.
#[derive(Debug)]
pub struct Grid {
    /// Particles, contiguous and sorted by 1‑D cell index.
    pub p: Vec<Particle>,
    /// Cells addressable by 1‑D index; `c[id].start..start+np` indexes `p`.
    pub c: Vec<Cell>,
    /// 1‑D ids of the nonempty cells.
    pub filled: Vec<usize>,
    pub nside: usize,
    pub cellsize: f64,
    pub boxsize: f64,
    pub periodic: bool,
    /// Particle totals, overall and per partition.
    pub np: usize,
    pub np1: usize,
    pub np2: usize,
    /// Number of filled cells.
    pub nf: usize,
    /// Largest per‑cell occupancy, sizing the per‑thread scratch buffers.
    pub maxnp: usize,
    /// Total particle weight Σw.
    pub norm: f64,
}

impl Grid {
    /// Build the cell decomposition by counting sort. Positions are taken
    /// modulo the box under periodic geometry and clamped otherwise.
    pub fn new(particles: Vec<Particle>, boxsize: f64, nside: usize, periodic: bool) -> Self {
        let cellsize = boxsize / nside as f64;
        let ncells = nside * nside * nside;

        let cell_of = |p: &Particle| -> usize {
            let mut id = [0usize; 3];
            for (a, v) in [p.pos.x, p.pos.y, p.pos.z].into_iter().enumerate() {
                let mut q = (v / cellsize).floor() as i64;
                if periodic {
                    q = q.rem_euclid(nside as i64);
                } else {
                    q = q.clamp(0, nside as i64 - 1);
                }
                id[a] = q as usize;
            }
            (id[0] * nside + id[1]) * nside + id[2]
        };

        // Counting sort of particles into cells.
        let mut counts = vec![0usize; ncells];
        for part in &particles {
            counts[cell_of(part)] += 1;
        }

        let mut c = vec![Cell::default(); ncells];
        let mut start = 0usize;
        for (id, cell) in c.iter_mut().enumerate() {
            cell.start = start;
            start += counts[id];
        }

        let mut cursor: Vec<usize> = c.iter().map(|cell| cell.start).collect();
        let mut p = vec![Particle::new(Vector3::zeros(), 0.0); particles.len()];
        for part in particles {
            let id = cell_of(&part);
            p[cursor[id]] = part;
            cursor[id] += 1;
        }

        let mut filled = Vec::new();
        let mut maxnp = 0usize;
        let (mut np1, mut np2) = (0usize, 0usize);
        let mut norm = 0.0;
        for (id, cell) in c.iter_mut().enumerate() {
            cell.np = counts[id];
            if cell.np > 0 {
                filled.push(id);
                maxnp = maxnp.max(cell.np);
            }
            for part in &p[cell.start..cell.start + cell.np] {
                if part.class == 2 {
                    cell.np2 += 1;
                } else {
                    cell.np1 += 1;
                }
                norm += part.w;
            }
            np1 += cell.np1;
            np2 += cell.np2;
        }

        let np = p.len();
        let nf = filled.len();
        Self {
            p,
            c,
            filled,
            nside,
            cellsize,
            boxsize,
            periodic,
            np,
            np1,
            np2,
            nf,
            maxnp,
            norm,
        }
    }

    /// 1‑D cell index for a 3‑D coordinate, or `None` when the coordinate
    /// falls outside a non‑periodic grid. Periodic grids wrap.
    pub fn test_cell(&self, id3: [i64; 3]) -> Option<usize> {
        let n = self.nside as i64;
        let mut w = [0i64; 3];
        for a in 0..3 {
            if self.periodic {
                w[a] = id3[a].rem_euclid(n);
            } else {
                if id3[a] < 0 || id3[a] >= n {
                    return None;
                }
                w[a] = id3[a];
            }
        }
        Some(((w[0] * n + w[1]) * n + w[2]) as usize)
    }

    /// 3‑D coordinate of a 1‑D cell index.
    pub fn cell_id_from_1d(&self, id1: usize) -> [i64; 3] {
        let n = self.nside;
        [
            (id1 / (n * n)) as i64,
            ((id1 / n) % n) as i64,
            (id1 % n) as i64,
        ]
    }

    /// Spatial displacement corresponding to a cell‑coordinate delta.
    /// Periodic geometry wraps each component to the nearest image.
    pub fn cell_sep(&self, delta: [i64; 3]) -> Vector3<f64> {
        let n = self.nside as i64;
        let mut out = Vector3::zeros();
        for a in 0..3 {
            let mut d = delta[a];
            if self.periodic {
                d = d.rem_euclid(n);
                if d > n / 2 {
                    d -= n;
                }
            }
            out[a] = d as f64 * self.cellsize;
        }
        out
    }

    /// Particle window of a cell by 1‑D id.
    #[inline]
    pub fn cell_particles(&self, id1: usize) -> (&[Particle], std::ops::Range<usize>) {
        let cell = self.c[id1];
        let range = cell.start..cell.start + cell.np;
        (&self.p[range.clone()], range)
    }

    /// Draw one particle uniformly from the cell at `id3`, which may lie
    /// outside the grid bounds. Returns `None` for out‑of‑grid or empty
    /// cells; both are expected outcomes of the biased cell sampler.
    ///
    /// Under periodic geometry the returned particle carries the image
    /// position belonging to the unwrapped cell coordinate, so separations
    /// against particles near the primary cell come out correct.
    pub fn draw_particle(&self, id3: [i64; 3], rng: &mut impl Rng) -> Option<CellDraw> {
        let id1 = self.test_cell(id3)?;
        let cell = self.c[id1];
        if cell.np == 0 {
            return None;
        }
        let pid = cell.start + rng.gen_range(0..cell.np);
        let mut particle = self.p[pid];
        if self.periodic {
            let n = self.nside as i64;
            for a in 0..3 {
                let image = id3[a] - id3[a].rem_euclid(n);
                particle.pos[a] += image as f64 * self.cellsize;
            }
        }
        Some(CellDraw {
            particle,
            pid,
            np: cell.np,
            np1: cell.np1,
            np2: cell.np2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn toy_grid(periodic: bool) -> Grid {
        let mut parts = Vec::new();
        for i in 0..4 {
            for j in 0..4 {
                for k in 0..4 {
                    parts.push(Particle::new(
                        Vector3::new(
                            i as f64 * 25.0 + 5.0,
                            j as f64 * 25.0 + 5.0,
                            k as f64 * 25.0 + 5.0,
                        ),
                        1.0,
                    ));
                }
            }
        }
        Grid::new(parts, 100.0, 4, periodic)
    }

    #[test]
    fn every_particle_in_exactly_one_cell() {
        let grid = toy_grid(true);
        assert_eq!(grid.np, 64);
        let covered: usize = grid.c.iter().map(|c| c.np).sum();
        assert_eq!(covered, grid.np);
        // Each cell of the toy lattice holds exactly one particle.
        assert_eq!(grid.nf, 64);
        assert_eq!(grid.maxnp, 1);
        assert!((grid.norm - 64.0).abs() < 1e-12);
    }

    #[test]
    fn filled_list_matches_occupancy() {
        let grid = toy_grid(true);
        for &id in &grid.filled {
            assert!(grid.c[id].np > 0);
        }
        let empty = grid.c.iter().filter(|c| c.np == 0).count();
        assert_eq!(empty + grid.nf, grid.c.len());
    }

    #[test]
    fn out_of_grid_lookup_is_sentinel_when_not_periodic() {
        let grid = toy_grid(false);
        assert!(grid.test_cell([-1, 0, 0]).is_none());
        assert!(grid.test_cell([0, 4, 0]).is_none());
        assert!(grid.test_cell([3, 3, 3]).is_some());
    }

    #[test]
    fn periodic_lookup_wraps() {
        let grid = toy_grid(true);
        assert_eq!(grid.test_cell([-1, 0, 0]), grid.test_cell([3, 0, 0]));
        assert_eq!(grid.test_cell([4, 2, 2]), grid.test_cell([0, 2, 2]));
    }

    #[test]
    fn cell_id_roundtrip() {
        let grid = toy_grid(true);
        for id1 in [0usize, 5, 17, 63] {
            let id3 = grid.cell_id_from_1d(id1);
            assert_eq!(grid.test_cell(id3), Some(id1));
        }
    }

    #[test]
    fn cell_sep_wraps_to_nearest_image() {
        let grid = toy_grid(true);
        let sep = grid.cell_sep([3, 0, 0]);
        // Three cells right wraps to one cell left under period 4.
        assert!((sep.x + 25.0).abs() < 1e-12);
        let raw = toy_grid(false).cell_sep([3, 0, 0]);
        assert!((raw.x - 75.0).abs() < 1e-12);
    }

    #[test]
    fn periodic_draw_carries_image_position() {
        let grid = toy_grid(true);
        let mut rng = Pcg64::seed_from_u64(7);
        let draw = grid.draw_particle([4, 0, 0], &mut rng).unwrap();
        // The wrapped cell is [0,0,0]; the image sits one box to the right.
        assert!(draw.particle.pos.x > 100.0);
        let home = grid.draw_particle([0, 0, 0], &mut rng).unwrap();
        assert!((draw.particle.pos.x - home.particle.pos.x - 100.0).abs() < 1e-9);
    }

    #[test]
    fn empty_cell_draw_is_none() {
        let mut parts = vec![Particle::new(Vector3::new(5.0, 5.0, 5.0), 1.0)];
        parts.push(Particle::new(Vector3::new(5.0, 5.0, 6.0), 2.0));
        let grid = Grid::new(parts, 100.0, 4, true);
        let mut rng = Pcg64::seed_from_u64(3);
        assert!(grid.draw_particle([3, 3, 3], &mut rng).is_none());
        let draw = grid.draw_particle([0, 0, 0], &mut rng).unwrap();
        assert_eq!(draw.np, 2);
    }

    #[test]
    fn partition_counts() {
        let mut parts = Vec::new();
        for k in 0..6 {
            let mut part = Particle::new(Vector3::new(5.0, 5.0, 5.0 + k as f64), 1.0);
            part.class = if k % 3 == 0 { 2 } else { 1 };
            parts.push(part);
        }
        let grid = Grid::new(parts, 100.0, 2, true);
        assert_eq!(grid.np1 + grid.np2, 6);
        assert_eq!(grid.np2, 2);
    }
}
