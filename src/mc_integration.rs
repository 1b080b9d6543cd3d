//! Sampling driver: iterates primary cells, draws j/k/l cells from the
//! biased displacement distributions, and folds every draw into the
//! per‑thread accumulators.
//!
//! Work is distributed dynamically over outer loops across a dedicated
//! thread pool. Each worker owns its accumulator, RNG stream and scratch
//! buffers; after every loop the local sums fold into the shared global
//! under a lock, the Frobenius convergence metric is refreshed, and the
//! per‑loop (normalized) partial result is written out so interrupted
//! runs can be aggregated externally.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_pcg::Pcg64;

use crate::accumulator::{FrobDeltas, Integrals, PairProbs, Scratch};
use crate::angular::{AngularIntegrals, JackknifePiece};
use crate::correlation::CorrelationFunction;
use crate::error::Result;
use crate::grid::Grid;
use crate::jackknife::JackknifeWeights;
use crate::legendre::LegendreIntegrals;
use crate::params::{BinningMode, Parameters};
use crate::power::PowerIntegrals;
use crate::random_draws::RandomDraws;
use crate::survey::SurveyCorrection;

/// Consecutive converged reductions required before the remaining loops
/// are skipped.
pub const CONVERGENCE_RUNS: usize = 10;

/// Tracer index combinations to integrate. Multi‑tracer runs cover the
/// seven distinct (I1, I2, I3, I4) combinations in this fixed order.
pub fn tracer_combinations(multi: bool) -> Vec<(usize, usize, usize, usize)> {
    if multi {
        vec![
            (1, 1, 1, 1),
            (1, 1, 1, 2),
            (1, 1, 2, 2),
            (1, 2, 2, 2),
            (2, 2, 2, 2),
            (1, 1, 2, 1),
            (1, 2, 1, 2),
        ]
    } else {
        vec![(1, 1, 1, 1)]
    }
}

/// Index into the per‑pair table triplets: auto (1,1) → 0, auto (2,2) → 1,
/// cross → 2.
#[inline]
pub fn which_index(ia: usize, ib: usize) -> usize {
    if ia == 1 && ib == 1 {
        0
    } else if ia == 2 && ib == 2 {
        1
    } else {
        2
    }
}

/// Grids and draw tables selected for one tracer combination.
pub struct GridSet<'a> {
    pub grid1: &'a Grid,
    pub grid2: &'a Grid,
    pub grid3: &'a Grid,
    pub grid4: &'a Grid,
    pub rd13: &'a RandomDraws,
    pub rd24: &'a RandomDraws,
}

/// Attempt and acceptance statistics of one integral run.
#[derive(Debug, Clone, Default)]
pub struct RunCounts {
    pub tot_pairs: u64,
    pub tot_triples: u64,
    pub tot_quads: u64,
    pub cell_attempt2: u64,
    pub cell_attempt3: u64,
    pub cell_attempt4: u64,
    pub used_cell2: u64,
    pub used_cell3: u64,
    pub used_cell4: u64,
    pub cnt2: u64,
    pub cnt3: u64,
    pub cnt4: u64,
    pub loops_executed: usize,
    pub loops_skipped: usize,
    pub convergence_counter: usize,
    pub frob_history: Vec<FrobDeltas>,
}

/// Owned copy of a finished accumulator, safe to hand to callers after
/// the shared tables go out of scope.
#[derive(Debug, Clone)]
pub struct IntegralResult {
    pub c2: Vec<f64>,
    pub c3: Vec<f64>,
    pub c4: Vec<f64>,
    pub c2_jack: Vec<f64>,
    pub c3_jack: Vec<f64>,
    pub c4_jack: Vec<f64>,
    pub c2_regions: Vec<f64>,
    pub n_jk: usize,
    pub counts: RunCounts,
}

struct SharedState<I> {
    sumint: I,
    loops_folded: usize,
    frob_history: Vec<FrobDeltas>,
}

/// Per‑worker attempt counters, flushed into the shared atomics once per
/// loop to keep the hot path free of contended writes.
#[derive(Default)]
struct LocalCounts {
    attempt2: u64,
    attempt3: u64,
    attempt4: u64,
    used2: u64,
    used3: u64,
    used4: u64,
}

#[inline]
fn offset(id: [i64; 3], delta: [i64; 3]) -> [i64; 3] {
    [id[0] + delta[0], id[1] + delta[1], id[2] + delta[2]]
}

fn format_hms(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        seconds / 60 % 60,
        seconds % 60
    )
}

/// Run the full sampling loop for one tracer combination with a caller
/// supplied accumulator factory. Returns the normalized global
/// accumulator and the run statistics; per‑loop and final arrays are
/// written below the configured output directory on the way.
pub fn integral_loop<I, F>(
    par: &Parameters,
    grids: &GridSet<'_>,
    make_local: F,
    iter_no: usize,
    tot_iter: usize,
) -> Result<(I, RunCounts)>
where
    I: Integrals,
    F: Fn() -> I + Sync,
{
    par.validate();
    let grid1 = grids.grid1;
    assert!(grid1.nf > 0, "primary grid has no filled cells");

    let init = Instant::now();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(par.nthread)
        .build()?;

    let process_seed = par
        .seed
        .unwrap_or_else(|| ChaCha20Rng::from_entropy().next_u64());

    let norms = [
        grid1.norm,
        grids.grid2.norm,
        grids.grid3.norm,
        grids.grid4.norm,
    ];

    let global = Mutex::new(SharedState {
        sumint: make_local(),
        loops_folded: 0usize,
        frob_history: Vec::new(),
    });
    let next_loop = AtomicUsize::new(0);
    let convergence_counter = AtomicUsize::new(0);
    let convergence_noted = AtomicBool::new(false);
    let loops_executed = AtomicUsize::new(0);
    let loops_skipped = AtomicUsize::new(0);

    let tot_pairs = AtomicU64::new(0);
    let tot_triples = AtomicU64::new(0);
    let tot_quads = AtomicU64::new(0);
    let cell_attempt2 = AtomicU64::new(0);
    let cell_attempt3 = AtomicU64::new(0);
    let cell_attempt4 = AtomicU64::new(0);
    let used_cell2 = AtomicU64::new(0);
    let used_cell3 = AtomicU64::new(0);
    let used_cell4 = AtomicU64::new(0);

    if par.verbose {
        eprintln!("Init time: {:.3} s", init.elapsed().as_secs_f64());
        println!("# 1st grid filled cells: {}", grid1.nf);
        println!("# All 1st grid points in use: {}", grid1.np);
        println!("# Max points in one cell of grid 1: {}", grid1.maxnp);
        println!(
            "# Starting integral computation {} of {} on {} threads.",
            iter_no, tot_iter, par.nthread
        );
    }

    let total_timer = Instant::now();

    pool.broadcast(|ctx| {
        let thread = ctx.index();
        let mut rng = Pcg64::seed_from_u64(process_seed.wrapping_mul(thread as u64 + 1));
        let mut locint = make_local();
        let mut scratch = Scratch::new(grid1.maxnp, locint.kernel_width());
        let mut id_buf: Vec<usize> = Vec::with_capacity(grid1.maxnp);

        loop {
            let n_loop = next_loop.fetch_add(1, Ordering::Relaxed);
            if n_loop >= par.max_loops {
                break;
            }
            if convergence_counter.load(Ordering::Relaxed) >= CONVERGENCE_RUNS {
                if !convergence_noted.swap(true, Ordering::Relaxed) {
                    println!("1% convergence reached in C4 {CONVERGENCE_RUNS} times, skipping remaining loops.");
                }
                loops_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut counts = LocalCounts::default();
            let (mut loc_pairs, mut loc_triples, mut loc_quads) = (0u64, 0u64, 0u64);
            let mut percent_counter = 0.0_f64;

            for n1 in 0..grid1.nf {
                if par.verbose && (n1 as f64 / grid1.nf as f64 * 100.0) >= percent_counter {
                    println!(
                        "Integral {} of {}, loop {} of {} on thread {}: cell {} of {} - {:.0}% complete",
                        iter_no,
                        tot_iter,
                        n_loop + 1,
                        par.max_loops,
                        thread,
                        n1 + 1,
                        grid1.nf,
                        percent_counter
                    );
                    percent_counter += 5.0;
                }

                let prim_id1 = grid1.filled[n1];
                let prim_id3 = grid1.cell_id_from_1d(prim_id1);
                let (prim_list, range) = grid1.cell_particles(prim_id1);
                let pln = prim_list.len();
                if pln == 0 {
                    continue;
                }
                id_buf.clear();
                id_buf.extend(range);

                loc_pairs += (pln * par.n2) as u64;
                loc_triples += (pln * par.n2 * par.n3) as u64;
                loc_quads += (pln * par.n2 * par.n3 * par.n4) as u64;

                for _n2 in 0..par.n2 {
                    counts.attempt2 += 1;

                    // j cell drawn around i with the 1/r² proposal.
                    let (delta2, p2_draw) = grids.rd13.random_cubedraw(&mut rng);
                    let sec_id = offset(prim_id3, delta2);
                    let Some(draw_j) = grids.grid2.draw_particle(sec_id, &mut rng) else {
                        continue;
                    };
                    counts.used2 += 1;

                    // Partitioned marginals, then the overall pair
                    // probability for a uniform in‑cell particle choice.
                    let p21 = p2_draw
                        / (grid1.np1.max(1) as f64 * draw_j.np1.max(1) as f64);
                    let p22 = p2_draw
                        / (grid1.np2.max(1) as f64 * draw_j.np2.max(1) as f64);
                    let p2 = p2_draw / (grid1.np as f64 * draw_j.np as f64);
                    let probs = PairProbs { p2, p21, p22 };

                    locint.second(
                        prim_list,
                        &id_buf,
                        &draw_j.particle,
                        draw_j.pid,
                        probs,
                        &mut scratch,
                    );

                    for _n3 in 0..par.n3 {
                        counts.attempt3 += 1;

                        // k cell drawn around i weighted by ξ₁₃.
                        let (delta3, p3_draw) = grids.rd13.random_xidraw(&mut rng);
                        let thi_id = offset(prim_id3, delta3);
                        let Some(draw_k) = grids.grid3.draw_particle(thi_id, &mut rng)
                        else {
                            continue;
                        };
                        if draw_k.pid == draw_j.pid {
                            continue;
                        }
                        counts.used3 += 1;

                        let p3 = p3_draw * p2 / draw_k.np as f64;
                        locint.third(
                            prim_list,
                            &id_buf,
                            &draw_j.particle,
                            &draw_k.particle,
                            draw_j.pid,
                            draw_k.pid,
                            p3,
                            &mut scratch,
                        );

                        for _n4 in 0..par.n4 {
                            counts.attempt4 += 1;

                            // l cell drawn around j weighted by ξ₂₄.
                            let (delta4, p4_draw) = grids.rd24.random_xidraw(&mut rng);
                            let four_id = offset(sec_id, delta4);
                            let Some(draw_l) = grids.grid4.draw_particle(four_id, &mut rng)
                            else {
                                continue;
                            };
                            if draw_l.pid == draw_j.pid || draw_l.pid == draw_k.pid {
                                continue;
                            }
                            counts.used4 += 1;

                            let p4 = p4_draw * p3 / draw_l.np as f64;
                            locint.fourth(
                                prim_list,
                                &id_buf,
                                &draw_j.particle,
                                &draw_k.particle,
                                &draw_l.particle,
                                draw_j.pid,
                                draw_k.pid,
                                draw_l.pid,
                                p4,
                                &mut scratch,
                            );
                        }
                    }
                }
            }

            // Fold this loop into the shared accumulator. Report loops
            // route through the Frobenius fold so nothing double counts.
            {
                let mut shared = global.lock().expect("reduction lock poisoned");
                let report_loop = (n_loop + 1) % par.nthread == 0;
                if report_loop {
                    let folded = shared.loops_folded;
                    let deltas = shared.sumint.frobenius_difference_sum(&locint, folded);
                    if deltas.converged() {
                        convergence_counter.fetch_add(1, Ordering::Relaxed);
                    }
                    if par.verbose {
                        let elapsed = total_timer.elapsed().as_secs();
                        let done = (n_loop + 1).max(1) as u64;
                        let remaining =
                            elapsed * (par.max_loops as u64).saturating_sub(done) / done;
                        eprintln!(
                            "\nFinished integral loop {} of {} after {} s. Estimated time left: {} hms, i.e. {} s.",
                            n_loop + 1,
                            par.max_loops,
                            elapsed,
                            format_hms(remaining),
                            remaining
                        );
                        if n_loop != 0 {
                            eprintln!(
                                "Frobenius difference after loop {} is {:.3} (C2), {:.3} (C3), {:.3} (C4)",
                                n_loop, deltas.c2, deltas.c3, deltas.c4
                            );
                            if let (Some(c2j), Some(c3j), Some(c4j)) =
                                (deltas.c2j, deltas.c3j, deltas.c4j)
                            {
                                eprintln!(
                                    "Frobenius jackknife difference after loop {} is {:.3} (C2j), {:.3} (C3j), {:.3} (C4j)",
                                    n_loop, c2j, c3j, c4j
                                );
                            }
                        }
                    }
                    shared.frob_history.push(deltas);
                } else {
                    shared.sumint.sum_ints(&locint);
                }
                shared.loops_folded += 1;
            }

            // Per‑loop partial output for external aggregation across
            // interrupted runs.
            locint.normalize(
                norms,
                loc_pairs as f64,
                loc_triples as f64,
                loc_quads as f64,
            );
            let tag = n_loop.to_string();
            locint
                .save_integrals(&tag)
                .expect("cannot write per-loop covariance output");
            locint
                .save_jackknife_integrals(&tag)
                .expect("cannot write per-loop jackknife output");
            locint.reset();

            tot_pairs.fetch_add(loc_pairs, Ordering::Relaxed);
            tot_triples.fetch_add(loc_triples, Ordering::Relaxed);
            tot_quads.fetch_add(loc_quads, Ordering::Relaxed);
            cell_attempt2.fetch_add(counts.attempt2, Ordering::Relaxed);
            cell_attempt3.fetch_add(counts.attempt3, Ordering::Relaxed);
            cell_attempt4.fetch_add(counts.attempt4, Ordering::Relaxed);
            used_cell2.fetch_add(counts.used2, Ordering::Relaxed);
            used_cell3.fetch_add(counts.used3, Ordering::Relaxed);
            used_cell4.fetch_add(counts.used4, Ordering::Relaxed);
            loops_executed.fetch_add(1, Ordering::Relaxed);
        }
    });

    let shared = global.into_inner().expect("reduction lock poisoned");
    let mut sumint = shared.sumint;

    let counts = RunCounts {
        tot_pairs: tot_pairs.into_inner(),
        tot_triples: tot_triples.into_inner(),
        tot_quads: tot_quads.into_inner(),
        cell_attempt2: cell_attempt2.into_inner(),
        cell_attempt3: cell_attempt3.into_inner(),
        cell_attempt4: cell_attempt4.into_inner(),
        used_cell2: used_cell2.into_inner(),
        used_cell3: used_cell3.into_inner(),
        used_cell4: used_cell4.into_inner(),
        cnt2: sumint.counts().0,
        cnt3: sumint.counts().1,
        cnt4: sumint.counts().2,
        loops_executed: loops_executed.into_inner(),
        loops_skipped: loops_skipped.into_inner(),
        convergence_counter: convergence_counter.into_inner(),
        frob_history: shared.frob_history,
    };

    sumint.normalize(
        norms,
        counts.tot_pairs as f64,
        counts.tot_triples as f64,
        counts.tot_quads as f64,
    );
    sumint.save_integrals("full").expect("cannot write covariance output");
    sumint
        .save_jackknife_integrals("full")
        .expect("cannot write jackknife output");
    sumint
        .output()
        .write_counts(counts.tot_pairs, counts.tot_triples, counts.tot_quads)
        .expect("cannot write counts sidecar");

    if par.verbose {
        report_run(par, &counts, grid1, total_timer.elapsed().as_secs(), iter_no, tot_iter);
    }

    Ok((sumint, counts))
}

fn report_run(
    par: &Parameters,
    counts: &RunCounts,
    grid1: &Grid,
    runtime: u64,
    iter_no: usize,
    tot_iter: usize,
) {
    let ratio = |num: u64, den: u64| num as f64 / den.max(1) as f64;
    println!("\n\nINTEGRAL {iter_no} OF {tot_iter} COMPLETE");
    eprintln!(
        "\nTotal process time for {:.2e} sets of cells and {:.2e} quads of particles: {} s, i.e. {} hms",
        counts.used_cell4 as f64,
        counts.tot_quads as f64,
        runtime,
        format_hms(runtime)
    );
    println!(
        "We tried {:.2e} pairs, {:.2e} triples and {:.2e} quads of cells.",
        counts.cell_attempt2 as f64, counts.cell_attempt3 as f64, counts.cell_attempt4 as f64
    );
    println!(
        "Of these, we accepted {:.2e} pairs, {:.2e} triples and {:.2e} quads of cells.",
        counts.used_cell2 as f64, counts.used_cell3 as f64, counts.used_cell4 as f64
    );
    println!(
        "We sampled {:.2e} pairs, {:.2e} triples and {:.2e} quads of particles.",
        counts.tot_pairs as f64, counts.tot_triples as f64, counts.tot_quads as f64
    );
    println!(
        "Of these, we have integral contributions from {:.2e} pairs, {:.2e} triples and {:.2e} quads of particles.",
        counts.cnt2 as f64, counts.cnt3 as f64, counts.cnt4 as f64
    );
    println!(
        "Cell acceptance ratios are {:.3} for pairs, {:.3} for triples and {:.3} for quads.",
        ratio(counts.used_cell2, counts.cell_attempt2),
        ratio(counts.used_cell3, counts.cell_attempt3),
        ratio(counts.used_cell4, counts.cell_attempt4)
    );
    println!(
        "Acceptance ratios are {:.3} for pairs, {:.3} for triples and {:.3} for quads.",
        ratio(counts.cnt2, counts.tot_pairs),
        ratio(counts.cnt3, counts.tot_triples),
        ratio(counts.cnt4, counts.tot_quads)
    );
    println!(
        "Average of {:.2} pairs accepted per primary particle.\n",
        ratio(counts.cnt2, grid1.np as u64)
    );
    println!(
        "Trial speed: {:.2e} quads per core per second",
        counts.tot_quads as f64 / (runtime.max(1) as f64 * par.nthread as f64)
    );
    println!(
        "Acceptance speed: {:.2e} quads per core per second",
        counts.cnt4 as f64 / (runtime.max(1) as f64 * par.nthread as f64)
    );
}

fn select_grids<'a>(
    grids: &'a [Grid; 2],
    rds: &'a [RandomDraws; 3],
    combo: (usize, usize, usize, usize),
) -> GridSet<'a> {
    let (i1, i2, i3, i4) = combo;
    GridSet {
        grid1: &grids[i1 - 1],
        grid2: &grids[i2 - 1],
        grid3: &grids[i3 - 1],
        grid4: &grids[i4 - 1],
        rd13: &rds[which_index(i1, i3)],
        rd24: &rds[which_index(i2, i4)],
    }
}

/// Angular (µ‑binned) integral for one tracer combination, with optional
/// jackknife arrays.
pub fn run_angular(
    par: &Parameters,
    grids: &[Grid; 2],
    cfs: &[CorrelationFunction; 3],
    rds: &[RandomDraws; 3],
    jks: Option<&[JackknifeWeights; 3]>,
    combo: (usize, usize, usize, usize),
    iter_no: usize,
    tot_iter: usize,
) -> Result<IntegralResult> {
    let (i1, i2, i3, i4) = combo;
    let set = select_grids(grids, rds, combo);
    let cf12 = &cfs[which_index(i1, i2)];
    let cf13 = &cfs[which_index(i1, i3)];
    let cf24 = &cfs[which_index(i2, i4)];

    let nbins = par.nbin * par.mbin;
    let jack_tables = jks.map(|all_jk| {
        let n_jk = all_jk.iter().map(|jk| jk.n_jk).min().unwrap_or(0);
        for grid in grids {
            assert!(
                grid.p.iter().all(|p| p.jk < n_jk),
                "catalog region id outside the jackknife weight tables"
            );
        }
        let jk12 = &all_jk[which_index(i1, i2)];
        let jk23 = &all_jk[which_index(i2, i3)];
        let jk34 = &all_jk[which_index(i3, i4)];
        // Reuse the stored self‑product table whenever the pair (1,2)
        // equals (3,4) up to ordering; otherwise build the cross table.
        let pw12_34: Cow<'_, [f64]> =
            if (i1 == i3 && i2 == i4) || (i1 == i4 && i2 == i3) {
                Cow::Borrowed(jk12.product_weights.as_slice())
            } else {
                Cow::Owned(jk12.product_with(jk34))
            };
        let pw12_23: Cow<'_, [f64]> = if i1 == i3 {
            Cow::Borrowed(jk12.product_weights.as_slice())
        } else {
            Cow::Owned(jk12.product_with(jk23))
        };
        if par.verbose {
            println!("Computed relevant product weights");
        }
        (jk12, jk23, jk34, pw12_34, pw12_23)
    });

    let make_local = || {
        let jack = jack_tables.as_ref().map(|(jk12, jk23, jk34, pw12_34, pw12_23)| {
            JackknifePiece::new(
                nbins,
                jk12,
                jk23,
                jk34,
                jk12.product_weights.as_slice(),
                pw12_23,
                pw12_34,
            )
        });
        AngularIntegrals::new(par, cf12, cf13, cf24, jack, combo)
    };

    let (sumint, counts) = integral_loop(par, &set, make_local, iter_no, tot_iter)?;
    Ok(IntegralResult {
        c2: sumint.c2().to_vec(),
        c3: sumint.c3().to_vec(),
        c4: sumint.c4().to_vec(),
        c2_jack: sumint.c2_jack().to_vec(),
        c3_jack: sumint.c3_jack().to_vec(),
        c4_jack: sumint.c4_jack().to_vec(),
        c2_regions: sumint.c2_regions().to_vec(),
        n_jk: sumint.n_jk(),
        counts,
    })
}

/// Legendre‑multipole integral for one tracer combination.
pub fn run_legendre(
    par: &Parameters,
    grids: &[Grid; 2],
    cfs: &[CorrelationFunction; 3],
    rds: &[RandomDraws; 3],
    scs: &[SurveyCorrection; 3],
    combo: (usize, usize, usize, usize),
    iter_no: usize,
    tot_iter: usize,
) -> Result<IntegralResult> {
    let (i1, i2, i3, i4) = combo;
    let set = select_grids(grids, rds, combo);
    let cf12 = &cfs[which_index(i1, i2)];
    let cf13 = &cfs[which_index(i1, i3)];
    let cf24 = &cfs[which_index(i2, i4)];
    let sc12 = &scs[which_index(i1, i2)];
    let sc23 = &scs[which_index(i2, i3)];
    let sc34 = &scs[which_index(i3, i4)];

    let make_local =
        || LegendreIntegrals::new(par, cf12, cf13, cf24, sc12, sc23, sc34, combo);
    let (sumint, counts) = integral_loop(par, &set, make_local, iter_no, tot_iter)?;
    Ok(IntegralResult {
        c2: sumint.c2().to_vec(),
        c3: sumint.c3().to_vec(),
        c4: sumint.c4().to_vec(),
        c2_jack: Vec::new(),
        c3_jack: Vec::new(),
        c4_jack: Vec::new(),
        c2_regions: Vec::new(),
        n_jk: 0,
        counts,
    })
}

/// Power‑spectrum (k‑binned) integral for one tracer combination.
pub fn run_power(
    par: &Parameters,
    grids: &[Grid; 2],
    cfs: &[CorrelationFunction; 3],
    rds: &[RandomDraws; 3],
    scs: &[SurveyCorrection; 3],
    combo: (usize, usize, usize, usize),
    iter_no: usize,
    tot_iter: usize,
) -> Result<IntegralResult> {
    let (i1, i2, i3, i4) = combo;
    let set = select_grids(grids, rds, combo);
    let cf12 = &cfs[which_index(i1, i2)];
    let cf13 = &cfs[which_index(i1, i3)];
    let cf24 = &cfs[which_index(i2, i4)];
    let sc12 = &scs[which_index(i1, i2)];
    let sc23 = &scs[which_index(i2, i3)];
    let sc34 = &scs[which_index(i3, i4)];

    let make_local = || PowerIntegrals::new(par, cf12, cf13, cf24, sc12, sc23, sc34, combo);
    let (sumint, counts) = integral_loop(par, &set, make_local, iter_no, tot_iter)?;
    Ok(IntegralResult {
        c2: sumint.c2().to_vec(),
        c3: sumint.c3().to_vec(),
        c4: sumint.c4().to_vec(),
        c2_jack: Vec::new(),
        c3_jack: Vec::new(),
        c4_jack: Vec::new(),
        c2_regions: Vec::new(),
        n_jk: 0,
        counts,
    })
}

/// Run every requested tracer combination through the configured binning
/// variant. Survey corrections feed the multipole variants; jackknife
/// weights feed the angular variant when enabled.
pub fn run_covariance(
    par: &Parameters,
    grids: &[Grid; 2],
    cfs: &[CorrelationFunction; 3],
    rds: &[RandomDraws; 3],
    jks: Option<&[JackknifeWeights; 3]>,
    scs: &[SurveyCorrection; 3],
) -> Result<Vec<IntegralResult>> {
    let combos = tracer_combinations(par.multi_tracers);
    let tot_iter = combos.len();
    let mut results = Vec::with_capacity(tot_iter);
    for (idx, &combo) in combos.iter().enumerate() {
        let iter_no = idx + 1;
        let result = match par.mode {
            BinningMode::Angular { jackknife } => run_angular(
                par,
                grids,
                cfs,
                rds,
                if jackknife { jks } else { None },
                combo,
                iter_no,
                tot_iter,
            )?,
            BinningMode::Legendre => {
                run_legendre(par, grids, cfs, rds, scs, combo, iter_no, tot_iter)?
            }
            BinningMode::Power => {
                run_power(par, grids, cfs, rds, scs, combo, iter_no, tot_iter)?
            }
        };
        results.push(result);
    }
    Ok(results)
}
