//! Kill/revive operators for the compartment lifecycle.
//!
//! During iteration, depleted compartments are killed and, while the revive
//! budget lasts, re-seeded with fresh random conjugate fields. After
//! convergence a mass-neutral copy pass gives every dead compartment a
//! well-defined composition before clustering.

use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Zeroes every live compartment whose relative volume dropped to or below
/// the threshold. Returns how many were killed.
pub(crate) fn kill_depleted(
    js: &mut DVector<f64>,
    phis: &mut DMatrix<f64>,
    live: &mut [bool],
    threshold: f64,
) -> usize {
    let mut killed = 0;
    for m in 0..js.len() {
        if !live[m] {
            continue;
        }
        if js[m] <= threshold {
            js[m] = 0.0;
            for i in 0..phis.nrows() {
                phis[(i, m)] = 0.0;
            }
            live[m] = false;
            killed += 1;
        }
    }
    killed
}

/// Revives dead compartments in ascending index order while the budget
/// lasts, drawing fresh conjugate fields from `Normal(0, std)` and resetting
/// the volume to one. Returns the number of revives.
pub(crate) fn revive_by_random(
    omegas: &mut DMatrix<f64>,
    js: &mut DVector<f64>,
    live: &mut [bool],
    std: f64,
    budget_left: usize,
    rng: &mut StdRng,
) -> usize {
    if budget_left == 0 {
        return 0;
    }
    let normal = Normal::new(0.0, std).expect("revive std is validated non-negative");
    let mut revived = 0;
    for m in 0..js.len() {
        if live[m] {
            continue;
        }
        if revived == budget_left {
            break;
        }
        for i in 0..omegas.nrows() {
            omegas[(i, m)] = normal.sample(rng);
        }
        js[m] = 1.0;
        live[m] = true;
        revived += 1;
    }
    revived
}

/// Gives every dead compartment the composition of a surviving compartment
/// chosen uniformly at random, splitting the survivor's volume with it. The
/// total volume is unchanged and clustering merges the pair again, so the
/// pass is cosmetic. With no survivor it is a no-op.
pub(crate) fn revive_by_copy(
    js: &mut DVector<f64>,
    phis: &mut DMatrix<f64>,
    threshold: f64,
    rng: &mut StdRng,
) -> usize {
    let num_part = js.len();
    let survivors: Vec<usize> = (0..num_part).filter(|&m| js[m] > threshold).collect();
    if survivors.is_empty() {
        return 0;
    }
    let mut revived = 0;
    for m in 0..num_part {
        if js[m] > threshold {
            continue;
        }
        let src = survivors[rng.gen_range(0..survivors.len())];
        js[src] *= 0.5;
        js[m] = js[src];
        for i in 0..phis.nrows() {
            phis[(i, m)] = phis[(i, src)];
        }
        revived += 1;
    }
    revived
}
