//! Collapse redundant compartments into distinct phases.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The distinct coexisting phases located by a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoexistingPhases {
    /// Relative phase volumes in descending order, summing to one.
    pub volumes: Vec<f64>,
    /// One composition row per phase, each summing to one within the
    /// convergence tolerance.
    pub compositions: Vec<Vec<f64>>,
}

impl CoexistingPhases {
    pub fn num_phases(&self) -> usize {
        self.volumes.len()
    }
}

/// Groups compartments whose compositions agree within `threshold` in every
/// component. A compartment joins the first matching cluster in index order,
/// so the pass is order-stable. The representative composition is the
/// volume-weighted mean of the members; phase volumes are the summed member
/// volumes, normalized to one. Phases come out sorted by descending volume,
/// ties broken by lexicographic composition order.
pub(crate) fn cluster_compartments(
    js: &DVector<f64>,
    phis: &DMatrix<f64>,
    threshold: f64,
) -> CoexistingPhases {
    let num_comp = phis.nrows();
    let num_part = phis.ncols();

    let mut volumes: Vec<f64> = Vec::new();
    let mut weighted: Vec<Vec<f64>> = Vec::new();

    for m in 0..num_part {
        if js[m] <= 0.0 {
            continue;
        }
        let matched = (0..volumes.len()).find(|&c| {
            (0..num_comp)
                .all(|i| (weighted[c][i] / volumes[c] - phis[(i, m)]).abs() <= threshold)
        });
        match matched {
            Some(c) => {
                volumes[c] += js[m];
                for i in 0..num_comp {
                    weighted[c][i] += js[m] * phis[(i, m)];
                }
            }
            None => {
                volumes.push(js[m]);
                weighted.push((0..num_comp).map(|i| js[m] * phis[(i, m)]).collect());
            }
        }
    }

    if volumes.is_empty() {
        return CoexistingPhases {
            volumes: Vec::new(),
            compositions: Vec::new(),
        };
    }

    let total: f64 = volumes.iter().sum();
    let mut phases: Vec<(f64, Vec<f64>)> = volumes
        .iter()
        .zip(&weighted)
        .map(|(&volume, sums)| {
            (
                volume / total,
                sums.iter().map(|s| s / volume).collect::<Vec<f64>>(),
            )
        })
        .collect();
    phases.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lexicographic(&a.1, &b.1))
    });

    CoexistingPhases {
        volumes: phases.iter().map(|p| p.0).collect(),
        compositions: phases.into_iter().map(|p| p.1).collect(),
    }
}

fn lexicographic(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.partial_cmp(y) {
            Some(Ordering::Equal) | None => continue,
            Some(order) => return order,
        }
    }
    Ordering::Equal
}
