//! The self-consistent iteration step.
//!
//! One step recomputes compositions from the conjugate fields, measures the
//! incompressibility residual, relaxes the fields toward their targets under
//! a joint step-size cap, and runs the kill/revive pass. The outer driver
//! calls [`Kernel::metastep`] to run a batch of steps between convergence
//! checks.

use crate::free_energy::{Entropy, Interaction};
use crate::lifecycle;
use crate::state::CompartmentFields;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;

/// Residuals and bookkeeping of a batch: the last step's residuals, the
/// batch's total revive count, and whether the last step was safe (neither
/// rescaled nor reviving).
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepReport {
    pub max_abs_incomp: f64,
    pub max_abs_omega_diff: f64,
    pub max_abs_js_diff: f64,
    pub revive_count: usize,
    pub safe: bool,
}

impl StepReport {
    pub fn unconverged() -> Self {
        Self {
            max_abs_incomp: f64::INFINITY,
            max_abs_omega_diff: f64::INFINITY,
            max_abs_js_diff: f64::INFINITY,
            revive_count: 0,
            safe: false,
        }
    }
}

/// Knobs of a single batch, borrowed from the finder.
pub(crate) struct StepParams<'a> {
    pub phi_means: &'a DVector<f64>,
    pub sizes: &'a DVector<f64>,
    pub acceptance_js: f64,
    pub js_step_upper_bound: f64,
    pub acceptance_omega: f64,
    pub kill_threshold: f64,
    pub revive_std: f64,
    pub steps_inner: usize,
    pub revive_tries: usize,
}

/// The iteration kernel. Scratch arrays are sized once at construction and
/// reused for every step.
pub(crate) struct Kernel {
    factors: DMatrix<f64>,
    psis: DMatrix<f64>,
    qs: DVector<f64>,
    incomp: DVector<f64>,
    live: Vec<bool>,
}

impl Kernel {
    pub fn new(num_components: usize, num_compartments: usize) -> Self {
        Self {
            factors: DMatrix::zeros(num_components, num_compartments),
            psis: DMatrix::zeros(num_components, num_compartments),
            qs: DVector::zeros(num_components),
            incomp: DVector::zeros(num_compartments),
            live: vec![false; num_compartments],
        }
    }

    /// Runs `steps_inner` self-consistent steps, accumulating revives and
    /// carrying the residuals of the last step.
    pub fn metastep<I: Interaction, E: Entropy>(
        &mut self,
        interaction: &I,
        entropy: &E,
        params: &StepParams,
        fields: &mut CompartmentFields,
        rng: &mut StdRng,
    ) -> StepReport {
        let mut report = StepReport::unconverged();
        for _ in 0..params.steps_inner {
            let budget_left = params.revive_tries - report.revive_count;
            let step = self.step_once(interaction, entropy, params, fields, budget_left, rng);
            report.max_abs_incomp = step.max_abs_incomp;
            report.max_abs_omega_diff = step.max_abs_omega_diff;
            report.max_abs_js_diff = step.max_abs_js_diff;
            report.revive_count += step.revive_count;
            report.safe = step.safe;
        }
        report
    }

    fn step_once<I: Interaction, E: Entropy>(
        &mut self,
        interaction: &I,
        entropy: &E,
        params: &StepParams,
        fields: &mut CompartmentFields,
        budget_left: usize,
        rng: &mut StdRng,
    ) -> StepReport {
        let num_comp = fields.num_components();
        let num_part = fields.num_compartments();

        // Build the live mask, canonicalizing dead state on entry: a
        // revived compartment can fall straight back below the threshold and
        // must not carry a stale volume or composition into clustering.
        let mut n_live = 0;
        for m in 0..num_part {
            if fields.js[m] > params.kill_threshold {
                self.live[m] = true;
                n_live += 1;
            } else {
                self.live[m] = false;
                if fields.js[m] != 0.0 {
                    fields.js[m] = 0.0;
                    for i in 0..num_comp {
                        fields.phis[(i, m)] = 0.0;
                    }
                }
            }
        }

        if n_live == 0 {
            // Nothing left to iterate; only the revive pass can act.
            let revived = lifecycle::revive_by_random(
                &mut fields.omegas,
                &mut fields.js,
                &mut self.live,
                params.revive_std,
                budget_left,
                rng,
            );
            return StepReport {
                revive_count: revived,
                ..StepReport::unconverged()
            };
        }

        // Compositions from the conjugate fields. Mass conservation holds by
        // construction; incompressibility is the driven residual.
        entropy.partition(
            &fields.omegas,
            &fields.js,
            &self.live,
            &mut self.factors,
            &mut self.qs,
        );
        let mut max_abs_incomp = 0.0_f64;
        for m in 0..num_part {
            if !self.live[m] {
                continue;
            }
            let mut local = -1.0;
            for i in 0..num_comp {
                let phi = params.phi_means[i] * self.factors[(i, m)] / self.qs[i];
                fields.phis[(i, m)] = phi;
                local += phi;
            }
            self.incomp[m] = local;
            max_abs_incomp = max_abs_incomp.max(local.abs());
        }

        // Interaction potentials, then the multiplier that zeroes the
        // linearized incompressibility residual of the updated field.
        interaction.potentials(&fields.phis, &self.live, &mut self.psis);
        for m in 0..num_part {
            if !self.live[m] {
                continue;
            }
            let mut weight_total = 0.0;
            let mut residual = self.incomp[m];
            for i in 0..num_comp {
                let weight = params.sizes[i] * fields.phis[(i, m)];
                weight_total += weight;
                residual -= weight * (self.psis[(i, m)] - fields.omegas[(i, m)]);
            }
            let multiplier = residual / weight_total;
            for i in 0..num_comp {
                // psis now holds the target conjugate fields.
                self.psis[(i, m)] += multiplier;
            }
        }

        // Volume deltas and the joint step-size cap. An over-packed
        // compartment grows, a depleted one shrinks; any volume split with
        // vanishing residual is stationary.
        let mut max_abs_js_diff = 0.0_f64;
        for m in 0..num_part {
            if !self.live[m] {
                continue;
            }
            let delta = params.acceptance_js * fields.js[m] * self.incomp[m];
            self.incomp[m] = delta;
            max_abs_js_diff = max_abs_js_diff.max(delta.abs());
        }
        let scale = if max_abs_js_diff > params.js_step_upper_bound {
            params.js_step_upper_bound / max_abs_js_diff
        } else {
            1.0
        };
        let mut safe = scale == 1.0;
        max_abs_js_diff *= scale;

        let mut max_abs_omega_diff = 0.0_f64;
        let mut total_js = 0.0;
        for m in 0..num_part {
            if !self.live[m] {
                continue;
            }
            for i in 0..num_comp {
                let delta = scale
                    * params.acceptance_omega
                    * (self.psis[(i, m)] - fields.omegas[(i, m)]);
                max_abs_omega_diff = max_abs_omega_diff.max(delta.abs());
                fields.omegas[(i, m)] += delta;
            }
            fields.js[m] += scale * self.incomp[m];
            total_js += fields.js[m];
        }

        // Keep live volumes at mean one so the revive volume, the kill
        // threshold, and the absolute step cap all act on one scale. A pure
        // rescaling leaves the compositions and residuals unchanged.
        let norm = n_live as f64 / total_js;
        for m in 0..num_part {
            if self.live[m] {
                fields.js[m] *= norm;
            }
        }

        lifecycle::kill_depleted(
            &mut fields.js,
            &mut fields.phis,
            &mut self.live,
            params.kill_threshold,
        );
        let revived = lifecycle::revive_by_random(
            &mut fields.omegas,
            &mut fields.js,
            &mut self.live,
            params.revive_std,
            budget_left,
            rng,
        );
        if revived > 0 {
            safe = false;
        }

        StepReport {
            max_abs_incomp,
            max_abs_omega_diff,
            max_abs_js_diff,
            revive_count: revived,
            safe,
        }
    }
}
