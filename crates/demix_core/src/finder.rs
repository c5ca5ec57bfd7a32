//! The coexisting-phases finder.
//!
//! [`CoexistenceFinder`] owns the configuration, the random source, and the
//! compartment fields across runs, so one instance can sweep many interaction
//! matrices or mean compositions of the same system sizes. Each run drives
//! batches of self-consistent steps, checks the convergence criterion in
//! between, and finally collapses the surviving compartments into distinct
//! phases.

use crate::cluster::{cluster_compartments, CoexistingPhases};
use crate::error::{FinderError, FinderResult};
use crate::free_energy::{Entropy, FloryHugginsInteraction, IdealGasEntropy};
use crate::kernel::{Kernel, StepParams, StepReport};
use crate::lifecycle;
use crate::state::CompartmentFields;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Hyperparameters of the self-consistent iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderSettings {
    /// Upper bound on total inner iterations per run.
    pub max_steps: usize,
    /// Residual combination checked at each interval; only `"standard"` is
    /// defined.
    pub convergence_criterion: String,
    /// Threshold applied to all three residuals.
    pub tolerance: f64,
    /// Inner steps between convergence checks.
    pub interval: usize,
    /// Emit progress events between intervals; purely cosmetic.
    pub progress: bool,
    /// Std-dev of the random conjugate-field draws.
    pub random_std: f64,
    /// Fraction of the volume target adopted per step.
    pub acceptance_js: f64,
    /// Fraction of the field target adopted per step.
    pub acceptance_omega: f64,
    /// Cap on the per-step volume change; exceeding it rescales the whole
    /// step, volumes and fields together.
    pub js_step_upper_bound: f64,
    /// Compartments at or below this volume are killed.
    pub kill_threshold: f64,
    /// Multiplier on `random_std` for revive draws.
    pub revive_scaler: f64,
    /// Revive budget per compartment; the run budget is this times `M`.
    pub max_revive_per_compartment: usize,
    /// Constant added to the min-shifted interaction matrix for stability.
    pub additional_chis_shift: f64,
    /// Componentwise distance below which two compartments count as the
    /// same phase.
    pub cluster_threshold: f64,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            convergence_criterion: "standard".to_string(),
            tolerance: 1e-5,
            interval: 10_000,
            progress: true,
            random_std: 5.0,
            acceptance_js: 2e-4,
            acceptance_omega: 2e-3,
            js_step_upper_bound: 1e-3,
            kill_threshold: 0.0,
            revive_scaler: 1.0,
            max_revive_per_compartment: 16,
            additional_chis_shift: 1.0,
            cluster_threshold: 1e-2,
        }
    }
}

/// Per-run overrides of the driver settings; `None` keeps the stored value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunOverrides {
    pub max_steps: Option<usize>,
    pub tolerance: Option<f64>,
    pub interval: Option<usize>,
    pub progress: Option<bool>,
}

/// Snapshot of the last run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Inner steps actually taken.
    pub steps: usize,
    pub max_abs_incomp: f64,
    pub max_abs_omega_diff: f64,
    pub max_abs_js_diff: f64,
    /// Remaining revive budget.
    pub revive_count_left: usize,
    /// Seed of the random source, recorded for reproducibility.
    pub seed: u64,
    /// Final compositions, one row per component.
    pub phis: Vec<Vec<f64>>,
    /// Final relative compartment volumes.
    pub js: Vec<f64>,
}

/// Finds the coexisting phases of a multicomponent Flory-Huggins mixture by
/// evolving conjugate fields and relative volumes across an over-provisioned
/// set of compartments.
pub struct CoexistenceFinder {
    interaction: FloryHugginsInteraction,
    entropy: IdealGasEntropy,
    phi_means: DVector<f64>,
    num_compartments: usize,
    settings: FinderSettings,
    rng: StdRng,
    seed: u64,
    fields: CompartmentFields,
    kernel: Kernel,
    revive_budget: usize,
    diagnostics: Option<Diagnostics>,
}

impl CoexistenceFinder {
    /// Builds a finder for a system of `chis.nrows()` components and
    /// `num_compartments` compartments, validating every input, then seeds
    /// the fields randomly.
    ///
    /// `sizes` defaults to all ones; without an explicit `seed` the random
    /// source is seeded from the wall clock and the value is recorded in the
    /// diagnostics.
    pub fn new(
        chis: DMatrix<f64>,
        phi_means: DVector<f64>,
        num_compartments: usize,
        sizes: Option<DVector<f64>>,
        seed: Option<u64>,
        settings: FinderSettings,
    ) -> FinderResult<Self> {
        let interaction = FloryHugginsInteraction::new(chis)?;
        let num_components = interaction.chis().nrows();
        if num_components < 2 {
            return Err(FinderError::Shape(format!(
                "a mixture needs at least two components, got {num_components}"
            )));
        }
        if num_compartments == 0 {
            return Err(FinderError::Shape(
                "at least one compartment is required".to_string(),
            ));
        }
        check_phi_means(&phi_means, num_components)?;
        let sizes = sizes.unwrap_or_else(|| DVector::from_element(num_components, 1.0));
        check_sizes(&sizes, num_components)?;
        check_settings(&settings)?;

        let seed = seed.unwrap_or_else(clock_seed);
        let mut finder = Self {
            interaction,
            entropy: IdealGasEntropy::new(sizes),
            phi_means,
            num_compartments,
            settings,
            rng: StdRng::seed_from_u64(seed),
            seed,
            fields: CompartmentFields::new(num_components, num_compartments),
            kernel: Kernel::new(num_components, num_compartments),
            revive_budget: 0,
            diagnostics: None,
        };
        finder.reinitialize_random();
        Ok(finder)
    }

    pub fn num_components(&self) -> usize {
        self.phi_means.len()
    }

    pub fn num_compartments(&self) -> usize {
        self.num_compartments
    }

    pub fn chis(&self) -> &DMatrix<f64> {
        self.interaction.chis()
    }

    pub fn phi_means(&self) -> &DVector<f64> {
        &self.phi_means
    }

    pub fn sizes(&self) -> &DVector<f64> {
        self.entropy.sizes()
    }

    pub fn omegas(&self) -> &DMatrix<f64> {
        self.fields.omegas()
    }

    pub fn js(&self) -> &DVector<f64> {
        self.fields.js()
    }

    pub fn phis(&self) -> &DMatrix<f64> {
        self.fields.phis()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn revive_count_left(&self) -> usize {
        self.revive_budget
    }

    /// Diagnostics of the last run, if any.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        self.diagnostics.as_ref()
    }

    /// Replaces the interaction matrix. Resets the revive budget; the
    /// conjugate fields, volumes, and compositions are kept.
    pub fn set_chis(&mut self, chis: DMatrix<f64>) -> FinderResult<()> {
        let n = self.num_components();
        if chis.shape() != (n, n) {
            return Err(FinderError::Shape(format!(
                "chi matrix must be {n}x{n}, got {}x{}",
                chis.nrows(),
                chis.ncols()
            )));
        }
        self.interaction = FloryHugginsInteraction::new(chis)?;
        self.reset_revive_budget();
        Ok(())
    }

    /// Replaces the mean volume fractions. Resets the revive budget; the
    /// conjugate fields, volumes, and compositions are kept.
    pub fn set_phi_means(&mut self, phi_means: DVector<f64>) -> FinderResult<()> {
        check_phi_means(&phi_means, self.num_components())?;
        self.phi_means = phi_means;
        self.reset_revive_budget();
        Ok(())
    }

    /// Replaces the relative molecular sizes. Resets the revive budget; the
    /// conjugate fields, volumes, and compositions are kept.
    pub fn set_sizes(&mut self, sizes: DVector<f64>) -> FinderResult<()> {
        check_sizes(&sizes, self.num_components())?;
        self.entropy = IdealGasEntropy::new(sizes);
        self.reset_revive_budget();
        Ok(())
    }

    /// Draws fresh conjugate fields from `Normal(0, random_std)`, resets
    /// every volume to one and restores the revive budget.
    pub fn reinitialize_random(&mut self) {
        let normal = Normal::new(0.0, self.settings.random_std)
            .expect("random_std is validated non-negative");
        for i in 0..self.fields.num_components() {
            for m in 0..self.fields.num_compartments() {
                self.fields.omegas[(i, m)] = normal.sample(&mut self.rng);
            }
        }
        self.fields.fill_js(1.0);
        self.reset_revive_budget();
    }

    /// Assigns the conjugate fields directly, resets every volume to one and
    /// restores the revive budget.
    pub fn reinitialize_from_omegas(&mut self, omegas: DMatrix<f64>) -> FinderResult<()> {
        self.fields.set_omegas(omegas)?;
        self.fields.fill_js(1.0);
        self.reset_revive_budget();
        Ok(())
    }

    /// Derives conjugate fields that reproduce the given compositions, resets
    /// every volume to one and restores the revive budget. Entries must be
    /// strictly positive.
    pub fn reinitialize_from_phis(&mut self, phis: &DMatrix<f64>) -> FinderResult<()> {
        if phis.shape() != (self.num_components(), self.num_compartments) {
            return Err(FinderError::Shape(format!(
                "compositions must be {}x{}, got {}x{}",
                self.num_components(),
                self.num_compartments,
                phis.nrows(),
                phis.ncols()
            )));
        }
        if phis.iter().any(|&v| v <= 0.0) {
            return Err(FinderError::VolumeFraction(
                "compositions must be strictly positive to derive conjugate fields".to_string(),
            ));
        }
        self.fields.omegas = self.entropy.omegas_from_phis(phis);
        self.fields.fill_js(1.0);
        self.reset_revive_budget();
        Ok(())
    }

    /// Runs the iteration with the stored settings. See [`run_with`].
    ///
    /// [`run_with`]: CoexistenceFinder::run_with
    pub fn run(&mut self) -> FinderResult<CoexistingPhases> {
        self.run_with(RunOverrides::default())
    }

    /// Runs the self-consistent iteration until the convergence criterion is
    /// met or `max_steps` inner steps have been taken, then collapses the
    /// surviving compartments into distinct phases.
    ///
    /// Non-convergence is not an error: the current best clustering is
    /// returned and the unmet residuals are visible in [`diagnostics`].
    ///
    /// [`diagnostics`]: CoexistenceFinder::diagnostics
    pub fn run_with(&mut self, overrides: RunOverrides) -> FinderResult<CoexistingPhases> {
        if self.settings.convergence_criterion != "standard" {
            return Err(FinderError::Config(format!(
                "undefined convergence criterion: {}",
                self.settings.convergence_criterion
            )));
        }
        let max_steps = overrides.max_steps.unwrap_or(self.settings.max_steps);
        let tolerance = overrides.tolerance.unwrap_or(self.settings.tolerance);
        let interval = overrides.interval.unwrap_or(self.settings.interval);
        let progress = overrides.progress.unwrap_or(self.settings.progress);
        if interval == 0 {
            return Err(FinderError::Config("interval must be at least 1".to_string()));
        }

        let shifted = self.interaction.shifted(self.settings.additional_chis_shift);
        let revive_std = self.settings.revive_scaler * self.settings.random_std;

        let steps_outer = max_steps.div_ceil(interval);
        let steps_inner = if steps_outer == 0 {
            0
        } else {
            (max_steps / steps_outer).max(1)
        };

        let mut steps = 0usize;
        let mut last = StepReport::unconverged();

        for outer in 0..steps_outer {
            let params = StepParams {
                phi_means: &self.phi_means,
                sizes: self.entropy.sizes(),
                acceptance_js: self.settings.acceptance_js,
                js_step_upper_bound: self.settings.js_step_upper_bound,
                acceptance_omega: self.settings.acceptance_omega,
                kill_threshold: self.settings.kill_threshold,
                revive_std,
                steps_inner,
                revive_tries: self.revive_budget,
            };
            let report = self.kernel.metastep(
                &shifted,
                &self.entropy,
                &params,
                &mut self.fields,
                &mut self.rng,
            );
            steps += steps_inner;
            self.revive_budget -= report.revive_count;
            last = report;

            if progress {
                debug!(
                    outer,
                    steps,
                    incomp = report.max_abs_incomp,
                    omega_diff = report.max_abs_omega_diff,
                    js_diff = report.max_abs_js_diff,
                    revives_left = self.revive_budget,
                    "interval finished"
                );
            }

            if report.safe
                && report.max_abs_incomp < tolerance
                && report.max_abs_omega_diff < tolerance
                && report.max_abs_js_diff < tolerance
            {
                info!(steps, "compositions and volumes reached a stationary state");
                break;
            }
        }

        // Give every compartment a well-defined composition before
        // clustering; the pass splits survivor volumes, so it moves no mass.
        let mut final_js = self.fields.js.clone();
        let mut final_phis = self.fields.phis.clone();
        lifecycle::revive_by_copy(
            &mut final_js,
            &mut final_phis,
            self.settings.kill_threshold,
            &mut self.rng,
        );

        self.diagnostics = Some(Diagnostics {
            steps,
            max_abs_incomp: last.max_abs_incomp,
            max_abs_omega_diff: last.max_abs_omega_diff,
            max_abs_js_diff: last.max_abs_js_diff,
            revive_count_left: self.revive_budget,
            seed: self.seed,
            phis: matrix_rows(&final_phis),
            js: final_js.iter().copied().collect(),
        });

        Ok(cluster_compartments(
            &final_js,
            &final_phis,
            self.settings.cluster_threshold,
        ))
    }

    fn reset_revive_budget(&mut self) {
        self.revive_budget = self.settings.max_revive_per_compartment * self.num_compartments;
    }
}

/// Finds the coexisting phases of a Flory-Huggins mixture in one call, using
/// the recommended `8 * N_c` compartments.
pub fn find_coexisting_phases(
    chis: DMatrix<f64>,
    phi_means: DVector<f64>,
    sizes: Option<DVector<f64>>,
    seed: Option<u64>,
    settings: FinderSettings,
) -> FinderResult<CoexistingPhases> {
    let num_compartments = chis.nrows() * 8;
    let mut finder =
        CoexistenceFinder::new(chis, phi_means, num_compartments, sizes, seed, settings)?;
    finder.run()
}

fn check_phi_means(phi_means: &DVector<f64>, num_components: usize) -> FinderResult<()> {
    if phi_means.len() != num_components {
        return Err(FinderError::Shape(format!(
            "phi_means must have length {num_components}, got {}",
            phi_means.len()
        )));
    }
    if phi_means.iter().any(|&v| v < 0.0) {
        return Err(FinderError::VolumeFraction(
            "mean volume fractions must be non-negative".to_string(),
        ));
    }
    let total: f64 = phi_means.iter().sum();
    if (total - 1.0).abs() > 1e-12 {
        warn!(
            total,
            "mean volume fractions do not sum to one; the iteration may never converge"
        );
    }
    Ok(())
}

fn check_sizes(sizes: &DVector<f64>, num_components: usize) -> FinderResult<()> {
    if sizes.len() != num_components {
        return Err(FinderError::Shape(format!(
            "sizes must have length {num_components}, got {}",
            sizes.len()
        )));
    }
    if sizes.iter().any(|&v| v <= 0.0) {
        warn!("non-positive molecular sizes detected; the iteration will probably fail");
    }
    Ok(())
}

fn check_settings(settings: &FinderSettings) -> FinderResult<()> {
    if settings.interval == 0 {
        return Err(FinderError::Config("interval must be at least 1".to_string()));
    }
    if settings.tolerance <= 0.0 {
        return Err(FinderError::Config("tolerance must be positive".to_string()));
    }
    // NaN-safe: the revive pass feeds these straight into a Normal draw.
    if !(settings.random_std >= 0.0) {
        return Err(FinderError::Config(
            "random_std must be non-negative".to_string(),
        ));
    }
    if !(settings.revive_scaler >= 0.0) {
        return Err(FinderError::Config(
            "revive_scaler must be non-negative".to_string(),
        ));
    }
    if settings.kill_threshold < 0.0 {
        return Err(FinderError::Config(
            "kill_threshold must be non-negative".to_string(),
        ));
    }
    if settings.js_step_upper_bound <= 0.0 {
        return Err(FinderError::Config(
            "Js_step_upper_bound must be positive".to_string(),
        ));
    }
    if settings.cluster_threshold <= 0.0 {
        return Err(FinderError::Config(
            "cluster_threshold must be positive".to_string(),
        ));
    }
    Ok(())
}

fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn matrix_rows(matrix: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..matrix.nrows())
        .map(|i| (0..matrix.ncols()).map(|m| matrix[(i, m)]).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn quiet() -> FinderSettings {
        FinderSettings {
            progress: false,
            ..FinderSettings::default()
        }
    }

    fn binary_chis(chi: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[0.0, chi, chi, 0.0])
    }

    fn half_half() -> DVector<f64> {
        DVector::from_row_slice(&[0.5, 0.5])
    }

    fn weighted_mean(phases: &CoexistingPhases, component: usize) -> f64 {
        phases
            .volumes
            .iter()
            .zip(&phases.compositions)
            .map(|(v, comp)| v * comp[component])
            .sum()
    }

    #[test]
    fn construction_seeds_fields_and_budget() {
        let finder = CoexistenceFinder::new(
            binary_chis(1.0),
            half_half(),
            6,
            None,
            Some(11),
            quiet(),
        )
        .unwrap();
        assert_eq!(finder.num_components(), 2);
        assert_eq!(finder.num_compartments(), 6);
        assert!(finder.js().iter().all(|&j| j == 1.0));
        assert!(finder.omegas().iter().any(|&w| w != 0.0));
        assert_eq!(finder.revive_count_left(), 16 * 6);
        assert!(finder.diagnostics().is_none());
        assert_eq!(finder.seed(), 11);
    }

    #[test]
    fn rejects_invalid_construction_inputs() {
        let nonsquare = DMatrix::from_row_slice(3, 2, &[0.0; 6]);
        let result =
            CoexistenceFinder::new(nonsquare, half_half(), 4, None, Some(0), quiet());
        assert!(matches!(result, Err(FinderError::Shape(_))));

        let result = CoexistenceFinder::new(
            DMatrix::from_element(1, 1, 0.0),
            DVector::from_element(1, 1.0),
            4,
            None,
            Some(0),
            quiet(),
        );
        assert!(matches!(result, Err(FinderError::Shape(_))));

        let result = CoexistenceFinder::new(
            binary_chis(1.0),
            DVector::from_row_slice(&[0.5, 0.3, 0.2]),
            4,
            None,
            Some(0),
            quiet(),
        );
        assert!(matches!(result, Err(FinderError::Shape(_))));

        let result = CoexistenceFinder::new(
            binary_chis(1.0),
            DVector::from_row_slice(&[-0.1, 1.1]),
            4,
            None,
            Some(0),
            quiet(),
        );
        assert!(matches!(result, Err(FinderError::VolumeFraction(_))));

        let result =
            CoexistenceFinder::new(binary_chis(1.0), half_half(), 0, None, Some(0), quiet());
        assert!(matches!(result, Err(FinderError::Shape(_))));

        let result = CoexistenceFinder::new(
            binary_chis(1.0),
            half_half(),
            4,
            Some(DVector::from_element(3, 1.0)),
            Some(0),
            quiet(),
        );
        assert!(matches!(result, Err(FinderError::Shape(_))));
    }

    #[test]
    fn rejects_unknown_convergence_criterion() {
        let mut settings = quiet();
        settings.convergence_criterion = "strict".to_string();
        let mut finder =
            CoexistenceFinder::new(binary_chis(1.0), half_half(), 4, None, Some(0), settings)
                .unwrap();
        assert!(matches!(finder.run(), Err(FinderError::Config(_))));
    }

    #[test]
    fn rejects_zero_interval_override() {
        let mut finder =
            CoexistenceFinder::new(binary_chis(1.0), half_half(), 4, None, Some(0), quiet())
                .unwrap();
        let result = finder.run_with(RunOverrides {
            interval: Some(0),
            ..RunOverrides::default()
        });
        assert!(matches!(result, Err(FinderError::Config(_))));
    }

    #[test]
    fn uniform_mixture_stays_single_phase() {
        let mut finder = CoexistenceFinder::new(
            binary_chis(0.0),
            half_half(),
            4,
            None,
            Some(1),
            quiet(),
        )
        .unwrap();
        let phases = finder
            .run_with(RunOverrides {
                tolerance: Some(1e-6),
                ..RunOverrides::default()
            })
            .unwrap();

        assert_eq!(phases.num_phases(), 1);
        assert_relative_eq!(phases.volumes[0], 1.0, max_relative = 1e-10);
        assert_abs_diff_eq!(phases.compositions[0][0], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(phases.compositions[0][1], 0.5, epsilon = 1e-3);

        let diag = finder.diagnostics().unwrap();
        assert!(diag.max_abs_incomp < 1e-6);
        assert!(diag.steps > 0);
    }

    #[test]
    fn symmetric_binary_mixture_demixes_into_mirror_phases() {
        let mut finder =
            CoexistenceFinder::new(binary_chis(3.0), half_half(), 8, None, Some(0), quiet())
                .unwrap();
        let phases = finder.run().unwrap();

        assert_eq!(phases.num_phases(), 2);
        let total: f64 = phases.volumes.iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(phases.volumes[0], 0.5, epsilon = 0.02);
        assert_abs_diff_eq!(phases.volumes[1], 0.5, epsilon = 0.02);

        for comp in &phases.compositions {
            let row: f64 = comp.iter().sum();
            assert_abs_diff_eq!(row, 1.0, epsilon = 1e-3);
            assert!(comp.iter().all(|&phi| phi >= 0.0));
        }
        // The binodal of a symmetric binary mixture at chi = 3.
        let rich = phases.compositions[0][0].max(phases.compositions[1][0]);
        let poor = phases.compositions[0][0].min(phases.compositions[1][0]);
        assert_abs_diff_eq!(rich, 0.9293, epsilon = 0.02);
        assert_abs_diff_eq!(poor, 0.0707, epsilon = 0.02);
        // Mirror images around one half.
        assert_abs_diff_eq!(rich + poor, 1.0, epsilon = 0.02);
    }

    #[test]
    fn off_center_mean_conserves_mass_and_follows_the_lever_rule() {
        let mut finder = CoexistenceFinder::new(
            binary_chis(3.0),
            DVector::from_row_slice(&[0.3, 0.7]),
            8,
            None,
            Some(0),
            quiet(),
        )
        .unwrap();
        let phases = finder.run().unwrap();

        assert_eq!(phases.num_phases(), 2);
        assert_abs_diff_eq!(weighted_mean(&phases, 0), 0.3, epsilon = 1e-4);
        assert_abs_diff_eq!(weighted_mean(&phases, 1), 0.7, epsilon = 1e-4);
        // Lever rule for the chi = 3 binodal with a 0.3 mean.
        assert_abs_diff_eq!(phases.volumes[0], 0.733, epsilon = 0.02);
        assert_abs_diff_eq!(phases.volumes[1], 0.267, epsilon = 0.02);
    }

    #[test]
    fn ternary_mixture_segregates_while_the_solvent_spreads_evenly() {
        let mut chis = DMatrix::zeros(3, 3);
        chis[(0, 1)] = 4.0;
        chis[(1, 0)] = 4.0;
        let mut finder = CoexistenceFinder::new(
            chis,
            DVector::from_row_slice(&[0.3, 0.3, 0.4]),
            12,
            None,
            Some(0),
            quiet(),
        )
        .unwrap();
        let phases = finder.run().unwrap();

        assert_eq!(phases.num_phases(), 2);
        // The inert solvent takes a similar share of both phases.
        assert_abs_diff_eq!(
            phases.compositions[0][2],
            phases.compositions[1][2],
            epsilon = 0.05
        );
        // Components 0 and 1 segregate.
        let spread = (phases.compositions[0][0] - phases.compositions[1][0]).abs();
        assert!(spread > 0.3, "expected segregation, spread was {spread}");
        assert_abs_diff_eq!(weighted_mean(&phases, 0), 0.3, epsilon = 1e-4);
        assert_abs_diff_eq!(weighted_mean(&phases, 2), 0.4, epsilon = 1e-4);
    }

    #[test]
    fn exhausted_revive_budget_keeps_dead_compartments_dead() {
        let mut settings = quiet();
        settings.max_revive_per_compartment = 0;
        let mut finder =
            CoexistenceFinder::new(binary_chis(3.0), half_half(), 8, None, Some(0), settings)
                .unwrap();
        assert_eq!(finder.revive_count_left(), 0);
        finder
            .run_with(RunOverrides {
                max_steps: Some(20_000),
                ..RunOverrides::default()
            })
            .unwrap();
        assert_eq!(finder.diagnostics().unwrap().revive_count_left, 0);
    }

    #[test]
    fn over_provisioned_compartments_collapse_to_two_phases() {
        let mut finder =
            CoexistenceFinder::new(binary_chis(3.0), half_half(), 64, None, Some(0), quiet())
                .unwrap();
        let phases = finder.run().unwrap();
        assert!(phases.num_phases() <= 2);
        let total: f64 = phases.volumes.iter().sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn equal_seeds_give_bitwise_identical_runs() {
        let run = || {
            let mut finder = CoexistenceFinder::new(
                binary_chis(3.0),
                half_half(),
                8,
                None,
                Some(7),
                quiet(),
            )
            .unwrap();
            let phases = finder
                .run_with(RunOverrides {
                    max_steps: Some(50_000),
                    ..RunOverrides::default()
                })
                .unwrap();
            let diag = finder.diagnostics().unwrap().clone();
            (phases, diag)
        };
        let (phases_a, diag_a) = run();
        let (phases_b, diag_b) = run();

        assert_eq!(phases_a.volumes, phases_b.volumes);
        assert_eq!(phases_a.compositions, phases_b.compositions);
        assert_eq!(diag_a.steps, diag_b.steps);
        assert_eq!(diag_a.js, diag_b.js);
        assert_eq!(diag_a.phis, diag_b.phis);
        assert_eq!(diag_a.max_abs_incomp, diag_b.max_abs_incomp);
    }

    #[test]
    fn setters_preserve_fields_and_reset_the_budget() {
        let mut settings = quiet();
        // Everything sits below this threshold, so the whole budget drains.
        settings.kill_threshold = 2.0;
        settings.max_revive_per_compartment = 2;
        let mut finder =
            CoexistenceFinder::new(binary_chis(3.0), half_half(), 8, None, Some(0), settings)
                .unwrap();
        assert_eq!(finder.revive_count_left(), 16);

        let phases = finder
            .run_with(RunOverrides {
                max_steps: Some(500),
                interval: Some(100),
                ..RunOverrides::default()
            })
            .unwrap();
        assert_eq!(finder.revive_count_left(), 0);
        // With every compartment dead there is nothing to report.
        assert_eq!(phases.num_phases(), 0);

        let omegas_before = finder.omegas().clone();
        let js_before = finder.js().clone();
        finder.set_chis(binary_chis(1.0)).unwrap();
        assert_eq!(finder.omegas(), &omegas_before);
        assert_eq!(finder.js(), &js_before);
        assert_eq!(finder.revive_count_left(), 16);

        finder.set_phi_means(DVector::from_row_slice(&[0.4, 0.6])).unwrap();
        assert_eq!(finder.omegas(), &omegas_before);
        finder.set_sizes(DVector::from_row_slice(&[1.0, 2.0])).unwrap();
        assert_eq!(finder.omegas(), &omegas_before);
    }

    #[test]
    fn setters_reject_mismatched_shapes() {
        let mut finder =
            CoexistenceFinder::new(binary_chis(1.0), half_half(), 4, None, Some(0), quiet())
                .unwrap();
        assert!(matches!(
            finder.set_chis(DMatrix::zeros(3, 3)),
            Err(FinderError::Shape(_))
        ));
        assert!(matches!(
            finder.set_phi_means(DVector::zeros(3)),
            Err(FinderError::Shape(_))
        ));
        assert!(matches!(
            finder.set_sizes(DVector::from_element(3, 1.0)),
            Err(FinderError::Shape(_))
        ));
        assert!(matches!(
            finder.reinitialize_from_omegas(DMatrix::zeros(2, 5)),
            Err(FinderError::Shape(_))
        ));
    }

    #[test]
    fn reseeding_from_compositions_round_trips() {
        let phis = DMatrix::from_column_slice(2, 3, &[0.4, 0.6, 0.5, 0.5, 0.2, 0.8]);
        // Means equal to the row means of the target compositions.
        let phi_means = DVector::from_row_slice(&[(0.4 + 0.5 + 0.2) / 3.0, (0.6 + 0.5 + 0.8) / 3.0]);
        let mut finder =
            CoexistenceFinder::new(binary_chis(2.0), phi_means, 3, None, Some(5), quiet())
                .unwrap();
        finder.reinitialize_from_phis(&phis).unwrap();

        finder
            .run_with(RunOverrides {
                max_steps: Some(1),
                interval: Some(1),
                ..RunOverrides::default()
            })
            .unwrap();
        let diag = finder.diagnostics().unwrap();
        for i in 0..2 {
            for m in 0..3 {
                assert_relative_eq!(diag.phis[i][m], phis[(i, m)], max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn reseeding_rejects_non_positive_compositions() {
        let mut finder =
            CoexistenceFinder::new(binary_chis(1.0), half_half(), 3, None, Some(0), quiet())
                .unwrap();
        let mut phis = DMatrix::from_element(2, 3, 0.5);
        phis[(0, 1)] = 0.0;
        assert!(matches!(
            finder.reinitialize_from_phis(&phis),
            Err(FinderError::VolumeFraction(_))
        ));
    }

    #[test]
    fn convenience_function_finds_the_trivial_phase() {
        let phases = find_coexisting_phases(
            binary_chis(0.0),
            half_half(),
            None,
            Some(2),
            quiet(),
        )
        .unwrap();
        assert_eq!(phases.num_phases(), 1);
        assert_abs_diff_eq!(phases.volumes[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(phases.compositions[0][0], 0.5, epsilon = 1e-3);
    }
}
