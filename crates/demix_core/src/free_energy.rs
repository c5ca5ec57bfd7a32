//! Flory-Huggins free energy of an incompressible mixture.
//!
//! The iteration kernel only ever needs two capabilities: interaction
//! potentials given compositions, and Boltzmann weights with their partition
//! sums given conjugate fields. Those are the [`Interaction`] and [`Entropy`]
//! traits. The [`FloryHuggins`] bundle additionally exposes the dense
//! algebra (density, jacobian, hessian, local stability) used to inspect
//! candidate compositions outside the hot loop.

use crate::error::{FinderError, FinderResult};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Mean-field interaction energy of a mixture.
pub trait Interaction {
    fn num_components(&self) -> usize;

    /// Writes the per-component interaction potentials `psi[i, m]` for every
    /// live compartment `m`, given compositions `phis` (components by
    /// compartments). Dead columns are left untouched.
    fn potentials(&self, phis: &DMatrix<f64>, live: &[bool], out: &mut DMatrix<f64>);
}

/// Translational entropy of an incompressible mixture.
pub trait Entropy {
    fn num_components(&self) -> usize;

    /// Evaluates the Boltzmann weights `w[i, m] = exp(-nu[i] * omega[i, m])`
    /// for live compartments, and the volume-weighted partition sums
    /// `Q[i] = sum_m J[m] w[i, m] / sum_m J[m]`.
    ///
    /// The exponent is shifted by its per-component maximum over live
    /// compartments before exponentiation, so the weights stay finite for
    /// any conjugate field. The shift cancels in the ratio `w / Q`, which is
    /// the only quantity consumed downstream.
    fn partition(
        &self,
        omegas: &DMatrix<f64>,
        js: &DVector<f64>,
        live: &[bool],
        factors: &mut DMatrix<f64>,
        qs: &mut DVector<f64>,
    );

    /// Conjugate fields reproducing the given compositions:
    /// `omega[i, m] = -ln(phi[i, m]) / nu[i]`. Entries must be positive;
    /// the caller validates.
    fn omegas_from_phis(&self, phis: &DMatrix<f64>) -> DMatrix<f64>;
}

/// Pairwise Flory-Huggins interaction matrix.
#[derive(Debug, Clone)]
pub struct FloryHugginsInteraction {
    chis: DMatrix<f64>,
}

impl FloryHugginsInteraction {
    /// Builds the interaction from a square chi matrix. Symmetry is the
    /// caller's obligation and is not checked.
    pub fn new(chis: DMatrix<f64>) -> FinderResult<Self> {
        if !chis.is_square() {
            return Err(FinderError::Shape(format!(
                "chi matrix must be square, got {}x{}",
                chis.nrows(),
                chis.ncols()
            )));
        }
        Ok(Self { chis })
    }

    pub fn chis(&self) -> &DMatrix<f64> {
        &self.chis
    }

    /// Working copy `chi' = chi - min(chi) + extra_shift` used inside the
    /// kernel. A uniform shift only moves the incompressibility multiplier
    /// at the fixed point, so the located compositions are unchanged.
    pub fn shifted(&self, extra_shift: f64) -> Self {
        let min = self.chis.min();
        Self {
            chis: self.chis.map(|v| v - min + extra_shift),
        }
    }
}

impl Interaction for FloryHugginsInteraction {
    fn num_components(&self) -> usize {
        self.chis.nrows()
    }

    fn potentials(&self, phis: &DMatrix<f64>, live: &[bool], out: &mut DMatrix<f64>) {
        let num_comp = self.chis.nrows();
        for m in 0..phis.ncols() {
            if !live[m] {
                continue;
            }
            for i in 0..num_comp {
                let mut sum = 0.0;
                for j in 0..num_comp {
                    sum += self.chis[(i, j)] * phis[(j, m)];
                }
                out[(i, m)] = sum;
            }
        }
    }
}

/// Ideal-gas translational entropy with relative molecular sizes.
#[derive(Debug, Clone)]
pub struct IdealGasEntropy {
    sizes: DVector<f64>,
}

impl IdealGasEntropy {
    pub fn new(sizes: DVector<f64>) -> Self {
        Self { sizes }
    }

    pub fn sizes(&self) -> &DVector<f64> {
        &self.sizes
    }
}

impl Entropy for IdealGasEntropy {
    fn num_components(&self) -> usize {
        self.sizes.len()
    }

    fn partition(
        &self,
        omegas: &DMatrix<f64>,
        js: &DVector<f64>,
        live: &[bool],
        factors: &mut DMatrix<f64>,
        qs: &mut DVector<f64>,
    ) {
        let num_comp = self.sizes.len();
        let num_part = omegas.ncols();

        let mut total_js = 0.0;
        for m in 0..num_part {
            if live[m] {
                total_js += js[m];
            }
        }

        for i in 0..num_comp {
            // Shift so the largest live exponent is exactly zero.
            let mut max_exponent = f64::NEG_INFINITY;
            for m in 0..num_part {
                if live[m] {
                    max_exponent = max_exponent.max(-self.sizes[i] * omegas[(i, m)]);
                }
            }
            if !max_exponent.is_finite() {
                qs[i] = 0.0;
                continue;
            }
            let mut q = 0.0;
            for m in 0..num_part {
                if !live[m] {
                    continue;
                }
                let w = (-self.sizes[i] * omegas[(i, m)] - max_exponent).exp();
                factors[(i, m)] = w;
                q += js[m] * w;
            }
            qs[i] = q / total_js;
        }
    }

    fn omegas_from_phis(&self, phis: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(phis.nrows(), phis.ncols(), |i, m| {
            -phis[(i, m)].ln() / self.sizes[i]
        })
    }
}

/// Full Flory-Huggins free energy, combining interaction and entropy.
#[derive(Debug, Clone)]
pub struct FloryHuggins {
    interaction: FloryHugginsInteraction,
    entropy: IdealGasEntropy,
}

impl FloryHuggins {
    pub fn new(chis: DMatrix<f64>, sizes: DVector<f64>) -> FinderResult<Self> {
        let interaction = FloryHugginsInteraction::new(chis)?;
        if interaction.num_components() != sizes.len() {
            return Err(FinderError::Shape(format!(
                "chi matrix implies {} components but {} sizes were given",
                interaction.num_components(),
                sizes.len()
            )));
        }
        Ok(Self {
            interaction,
            entropy: IdealGasEntropy::new(sizes),
        })
    }

    pub fn num_components(&self) -> usize {
        self.interaction.num_components()
    }

    pub fn interaction(&self) -> &FloryHugginsInteraction {
        &self.interaction
    }

    pub fn entropy(&self) -> &IdealGasEntropy {
        &self.entropy
    }

    /// Validates one composition vector: correct length, all entries
    /// positive. Fractions above one are tolerated.
    pub fn check_volume_fractions(&self, phis: &DVector<f64>) -> FinderResult<()> {
        if phis.len() != self.num_components() {
            return Err(FinderError::Shape(format!(
                "composition must have length {}, got {}",
                self.num_components(),
                phis.len()
            )));
        }
        if phis.iter().any(|&v| v <= 0.0) {
            return Err(FinderError::VolumeFraction(
                "composition entries must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `f(phi) = sum_i phi_i ln(phi_i) / nu_i + 1/2 sum_ij chi_ij phi_i phi_j`
    pub fn free_energy_density(&self, phis: &DVector<f64>) -> FinderResult<f64> {
        self.check_volume_fractions(phis)?;
        let n = self.num_components();
        let mut f = 0.0;
        for i in 0..n {
            f += phis[i] * phis[i].ln() / self.entropy.sizes[i];
            for j in 0..n {
                f += 0.5 * self.interaction.chis[(i, j)] * phis[i] * phis[j];
            }
        }
        Ok(f)
    }

    /// `df/dphi_i = (ln(phi_i) + 1) / nu_i + sum_j chi_ij phi_j`
    pub fn jacobian(&self, phis: &DVector<f64>) -> FinderResult<DVector<f64>> {
        self.check_volume_fractions(phis)?;
        let n = self.num_components();
        let mut out = DVector::zeros(n);
        for i in 0..n {
            let mut value = (phis[i].ln() + 1.0) / self.entropy.sizes[i];
            for j in 0..n {
                value += self.interaction.chis[(i, j)] * phis[j];
            }
            out[i] = value;
        }
        Ok(out)
    }

    /// `d2f/dphi_i dphi_j = delta_ij / (nu_i phi_i) + chi_ij`
    pub fn hessian(&self, phis: &DVector<f64>) -> FinderResult<DMatrix<f64>> {
        self.check_volume_fractions(phis)?;
        let n = self.num_components();
        let mut out = self.interaction.chis.clone();
        for i in 0..n {
            out[(i, i)] += 1.0 / (self.entropy.sizes[i] * phis[i]);
        }
        Ok(out)
    }

    /// Hessian on the conserved simplex, eliminating the dependent component
    /// `index` by the chain rule.
    pub fn conserved_hessian(
        &self,
        phis: &DVector<f64>,
        index: usize,
    ) -> FinderResult<DMatrix<f64>> {
        let n = self.num_components();
        if index >= n {
            return Err(FinderError::Shape(format!(
                "dependent component index {index} is out of range for {n} components"
            )));
        }
        let full = self.hessian(phis)?;
        let keep: Vec<usize> = (0..n).filter(|&i| i != index).collect();
        let mut out = DMatrix::zeros(n - 1, n - 1);
        for (a, &i) in keep.iter().enumerate() {
            for (b, &j) in keep.iter().enumerate() {
                out[(a, b)] =
                    full[(i, j)] - full[(index, j)] - full[(i, index)] + full[(index, index)];
            }
        }
        Ok(out)
    }

    /// Chemical potentials `mu_i = f + df/dphi_i - sum_k phi_k df/dphi_k`.
    pub fn chemical_potentials(&self, phis: &DVector<f64>) -> FinderResult<DVector<f64>> {
        let f = self.free_energy_density(phis)?;
        let jac = self.jacobian(phis)?;
        let traded: f64 = phis.iter().zip(jac.iter()).map(|(p, j)| p * j).sum();
        Ok(jac.map(|j| f + j - traded))
    }

    /// Chemical potentials relative to the solvent component `index`; the
    /// solvent entry is zero by construction.
    pub fn exchange_chemical_potentials(
        &self,
        phis: &DVector<f64>,
        index: usize,
    ) -> FinderResult<DVector<f64>> {
        let n = self.num_components();
        if index >= n {
            return Err(FinderError::Shape(format!(
                "solvent index {index} is out of range for {n} components"
            )));
        }
        let mus = self.chemical_potentials(phis)?;
        let reference = mus[index];
        Ok(mus.map(|mu| mu - reference))
    }

    /// Osmotic pressure of the solvent component `index`.
    pub fn osmotic_pressure(&self, phis: &DVector<f64>, index: usize) -> FinderResult<f64> {
        let n = self.num_components();
        if index >= n {
            return Err(FinderError::Shape(format!(
                "solvent index {index} is out of range for {n} components"
            )));
        }
        let mus = self.chemical_potentials(phis)?;
        Ok(-mus[index] / self.entropy.sizes[index])
    }

    /// Number of negative eigenvalues of the (conserved) Hessian.
    pub fn num_unstable_modes(&self, phis: &DVector<f64>, conserved: bool) -> FinderResult<usize> {
        let hessian = if conserved {
            self.conserved_hessian(phis, 0)?
        } else {
            self.hessian(phis)?
        };
        let eigen = SymmetricEigen::new(hessian);
        Ok(eigen.eigenvalues.iter().filter(|&&v| v < 0.0).count())
    }

    /// Whether the mixture is locally stable at the given composition.
    pub fn is_stable(&self, phis: &DVector<f64>, conserved: bool) -> FinderResult<bool> {
        Ok(self.num_unstable_modes(phis, conserved)? == 0)
    }
}
