//! Mutable field state of the compartment iteration.

use crate::error::{FinderError, FinderResult};
use nalgebra::{DMatrix, DVector};

/// Conjugate fields, relative volumes, and derived compositions for `M`
/// compartments of an `N_c`-component system.
///
/// The struct owns the shapes; all numerics live in the kernel. Compositions
/// are recomputed from the conjugate fields every step, so reassignment only
/// ever touches the conjugate fields and the volumes.
#[derive(Debug, Clone)]
pub struct CompartmentFields {
    pub(crate) omegas: DMatrix<f64>,
    pub(crate) js: DVector<f64>,
    pub(crate) phis: DMatrix<f64>,
}

impl CompartmentFields {
    pub fn new(num_components: usize, num_compartments: usize) -> Self {
        Self {
            omegas: DMatrix::zeros(num_components, num_compartments),
            js: DVector::zeros(num_compartments),
            phis: DMatrix::zeros(num_components, num_compartments),
        }
    }

    pub fn num_components(&self) -> usize {
        self.omegas.nrows()
    }

    pub fn num_compartments(&self) -> usize {
        self.omegas.ncols()
    }

    pub fn omegas(&self) -> &DMatrix<f64> {
        &self.omegas
    }

    pub fn js(&self) -> &DVector<f64> {
        &self.js
    }

    pub fn phis(&self) -> &DMatrix<f64> {
        &self.phis
    }

    /// Replaces the conjugate fields wholesale; the new field must keep the
    /// (components, compartments) shape.
    pub fn set_omegas(&mut self, omegas: DMatrix<f64>) -> FinderResult<()> {
        if omegas.shape() != self.omegas.shape() {
            return Err(FinderError::Shape(format!(
                "conjugate fields must be {}x{}, got {}x{}",
                self.omegas.nrows(),
                self.omegas.ncols(),
                omegas.nrows(),
                omegas.ncols()
            )));
        }
        self.omegas = omegas;
        Ok(())
    }

    /// Sets every relative volume to the same value.
    pub fn fill_js(&mut self, value: f64) {
        self.js.fill(value);
    }
}
