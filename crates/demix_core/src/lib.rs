//! The `demix_core` crate locates coexisting equilibrium phases of
//! incompressible multicomponent mixtures described by Flory-Huggins free
//! energy.
//!
//! Key components:
//! - **Free energy**: the `Interaction`/`Entropy` seams consumed by the
//!   kernel, the concrete Flory-Huggins pair, and the dense algebra
//!   (density, jacobian, hessian, local stability).
//! - **Kernel**: the self-consistent step evolving conjugate fields and
//!   compartment volumes under incompressibility.
//! - **Lifecycle**: budgeted kill/revive of depleted compartments.
//! - **Finder**: the `CoexistenceFinder` facade owning configuration,
//!   random source, and field state across runs.
//! - **Clustering**: collapse of redundant compartments into distinct
//!   phases.

pub mod cluster;
pub mod error;
pub mod finder;
pub mod free_energy;
mod kernel;
mod lifecycle;
pub mod state;
