//! Multi-point constraints for distributed finite element assembly.
//!
//! A multi-point constraint ties a *slave* dof to a weighted combination of
//! *master* dofs plus a constant offset,
//! `u_s = Σ c_i · u_{m_i} + g`,
//! which covers periodic boundary conditions (1:1 coupling under a geometric
//! relation) and contact/mortar coupling (interpolation from an opposing
//! surface facet). This crate builds the global slave→master mapping across
//! ranks of a distributed computation, rewrites element contributions during
//! assembly so that the global system is reduced to master unknowns only, and
//! recovers slave values after a solve.
//!
//! The pipeline is
//! [`build_constraints`] → frozen [`ConstraintMap`] →
//! [`ConstrainedAssembler`](assembly::global::ConstrainedAssembler) passes →
//! external solve → [`ConstraintMap::back_substitute`].
//!
//! Meshes, dof numbering, form evaluation, sparse storage and solvers are
//! external collaborators reached through the traits in [`builder`],
//! [`assembly`], [`vector`] and [`comm`].

use nalgebra::RealField;

pub mod assembly;
pub mod builder;
pub mod comm;
pub mod constraint;
pub mod error;
pub mod geometry;
pub mod vector;

mod exchange;

pub use builder::{
    build_constraints, ConstraintConfig, ContactConfig, DofSource, PeriodicConfig, SurfaceTag,
};
pub use constraint::{Condensation, ConstraintMap, MasterContribution, SlaveEntry};
pub use error::ConstraintError;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar type for constraint coefficients and assembled values.
///
/// Used as a trait alias for the bounds needed throughout the crate.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}
