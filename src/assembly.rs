//! Constraint-aware global assembly.
//!
//! The [`local`] module holds the traits implemented by the external
//! form-evaluation collaborator (per-cell dense element matrices/vectors and
//! dof connectivity). The [`global`] module consumes those together with a
//! frozen [`ConstraintMap`](crate::ConstraintMap) and scatters condensed
//! contributions additively into externally owned matrix/vector targets.

pub mod global;
pub mod local;
