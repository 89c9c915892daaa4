//! Traits for the external form-evaluation collaborator.
//!
//! These describe cell-local assembly at dof granularity: a cell knows which
//! global dofs it touches and can evaluate its unconstrained dense element
//! matrix and vector. Constraint handling never leaks into these traits; the
//! same element assembler works with or without constraints.

use nalgebra::{DMatrixSliceMut, DVectorSliceMut, Scalar};

/// Dof connectivity of a cell-partitioned domain.
pub trait ElementDofAssembler {
    /// Total number of dofs in the global index space (across all ranks).
    fn num_global_dofs(&self) -> usize;

    /// Number of cells assembled by this rank.
    fn num_elements(&self) -> usize;

    fn element_dof_count(&self, element_index: usize) -> usize;

    /// Writes the global dof indices of the cell into `output`, which must
    /// have length `element_dof_count(element_index)`.
    fn populate_element_dofs(&self, output: &mut [usize], element_index: usize);
}

/// Evaluation of the unconstrained dense element matrix of a cell.
pub trait ElementMatrixAssembler<T: Scalar>: ElementDofAssembler {
    fn assemble_element_matrix_into(
        &self,
        element_index: usize,
        output: DMatrixSliceMut<T>,
    ) -> eyre::Result<()>;
}

/// Evaluation of the unconstrained dense element vector of a cell.
pub trait ElementVectorAssembler<T: Scalar>: ElementDofAssembler {
    fn assemble_element_vector_into(
        &self,
        element_index: usize,
        output: DVectorSliceMut<T>,
    ) -> eyre::Result<()>;
}
