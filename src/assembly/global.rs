//! The constraint-aware assembly loop.
//!
//! [`ConstrainedAssembler`] wraps the ordinary local-to-global scatter: for
//! every cell it obtains the unconstrained element matrix/vector from the
//! form-evaluation collaborator, then rewrites rows and columns belonging to
//! slave dofs into contributions against their masters before inserting.
//! All insertions are additive, so the assembled system is independent (up to
//! floating point rounding) of cell order and of which rank contributes first.

use crate::assembly::local::{ElementMatrixAssembler, ElementVectorAssembler};
use crate::constraint::{Condensation, ConstraintMap};
use crate::Real;
use itertools::Either;
use nalgebra::{DMatrix, DMatrixSliceMut, DVector, DVectorSliceMut, Scalar};
use nalgebra_sparse::CooMatrix;
use std::cell::RefCell;
use std::iter;
use std::ops::Range;

/// Additive insertion into a (possibly distributed) sparse matrix by global
/// indices. Multiple cells and multiple ranks may contribute to the same
/// entry; implementations must accumulate, never overwrite.
pub trait SparseMatrixTarget<T> {
    fn add(&mut self, row: usize, col: usize, value: T);
}

/// COO storage is inherently additive: duplicate entries are summed when the
/// matrix is converted to CSR/CSC.
impl<T: Scalar> SparseMatrixTarget<T> for CooMatrix<T> {
    fn add(&mut self, row: usize, col: usize, value: T) {
        self.push(row, col, value);
    }
}

/// Additive insertion into a (possibly distributed) vector by global index.
pub trait VectorTarget<T> {
    fn add(&mut self, index: usize, value: T);
}

impl<T: Real> VectorTarget<T> for DVector<T> {
    fn add(&mut self, index: usize, value: T) {
        self[index] += value;
    }
}

/// Assembles element contributions into global matrix/vector targets,
/// condensing slave dofs onto their masters according to a frozen
/// [`ConstraintMap`].
#[derive(Debug)]
pub struct ConstrainedAssembler<T: Scalar> {
    // Reusable buffers so repeated assembly passes do not reallocate.
    workspace: RefCell<AssemblerWorkspace<T>>,
    slave_diagonal: T,
}

#[derive(Debug)]
struct AssemblerWorkspace<T: Scalar> {
    element_dofs: Vec<usize>,
    element_matrix: DMatrix<T>,
    element_vector: DVector<T>,
    // Per local dof: position of its slave entry in the constraint map.
    slave_positions: Vec<Option<usize>>,
}

impl<T: Scalar> Default for AssemblerWorkspace<T> {
    fn default() -> Self {
        Self {
            element_dofs: Vec::new(),
            element_matrix: DMatrix::from_row_slice(0, 0, &[]),
            element_vector: DVector::from_vec(Vec::new()),
            slave_positions: Vec::new(),
        }
    }
}

impl<T: Real> Default for ConstrainedAssembler<T> {
    fn default() -> Self {
        Self {
            workspace: RefCell::new(AssemblerWorkspace::default()),
            slave_diagonal: T::one(),
        }
    }
}

impl<T: Real> ConstrainedAssembler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the diagonal value inserted for each eliminated slave row
    /// under symmetric condensation. The default of one keeps the full-size
    /// system well posed; a penalty-scaled value can improve conditioning
    /// when the surrounding operator has a very different magnitude.
    pub fn with_slave_diagonal(self, slave_diagonal: T) -> Self {
        Self { slave_diagonal, ..self }
    }

    /// Assembles every cell of `element_assembler` and inserts the slave
    /// identity rows. Equivalent to
    /// [`assemble_cells_into`](Self::assemble_cells_into) over the full cell
    /// range followed by [`insert_slave_identity`](Self::insert_slave_identity).
    pub fn assemble_into<M, V, E>(
        &self,
        constraints: &ConstraintMap<T>,
        matrix: &mut M,
        rhs: &mut V,
        element_assembler: &E,
    ) -> eyre::Result<()>
    where
        M: SparseMatrixTarget<T>,
        V: VectorTarget<T>,
        E: ?Sized + ElementMatrixAssembler<T> + ElementVectorAssembler<T>,
    {
        self.assemble_cells_into(
            constraints,
            matrix,
            rhs,
            element_assembler,
            0..element_assembler.num_elements(),
        )?;
        self.insert_slave_identity(constraints, matrix, rhs);
        Ok(())
    }

    /// Assembles the given cell range without inserting slave identity rows,
    /// so a pass may be split over several calls. Call
    /// [`insert_slave_identity`](Self::insert_slave_identity) exactly once
    /// per assembled system afterwards.
    pub fn assemble_cells_into<M, V, E>(
        &self,
        constraints: &ConstraintMap<T>,
        matrix: &mut M,
        rhs: &mut V,
        element_assembler: &E,
        cells: Range<usize>,
    ) -> eyre::Result<()>
    where
        M: SparseMatrixTarget<T>,
        V: VectorTarget<T>,
        E: ?Sized + ElementMatrixAssembler<T> + ElementVectorAssembler<T>,
    {
        let ws = &mut *self.workspace.borrow_mut();
        for cell in cells {
            let n = element_assembler.element_dof_count(cell);
            ws.element_dofs.resize(n, 0);
            element_assembler.populate_element_dofs(&mut ws.element_dofs, cell);

            ws.element_matrix.resize_mut(n, n, T::zero());
            ws.element_matrix.fill(T::zero());
            element_assembler
                .assemble_element_matrix_into(cell, DMatrixSliceMut::from(&mut ws.element_matrix))?;

            ws.element_vector.resize_vertically_mut(n, T::zero());
            ws.element_vector.fill(T::zero());
            element_assembler
                .assemble_element_vector_into(cell, DVectorSliceMut::from(&mut ws.element_vector))?;

            ws.slave_positions.clear();
            ws.slave_positions
                .extend(ws.element_dofs.iter().map(|&dof| constraints.slave_position(dof)));

            match constraints.condensation() {
                Condensation::Symmetric => {
                    // Move inhomogeneous terms to the load vector before the
                    // slave columns are eliminated: b_k -= g_s * A_e[k][s].
                    for l in 0..n {
                        if let Some(position) = ws.slave_positions[l] {
                            let g = constraints.entries()[position].inhomogeneity;
                            if g != T::zero() {
                                for k in 0..n {
                                    let lifted = g * ws.element_matrix[(k, l)];
                                    ws.element_vector[k] -= lifted;
                                }
                            }
                        }
                    }
                    for k in 0..n {
                        for (row, row_coeff) in
                            expand(constraints, ws.slave_positions[k], ws.element_dofs[k])
                        {
                            rhs.add(row, row_coeff * ws.element_vector[k]);
                            for l in 0..n {
                                let a_kl = ws.element_matrix[(k, l)];
                                for (col, col_coeff) in
                                    expand(constraints, ws.slave_positions[l], ws.element_dofs[l])
                                {
                                    matrix.add(row, col, row_coeff * col_coeff * a_kl);
                                }
                            }
                        }
                    }
                }
                Condensation::ConstraintRow => {
                    // Rows are redistributed; columns stay, since the slave
                    // unknown remains coupled through its constraint row.
                    for k in 0..n {
                        for (row, row_coeff) in
                            expand(constraints, ws.slave_positions[k], ws.element_dofs[k])
                        {
                            rhs.add(row, row_coeff * ws.element_vector[k]);
                            for l in 0..n {
                                matrix.add(
                                    row,
                                    ws.element_dofs[l],
                                    row_coeff * ws.element_matrix[(k, l)],
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Inserts the per-slave rows that keep the full-size system square:
    /// a trivial diagonal under symmetric condensation, or the constraint
    /// equation `u_s - Σ c_i u_m = g` in constraint-row mode. Only slaves
    /// owned by this rank are inserted, so the rows appear exactly once in
    /// the distributed system.
    pub fn insert_slave_identity<M, V>(
        &self,
        constraints: &ConstraintMap<T>,
        matrix: &mut M,
        rhs: &mut V,
    ) where
        M: SparseMatrixTarget<T>,
        V: VectorTarget<T>,
    {
        for entry in constraints.owned_entries() {
            match constraints.condensation() {
                Condensation::Symmetric => {
                    matrix.add(entry.slave, entry.slave, self.slave_diagonal);
                }
                Condensation::ConstraintRow => {
                    matrix.add(entry.slave, entry.slave, T::one());
                    for contribution in &entry.masters {
                        matrix.add(entry.slave, contribution.master, -contribution.coefficient);
                    }
                    rhs.add(entry.slave, entry.inhomogeneity);
                }
            }
        }
    }

    /// Right-hand-side-only pass: redistributes slave rows of the element
    /// vectors onto masters. Used when the matrix is unchanged and only the
    /// load changes between solves. Inhomogeneity lifting is *not* included;
    /// combine with [`apply_inhomogeneity_lifting`](Self::apply_inhomogeneity_lifting)
    /// for constraints with nonzero inhomogeneity under symmetric
    /// condensation.
    pub fn assemble_vector_into<V, E>(
        &self,
        constraints: &ConstraintMap<T>,
        rhs: &mut V,
        element_assembler: &E,
    ) -> eyre::Result<()>
    where
        V: VectorTarget<T>,
        E: ?Sized + ElementVectorAssembler<T>,
    {
        let ws = &mut *self.workspace.borrow_mut();
        for cell in 0..element_assembler.num_elements() {
            let n = element_assembler.element_dof_count(cell);
            ws.element_dofs.resize(n, 0);
            element_assembler.populate_element_dofs(&mut ws.element_dofs, cell);

            ws.element_vector.resize_vertically_mut(n, T::zero());
            ws.element_vector.fill(T::zero());
            element_assembler
                .assemble_element_vector_into(cell, DVectorSliceMut::from(&mut ws.element_vector))?;

            for k in 0..n {
                let position = constraints.slave_position(ws.element_dofs[k]);
                for (row, row_coeff) in expand(constraints, position, ws.element_dofs[k]) {
                    rhs.add(row, row_coeff * ws.element_vector[k]);
                }
            }
        }
        Ok(())
    }

    /// Vector-only counterpart of the inhomogeneity terms folded into the
    /// load vector by the combined pass: `b_k -= g_s * A_e[k][s]`, with the
    /// row index `k` expanded onto masters like any other row. No-op for
    /// constraint-row condensation, where the inhomogeneity lives in the
    /// slave's constraint row instead.
    pub fn apply_inhomogeneity_lifting<V, E>(
        &self,
        constraints: &ConstraintMap<T>,
        rhs: &mut V,
        element_assembler: &E,
    ) -> eyre::Result<()>
    where
        V: VectorTarget<T>,
        E: ?Sized + ElementMatrixAssembler<T>,
    {
        if constraints.condensation() != Condensation::Symmetric {
            return Ok(());
        }
        let ws = &mut *self.workspace.borrow_mut();
        for cell in 0..element_assembler.num_elements() {
            let n = element_assembler.element_dof_count(cell);
            ws.element_dofs.resize(n, 0);
            element_assembler.populate_element_dofs(&mut ws.element_dofs, cell);

            ws.slave_positions.clear();
            ws.slave_positions
                .extend(ws.element_dofs.iter().map(|&dof| constraints.slave_position(dof)));
            let has_inhomogeneity = ws.slave_positions.iter().any(|&position| {
                position.map_or(false, |p| constraints.entries()[p].inhomogeneity != T::zero())
            });
            if !has_inhomogeneity {
                continue;
            }

            ws.element_matrix.resize_mut(n, n, T::zero());
            ws.element_matrix.fill(T::zero());
            element_assembler
                .assemble_element_matrix_into(cell, DMatrixSliceMut::from(&mut ws.element_matrix))?;

            for l in 0..n {
                if let Some(position) = ws.slave_positions[l] {
                    let g = constraints.entries()[position].inhomogeneity;
                    if g == T::zero() {
                        continue;
                    }
                    for k in 0..n {
                        let lifted = g * ws.element_matrix[(k, l)];
                        for (row, row_coeff) in
                            expand(constraints, ws.slave_positions[k], ws.element_dofs[k])
                        {
                            rhs.add(row, -(row_coeff * lifted));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Expands a local dof into its global row/column contributions: a free dof
/// contributes to itself with weight one, a slave contributes to each of its
/// masters with the constraint coefficient. When both the row and the column
/// of an entry are slaves the expansions compound, producing the
/// `c_i · c_j` master-pair terms.
fn expand<T: Real>(
    constraints: &ConstraintMap<T>,
    slave_position: Option<usize>,
    dof: usize,
) -> impl Iterator<Item = (usize, T)> + '_ {
    match slave_position {
        None => Either::Left(iter::once((dof, T::one()))),
        Some(position) => Either::Right(
            constraints.entries()[position]
                .masters
                .iter()
                .map(|contribution| (contribution.master, contribution.coefficient)),
        ),
    }
}
