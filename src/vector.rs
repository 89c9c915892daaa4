//! The distributed-vector seam.
//!
//! Assembly and back substitution only need three capabilities from the host
//! application's vector type: read a value by global index (owned or ghosted),
//! write a value by global index, and refresh ghost values from their owners.
//! [`GhostedVector`] captures that contract; [`DistributedVec`] is a reference
//! implementation with contiguous ownership ranges, and plain
//! [`nalgebra::DVector`] implements the trait trivially for single-rank runs.

use crate::assembly::global::VectorTarget;
use crate::comm::{exchange_records, Communicator};
use crate::error::ConstraintError;
use crate::Real;
use nalgebra::DVector;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read/write access to a vector indexed by global dof indices, including
/// ghost entries for dofs owned by other ranks.
pub trait GhostedVector<T> {
    /// The value at `index`, or `None` if the index is neither owned nor
    /// ghosted on this rank.
    fn get(&self, index: usize) -> Option<T>;

    /// Writes the value at `index`.
    ///
    /// # Panics
    /// Panics if `index` is neither owned nor ghosted on this rank.
    fn set(&mut self, index: usize, value: T);

    /// Refreshes every ghost entry from its owning rank. Collective: all
    /// ranks of the underlying communicator must call this together.
    fn update_ghost_values(&mut self) -> Result<(), ConstraintError>;
}

/// On a single rank everything is owned and there is nothing to refresh.
impl<T: Real> GhostedVector<T> for DVector<T> {
    fn get(&self, index: usize) -> Option<T> {
        (index < self.len()).then(|| self[index])
    }

    fn set(&mut self, index: usize, value: T) {
        self[index] = value;
    }

    fn update_ghost_values(&mut self) -> Result<(), ConstraintError> {
        Ok(())
    }
}

/// A distributed vector with contiguous per-rank ownership ranges and
/// explicit ghost slots.
///
/// The ownership layout (`ranges[r]` is the half-open global index range
/// owned by rank `r`) must be identical on every rank. Ghost slots hold
/// values last pulled from their owners by
/// [`update_ghost_values`](GhostedVector::update_ghost_values).
pub struct DistributedVec<T, C> {
    comm: C,
    ranges: Vec<(usize, usize)>,
    owned: Vec<T>,
    // Sorted by global index; `ghost_values` and `ghost_owners` are parallel.
    ghost_dofs: Vec<usize>,
    ghost_owners: Vec<usize>,
    ghost_values: Vec<T>,
    ghost_lookup: FxHashMap<usize, usize>,
}

impl<T, C> DistributedVec<T, C>
where
    T: Real,
    C: Communicator,
{
    /// Creates a zero-initialized vector.
    ///
    /// `ghosts` lists the global indices this rank needs but does not own;
    /// duplicates are merged.
    ///
    /// # Panics
    /// Panics if a ghost index is owned locally or by no rank at all.
    pub fn zeros(comm: C, ranges: Vec<(usize, usize)>, ghosts: impl IntoIterator<Item = usize>) -> Self {
        assert_eq!(ranges.len(), comm.size(), "one ownership range per rank");
        let (start, end) = ranges[comm.rank()];
        let owned = vec![T::zero(); end - start];

        let mut ghost_dofs: Vec<usize> = ghosts.into_iter().collect();
        ghost_dofs.sort_unstable();
        ghost_dofs.dedup();
        let ghost_owners: Vec<usize> = ghost_dofs
            .iter()
            .map(|&dof| {
                let owner = ranges
                    .iter()
                    .position(|&(lo, hi)| lo <= dof && dof < hi)
                    .unwrap_or_else(|| panic!("ghost index {dof} is owned by no rank"));
                assert_ne!(owner, comm.rank(), "ghost index {dof} is owned locally");
                owner
            })
            .collect();
        let ghost_values = vec![T::zero(); ghost_dofs.len()];
        let ghost_lookup = ghost_dofs
            .iter()
            .enumerate()
            .map(|(slot, &dof)| (dof, slot))
            .collect();

        Self {
            comm,
            ranges,
            owned,
            ghost_dofs,
            ghost_owners,
            ghost_values,
            ghost_lookup,
        }
    }

    /// The half-open global index range owned by this rank.
    pub fn local_range(&self) -> (usize, usize) {
        self.ranges[self.comm.rank()]
    }

    pub fn owned_values(&self) -> &[T] {
        &self.owned
    }

    pub fn ghost_dofs(&self) -> &[usize] {
        &self.ghost_dofs
    }

    fn owned_slot(&self, index: usize) -> Option<usize> {
        let (start, end) = self.local_range();
        (start <= index && index < end).then(|| index - start)
    }
}

impl<T, C> GhostedVector<T> for DistributedVec<T, C>
where
    T: Real + Serialize + DeserializeOwned,
    C: Communicator,
{
    fn get(&self, index: usize) -> Option<T> {
        if let Some(slot) = self.owned_slot(index) {
            Some(self.owned[slot])
        } else {
            self.ghost_lookup
                .get(&index)
                .map(|&slot| self.ghost_values[slot])
        }
    }

    fn set(&mut self, index: usize, value: T) {
        if let Some(slot) = self.owned_slot(index) {
            self.owned[slot] = value;
        } else if let Some(&slot) = self.ghost_lookup.get(&index) {
            self.ghost_values[slot] = value;
        } else {
            panic!("index {index} is neither owned nor ghosted on rank {}", self.comm.rank());
        }
    }

    fn update_ghost_values(&mut self) -> Result<(), ConstraintError> {
        // Request phase: ask each owner for the indices ghosted here. Requests
        // per destination follow the sorted ghost order, so replies can be
        // consumed with simple per-rank cursors.
        let mut requests: Vec<Vec<u64>> = vec![Vec::new(); self.comm.size()];
        for (&dof, &owner) in self.ghost_dofs.iter().zip(&self.ghost_owners) {
            requests[owner].push(dof as u64);
        }
        let incoming = exchange_records(&self.comm, &requests)?;

        // Reply phase: serve owned values in request order.
        let mut replies: Vec<Vec<T>> = Vec::with_capacity(incoming.len());
        for (source, indices) in incoming.iter().enumerate() {
            let mut values = Vec::with_capacity(indices.len());
            for &dof in indices {
                let slot = self.owned_slot(dof as usize).ok_or_else(|| {
                    ConstraintError::comm_mismatch(
                        source,
                        format!("rank {source} requested dof {dof}, which this rank does not own"),
                    )
                })?;
                values.push(self.owned[slot]);
            }
            replies.push(values);
        }
        let received = exchange_records(&self.comm, &replies)?;

        let mut cursors = vec![0usize; self.comm.size()];
        for (slot, &owner) in self.ghost_owners.iter().enumerate() {
            let cursor = cursors[owner];
            let values = &received[owner];
            if cursor >= values.len() {
                return Err(ConstraintError::comm_mismatch(
                    owner,
                    format!(
                        "ghost update expected at least {} values from rank {owner}, received {}",
                        cursor + 1,
                        values.len()
                    ),
                ));
            }
            self.ghost_values[slot] = values[cursor];
            cursors[owner] = cursor + 1;
        }
        Ok(())
    }
}

/// Additive insertion accumulates into owned entries and into ghost slots,
/// which the owning rank gathers with its own reduction step if the host
/// application assembles into ghosted vectors.
impl<T, C> VectorTarget<T> for DistributedVec<T, C>
where
    T: Real + Serialize + DeserializeOwned,
    C: Communicator,
{
    fn add(&mut self, index: usize, value: T) {
        if let Some(slot) = self.owned_slot(index) {
            self.owned[slot] += value;
        } else if let Some(&slot) = self.ghost_lookup.get(&index) {
            self.ghost_values[slot] += value;
        } else {
            panic!("index {index} is neither owned nor ghosted on rank {}", self.comm.rank());
        }
    }
}
