//! The frozen constraint map: the canonical representation of a multi-point
//! constraint system on one rank.
//!
//! A [`ConstraintMap`] is produced by [`build_constraints`](crate::build_constraints)
//! and is read-only afterwards: the only state that changes post-freeze is the
//! cached *values* of ghosted master dofs, refreshed from the external
//! solution vector after a solve. Any change to the constraint topology
//! (remeshing, new surface tags) requires building a new map; there are no
//! partial updates.

use crate::error::ConstraintError;
use crate::vector::GhostedVector;
use crate::Real;
use nalgebra::Scalar;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// How slave dofs are folded into the assembled global system. Recorded at
/// build time and applied uniformly by every assembly pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Condensation {
    /// Slave rows *and* columns are redistributed onto masters; a trivial
    /// diagonal keeps the full-size system square. Preserves symmetry and
    /// positive definiteness of the reduced operator.
    Symmetric,
    /// Slave rows are redistributed, columns are kept, and each slave row is
    /// replaced by its constraint equation `u_s - Σ c_i u_m = g`. The
    /// assembled system is unsymmetric but solves for slave values directly.
    ConstraintRow,
}

/// One master's share of a slave's constraint relation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MasterContribution<T> {
    /// Global index of the master dof.
    pub master: usize,
    /// Rank that owns the master dof.
    pub owner: usize,
    /// Weight of the master in the slave's relation.
    pub coefficient: T,
}

/// A single constraint `u_slave = Σ coefficient_i · u_master_i + inhomogeneity`.
///
/// Master contributions are sorted by master global index so that coefficient
/// accumulation order, and therefore floating point rounding, is identical
/// across rebuilds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SlaveEntry<T> {
    /// Global index of the eliminated dof.
    pub slave: usize,
    /// Rank that owns the slave dof.
    pub owner: usize,
    pub masters: Vec<MasterContribution<T>>,
    pub inhomogeneity: T,
}

impl<T: Real> SlaveEntry<T> {
    /// Sum of the master coefficients. Equal to one (within tolerance) for
    /// contact constraints built from nodal shape functions on a conforming
    /// facet; see the partition-of-unity validation in the contact builder.
    pub fn coefficient_sum(&self) -> T {
        self.masters
            .iter()
            .fold(T::zero(), |sum, m| sum + m.coefficient)
    }
}

#[derive(Debug, Clone)]
struct GhostMaster<T> {
    owner: usize,
    value: Option<T>,
}

/// Frozen slave → masters mapping for the slaves owned or referenced on this
/// rank, plus the ghost cache for masters owned elsewhere.
#[derive(Debug, Clone)]
pub struct ConstraintMap<T: Scalar> {
    rank: usize,
    condensation: Condensation,
    // Sorted by slave global index.
    entries: Vec<SlaveEntry<T>>,
    slave_lookup: FxHashMap<usize, usize>,
    ghost_masters: FxHashMap<usize, GhostMaster<T>>,
}

impl<T: Scalar> ConstraintMap<T> {
    /// Assembles the frozen map. Callers (the exchange phase) must pass
    /// entries sorted by slave index and a ghost table covering every master
    /// owned by another rank.
    pub(crate) fn from_parts(
        rank: usize,
        condensation: Condensation,
        entries: Vec<SlaveEntry<T>>,
        ghost_master_owners: FxHashMap<usize, usize>,
    ) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].slave < w[1].slave));
        let slave_lookup = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.slave, position))
            .collect();
        let ghost_masters = ghost_master_owners
            .into_iter()
            .map(|(master, owner)| (master, GhostMaster { owner, value: None }))
            .collect();
        Self {
            rank,
            condensation,
            entries,
            slave_lookup,
            ghost_masters,
        }
    }

    /// The rank this map was built on.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn condensation(&self) -> Condensation {
        self.condensation
    }

    pub fn is_slave(&self, dof: usize) -> bool {
        self.slave_lookup.contains_key(&dof)
    }

    /// Position of the slave's entry in [`entries`](Self::entries), used by
    /// the assembler to avoid repeated lookups.
    pub(crate) fn slave_position(&self, dof: usize) -> Option<usize> {
        self.slave_lookup.get(&dof).copied()
    }

    /// The constraint relation for `dof`.
    pub fn masters_of(&self, dof: usize) -> Result<&SlaveEntry<T>, ConstraintError> {
        self.slave_lookup
            .get(&dof)
            .map(|&position| &self.entries[position])
            .ok_or(ConstraintError::UnknownSlave { dof })
    }

    /// All entries known on this rank (owned and referenced), sorted by slave
    /// global index.
    pub fn entries(&self) -> &[SlaveEntry<T>] {
        &self.entries
    }

    /// Entries for slaves owned by this rank.
    pub fn owned_entries(&self) -> impl Iterator<Item = &SlaveEntry<T>> {
        let rank = self.rank;
        self.entries.iter().filter(move |entry| entry.owner == rank)
    }

    pub fn num_slaves(&self) -> usize {
        self.entries.len()
    }

    pub fn slave_dofs(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|entry| entry.slave)
    }

    /// Owner rank of a ghosted master, if `master` is ghosted here.
    pub fn ghost_master_owner(&self, master: usize) -> Option<usize> {
        self.ghost_masters.get(&master).map(|ghost| ghost.owner)
    }

    /// Global indices of masters ghosted on this rank, in ascending order.
    pub fn ghost_master_dofs(&self) -> Vec<usize> {
        let mut dofs: Vec<_> = self.ghost_masters.keys().copied().collect();
        dofs.sort_unstable();
        dofs
    }
}

impl<T: Real> ConstraintMap<T> {
    /// The cached value of a ghosted master dof.
    ///
    /// Valid only after [`update_ghost_master_values`](Self::update_ghost_master_values)
    /// has run since the last change to master values.
    pub fn ghost_master_value(&self, master: usize) -> Result<T, ConstraintError> {
        self.ghost_masters
            .get(&master)
            .and_then(|ghost| ghost.value)
            .ok_or(ConstraintError::MissingGhost { master })
    }

    /// Refreshes the ghost cache from `u`, which must itself hold current
    /// ghost values (i.e. run the vector's own ghost update first).
    pub fn update_ghost_master_values(
        &mut self,
        u: &impl GhostedVector<T>,
    ) -> Result<(), ConstraintError> {
        for (&master, ghost) in self.ghost_masters.iter_mut() {
            let value = u.get(master).ok_or(ConstraintError::MissingGhost { master })?;
            ghost.value = Some(value);
        }
        log::debug!(
            "refreshed {} ghost master values on rank {}",
            self.ghost_masters.len(),
            self.rank
        );
        Ok(())
    }

    /// Recovers slave values from solved master values:
    /// `u[s] = Σ c_i · u[m_i] + g` for every locally owned slave.
    ///
    /// Masters owned by this rank are read from `u`; remote masters come from
    /// the ghost cache, so the sequence is: solve, ghost-update `u`, call
    /// [`update_ghost_master_values`](Self::update_ghost_master_values), then
    /// this. Purely local, no communication.
    pub fn back_substitute(&self, u: &mut impl GhostedVector<T>) -> Result<(), ConstraintError> {
        for entry in self.owned_entries() {
            let mut value = entry.inhomogeneity;
            for contribution in &entry.masters {
                let master_value = if contribution.owner == self.rank {
                    u.get(contribution.master)
                        .ok_or(ConstraintError::MissingGhost {
                            master: contribution.master,
                        })?
                } else {
                    self.ghost_master_value(contribution.master)?
                };
                value += contribution.coefficient * master_value;
            }
            u.set(entry.slave, value);
        }
        Ok(())
    }
}
