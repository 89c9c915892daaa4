//! Construction of local, tentative constraint entries from geometry.
//!
//! The builders only look at slave candidates owned by the local rank and
//! record masters by global index with tentatively assigned owners. Masters
//! living on other ranks are resolved, validated and frozen by the exchange
//! phase; [`build_constraints`] runs the whole
//! pipeline. `build_constraints` is collective: every rank of the
//! communicator must call it, even ranks without any slave candidates.

use crate::comm::Communicator;
use crate::constraint::{Condensation, ConstraintMap, MasterContribution, SlaveEntry};
use crate::error::ConstraintError;
use crate::exchange;
use crate::geometry::{
    AffineRelation, FacetIndex, NearestDofQuery, PointIndex, SurfaceFacet, SurfaceSearch,
};
use crate::Real;
use nalgebra::allocator::Allocator;
use nalgebra::{DefaultAllocator, DimName, OPoint};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifier of a tagged mesh surface, assigned by the external mesh
/// collaborator.
pub type SurfaceTag = u32;

/// The mesh-side data the constraint machinery needs: dof coordinates,
/// ownership, surface tagging and the dofs referenced by local cells.
///
/// Coordinates and ownership must be answerable for any global dof index
/// (implementations typically hold a globally exchanged coordinate table, or
/// at least one covering all boundary dofs plus the local interior).
pub trait DofSource<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    /// Total number of dofs in the global index space.
    fn num_global_dofs(&self) -> usize;

    /// Rank owning the given dof.
    fn owner(&self, dof: usize) -> usize;

    fn coordinate(&self, dof: usize) -> OPoint<T, D>;

    /// Global indices of dofs carrying the given surface tag, in any order.
    fn tagged_dofs(&self, tag: SurfaceTag) -> Vec<usize>;

    /// Facets making up the surface with the given tag.
    fn surface_facets(&self, tag: SurfaceTag) -> Vec<SurfaceFacet>;

    /// Dofs referenced by cells assembled on this rank but owned by another
    /// rank. Their constraint status is resolved during the exchange phase so
    /// that condensation can handle slaves appearing in local cells.
    fn ghost_dofs(&self) -> Vec<usize>;

    /// Dofs eligible as periodic masters. The default considers every dof;
    /// implementations may restrict this to boundary dofs to shrink the
    /// search index.
    fn candidate_master_dofs(&self) -> Vec<usize> {
        (0..self.num_global_dofs()).collect()
    }
}

/// Configuration of a periodic constraint: slave-side dofs are tied 1:1 to
/// the dof found at their image under the affine relation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(bound(
    serialize = "T: Serialize, AffineRelation<T, D>: Serialize",
    deserialize = "T: Deserialize<'de>, AffineRelation<T, D>: Deserialize<'de>"
))]
pub struct PeriodicConfig<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D>,
{
    /// Surface whose dofs are slave candidates.
    pub slave_surface: SurfaceTag,
    /// Maps slave-side coordinates onto master-side coordinates.
    pub relation: AffineRelation<T, D>,
    /// Maximum distance between the mapped coordinate and the master dof.
    pub tolerance: T,
    /// Inhomogeneous jump across the periodicity; zero for plain periodicity.
    pub jump: T,
}

/// Configuration of a contact constraint: each slave-surface dof is
/// interpolated from the nodes of its closest master-surface facet.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContactConfig<T> {
    pub slave_surface: SurfaceTag,
    pub master_surface: SurfaceTag,
    /// Maximum admissible projection distance.
    pub max_gap: T,
    /// Redistribute slave columns as well as rows during assembly (symmetric
    /// condensation). With this off, the constraint equation is kept as the
    /// slave's row and the assembled system is unsymmetric.
    pub symmetrize: bool,
    /// Use the projection gap as the constraint inhomogeneity instead of a
    /// purely kinematic (zero) offset.
    pub gap_inhomogeneity: bool,
}

impl<T: Real> ContactConfig<T> {
    /// Symmetrized, purely kinematic contact coupling.
    pub fn new(slave_surface: SurfaceTag, master_surface: SurfaceTag, max_gap: T) -> Self {
        Self {
            slave_surface,
            master_surface,
            max_gap,
            symmetrize: true,
            gap_inhomogeneity: false,
        }
    }
}

/// The constraint kind and its parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(bound(
    serialize = "T: Serialize, PeriodicConfig<T, D>: Serialize",
    deserialize = "T: Deserialize<'de>, PeriodicConfig<T, D>: Deserialize<'de>"
))]
pub enum ConstraintConfig<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D>,
{
    Periodic(PeriodicConfig<T, D>),
    Contact(ContactConfig<T>),
}

/// Builds the frozen constraint map for this rank: geometric construction of
/// local entries, global resolution of remote masters and referenced slaves,
/// collective validation, freeze.
///
/// Collective over `comm`. On any failure every rank returns an error: the
/// failing ranks report their own cause, clean ranks report
/// [`ConstraintError::PeerAbort`].
pub fn build_constraints<T, D, S, C>(
    config: &ConstraintConfig<T, D>,
    dofs: &S,
    comm: &C,
) -> Result<ConstraintMap<T>, ConstraintError>
where
    T: Real + Serialize + DeserializeOwned,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D> + Allocator<f64, D>,
{
    let local = match config {
        ConstraintConfig::Periodic(periodic) => build_periodic(periodic, dofs, comm),
        ConstraintConfig::Contact(contact) => build_contact(contact, dofs, comm),
    };
    let condensation = match config {
        ConstraintConfig::Periodic(_) => Condensation::Symmetric,
        ConstraintConfig::Contact(contact) => {
            if contact.symmetrize {
                Condensation::Symmetric
            } else {
                Condensation::ConstraintRow
            }
        }
    };
    exchange::resolve_and_freeze(local, condensation, dofs, comm)
}

/// Slave candidates owned by this rank, in ascending global index order so
/// that entry construction is reproducible.
fn owned_candidates<T, D, S, C>(tag: SurfaceTag, dofs: &S, comm: &C) -> Vec<usize>
where
    T: Real,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    DefaultAllocator: Allocator<T, D>,
{
    let mut candidates = dofs.tagged_dofs(tag);
    candidates.sort_unstable();
    candidates.dedup();
    candidates.retain(|&dof| dofs.owner(dof) == comm.rank());
    candidates
}

fn build_periodic<T, D, S, C>(
    config: &PeriodicConfig<T, D>,
    dofs: &S,
    comm: &C,
) -> Result<Vec<SlaveEntry<T>>, ConstraintError>
where
    T: Real,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D> + Allocator<f64, D>,
{
    let index = PointIndex::from_points(
        dofs.candidate_master_dofs()
            .into_iter()
            .map(|dof| (dof, dofs.coordinate(dof))),
    );
    periodic_entries(config, dofs, comm, &index)
}

/// Periodic constraint semantics over any nearest-dof query, so the spatial
/// index can be swapped without touching this logic.
fn periodic_entries<T, D, S, C, Q>(
    config: &PeriodicConfig<T, D>,
    dofs: &S,
    comm: &C,
    index: &Q,
) -> Result<Vec<SlaveEntry<T>>, ConstraintError>
where
    T: Real,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    Q: NearestDofQuery<T, D>,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D>,
{
    let candidates = owned_candidates(config.slave_surface, dofs, comm);
    let mut entries = Vec::with_capacity(candidates.len());
    for slave in candidates {
        let mapped = config.relation.apply(&dofs.coordinate(slave));
        let master = index.nearest(&mapped, config.tolerance).ok_or_else(|| {
            ConstraintError::GeometryMismatch {
                slave,
                detail: format!(
                    "no dof within tolerance {:?} of the mapped slave coordinate",
                    config.tolerance
                ),
            }
        })?;
        if master == slave {
            return Err(ConstraintError::degenerate(format!(
                "dof {slave} maps onto itself under the periodic relation"
            )));
        }
        entries.push(SlaveEntry {
            slave,
            owner: comm.rank(),
            masters: vec![MasterContribution {
                master,
                owner: dofs.owner(master),
                coefficient: T::one(),
            }],
            inhomogeneity: config.jump,
        });
    }
    log::info!(
        "periodic builder: {} slave constraints on rank {}",
        entries.len(),
        comm.rank()
    );
    Ok(entries)
}

fn build_contact<T, D, S, C>(
    config: &ContactConfig<T>,
    dofs: &S,
    comm: &C,
) -> Result<Vec<SlaveEntry<T>>, ConstraintError>
where
    T: Real,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    let facets = dofs.surface_facets(config.master_surface);
    let index = FacetIndex::from_facets(facets, |dof| dofs.coordinate(dof));
    contact_entries(config, dofs, comm, &index)
}

/// Contact constraint semantics over any surface search, so the spatial
/// index can be swapped without touching this logic.
fn contact_entries<T, D, S, C, Q>(
    config: &ContactConfig<T>,
    dofs: &S,
    comm: &C,
    index: &Q,
) -> Result<Vec<SlaveEntry<T>>, ConstraintError>
where
    T: Real,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    Q: SurfaceSearch<T, D>,
    DefaultAllocator: Allocator<T, D>,
{
    let unity_tolerance = T::from_f64(1e-10).expect("literal must fit in T");
    let candidates = owned_candidates(config.slave_surface, dofs, comm);
    let mut entries = Vec::with_capacity(candidates.len());
    for slave in candidates {
        let coordinate = dofs.coordinate(slave);
        let (facet, projection) = index
            .closest_projection(&coordinate, config.max_gap)
            .ok_or_else(|| ConstraintError::GeometryMismatch {
                slave,
                detail: format!(
                    "no facet of surface {} within the maximum gap {:?}",
                    config.master_surface, config.max_gap
                ),
            })?;
        if facet.dofs().contains(&slave) {
            return Err(ConstraintError::degenerate(format!(
                "slave dof {slave} lies on its own master facet"
            )));
        }

        // Partition of unity is a property to validate, not an invariant:
        // non-conforming masters may legitimately violate it.
        let weight_sum = projection
            .weights
            .iter()
            .fold(T::zero(), |sum, &w| sum + w);
        if (weight_sum - T::one()).abs() > unity_tolerance {
            log::warn!(
                "contact weights for slave dof {} sum to {:?} (deviation from partition of unity)",
                slave,
                weight_sum
            );
        }

        let mut masters: Vec<_> = facet
            .dofs()
            .iter()
            .zip(&projection.weights)
            .map(|(&master, &coefficient)| MasterContribution {
                master,
                owner: dofs.owner(master),
                coefficient,
            })
            .collect();
        masters.sort_by_key(|contribution| contribution.master);

        entries.push(SlaveEntry {
            slave,
            owner: comm.rank(),
            masters,
            inhomogeneity: if config.gap_inhomogeneity {
                projection.distance
            } else {
                T::zero()
            },
        });
    }
    log::info!(
        "contact builder: {} slave constraints on rank {}",
        entries.len(),
        comm.rank()
    );
    Ok(entries)
}
