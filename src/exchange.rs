//! Global resolution and validation of tentative constraint entries.
//!
//! After the geometric build, each rank holds entries for its own slaves, but
//! a referenced master may live on another rank, and a cell assembled locally
//! may contain a slave owned elsewhere. This module runs the collective
//! "describe dof" exchange that closes both gaps, performs the global
//! acyclicity/ownership validation, and freezes the result into a
//! [`ConstraintMap`].
//!
//! The exchange is a two-phase commit: tentative local state, count-then-
//! payload exchange, collective validation via an AND-reduction, barrier,
//! freeze. A half-validated map is never observable.

use crate::builder::DofSource;
use crate::comm::{exchange_records, Communicator};
use crate::constraint::{Condensation, ConstraintMap, MasterContribution, SlaveEntry};
use crate::error::ConstraintError;
use crate::Real;
use nalgebra::allocator::Allocator;
use nalgebra::{DefaultAllocator, DimName};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Keeps the first failure; later ones on the same rank add no information
/// since the whole job aborts anyway.
fn record_failure(error: ConstraintError, failure: &mut Option<ConstraintError>) {
    if failure.is_none() {
        *failure = Some(error);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RequestRoles {
    /// The dof is referenced as a master of a local slave; the owner must
    /// confirm it is not itself a slave.
    as_master: bool,
    /// The dof appears in a locally assembled cell; if it is a slave, its
    /// coefficient row is needed for condensation.
    as_cell_dof: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
struct WireMaster<T> {
    master: u64,
    owner: u64,
    coefficient: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
struct WireEntry<T> {
    masters: Vec<WireMaster<T>>,
    inhomogeneity: T,
}

/// Answer of an owning rank to a "describe dof" request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
struct DofReply<T> {
    dof: u64,
    /// Whether the responding rank actually owns the dof. `false` exposes an
    /// ownership disagreement between ranks.
    owned_here: bool,
    /// The dof's coefficient row if it is a slave on its owner.
    entry: Option<WireEntry<T>>,
}

/// Resolves remote masters and referenced slaves, validates globally and
/// freezes the map. Collective; see [`crate::build_constraints`].
///
/// The local build result is passed in unexamined so that a rank whose
/// geometric build failed still participates in every collective call,
/// keeping the ranks in lockstep while the failure is propagated.
pub(crate) fn resolve_and_freeze<T, D, S, C>(
    local: Result<Vec<SlaveEntry<T>>, ConstraintError>,
    condensation: Condensation,
    dofs: &S,
    comm: &C,
) -> Result<ConstraintMap<T>, ConstraintError>
where
    T: Real + Serialize + DeserializeOwned,
    D: DimName,
    S: DofSource<T, D>,
    C: Communicator,
    DefaultAllocator: Allocator<T, D>,
{
    // Gate on the geometric build before exchanging anything: a rank with an
    // incomplete entry list must not answer requests as if it were clean.
    if !comm.all_reduce_and(local.is_ok()) {
        return Err(local.err().unwrap_or(ConstraintError::PeerAbort));
    }
    let mut entries = local.expect("collective gate passed");
    entries.sort_by_key(|entry| entry.slave);

    let rank = comm.rank();
    let mut failure: Option<ConstraintError> = None;

    // Local validation that needs no communication.
    let slave_set: FxHashSet<usize> = entries.iter().map(|entry| entry.slave).collect();
    if slave_set.len() != entries.len() {
        record_failure(
            ConstraintError::degenerate("a dof is the slave of more than one constraint"),
            &mut failure,
        );
    }
    for entry in &entries {
        if entry.masters.is_empty() {
            record_failure(
                ConstraintError::degenerate(format!("slave dof {} has no masters", entry.slave)),
                &mut failure,
            );
        }
        for contribution in &entry.masters {
            if contribution.owner == rank && slave_set.contains(&contribution.master) {
                record_failure(
                    ConstraintError::degenerate(format!(
                        "dof {} is both a master (of slave {}) and a slave",
                        contribution.master, entry.slave
                    )),
                    &mut failure,
                );
            }
        }
    }

    // Deduplicated, sorted request lists per owning rank.
    let mut requests: Vec<BTreeMap<u64, RequestRoles>> = vec![BTreeMap::new(); comm.size()];
    for entry in &entries {
        for contribution in &entry.masters {
            if contribution.owner != rank {
                if contribution.owner >= comm.size() {
                    record_failure(
                        ConstraintError::degenerate(format!(
                            "master dof {} has owner rank {} outside the communicator",
                            contribution.master, contribution.owner
                        )),
                        &mut failure,
                    );
                    continue;
                }
                requests[contribution.owner]
                    .entry(contribution.master as u64)
                    .or_default()
                    .as_master = true;
            }
        }
    }
    for ghost in dofs.ghost_dofs() {
        let owner = dofs.owner(ghost);
        if owner != rank && owner < comm.size() {
            requests[owner].entry(ghost as u64).or_default().as_cell_dof = true;
        }
    }

    let request_indices: Vec<Vec<u64>> = requests
        .iter()
        .map(|per_rank| per_rank.keys().copied().collect())
        .collect();
    log::debug!(
        "rank {}: requesting {} remote dofs during constraint exchange",
        rank,
        request_indices.iter().map(Vec::len).sum::<usize>()
    );
    let incoming = exchange_records(comm, &request_indices)?;

    // Serve incoming requests from the local (owned) entries.
    let entry_by_slave: FxHashMap<usize, &SlaveEntry<T>> =
        entries.iter().map(|entry| (entry.slave, entry)).collect();
    let replies: Vec<Vec<DofReply<T>>> = incoming
        .iter()
        .map(|indices| {
            indices
                .iter()
                .map(|&dof| {
                    let owned_here = dofs.owner(dof as usize) == rank;
                    let entry = owned_here
                        .then(|| entry_by_slave.get(&(dof as usize)))
                        .flatten()
                        .map(|entry| WireEntry {
                            masters: entry
                                .masters
                                .iter()
                                .map(|m| WireMaster {
                                    master: m.master as u64,
                                    owner: m.owner as u64,
                                    coefficient: m.coefficient,
                                })
                                .collect(),
                            inhomogeneity: entry.inhomogeneity,
                        });
                    DofReply { dof, owned_here, entry }
                })
                .collect()
        })
        .collect();
    let answers = exchange_records(comm, &replies)?;

    // Integrate answers: confirm ownership, enforce acyclicity, import the
    // coefficient rows of referenced remote slaves, and fill the ghost
    // master table.
    let mut ghost_master_owners: FxHashMap<usize, usize> = FxHashMap::default();
    for entry in &entries {
        for contribution in &entry.masters {
            if contribution.owner != rank {
                ghost_master_owners.insert(contribution.master, contribution.owner);
            }
        }
    }

    let mut imported: Vec<SlaveEntry<T>> = Vec::new();
    for (owner, per_rank) in requests.iter().enumerate() {
        let answer = &answers[owner];
        if answer.len() != per_rank.len() {
            return Err(ConstraintError::comm_mismatch(
                owner,
                format!("requested {} dofs, received {} replies", per_rank.len(), answer.len()),
            ));
        }
        for ((&requested, roles), reply) in per_rank.iter().zip(answer) {
            if reply.dof != requested {
                return Err(ConstraintError::comm_mismatch(
                    owner,
                    format!("reply for dof {} does not match request for dof {}", reply.dof, requested),
                ));
            }
            let dof = requested as usize;
            if !reply.owned_here {
                record_failure(
                    ConstraintError::degenerate(format!(
                        "rank {owner} disclaims ownership of dof {dof} that this rank attributed to it"
                    )),
                    &mut failure,
                );
                continue;
            }
            if roles.as_master && reply.entry.is_some() {
                record_failure(
                    ConstraintError::degenerate(format!(
                        "dof {dof} is referenced as a master but is a slave on rank {owner}"
                    )),
                    &mut failure,
                );
            }
            if roles.as_cell_dof && !roles.as_master {
                if let Some(wire) = &reply.entry {
                    imported.push(SlaveEntry {
                        slave: dof,
                        owner,
                        masters: wire
                            .masters
                            .iter()
                            .map(|m| MasterContribution {
                                master: m.master as usize,
                                owner: m.owner as usize,
                                coefficient: m.coefficient,
                            })
                            .collect(),
                        inhomogeneity: wire.inhomogeneity,
                    });
                }
            }
        }
    }

    // A locally owned master may also serve a remote slave; the remote rank
    // has requested it above and failed there if it is one of our slaves, so
    // the symmetric direction is already covered.

    let verdict = comm.all_reduce_and(failure.is_none());
    if !verdict {
        return Err(failure.unwrap_or(ConstraintError::PeerAbort));
    }

    let num_imported = imported.len();
    entries.extend(imported);
    entries.sort_by_key(|entry| entry.slave);
    log::info!(
        "rank {}: frozen constraint map with {} owned and {} referenced slaves, {} ghost masters",
        rank,
        entries.len() - num_imported,
        num_imported,
        ghost_master_owners.len()
    );

    // Every rank has committed; no rank may observe the map before this point.
    comm.barrier();
    Ok(ConstraintMap::from_parts(rank, condensation, entries, ghost_master_owners))
}
