use crate::unit_tests::MockDofSource;
use gleipnir::comm::{Communicator, LocalComm, SerialComm};
use gleipnir::geometry::AffineRelation;
use gleipnir::{build_constraints, ConstraintConfig, ConstraintError, PeriodicConfig};
use nalgebra::{Point1, Vector1, U1};
use std::thread;

fn translation_config(shift: f64, tolerance: f64) -> ConstraintConfig<f64, U1> {
    ConstraintConfig::Periodic(PeriodicConfig {
        slave_surface: 1,
        relation: AffineRelation::translation(Vector1::new(shift)),
        tolerance,
        jump: 0.0,
    })
}

#[test]
fn unknown_slave_query_is_an_error() {
    let dofs = MockDofSource::serial(vec![Point1::new(0.0), Point1::new(1.0)]).with_tag(1, vec![1]);
    let map = build_constraints(&translation_config(-1.0, 1e-9), &dofs, &SerialComm).unwrap();
    assert!(map.masters_of(1).is_ok());
    assert_eq!(
        map.masters_of(0).unwrap_err(),
        ConstraintError::UnknownSlave { dof: 0 }
    );
}

#[test]
fn chained_constraints_violate_acyclicity() {
    // Slaves at x = 1 and x = 2 under a shift of -1: dof 1 becomes both the
    // master of dof 2 and a slave of dof 0.
    let dofs = MockDofSource::serial(vec![
        Point1::new(0.0),
        Point1::new(1.0),
        Point1::new(2.0),
    ])
    .with_tag(1, vec![1, 2]);
    let error = build_constraints(&translation_config(-1.0, 1e-9), &dofs, &SerialComm).unwrap_err();
    assert!(matches!(error, ConstraintError::DegenerateConstraint { .. }));
}

/// Master owned by rank 0, slave owned by rank 1. Both ranks tag the slave;
/// only its owner builds the entry, and the exchange fills rank 1's ghost
/// master table.
#[test]
fn remote_master_is_resolved_into_ghost_table() {
    let comms = LocalComm::create(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let dofs = MockDofSource {
                    coordinates: vec![Point1::new(0.0), Point1::new(1.0)],
                    owners: vec![0, 1],
                    tagged: vec![(1, vec![1])],
                    facets: Vec::new(),
                    ghosts: Vec::new(),
                };
                let map =
                    build_constraints(&translation_config(-1.0, 1e-9), &dofs, &comm).unwrap();
                (comm.rank(), map)
            })
        })
        .collect();

    for handle in handles {
        let (rank, map) = handle.join().unwrap();
        match rank {
            0 => {
                // Rank 0 owns no slave and references no ghost dof.
                assert_eq!(map.num_slaves(), 0);
                assert!(!map.is_slave(1));
            }
            1 => {
                assert_eq!(map.num_slaves(), 1);
                let entry = map.masters_of(1).unwrap();
                assert_eq!(entry.owner, 1);
                assert_eq!(entry.masters[0].master, 0);
                assert_eq!(entry.masters[0].owner, 0);
                assert_eq!(entry.masters[0].coefficient, 1.0);
                assert_eq!(map.ghost_master_owner(0), Some(0));
                assert_eq!(map.ghost_master_dofs(), vec![0]);
            }
            _ => unreachable!(),
        }
    }
}

/// A rank that references a remote slave through one of its cells receives
/// the slave's coefficient row during the exchange.
#[test]
fn referenced_remote_slave_is_imported() {
    let comms = LocalComm::create(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.rank();
                let dofs = MockDofSource {
                    coordinates: vec![Point1::new(0.0), Point1::new(1.0)],
                    owners: vec![0, 1],
                    tagged: vec![(1, vec![1])],
                    facets: Vec::new(),
                    // Rank 0 assembles a cell containing the remote dof 1.
                    ghosts: if rank == 0 { vec![1] } else { Vec::new() },
                };
                let map =
                    build_constraints(&translation_config(-1.0, 1e-9), &dofs, &comm).unwrap();
                (rank, map)
            })
        })
        .collect();

    for handle in handles {
        let (rank, map) = handle.join().unwrap();
        if rank == 0 {
            // The referenced slave is known but not owned here.
            assert!(map.is_slave(1));
            let entry = map.masters_of(1).unwrap();
            assert_eq!(entry.owner, 1);
            assert_eq!(entry.masters[0].master, 0);
            assert_eq!(entry.masters[0].coefficient, 1.0);
            assert_eq!(map.owned_entries().count(), 0);
        }
    }
}

/// A geometry failure on one rank aborts the whole job: the failing rank
/// reports the mismatch, the clean rank reports the peer abort.
#[test]
fn failure_on_one_rank_aborts_all_ranks() {
    let comms = LocalComm::create(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let dofs = MockDofSource {
                    coordinates: vec![Point1::new(0.0), Point1::new(1.0)],
                    owners: vec![0, 1],
                    tagged: vec![(1, vec![1])],
                    facets: Vec::new(),
                    ghosts: Vec::new(),
                };
                // The shifted image of the slave matches no dof anywhere.
                let result =
                    build_constraints(&translation_config(-0.37, 1e-9), &dofs, &comm);
                (comm.rank(), result.unwrap_err())
            })
        })
        .collect();

    for handle in handles {
        let (rank, error) = handle.join().unwrap();
        match rank {
            0 => assert_eq!(error, ConstraintError::PeerAbort),
            1 => assert!(matches!(error, ConstraintError::GeometryMismatch { slave: 1, .. })),
            _ => unreachable!(),
        }
    }
}

/// Ranks disagreeing on ownership is a degenerate constraint system, caught
/// by the owner disclaiming the request.
#[test]
fn ownership_disagreement_is_degenerate() {
    let comms = LocalComm::create(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.rank();
                let dofs = MockDofSource {
                    coordinates: vec![Point1::new(0.0), Point1::new(1.0)],
                    // Rank 1 attributes dof 0 to rank 0, but rank 0 itself
                    // believes dof 0 lives on rank 1.
                    owners: if rank == 0 { vec![1, 1] } else { vec![0, 1] },
                    tagged: vec![(1, vec![1])],
                    facets: Vec::new(),
                    ghosts: Vec::new(),
                };
                let result =
                    build_constraints(&translation_config(-1.0, 1e-9), &dofs, &comm);
                (rank, result.unwrap_err())
            })
        })
        .collect();

    for handle in handles {
        let (rank, error) = handle.join().unwrap();
        match rank {
            0 => assert_eq!(error, ConstraintError::PeerAbort),
            1 => assert!(matches!(error, ConstraintError::DegenerateConstraint { .. })),
            _ => unreachable!(),
        }
    }
}
