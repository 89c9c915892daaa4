use crate::unit_tests::MockDofSource;
use gleipnir::comm::SerialComm;
use gleipnir::geometry::{AffineRelation, SurfaceFacet};
use gleipnir::{
    build_constraints, Condensation, ConstraintConfig, ConstraintError, ContactConfig,
    PeriodicConfig,
};
use nalgebra::{Point1, Point3, Vector1};

fn periodic_bar_source() -> MockDofSource<nalgebra::U1> {
    MockDofSource::serial(vec![
        Point1::new(0.0),
        Point1::new(0.5),
        Point1::new(1.0),
    ])
    .with_tag(1, vec![2])
}

fn periodic_config(jump: f64) -> ConstraintConfig<f64, nalgebra::U1> {
    ConstraintConfig::Periodic(PeriodicConfig {
        slave_surface: 1,
        relation: AffineRelation::translation(Vector1::new(-1.0)),
        tolerance: 1e-9,
        jump,
    })
}

#[test]
fn periodic_slave_has_single_unit_master() {
    let dofs = periodic_bar_source();
    let map = build_constraints(&periodic_config(0.0), &dofs, &SerialComm).unwrap();

    assert_eq!(map.num_slaves(), 1);
    assert!(map.is_slave(2));
    let entry = map.masters_of(2).unwrap();
    assert_eq!(entry.masters.len(), 1);
    assert_eq!(entry.masters[0].master, 0);
    assert_eq!(entry.masters[0].owner, 0);
    assert_eq!(entry.masters[0].coefficient, 1.0);
    assert_eq!(entry.inhomogeneity, 0.0);
    assert_eq!(map.condensation(), Condensation::Symmetric);
}

#[test]
fn periodic_jump_becomes_inhomogeneity() {
    let dofs = periodic_bar_source();
    let map = build_constraints(&periodic_config(0.25), &dofs, &SerialComm).unwrap();
    assert_eq!(map.masters_of(2).unwrap().inhomogeneity, 0.25);
}

#[test]
fn periodic_without_match_is_geometry_mismatch() {
    let dofs = periodic_bar_source();
    let config = ConstraintConfig::Periodic(PeriodicConfig {
        slave_surface: 1,
        relation: AffineRelation::translation(Vector1::new(-0.37)),
        tolerance: 1e-9,
        jump: 0.0,
    });
    let error = build_constraints(&config, &dofs, &SerialComm).unwrap_err();
    assert!(matches!(error, ConstraintError::GeometryMismatch { slave: 2, .. }));
}

#[test]
fn periodic_identity_relation_is_degenerate() {
    let dofs = periodic_bar_source();
    let config = ConstraintConfig::Periodic(PeriodicConfig {
        slave_surface: 1,
        relation: AffineRelation::translation(Vector1::new(0.0)),
        tolerance: 1e-9,
        jump: 0.0,
    });
    let error = build_constraints(&config, &dofs, &SerialComm).unwrap_err();
    assert!(matches!(error, ConstraintError::DegenerateConstraint { .. }));
}

/// Two unit squares a gap of 0.01 apart along the normal: the slave dof at
/// the upper square's center interpolates from all four corners of the lower
/// square with bilinear weights.
fn two_squares_source() -> MockDofSource<nalgebra::U3> {
    MockDofSource::serial(vec![
        // Master square at z = 0.
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        // Slave square at z = 0.01, corner dofs plus the center dof.
        Point3::new(0.0, 0.0, 0.01),
        Point3::new(1.0, 0.0, 0.01),
        Point3::new(1.0, 1.0, 0.01),
        Point3::new(0.0, 1.0, 0.01),
        Point3::new(0.5, 0.5, 0.01),
    ])
    .with_tag(2, vec![8])
    .with_facets(3, vec![SurfaceFacet::Quadrilateral([0, 1, 2, 3])])
}

#[test]
fn contact_center_dof_gets_four_bilinear_masters() {
    let dofs = two_squares_source();
    let config = ConstraintConfig::Contact(ContactConfig {
        gap_inhomogeneity: true,
        ..ContactConfig::new(2, 3, 0.05)
    });
    let map = build_constraints(&config, &dofs, &SerialComm).unwrap();

    let entry = map.masters_of(8).unwrap();
    assert_eq!(entry.masters.len(), 4);
    let masters: Vec<_> = entry.masters.iter().map(|m| m.master).collect();
    assert_eq!(masters, vec![0, 1, 2, 3]);
    for contribution in &entry.masters {
        assert!((contribution.coefficient - 0.25).abs() < 1e-12);
    }
    assert!((entry.coefficient_sum() - 1.0).abs() < 1e-10);
    assert!((entry.inhomogeneity - 0.01).abs() < 1e-12);
}

#[test]
fn contact_is_kinematic_by_default() {
    let dofs = two_squares_source();
    let config = ConstraintConfig::Contact(ContactConfig::new(2, 3, 0.05));
    let map = build_constraints(&config, &dofs, &SerialComm).unwrap();
    assert_eq!(map.masters_of(8).unwrap().inhomogeneity, 0.0);
    assert_eq!(map.condensation(), Condensation::Symmetric);
}

#[test]
fn contact_symmetrize_flag_selects_constraint_row_mode() {
    let dofs = two_squares_source();
    let config = ConstraintConfig::Contact(ContactConfig {
        symmetrize: false,
        ..ContactConfig::new(2, 3, 0.05)
    });
    let map = build_constraints(&config, &dofs, &SerialComm).unwrap();
    assert_eq!(map.condensation(), Condensation::ConstraintRow);
}

#[test]
fn contact_beyond_maximum_gap_is_geometry_mismatch() {
    let dofs = two_squares_source();
    let config = ConstraintConfig::Contact(ContactConfig::new(2, 3, 0.005));
    let error = build_constraints(&config, &dofs, &SerialComm).unwrap_err();
    assert!(matches!(error, ConstraintError::GeometryMismatch { slave: 8, .. }));
}

#[test]
fn contact_triangle_masters_carry_barycentric_weights() {
    let dofs = MockDofSource::serial(vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.25, 0.25, 0.02),
    ])
    .with_tag(2, vec![3])
    .with_facets(3, vec![SurfaceFacet::Triangle([0, 1, 2])]);
    let config = ConstraintConfig::Contact(ContactConfig::new(2, 3, 0.1));
    let map = build_constraints(&config, &dofs, &SerialComm).unwrap();

    let entry = map.masters_of(3).unwrap();
    let coefficients: Vec<_> = entry.masters.iter().map(|m| m.coefficient).collect();
    assert!((coefficients[0] - 0.5).abs() < 1e-12);
    assert!((coefficients[1] - 0.25).abs() < 1e-12);
    assert!((coefficients[2] - 0.25).abs() < 1e-12);
    assert!((entry.coefficient_sum() - 1.0).abs() < 1e-10);
}

#[test]
fn rebuilds_are_bit_identical() {
    let dofs = two_squares_source();
    let config = ConstraintConfig::Contact(ContactConfig {
        gap_inhomogeneity: true,
        ..ContactConfig::new(2, 3, 0.05)
    });
    let first = build_constraints(&config, &dofs, &SerialComm).unwrap();
    let second = build_constraints(&config, &dofs, &SerialComm).unwrap();
    assert_eq!(first.entries(), second.entries());
}
