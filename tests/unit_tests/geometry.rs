use gleipnir::geometry::{
    project_onto_facet, AffineRelation, FacetIndex, NearestDofQuery, PointIndex, SurfaceFacet,
    SurfaceSearch,
};
use nalgebra::{Point2, Point3, Vector2};
use proptest::prelude::*;

#[test]
fn affine_relation_translation() {
    let relation = AffineRelation::translation(Vector2::new(-1.0, 0.5));
    let mapped = relation.apply(&Point2::new(3.0, 1.0));
    assert_eq!(mapped, Point2::new(2.0, 1.5));
}

#[test]
fn nearest_within_tolerance() {
    let index = PointIndex::from_points(vec![
        (0, Point2::new(0.0, 0.0)),
        (1, Point2::new(1.0, 0.0)),
        (2, Point2::new(2.0, 0.0)),
    ]);
    assert_eq!(index.nearest(&Point2::new(1.05, 0.0), 0.1), Some(1));
    assert_eq!(index.nearest(&Point2::new(1.5, 0.0), 0.1), None);
    assert_eq!(index.nearest(&Point2::new(2.0, 0.0), 1e-12), Some(2));
}

#[test]
fn nearest_breaks_ties_by_lowest_index() {
    // Two dofs at the same coordinate: the lower global index wins.
    let index = PointIndex::from_points(vec![
        (7, Point2::new(1.0, 1.0)),
        (2, Point2::new(1.0, 1.0)),
    ]);
    assert_eq!(index.nearest(&Point2::new(1.0, 1.0), 0.5), Some(2));

    // Equidistant distinct dofs: again the lower index.
    let index = PointIndex::from_points(vec![
        (9, Point2::new(2.0, 0.0)),
        (4, Point2::new(0.0, 0.0)),
    ]);
    assert_eq!(index.nearest(&Point2::new(1.0, 0.0), 1.5), Some(4));
}

#[test]
fn segment_projection_weights_and_clamping() {
    let facet = SurfaceFacet::Segment([0, 1]);
    let vertices: [Point2<f64>; 2] = [Point2::new(0.0, 0.0), Point2::new(2.0, 0.0)];

    let projection = project_onto_facet(&facet, &vertices, &Point2::new(0.5, 1.0));
    assert_eq!(projection.point, Point2::new(0.5, 0.0));
    assert_eq!(projection.weights, vec![0.75, 0.25]);
    assert!((projection.distance - 1.0).abs() < 1e-14);

    // Beyond the first vertex the projection clamps to it.
    let clamped = project_onto_facet(&facet, &vertices, &Point2::new(-1.0, 0.0));
    assert_eq!(clamped.point, Point2::new(0.0, 0.0));
    assert_eq!(clamped.weights, vec![1.0, 0.0]);
    assert!((clamped.distance - 1.0).abs() < 1e-14);
}

#[test]
fn triangle_projection_interior_barycentric() {
    let facet = SurfaceFacet::Triangle([0, 1, 2]);
    let vertices: [Point3<f64>; 3] = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    let projection = project_onto_facet(&facet, &vertices, &Point3::new(0.25, 0.25, 1.0));
    assert!((projection.point - Point3::new(0.25, 0.25, 0.0)).norm() < 1e-14);
    assert!((projection.weights[0] - 0.5).abs() < 1e-14);
    assert!((projection.weights[1] - 0.25).abs() < 1e-14);
    assert!((projection.weights[2] - 0.25).abs() < 1e-14);
    assert!((projection.distance - 1.0).abs() < 1e-14);
}

#[test]
fn triangle_projection_clamps_to_vertex() {
    let facet = SurfaceFacet::Triangle([0, 1, 2]);
    let vertices = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    let projection = project_onto_facet(&facet, &vertices, &Point3::new(2.0, -1.0, 0.0));
    assert_eq!(projection.point, Point3::new(1.0, 0.0, 0.0));
    assert_eq!(projection.weights, vec![0.0, 1.0, 0.0]);
}

#[test]
fn quadrilateral_projection_center() {
    let facet = SurfaceFacet::Quadrilateral([0, 1, 2, 3]);
    let vertices: [Point3<f64>; 4] = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    let projection = project_onto_facet(&facet, &vertices, &Point3::new(0.5, 0.5, 0.3));
    assert!((projection.point - Point3::new(0.5, 0.5, 0.0)).norm() < 1e-12);
    for weight in &projection.weights {
        assert!((weight - 0.25).abs() < 1e-12);
    }
    assert!((projection.distance - 0.3).abs() < 1e-12);
}

#[test]
fn quadrilateral_projection_matches_bilinear_shape_functions() {
    let facet = SurfaceFacet::Quadrilateral([0, 1, 2, 3]);
    let vertices: [Point3<f64>; 4] = [
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
    ];
    let (s, t) = (0.25, 0.75);
    let projection = project_onto_facet(&facet, &vertices, &Point3::new(s, t, 0.1));
    let expected = [
        (1.0 - s) * (1.0 - t),
        s * (1.0 - t),
        s * t,
        (1.0 - s) * t,
    ];
    for (weight, reference) in projection.weights.iter().zip(expected) {
        assert!((weight - reference).abs() < 1e-10);
    }
}

#[test]
fn facet_index_picks_closest_facet_within_gap() {
    let vertices: [Point2<f64>; 4] = [
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 1.0),
    ];
    let index = FacetIndex::from_facets(
        vec![SurfaceFacet::Segment([0, 1]), SurfaceFacet::Segment([2, 3])],
        |dof| vertices[dof],
    );

    let (facet, projection) = index
        .closest_projection(&Point2::new(0.5, 0.1), 0.5)
        .expect("segment at y = 0 is within the gap");
    assert_eq!(facet, &SurfaceFacet::Segment([0, 1]));
    assert!((projection.distance - 0.1).abs() < 1e-14);

    assert!(index.closest_projection(&Point2::new(0.5, 0.4), 0.05).is_none());
}

proptest! {
    // Shape function weights always form a partition of unity, including for
    // points projected onto facet boundaries.
    #[test]
    fn projection_weights_sum_to_one(
        x in -0.5..1.5f64,
        y in -0.5..1.5f64,
        z in -0.5..0.5f64,
    ) {
        let point = Point3::new(x, y, z);
        let quad = SurfaceFacet::Quadrilateral([0, 1, 2, 3]);
        let quad_vertices = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let projection = project_onto_facet(&quad, &quad_vertices, &point);
        let sum: f64 = projection.weights.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-10);

        let triangle = SurfaceFacet::Triangle([0, 1, 2]);
        let projection = project_onto_facet(&triangle, &quad_vertices[..3], &point);
        let sum: f64 = projection.weights.iter().sum();
        prop_assert!((sum - 1.0).abs() < 1e-10);
    }
}
