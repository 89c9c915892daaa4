//! Geometric queries used during constraint construction.
//!
//! Two query flavors are needed: nearest-dof lookup for periodic constraints
//! and closest-point projection onto a set of surface facets for contact
//! constraints. Both are backed by an R*-tree over a coordinate table that has
//! already been exchanged globally, so queries may return dofs that are not
//! locally owned.
//!
//! The concrete structures ([`PointIndex`], [`FacetIndex`]) sit behind the
//! [`NearestDofQuery`] and [`SurfaceSearch`] traits so that an alternative
//! spatial index (uniform grid, k-d tree) can be substituted without touching
//! constraint semantics.
//!
//! # Determinism
//! Candidate sets coming out of the tree are re-ranked by
//! `(distance, global index)` with ties broken by the lowest index, so
//! repeated builds over the same input produce identical constraint maps.

use crate::Real;
use nalgebra::allocator::Allocator;
use nalgebra::{DefaultAllocator, DimName, OMatrix, OPoint, OVector};
use numeric_literals::replace_float_literals;
use ordered_float::OrderedFloat;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;
use serde::{Deserialize, Serialize};

/// An affine geometric relation `x ↦ A x + t` mapping slave-side coordinates
/// onto master-side coordinates, e.g. a translation by one period for
/// periodic boundary conditions.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: Deserialize<'de>"))]
pub struct AffineRelation<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D>,
{
    #[serde(bound(
        serialize = "<DefaultAllocator as Allocator<T, D, D>>::Buffer: Serialize",
        deserialize = "<DefaultAllocator as Allocator<T, D, D>>::Buffer: Deserialize<'de>"
    ))]
    matrix: OMatrix<T, D, D>,
    #[serde(bound(
        serialize = "<DefaultAllocator as Allocator<T, D>>::Buffer: Serialize",
        deserialize = "<DefaultAllocator as Allocator<T, D>>::Buffer: Deserialize<'de>"
    ))]
    translation: OVector<T, D>,
}

impl<T, D> AffineRelation<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<T, D, D>,
{
    pub fn new(matrix: OMatrix<T, D, D>, translation: OVector<T, D>) -> Self {
        Self { matrix, translation }
    }

    /// A pure translation, the common case for periodic boundary conditions.
    pub fn translation(translation: OVector<T, D>) -> Self {
        Self {
            matrix: OMatrix::identity_generic(D::name(), D::name()),
            translation,
        }
    }

    pub fn apply(&self, point: &OPoint<T, D>) -> OPoint<T, D> {
        OPoint::from(&self.matrix * &point.coords + &self.translation)
    }
}

/// Nearest-dof queries over a global coordinate table.
pub trait NearestDofQuery<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    /// Returns the global index of the dof closest to `point` if it lies
    /// within `tolerance`, breaking distance ties by the lowest global index.
    fn nearest(&self, point: &OPoint<T, D>, tolerance: T) -> Option<usize>;
}

/// Closest-point projection onto a tagged surface.
pub trait SurfaceSearch<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    /// Projects `point` onto the closest facet within `max_distance`,
    /// breaking distance ties by the lowest facet index.
    fn closest_projection(
        &self,
        point: &OPoint<T, D>,
        max_distance: T,
    ) -> Option<(&SurfaceFacet, SurfaceProjection<T, D>)>;
}

/// Adapter so that `rstar` can work with `nalgebra` points of arbitrary
/// static dimension. The tree always stores `f64` coordinates; queries with
/// other scalar types are converted on entry.
#[derive(Debug, Clone, PartialEq)]
struct RTreePoint<D>(OPoint<f64, D>)
where
    D: DimName,
    DefaultAllocator: Allocator<f64, D>;

impl<D> rstar::Point for RTreePoint<D>
where
    D: DimName,
    DefaultAllocator: Allocator<f64, D>,
{
    type Scalar = f64;
    const DIMENSIONS: usize = D::USIZE;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        Self(OVector::<f64, D>::from_fn(|i, _| generator(i)).into())
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.0[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.0[index]
    }
}

fn to_f64_point<T, D>(point: &OPoint<T, D>) -> OPoint<f64, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    point.map(|x| x.to_subset().expect("coordinate representable as f64"))
}

/// An R*-tree over dof coordinates supporting tolerance-bounded nearest
/// neighbor queries.
pub struct PointIndex<D>
where
    D: DimName,
    DefaultAllocator: Allocator<f64, D>,
{
    tree: RTree<GeomWithData<RTreePoint<D>, usize>>,
}

impl<D> PointIndex<D>
where
    D: DimName,
    DefaultAllocator: Allocator<f64, D>,
{
    /// Builds the index from `(global dof index, coordinate)` pairs.
    pub fn from_points<T>(points: impl IntoIterator<Item = (usize, OPoint<T, D>)>) -> Self
    where
        T: Real,
        DefaultAllocator: Allocator<T, D>,
    {
        let geometries = points
            .into_iter()
            .map(|(dof, point)| GeomWithData::new(RTreePoint(to_f64_point(&point)), dof))
            .collect();
        Self {
            tree: RTree::bulk_load(geometries),
        }
    }
}

impl<T, D> NearestDofQuery<T, D> for PointIndex<D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    fn nearest(&self, point: &OPoint<T, D>, tolerance: T) -> Option<usize> {
        let query = RTreePoint(to_f64_point(point));
        let tol = tolerance.to_subset().expect("tolerance representable as f64");
        self.tree
            .locate_within_distance(query.clone(), tol * tol)
            .map(|candidate| {
                let d2 = (&candidate.geom().0.coords - &query.0.coords).norm_squared();
                (OrderedFloat(d2), candidate.data)
            })
            .min()
            .map(|(_, dof)| dof)
    }
}

/// A facet of a constraint surface, referencing dofs by global index.
///
/// Vertex order matters: contact coefficients are the facet's nodal shape
/// functions evaluated at the projected point, reported in vertex order.
/// Quadrilateral vertices must be given in a closed loop around the facet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum SurfaceFacet {
    Segment([usize; 2]),
    Triangle([usize; 3]),
    Quadrilateral([usize; 4]),
}

impl SurfaceFacet {
    pub fn dofs(&self) -> &[usize] {
        match self {
            SurfaceFacet::Segment(dofs) => dofs,
            SurfaceFacet::Triangle(dofs) => dofs,
            SurfaceFacet::Quadrilateral(dofs) => dofs,
        }
    }
}

/// Result of projecting a point onto a facet: the closest point, the facet's
/// nodal shape function values there (one weight per facet vertex) and the
/// distance from the query point.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceProjection<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    pub point: OPoint<T, D>,
    pub weights: Vec<T>,
    pub distance: T,
}

/// Projects `point` onto `facet`, whose vertex coordinates are given in the
/// same order as [`SurfaceFacet::dofs`].
///
/// # Panics
/// Panics if `vertices` does not match the facet's vertex count.
pub fn project_onto_facet<T, D>(
    facet: &SurfaceFacet,
    vertices: &[OPoint<T, D>],
    point: &OPoint<T, D>,
) -> SurfaceProjection<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    assert_eq!(
        vertices.len(),
        facet.dofs().len(),
        "one vertex coordinate per facet dof"
    );
    let (closest, weights) = match facet {
        SurfaceFacet::Segment(_) => project_onto_segment(&vertices[0], &vertices[1], point),
        SurfaceFacet::Triangle(_) => {
            project_onto_triangle(&vertices[0], &vertices[1], &vertices[2], point)
        }
        SurfaceFacet::Quadrilateral(_) => project_onto_quadrilateral(
            [&vertices[0], &vertices[1], &vertices[2], &vertices[3]],
            point,
        ),
    };
    let distance = (point - &closest).norm();
    SurfaceProjection {
        point: closest,
        weights,
        distance,
    }
}

#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
fn project_onto_segment<T, D>(
    a: &OPoint<T, D>,
    b: &OPoint<T, D>,
    p: &OPoint<T, D>,
) -> (OPoint<T, D>, Vec<T>)
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    let ab = b - a;
    let len2 = ab.norm_squared();
    let s = if len2 == T::zero() {
        // Degenerate segment, both weights go to the lower vertex side.
        0.0
    } else {
        ((p - a).dot(&ab) / len2).clamp(0.0, 1.0)
    };
    let closest = OPoint::from(&a.coords + &ab * s);
    (closest, vec![1.0 - s, s])
}

/// Closest point on a triangle using only dot products, so the routine works
/// for any geometric dimension. The returned weights are the barycentric
/// coordinates of the closest point, i.e. the linear shape function values.
#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
fn project_onto_triangle<T, D>(
    a: &OPoint<T, D>,
    b: &OPoint<T, D>,
    c: &OPoint<T, D>,
    p: &OPoint<T, D>,
) -> (OPoint<T, D>, Vec<T>)
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    let ab = b - a;
    let ac = c - a;

    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return (a.clone(), vec![1.0, 0.0, 0.0]);
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return (b.clone(), vec![0.0, 1.0, 0.0]);
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        let closest = OPoint::from(&a.coords + &ab * v);
        return (closest, vec![1.0 - v, v, 0.0]);
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return (c.clone(), vec![0.0, 0.0, 1.0]);
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        let closest = OPoint::from(&a.coords + &ac * w);
        return (closest, vec![1.0 - w, 0.0, w]);
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        let closest = OPoint::from(&b.coords + (c - b) * w);
        return (closest, vec![0.0, 1.0 - w, w]);
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    let closest = OPoint::from(&a.coords + &ab * v + &ac * w);
    (closest, vec![1.0 - v - w, v, w])
}

/// Closest point on a bilinear quadrilateral patch via projected Gauss-Newton
/// on the reference coordinates `(s, t) ∈ [0, 1]²`. Weights are the standard
/// bilinear shape functions at the converged reference point.
#[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
fn project_onto_quadrilateral<T, D>(
    corners: [&OPoint<T, D>; 4],
    p: &OPoint<T, D>,
) -> (OPoint<T, D>, Vec<T>)
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D>,
{
    let [p0, p1, p2, p3] = corners;
    let shape = |s: T, t: T| [(1.0 - s) * (1.0 - t), s * (1.0 - t), s * t, (1.0 - s) * t];
    let map = |s: T, t: T| {
        let n = shape(s, t);
        OPoint::<T, D>::from(
            &p0.coords * n[0] + &p1.coords * n[1] + &p2.coords * n[2] + &p3.coords * n[3],
        )
    };

    let mut s = 0.5;
    let mut t = 0.5;
    for _ in 0..32 {
        let x = map(s, t);
        let r = &x.coords - &p.coords;
        let xs = (&p1.coords - &p0.coords) * (1.0 - t) + (&p2.coords - &p3.coords) * t;
        let xt = (&p3.coords - &p0.coords) * (1.0 - s) + (&p2.coords - &p1.coords) * s;

        let g0 = xs.dot(&r);
        let g1 = xt.dot(&r);
        let h00 = xs.dot(&xs);
        let h01 = xs.dot(&xt);
        let h11 = xt.dot(&xt);
        let det = h00 * h11 - h01 * h01;
        if det.abs() <= 1e-30 * (h00 + h11).abs() {
            break;
        }
        let ds = (-g0 * h11 + g1 * h01) / det;
        let dt = (-g1 * h00 + g0 * h01) / det;

        let s_next = (s + ds).clamp(0.0, 1.0);
        let t_next = (t + dt).clamp(0.0, 1.0);
        let step = (s_next - s).abs() + (t_next - t).abs();
        s = s_next;
        t = t_next;
        if step <= 1e-14 {
            break;
        }
    }

    (map(s, t), shape(s, t).to_vec())
}

/// An R*-tree over facet bounding rectangles. Rectangles prune candidates;
/// the exact projection per surviving candidate decides the winner.
pub struct FacetIndex<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    facets: Vec<SurfaceFacet>,
    vertices: Vec<Vec<OPoint<T, D>>>,
    tree: RTree<GeomWithData<Rectangle<RTreePoint<D>>, usize>>,
}

impl<T, D> FacetIndex<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    /// Builds the index from facets and a coordinate lookup for their dofs.
    pub fn from_facets(
        facets: Vec<SurfaceFacet>,
        coordinate: impl Fn(usize) -> OPoint<T, D>,
    ) -> Self {
        let vertices: Vec<Vec<_>> = facets
            .iter()
            .map(|facet| facet.dofs().iter().map(|&dof| coordinate(dof)).collect())
            .collect();
        let geometries = vertices
            .iter()
            .enumerate()
            .map(|(index, facet_vertices)| {
                let rectangle = bounding_rectangle(facet_vertices);
                GeomWithData::new(rectangle, index)
            })
            .collect();
        Self {
            facets,
            vertices,
            tree: RTree::bulk_load(geometries),
        }
    }

    pub fn num_facets(&self) -> usize {
        self.facets.len()
    }
}

/// Axis-aligned bounding rectangle of the vertices, slightly inflated to
/// absorb floating point error in the pruning phase.
fn bounding_rectangle<T, D>(vertices: &[OPoint<T, D>]) -> Rectangle<RTreePoint<D>>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    assert!(!vertices.is_empty());
    let mut min = to_f64_point(&vertices[0]);
    let mut max = min.clone();
    for vertex in &vertices[1..] {
        let v = to_f64_point(vertex);
        for i in 0..D::USIZE {
            min[i] = min[i].min(v[i]);
            max[i] = max[i].max(v[i]);
        }
    }
    for i in 0..D::USIZE {
        let center = 0.5 * (min[i] + max[i]);
        let half = 0.5 * (max[i] - min[i]) * 1.01 + f64::EPSILON;
        min[i] = center - half;
        max[i] = center + half;
    }
    Rectangle::from_corners(RTreePoint(min), RTreePoint(max))
}

impl<T, D> SurfaceSearch<T, D> for FacetIndex<T, D>
where
    T: Real,
    D: DimName,
    DefaultAllocator: Allocator<T, D> + Allocator<f64, D>,
{
    fn closest_projection(
        &self,
        point: &OPoint<T, D>,
        max_distance: T,
    ) -> Option<(&SurfaceFacet, SurfaceProjection<T, D>)> {
        let query = RTreePoint(to_f64_point(point));
        let radius = max_distance.to_subset().expect("gap representable as f64");
        let best = self
            .tree
            .locate_within_distance(query, radius * radius)
            .map(|candidate| {
                let index = candidate.data;
                let projection =
                    project_onto_facet(&self.facets[index], &self.vertices[index], point);
                (projection, index)
            })
            .filter(|(projection, _)| projection.distance <= max_distance)
            .min_by_key(|(projection, index)| {
                let d = projection
                    .distance
                    .to_subset()
                    .expect("distance representable as f64");
                (OrderedFloat(d), *index)
            });
        best.map(|(projection, index)| (&self.facets[index], projection))
    }
}
