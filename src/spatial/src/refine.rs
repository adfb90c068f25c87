use geo::{BoundingRect, Intersects, PreparedGeometry, Rect, Relate};

use crate::geometry::{Geometry, is_empty};
use crate::predicate::SpatialRelation;

/// Evaluates `candidate RELATION reference`.
pub fn evaluate(relation: SpatialRelation, candidate: &Geometry, reference: &Geometry) -> bool {
    if is_empty(candidate) || is_empty(reference) {
        return matches!(relation, SpatialRelation::Disjoint);
    }
    let matrix = candidate.relate(reference);
    match relation {
        SpatialRelation::Intersects => matrix.is_intersects(),
        SpatialRelation::Contains => matrix.is_contains(),
        SpatialRelation::Within => matrix.is_within(),
        SpatialRelation::Touches => matrix.is_touches(),
        SpatialRelation::Crosses => matrix.is_crosses(),
        SpatialRelation::Overlaps => matrix.is_overlaps(),
        SpatialRelation::Disjoint => matrix.is_disjoint(),
    }
}

/// A reference geometry prepared for evaluation against many candidates.
///
/// The prepared form is not `Sync`, so it is built on the worker that runs the
/// scan and never shared between threads.
pub struct PreparedReference {
    prepared: PreparedGeometry<'static, Geometry>,
    envelope: Option<Rect<f64>>,
    empty: bool,
}

impl PreparedReference {
    pub fn new(reference: Geometry) -> Self {
        let envelope = reference.bounding_rect();
        let empty = is_empty(&reference);
        Self {
            prepared: PreparedGeometry::from(reference),
            envelope,
            empty,
        }
    }

    pub fn envelope(&self) -> Option<Rect<f64>> {
        self.envelope
    }

    pub fn evaluate(&self, relation: SpatialRelation, candidate: &Geometry) -> bool {
        if self.empty || is_empty(candidate) {
            return matches!(relation, SpatialRelation::Disjoint);
        }
        if relation.uses_envelope_prefilter() {
            let (Some(envelope), Some(candidate_rect)) = (self.envelope, candidate.bounding_rect())
            else {
                return false;
            };
            if !envelope.intersects(&candidate_rect) {
                return false;
            }
        }
        // The matrix is computed from the reference side, so asymmetric
        // relations are inverted.
        let matrix = self.prepared.relate(candidate);
        match relation.invert() {
            SpatialRelation::Intersects => matrix.is_intersects(),
            SpatialRelation::Contains => matrix.is_contains(),
            SpatialRelation::Within => matrix.is_within(),
            SpatialRelation::Touches => matrix.is_touches(),
            SpatialRelation::Crosses => matrix.is_crosses(),
            SpatialRelation::Overlaps => matrix.is_overlaps(),
            SpatialRelation::Disjoint => matrix.is_disjoint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::geometry_from_wkt;

    fn geom(wkt: &str) -> Geometry {
        geometry_from_wkt(wkt).unwrap()
    }

    #[test]
    fn point_in_square() {
        let square = geom("POLYGON((0 0,10 0,10 10,0 10,0 0))");
        let inside = geom("POINT(5 5)");
        let outside = geom("POINT(15 5)");

        assert!(evaluate(SpatialRelation::Intersects, &inside, &square));
        assert!(evaluate(SpatialRelation::Within, &inside, &square));
        assert!(!evaluate(SpatialRelation::Contains, &inside, &square));
        assert!(evaluate(SpatialRelation::Contains, &square, &inside));
        assert!(evaluate(SpatialRelation::Disjoint, &outside, &square));
        assert!(!evaluate(SpatialRelation::Intersects, &outside, &square));
    }

    #[test]
    fn touching_squares() {
        let left = geom("POLYGON((0 0,1 0,1 1,0 1,0 0))");
        let right = geom("POLYGON((1 0,2 0,2 1,1 1,1 0))");
        assert!(evaluate(SpatialRelation::Touches, &left, &right));
        assert!(!evaluate(SpatialRelation::Overlaps, &left, &right));
    }

    #[test]
    fn prepared_agrees_with_plain_evaluation() {
        let reference = geom("POLYGON((0 0,10 0,10 10,0 10,0 0))");
        let candidates = [
            geom("POINT(5 5)"),
            geom("POINT(20 20)"),
            geom("LINESTRING(-5 5,15 5)"),
            geom("POLYGON((5 5,15 5,15 15,5 15,5 5))"),
            geom("POLYGON((-1 -1,11 -1,11 11,-1 11,-1 -1))"),
            geom("POLYGON((10 0,20 0,20 10,10 10,10 0))"),
        ];
        let prepared = PreparedReference::new(reference.clone());
        for relation in SpatialRelation::ALL {
            for candidate in &candidates {
                assert_eq!(
                    prepared.evaluate(relation, candidate),
                    evaluate(relation, candidate, &reference),
                    "{relation} disagrees for {candidate:?}"
                );
            }
        }
    }

    #[test]
    fn empty_reference_only_matches_disjoint() {
        let empty = geom("GEOMETRYCOLLECTION EMPTY");
        let point = geom("POINT(1 1)");
        assert!(!evaluate(SpatialRelation::Intersects, &point, &empty));
        assert!(evaluate(SpatialRelation::Disjoint, &point, &empty));
        let prepared = PreparedReference::new(empty);
        assert!(prepared.evaluate(SpatialRelation::Disjoint, &point));
    }
}
