use common_exception::{FilterError, Result};
use geo::{BoundingRect, CoordsIter, Rect};
use wkt::{ToWkt, TryFromWkt};

pub type Geometry = geo::Geometry<f64>;

pub fn geometry_from_wkt(wkt: &str) -> Result<Geometry> {
    Geometry::try_from_wkt_str(wkt.trim())
        .map_err(|e| FilterError::InvalidGeometry(format!("cannot parse WKT '{wkt}': {e}")))
}

pub fn geometry_to_wkt(geometry: &Geometry) -> String {
    geometry.wkt_string()
}

/// A geometry without a single coordinate matches nothing.
pub fn is_empty(geometry: &Geometry) -> bool {
    geometry.coords_count() == 0
}

pub fn envelope(geometry: &Geometry) -> Option<Rect<f64>> {
    geometry.bounding_rect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_polygon() {
        let geom = geometry_from_wkt("POLYGON((0 0,10 0,10 10,0 10,0 0))").unwrap();
        assert!(matches!(geom, Geometry::Polygon(_)));
        let rect = envelope(&geom).unwrap();
        assert_eq!(rect.min().x, 0.0);
        assert_eq!(rect.max().y, 10.0);
        let back = geometry_from_wkt(&geometry_to_wkt(&geom)).unwrap();
        assert_eq!(back, geom);
    }

    #[test]
    fn bad_wkt_is_invalid_geometry() {
        let err = geometry_from_wkt("POLYGON((0 0, 1").unwrap_err();
        assert_eq!(err.kind(), common_exception::ErrorKind::InvalidGeometry);
    }

    #[test]
    fn empty_collection_is_empty() {
        let geom = geometry_from_wkt("GEOMETRYCOLLECTION EMPTY").unwrap();
        assert!(is_empty(&geom));
        assert!(envelope(&geom).is_none());
    }
}
