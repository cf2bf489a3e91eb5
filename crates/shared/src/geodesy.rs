//! Great-circle math over WGS-84.

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Knots to km/h conversion factor.
pub const KNOTS_TO_KMH: f64 = 1.852;

/// Great-circle distance between two coordinates in meters (haversine).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Builds the box enclosing the given `(lat, lon)` points.
    ///
    /// Returns `None` for an empty point set.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut iter = points.into_iter();
        let (lat, lon) = iter.next()?;
        let mut bbox = BoundingBox {
            min_lat: lat,
            max_lat: lat,
            min_lon: lon,
            max_lon: lon,
        };
        for (lat, lon) in iter {
            bbox.min_lat = bbox.min_lat.min(lat);
            bbox.max_lat = bbox.max_lat.max(lat);
            bbox.min_lon = bbox.min_lon.min(lon);
            bbox.max_lon = bbox.max_lon.max(lon);
        }
        Some(bbox)
    }

    /// Expands the box by `meters` on every side.
    pub fn expanded_by(&self, meters: f64) -> Self {
        let d_lat = meters / 111_320.0;
        // Longitude degrees shrink with latitude; use the widest latitude edge.
        let widest_lat = self.min_lat.abs().max(self.max_lat.abs()).min(89.0);
        let d_lon = d_lat / widest_lat.to_radians().cos().max(1e-6);
        BoundingBox {
            min_lat: (self.min_lat - d_lat).max(-90.0),
            max_lat: (self.max_lat + d_lat).min(90.0),
            min_lon: (self.min_lon - d_lon).max(-180.0),
            max_lon: (self.max_lon + d_lon).min(180.0),
        }
    }

    /// Whether the point lies within the box (boundary inclusive).
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}
