//! Great-circle distance on a spherical Earth.

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two coordinates given in degrees.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn one_degree_of_longitude_on_the_equator() {
        let dist = distance_meters(0.0, 0.0, 0.0, 1.0);
        assert_abs_diff_eq!(dist, 111_195.0, epsilon = 1.0);
    }

    #[test]
    fn identical_points_are_zero_apart() {
        assert_eq!(distance_meters(48.137, 11.575, 48.137, 11.575), 0.0);
    }

    #[test]
    fn symmetric_in_its_arguments() {
        let there = distance_meters(52.52, 13.405, 48.137, 11.575);
        let back = distance_meters(48.137, 11.575, 52.52, 13.405);
        assert_abs_diff_eq!(there, back, epsilon = 1e-6);
        // Berlin to Munich, roughly 504 km as the crow flies.
        assert_abs_diff_eq!(there, 504_000.0, epsilon = 2_000.0);
    }
}
