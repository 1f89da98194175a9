//! Compact Position Reporting decoder
//!
//! CPR encodes latitude and longitude in 17 bits each, alternating between
//! an even and an odd zone grid. A pair of even/odd frames decodes to a
//! globally unambiguous position; a single frame decodes relative to a
//! nearby reference.

/// A decoded geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Why a CPR decode produced no position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CprError {
    /// A computed latitude left [-90, 90].
    OutOfRange,
    /// The even and odd latitudes fall in different longitude zone bands;
    /// the pair straddles a zone boundary and cannot be combined.
    ZoneMismatch,
    /// A relative decode landed more than half a cell from the reference.
    NoFix,
}

/// One raw 17-bit lat/lon pair as carried in a position message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCpr {
    pub lat: u32,
    pub lon: u32,
    pub odd: bool,
    pub surface: bool,
}

const CPR_MAX: f64 = 131072.0; // 2^17

/// Number of longitude zones at the given latitude, 1..=59.
/// Symmetric about the equator and non-increasing toward the poles.
pub fn nl(lat: f64) -> i32 {
    let lat = lat.abs();

    if lat < 10.47047130 {
        59
    } else if lat < 14.82817437 {
        58
    } else if lat < 18.18626357 {
        57
    } else if lat < 21.02939493 {
        56
    } else if lat < 23.54504487 {
        55
    } else if lat < 25.82924707 {
        54
    } else if lat < 27.93898710 {
        53
    } else if lat < 29.91135686 {
        52
    } else if lat < 31.77209708 {
        51
    } else if lat < 33.53993436 {
        50
    } else if lat < 35.22899598 {
        49
    } else if lat < 36.85025108 {
        48
    } else if lat < 38.41241892 {
        47
    } else if lat < 39.92256684 {
        46
    } else if lat < 41.38651832 {
        45
    } else if lat < 42.80914012 {
        44
    } else if lat < 44.19454951 {
        43
    } else if lat < 45.54626723 {
        42
    } else if lat < 46.86733252 {
        41
    } else if lat < 48.16039128 {
        40
    } else if lat < 49.42776439 {
        39
    } else if lat < 50.67150166 {
        38
    } else if lat < 51.89342469 {
        37
    } else if lat < 53.09516153 {
        36
    } else if lat < 54.27817472 {
        35
    } else if lat < 55.44378444 {
        34
    } else if lat < 56.59318756 {
        33
    } else if lat < 57.72747354 {
        32
    } else if lat < 58.84763776 {
        31
    } else if lat < 59.95459277 {
        30
    } else if lat < 61.04917774 {
        29
    } else if lat < 62.13216659 {
        28
    } else if lat < 63.20427479 {
        27
    } else if lat < 64.26616523 {
        26
    } else if lat < 65.31845310 {
        25
    } else if lat < 66.36171008 {
        24
    } else if lat < 67.39646774 {
        23
    } else if lat < 68.42322022 {
        22
    } else if lat < 69.44242631 {
        21
    } else if lat < 70.45451075 {
        20
    } else if lat < 71.45986473 {
        19
    } else if lat < 72.45884545 {
        18
    } else if lat < 73.45177442 {
        17
    } else if lat < 74.43893416 {
        16
    } else if lat < 75.42056257 {
        15
    } else if lat < 76.39684391 {
        14
    } else if lat < 77.36789461 {
        13
    } else if lat < 78.33374083 {
        12
    } else if lat < 79.29428225 {
        11
    } else if lat < 80.24923213 {
        10
    } else if lat < 81.19801349 {
        9
    } else if lat < 82.13956981 {
        8
    } else if lat < 83.07199445 {
        7
    } else if lat < 83.99173563 {
        6
    } else if lat < 84.89166191 {
        5
    } else if lat < 85.75541621 {
        4
    } else if lat < 86.53536998 {
        3
    } else if lat < 87.00000000 {
        2
    } else {
        1
    }
}

/// Number of longitude cells: NL reduced by one on the odd grid, never
/// below one.
fn n(lat: f64, odd: bool) -> i32 {
    (nl(lat) - odd as i32).max(1)
}

fn dlon(lat: f64, odd: bool, surface: bool) -> f64 {
    let span = if surface { 90.0 } else { 360.0 };
    span / n(lat, odd) as f64
}

/// Always-positive integer modulo.
fn mod_int(a: i32, b: i32) -> i32 {
    let r = a % b;
    if r < 0 { r + b } else { r }
}

/// Always-positive float remainder.
fn mod_f(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r < 0.0 { r + b.abs() } else { r }
}

/// Globally unambiguous airborne decode from an even/odd pair.
/// `latest_odd` selects which side's longitude (and zone count) anchors the
/// result.
pub fn decode_global_airborne(
    even: (u32, u32),
    odd: (u32, u32),
    latest_odd: bool,
) -> Result<Position, CprError> {
    decode_global(even, odd, latest_odd, None)
}

/// Globally unambiguous surface decode. Surface frames span a quarter of the
/// globe per zone, so the receiver reference disambiguates both the
/// latitude hemisphere and the 90-degree longitude quadrant.
pub fn decode_global_surface(
    ref_lat: f64,
    ref_lon: f64,
    even: (u32, u32),
    odd: (u32, u32),
    latest_odd: bool,
) -> Result<Position, CprError> {
    decode_global(even, odd, latest_odd, Some((ref_lat, ref_lon)))
}

fn decode_global(
    even: (u32, u32),
    odd: (u32, u32),
    latest_odd: bool,
    surface_ref: Option<(f64, f64)>,
) -> Result<Position, CprError> {
    let span = if surface_ref.is_some() { 90.0 } else { 360.0 };
    let dlat0 = span / 60.0;
    let dlat1 = span / 59.0;

    let lat0 = even.0 as f64;
    let lat1 = odd.0 as f64;
    let lon0 = even.1 as f64;
    let lon1 = odd.1 as f64;

    // Latitude zone index
    let j = ((59.0 * lat0 - 60.0 * lat1) / CPR_MAX + 0.5).floor() as i32;

    let mut rlat0 = dlat0 * (mod_int(j, 60) as f64 + lat0 / CPR_MAX);
    let mut rlat1 = dlat1 * (mod_int(j, 59) as f64 + lat1 / CPR_MAX);

    if rlat0 >= 270.0 {
        rlat0 -= 360.0;
    }
    if rlat1 >= 270.0 {
        rlat1 -= 360.0;
    }

    if let Some((ref_lat, _)) = surface_ref {
        // Surface latitudes are ambiguous modulo 90 degrees; pick the
        // solution nearest the reference. A reference at the south pole
        // always takes the southern solution, one at the north pole the
        // northern.
        if rlat0 - ref_lat > 45.0 {
            rlat0 -= 90.0;
        }
        if rlat1 - ref_lat > 45.0 {
            rlat1 -= 90.0;
        }
    }

    if !(-90.0..=90.0).contains(&rlat0) || !(-90.0..=90.0).contains(&rlat1) {
        return Err(CprError::OutOfRange);
    }
    if nl(rlat0) != nl(rlat1) {
        return Err(CprError::ZoneMismatch);
    }

    let (rlat, lon_cpr) = if latest_odd { (rlat1, lon1) } else { (rlat0, lon0) };

    let ni = n(rlat, latest_odd);
    let m = ((lon0 * (nl(rlat) - 1) as f64 - lon1 * nl(rlat) as f64) / CPR_MAX + 0.5).floor()
        as i32;
    let mut rlon =
        dlon(rlat, latest_odd, surface_ref.is_some()) * (mod_int(m, ni) as f64 + lon_cpr / CPR_MAX);

    if let Some((_, ref_lon)) = surface_ref {
        // Snap to the 90-degree quadrant nearest the reference longitude.
        rlon += ((ref_lon - rlon + 45.0) / 90.0).floor() * 90.0;
    }

    if rlon > 180.0 {
        rlon -= 360.0;
    } else if rlon < -180.0 {
        rlon += 360.0;
    }

    Ok(Position {
        latitude: rlat,
        longitude: rlon,
    })
}

/// Decode a single frame against a reference position no more than half a
/// cell away (the last decoded position, or the receiver location).
pub fn decode_relative(ref_lat: f64, ref_lon: f64, raw: &RawCpr) -> Result<Position, CprError> {
    let span = if raw.surface { 90.0 } else { 360.0 };
    let dlat = span / if raw.odd { 59.0 } else { 60.0 };

    let lat_cpr = raw.lat as f64 / CPR_MAX;
    let lon_cpr = raw.lon as f64 / CPR_MAX;

    let j = (ref_lat / dlat).floor() + (0.5 + mod_f(ref_lat, dlat) / dlat - lat_cpr).floor();
    let rlat = dlat * (j + lat_cpr);

    if !(-90.0..=90.0).contains(&rlat) {
        return Err(CprError::OutOfRange);
    }
    if (rlat - ref_lat).abs() > dlat / 2.0 {
        return Err(CprError::NoFix);
    }

    let dlon = span / n(rlat, raw.odd) as f64;
    let m = (ref_lon / dlon).floor() + (0.5 + mod_f(ref_lon, dlon) / dlon - lon_cpr).floor();
    let rlon = dlon * (m + lon_cpr);

    if (rlon - ref_lon).abs() > dlon / 2.0 {
        return Err(CprError::NoFix);
    }

    Ok(Position {
        latitude: rlat,
        longitude: rlon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const EVEN_AIR: (u32, u32) = (80536, 9432);
    const ODD_AIR: (u32, u32) = (61720, 9192);
    const EVEN_SURF: (u32, u32) = (105730, 9259);
    const ODD_SURF: (u32, u32) = (29693, 8997);

    #[test]
    fn test_nl_symmetry_and_monotonic() {
        let mut lat = 0.0;
        let mut prev = nl(0.0);
        assert_eq!(prev, 59);
        while lat <= 90.0 {
            assert_eq!(nl(lat), nl(-lat));
            let cur = nl(lat);
            assert!(cur <= prev, "NL increased at {lat}");
            prev = cur;
            lat += 0.05;
        }
        assert_eq!(nl(90.0), 1);
    }

    #[test]
    fn test_global_airborne_even() {
        let pos = decode_global_airborne(EVEN_AIR, ODD_AIR, false).unwrap();
        assert_abs_diff_eq!(pos.latitude, 51.686646, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 0.700156, epsilon = 1e-6);
    }

    #[test]
    fn test_global_airborne_odd() {
        let pos = decode_global_airborne(EVEN_AIR, ODD_AIR, true).unwrap();
        assert_abs_diff_eq!(pos.latitude, 51.686763, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 0.701294, epsilon = 1e-6);
    }

    #[test]
    fn test_global_surface() {
        let pos = decode_global_surface(52.0, 0.0, EVEN_SURF, ODD_SURF, false).unwrap();
        assert_abs_diff_eq!(pos.latitude, 52.209984, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 0.176601, epsilon = 1e-6);
    }

    #[test]
    fn test_global_surface_far_lon_reference() {
        let pos = decode_global_surface(52.0, 130.0, EVEN_SURF, ODD_SURF, false).unwrap();
        assert_abs_diff_eq!(pos.latitude, 52.209984, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 90.176601, epsilon = 1e-6);
    }

    #[test]
    fn test_global_surface_southern_hemisphere() {
        let pos = decode_global_surface(7.0, 0.0, EVEN_SURF, ODD_SURF, false).unwrap();
        assert_abs_diff_eq!(pos.latitude, -37.790016, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 0.135269, epsilon = 1e-6);
    }

    #[test]
    fn test_surface_quadrant_boundaries() {
        // The decoded longitude snaps to the quadrant nearest the
        // reference; check right at the +/-45 degree boundaries.
        let base = decode_global_surface(52.0, 0.0, EVEN_SURF, ODD_SURF, false).unwrap();
        let true_lon = base.longitude;

        let near = decode_global_surface(52.0, true_lon + 44.9, EVEN_SURF, ODD_SURF, false)
            .unwrap();
        assert_abs_diff_eq!(near.longitude, true_lon, epsilon = 1e-6);

        let past = decode_global_surface(52.0, true_lon + 45.1, EVEN_SURF, ODD_SURF, false)
            .unwrap();
        assert_abs_diff_eq!(past.longitude, true_lon + 90.0, epsilon = 1e-6);

        let below = decode_global_surface(52.0, true_lon - 44.9, EVEN_SURF, ODD_SURF, false)
            .unwrap();
        assert_abs_diff_eq!(below.longitude, true_lon, epsilon = 1e-6);

        let wrapped = decode_global_surface(52.0, true_lon - 45.1, EVEN_SURF, ODD_SURF, false)
            .unwrap();
        assert_abs_diff_eq!(wrapped.longitude, true_lon - 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_surface_polar_references() {
        // A north-pole reference keeps the northern latitude solution.
        let north = decode_global_surface(90.0, 0.0, EVEN_SURF, ODD_SURF, false).unwrap();
        assert_abs_diff_eq!(north.latitude, 52.209984, epsilon = 1e-6);

        // A south-pole reference forces the southern solution.
        let south = decode_global_surface(-90.0, 0.0, EVEN_SURF, ODD_SURF, false).unwrap();
        assert_abs_diff_eq!(south.latitude, -37.790016, epsilon = 1e-6);
    }

    #[test]
    fn test_relative_airborne() {
        let raw = RawCpr {
            lat: EVEN_AIR.0,
            lon: EVEN_AIR.1,
            odd: false,
            surface: false,
        };
        let pos = decode_relative(52.0, 0.0, &raw).unwrap();
        assert_abs_diff_eq!(pos.latitude, 51.686646, epsilon = 1e-6);
        assert_abs_diff_eq!(pos.longitude, 0.700156, epsilon = 1e-6);
    }

    #[test]
    fn test_relative_stays_within_half_cell() {
        let raw = RawCpr {
            lat: EVEN_AIR.0,
            lon: EVEN_AIR.1,
            odd: false,
            surface: false,
        };
        // Whatever the reference, an accepted relative decode is at most
        // half a cell away from it.
        for ref_lat in [40.0, 51.7, 58.0, -10.0] {
            if let Ok(pos) = decode_relative(ref_lat, 0.0, &raw) {
                assert!((pos.latitude - ref_lat).abs() <= 3.0);
            }
        }
    }

    #[test]
    fn test_zone_mismatch() {
        // Even latitude just below the 59->58 zone boundary (10.47 deg),
        // odd latitude just above it: the pair cannot be combined.
        let even = (97430u32, 0u32);
        let odd = (94059u32, 0u32);
        assert_eq!(
            decode_global_airborne(even, odd, false),
            Err(CprError::ZoneMismatch)
        );
    }

    #[test]
    fn test_out_of_range_rejected() {
        // A mismatched pair whose zone index lands the latitude at 180 deg
        let even = (0u32, 0u32);
        let odd = (65536u32, 0u32);
        assert_eq!(
            decode_global_airborne(even, odd, false),
            Err(CprError::OutOfRange)
        );
    }
}
