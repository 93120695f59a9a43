//! Spherical geometry helpers for alert coordinates.

/// North galactic pole and ascending node, J2000.
const RA_NGP_DEG: f64 = 192.859508;
const DEC_NGP_DEG: f64 = 27.128336;
const L_NCP_DEG: f64 = 122.932;

/// Format right ascension in degrees as an H:M:S string.
pub fn deg2hms(ra: f64) -> String {
    // round to the printed precision first so 59.9999... carries over
    let total = (ra / 15.0 * 3600.0 * 10_000.0).round() / 10_000.0;
    let h = (total / 3600.0).floor();
    let m = ((total - h * 3600.0) / 60.0).floor();
    let s = total - h * 3600.0 - m * 60.0;
    format!("{:02}:{:02}:{:07.4}", h as u32, m as u32, s)
}

/// Format declination in degrees as a D:M:S string.
pub fn deg2dms(dec: f64) -> String {
    let total = (dec.abs() * 3600.0 * 1_000.0).round() / 1_000.0;
    let d = (total / 3600.0).floor();
    let m = ((total - d * 3600.0) / 60.0).floor();
    let s = total - d * 3600.0 - m * 60.0;
    let sign = if dec < 0.0 { "-" } else { "" };
    format!("{}{:02}:{:02}:{:06.3}", sign, d as u32, m as u32, s)
}

/// Equatorial (ra, dec) to galactic (l, b), all in degrees.
pub fn radec_to_galactic(ra: f64, dec: f64) -> (f64, f64) {
    let ra = ra.to_radians();
    let dec = dec.to_radians();
    let ra_ngp = RA_NGP_DEG.to_radians();
    let dec_ngp = DEC_NGP_DEG.to_radians();

    let b = (dec.sin() * dec_ngp.sin() + dec.cos() * dec_ngp.cos() * (ra - ra_ngp).cos()).asin();
    let l = L_NCP_DEG.to_radians()
        - (dec.cos() * (ra - ra_ngp).sin())
            .atan2(dec.sin() * dec_ngp.cos() - dec.cos() * dec_ngp.sin() * (ra - ra_ngp).cos());

    let mut l_deg = l.to_degrees() % 360.0;
    if l_deg < 0.0 {
        l_deg += 360.0;
    }
    (l_deg, b.to_degrees())
}

/// Great-circle distance between two points, degrees in and out.
pub fn great_circle_distance(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let dec1 = dec1.to_radians();
    let dec2 = dec2.to_radians();
    let delta_ra = (ra2 - ra1).to_radians();

    let num = ((dec2.cos() * delta_ra.sin()).powi(2)
        + (dec1.cos() * dec2.sin() - dec1.sin() * dec2.cos() * delta_ra.cos()).powi(2))
    .sqrt();
    let den = dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * delta_ra.cos();
    num.atan2(den).to_degrees()
}

/// Initial bearing from (ra1, dec1) towards (ra2, dec2), measured from north
/// through east, in degrees.
fn position_angle(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let dec1 = dec1.to_radians();
    let dec2 = dec2.to_radians();
    let delta_ra = (ra2 - ra1).to_radians();

    let y = delta_ra.sin() * dec2.cos();
    let x = dec1.cos() * dec2.sin() - dec1.sin() * dec2.cos() * delta_ra.cos();
    y.atan2(x).to_degrees()
}

/// Whether point (alpha, delta) falls within the ellipse centred on
/// (alpha1, delta01) with semi-major axis `d0`, axis ratio `axis_ratio` and
/// position angle `pa0` (from north through east). All angles in degrees.
pub fn in_ellipse(
    alpha: f64,
    delta: f64,
    alpha1: f64,
    delta01: f64,
    d0: f64,
    axis_ratio: f64,
    pa0: f64,
) -> bool {
    let separation = great_circle_distance(alpha1, delta01, alpha, delta);
    if separation == 0.0 {
        return true;
    }

    let semi_major = d0;
    let semi_minor = d0 * axis_ratio;
    if semi_major <= 0.0 || semi_minor <= 0.0 {
        return false;
    }

    // radial extent of the ellipse along the bearing towards the point
    let phi = (position_angle(alpha1, delta01, alpha, delta) - pa0).to_radians();
    let extent = semi_major * semi_minor
        / ((semi_minor * phi.cos()).powi(2) + (semi_major * phi.sin()).powi(2)).sqrt();

    separation <= extent
}
