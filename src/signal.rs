//! SPGR signal equation, forward and inverse, with per-voxel B1 correction.
//!
//! Times are in ms, flip angles in degrees, concentrations in mM. The
//! relaxivity constant `r1` is in s⁻¹·mM⁻¹ (so it is divided by 1000 when
//! combined with ms relaxation rates).

use std::f64::consts::PI;

/// Effective excitation angle in radians, or None when the corrected angle is
/// unusable (B1 ≤ 0 or α·B1 ≥ 90°).
pub fn effective_alpha(fa_deg: f64, b1: f64) -> Option<f64> {
    if !(b1 > 0.0) {
        return None;
    }
    let alpha = fa_deg.to_radians() * b1;
    if !alpha.is_finite() || alpha <= 0.0 || alpha >= PI / 2.0 {
        return None;
    }
    Some(alpha)
}

/// Steady-state SPGR signal for tissue with native T1 `t10_ms` holding
/// contrast-agent concentration `ct`.
pub fn signal_from_concentration(
    ct: f64,
    t10_ms: f64,
    m0: f64,
    fa_deg: f64,
    tr_ms: f64,
    b1: f64,
    r1: f64,
) -> f64 {
    let alpha = match effective_alpha(fa_deg, b1) {
        Some(a) => a,
        None => return f64::NAN,
    };
    let r1_total = 1.0 / t10_ms + r1 * ct / 1000.0;
    let e = (-tr_ms * r1_total).exp();
    m0 * alpha.sin() * (1.0 - e) / (1.0 - alpha.cos() * e)
}

/// Invert the SPGR equation for concentration. Returns NaN when the signal is
/// outside the invertible range, callers translate that into a voxel error.
pub fn concentration_from_signal(
    s: f64,
    t10_ms: f64,
    m0: f64,
    fa_deg: f64,
    tr_ms: f64,
    b1: f64,
    r1: f64,
) -> f64 {
    let alpha = match effective_alpha(fa_deg, b1) {
        Some(a) => a,
        None => return f64::NAN,
    };
    let sin_a = alpha.sin();
    let cos_a = alpha.cos();
    let e = (m0 * sin_a - s) / (m0 * sin_a - s * cos_a);
    if !(e > 0.0 && e < 1.0) {
        return f64::NAN;
    }
    let r1_total = -e.ln() / tr_ms;
    (r1_total - 1.0 / t10_ms) * 1000.0 / r1
}

/// SPGR scale factor relating M0 to the baseline signal, used by the ratio
/// M0 mode: `M0 = mean(prebolus S) / scale`.
pub fn baseline_scale(t10_ms: f64, fa_deg: f64, tr_ms: f64, b1: f64) -> f64 {
    let alpha = match effective_alpha(fa_deg, b1) {
        Some(a) => a,
        None => return f64::NAN,
    };
    let e = (-tr_ms / t10_ms).exp();
    alpha.sin() * (1.0 - e) / (1.0 - alpha.cos() * e)
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn forward_inverse_round_trip() {
        let (t10, m0, fa, tr, b1, r1) = (1000.0, 2000.0, 20.0, 3.5, 1.0, 3.4);
        for &ct in &[0.0, 0.05, 0.5, 2.0, 5.0] {
            let s = signal_from_concentration(ct, t10, m0, fa, tr, b1, r1);
            let back = concentration_from_signal(s, t10, m0, fa, tr, b1, r1);
            assert_float_eq!(back, ct, abs <= 1e-9);
        }
    }

    #[test]
    fn b1_correction_scales_angle() {
        let s_nominal = signal_from_concentration(1.0, 1000.0, 1000.0, 20.0, 3.5, 1.0, 3.4);
        let s_scaled = signal_from_concentration(1.0, 1000.0, 1000.0, 25.0, 3.5, 0.8, 3.4);
        assert_float_eq!(s_nominal, s_scaled, rel <= 1e-12);
    }

    #[test]
    fn invalid_b1_yields_nan() {
        assert!(signal_from_concentration(1.0, 1000.0, 1000.0, 20.0, 3.5, 0.0, 3.4).is_nan());
        assert!(signal_from_concentration(1.0, 1000.0, 1000.0, 20.0, 3.5, -1.0, 3.4).is_nan());
        // corrected angle at 90 degrees or beyond is rejected
        assert!(signal_from_concentration(1.0, 1000.0, 1000.0, 60.0, 3.5, 1.6, 3.4).is_nan());
    }

    #[test]
    fn baseline_scale_matches_forward_at_zero_concentration() {
        let (t10, m0, fa, tr, b1, r1) = (900.0, 1500.0, 15.0, 4.0, 1.0, 3.4);
        let s0 = signal_from_concentration(0.0, t10, m0, fa, tr, b1, r1);
        assert_float_eq!(s0 / m0, baseline_scale(t10, fa, tr, b1), abs <= 1e-12);
    }
}
