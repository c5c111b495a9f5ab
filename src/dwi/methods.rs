//! Per-voxel DWI model fits. b-values in s/mm², diffusivities in mm²/s.

use crate::optimise::{self, FitterType};
use crate::tracker::ErrorCode;

/// Default b-value separating the perfusion and diffusion regimes for the
/// simplified IVIM fit.
pub const IVIM_DEFAULT_B_THRESHOLD: f64 = 200.0;

/// Log-space line fit of `ln S = ln S0 - b·ADC`, returning `(S0, ADC)`.
pub fn adc_linear(signals: &[f64], b_values: &[f64]) -> Result<(f64, f64), ErrorCode> {
    let n = signals.len();
    if n < 2 || b_values.len() != n {
        return Err(ErrorCode::DceInvalidInput);
    }
    if signals.iter().any(|&s| !(s > 0.0)) {
        return Err(ErrorCode::DceInvalidInput);
    }

    let log_s: Vec<f64> = signals.iter().map(|&s| s.ln()).collect();
    let mean_b = b_values.iter().sum::<f64>() / n as f64;
    let mean_y = log_s.iter().sum::<f64>() / n as f64;
    let mut sbb = 0.0;
    let mut sby = 0.0;
    for (&b, &y) in b_values.iter().zip(log_s.iter()) {
        sbb += (b - mean_b) * (b - mean_b);
        sby += (b - mean_b) * (y - mean_y);
    }
    if sbb == 0.0 {
        return Err(ErrorCode::DceInvalidInput);
    }
    let adc = -sby / sbb;
    let s0 = (mean_y + adc * mean_b).exp();
    if !adc.is_finite() || !s0.is_finite() || s0 <= 0.0 {
        return Err(ErrorCode::DceInvalidInput);
    }
    Ok((s0, adc))
}

/// Bounded non-linear mono-exponential fit, seeded from the log-space line.
pub fn adc_nls(
    signals: &[f64],
    b_values: &[f64],
    max_iters: usize,
) -> Result<(f64, f64), ErrorCode> {
    let (s0_init, adc_init) = adc_linear(signals, b_values)?;

    let lb = [1.0e-6, 0.0];
    let ub = [1.0e9, 0.1];
    let objective = |x: &[f64]| {
        signals
            .iter()
            .zip(b_values.iter())
            .map(|(&s, &b)| {
                let model = x[0] * (-b * x[1]).exp();
                (s - model) * (s - model)
            })
            .sum()
    };
    let best = optimise::fit_bound_constrained(
        &[s0_init, adc_init.clamp(0.0, 0.1)],
        &lb,
        &ub,
        objective,
        max_iters,
        FitterType::Bleic,
    );
    Ok((best[0], best[1]))
}

/// Full IVIM fit `S = S0·(f·exp(-b·D*) + (1-f)·exp(-b·D))`, returning
/// `(S0, f, D, D*)`.
pub fn ivim(
    signals: &[f64],
    b_values: &[f64],
    b_threshold: f64,
    max_iters: usize,
) -> Result<(f64, f64, f64, f64), ErrorCode> {
    let (s0, f, d, _) = ivim_simple(signals, b_values, b_threshold)?;
    let d_star_init = (10.0 * d).clamp(1.0e-4, 1.0);

    let lb = [1.0e-6, 0.0, 0.0, 0.0];
    let ub = [1.0e9, 1.0, 0.1, 1.0];
    let objective = |x: &[f64]| {
        signals
            .iter()
            .zip(b_values.iter())
            .map(|(&s, &b)| {
                let model = x[0] * (x[1] * (-b * x[3]).exp() + (1.0 - x[1]) * (-b * x[2]).exp());
                (s - model) * (s - model)
            })
            .sum()
    };
    let best = optimise::fit_bound_constrained(
        &[s0, f, d, d_star_init],
        &lb,
        &ub,
        objective,
        max_iters,
        FitterType::Bleic,
    );
    Ok((best[0], best[1], best[2], best[3]))
}

/// Simplified IVIM: the diffusion phase (`b ≥ b_threshold`) is solved as a
/// log-space line, the perfusion fraction comes from the low-b intercept
/// deficit, and D* is pinned at zero.
pub fn ivim_simple(
    signals: &[f64],
    b_values: &[f64],
    b_threshold: f64,
) -> Result<(f64, f64, f64, f64), ErrorCode> {
    let n = signals.len();
    if n < 4 || b_values.len() != n {
        return Err(ErrorCode::DceInvalidInput);
    }

    let mut high_s = Vec::new();
    let mut high_b = Vec::new();
    for (&s, &b) in signals.iter().zip(b_values.iter()) {
        if b >= b_threshold {
            high_s.push(s);
            high_b.push(b);
        }
    }
    if high_s.len() < 2 || high_s.len() == n {
        return Err(ErrorCode::DceInvalidInput);
    }
    let (s0_diff, d) = adc_linear(&high_s, &high_b)?;

    // lowest-b sample approximates the true S0
    let (low_idx, _) = b_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .expect("non-empty b-values");
    let s0 = signals[low_idx];
    if !(s0 > 0.0) {
        return Err(ErrorCode::DceInvalidInput);
    }
    let f = (1.0 - s0_diff / s0).clamp(0.0, 1.0);

    Ok((s0, f, d, 0.0))
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    fn mono_exp(s0: f64, adc: f64, b_values: &[f64]) -> Vec<f64> {
        b_values.iter().map(|&b| s0 * (-b * adc).exp()).collect()
    }

    #[test]
    fn adc_linear_recovers_decay() {
        let bs = [0.0, 250.0, 500.0, 750.0, 1000.0];
        let signals = mono_exp(1000.0, 1.1e-3, &bs);
        let (s0, adc) = adc_linear(&signals, &bs).unwrap();
        assert_float_eq!(s0, 1000.0, rel <= 1e-10);
        assert_float_eq!(adc, 1.1e-3, rel <= 1e-10);
    }

    #[test]
    fn adc_nls_matches_linear_on_clean_data() {
        let bs = [0.0, 300.0, 600.0, 900.0];
        let signals = mono_exp(800.0, 0.9e-3, &bs);
        let (s0, adc) = adc_nls(&signals, &bs, 500).unwrap();
        assert_float_eq!(s0, 800.0, abs <= 0.1);
        assert_float_eq!(adc, 0.9e-3, abs <= 1e-6);
    }

    #[test]
    fn ivim_simple_partitions_about_threshold() {
        let bs = [0.0, 50.0, 100.0, 250.0, 500.0, 750.0, 1000.0];
        let (s0, f, d, d_star): (f64, f64, f64, f64) = (1000.0, 0.12, 1.0e-3, 2.0e-2);
        let signals: Vec<f64> = bs
            .iter()
            .map(|&b| s0 * (f * (-b * d_star).exp() + (1.0 - f) * (-b * d).exp()))
            .collect();

        let (s0_fit, f_fit, d_fit, d_star_fit) =
            ivim_simple(&signals, &bs, IVIM_DEFAULT_B_THRESHOLD).unwrap();
        assert_eq!(d_star_fit, 0.0);
        assert_float_eq!(s0_fit, s0, rel <= 1e-10);
        // fast compartment is fully attenuated by b=250, so the high-b line
        // recovers the diffusion coefficient and the intercept deficit f
        assert_float_eq!(d_fit, d, abs <= 5e-5);
        assert_float_eq!(f_fit, f, abs <= 0.02);
    }

    #[test]
    fn full_ivim_improves_on_the_simple_seed() {
        let bs = [0.0, 20.0, 50.0, 100.0, 200.0, 400.0, 600.0, 800.0, 1000.0];
        let (s0, f, d, d_star): (f64, f64, f64, f64) = (1000.0, 0.15, 1.0e-3, 1.5e-2);
        let signals: Vec<f64> = bs
            .iter()
            .map(|&b| s0 * (f * (-b * d_star).exp() + (1.0 - f) * (-b * d).exp()))
            .collect();

        let (s0_fit, f_fit, d_fit, d_star_fit) = ivim(&signals, &bs, 200.0, 2000).unwrap();
        let sse: f64 = signals
            .iter()
            .zip(bs.iter())
            .map(|(&s, &b)| {
                let m = s0_fit
                    * (f_fit * (-b * d_star_fit).exp() + (1.0 - f_fit) * (-b * d_fit).exp());
                (s - m) * (s - m)
            })
            .sum();
        assert!(sse < 20.0, "residual {sse}");
        assert_float_eq!(f_fit, f, abs <= 0.05);
    }

    #[test]
    fn nonpositive_signal_is_invalid() {
        assert!(adc_linear(&[100.0, 0.0], &[0.0, 500.0]).is_err());
    }
}
