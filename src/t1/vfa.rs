//! Variable flip-angle T1 fitting: the linearised solution, and a bounded
//! non-linear refinement seeded from it.

use crate::optimise::{self, FitterType};
use crate::signal;
use crate::tracker::ErrorCode;

use super::T1_MAX_MS;

/// Linearised VFA: with `y = S/sin α` and `x = S/tan α`,
/// `y = E1·x + M0·(1 - E1)`, so one line fit yields both parameters.
pub fn fit_linear(
    signals: &[f64],
    fa_degs: &[f64],
    tr_ms: f64,
    b1: f64,
) -> Result<(f64, f64), ErrorCode> {
    let n = signals.len();
    if n < 2 || fa_degs.len() != n {
        return Err(ErrorCode::T1FitFail);
    }

    let mut xs = Vec::with_capacity(n);
    let mut ys = Vec::with_capacity(n);
    for (&s, &fa) in signals.iter().zip(fa_degs.iter()) {
        let alpha = match signal::effective_alpha(fa, b1) {
            Some(a) => a,
            None => return Err(ErrorCode::B1Invalid),
        };
        xs.push(s / alpha.tan());
        ys.push(s / alpha.sin());
    }

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx == 0.0 {
        return Err(ErrorCode::T1FitFail);
    }
    let e1 = sxy / sxx;
    if !(e1 > 0.0 && e1 < 1.0) {
        return Err(ErrorCode::T1FitFail);
    }
    let t1 = -tr_ms / e1.ln();
    let m0 = (mean_y - e1 * mean_x) / (1.0 - e1);
    if !(t1 > 0.0 && t1 < T1_MAX_MS) || !(m0 > 0.0) || !t1.is_finite() || !m0.is_finite() {
        return Err(ErrorCode::T1FitFail);
    }
    Ok((t1, m0))
}

/// Bounded non-linear VFA fit, seeded from the linear solution where it
/// exists.
pub fn fit_nls(
    signals: &[f64],
    fa_degs: &[f64],
    tr_ms: f64,
    b1: f64,
    max_iters: usize,
) -> Result<(f64, f64), ErrorCode> {
    let n = signals.len();
    if n < 2 || fa_degs.len() != n {
        return Err(ErrorCode::T1FitFail);
    }
    if signal::effective_alpha(fa_degs[0], b1).is_none() {
        return Err(ErrorCode::B1Invalid);
    }

    let max_signal = signals.iter().fold(0.0f64, |a, &b| a.max(b));
    let (t1_init, m0_init) = match fit_linear(signals, fa_degs, tr_ms, b1) {
        Ok(seed) => seed,
        Err(_) => (1000.0, 10.0 * max_signal.max(1.0)),
    };

    let lb = [1.0, 1.0e-6];
    let ub = [T1_MAX_MS, 1.0e9];
    let objective = |x: &[f64]| {
        let (t1, m0) = (x[0], x[1]);
        signals
            .iter()
            .zip(fa_degs.iter())
            .map(|(&s, &fa)| {
                let model = signal::signal_from_concentration(0.0, t1, m0, fa, tr_ms, b1, 1.0);
                (s - model) * (s - model)
            })
            .sum()
    };
    let best = optimise::fit_bound_constrained(
        &[t1_init, m0_init],
        &lb,
        &ub,
        objective,
        max_iters,
        FitterType::Bleic,
    );

    let (t1, m0) = (best[0], best[1]);
    if !(t1 > 0.0 && t1 < T1_MAX_MS) || !(m0 > 0.0) {
        return Err(ErrorCode::T1FitFail);
    }
    Ok((t1, m0))
}
