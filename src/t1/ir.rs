//! Inversion-recovery T1 fitting:
//! `S(TI) = M0·|1 - 2·exp(-TI/T1) + exp(-TR/T1)|`.

use crate::optimise::{self, FitterType};
use crate::tracker::ErrorCode;

use super::T1_MAX_MS;

fn ir_signal(t1: f64, m0: f64, ti: f64, tr: f64) -> f64 {
    m0 * (1.0 - 2.0 * (-ti / t1).exp() + (-tr / t1).exp()).abs()
}

/// Fit `(T1, M0)` from signals at the given inversion times. `tr_ms` is the
/// (long) repetition time, typically the `bigTR` override.
pub fn fit(
    signals: &[f64],
    ti_ms: &[f64],
    tr_ms: f64,
    max_iters: usize,
) -> Result<(f64, f64), ErrorCode> {
    let n = signals.len();
    if n < 3 || ti_ms.len() != n {
        return Err(ErrorCode::T1FitFail);
    }

    let max_signal = signals.iter().fold(0.0f64, |a, &b| a.max(b));
    if !(max_signal > 0.0) {
        return Err(ErrorCode::T1FitFail);
    }

    // the null crossing sits near TI = T1·ln2
    let (null_idx, _) = signals
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .expect("non-empty signals");
    let t1_init = (ti_ms[null_idx] / std::f64::consts::LN_2).clamp(10.0, T1_MAX_MS - 1.0);

    let lb = [1.0, 1.0e-6];
    let ub = [T1_MAX_MS, 1.0e9];
    let objective = |x: &[f64]| {
        signals
            .iter()
            .zip(ti_ms.iter())
            .map(|(&s, &ti)| {
                let model = ir_signal(x[0], x[1], ti, tr_ms);
                (s - model) * (s - model)
            })
            .sum()
    };
    // the abs() kink makes this a non-smooth objective
    let best = optimise::fit_bound_constrained(
        &[t1_init, max_signal],
        &lb,
        &ub,
        objective,
        max_iters,
        FitterType::Ns,
    );

    let (t1, m0) = (best[0], best[1]);
    if !(t1 > 0.0 && t1 < T1_MAX_MS) || !(m0 > 0.0) {
        return Err(ErrorCode::T1FitFail);
    }
    Ok((t1, m0))
}
