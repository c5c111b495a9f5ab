//! Bound-constrained minimisation behind a thin adapter so the model fitter
//! never sees the backend details. Two gradient-free/finite-difference
//! backends are provided plus a weighted linear least-squares facade for
//! models that can be linearised.

use nalgebra::{DMatrix, DVector};

use crate::errors::QmriError;

/// Sentinel objective value for invalid parameter sets. Finite-difference
/// probes and line searches treat it as +inf, which preserves optimiser
/// monotonicity.
pub const BAD_FIT_SSD: f64 = f64::MAX;

/// Finite-difference step shared by both non-linear backends.
const DIFF_STEP: f64 = 1.0e-4;

/// Optimiser backends. `Lls` is only valid for models exposing a design
/// matrix; the model fitter routes it before reaching this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitterType {
    Lls,
    Bleic,
    Ns,
}

impl FitterType {
    pub fn parse(s: &str) -> Result<Self, QmriError> {
        match s {
            "LLS" => Ok(FitterType::Lls),
            "BLEIC" => Ok(FitterType::Bleic),
            "NS" => Ok(FitterType::Ns),
            _ => Err(QmriError::config(format!(
                "optimisation type ({s}) is not recognised, must be one of LLS, BLEIC or NS"
            ))),
        }
    }

    pub fn valid_types() -> &'static [&'static str] {
        &["LLS", "BLEIC", "NS"]
    }
}

fn clamp(x: &mut [f64], lb: &[f64], ub: &[f64]) {
    for i in 0..x.len() {
        x[i] = x[i].max(lb[i]).min(ub[i]);
    }
}

fn eval<F: FnMut(&[f64]) -> f64>(f: &mut F, x: &[f64]) -> f64 {
    let v = f(x);
    if v.is_finite() {
        v
    } else {
        BAD_FIT_SSD
    }
}

/// Minimise `f` over the box `[lb, ub]` starting at `x0`.
///
/// Returns the best parameter vector seen; returning the unimproved `x0` is a
/// valid outcome. No retries happen here, the caller decides what a bad fit
/// means.
pub fn fit_bound_constrained<F>(
    x0: &[f64],
    lb: &[f64],
    ub: &[f64],
    mut f: F,
    max_iters: usize,
    backend: FitterType,
) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    if x0.is_empty() {
        return Vec::new();
    }
    let max_iters = if max_iters == 0 { 500 } else { max_iters };
    match backend {
        FitterType::Bleic => projected_gradient(x0, lb, ub, &mut f, max_iters),
        FitterType::Ns => nelder_mead(x0, lb, ub, &mut f, max_iters),
        FitterType::Lls => x0.to_vec(),
    }
}

/// Projected gradient descent with a backtracking line search, forward
/// differences of step `DIFF_STEP`.
fn projected_gradient<F>(x0: &[f64], lb: &[f64], ub: &[f64], f: &mut F, max_iters: usize) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    clamp(&mut x, lb, ub);
    let mut fx = eval(f, &x);
    if fx == BAD_FIT_SSD {
        return x0.to_vec();
    }

    let mut grad = vec![0.0; n];
    for _ in 0..max_iters {
        // forward-difference gradient, probes clamped into the box
        let mut max_g = 0.0f64;
        for i in 0..n {
            let h = DIFF_STEP * x[i].abs().max(1.0);
            let mut probe = x.clone();
            probe[i] = (probe[i] + h).min(ub[i]);
            let dh = probe[i] - x[i];
            if dh == 0.0 {
                // pinned at the upper bound, probe downwards instead
                probe[i] = (x[i] - h).max(lb[i]);
                let dl = x[i] - probe[i];
                grad[i] = if dl > 0.0 {
                    (fx - eval(f, &probe)) / dl
                } else {
                    0.0
                };
            } else {
                grad[i] = (eval(f, &probe) - fx) / dh;
            }
            max_g = max_g.max(grad[i].abs());
        }
        if max_g < 1.0e-8 {
            break;
        }

        // backtracking line search along -grad
        let mut alpha = 1.0 / max_g;
        let mut improved = false;
        for _ in 0..40 {
            let mut cand = x.clone();
            for i in 0..n {
                cand[i] -= alpha * grad[i];
            }
            clamp(&mut cand, lb, ub);
            let fc = eval(f, &cand);
            if fc < fx {
                x = cand;
                fx = fc;
                improved = true;
                break;
            }
            alpha *= 0.5;
        }
        if !improved {
            break;
        }
    }
    x
}

/// Bound-clipped Nelder-Mead. Used as the non-smooth backend: no gradients,
/// so objectives with kinks (clamped parameters, abs terms) still descend.
fn nelder_mead<F>(x0: &[f64], lb: &[f64], ub: &[f64], f: &mut F, max_iters: usize) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    let mut start = x0.to_vec();
    clamp(&mut start, lb, ub);

    // initial simplex: start point plus one perturbed vertex per dimension
    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(start.clone());
    for i in 0..n {
        let mut v = start.clone();
        let span = (ub[i] - lb[i]).abs();
        let step = if span.is_finite() && span > 0.0 {
            (0.1 * span).min(0.1 * v[i].abs().max(0.1))
        } else {
            0.1 * v[i].abs().max(0.1)
        };
        v[i] += step;
        clamp(&mut v, lb, ub);
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| eval(f, v)).collect();

    for _ in 0..max_iters {
        // order best..worst
        let mut order: Vec<usize> = (0..=n).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        let best = order[0];
        let worst = order[n];
        let second_worst = order[n - 1];

        if values[worst] - values[best] < 1.0e-12 {
            break;
        }

        // centroid of all but worst
        let mut centroid = vec![0.0; n];
        for &idx in order.iter().take(n) {
            for i in 0..n {
                centroid[i] += simplex[idx][i];
            }
        }
        for c in centroid.iter_mut() {
            *c /= n as f64;
        }

        let blend = |a: &[f64], b: &[f64], t: f64| -> Vec<f64> {
            let mut v: Vec<f64> = a
                .iter()
                .zip(b.iter())
                .map(|(&ai, &bi)| ai + t * (ai - bi))
                .collect();
            clamp(&mut v, lb, ub);
            v
        };

        // reflect
        let reflected = blend(&centroid, &simplex[worst], 1.0);
        let f_ref = eval(f, &reflected);
        if f_ref < values[best] {
            // expand
            let expanded = blend(&centroid, &simplex[worst], 2.0);
            let f_exp = eval(f, &expanded);
            if f_exp < f_ref {
                simplex[worst] = expanded;
                values[worst] = f_exp;
            } else {
                simplex[worst] = reflected;
                values[worst] = f_ref;
            }
            continue;
        }
        if f_ref < values[second_worst] {
            simplex[worst] = reflected;
            values[worst] = f_ref;
            continue;
        }

        // contract
        let contracted = blend(&centroid, &simplex[worst], -0.5);
        let f_con = eval(f, &contracted);
        if f_con < values[worst] {
            simplex[worst] = contracted;
            values[worst] = f_con;
            continue;
        }

        // shrink towards best
        let best_vertex = simplex[best].clone();
        for idx in 0..=n {
            if idx == best {
                continue;
            }
            for i in 0..n {
                simplex[idx][i] = best_vertex[i] + 0.5 * (simplex[idx][i] - best_vertex[i]);
            }
            clamp(&mut simplex[idx], lb, ub);
            values[idx] = eval(f, &simplex[idx]);
        }
    }

    let mut best = 0;
    for i in 1..=n {
        if values[i] < values[best] {
            best = i;
        }
    }
    simplex.swap_remove(best)
}

/// Solve `W·C = W·A·B` for `B`: rows of the design and observation are scaled
/// by the weights, then the plain least-squares problem goes through SVD.
pub fn fit_linear_weighted(
    a: &DMatrix<f64>,
    c: &DVector<f64>,
    weights: &[f64],
) -> Result<DVector<f64>, QmriError> {
    let n = a.nrows();
    if c.len() != n || weights.len() != n {
        return Err(QmriError::config(format!(
            "linear fit size mismatch: design {n} rows, {} observations, {} weights",
            c.len(),
            weights.len()
        )));
    }
    let mut aw = a.clone();
    let mut cw = c.clone();
    for i in 0..n {
        let w = weights[i];
        for j in 0..a.ncols() {
            aw[(i, j)] *= w;
        }
        cw[i] *= w;
    }
    aw.svd(true, true)
        .solve(&cw, 1.0e-12)
        .map_err(|e| QmriError::config(format!("weighted linear solve failed: {e}")))
}
