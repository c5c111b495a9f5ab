//! Patlak model: irreversible uptake plus a vascular term. Linear in both
//! free parameters, so it carries the reference LLS implementation.

use crate::aif::Aif;
use crate::errors::QmriError;

use super::{arterial_input, cum_trapz, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["Ktrans", "v_p", "tau_a"],
    init: &[0.2, 0.2, 0.0],
    lower: &[0.0, 0.0, 0.0],
    upper: &[10.0, 1.0, 0.5],
    default_fixed: &[2],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (ktrans, v_p, tau_a) = (params[0], params[1], params[2]);
    let n = ct.len();

    let c_a = arterial_input(aif, tau_a, n);
    let mut integral = vec![0.0; n];
    cum_trapz(aif.times(), &c_a, &mut integral);

    for i in 0..n {
        ct[i] = ktrans * integral[i] + v_p * c_a[i];
    }
}

/// Row-major N x 2 design `[∫Ca, Ca]`, solved for `[Ktrans, v_p]`.
pub fn lls_matrix(aif: &Aif, ct_data: &[f64]) -> Result<(Vec<f64>, usize), QmriError> {
    let n = ct_data.len();
    let c_a: Vec<f64> = aif.aif()?.iter().take(n).copied().collect();
    let mut integral = vec![0.0; n];
    cum_trapz(aif.times(), &c_a, &mut integral);

    let mut design = Vec::with_capacity(n * 2);
    for i in 0..n {
        design.push(integral[i]);
        design.push(c_a[i]);
    }
    Ok((design, 2))
}

pub fn transform_lls_solution(params: &mut [f64], solution: &[f64]) {
    params[0] = solution[0];
    params[1] = solution[1];
}
