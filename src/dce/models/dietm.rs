//! Dual-input extended Tofts model.

use crate::aif::Aif;

use super::{dual_input, exp_conv, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["Ktrans", "v_e", "v_p", "f_a", "tau_a", "tau_v"],
    init: &[0.2, 0.2, 0.2, 0.5, 0.0, 0.0],
    lower: &[0.0, 1.0e-6, 0.0, 0.0, 0.0, 0.0],
    upper: &[10.0, 1.0, 1.0, 1.0, 0.5, 0.5],
    default_fixed: &[],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (ktrans, v_e, v_p) = (params[0], params[1], params[2]);
    let (f_a, tau_a, tau_v) = (params[3], params[4], params[5]);
    let n = ct.len();

    let kep = ktrans / v_e;
    if !kep.is_finite() {
        ct.iter_mut().for_each(|c| *c = f64::NAN);
        return;
    }

    let c_in = dual_input(aif, f_a, tau_a, tau_v, n);
    let mut integral = vec![0.0; n];
    exp_conv(kep, aif.times(), &c_in, &mut integral);

    for i in 0..n {
        ct[i] = v_p * c_in[i] + ktrans * integral[i];
    }
}
