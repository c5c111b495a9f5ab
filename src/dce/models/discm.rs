//! Materne single-compartment dual-input model:
//! `dCt/dt = k1a·Ca(t-tau_a) + k1v·Cv(t-tau_v) - k2·Ct`.

use crate::aif::Aif;

use super::{exp_conv, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["k1a", "k1v", "k2", "tau_a", "tau_v"],
    init: &[0.2, 0.2, 0.2, 0.0, 0.0],
    lower: &[0.0, 0.0, 0.0, 0.0, 0.0],
    upper: &[10.0, 10.0, 10.0, 0.5, 0.5],
    default_fixed: &[],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (k1a, k1v, k2, tau_a, tau_v) = (params[0], params[1], params[2], params[3], params[4]);
    let n = ct.len();

    let c_a = match aif.resample_aif(tau_a) {
        Ok(v) => v,
        Err(_) => {
            ct.iter_mut().for_each(|c| *c = f64::NAN);
            return;
        }
    };
    let c_v = match aif.resample_pif(tau_v) {
        Ok(v) => v,
        Err(_) => {
            ct.iter_mut().for_each(|c| *c = f64::NAN);
            return;
        }
    };

    let driven: Vec<f64> = c_a
        .iter()
        .zip(c_v.iter())
        .take(n)
        .map(|(&a, &v)| k1a * a + k1v * v)
        .collect();

    exp_conv(k2, aif.times(), &driven, ct);
}
