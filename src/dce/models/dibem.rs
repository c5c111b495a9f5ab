//! Dual-input bi-exponential model: the impulse response is specified
//! directly as two exponential modes rather than derived from physiology.

use crate::aif::Aif;

use super::{dual_input, exp_conv, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["F_pos", "F_neg", "K_pos", "K_neg", "f_a", "tau_a", "tau_v"],
    init: &[0.2, 0.2, 0.5, 4.0, 0.5, 0.025, 0.0],
    lower: &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    upper: &[100.0, 100.0, 100.0, 100.0, 1.0, 0.5, 0.5],
    default_fixed: &[],
};

pub(super) fn bi_exp(
    f_pos: f64,
    f_neg: f64,
    k_pos: f64,
    k_neg: f64,
    f_a: f64,
    tau_a: f64,
    tau_v: f64,
    aif: &Aif,
    ct: &mut [f64],
) {
    let n = ct.len();
    let c_in = dual_input(aif, f_a, tau_a, tau_v, n);

    let mut conv_pos = vec![0.0; n];
    exp_conv(k_pos, aif.times(), &c_in, &mut conv_pos);
    let mut conv_neg = vec![0.0; n];
    exp_conv(k_neg, aif.times(), &c_in, &mut conv_neg);

    for i in 0..n {
        ct[i] = f_pos * conv_pos[i] + f_neg * conv_neg[i];
    }
}

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    bi_exp(
        params[0], params[1], params[2], params[3], params[4], params[5], params[6], aif, ct,
    );
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use crate::aif::{Aif, AifType, PifType};

    use super::*;

    #[test]
    fn modes_superpose() {
        let n = 40;
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        aif.set_prebolus(4).unwrap();
        aif.resample().unwrap();

        let mut pos_only = vec![0.0; n];
        compute_ct(&[0.3, 0.0, 0.5, 4.0, 1.0, 0.0, 0.0], &aif, &mut pos_only);
        let mut neg_only = vec![0.0; n];
        compute_ct(&[0.0, 0.2, 0.5, 4.0, 1.0, 0.0, 0.0], &aif, &mut neg_only);
        let mut both = vec![0.0; n];
        compute_ct(&[0.3, 0.2, 0.5, 4.0, 1.0, 0.0, 0.0], &aif, &mut both);
        for i in 0..n {
            assert_float_eq!(both[i], pos_only[i] + neg_only[i], abs <= 1e-12);
        }
    }
}
