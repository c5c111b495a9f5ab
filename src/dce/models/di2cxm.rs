//! Dual-input two-compartment exchange model, the 2CXM driven by a mixed
//! arterial/portal input.

use crate::aif::Aif;

use super::{dual_input, exp_conv, two_cxm, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["Fp", "PS", "v_e", "v_p", "f_a", "tau_a", "tau_v"],
    init: &[0.6, 0.2, 0.2, 0.2, 0.5, 0.0, 0.0],
    lower: &[0.0, 0.0, 1.0e-6, 1.0e-6, 0.0, 0.0, 0.0],
    upper: &[100.0, 100.0, 1.0, 1.0, 1.0, 0.5, 0.5],
    default_fixed: &[],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (fp, ps, v_e, v_p) = (params[0], params[1], params[2], params[3]);
    let (f_a, tau_a, tau_v) = (params[4], params[5], params[6]);
    let n = ct.len();

    let modes = match two_cxm::irf_modes(fp, ps, v_e, v_p) {
        Some(m) if m.0.is_finite() && m.1.is_finite() && m.2.is_finite() => m,
        _ => {
            ct.iter_mut().for_each(|c| *c = f64::NAN);
            return;
        }
    };
    let (k_pos, k_neg, a_frac) = modes;

    let c_in = dual_input(aif, f_a, tau_a, tau_v, n);
    let mut conv_pos = vec![0.0; n];
    exp_conv(k_pos, aif.times(), &c_in, &mut conv_pos);
    let mut conv_neg = vec![0.0; n];
    exp_conv(k_neg, aif.times(), &c_in, &mut conv_neg);

    for i in 0..n {
        ct[i] = fp * (a_frac * conv_pos[i] + (1.0 - a_frac) * conv_neg[i]);
    }
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use crate::aif::{Aif, AifType, PifType};

    use super::*;

    #[test]
    fn arterial_only_matches_single_input_model() {
        let n = 50;
        let mut aif = Aif::new(AifType::Pop, PifType::Pop);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        aif.set_prebolus(5).unwrap();
        aif.resample().unwrap();

        // f_a = 1 removes the portal contribution entirely
        let mut dual = vec![0.0; n];
        compute_ct(&[0.6, 0.2, 0.2, 0.1, 1.0, 0.0, 0.0], &aif, &mut dual);
        let mut single = vec![0.0; n];
        two_cxm::compute_ct(&[0.6, 0.2, 0.2, 0.1, 0.0], &aif, &mut single);
        for i in 0..n {
            assert_float_eq!(dual[i], single[i], abs <= 1e-12);
        }
    }
}
