//! Two-compartment exchange model. The impulse response is the
//! bi-exponential `Fp·[A·exp(-K₊t) + (1-A)·exp(-K₋t)]` with the mode rates
//! derived from the physiological parameters.

use crate::aif::Aif;

use super::{arterial_input, exp_conv, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["Fp", "PS", "v_e", "v_p", "tau_a"],
    init: &[0.6, 0.2, 0.2, 0.2, 0.0],
    lower: &[0.0, 0.0, 1.0e-6, 1.0e-6, 0.0],
    upper: &[100.0, 100.0, 1.0, 1.0, 0.5],
    default_fixed: &[],
};

/// Bi-exponential decomposition `(k_pos, k_neg, a_frac)` of the 2CXM impulse
/// response for plasma flow `fp`, permeability `ps`, volumes `v_e`/`v_p`.
pub(super) fn irf_modes(fp: f64, ps: f64, v_e: f64, v_p: f64) -> Option<(f64, f64, f64)> {
    let k_e = ps / v_e;
    let k_p = (fp + ps) / v_p;
    let sum = k_p + k_e;
    let disc = sum * sum - 4.0 * k_e * fp / v_p;
    if !(disc >= 0.0) {
        return None;
    }
    let root = disc.sqrt();
    let k_pos = 0.5 * (sum + root);
    let k_neg = 0.5 * (sum - root);
    let a_frac = if k_pos > k_neg {
        (k_pos - k_e - ps / v_p) / (k_pos - k_neg)
    } else {
        1.0
    };
    Some((k_pos, k_neg, a_frac))
}

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (fp, ps, v_e, v_p, tau_a) = (params[0], params[1], params[2], params[3], params[4]);
    let n = ct.len();

    let modes = match irf_modes(fp, ps, v_e, v_p) {
        Some(m) if m.0.is_finite() && m.1.is_finite() && m.2.is_finite() => m,
        _ => {
            ct.iter_mut().for_each(|c| *c = f64::NAN);
            return;
        }
    };
    let (k_pos, k_neg, a_frac) = modes;

    let c_in = arterial_input(aif, tau_a, n);
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
    fn zero_permeability_collapses_to_vascular_compartment() {
        // PS = 0 leaves a single mode at Fp/v_p carrying all the weight
        let (k_pos, k_neg, a_frac) = irf_modes(0.5, 0.0, 0.2, 0.1).unwrap();
        assert_float_eq!(k_pos, 0.5 / 0.1, abs <= 1e-12);
        assert_float_eq!(k_neg, 0.0, abs <= 1e-12);
        assert_float_eq!(a_frac, 1.0, abs <= 1e-12);
    }

    #[test]
    fn impulse_response_starts_at_fp() {
        // H(0) = Fp regardless of the mode split
        let (_, _, a_frac) = irf_modes(0.7, 0.3, 0.25, 0.15).unwrap();
        assert!(a_frac.is_finite());
        // weights always sum to 1 by construction: A + (1-A)
        assert!((0.0..=1.0).contains(&a_frac));
    }

    #[test]
    fn response_to_impulse_is_positive_and_decaying_tail() {
        let n = 80;
        let mut aif = Aif::new(AifType::File, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        let mut vals = vec![0.0; n];
        vals[4] = 1.0;
        aif.set_base_aif(vals).unwrap();
        aif.set_aif_type(AifType::File);
        aif.resample().unwrap();

        let mut ct = vec![0.0; n];
        compute_ct(&[0.6, 0.2, 0.2, 0.1, 0.0], &aif, &mut ct);
        assert!(ct.iter().all(|c| c.is_finite()));
        assert!(ct[6] > 0.0);
        // tail decays once the input has passed
        assert!(ct[40] > ct[79]);
    }
}
