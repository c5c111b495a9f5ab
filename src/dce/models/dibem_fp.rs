//! Bi-exponential model parameterised by total plasma flow `Fp` and the
//! fraction `E_pos` carried by the fast mode, so flow keeps its own map
//! rather than being split across the two mode amplitudes.

use crate::aif::Aif;

use super::{dibem, ParamTable};

pub static TABLE: ParamTable = ParamTable {
    names: &["Fp", "E_pos", "K_pos", "K_neg", "f_a", "tau_a", "tau_v"],
    init: &[0.6, 0.5, 0.5, 4.0, 0.5, 0.025, 0.0],
    lower: &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    upper: &[100.0, 1.0, 100.0, 100.0, 1.0, 0.5, 0.5],
    default_fixed: &[],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (fp, e_pos) = (params[0], params[1]);
    dibem::bi_exp(
        fp * e_pos,
        fp * (1.0 - e_pos),
        params[2],
        params[3],
        params[4],
        params[5],
        params[6],
        aif,
        ct,
    );
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use crate::aif::{Aif, AifType, PifType};

    use super::*;

    #[test]
    fn flow_split_matches_amplitude_form() {
        let n = 40;
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        aif.set_prebolus(4).unwrap();
        aif.resample().unwrap();

        let mut fp_form = vec![0.0; n];
        compute_ct(&[0.5, 0.4, 0.5, 4.0, 1.0, 0.0, 0.0], &aif, &mut fp_form);
        let mut amp_form = vec![0.0; n];
        dibem::compute_ct(&[0.2, 0.3, 0.5, 4.0, 1.0, 0.0, 0.0], &aif, &mut amp_form);
        for i in 0..n {
            assert_float_eq!(fp_form[i], amp_form[i], abs <= 1e-12);
        }
    }
}
