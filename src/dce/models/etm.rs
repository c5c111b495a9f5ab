//! Extended Tofts model. `TOFTS` is this model with `v_p` pinned at zero.

use crate::aif::Aif;

use super::{dual_input, exp_conv, ParamTable};

/// Canonical index of `v_p`, pinned by the TOFTS alias.
pub const VP_INDEX: usize = 2;

pub static TABLE: ParamTable = ParamTable {
    names: &["Ktrans", "v_e", "v_p", "tau_a", "f_a"],
    init: &[0.2, 0.2, 0.2, 0.0, 1.0],
    lower: &[0.0, 1.0e-6, 0.0, 0.0, 0.0],
    upper: &[10.0, 1.0, 1.0, 0.5, 1.0],
    // f_a only participates when a portal input is bound
    default_fixed: &[4],
};

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (ktrans, v_e, v_p, tau_a, f_a) = (params[0], params[1], params[2], params[3], params[4]);
    let n = ct.len();

    let kep = ktrans / v_e;
    if !kep.is_finite() {
        ct.iter_mut().for_each(|c| *c = f64::NAN);
        return;
    }

    let c_in = dual_input(aif, f_a, tau_a, tau_a, n);
    let mut integral = vec![0.0; n];
    exp_conv(kep, aif.times(), &c_in, &mut integral);

    for i in 0..n {
        ct[i] = v_p * c_in[i] + ktrans * integral[i];
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use float_eq::assert_float_eq;

    use crate::aif::{Aif, AifType, PifType};
    use crate::dce::model::{create_model, DceModelKind, ModelOverrides};

    use super::*;

    fn impulse_aif(n: usize, spike: usize) -> Aif {
        // unit sample at one timepoint, file-type so no population shape
        let mut aif = Aif::new(AifType::File, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        let mut vals = vec![0.0; n];
        vals[spike] = 1.0;
        aif.set_base_aif(vals).unwrap();
        aif.set_aif_type(AifType::File);
        aif.resample().unwrap();
        aif
    }

    #[test]
    fn impulse_response_decays_at_kep() {
        // after the impulse has passed, the Tofts response is a pure
        // exponential with rate kep = Ktrans/v_e; the recursive integral
        // reproduces that decay exactly on the grid
        let n = 60;
        let aif = impulse_aif(n, 5);
        let params = [0.25, 0.5, 0.0, 0.0, 1.0];
        let mut ct = vec![0.0; n];
        compute_ct(&params, &aif, &mut ct);

        let kep: f64 = 0.25 / 0.5;
        let dt = 0.1;
        for i in 10..n {
            assert_float_eq!(ct[i], ct[i - 1] * (-kep * dt).exp(), abs <= 1e-12);
        }
        assert!(ct[6] > 0.0);
    }

    #[test]
    fn flat_input_gives_flat_ct() {
        let mut aif = Aif::new(AifType::File, PifType::None);
        aif.set_times((0..30).map(|i| i as f64 / 10.0).collect()).unwrap();
        aif.set_base_aif(vec![0.0; 30]).unwrap();
        aif.resample().unwrap();

        let params = [0.25, 0.5, 0.1, 0.0, 1.0];
        let mut ct = vec![1.0; 30];
        compute_ct(&params, &aif, &mut ct);
        assert!(ct.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn vp_adds_vascular_term() {
        let n = 40;
        let aif = impulse_aif(n, 5);
        let mut without_vp = vec![0.0; n];
        compute_ct(&[0.25, 0.5, 0.0, 0.0, 1.0], &aif, &mut without_vp);
        let mut with_vp = vec![0.0; n];
        compute_ct(&[0.25, 0.5, 0.1, 0.0, 1.0], &aif, &mut with_vp);
        let ca = aif.aif().unwrap();
        for i in 0..n {
            assert_float_eq!(with_vp[i], without_vp[i] + 0.1 * ca[i], abs <= 1e-12);
        }
    }

    #[test]
    fn model_instance_computes_through_cache() {
        let aif = Arc::new(impulse_aif(30, 5));
        let mut model =
            create_model(DceModelKind::Etm, aif, &ModelOverrides::default()).unwrap();
        model.reset(30);
        model.compute_ct(30);
        assert_eq!(model.ct_model().len(), 30);
        assert!(model.ct_model().iter().all(|c| c.is_finite()));
    }
}
