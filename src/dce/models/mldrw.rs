//! Local density random walk model: the input function is itself
//! parameterised (a travelling LDRW bolus shape) rather than sampled from
//! the shared AIF, with a Tofts-style leakage term on top.

use std::f64::consts::PI;

use crate::aif::Aif;

use super::ParamTable;

pub static TABLE: ParamTable = ParamTable {
    names: &["alpha", "kappa", "MTT", "Ktrans", "kep"],
    init: &[0.2, 0.2, 0.2, 0.2, 0.2],
    lower: &[0.0, 0.0, 0.0, 0.0, 0.0],
    upper: &[100.0, 100.0, 100.0, 100.0, 100.0],
    default_fixed: &[],
};

/// LDRW bolus shape at time `t`.
fn input_function(alpha: f64, kappa: f64, mtt: f64, t: f64) -> f64 {
    alpha * (kappa / (2.0 * PI * t)).sqrt() * (-kappa * (t - mtt).powi(2) / (2.0 * t)).exp()
}

pub fn compute_ct(params: &[f64], aif: &Aif, ct: &mut [f64]) {
    let (alpha, kappa, mtt, ktrans, kep) = (params[0], params[1], params[2], params[3], params[4]);
    let n = ct.len();
    if n == 0 {
        return;
    }
    let times = aif.times();

    ct.iter_mut().for_each(|c| *c = 0.0);
    if params.iter().any(|p| p.is_nan()) {
        return;
    }

    let mut c_a = vec![0.0; n];
    let mut integral = 0.0;
    for i in 1..n {
        c_a[i] = input_function(alpha, kappa, mtt, times[i]);

        let delta_t = times[i] - times[i - 1];
        let e_delta = (-kep * delta_t).exp();
        let a = delta_t * 0.5 * (c_a[i] + c_a[i - 1] * e_delta);

        integral = integral * e_delta + a;
        let c_t = c_a[i] + ktrans * integral;

        if c_t.is_nan() {
            return;
        }
        ct[i] = c_t;
    }
}

#[cfg(test)]
mod test {
    use crate::aif::{Aif, AifType, PifType};

    use super::*;

    #[test]
    fn bolus_peaks_near_mean_transit_time() {
        let n = 100;
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 20.0).collect()).unwrap();
        aif.resample().unwrap();

        let mtt = 1.5;
        let mut ct = vec![0.0; n];
        compute_ct(&[1.0, 4.0, mtt, 0.0, 0.2], &aif, &mut ct);

        let peak = ct
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        let t_peak = peak as f64 / 20.0;
        assert!((t_peak - mtt).abs() < 0.5, "peak at {t_peak}, MTT {mtt}");
        assert!(ct.iter().all(|c| c.is_finite()));
    }
}
