//! Per-voxel bolus handling: signal→concentration conversion, IAUC and the
//! enhancement test.

use itertools::Itertools;
use statrs::statistics::Statistics;

use crate::signal;
use crate::tracker::ErrorCode;

/// Multiple of the pre-bolus standard deviation a post-bolus peak must clear
/// to count as enhancing.
const ENHANCEMENT_SIGMA: f64 = 3.0;

/// Mutually exclusive per-voxel states. Only `Ok` and `DynT1Bad` trigger a
/// model fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelStatus {
    Ok,
    DynT1Bad,
    NonEnhancing,
    DceInvalidInput,
}

impl VoxelStatus {
    pub fn fittable(self) -> bool {
        matches!(self, VoxelStatus::Ok | VoxelStatus::DynT1Bad)
    }
}

/// How M0 is obtained when inverting the SPGR equation.
#[derive(Debug, Clone, Copy)]
pub enum M0Mode {
    /// Explicit per-voxel M0, from an M0 map.
    Value(f64),
    /// Derive M0 from the mean pre-bolus signal and the SPGR scale factor.
    Ratio,
}

#[derive(Debug, Clone)]
pub struct DceVoxel {
    signal_data: Vec<f64>,
    ct_data: Vec<f64>,
    prebolus: usize,
    times: Vec<f64>,
    iauc_times: Vec<f64>,
    iauc_at_peak: bool,
    status: VoxelStatus,
    iauc_vals: Vec<f64>,
    enhancing: bool,
}

impl DceVoxel {
    /// `times` and `iauc_times` are minutes; `ct_data` may be empty when the
    /// concentrations are computed from `signal_data` later.
    pub fn new(
        signal_data: Vec<f64>,
        ct_data: Vec<f64>,
        prebolus: usize,
        times: Vec<f64>,
        iauc_times: Vec<f64>,
        iauc_at_peak: bool,
    ) -> Self {
        DceVoxel {
            signal_data,
            ct_data,
            prebolus,
            times,
            iauc_times,
            iauc_at_peak,
            status: VoxelStatus::Ok,
            iauc_vals: Vec::new(),
            enhancing: true,
        }
    }

    pub fn status(&self) -> VoxelStatus {
        self.status
    }

    pub fn set_status(&mut self, status: VoxelStatus) {
        self.status = status;
    }

    pub fn ct_data(&self) -> &[f64] {
        &self.ct_data
    }

    pub fn signal_data(&self) -> &[f64] {
        &self.signal_data
    }

    pub fn iauc_vals(&self) -> &[f64] {
        &self.iauc_vals
    }

    pub fn enhancing(&self) -> bool {
        self.enhancing
    }

    /// Fill `ct_data` from `signal_data` by SPGR inversion. Any
    /// non-invertible sample poisons the voxel: status becomes
    /// `DceInvalidInput` and the returned code says why.
    pub fn compute_ct_from_signal(
        &mut self,
        t1: f64,
        fa_deg: f64,
        tr_ms: f64,
        r1: f64,
        m0: M0Mode,
        b1: f64,
    ) -> ErrorCode {
        if signal::effective_alpha(fa_deg, b1).is_none() {
            self.status = VoxelStatus::DceInvalidInput;
            return ErrorCode::B1Invalid;
        }
        if !(t1 > 0.0) || !t1.is_finite() {
            self.status = VoxelStatus::DceInvalidInput;
            return ErrorCode::DceInvalidInput;
        }

        let m0_value = match m0 {
            M0Mode::Value(v) => v,
            M0Mode::Ratio => {
                let prebolus = self.prebolus.min(self.signal_data.len());
                if prebolus == 0 {
                    self.status = VoxelStatus::DceInvalidInput;
                    return ErrorCode::DceInvalidInput;
                }
                let mean_s = self.signal_data[..prebolus].iter().sum::<f64>() / prebolus as f64;
                mean_s / signal::baseline_scale(t1, fa_deg, tr_ms, b1)
            }
        };
        if !m0_value.is_finite() || m0_value <= 0.0 {
            self.status = VoxelStatus::DceInvalidInput;
            return ErrorCode::DceInvalidInput;
        }

        self.ct_data = self
            .signal_data
            .iter()
            .map(|&s| signal::concentration_from_signal(s, t1, m0_value, fa_deg, tr_ms, b1, r1))
            .collect();

        if self.ct_data.iter().any(|c| !c.is_finite()) {
            self.status = VoxelStatus::DceInvalidInput;
            return ErrorCode::CaIsNan;
        }
        ErrorCode::Ok
    }

    /// Trapezoidal `∫ Ct dτ` from the bolus over each requested window, plus
    /// one more to the Ct peak when configured.
    pub fn compute_iauc(&mut self) {
        let t_bolus = self.times.get(self.prebolus).copied().unwrap_or(0.0);
        self.iauc_vals = self
            .iauc_times
            .iter()
            .map(|&w| self.integrate(t_bolus, t_bolus + w))
            .collect();

        if self.iauc_at_peak {
            let peak = self
                .ct_data
                .iter()
                .copied()
                .position_max_by(f64::total_cmp)
                .unwrap_or(0);
            let t_peak = self.times.get(peak).copied().unwrap_or(t_bolus);
            self.iauc_vals.push(self.integrate(t_bolus, t_peak));
        }
    }

    /// Classify the voxel as enhancing: the post-bolus peak must clear the
    /// pre-bolus level by a multiple of the pre-bolus noise.
    pub fn test_enhancing(&mut self) {
        let prebolus = self.prebolus.min(self.ct_data.len());
        if prebolus == 0 || prebolus >= self.ct_data.len() {
            return;
        }
        let pre = &self.ct_data[..prebolus];
        let mean = pre.mean();
        let std = if prebolus > 1 { pre.std_dev() } else { 0.0 };
        let max_post = self.ct_data[prebolus..]
            .iter()
            .fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        self.enhancing = max_post > mean + ENHANCEMENT_SIGMA * std;
        if !self.enhancing {
            self.status = VoxelStatus::NonEnhancing;
        }
    }

    /// Trapezium quadrature of Ct over `[from, to]`, end point interpolated
    /// onto the grid.
    fn integrate(&self, from: f64, to: f64) -> f64 {
        let n = self.ct_data.len().min(self.times.len());
        if n < 2 || to <= from {
            return 0.0;
        }
        let mut total = 0.0;
        for i in 1..n {
            let (t0, t1) = (self.times[i - 1], self.times[i]);
            if t1 <= from {
                continue;
            }
            if t0 >= to {
                break;
            }
            let (c0, c1) = (self.ct_data[i - 1], self.ct_data[i]);
            let interp = |t: f64| c0 + (c1 - c0) * (t - t0) / (t1 - t0);
            let lo = t0.max(from);
            let hi = t1.min(to);
            total += (hi - lo) * 0.5 * (interp(lo) + interp(hi));
        }
        total
    }
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    fn minute_grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / 10.0).collect()
    }

    #[test]
    fn iauc_of_constant_concentration() {
        let n = 40;
        let mut voxel = DceVoxel::new(
            vec![],
            vec![2.0; n],
            10,
            minute_grid(n),
            vec![1.0],
            false,
        );
        voxel.compute_iauc();
        // constant Ct of 2 over a 1 minute window
        assert_float_eq!(voxel.iauc_vals()[0], 2.0, abs <= 1e-9);
    }

    #[test]
    fn iauc_window_is_clipped_to_the_run() {
        let n = 20;
        let mut voxel = DceVoxel::new(
            vec![],
            vec![1.0; n],
            10,
            minute_grid(n),
            vec![5.0],
            false,
        );
        voxel.compute_iauc();
        // only 0.9 minutes of data remain after the bolus
        assert_float_eq!(voxel.iauc_vals()[0], 0.9, abs <= 1e-9);
    }

    #[test]
    fn flat_series_is_non_enhancing() {
        let n = 60;
        let mut voxel = DceVoxel::new(vec![], vec![0.0; n], 8, minute_grid(n), vec![], false);
        voxel.test_enhancing();
        assert!(!voxel.enhancing());
        assert_eq!(voxel.status(), VoxelStatus::NonEnhancing);
    }

    #[test]
    fn step_series_is_enhancing() {
        let n = 60;
        let mut ct: Vec<f64> = (0..n)
            .map(|i| if i < 8 { 0.01 * (i % 2) as f64 } else { 1.0 })
            .collect();
        ct[0] = 0.0;
        let mut voxel = DceVoxel::new(vec![], ct, 8, minute_grid(n), vec![], false);
        voxel.test_enhancing();
        assert!(voxel.enhancing());
        assert_eq!(voxel.status(), VoxelStatus::Ok);
    }

    #[test]
    fn signal_round_trip_recovers_concentration() {
        let n = 30;
        let (t1, m0, fa, tr, b1, r1) = (1000.0, 1500.0, 20.0, 3.5, 1.0, 3.4);
        let truth: Vec<f64> = (0..n).map(|i| if i < 8 { 0.0 } else { 0.8 }).collect();
        let signals: Vec<f64> = truth
            .iter()
            .map(|&ct| crate::signal::signal_from_concentration(ct, t1, m0, fa, tr, b1, r1))
            .collect();

        let mut voxel = DceVoxel::new(signals, vec![], 8, minute_grid(n), vec![], false);
        let code = voxel.compute_ct_from_signal(t1, fa, tr, r1, M0Mode::Value(m0), b1);
        assert_eq!(code, ErrorCode::Ok);
        for (got, want) in voxel.ct_data().iter().zip(truth.iter()) {
            assert_float_eq!(*got, *want, abs <= 1e-9);
        }

        // ratio mode recovers the same M0 from the flat baseline
        let mut ratio_voxel = DceVoxel::new(
            voxel.signal_data().to_vec(),
            vec![],
            8,
            minute_grid(n),
            vec![],
            false,
        );
        let code = ratio_voxel.compute_ct_from_signal(t1, fa, tr, r1, M0Mode::Ratio, b1);
        assert_eq!(code, ErrorCode::Ok);
        for (got, want) in ratio_voxel.ct_data().iter().zip(truth.iter()) {
            assert_float_eq!(*got, *want, abs <= 1e-6);
        }
    }

    #[test]
    fn bad_b1_flags_voxel() {
        let mut voxel = DceVoxel::new(vec![1.0; 10], vec![], 2, minute_grid(10), vec![], false);
        let code = voxel.compute_ct_from_signal(1000.0, 20.0, 3.5, 3.4, M0Mode::Ratio, 0.0);
        assert_eq!(code, ErrorCode::B1Invalid);
        assert_eq!(voxel.status(), VoxelStatus::DceInvalidInput);
    }
}
