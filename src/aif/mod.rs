//! Arterial (and portal) input functions sampled on the dynamic time grid.
//!
//! Times are minutes from the start of the dynamic run. The AIF must be bound
//! to the grid with [`Aif::set_times`] and populated with [`Aif::resample`]
//! before any model samples it.

pub mod detect;

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::errors::QmriError;

/// Source of the arterial input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AifType {
    /// Parker population AIF.
    Pop,
    /// Two-column text file.
    File,
    /// Derived from the mean Ct of voxels selected in an AIF voxel map.
    Map,
    /// Weinmann bi-exponential standard AIF.
    Std,
}

/// Source of the portal input for dual-input models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PifType {
    Pop,
    File,
    None,
}

/// Voxel classes written to the auto-AIF voxel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AifMapVoxel {
    NotConsidered = 0,
    Candidate = 1,
    Selected = 2,
    PeakTooEarly = 3,
    PeakTooLate = 4,
    DoubleDip = 5,
    BelowNoiseThresh = 6,
}

// Parker population AIF (Parker et al, MRM 2006), times in minutes, output in
// mM for the standard 0.1 mmol/kg dose before dose/haematocrit scaling.
const PARKER_A1: f64 = 0.809;
const PARKER_A2: f64 = 0.330;
const PARKER_T1: f64 = 0.17046;
const PARKER_T2: f64 = 0.365;
const PARKER_SIGMA1: f64 = 0.0563;
const PARKER_SIGMA2: f64 = 0.132;
const PARKER_ALPHA: f64 = 1.050;
const PARKER_BETA: f64 = 0.1685;
const PARKER_S: f64 = 38.078;
const PARKER_TAU: f64 = 0.483;

// Weinmann standard AIF constants (kg/l and min^-1).
const STD_A1: f64 = 3.99;
const STD_A2: f64 = 4.78;
const STD_M1: f64 = 0.144;
const STD_M2: f64 = 0.0111;

// Population PIF: the AIF dispersed through an exponential transit kernel
// and delayed, an approximation to a measured portal-vein input.
const PIF_DELAY: f64 = 0.1;
const PIF_DISPERSION: f64 = 0.08;

#[derive(Debug, Clone)]
pub struct Aif {
    aif_type: AifType,
    pif_type: PifType,
    times: Vec<f64>,
    base_aif: Vec<f64>,
    aif: Vec<f64>,
    pif: Vec<f64>,
    prebolus: usize,
    hct: f64,
    dose: f64,
}

impl Default for Aif {
    fn default() -> Self {
        Aif {
            aif_type: AifType::Pop,
            pif_type: PifType::None,
            times: Vec::new(),
            base_aif: Vec::new(),
            aif: Vec::new(),
            pif: Vec::new(),
            prebolus: 0,
            hct: 0.42,
            dose: 0.1,
        }
    }
}

impl Aif {
    pub fn new(aif_type: AifType, pif_type: PifType) -> Self {
        Aif {
            aif_type,
            pif_type,
            ..Aif::default()
        }
    }

    pub fn aif_type(&self) -> AifType {
        self.aif_type
    }

    pub fn pif_type(&self) -> PifType {
        self.pif_type
    }

    pub fn set_aif_type(&mut self, aif_type: AifType) {
        self.aif_type = aif_type;
    }

    pub fn set_pif_type(&mut self, pif_type: PifType) {
        self.pif_type = pif_type;
    }

    /// Bind the dynamic time grid (minutes). Must precede resampling.
    pub fn set_times(&mut self, times: Vec<f64>) -> Result<(), QmriError> {
        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(QmriError::config("dynamic times must be non-decreasing"));
        }
        self.times = times;
        Ok(())
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn num_times(&self) -> usize {
        self.times.len()
    }

    pub fn set_prebolus(&mut self, prebolus: usize) -> Result<(), QmriError> {
        if !self.times.is_empty() && prebolus >= self.times.len() {
            return Err(QmriError::config(format!(
                "prebolus image {prebolus} outside dynamic series of {}",
                self.times.len()
            )));
        }
        self.prebolus = prebolus;
        Ok(())
    }

    pub fn prebolus(&self) -> usize {
        self.prebolus
    }

    pub fn set_hct(&mut self, hct: f64) -> Result<(), QmriError> {
        if !(hct > 0.0 && hct < 1.0) {
            return Err(QmriError::config(format!(
                "haematocrit must be in (0,1), got {hct}"
            )));
        }
        self.hct = hct;
        Ok(())
    }

    pub fn hct(&self) -> f64 {
        self.hct
    }

    pub fn set_dose(&mut self, dose: f64) -> Result<(), QmriError> {
        if !(dose > 0.0) {
            return Err(QmriError::config(format!("dose must be positive, got {dose}")));
        }
        self.dose = dose;
        Ok(())
    }

    pub fn dose(&self) -> f64 {
        self.dose
    }

    /// Install a voxel-map-derived base AIF, same length as the grid.
    pub fn set_base_aif(&mut self, vals: Vec<f64>) -> Result<(), QmriError> {
        if !self.times.is_empty() && vals.len() != self.times.len() {
            return Err(QmriError::config(format!(
                "base AIF length {} does not match dynamic grid length {}",
                vals.len(),
                self.times.len()
            )));
        }
        self.base_aif = vals;
        self.aif_type = AifType::Map;
        Ok(())
    }

    /// Load a two-column `time value` file; must contain exactly `n` rows.
    pub fn read_aif(&mut self, path: impl AsRef<Path>, n: usize) -> Result<(), QmriError> {
        let vals = read_two_column(path.as_ref(), n)?;
        self.base_aif = vals;
        self.aif_type = AifType::File;
        Ok(())
    }

    pub fn read_pif(&mut self, path: impl AsRef<Path>, n: usize) -> Result<(), QmriError> {
        let vals = read_two_column(path.as_ref(), n)?;
        self.pif = vals;
        self.pif_type = PifType::File;
        Ok(())
    }

    /// Emit `time value` lines for the resampled AIF.
    pub fn write_aif(&self, path: impl AsRef<Path>) -> Result<(), QmriError> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| QmriError::io(path, e))?;
        for (t, v) in self.times.iter().zip(self.aif.iter()) {
            writeln!(file, "{t:.6}\t{v:.9}").map_err(|e| QmriError::io(path, e))?;
        }
        Ok(())
    }

    /// Populate the sample vectors from the configured sources. Must be
    /// called after the grid is bound and before any sampling.
    pub fn resample(&mut self) -> Result<(), QmriError> {
        if self.times.is_empty() {
            return Err(QmriError::config(
                "AIF sampled before dynamic time grid was set",
            ));
        }
        let t_prebolus = self.times[self.prebolus];
        self.aif = match self.aif_type {
            AifType::Pop => self
                .times
                .iter()
                .map(|&t| self.parker(t - t_prebolus))
                .collect(),
            AifType::Std => self
                .times
                .iter()
                .map(|&t| self.weinmann(t - t_prebolus))
                .collect(),
            AifType::File => {
                if self.base_aif.len() != self.times.len() {
                    return Err(QmriError::config("AIF file not loaded for dynamic grid"));
                }
                self.base_aif.clone()
            }
            AifType::Map => {
                if self.base_aif.len() != self.times.len() {
                    return Err(QmriError::config("AIF map values not set for dynamic grid"));
                }
                // voxel Ct is tissue concentration, convert to blood plasma
                let scale = 1.0 / (1.0 - self.hct);
                self.base_aif.iter().map(|&v| v * scale).collect()
            }
        };

        self.pif = match self.pif_type {
            PifType::None => vec![0.0; self.times.len()],
            PifType::File => {
                if self.pif.len() != self.times.len() {
                    return Err(QmriError::config("PIF file not loaded for dynamic grid"));
                }
                self.pif.clone()
            }
            PifType::Pop => self.disperse_aif(),
        };
        Ok(())
    }

    /// The populated AIF samples. `resample` must have run.
    pub fn aif(&self) -> Result<&[f64], QmriError> {
        if self.aif.len() != self.times.len() || self.times.is_empty() {
            return Err(QmriError::config(
                "AIF sampled before dynamic time grid was set",
            ));
        }
        Ok(&self.aif)
    }

    pub fn pif(&self) -> Result<&[f64], QmriError> {
        if self.pif.len() != self.times.len() || self.times.is_empty() {
            return Err(QmriError::config(
                "PIF sampled before dynamic time grid was set",
            ));
        }
        Ok(&self.pif)
    }

    /// AIF delayed by `tau` minutes, linearly interpolated on the grid.
    pub fn resample_aif(&self, tau: f64) -> Result<Vec<f64>, QmriError> {
        Ok(resample_delayed(self.times(), self.aif()?, tau))
    }

    pub fn resample_pif(&self, tau: f64) -> Result<Vec<f64>, QmriError> {
        Ok(resample_delayed(self.times(), self.pif()?, tau))
    }

    fn parker(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let gauss = |a: f64, tc: f64, sigma: f64| {
            a / (sigma * (2.0 * std::f64::consts::PI).sqrt())
                * (-(t - tc).powi(2) / (2.0 * sigma * sigma)).exp()
        };
        let sigmoid = PARKER_ALPHA * (-PARKER_BETA * t).exp()
            / (1.0 + (-PARKER_S * (t - PARKER_TAU)).exp());
        let ca = gauss(PARKER_A1, PARKER_T1, PARKER_SIGMA1)
            + gauss(PARKER_A2, PARKER_T2, PARKER_SIGMA2)
            + sigmoid;
        // Parker curve is defined for a 0.1 mmol/kg dose
        ca * (self.dose / 0.1) / (1.0 - self.hct)
    }

    fn weinmann(&self, t: f64) -> f64 {
        if t <= 0.0 {
            return 0.0;
        }
        let ca = self.dose * (STD_A1 * (-STD_M1 * t).exp() + STD_A2 * (-STD_M2 * t).exp());
        ca / (1.0 - self.hct)
    }

    /// Exponential transit dispersion of the AIF, the population PIF.
    fn disperse_aif(&self) -> Vec<f64> {
        let delayed = resample_delayed(&self.times, &self.aif, PIF_DELAY);
        let n = self.times.len();
        let mut pif = vec![0.0; n];
        let mut integral = 0.0;
        for i in 1..n {
            let delta_t = self.times[i] - self.times[i - 1];
            let e = (-delta_t / PIF_DISPERSION).exp();
            integral = integral * e + delta_t * 0.5 * (delayed[i] + delayed[i - 1] * e);
            pif[i] = integral / PIF_DISPERSION;
        }
        pif
    }
}

/// Sample `values(t - tau)` on the grid by linear interpolation, holding the
/// end values beyond the grid.
pub(crate) fn resample_delayed(times: &[f64], values: &[f64], tau: f64) -> Vec<f64> {
    if tau == 0.0 {
        return values.to_vec();
    }
    times
        .iter()
        .map(|&t| interp(times, values, t - tau))
        .collect()
}

fn interp(times: &[f64], values: &[f64], t: f64) -> f64 {
    if t <= times[0] {
        return values[0];
    }
    let n = times.len();
    if t >= times[n - 1] {
        return values[n - 1];
    }
    let hi = times.partition_point(|&x| x < t).max(1);
    let (t0, t1) = (times[hi - 1], times[hi]);
    let (v0, v1) = (values[hi - 1], values[hi]);
    if t1 > t0 {
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    } else {
        v0
    }
}

fn read_two_column(path: &Path, n: usize) -> Result<Vec<f64>, QmriError> {
    let file = File::open(path).map_err(|e| QmriError::io(path, e))?;
    let mut vals = Vec::with_capacity(n);
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| QmriError::io(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut cols = line.split_whitespace();
        let _time: f64 = cols
            .next()
            .ok_or_else(|| QmriError::format(format!("{}:{}: missing time", path.display(), lineno + 1)))?
            .parse()
            .map_err(|_| QmriError::format(format!("{}:{}: bad time", path.display(), lineno + 1)))?;
        let value: f64 = cols
            .next()
            .ok_or_else(|| QmriError::format(format!("{}:{}: missing value", path.display(), lineno + 1)))?
            .parse()
            .map_err(|_| QmriError::format(format!("{}:{}: bad value", path.display(), lineno + 1)))?;
        vals.push(value);
    }
    if vals.len() != n {
        return Err(QmriError::format(format!(
            "{}: expected {n} AIF rows matching the dynamic grid, found {}",
            path.display(),
            vals.len()
        )));
    }
    Ok(vals)
}

#[cfg(test)]
mod test {
    use assert_fs::prelude::*;
    use float_eq::assert_float_eq;

    use super::*;

    fn minute_grid(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 / 10.0).collect()
    }

    #[test]
    fn sampling_before_grid_is_config_error() {
        let aif = Aif::default();
        assert!(matches!(aif.aif(), Err(QmriError::Config(_))));
    }

    #[test]
    fn population_aif_is_zero_before_bolus() {
        let mut aif = Aif::default();
        aif.set_times(minute_grid(60)).unwrap();
        aif.set_prebolus(7).unwrap();
        aif.resample().unwrap();
        let ca = aif.aif().unwrap();
        assert!(ca[..8].iter().all(|&v| v == 0.0));
        assert!(ca[8..].iter().any(|&v| v > 0.0));
    }

    #[test]
    fn dose_and_hct_scale_population_aif() {
        let mut a = Aif::default();
        a.set_times(minute_grid(40)).unwrap();
        a.set_prebolus(0).unwrap();
        a.set_dose(0.1).unwrap();
        a.set_hct(0.42).unwrap();
        a.resample().unwrap();

        let mut b = a.clone();
        b.set_dose(0.2).unwrap();
        b.resample().unwrap();

        let ca = a.aif().unwrap();
        let cb = b.aif().unwrap();
        for (x, y) in ca.iter().zip(cb.iter()) {
            assert_float_eq!(*y, 2.0 * *x, abs <= 1e-12);
        }
    }

    #[test]
    fn file_aif_round_trip() {
        let tmp = assert_fs::TempDir::new().unwrap();
        let path = tmp.child("aif.txt");

        let mut aif = Aif::default();
        aif.set_times(minute_grid(20)).unwrap();
        aif.resample().unwrap();
        aif.write_aif(path.path()).unwrap();

        let mut loaded = Aif::new(AifType::File, PifType::None);
        loaded.set_times(minute_grid(20)).unwrap();
        loaded.read_aif(path.path(), 20).unwrap();
        loaded.resample().unwrap();

        let orig = aif.aif().unwrap();
        let back = loaded.aif().unwrap();
        for (x, y) in orig.iter().zip(back.iter()) {
            assert_float_eq!(*x, *y, abs <= 1e-8);
        }

        // wrong row count is an error
        let mut bad = Aif::new(AifType::File, PifType::None);
        bad.set_times(minute_grid(21)).unwrap();
        assert!(bad.read_aif(path.path(), 21).is_err());
    }

    #[test]
    fn delayed_resample_shifts_curve() {
        let times: Vec<f64> = (0..5).map(|i| i as f64).collect();
        let values = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let shifted = resample_delayed(&times, &values, 1.0);
        assert_float_eq!(shifted[2], 1.0, abs <= 1e-12);
        assert_float_eq!(shifted[0], 0.0, abs <= 1e-12);
        assert_float_eq!(shifted[4], 3.0, abs <= 1e-12);
    }
}
