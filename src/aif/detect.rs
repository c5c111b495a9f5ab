//! Auto-AIF detection: screen voxel time-courses for bolus-like peaks and
//! select the top percentile by peak signal. The selected voxels' mean Ct
//! becomes the data-driven AIF.

use crate::errors::QmriError;
use crate::image::{Image3D, ImageType};
use crate::tracker::ErrorTracker;

use super::AifMapVoxel;

#[derive(Debug, Clone)]
pub struct AifDetectorOptions {
    /// Slices to scan (z indices). Must be non-empty.
    pub slices: Vec<usize>,
    /// Column range to scan; empty means the full extent.
    pub x_range: Vec<usize>,
    /// Row range to scan; empty means the full extent.
    pub y_range: Vec<usize>,
    /// Voxels below this T1 (ms) cannot be blood and are not considered.
    pub min_t1_blood: f64,
    /// Longest allowed delay from injection to peak, seconds.
    pub peak_time: f64,
    /// Fallback noise standard deviation when the pre-arrival window is too
    /// short to estimate one.
    pub prebolus_noise: f64,
    /// Minimum samples needed to estimate the pre-arrival noise.
    pub prebolus_min_images: usize,
    /// Percentage of candidates (by peak signal) promoted to `SELECTED`.
    pub select_pct: f64,
}

impl Default for AifDetectorOptions {
    fn default() -> Self {
        AifDetectorOptions {
            slices: Vec::new(),
            x_range: Vec::new(),
            y_range: Vec::new(),
            min_t1_blood: 1000.0,
            peak_time: 60.0,
            prebolus_noise: 0.0,
            prebolus_min_images: 5,
            select_pct: 5.0,
        }
    }
}

/// Outcome of a detection run: the classified voxel map plus bookkeeping.
pub struct AifDetection {
    pub voxel_map: Image3D,
    pub n_candidates: usize,
    pub n_selected: usize,
}

pub struct AifDetector {
    options: AifDetectorOptions,
}

impl AifDetector {
    pub fn new(options: AifDetectorOptions) -> Result<Self, QmriError> {
        if options.slices.is_empty() {
            return Err(QmriError::config("auto-AIF needs at least one slice"));
        }
        if !(options.select_pct > 0.0 && options.select_pct <= 100.0) {
            return Err(QmriError::config("select percentage must be in (0,100]"));
        }
        Ok(AifDetector { options })
    }

    /// Screen the dynamic series and classify voxels. `times` is the
    /// dynamic grid in minutes, `prebolus` the injection image index.
    pub fn run(
        &self,
        dynamic: &[Image3D],
        times: &[f64],
        prebolus: usize,
        t1: &Image3D,
        roi: Option<&Image3D>,
        tracker: &ErrorTracker,
    ) -> Result<AifDetection, QmriError> {
        if dynamic.len() != times.len() {
            return Err(QmriError::config(
                "dynamic series and time grid differ in length",
            ));
        }
        if prebolus >= times.len() {
            return Err(QmriError::config("prebolus image outside dynamic series"));
        }
        t1.check_same_grid(&dynamic[0], true)?;

        let mut voxel_map = t1.copy_shape(ImageType::AifVoxelMap);
        let (nx, ny, nz) = t1.dims();

        let x_range: Vec<usize> = if self.options.x_range.is_empty() {
            (0..nx).collect()
        } else {
            self.options.x_range.clone()
        };
        let y_range: Vec<usize> = if self.options.y_range.is_empty() {
            (0..ny).collect()
        } else {
            self.options.y_range.clone()
        };

        let mut candidates: Vec<(usize, f64)> = Vec::new();
        for &z in &self.options.slices {
            if z >= nz {
                return Err(QmriError::config(format!(
                    "AIF slice {z} outside volume of {nz} slices"
                )));
            }
            let before = candidates.len();
            for &x in &x_range {
                for &y in &y_range {
                    if x >= nx || y >= ny {
                        return Err(QmriError::config(format!(
                            "AIF search range ({x},{y}) outside {nx}x{ny} slice"
                        )));
                    }
                    let idx = t1.sub_to_ind(x, y, z);
                    if let Some(roi) = roi {
                        if roi.voxel(idx) == 0.0 {
                            continue;
                        }
                    }
                    if !tracker.voxel_ok(idx) {
                        continue;
                    }
                    // pre-contrast blood T1 is long; anything shorter is tissue
                    if t1.voxel(idx) <= self.options.min_t1_blood {
                        continue;
                    }
                    let series: Vec<f64> = dynamic.iter().map(|img| img.voxel(idx)).collect();
                    if let Some(max_signal) =
                        self.screen_voxel(&series, times, prebolus, idx, &mut voxel_map)
                    {
                        candidates.push((idx, max_signal));
                    }
                }
            }
            log::info!(
                "slice {z}: {} candidate AIF voxels",
                candidates.len() - before
            );
        }

        let n_candidates = candidates.len();
        if n_candidates == 0 {
            log::warn!("no suitable voxels found to define AIF across all slices");
        }

        // promote the top percentile by peak signal
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        let n_selected = (self.options.select_pct * n_candidates as f64 / 100.0) as usize;
        for &(idx, _) in candidates.iter().take(n_selected) {
            voxel_map.set_voxel(idx, AifMapVoxel::Selected as u8 as f64);
        }
        log::info!("selected {n_selected} of {n_candidates} voxels to use in AIF");

        Ok(AifDetection {
            voxel_map,
            n_candidates,
            n_selected,
        })
    }

    /// One voxel's screening. Writes the rejection class into the map and
    /// returns the peak signal for accepted candidates.
    fn screen_voxel(
        &self,
        series: &[f64],
        times: &[f64],
        prebolus: usize,
        idx: usize,
        voxel_map: &mut Image3D,
    ) -> Option<f64> {
        let flag = |map: &mut Image3D, v: AifMapVoxel| map.set_voxel(idx, v as u8 as f64);

        let (min_signal, max_signal, max_img) = min_max(series);

        if max_img <= prebolus {
            flag(voxel_map, AifMapVoxel::PeakTooEarly);
            return None;
        }
        if (times[max_img] - times[prebolus]) * 60.0 > self.options.peak_time {
            flag(voxel_map, AifMapVoxel::PeakTooLate);
            return None;
        }

        // arrival: first image exceeding 10% of the min-to-max rise; a dip
        // back below before the peak is noise
        let lower_threshold = min_signal + 0.1 * (max_signal - min_signal);
        let mut arrival = 0usize;
        for i in prebolus..max_img {
            if arrival == 0 && series[i] > lower_threshold {
                arrival = i;
            }
            if arrival != 0 && series[i] < lower_threshold {
                flag(voxel_map, AifMapVoxel::DoubleDip);
                return None;
            }
        }

        if max_signal < self.noise_threshold(series, arrival) {
            flag(voxel_map, AifMapVoxel::BelowNoiseThresh);
            return None;
        }

        flag(voxel_map, AifMapVoxel::Candidate);
        Some(max_signal)
    }

    /// `mean + 3·stdev` over the pre-arrival window, falling back to the
    /// configured noise when the window is too short for a variance.
    fn noise_threshold(&self, series: &[f64], arrival: usize) -> f64 {
        let mut sum = 0.0;
        let mut sumsq = 0.0;
        for &s in &series[..=arrival] {
            sum += s;
            sumsq += s * s;
        }
        let n = (arrival + 1) as f64;
        let mean = sum / n;
        let std = if arrival + 1 >= self.options.prebolus_min_images {
            ((sumsq - sum * sum / n) / (n - 1.0)).max(0.0).sqrt()
        } else {
            self.options.prebolus_noise
        };
        mean + 3.0 * std
    }
}

fn min_max(series: &[f64]) -> (f64, f64, usize) {
    let mut min_signal = series[0];
    let mut max_signal = series[0];
    let mut max_img = 0;
    for (i, &s) in series.iter().enumerate().skip(1) {
        if s > max_signal {
            max_signal = s;
            max_img = i;
        }
        if s < min_signal {
            min_signal = s;
        }
    }
    (min_signal, max_signal, max_img)
}
