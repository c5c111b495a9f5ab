//! DCE pipeline orchestration: build Ct(t) per voxel, fit the shared model
//! template, aggregate parameter/IAUC/residual maps and track per-voxel
//! errors.
//!
//! The voxel loop is sharded over rayon workers. Each worker owns a deep
//! copy of the model and its fitter; the dynamic volumes, AIF samples, T1/M0
//! maps and ROI are shared read-only. Results are collected per voxel and
//! written back on the calling thread, so every output cell is written once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::aif::{Aif, AifMapVoxel};
use crate::errors::QmriError;
use crate::image::{Image3D, ImageType};
use crate::optimise::{FitterType, BAD_FIT_SSD};
use crate::tracker::{ErrorCode, ErrorTracker};

use super::fitter::ModelFitter;
use super::model::DceModel;
use super::voxel::{DceVoxel, M0Mode, VoxelStatus};

pub const MAP_NAME_RESIDUAL: &str = "residual";
pub const MAP_NAME_ERROR_TRACKER: &str = "error_tracker";
pub const MAP_NAME_ROI: &str = "ROI";
pub const MAP_NAME_CT_SIG: &str = "Ct_sig";
pub const MAP_NAME_CT_MOD: &str = "Ct_mod";
pub const MAP_NAME_IAUC: &str = "IAUC";
pub const MAP_NAME_IAUC_PEAK: &str = "IAUC_peak";

/// Run options for one DCE volume analysis.
#[derive(Debug, Clone)]
pub struct DceVolumeOptions {
    /// First timepoint used by the fit, 0-based.
    pub first_image: usize,
    /// One past the last timepoint used by the fit; 0 means the full run.
    pub last_image: usize,
    /// Relaxivity constant, s⁻¹·mM⁻¹.
    pub r1: f64,
    /// Index of the first image after contrast injection.
    pub prebolus: usize,
    /// Classify voxels as enhancing before fitting and skip the rest.
    pub test_enhancement: bool,
    /// Estimate per-timepoint noise from the spatial signal variance.
    pub dyn_noise: bool,
    /// IAUC window lengths in seconds.
    pub iauc_times: Vec<f64>,
    /// Add one more IAUC integral up to the Ct peak.
    pub iauc_at_peak: bool,
    pub max_iters: usize,
    pub backend: FitterType,
    /// Dynamic series is already concentration, skip SPGR inversion.
    pub input_ct: bool,
    /// Derive M0 from the prebolus signal instead of an M0 map.
    pub m0_ratio: bool,
    /// Keep per-timepoint signal-derived Ct maps in the output set.
    pub output_ct_sig: bool,
    /// Keep per-timepoint modelled Ct maps in the output set.
    pub output_ct_mod: bool,
}

impl Default for DceVolumeOptions {
    fn default() -> Self {
        DceVolumeOptions {
            first_image: 0,
            last_image: 0,
            r1: 3.4,
            prebolus: 8,
            test_enhancement: true,
            dyn_noise: false,
            iauc_times: vec![60.0, 90.0, 120.0],
            iauc_at_peak: false,
            max_iters: 500,
            backend: FitterType::Bleic,
            input_ct: false,
            m0_ratio: false,
            output_ct_sig: false,
            output_ct_mod: false,
        }
    }
}

struct VoxelResult {
    idx: usize,
    params: Vec<f64>,
    model_fit_error: f64,
    iauc: Vec<f64>,
    ct_sig: Option<Vec<f64>>,
    ct_mod: Option<Vec<f64>>,
    error_bits: u32,
}

pub struct DceVolumeAnalysis {
    options: DceVolumeOptions,
    model: DceModel,
    aif: Arc<Aif>,
    dynamic: Vec<Image3D>,
    times: Vec<f64>,
    t1: Option<Image3D>,
    m0: Option<Image3D>,
    b1: Option<Image3D>,
    roi: Option<Image3D>,
    init_param_maps: Option<Vec<Image3D>>,
    tracker: ErrorTracker,
    maps: FnvHashMap<String, Image3D>,
    map_names: Vec<String>,
    cancel: Arc<AtomicBool>,
}

impl DceVolumeAnalysis {
    /// `model` is the fitted template (one deep copy per worker); the AIF
    /// inside it must already be bound to the dynamic time grid.
    pub fn new(
        options: DceVolumeOptions,
        model: DceModel,
        aif: Arc<Aif>,
        dynamic: Vec<Image3D>,
    ) -> Result<Self, QmriError> {
        if dynamic.is_empty() {
            return Err(QmriError::config("no dynamic volumes supplied"));
        }
        for img in &dynamic[1..] {
            dynamic[0].check_same_grid(img, true)?;
        }
        let times = dynamic_times(&dynamic);
        let tracker = ErrorTracker::new(&dynamic[0]);
        Ok(DceVolumeAnalysis {
            options,
            model,
            aif,
            dynamic,
            times,
            t1: None,
            m0: None,
            b1: None,
            roi: None,
            init_param_maps: None,
            tracker,
            maps: FnvHashMap::default(),
            map_names: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_t1(&mut self, t1: Image3D) -> Result<(), QmriError> {
        self.dynamic[0].check_same_grid(&t1, true)?;
        self.t1 = Some(t1);
        Ok(())
    }

    pub fn set_m0(&mut self, m0: Image3D) -> Result<(), QmriError> {
        self.dynamic[0].check_same_grid(&m0, true)?;
        self.m0 = Some(m0);
        Ok(())
    }

    pub fn set_b1(&mut self, b1: Image3D) -> Result<(), QmriError> {
        self.dynamic[0].check_same_grid(&b1, true)?;
        self.b1 = Some(b1);
        Ok(())
    }

    pub fn set_roi(&mut self, roi: Image3D) -> Result<(), QmriError> {
        self.dynamic[0].check_same_grid(&roi, true)?;
        self.roi = Some(roi);
        Ok(())
    }

    /// Resume error tracking from a prior run's tracker image.
    pub fn set_tracker_image(&mut self, image: Image3D) -> Result<(), QmriError> {
        self.tracker = ErrorTracker::from_image(image, &self.dynamic[0])?;
        Ok(())
    }

    /// Per-voxel initial parameter maps, one per model parameter in
    /// canonical order.
    pub fn set_init_param_maps(&mut self, maps: Vec<Image3D>) -> Result<(), QmriError> {
        if maps.len() != self.model.num_params() {
            return Err(QmriError::config(format!(
                "expected {} initial parameter maps, got {}",
                self.model.num_params(),
                maps.len()
            )));
        }
        for m in &maps {
            self.dynamic[0].check_same_grid(m, true)?;
        }
        self.init_param_maps = Some(maps);
        Ok(())
    }

    /// Cooperative cancellation flag, checked between voxels.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn dynamic_times(&self) -> &[f64] {
        &self.times
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn aif(&self) -> &Aif {
        &self.aif
    }

    pub fn roi(&self) -> Option<&Image3D> {
        self.roi.as_ref()
    }

    /// Output maps in creation order.
    pub fn maps(&self) -> impl Iterator<Item = (&str, &Image3D)> {
        self.map_names
            .iter()
            .map(move |n| (n.as_str(), &self.maps[n]))
    }

    pub fn map(&self, name: &str) -> Option<&Image3D> {
        self.maps.get(name)
    }

    /// Mean Ct series over all voxels flagged `SELECTED` in an AIF voxel
    /// map; this becomes the base AIF before any voxel fit runs.
    pub fn aif_from_map(&self, aif_map: &Image3D) -> Result<Vec<f64>, QmriError> {
        self.dynamic[0].check_same_grid(aif_map, true)?;
        let selected: Vec<usize> = aif_map
            .as_slice()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v as u8 == AifMapVoxel::Selected as u8 && v != 0.0)
            .map(|(i, _)| i)
            .collect();
        if selected.is_empty() {
            return Err(QmriError::config("AIF map contains no selected voxels"));
        }

        let n = self.dynamic.len();
        let mut mean_ct = vec![0.0; n];
        let mut used = 0usize;
        for &idx in &selected {
            match self.voxel_ct(idx) {
                Some(ct) => {
                    for (acc, v) in mean_ct.iter_mut().zip(ct.iter()) {
                        *acc += v;
                    }
                    used += 1;
                }
                None => log::warn!("AIF map voxel {idx} has no valid Ct, skipped"),
            }
        }
        if used == 0 {
            return Err(QmriError::config("no AIF map voxel produced a valid Ct"));
        }
        mean_ct.iter_mut().for_each(|v| *v /= used as f64);
        Ok(mean_ct)
    }

    /// Run the voxel loop and populate the output maps.
    pub fn run(&mut self) -> Result<(), QmriError> {
        if !self.options.input_ct && self.t1.is_none() {
            return Err(QmriError::config(
                "T1 map required to convert signal to concentration",
            ));
        }
        if !self.options.input_ct && !self.options.m0_ratio && self.m0.is_none() {
            return Err(QmriError::config(
                "M0 map required unless the ratio method is selected",
            ));
        }

        let noise_var = if self.options.dyn_noise {
            self.temporal_noise()
        } else {
            Vec::new()
        };

        let voxels: Vec<usize> = (0..self.dynamic[0].num_voxels())
            .filter(|&idx| self.in_roi(idx))
            .collect();
        log::info!(
            "fitting {} of {} voxels with {}",
            voxels.len(),
            self.dynamic[0].num_voxels(),
            self.model.kind().name()
        );

        let results: Vec<VoxelResult> = voxels
            .par_iter()
            .filter_map(|&idx| {
                if self.cancel.load(Ordering::Relaxed) {
                    return None;
                }
                Some(self.fit_voxel(idx, &noise_var))
            })
            .collect();

        self.write_back(results);
        Ok(())
    }

    fn in_roi(&self, idx: usize) -> bool {
        self.roi.as_ref().map_or(true, |roi| roi.voxel(idx) != 0.0)
    }

    /// Signal time-series for one voxel across the dynamic stack.
    fn voxel_signal(&self, idx: usize) -> Vec<f64> {
        self.dynamic.iter().map(|img| img.voxel(idx)).collect()
    }

    /// Concentration series for one voxel, inverting SPGR when the input is
    /// raw signal. None when the voxel cannot produce a finite series.
    fn voxel_ct(&self, idx: usize) -> Option<Vec<f64>> {
        if self.options.input_ct {
            return Some(self.voxel_signal(idx));
        }
        let mut voxel = self.build_voxel(idx, Vec::new());
        let code = self.convert_voxel(idx, &mut voxel);
        if code == ErrorCode::Ok {
            Some(voxel.ct_data().to_vec())
        } else {
            None
        }
    }

    fn build_voxel(&self, idx: usize, ct_data: Vec<f64>) -> DceVoxel {
        DceVoxel::new(
            self.voxel_signal(idx),
            ct_data,
            self.options.prebolus,
            self.times.clone(),
            self.options.iauc_times.iter().map(|&s| s / 60.0).collect(),
            self.options.iauc_at_peak,
        )
    }

    fn convert_voxel(&self, idx: usize, voxel: &mut DceVoxel) -> ErrorCode {
        let t1 = self.t1.as_ref().map(|img| img.voxel(idx)).unwrap_or(0.0);
        let b1 = self.b1.as_ref().map_or(1.0, |img| img.voxel(idx));
        let meta = self.dynamic[0].meta();
        let fa = meta.flip_angle.unwrap_or(0.0);
        let tr = meta.tr.unwrap_or(0.0);
        let m0 = if self.options.m0_ratio {
            M0Mode::Ratio
        } else {
            M0Mode::Value(self.m0.as_ref().map(|img| img.voxel(idx)).unwrap_or(0.0))
        };
        voxel.compute_ct_from_signal(t1, fa, tr, self.options.r1, m0, b1)
    }

    fn fit_voxel(&self, idx: usize, noise_var: &[f64]) -> VoxelResult {
        let mut error_bits = 0u32;

        // prior runs may already rule this voxel out
        let prior = self.tracker.voxel_bits(idx);
        let mut status = if prior
            & (ErrorCode::DceInvalidInput.bits()
                | ErrorCode::B1Invalid.bits()
                | ErrorCode::CaIsNan.bits())
            != 0
        {
            VoxelStatus::DceInvalidInput
        } else if prior
            & (ErrorCode::T1FitFail.bits()
                | ErrorCode::M0FitFail.bits()
                | ErrorCode::VfaThreshFail.bits()
                | ErrorCode::DynT1Bad.bits())
            != 0
        {
            VoxelStatus::DynT1Bad
        } else {
            VoxelStatus::Ok
        };

        let mut voxel = if self.options.input_ct {
            self.build_voxel(idx, self.voxel_signal(idx))
        } else {
            let mut voxel = self.build_voxel(idx, Vec::new());
            if status.fittable() {
                let code = self.convert_voxel(idx, &mut voxel);
                if code != ErrorCode::Ok {
                    error_bits |= code.bits();
                    status = VoxelStatus::DceInvalidInput;
                }
            }
            voxel
        };

        if status.fittable() {
            voxel.compute_iauc();
            if self.options.test_enhancement {
                voxel.test_enhancing();
                if !voxel.enhancing() {
                    status = VoxelStatus::NonEnhancing;
                    error_bits |= ErrorCode::NonEnhIauc.bits();
                }
            }
        }

        let mut model = self.model.clone();
        if let Some(maps) = &self.init_param_maps {
            let seeded: Vec<f64> = maps.iter().map(|m| m.voxel(idx)).collect();
            if seeded.iter().all(|v| v.is_finite()) {
                model.set_init_params(seeded);
            }
        }

        let mut fitter = ModelFitter::new(
            self.options.first_image,
            self.options.last_image,
            noise_var.to_vec(),
            self.options.backend,
            self.options.max_iters,
        );
        let ct_data = voxel.ct_data().to_vec();
        let ct_data = if ct_data.len() == self.dynamic.len() {
            ct_data
        } else {
            vec![0.0; self.dynamic.len()]
        };
        fitter.initialise_fit(&mut model, &ct_data);
        fitter.fit(&mut model, &ct_data, status);

        let mut params = model.params().to_vec();
        let mut fit_error = fitter.model_fit_error();
        if fit_error == BAD_FIT_SSD || model.error_code() != ErrorCode::Ok {
            error_bits |= ErrorCode::DceFitFail.bits();
            params.iter_mut().for_each(|p| *p = 0.0);
            fit_error = BAD_FIT_SSD;
        }

        VoxelResult {
            idx,
            params,
            model_fit_error: fit_error,
            iauc: voxel.iauc_vals().to_vec(),
            ct_sig: self.options.output_ct_sig.then(|| ct_data.clone()),
            ct_mod: self
                .options
                .output_ct_mod
                .then(|| model.ct_model().to_vec()),
            error_bits,
        }
    }

    /// Spatial variance of the signal at each timepoint, used as the
    /// temporally varying noise estimate.
    fn temporal_noise(&self) -> Vec<f64> {
        self.dynamic
            .iter()
            .map(|img| {
                let vals: Vec<f64> = img
                    .as_slice()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| self.in_roi(*i))
                    .map(|(_, &v)| v)
                    .collect();
                let var = vals.variance();
                if var.is_finite() && var > 0.0 {
                    var
                } else {
                    1.0
                }
            })
            .collect()
    }

    fn write_back(&mut self, results: Vec<VoxelResult>) {
        let template = self.dynamic[0].clone();
        let param_names: Vec<String> = self.model.param_names().to_vec();

        for name in &param_names {
            self.ensure_map(name, &template, ImageType::Generic);
        }
        self.ensure_map(MAP_NAME_RESIDUAL, &template, ImageType::Generic);
        let iauc_names: Vec<String> = self
            .options
            .iauc_times
            .iter()
            .map(|&s| format!("{MAP_NAME_IAUC}{}", s.round() as i64))
            .collect();
        for name in &iauc_names {
            self.ensure_map(name, &template, ImageType::Generic);
        }
        if self.options.iauc_at_peak {
            self.ensure_map(MAP_NAME_IAUC_PEAK, &template, ImageType::Generic);
        }
        let n_times = self.dynamic.len();
        if self.options.output_ct_sig {
            for t in 0..n_times {
                self.ensure_map(&ct_map_name(MAP_NAME_CT_SIG, t), &template, ImageType::CtDynamic);
            }
        }
        if self.options.output_ct_mod {
            for t in 0..n_times {
                self.ensure_map(&ct_map_name(MAP_NAME_CT_MOD, t), &template, ImageType::CtModel);
            }
        }

        for r in results {
            for (name, &value) in param_names.iter().zip(r.params.iter()) {
                self.maps.get_mut(name).unwrap().set_voxel(r.idx, value);
            }
            let residual = if r.model_fit_error == BAD_FIT_SSD {
                0.0
            } else {
                r.model_fit_error
            };
            self.maps
                .get_mut(MAP_NAME_RESIDUAL)
                .unwrap()
                .set_voxel(r.idx, residual);

            for (name, &value) in iauc_names.iter().zip(r.iauc.iter()) {
                self.maps.get_mut(name).unwrap().set_voxel(r.idx, value);
            }
            if self.options.iauc_at_peak {
                if let Some(&peak) = r.iauc.last() {
                    self.maps
                        .get_mut(MAP_NAME_IAUC_PEAK)
                        .unwrap()
                        .set_voxel(r.idx, peak);
                }
            }
            if let Some(ct_sig) = &r.ct_sig {
                for (t, &value) in ct_sig.iter().enumerate() {
                    self.maps
                        .get_mut(&ct_map_name(MAP_NAME_CT_SIG, t))
                        .unwrap()
                        .set_voxel(r.idx, value);
                }
            }
            if let Some(ct_mod) = &r.ct_mod {
                for (t, &value) in ct_mod.iter().enumerate() {
                    self.maps
                        .get_mut(&ct_map_name(MAP_NAME_CT_MOD, t))
                        .unwrap()
                        .set_voxel(r.idx, value);
                }
            }

            self.tracker.or_voxel_bits(r.idx, r.error_bits);
        }
    }

    fn ensure_map(&mut self, name: &str, template: &Image3D, image_type: ImageType) {
        if !self.maps.contains_key(name) {
            self.maps
                .insert(name.to_string(), template.copy_shape(image_type));
            self.map_names.push(name.to_string());
        }
    }
}

fn ct_map_name(prefix: &str, t: usize) -> String {
    format!("{prefix}_{:03}", t + 1)
}

/// Dynamic time grid in minutes from the first image's timestamp.
pub fn dynamic_times(dynamic: &[Image3D]) -> Vec<f64> {
    let t0 = dynamic
        .first()
        .and_then(|img| img.meta().timestamp_secs())
        .unwrap_or(0.0);
    dynamic
        .iter()
        .map(|img| {
            img.meta()
                .timestamp_secs()
                .map(|s| (s - t0) / 60.0)
                .unwrap_or(0.0)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use crate::aif::{AifType, PifType};
    use crate::dce::model::{create_model, DceModelKind, ModelOverrides};
    use crate::signal;

    use super::*;

    const N_TIMES: usize = 50;
    const T1: f64 = 1000.0;
    const M0: f64 = 1500.0;
    const FA: f64 = 20.0;
    const TR: f64 = 3.5;
    const R1: f64 = 3.4;

    /// Synthetic run: one enhancing voxel with known ETM parameters, one
    /// flat voxel, 3x1x1 grid.
    fn synthetic_analysis(test_enhancement: bool) -> DceVolumeAnalysis {
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        let times: Vec<f64> = (0..N_TIMES).map(|i| i as f64 * 6.0 / 60.0).collect();
        aif.set_times(times.clone()).unwrap();
        aif.set_prebolus(8).unwrap();
        aif.resample().unwrap();
        let aif = Arc::new(aif);

        let mut truth =
            create_model(DceModelKind::Tofts, aif.clone(), &ModelOverrides::default()).unwrap();
        truth.reset(N_TIMES);
        truth.set_params(vec![0.25, 0.4, 0.0, 0.0, 1.0]);
        truth.compute_ct(N_TIMES);
        let ct_truth = truth.ct_model().to_vec();

        // dynamic signal stack, timestamps 6s apart
        let dynamic: Vec<Image3D> = (0..N_TIMES)
            .map(|t| {
                let mut img = Image3D::new(3, 1, 1);
                img.meta_mut().flip_angle = Some(FA);
                img.meta_mut().tr = Some(TR);
                img.meta_mut().set_timestamp_from_secs(36000.0 + t as f64 * 6.0);
                let s_enh =
                    signal::signal_from_concentration(ct_truth[t], T1, M0, FA, TR, 1.0, R1);
                let s_flat = signal::signal_from_concentration(0.0, T1, M0, FA, TR, 1.0, R1);
                img.set_voxel(0, s_enh);
                img.set_voxel(1, s_flat);
                img.set_voxel(2, s_flat);
                img
            })
            .collect();

        let model = create_model(DceModelKind::Tofts, aif.clone(), &ModelOverrides::default())
            .unwrap();
        let options = DceVolumeOptions {
            prebolus: 8,
            test_enhancement,
            iauc_times: vec![60.0],
            ..Default::default()
        };
        let mut analysis = DceVolumeAnalysis::new(options, model, aif, dynamic).unwrap();

        let mut t1_map = Image3D::new(3, 1, 1);
        t1_map.fill(T1);
        t1_map.set_image_type(ImageType::T1);
        analysis.set_t1(t1_map).unwrap();
        let mut m0_map = Image3D::new(3, 1, 1);
        m0_map.fill(M0);
        m0_map.set_image_type(ImageType::M0);
        analysis.set_m0(m0_map).unwrap();
        analysis
    }

    #[test]
    fn recovers_known_parameters_at_enhancing_voxel() {
        let mut analysis = synthetic_analysis(false);
        analysis.run().unwrap();

        let ktrans = analysis.map("Ktrans").unwrap();
        let ve = analysis.map("v_e").unwrap();
        assert_float_eq!(ktrans.voxel(0), 0.25, abs <= 0.02);
        assert_float_eq!(ve.voxel(0), 0.4, abs <= 0.05);

        let residual = analysis.map(MAP_NAME_RESIDUAL).unwrap();
        assert!(residual.voxel(0) < 1e-3);
        assert!(analysis.map("IAUC60").is_some());
    }

    #[test]
    fn flat_voxels_marked_non_enhancing() {
        let mut analysis = synthetic_analysis(true);
        analysis.run().unwrap();

        let ktrans = analysis.map("Ktrans").unwrap();
        assert_eq!(ktrans.voxel(1), 0.0);
        assert_ne!(
            analysis.tracker().voxel_bits(1) & ErrorCode::NonEnhIauc.bits(),
            0
        );
        // the enhancing voxel keeps a clean tracker entry
        assert_eq!(analysis.tracker().voxel_bits(0), 0);
    }

    #[test]
    fn roi_restricts_the_fit() {
        let mut analysis = synthetic_analysis(false);
        let mut roi = Image3D::new(3, 1, 1);
        roi.set_voxel(1, 1.0);
        roi.set_image_type(ImageType::Roi);
        analysis.set_roi(roi).unwrap();
        analysis.run().unwrap();

        let ktrans = analysis.map("Ktrans").unwrap();
        // voxel 0 never fitted: outside ROI
        assert_eq!(ktrans.voxel(0), 0.0);
    }

    #[test]
    fn aif_from_map_averages_selected_voxels() {
        let analysis = synthetic_analysis(false);
        let mut aif_map = Image3D::new(3, 1, 1);
        aif_map.set_voxel(0, AifMapVoxel::Selected as u8 as f64);
        aif_map.set_image_type(ImageType::AifVoxelMap);

        let base = analysis.aif_from_map(&aif_map).unwrap();
        assert_eq!(base.len(), N_TIMES);
        // voxel 0 carries the enhancing series, so the mean must enhance
        assert!(base.iter().cloned().fold(f64::MIN, f64::max) > 0.1);
    }

    #[test]
    fn dynamic_times_start_at_zero() {
        let analysis = synthetic_analysis(false);
        let times = analysis.dynamic_times();
        assert_float_eq!(times[0], 0.0, abs <= 1e-12);
        assert_float_eq!(times[10], 1.0, abs <= 1e-9);
    }
}
