//! `qmri aif`: estimate the AIF from the dynamic data by screening voxels
//! and averaging the top-percentile candidates.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::Result;
use libqmri::aif::detect::{AifDetector, AifDetectorOptions};
use libqmri::aif::{Aif, AifType, PifType};
use libqmri::dce::model::{self, DceModelKind, ModelOverrides};
use libqmri::dce::volume::{self, DceVolumeAnalysis, DceVolumeOptions};
use libqmri::ErrorTracker;
use libqmri::ImageType;

use super::common::{self, OutputOpts};

#[derive(Debug, Parser)]
pub struct AifCmd {
    #[clap(flatten)]
    pub output: OutputOpts,

    /// Base name of the dynamic series, expanded to {dyn}1..{dyn}N
    #[clap(short, long = "dyn")]
    pub dyn_name: PathBuf,

    /// Number of dynamic volumes
    #[clap(long = "n_dyns")]
    pub n_dyns: usize,

    /// Baseline T1 map
    #[clap(long = "T1")]
    pub t1: PathBuf,

    /// Baseline M0 map; omit with --M0_ratio
    #[clap(long = "M0")]
    pub m0: Option<PathBuf>,

    /// Derive M0 from the prebolus signal mean
    #[clap(long = "M0_ratio")]
    pub m0_ratio: bool,

    /// Dynamic series is already concentration
    #[clap(long = "Ct_in")]
    pub ct_in: bool,

    /// Relaxivity constant, s^-1 mM^-1
    #[clap(long = "r1_const", default_value_t = 3.4)]
    pub r1_const: f64,

    /// Index of the first image after contrast injection
    #[clap(long = "inj", default_value_t = 8)]
    pub injection_image: usize,

    /// Slices to scan for AIF candidates
    #[clap(long = "aif_slices", num_args = 1..)]
    pub slices: Vec<usize>,

    /// Column range to scan, empty means all
    #[clap(long = "aif_x_range", num_args = 1..)]
    pub x_range: Vec<usize>,

    /// Row range to scan, empty means all
    #[clap(long = "aif_y_range", num_args = 1..)]
    pub y_range: Vec<usize>,

    /// Minimum blood T1 in ms for a voxel to be considered
    #[clap(long = "min_T1_blood", default_value_t = 1000.0)]
    pub min_t1_blood: f64,

    /// Longest allowed injection-to-peak delay, seconds
    #[clap(long = "peak_time", default_value_t = 60.0)]
    pub peak_time: f64,

    /// Fallback noise stdev when the pre-arrival window is short
    #[clap(long = "prebolus_noise")]
    pub prebolus_noise: f64,

    /// Samples needed before the noise is estimated from the data
    #[clap(long = "prebolus_min_images", default_value_t = 5)]
    pub prebolus_min_images: usize,

    /// Percentage of candidates promoted to the AIF
    #[clap(long = "select_pct", default_value_t = 5.0)]
    pub select_pct: f64,

    /// Haematocrit
    #[clap(long, default_value_t = 0.42)]
    pub hct: f64,

    /// ROI mask
    #[clap(long)]
    pub roi: Option<PathBuf>,

    /// Error tracker image from a prior run
    #[clap(long)]
    pub err: Option<PathBuf>,
}

impl AifCmd {
    pub fn run(self) -> Result<()> {
        let mut run = self.output.open("qmri_AIF")?;

        let dynamic = common::load_dynamic_series(&self.dyn_name, self.n_dyns, run.read_format)?;
        let times = volume::dynamic_times(&dynamic);

        let mut t1 = common::load_image(&self.t1, run.read_format)?;
        t1.set_image_type(ImageType::T1);
        let roi = common::load_roi(self.roi.as_ref(), run.read_format)?;
        let tracker = match &self.err {
            Some(path) => ErrorTracker::from_image(common::load_image(path, run.read_format)?, &t1)?,
            None => ErrorTracker::new(&t1),
        };

        let detector = AifDetector::new(AifDetectorOptions {
            slices: self.slices.clone(),
            x_range: self.x_range.clone(),
            y_range: self.y_range.clone(),
            min_t1_blood: self.min_t1_blood,
            peak_time: self.peak_time,
            prebolus_noise: self.prebolus_noise,
            prebolus_min_images: self.prebolus_min_images,
            select_pct: self.select_pct,
        })?;
        let detection = detector.run(
            &dynamic,
            &times,
            self.injection_image,
            &t1,
            roi.as_ref(),
            &tracker,
        )?;
        run.log(&format!(
            "selected {} of {} candidate voxels",
            detection.n_selected, detection.n_candidates
        ));

        // average the selected voxels' Ct through a NULL-model analysis
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times(times.clone())?;
        aif.set_prebolus(self.injection_image)?;
        aif.set_hct(self.hct)?;
        aif.resample()?;

        let options = DceVolumeOptions {
            prebolus: self.injection_image,
            r1: self.r1_const,
            input_ct: self.ct_in,
            m0_ratio: self.m0_ratio,
            ..Default::default()
        };
        let shared = Arc::new(aif.clone());
        let probe_model =
            model::create_model(DceModelKind::None, shared.clone(), &ModelOverrides::default())?;
        let mut probe = DceVolumeAnalysis::new(options, probe_model, shared, dynamic)?;
        probe.set_t1(t1)?;
        if let Some(path) = &self.m0 {
            probe.set_m0(common::load_image(path, run.read_format)?)?;
        }

        let base = probe.aif_from_map(&detection.voxel_map)?;
        aif.set_base_aif(base)?;
        aif.resample()?;

        let slice_tag = format!(
            "slice_{}-{}_Auto_AIF",
            self.slices.first().copied().unwrap_or(0),
            self.slices.last().copied().unwrap_or(0)
        );
        aif.write_aif(run.dir.join(format!("{slice_tag}.txt")))?;
        run.save_map(&slice_tag, &detection.voxel_map)?;
        run.save_map("error_tracker", tracker.image())?;
        if let Some(roi) = &roi {
            run.save_map(volume::MAP_NAME_ROI, roi)?;
        }

        run.log("qmri_AIF finished");
        run.audit("qmri_AIF finished");
        Ok(())
    }
}
