//! `qmri dce`: volume DCE analysis, signal (or Ct) series in, parameter
//! maps out.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, Result};
use libqmri::aif::{Aif, AifType, PifType};
use libqmri::dce::model::{self, DceModelKind, ModelOverrides};
use libqmri::dce::volume::{self, DceVolumeAnalysis, DceVolumeOptions};
use libqmri::optimise::FitterType;
use libqmri::ImageType;

use super::common::{self, OutputOpts};

#[derive(Debug, Parser)]
pub struct DceCmd {
    #[clap(flatten)]
    pub output: OutputOpts,

    /// Tracer-kinetic model name (e.g. ETM, TOFTS, 2CXM, PATLAK)
    #[clap(short, long)]
    pub model: String,

    /// Override the model's initial parameter values, one per parameter
    #[clap(long = "init_params", num_args = 1.., allow_hyphen_values = true)]
    pub init_params: Vec<f64>,

    /// Indices of parameters to hold fixed
    #[clap(long = "fixed_params", num_args = 1..)]
    pub fixed_params: Vec<usize>,

    /// Values for the fixed parameters, paired with --fixed_params
    #[clap(long = "fixed_values", num_args = 1.., allow_hyphen_values = true)]
    pub fixed_values: Vec<f64>,

    /// Indices of parameters bounded to initial +/- limit
    #[clap(long = "relative_limit_params", num_args = 1..)]
    pub relative_limit_params: Vec<usize>,

    /// Limit values paired with --relative_limit_params
    #[clap(long = "relative_limit_values", num_args = 1..)]
    pub relative_limit_values: Vec<f64>,

    /// Base name of the dynamic series, expanded to {dyn}1..{dyn}N
    #[clap(short, long = "dyn")]
    pub dyn_name: PathBuf,

    /// Number of dynamic volumes
    #[clap(long = "n_dyns")]
    pub n_dyns: usize,

    /// Baseline T1 map
    #[clap(long = "T1")]
    pub t1: Option<PathBuf>,

    /// Baseline M0 map; omit with --m0_ratio
    #[clap(long = "M0")]
    pub m0: Option<PathBuf>,

    /// Derive M0 from the prebolus signal mean
    #[clap(long = "M0_ratio")]
    pub m0_ratio: bool,

    /// B1 correction map
    #[clap(long = "B1")]
    pub b1: Option<PathBuf>,

    /// Relaxivity constant, s^-1 mM^-1
    #[clap(long = "r1_const", default_value_t = 3.4)]
    pub r1_const: f64,

    /// Contrast dose, mmol/kg (population AIF)
    #[clap(long, default_value_t = 0.1)]
    pub dose: f64,

    /// Haematocrit
    #[clap(long, default_value_t = 0.42)]
    pub hct: f64,

    /// AIF file; takes precedence over --aif_map and the population AIF
    #[clap(long)]
    pub aif: Option<PathBuf>,

    /// PIF file for dual-input models
    #[clap(long)]
    pub pif: Option<PathBuf>,

    /// AIF voxel map from a prior `qmri aif` run
    #[clap(long = "aif_map")]
    pub aif_map: Option<PathBuf>,

    /// ROI mask
    #[clap(long)]
    pub roi: Option<PathBuf>,

    /// Error tracker image from a prior run
    #[clap(long)]
    pub err: Option<PathBuf>,

    /// Index of the first image after contrast injection
    #[clap(long = "inj", default_value_t = 8)]
    pub injection_image: usize,

    /// IAUC window lengths in seconds
    #[clap(long, num_args = 1.., default_values_t = vec![60.0, 90.0, 120.0])]
    pub iauc: Vec<f64>,

    /// Add an IAUC integral up to the Ct peak
    #[clap(long = "iauc_peak")]
    pub iauc_peak: bool,

    /// First timepoint used by the fit
    #[clap(long, default_value_t = 0)]
    pub first: usize,

    /// One past the last timepoint used by the fit; 0 means all
    #[clap(long, default_value_t = 0)]
    pub last: usize,

    /// Optimiser iteration cap
    #[clap(long = "max_iter", default_value_t = 500)]
    pub max_iter: usize,

    /// Optimiser backend: LLS, BLEIC or NS
    #[clap(long = "opt_type", default_value = "BLEIC")]
    pub opt_type: String,

    /// Estimate temporally varying noise from the data
    #[clap(long = "dyn_noise")]
    pub dyn_noise: bool,

    /// Skip fitting voxels that fail the enhancement test
    #[clap(long = "test_enh")]
    pub test_enh: bool,

    /// Dynamic series is already concentration
    #[clap(long = "Ct_in")]
    pub ct_in: bool,

    /// Write signal-derived Ct maps
    #[clap(long = "Ct_sig")]
    pub ct_sig: bool,

    /// Write modelled Ct maps
    #[clap(long = "Ct_mod")]
    pub ct_mod: bool,

    /// Number of worker threads, defaults to the logical core count
    #[clap(short = 'j', long = "num_threads")]
    pub num_threads: Option<usize>,
}

impl DceCmd {
    pub fn run(self) -> Result<()> {
        let mut run = self.output.open("qmri_DCE")?;

        if let Some(n) = self.num_threads {
            rayon::ThreadPoolBuilder::new().num_threads(n).build_global()?;
            log::info!("using {n} worker threads");
        } else {
            log::info!("using {} logical cores", num_cpus::get());
        }

        let kind = DceModelKind::parse(&self.model)
            .ok_or_else(|| eyre!("unknown model {:?}, expected one of {:?}", self.model, DceModelKind::implemented()))?;
        let backend = FitterType::parse(&self.opt_type)?;

        let dynamic = common::load_dynamic_series(&self.dyn_name, self.n_dyns, run.read_format)?;
        let times = volume::dynamic_times(&dynamic);
        run.log(&format!(
            "loaded {} dynamic volumes spanning {:.2} min",
            dynamic.len(),
            times.last().copied().unwrap_or(0.0)
        ));

        // AIF precedence: FILE > MAP > POP
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times(times.clone())?;
        aif.set_prebolus(self.injection_image)?;
        aif.set_dose(self.dose)?;
        aif.set_hct(self.hct)?;
        if let Some(path) = &self.pif {
            aif.read_pif(path, self.n_dyns)?;
        }
        if let Some(path) = &self.aif {
            aif.read_aif(path, self.n_dyns)?;
            run.log(&format!("AIF loaded from {}", path.display()));
        }
        aif.resample()?;

        let overrides = ModelOverrides {
            init_params: self.init_params.clone(),
            fixed_params: self.fixed_params.clone(),
            fixed_values: self.fixed_values.clone(),
            relative_limit_params: self.relative_limit_params.clone(),
            relative_limit_values: self.relative_limit_values.clone(),
            ..Default::default()
        };
        let options = DceVolumeOptions {
            first_image: self.first,
            last_image: self.last,
            r1: self.r1_const,
            prebolus: self.injection_image,
            test_enhancement: self.test_enh,
            dyn_noise: self.dyn_noise,
            iauc_times: self.iauc.clone(),
            iauc_at_peak: self.iauc_peak,
            max_iters: self.max_iter,
            backend,
            input_ct: self.ct_in,
            m0_ratio: self.m0_ratio,
            output_ct_sig: self.ct_sig,
            output_ct_mod: self.ct_mod,
        };

        // derive the AIF from a voxel map before any fits run
        if self.aif.is_none() {
            if let Some(map_path) = &self.aif_map {
                let aif_map = common::load_image(map_path, run.read_format)?;
                let probe = self.build_analysis(
                    &options,
                    kind,
                    &overrides,
                    Arc::new(aif.clone()),
                    dynamic.clone(),
                    &run,
                )?;
                let base = probe.aif_from_map(&aif_map)?;
                aif.set_base_aif(base)?;
                aif.resample()?;
                run.log(&format!("AIF derived from map {}", map_path.display()));
            }
        }

        let aif = Arc::new(aif);
        let mut analysis =
            self.build_analysis(&options, kind, &overrides, aif.clone(), dynamic, &run)?;
        analysis.run()?;

        let map_names: Vec<String> = analysis.maps().map(|(n, _)| n.to_string()).collect();
        for name in &map_names {
            let img = analysis.map(name).expect("registered map").clone();
            run.save_map(name, &img)?;
        }
        run.save_map(volume::MAP_NAME_ERROR_TRACKER, analysis.tracker().image())?;
        if let Some(roi) = analysis.roi() {
            let roi = roi.clone();
            run.save_map(volume::MAP_NAME_ROI, &roi)?;
        }
        aif.write_aif(run.dir.join("AIF.txt"))?;

        run.log("qmri_DCE finished");
        run.audit("qmri_DCE finished");
        Ok(())
    }

    fn build_analysis(
        &self,
        options: &DceVolumeOptions,
        kind: DceModelKind,
        overrides: &ModelOverrides,
        aif: Arc<Aif>,
        dynamic: Vec<libqmri::Image3D>,
        run: &common::RunOutput,
    ) -> Result<DceVolumeAnalysis> {
        let model = model::create_model(kind, aif.clone(), overrides)?;
        let mut analysis = DceVolumeAnalysis::new(options.clone(), model, aif, dynamic)?;

        if let Some(path) = &self.t1 {
            let mut t1 = common::load_image(path, run.read_format)?;
            t1.set_image_type(ImageType::T1);
            analysis.set_t1(t1)?;
        }
        if let Some(path) = &self.m0 {
            let mut m0 = common::load_image(path, run.read_format)?;
            m0.set_image_type(ImageType::M0);
            analysis.set_m0(m0)?;
        }
        if let Some(path) = &self.b1 {
            let mut b1 = common::load_image(path, run.read_format)?;
            b1.set_image_type(ImageType::B1);
            analysis.set_b1(b1)?;
        }
        if let Some(roi) = common::load_roi(self.roi.as_ref(), run.read_format)? {
            analysis.set_roi(roi)?;
        }
        if let Some(path) = &self.err {
            let tracker = common::load_image(path, run.read_format)?;
            analysis.set_tracker_image(tracker)?;
        }
        Ok(analysis)
    }
}
