//! `qmri dwi`: ADC/IVIM mapping from b-value volumes.

use std::path::PathBuf;

use clap::Parser;
use eyre::Result;
use libqmri::dwi::{DwiMapper, DwiMapperOptions, DwiMethod};

use super::common::{self, OutputOpts};

#[derive(Debug, Parser)]
pub struct DwiCmd {
    #[clap(flatten)]
    pub output: OutputOpts,

    /// Mapping method: ADC, ADC_LIN, IVIM or IVIM_SIMPLE
    #[clap(long = "DWI_method", default_value = "ADC")]
    pub method: String,

    /// Input volumes; the b-value comes from each XTR
    #[clap(long = "DWI_vols", num_args = 2..)]
    pub inputs: Vec<PathBuf>,

    /// Signal threshold below which voxels are not fitted
    #[clap(long = "DWI_noise", default_value_t = 0.0)]
    pub noise_threshold: f64,

    /// b-value separating perfusion and diffusion phases for IVIM
    #[clap(long = "b_thresh", default_value_t = 200.0)]
    pub b_threshold: f64,

    /// ROI mask
    #[clap(long)]
    pub roi: Option<PathBuf>,

    /// Error tracker image from a prior run
    #[clap(long)]
    pub err: Option<PathBuf>,

    /// Optimiser iteration cap
    #[clap(long = "max_iter", default_value_t = 500)]
    pub max_iter: usize,
}

impl DwiCmd {
    pub fn run(self) -> Result<()> {
        let mut run = self.output.open("qmri_DWI")?;

        let method = DwiMethod::parse(&self.method)?;
        let inputs = self
            .inputs
            .iter()
            .map(|p| common::load_image(p, run.read_format))
            .collect::<Result<Vec<_>>>()?;
        run.log(&format!(
            "loaded {} b-value volumes for {}",
            inputs.len(),
            method.name()
        ));

        let options = DwiMapperOptions {
            method,
            noise_threshold: self.noise_threshold,
            b_threshold: self.b_threshold,
            max_iters: self.max_iter,
        };
        let mut mapper = DwiMapper::new(options, inputs)?;
        if let Some(roi) = common::load_roi(self.roi.as_ref(), run.read_format)? {
            mapper.set_roi(roi)?;
        }
        if let Some(path) = &self.err {
            mapper.set_tracker_image(common::load_image(path, run.read_format)?)?;
        }

        mapper.run()?;

        let maps: Vec<(String, libqmri::Image3D)> = mapper
            .maps()
            .map(|(n, img)| (n.to_string(), img.clone()))
            .collect();
        for (name, img) in &maps {
            run.save_map(name, img)?;
        }
        run.save_map("error_tracker", mapper.tracker().image())?;

        run.log("qmri_DWI finished");
        run.audit("qmri_DWI finished");
        Ok(())
    }
}
