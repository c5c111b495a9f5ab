//! `qmri t1`: T1/M0 mapping from VFA or IR volumes.

use std::path::PathBuf;

use clap::Parser;
use eyre::Result;
use libqmri::t1::{T1Mapper, T1MapperOptions, T1Method};

use super::common::{self, OutputOpts};

#[derive(Debug, Parser)]
pub struct T1Cmd {
    #[clap(flatten)]
    pub output: OutputOpts,

    /// Mapping method: VFA, VFA_B1, VFA_LIN or IR
    #[clap(long = "T1_method", default_value = "VFA")]
    pub method: String,

    /// Input volumes; flip angle (VFA) or TI (IR) comes from each XTR
    #[clap(long = "T1_vols", num_args = 2..)]
    pub inputs: Vec<PathBuf>,

    /// Signal threshold below which voxels are not fitted
    #[clap(long = "T1_noise", default_value_t = 0.0)]
    pub noise_threshold: f64,

    /// Long-TR override for IR fitting, ms
    #[clap(long = "big_tr")]
    pub big_tr: Option<f64>,

    /// B1 correction map (VFA_B1)
    #[clap(long = "B1")]
    pub b1: Option<PathBuf>,

    /// Divisor for raw B1 values, e.g. 100 for percent maps
    #[clap(long = "B1_scaling", default_value_t = 1.0)]
    pub b1_scaling: f64,

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

impl T1Cmd {
    pub fn run(self) -> Result<()> {
        let mut run = self.output.open("qmri_T1")?;

        let method = T1Method::parse(&self.method)?;
        let inputs = self
            .inputs
            .iter()
            .map(|p| common::load_image(p, run.read_format))
            .collect::<Result<Vec<_>>>()?;
        run.log(&format!(
            "loaded {} input volumes for {}",
            inputs.len(),
            method.name()
        ));

        let options = T1MapperOptions {
            method,
            noise_threshold: self.noise_threshold,
            big_tr: self.big_tr,
            max_iters: self.max_iter,
            b1_scaling: self.b1_scaling,
        };
        let mut mapper = T1Mapper::new(options, inputs)?;
        if let Some(path) = &self.b1 {
            mapper.set_b1(common::load_image(path, run.read_format)?)?;
        }
        if let Some(roi) = common::load_roi(self.roi.as_ref(), run.read_format)? {
            mapper.set_roi(roi)?;
        }
        if let Some(path) = &self.err {
            mapper.set_tracker_image(common::load_image(path, run.read_format)?)?;
        }

        mapper.run()?;

        run.save_map("T1", mapper.t1())?;
        run.save_map("M0", mapper.m0())?;
        run.save_map("error_tracker", mapper.tracker().image())?;

        run.log("qmri_T1 finished");
        run.audit("qmri_T1 finished");
        Ok(())
    }
}
