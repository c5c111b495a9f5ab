//! `qmri dce-lite`: per-voxel model fitting from delimited text, one row per
//! voxel, no image volumes involved.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{eyre, Context, Result};
use libqmri::aif::{Aif, AifType, PifType};
use libqmri::dce::model::{self, DceModelKind, ModelOverrides};
use libqmri::lite::{self, LiteOptions};
use libqmri::optimise::FitterType;

#[derive(Debug, Parser)]
pub struct DceLiteCmd {
    /// Input file, one whitespace-separated row per voxel
    #[clap(short, long)]
    pub data: PathBuf,

    /// Output file of fit results, one row per voxel
    #[clap(short, long)]
    pub output: PathBuf,

    /// Tracer-kinetic model name (e.g. ETM, TOFTS, 2CXM, PATLAK)
    #[clap(short, long)]
    pub model: String,

    /// Number of dynamic samples per row
    #[clap(long = "n_dyns")]
    pub n_dyns: usize,

    /// File of dynamic times in minutes, one per row
    #[clap(short = 't', long = "dyn_times")]
    pub dyn_times: PathBuf,

    /// Rows are concentrations already
    #[clap(long = "Ct_in")]
    pub ct_in: bool,

    /// Rows carry a T1 column after the samples
    #[clap(long = "T1_col")]
    pub t1_col: bool,

    /// Rows carry an M0 column after T1
    #[clap(long = "M0_col")]
    pub m0_col: bool,

    /// Rows carry a B1 column after M0
    #[clap(long = "B1_col")]
    pub b1_col: bool,

    /// Flip angle in degrees shared by all rows
    #[clap(long = "FA", default_value_t = 20.0)]
    pub fa: f64,

    /// TR in ms shared by all rows
    #[clap(long = "TR", default_value_t = 3.5)]
    pub tr: f64,

    /// Relaxivity constant, s^-1 mM^-1
    #[clap(long = "r1_const", default_value_t = 3.4)]
    pub r1_const: f64,

    /// Contrast dose, mmol/kg (population AIF)
    #[clap(long, default_value_t = 0.1)]
    pub dose: f64,

    /// Haematocrit
    #[clap(long, default_value_t = 0.42)]
    pub hct: f64,

    /// AIF file; defaults to the population AIF
    #[clap(long)]
    pub aif: Option<PathBuf>,

    /// PIF file for dual-input models
    #[clap(long)]
    pub pif: Option<PathBuf>,

    /// Index of the first image after contrast injection
    #[clap(long = "inj", default_value_t = 8)]
    pub injection_image: usize,

    /// Override the model's initial parameter values, one per parameter
    #[clap(long = "init_params", num_args = 1.., allow_hyphen_values = true)]
    pub init_params: Vec<f64>,

    /// Indices of parameters to hold fixed
    #[clap(long = "fixed_params", num_args = 1..)]
    pub fixed_params: Vec<usize>,

    /// Values for the fixed parameters, paired with --fixed_params
    #[clap(long = "fixed_values", num_args = 1.., allow_hyphen_values = true)]
    pub fixed_values: Vec<f64>,

    /// IAUC window lengths in seconds
    #[clap(long, num_args = 1.., default_values_t = vec![60.0, 90.0, 120.0])]
    pub iauc: Vec<f64>,

    /// Skip fitting voxels that fail the enhancement test
    #[clap(long = "test_enh")]
    pub test_enh: bool,

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

    /// Append modelled Ct columns to each output row
    #[clap(long = "Ct_mod")]
    pub ct_mod: bool,

    /// Append signal-derived Ct columns to each output row
    #[clap(long = "Ct_sig")]
    pub ct_sig: bool,
}

impl DceLiteCmd {
    pub fn run(self) -> Result<()> {
        let kind = DceModelKind::parse(&self.model).ok_or_else(|| {
            eyre!(
                "unknown model {:?}, expected one of {:?}",
                self.model,
                DceModelKind::implemented()
            )
        })?;

        let times = read_times(&self.dyn_times)?;
        if times.len() != self.n_dyns {
            return Err(eyre!(
                "{}: {} times for {} dynamic samples",
                self.dyn_times.display(),
                times.len(),
                self.n_dyns
            ));
        }

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
        }
        aif.resample()?;

        let overrides = ModelOverrides {
            init_params: self.init_params.clone(),
            fixed_params: self.fixed_params.clone(),
            fixed_values: self.fixed_values.clone(),
            ..Default::default()
        };
        let model = model::create_model(kind, Arc::new(aif), &overrides)?;

        let options = LiteOptions {
            n_dyns: self.n_dyns,
            input_ct: self.ct_in,
            has_t1: self.t1_col,
            has_m0: self.m0_col,
            has_b1: self.b1_col,
            fa: self.fa,
            tr: self.tr,
            r1: self.r1_const,
            prebolus: self.injection_image,
            times,
            iauc_times: self.iauc.clone(),
            iauc_at_peak: false,
            test_enhancement: self.test_enh,
            first_image: self.first,
            last_image: self.last,
            max_iters: self.max_iter,
            backend: FitterType::parse(&self.opt_type)?,
            output_ct_mod: self.ct_mod,
            output_ct_sig: self.ct_sig,
        };

        let input = File::open(&self.data)
            .wrap_err_with(|| format!("opening {}", self.data.display()))?;
        let output = File::create(&self.output)
            .wrap_err_with(|| format!("creating {}", self.output.display()))?;
        let n_voxels = lite::run(
            &options,
            &model,
            BufReader::new(input),
            BufWriter::new(output),
        )?;
        log::info!("wrote {} fitted voxels to {}", n_voxels, self.output.display());
        Ok(())
    }
}

/// One time per row, minutes; extra columns are ignored.
fn read_times(path: &PathBuf) -> Result<Vec<f64>> {
    let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
    let mut times = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let first = line
            .split_whitespace()
            .next()
            .expect("non-empty line has a token");
        times.push(
            first
                .parse()
                .map_err(|_| eyre!("{}:{}: bad time {first:?}", path.display(), lineno + 1))?,
        );
    }
    Ok(times)
}
