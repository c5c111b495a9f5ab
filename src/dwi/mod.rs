//! ADC and IVIM mapping from diffusion-weighted acquisitions.

pub mod mapper;
pub mod methods;

pub use mapper::{DwiMapper, DwiMapperOptions};

use crate::errors::QmriError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwiMethod {
    /// Mono-exponential decay, non-linear fit.
    Adc,
    /// Mono-exponential decay solved in log space.
    AdcLin,
    /// Full bi-exponential intra-voxel incoherent motion fit.
    Ivim,
    /// IVIM with D* pinned to zero and the fit partitioned about a
    /// threshold b-value.
    IvimSimple,
}

impl DwiMethod {
    pub fn parse(s: &str) -> Result<Self, QmriError> {
        match s {
            "ADC" => Ok(DwiMethod::Adc),
            "ADC_LIN" => Ok(DwiMethod::AdcLin),
            "IVIM" => Ok(DwiMethod::Ivim),
            "IVIM_SIMPLE" => Ok(DwiMethod::IvimSimple),
            _ => Err(QmriError::config(format!(
                "DWI method ({s}) is not recognised, must be one of ADC, ADC_LIN, IVIM or IVIM_SIMPLE"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DwiMethod::Adc => "ADC",
            DwiMethod::AdcLin => "ADC_LIN",
            DwiMethod::Ivim => "IVIM",
            DwiMethod::IvimSimple => "IVIM_SIMPLE",
        }
    }

    pub fn minimum_inputs(self) -> usize {
        match self {
            DwiMethod::Adc | DwiMethod::AdcLin => 2,
            DwiMethod::Ivim | DwiMethod::IvimSimple => 4,
        }
    }

    pub fn maximum_inputs(self) -> usize {
        usize::MAX
    }

    /// Names of the fitted parameters, one output map per entry.
    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            DwiMethod::Adc | DwiMethod::AdcLin => &["S0", "ADC"],
            DwiMethod::Ivim | DwiMethod::IvimSimple => &["S0", "f", "D", "Dstar"],
        }
    }
}
