//! Voxel-wise ADC/IVIM mapping, same shape as the T1 mapper: b-value
//! volumes in, one parameter map per fitted parameter out.

use fnv::FnvHashMap;
use rayon::prelude::*;

use crate::errors::QmriError;
use crate::image::{Image3D, ImageType};
use crate::tracker::{ErrorCode, ErrorTracker};

use super::methods::{self, IVIM_DEFAULT_B_THRESHOLD};
use super::DwiMethod;

#[derive(Debug, Clone)]
pub struct DwiMapperOptions {
    pub method: DwiMethod,
    /// Voxels whose weakest input signal sits below this are not fitted.
    pub noise_threshold: f64,
    /// b-value separating perfusion and diffusion phases for IVIM.
    pub b_threshold: f64,
    pub max_iters: usize,
}

impl Default for DwiMapperOptions {
    fn default() -> Self {
        DwiMapperOptions {
            method: DwiMethod::Adc,
            noise_threshold: 0.0,
            b_threshold: IVIM_DEFAULT_B_THRESHOLD,
            max_iters: 500,
        }
    }
}

struct DwiVoxelResult {
    idx: usize,
    params: Vec<f64>,
    code: ErrorCode,
}

pub struct DwiMapper {
    options: DwiMapperOptions,
    inputs: Vec<Image3D>,
    b_values: Vec<f64>,
    roi: Option<Image3D>,
    tracker: ErrorTracker,
    maps: FnvHashMap<&'static str, Image3D>,
}

impl DwiMapper {
    pub fn new(options: DwiMapperOptions, inputs: Vec<Image3D>) -> Result<Self, QmriError> {
        let method = options.method;
        if inputs.len() < method.minimum_inputs() || inputs.len() > method.maximum_inputs() {
            return Err(QmriError::config(format!(
                "{} requires between {} and {} b-value volumes, got {}",
                method.name(),
                method.minimum_inputs(),
                method.maximum_inputs(),
                inputs.len()
            )));
        }
        for img in &inputs[1..] {
            inputs[0].check_same_grid(img, true)?;
        }
        let b_values: Vec<f64> = inputs
            .iter()
            .map(|img| {
                img.meta().b_value.ok_or_else(|| {
                    QmriError::config("DWI input volume carries no b-value in its metadata")
                })
            })
            .collect::<Result<_, _>>()?;

        let tracker = ErrorTracker::new(&inputs[0]);
        let image_type = match method {
            DwiMethod::Adc | DwiMethod::AdcLin => ImageType::Adc,
            _ => ImageType::Ivim,
        };
        let mut maps = FnvHashMap::default();
        for &name in method.param_names() {
            maps.insert(name, inputs[0].copy_shape(image_type));
        }
        Ok(DwiMapper {
            options,
            inputs,
            b_values,
            roi: None,
            tracker,
            maps,
        })
    }

    pub fn set_roi(&mut self, roi: Image3D) -> Result<(), QmriError> {
        self.inputs[0].check_same_grid(&roi, true)?;
        self.roi = Some(roi);
        Ok(())
    }

    pub fn set_tracker_image(&mut self, image: Image3D) -> Result<(), QmriError> {
        self.tracker = ErrorTracker::from_image(image, &self.inputs[0])?;
        Ok(())
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn map(&self, name: &str) -> Option<&Image3D> {
        self.maps.get(name)
    }

    pub fn maps(&self) -> impl Iterator<Item = (&'static str, &Image3D)> {
        self.options
            .method
            .param_names()
            .iter()
            .map(move |&n| (n, &self.maps[n]))
    }

    pub fn run(&mut self) -> Result<(), QmriError> {
        let voxels: Vec<usize> = (0..self.inputs[0].num_voxels())
            .filter(|&idx| {
                self.roi
                    .as_ref()
                    .map_or(true, |roi| roi.voxel(idx) != 0.0)
            })
            .collect();
        log::info!(
            "mapping {} over {} voxels",
            self.options.method.name(),
            voxels.len()
        );

        let results: Vec<DwiVoxelResult> = voxels
            .par_iter()
            .map(|&idx| self.map_voxel(idx))
            .collect();

        let names = self.options.method.param_names();
        for r in results {
            self.tracker.or_voxel(r.idx, r.code);
            if r.code == ErrorCode::Ok {
                for (&name, &value) in names.iter().zip(r.params.iter()) {
                    self.maps.get_mut(name).unwrap().set_voxel(r.idx, value);
                }
            }
        }
        Ok(())
    }

    fn map_voxel(&self, idx: usize) -> DwiVoxelResult {
        let signals: Vec<f64> = self.inputs.iter().map(|img| img.voxel(idx)).collect();

        let min_signal = signals.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        if min_signal < self.options.noise_threshold {
            return DwiVoxelResult {
                idx,
                params: Vec::new(),
                code: ErrorCode::VfaThreshFail,
            };
        }

        let fit: Result<Vec<f64>, ErrorCode> = match self.options.method {
            DwiMethod::Adc => methods::adc_nls(&signals, &self.b_values, self.options.max_iters)
                .map(|(s0, adc)| vec![s0, adc]),
            DwiMethod::AdcLin => {
                methods::adc_linear(&signals, &self.b_values).map(|(s0, adc)| vec![s0, adc])
            }
            DwiMethod::Ivim => methods::ivim(
                &signals,
                &self.b_values,
                self.options.b_threshold,
                self.options.max_iters,
            )
            .map(|(s0, f, d, d_star)| vec![s0, f, d, d_star]),
            DwiMethod::IvimSimple => {
                methods::ivim_simple(&signals, &self.b_values, self.options.b_threshold)
                    .map(|(s0, f, d, d_star)| vec![s0, f, d, d_star])
            }
        };

        match fit {
            Ok(params) => DwiVoxelResult {
                idx,
                params,
                code: ErrorCode::Ok,
            },
            Err(code) => DwiVoxelResult {
                idx,
                params: Vec::new(),
                code,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    fn dwi_inputs(s0: f64, adc: f64, b_values: &[f64]) -> Vec<Image3D> {
        b_values
            .iter()
            .map(|&b| {
                let mut img = Image3D::new(2, 1, 1);
                img.meta_mut().b_value = Some(b);
                img.fill(s0 * (-b * adc).exp());
                img
            })
            .collect()
    }

    #[test]
    fn adc_linear_maps_volume() {
        let inputs = dwi_inputs(1000.0, 1.0e-3, &[0.0, 400.0, 800.0]);
        let options = DwiMapperOptions {
            method: DwiMethod::AdcLin,
            ..Default::default()
        };
        let mut mapper = DwiMapper::new(options, inputs).unwrap();
        mapper.run().unwrap();

        assert_float_eq!(mapper.map("ADC").unwrap().voxel(0), 1.0e-3, rel <= 1e-9);
        assert_float_eq!(mapper.map("S0").unwrap().voxel(0), 1000.0, rel <= 1e-9);
        assert!(mapper.tracker().voxel_ok(0));
    }

    #[test]
    fn too_few_b_values_rejected() {
        let inputs = dwi_inputs(1000.0, 1.0e-3, &[0.0]);
        assert!(DwiMapper::new(DwiMapperOptions::default(), inputs).is_err());
    }

    #[test]
    fn missing_b_metadata_rejected() {
        let mut inputs = dwi_inputs(1000.0, 1.0e-3, &[0.0, 400.0, 800.0]);
        inputs[1].meta_mut().b_value = None;
        assert!(DwiMapper::new(DwiMapperOptions::default(), inputs).is_err());
    }

    #[test]
    fn zero_signal_voxel_flagged() {
        let mut inputs = dwi_inputs(1000.0, 1.0e-3, &[0.0, 400.0, 800.0]);
        for img in &mut inputs {
            img.set_voxel(1, 0.0);
        }
        let options = DwiMapperOptions {
            method: DwiMethod::AdcLin,
            ..Default::default()
        };
        let mut mapper = DwiMapper::new(options, inputs).unwrap();
        mapper.run().unwrap();

        assert_eq!(mapper.map("ADC").unwrap().voxel(1), 0.0);
        assert!(!mapper.tracker().voxel_ok(1));
    }
}
