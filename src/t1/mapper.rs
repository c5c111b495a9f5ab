//! Voxel-wise T1/M0 mapping over a volume.

use rayon::prelude::*;

use crate::errors::QmriError;
use crate::image::{Image3D, ImageType};
use crate::tracker::{ErrorCode, ErrorTracker};

use super::{ir, vfa, T1Method};

#[derive(Debug, Clone)]
pub struct T1MapperOptions {
    pub method: T1Method,
    /// Voxels whose weakest input signal sits below this are not fitted.
    pub noise_threshold: f64,
    /// Long-TR override for inversion recovery, ms.
    pub big_tr: Option<f64>,
    pub max_iters: usize,
    /// Divisor applied to raw B1 map values (e.g. 100 for percent maps).
    pub b1_scaling: f64,
}

impl Default for T1MapperOptions {
    fn default() -> Self {
        T1MapperOptions {
            method: T1Method::Vfa,
            noise_threshold: 0.0,
            big_tr: None,
            max_iters: 500,
            b1_scaling: 1.0,
        }
    }
}

struct T1VoxelResult {
    idx: usize,
    t1: f64,
    m0: f64,
    code: ErrorCode,
}

/// Maps T1 and M0 from a stack of VFA or IR input volumes. Inputs carry
/// their flip angle (VFA) or inversion time (IR) in the image metadata.
pub struct T1Mapper {
    options: T1MapperOptions,
    inputs: Vec<Image3D>,
    fa_or_ti: Vec<f64>,
    tr: f64,
    b1: Option<Image3D>,
    roi: Option<Image3D>,
    tracker: ErrorTracker,
    t1: Image3D,
    m0: Image3D,
}

impl T1Mapper {
    pub fn new(options: T1MapperOptions, inputs: Vec<Image3D>) -> Result<Self, QmriError> {
        let method = options.method;
        if inputs.len() < method.minimum_inputs() || inputs.len() > method.maximum_inputs() {
            return Err(QmriError::config(format!(
                "{} requires between {} and {} input volumes, got {}",
                method.name(),
                method.minimum_inputs(),
                method.maximum_inputs(),
                inputs.len()
            )));
        }
        for img in &inputs[1..] {
            inputs[0].check_same_grid(img, true)?;
        }

        let fa_or_ti: Vec<f64> = match method {
            T1Method::Ir => inputs
                .iter()
                .map(|img| img.meta().ti.ok_or_else(|| {
                    QmriError::config("IR input volume carries no TI in its metadata")
                }))
                .collect::<Result<_, _>>()?,
            _ => inputs
                .iter()
                .map(|img| img.meta().flip_angle.ok_or_else(|| {
                    QmriError::config("VFA input volume carries no flip angle in its metadata")
                }))
                .collect::<Result<_, _>>()?,
        };

        let tr = match (method, options.big_tr) {
            (T1Method::Ir, Some(big_tr)) => big_tr,
            _ => inputs[0]
                .meta()
                .tr
                .ok_or_else(|| QmriError::config("input volume carries no TR in its metadata"))?,
        };

        let tracker = ErrorTracker::new(&inputs[0]);
        let t1 = inputs[0].copy_shape(ImageType::T1);
        let m0 = inputs[0].copy_shape(ImageType::M0);
        Ok(T1Mapper {
            options,
            inputs,
            fa_or_ti,
            tr,
            b1: None,
            roi: None,
            tracker,
            t1,
            m0,
        })
    }

    pub fn set_b1(&mut self, b1: Image3D) -> Result<(), QmriError> {
        self.inputs[0].check_same_grid(&b1, true)?;
        self.b1 = Some(b1);
        Ok(())
    }

    pub fn set_roi(&mut self, roi: Image3D) -> Result<(), QmriError> {
        self.inputs[0].check_same_grid(&roi, true)?;
        self.roi = Some(roi);
        Ok(())
    }

    /// Resume error tracking from a prior run.
    pub fn set_tracker_image(&mut self, image: Image3D) -> Result<(), QmriError> {
        self.tracker = ErrorTracker::from_image(image, &self.inputs[0])?;
        Ok(())
    }

    pub fn t1(&self) -> &Image3D {
        &self.t1
    }

    pub fn m0(&self) -> &Image3D {
        &self.m0
    }

    pub fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    pub fn run(&mut self) -> Result<(), QmriError> {
        if self.options.method.uses_b1() && self.b1.is_none() {
            return Err(QmriError::config("VFA_B1 requires a B1 correction map"));
        }

        let voxels: Vec<usize> = (0..self.inputs[0].num_voxels())
            .filter(|&idx| {
                self.roi
                    .as_ref()
                    .map_or(true, |roi| roi.voxel(idx) != 0.0)
            })
            .collect();
        log::info!(
            "mapping T1 with {} over {} voxels",
            self.options.method.name(),
            voxels.len()
        );

        let results: Vec<T1VoxelResult> = voxels
            .par_iter()
            .map(|&idx| self.map_voxel(idx))
            .collect();

        for r in results {
            self.tracker.or_voxel(r.idx, r.code);
            if r.code == ErrorCode::Ok {
                self.t1.set_voxel(r.idx, r.t1);
                self.m0.set_voxel(r.idx, r.m0);
            }
        }
        Ok(())
    }

    fn map_voxel(&self, idx: usize) -> T1VoxelResult {
        let signals: Vec<f64> = self.inputs.iter().map(|img| img.voxel(idx)).collect();

        let min_signal = signals.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        if min_signal < self.options.noise_threshold {
            return T1VoxelResult {
                idx,
                t1: 0.0,
                m0: 0.0,
                code: ErrorCode::VfaThreshFail,
            };
        }

        let b1 = match &self.b1 {
            Some(map) if self.options.method.uses_b1() => {
                let raw = map.voxel(idx) / self.options.b1_scaling;
                if !(raw > 0.0) {
                    return T1VoxelResult {
                        idx,
                        t1: 0.0,
                        m0: 0.0,
                        code: ErrorCode::B1Invalid,
                    };
                }
                raw
            }
            _ => 1.0,
        };

        let fit = match self.options.method {
            T1Method::Vfa | T1Method::VfaB1 => vfa::fit_nls(
                &signals,
                &self.fa_or_ti,
                self.tr,
                b1,
                self.options.max_iters,
            ),
            T1Method::VfaLin => vfa::fit_linear(&signals, &self.fa_or_ti, self.tr, b1),
            T1Method::Ir => ir::fit(&signals, &self.fa_or_ti, self.tr, self.options.max_iters),
        };

        match fit {
            Ok((t1, m0)) => T1VoxelResult {
                idx,
                t1,
                m0,
                code: ErrorCode::Ok,
            },
            Err(code) => T1VoxelResult {
                idx,
                t1: 0.0,
                m0: 0.0,
                code,
            },
        }
    }
}
