//! Drives the optimiser for one model at one voxel.

use nalgebra::{DMatrix, DVector};

use crate::optimise::{self, FitterType, BAD_FIT_SSD};

use super::model::DceModel;
use super::voxel::VoxelStatus;

/// Fit configuration plus the running fit error. The model and the observed
/// Ct series are borrowed per call, each parallel worker owns its own
/// `(model, fitter)` pair.
#[derive(Debug, Clone)]
pub struct ModelFitter {
    timepoint_0: usize,
    timepoint_n: usize,
    noise_var: Vec<f64>,
    backend: FitterType,
    max_iters: usize,
    model_fit_error: f64,
}

impl ModelFitter {
    /// `noise_var` may be empty, in which case uniform unit noise applies.
    pub fn new(
        timepoint_0: usize,
        timepoint_n: usize,
        noise_var: Vec<f64>,
        backend: FitterType,
        max_iters: usize,
    ) -> Self {
        ModelFitter {
            timepoint_0,
            timepoint_n,
            noise_var,
            backend,
            max_iters,
            model_fit_error: 0.0,
        }
    }

    pub fn timepoint_0(&self) -> usize {
        self.timepoint_0
    }

    pub fn timepoint_n(&self) -> usize {
        self.timepoint_n
    }

    pub fn model_fit_error(&self) -> f64 {
        self.model_fit_error
    }

    /// Prepare the model for this voxel: clamp the fit window into the data,
    /// reset the Ct cache, default the noise and record the SSD of the
    /// initial parameters.
    pub fn initialise_fit(&mut self, model: &mut DceModel, ct_data: &[f64]) {
        if self.timepoint_n == 0 || self.timepoint_n > ct_data.len() {
            self.timepoint_n = ct_data.len();
        }
        if self.timepoint_0 >= self.timepoint_n {
            self.timepoint_0 = 0;
        }

        model.reset(self.timepoint_n);

        if model.num_params() == 0 {
            return;
        }

        if self.noise_var.is_empty() {
            self.noise_var = vec![1.0; self.timepoint_n];
        }

        self.model_fit_error = self.ct_ssd(model, ct_data);
    }

    /// Fit the model to the voxel. Non-fittable voxels get zeroed parameters
    /// and a zero fit error.
    pub fn fit(&mut self, model: &mut DceModel, ct_data: &[f64], status: VoxelStatus) {
        if model.num_params() == 0 {
            return;
        }
        if !status.fittable() {
            model.zero_params();
            self.model_fit_error = 0.0;
            return;
        }

        if model.single_fit() {
            self.optimise_once(model, ct_data);
        } else {
            // repeat-initialisation sweep, keep the best (SSD, params) pair
            let mut lowest = f64::MAX;
            let mut best_params = model.params().to_vec();
            while model.next_repeat_param() {
                self.optimise_once(model, ct_data);
                if self.model_fit_error < lowest {
                    lowest = self.model_fit_error;
                    best_params = model.params().to_vec();
                }
            }
            model.set_params(best_params);
            model.compute_ct(self.timepoint_n);
            self.model_fit_error = lowest;
        }
    }

    fn optimise_once(&mut self, model: &mut DceModel, ct_data: &[f64]) {
        if self.backend == FitterType::Lls {
            self.optimise_lls(model, ct_data);
        } else {
            let x0 = model.optimised_params();
            let lb = model.optimised_lower_bounds();
            let ub = model.optimised_upper_bounds();

            let (t0, tn) = (self.timepoint_0, self.timepoint_n);
            let noise = &self.noise_var;
            let objective = |x: &[f64]| {
                model.set_optimised_params(x);
                ct_ssd_inner(model, ct_data, t0, tn, noise)
            };
            let best = optimise::fit_bound_constrained(
                &x0,
                &lb,
                &ub,
                objective,
                self.max_iters,
                self.backend,
            );
            model.set_optimised_params(&best);
        }
        self.model_fit_error = self.ct_ssd(model, ct_data);
    }

    /// Weighted linear solve `W·C = W·A·B`, then map the solution back onto
    /// the model parameters.
    fn optimise_lls(&mut self, model: &mut DceModel, ct_data: &[f64]) {
        let (design, m) = match model.lls_matrix(ct_data) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("linear fit unavailable: {e}");
                self.model_fit_error = BAD_FIT_SSD;
                return;
            }
        };
        let n = self.timepoint_n.min(ct_data.len());
        let a = DMatrix::from_row_slice(n, m, &design[..n * m]);
        let c = DVector::from_row_slice(&ct_data[..n]);
        let weights: Vec<f64> = self.noise_var[..n].iter().map(|&v| 1.0 / v).collect();
        match optimise::fit_linear_weighted(&a, &c, &weights) {
            Ok(b) => model.transform_lls_solution(b.as_slice()),
            Err(e) => {
                log::warn!("linear fit failed: {e}");
                self.model_fit_error = BAD_FIT_SSD;
            }
        }
    }

    fn ct_ssd(&self, model: &mut DceModel, ct_data: &[f64]) -> f64 {
        ct_ssd_inner(
            model,
            ct_data,
            self.timepoint_0,
            self.timepoint_n,
            &self.noise_var,
        )
    }
}

/// Check parameters, recompute the modelled Ct and return the weighted SSD.
/// Invalid parameters short-circuit to `BAD_FIT_SSD` so the optimiser sees a
/// monotone objective.
fn ct_ssd_inner(
    model: &mut DceModel,
    ct_data: &[f64],
    t0: usize,
    tn: usize,
    noise_var: &[f64],
) -> f64 {
    model.check_params();
    if model.error_code() != crate::tracker::ErrorCode::Ok {
        return BAD_FIT_SSD;
    }
    model.compute_ct(tn);

    let ct_model = model.ct_model();
    let mut ssd = 0.0;
    for i in t0..tn {
        let diff = ct_data[i] - ct_model[i];
        ssd += diff * diff / noise_var[i];
    }
    if ssd.is_finite() {
        ssd
    } else {
        BAD_FIT_SSD
    }
}
