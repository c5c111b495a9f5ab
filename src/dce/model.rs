//! Tracer-kinetic model instances: one enum identifying the concrete model,
//! one struct owning the parameter state, and match-dispatch into the
//! per-model concentration functions in [`super::models`].

use std::sync::Arc;

use crate::aif::Aif;
use crate::errors::QmriError;
use crate::tracker::ErrorCode;

use super::models::{self, ParamTable};

/// Maximum plausible kep (=Ktrans/v_e) for the Tofts family; larger values
/// mark the fit as failed.
pub const KEP_MAX: f64 = 42.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DceModelKind {
    None,
    Tofts,
    Etm,
    Dietm,
    Auem,
    Discm,
    TwoCxm,
    Di2cxm,
    Dibem,
    DibemFp,
    Patlak,
    Mldrw,
}

impl DceModelKind {
    /// Model name as used on the command line and in map filenames.
    pub fn name(self) -> &'static str {
        match self {
            DceModelKind::None => "NONE",
            DceModelKind::Tofts => "TOFTS",
            DceModelKind::Etm => "ETM",
            DceModelKind::Dietm => "DIETM",
            DceModelKind::Auem => "AUEM",
            DceModelKind::Discm => "DISCM",
            DceModelKind::TwoCxm => "2CXM",
            DceModelKind::Di2cxm => "DI2CXM",
            DceModelKind::Dibem => "DIBEM",
            DceModelKind::DibemFp => "DIBEM_FP",
            DceModelKind::Patlak => "PATLAK",
            DceModelKind::Mldrw => "MLDRW",
        }
    }

    pub fn implemented() -> &'static [&'static str] {
        &[
            "ETM", "DIETM", "DISCM", "2CXM", "DI2CXM", "AUEM", "DIBEM", "DIBEM_FP", "PATLAK",
            "TOFTS", "MLDRW", "NONE",
        ]
    }

    /// Parse a model name, accepting the historical aliases. Returns None for
    /// unrecognised names; callers turn that into a config error.
    pub fn parse(name: &str) -> Option<DceModelKind> {
        match name {
            "NONE" => Some(DceModelKind::None),
            "TOFTS" | "TM" => Some(DceModelKind::Tofts),
            "ETM" => Some(DceModelKind::Etm),
            "DIETM" => Some(DceModelKind::Dietm),
            "AUEM" | "GADOXETATE" => Some(DceModelKind::Auem),
            "DISCM" | "MATERNE" => Some(DceModelKind::Discm),
            "2CXM" => Some(DceModelKind::TwoCxm),
            "DI2CXM" => Some(DceModelKind::Di2cxm),
            "DIBEM" | "DIIRF" => Some(DceModelKind::Dibem),
            "DIBEM_FP" => Some(DceModelKind::DibemFp),
            "PATLAK" => Some(DceModelKind::Patlak),
            "MLDRW" => Some(DceModelKind::Mldrw),
            _ => None,
        }
    }

    fn table(self) -> &'static ParamTable {
        match self {
            DceModelKind::None => &models::NONE_TABLE,
            DceModelKind::Tofts | DceModelKind::Etm => &models::etm::TABLE,
            DceModelKind::Dietm => &models::dietm::TABLE,
            DceModelKind::Auem => &models::auem::TABLE,
            DceModelKind::Discm => &models::discm::TABLE,
            DceModelKind::TwoCxm => &models::two_cxm::TABLE,
            DceModelKind::Di2cxm => &models::di2cxm::TABLE,
            DceModelKind::Dibem => &models::dibem::TABLE,
            DceModelKind::DibemFp => &models::dibem_fp::TABLE,
            DceModelKind::Patlak => &models::patlak::TABLE,
            DceModelKind::Mldrw => &models::mldrw::TABLE,
        }
    }
}

/// User overrides applied when materialising a model from its name.
#[derive(Debug, Clone, Default)]
pub struct ModelOverrides {
    pub param_names: Vec<String>,
    pub init_params: Vec<f64>,
    pub fixed_params: Vec<usize>,
    pub fixed_values: Vec<f64>,
    pub relative_limit_params: Vec<usize>,
    pub relative_limit_values: Vec<f64>,
    pub repeat_param: Option<usize>,
    pub repeat_values: Vec<f64>,
}

/// One tracer-kinetic model at one voxel: parameter vectors, bounds, a
/// reference to the shared AIF and the cached modelled Ct(t).
#[derive(Debug, Clone)]
pub struct DceModel {
    kind: DceModelKind,
    aif: Arc<Aif>,
    params: Vec<f64>,
    init_params: Vec<f64>,
    param_names: Vec<String>,
    opt_flags: Vec<bool>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    repeat_param: Option<usize>,
    repeat_values: Vec<f64>,
    repeat_cursor: usize,
    ct_model: Vec<f64>,
    error_code: ErrorCode,
}

/// Materialise a model of the given kind with the user's overrides applied.
pub fn create_model(
    kind: DceModelKind,
    aif: Arc<Aif>,
    overrides: &ModelOverrides,
) -> Result<DceModel, QmriError> {
    let table = kind.table();
    let n = table.names.len();

    let param_names = if overrides.param_names.is_empty() {
        table.names.iter().map(|s| s.to_string()).collect()
    } else {
        if overrides.param_names.len() != n {
            return Err(QmriError::config(format!(
                "{} expects {n} parameter names, got {}",
                kind.name(),
                overrides.param_names.len()
            )));
        }
        overrides.param_names.clone()
    };

    let init_params = if overrides.init_params.is_empty() {
        table.init.to_vec()
    } else {
        if overrides.init_params.len() != n {
            return Err(QmriError::config(format!(
                "{} expects {n} initial parameters, got {}",
                kind.name(),
                overrides.init_params.len()
            )));
        }
        overrides.init_params.clone()
    };

    let mut fixed: Vec<(usize, Option<f64>)> = overrides
        .fixed_params
        .iter()
        .enumerate()
        .map(|(pos, &idx)| (idx, overrides.fixed_values.get(pos).copied()))
        .collect();

    // TOFTS is ETM with v_p pinned at zero unless the caller overrides it
    if kind == DceModelKind::Tofts && !fixed.iter().any(|&(idx, _)| idx == models::etm::VP_INDEX) {
        fixed.push((models::etm::VP_INDEX, Some(0.0)));
    }

    let mut model = DceModel {
        kind,
        aif,
        params: init_params.clone(),
        init_params,
        param_names,
        opt_flags: vec![true; n],
        lower: table.lower.to_vec(),
        upper: table.upper.to_vec(),
        repeat_param: overrides.repeat_param,
        repeat_values: overrides.repeat_values.clone(),
        repeat_cursor: 0,
        ct_model: Vec::new(),
        error_code: ErrorCode::Ok,
    };

    for &idx in table.default_fixed {
        model.opt_flags[idx] = false;
    }

    for &(idx, value) in &fixed {
        if idx >= n {
            return Err(QmriError::config(format!(
                "fixed parameter index {idx} outside [0,{n}) for {}",
                kind.name()
            )));
        }
        model.opt_flags[idx] = false;
        if let Some(v) = value {
            model.init_params[idx] = v;
            model.params[idx] = v;
        }
    }

    for (pos, &idx) in overrides.relative_limit_params.iter().enumerate() {
        if idx >= n {
            return Err(QmriError::config(format!(
                "relative limit index {idx} outside [0,{n}) for {}",
                kind.name()
            )));
        }
        if fixed.iter().any(|&(f, _)| f == idx) {
            return Err(QmriError::config(format!(
                "parameter {idx} of {} given both fixed and relative-limit",
                kind.name()
            )));
        }
        let r = overrides.relative_limit_values.get(pos).copied().ok_or_else(|| {
            QmriError::config("relative limit indices and values differ in length")
        })?;
        let init = model.init_params[idx];
        model.lower[idx] = model.lower[idx].max(init - r);
        model.upper[idx] = model.upper[idx].min(init + r);
    }

    for i in 0..n {
        if model.init_params[i] < model.lower[i] || model.init_params[i] > model.upper[i] {
            return Err(QmriError::config(format!(
                "initial value {} of parameter {} outside bounds [{}, {}] for {}",
                model.init_params[i],
                model.param_names[i],
                model.lower[i],
                model.upper[i],
                kind.name()
            )));
        }
    }

    if let Some(rp) = model.repeat_param {
        if rp >= n {
            return Err(QmriError::config(format!(
                "repeat parameter index {rp} outside [0,{n}) for {}",
                kind.name()
            )));
        }
    }

    Ok(model)
}

impl DceModel {
    pub fn kind(&self) -> DceModelKind {
        self.kind
    }

    pub fn aif(&self) -> &Aif {
        &self.aif
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn num_optimised(&self) -> usize {
        self.opt_flags.iter().filter(|&&f| f).count()
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn init_params(&self) -> &[f64] {
        &self.init_params
    }

    pub fn set_params(&mut self, params: Vec<f64>) {
        debug_assert_eq!(params.len(), self.params.len());
        self.params = params;
    }

    /// Seed both current and initial values, used by per-voxel init maps.
    pub fn set_init_params(&mut self, params: Vec<f64>) {
        debug_assert_eq!(params.len(), self.params.len());
        self.params = params.clone();
        self.init_params = params;
    }

    pub fn zero_params(&mut self) {
        self.params.iter_mut().for_each(|p| *p = 0.0);
    }

    /// Reset for a new voxel: zeroed Ct cache of the run length, parameters
    /// back to their initial values, repeat sweep rewound.
    pub fn reset(&mut self, n_times: usize) {
        self.ct_model.clear();
        self.ct_model.resize(n_times, 0.0);
        self.params = self.init_params.clone();
        self.repeat_cursor = 0;
        self.error_code = ErrorCode::Ok;
    }

    pub fn ct_model(&self) -> &[f64] {
        &self.ct_model
    }

    /// Values of the free parameters, in canonical order.
    pub fn optimised_params(&self) -> Vec<f64> {
        self.params
            .iter()
            .zip(self.opt_flags.iter())
            .filter(|(_, &f)| f)
            .map(|(&p, _)| p)
            .collect()
    }

    /// Scatter an optimised subset back into the full parameter vector.
    pub fn set_optimised_params(&mut self, opt: &[f64]) {
        let mut it = opt.iter();
        for (p, &f) in self.params.iter_mut().zip(self.opt_flags.iter()) {
            if f {
                *p = *it.next().expect("optimised parameter count");
            }
        }
    }

    pub fn optimised_lower_bounds(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(self.opt_flags.iter())
            .filter(|(_, &f)| f)
            .map(|(&b, _)| b)
            .collect()
    }

    pub fn optimised_upper_bounds(&self) -> Vec<f64> {
        self.upper
            .iter()
            .zip(self.opt_flags.iter())
            .filter(|(_, &f)| f)
            .map(|(&b, _)| b)
            .collect()
    }

    /// True when no repeat-initialisation sweep is configured.
    pub fn single_fit(&self) -> bool {
        self.repeat_param.is_none() || self.repeat_values.is_empty()
    }

    /// Advance the repeat sweep: rewind the parameters to a fresh initial
    /// vector with the repeat parameter set to its next value.
    pub fn next_repeat_param(&mut self) -> bool {
        let rp = match self.repeat_param {
            Some(rp) => rp,
            None => return false,
        };
        if self.repeat_cursor >= self.repeat_values.len() {
            return false;
        }
        self.params = self.init_params.clone();
        self.params[rp] = self.repeat_values[self.repeat_cursor];
        self.repeat_cursor += 1;
        true
    }

    /// Fill the cached Ct(t) for the first `n_times` samples.
    pub fn compute_ct(&mut self, n_times: usize) {
        let n = n_times.min(self.ct_model.len());
        let (params, aif) = (&self.params, self.aif.as_ref());
        let ct = &mut self.ct_model[..n];
        match self.kind {
            DceModelKind::None => ct.iter_mut().for_each(|c| *c = 0.0),
            DceModelKind::Tofts | DceModelKind::Etm => models::etm::compute_ct(params, aif, ct),
            DceModelKind::Dietm => models::dietm::compute_ct(params, aif, ct),
            DceModelKind::Auem => models::auem::compute_ct(params, aif, ct),
            DceModelKind::Discm => models::discm::compute_ct(params, aif, ct),
            DceModelKind::TwoCxm => models::two_cxm::compute_ct(params, aif, ct),
            DceModelKind::Di2cxm => models::di2cxm::compute_ct(params, aif, ct),
            DceModelKind::Dibem => models::dibem::compute_ct(params, aif, ct),
            DceModelKind::DibemFp => models::dibem_fp::compute_ct(params, aif, ct),
            DceModelKind::Patlak => models::patlak::compute_ct(params, aif, ct),
            DceModelKind::Mldrw => models::mldrw::compute_ct(params, aif, ct),
        }
    }

    /// Validate the current parameters, recording the model error code.
    pub fn check_params(&mut self) {
        for &p in &self.params {
            if !p.is_finite() {
                self.error_code = ErrorCode::DceFitFail;
                return;
            }
        }
        let kep_ok = match self.kind {
            DceModelKind::Tofts | DceModelKind::Etm | DceModelKind::Dietm => {
                let (ktrans, ve) = (self.params[0], self.params[1]);
                ve <= 0.0 || ktrans / ve <= KEP_MAX
            }
            _ => true,
        };
        self.error_code = if kep_ok {
            ErrorCode::Ok
        } else {
            ErrorCode::DceFitFail
        };
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error_code
    }

    /// Design matrix for models with a linear solution, row-major N x M.
    pub fn lls_matrix(&self, ct_data: &[f64]) -> Result<(Vec<f64>, usize), QmriError> {
        match self.kind {
            DceModelKind::Patlak => models::patlak::lls_matrix(self.aif.as_ref(), ct_data),
            _ => Err(QmriError::Unsupported(format!(
                "{} has no linear least-squares form",
                self.kind.name()
            ))),
        }
    }

    /// Map a linear solution vector back onto the model parameters.
    pub fn transform_lls_solution(&mut self, solution: &[f64]) {
        if self.kind == DceModelKind::Patlak {
            models::patlak::transform_lls_solution(&mut self.params, solution);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aif::{AifType, PifType};

    fn test_aif(n: usize) -> Arc<Aif> {
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times((0..n).map(|i| i as f64 / 10.0).collect()).unwrap();
        aif.set_prebolus(5).unwrap();
        aif.resample().unwrap();
        Arc::new(aif)
    }

    #[test]
    fn parse_names_and_aliases() {
        assert_eq!(DceModelKind::parse("ETM"), Some(DceModelKind::Etm));
        assert_eq!(DceModelKind::parse("TM"), Some(DceModelKind::Tofts));
        assert_eq!(DceModelKind::parse("MATERNE"), Some(DceModelKind::Discm));
        assert_eq!(DceModelKind::parse("DIIRF"), Some(DceModelKind::Dibem));
        assert_eq!(DceModelKind::parse("nope"), None);
    }

    #[test]
    fn tofts_pins_vp_to_zero() {
        let model = create_model(
            DceModelKind::Tofts,
            test_aif(20),
            &ModelOverrides::default(),
        )
        .unwrap();
        assert_eq!(model.params()[models::etm::VP_INDEX], 0.0);
        assert!(!model.opt_flags[models::etm::VP_INDEX]);
        // ETM has 5 params, TOFTS frees 3 of them (f_a is fixed by default)
        assert_eq!(model.num_params(), 5);
        assert_eq!(model.num_optimised(), 3);
    }

    #[test]
    fn fixed_and_relative_limit_conflict_is_error() {
        let overrides = ModelOverrides {
            fixed_params: vec![0],
            fixed_values: vec![0.1],
            relative_limit_params: vec![0],
            relative_limit_values: vec![0.05],
            ..Default::default()
        };
        assert!(create_model(DceModelKind::Etm, test_aif(20), &overrides).is_err());
    }

    #[test]
    fn out_of_range_index_is_error() {
        let overrides = ModelOverrides {
            fixed_params: vec![99],
            ..Default::default()
        };
        assert!(create_model(DceModelKind::Etm, test_aif(20), &overrides).is_err());
    }

    #[test]
    fn relative_limits_tighten_bounds() {
        let overrides = ModelOverrides {
            relative_limit_params: vec![0],
            relative_limit_values: vec![0.05],
            ..Default::default()
        };
        let model = create_model(DceModelKind::Etm, test_aif(20), &overrides).unwrap();
        let init = model.init_params()[0];
        assert_eq!(model.lower[0], (init - 0.05).max(0.0));
        assert_eq!(model.upper[0], init + 0.05);
    }

    #[test]
    fn repeat_sweep_rewinds_initials() {
        let overrides = ModelOverrides {
            repeat_param: Some(3),
            repeat_values: vec![0.0, 0.1, 0.2],
            ..Default::default()
        };
        let mut model = create_model(DceModelKind::Etm, test_aif(20), &overrides).unwrap();
        model.reset(20);
        assert!(!model.single_fit());
        let mut seen = Vec::new();
        while model.next_repeat_param() {
            seen.push(model.params()[3]);
        }
        assert_eq!(seen, vec![0.0, 0.1, 0.2]);
    }

    #[test]
    fn nan_params_fail_check() {
        let mut model =
            create_model(DceModelKind::Etm, test_aif(20), &ModelOverrides::default()).unwrap();
        model.reset(20);
        let mut params = model.params().to_vec();
        params[0] = f64::NAN;
        model.set_params(params);
        model.check_params();
        assert_eq!(model.error_code(), ErrorCode::DceFitFail);
    }
}
