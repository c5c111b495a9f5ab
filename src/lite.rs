//! Lite tools: per-voxel fitting straight from delimited text, no volumes.
//! One input row per voxel carries the dynamic samples (plus optional
//! T1/M0/B1 columns); one output row carries status, fit error, IAUC values
//! and the fitted parameters.

use std::io::{Read, Write};

use csv::{ReaderBuilder, StringRecord, WriterBuilder};

use crate::dce::fitter::ModelFitter;
use crate::dce::model::DceModel;
use crate::dce::voxel::{DceVoxel, M0Mode, VoxelStatus};
use crate::errors::QmriError;
use crate::optimise::{FitterType, BAD_FIT_SSD};
use crate::tracker::ErrorCode;

#[derive(Debug, Clone)]
pub struct LiteOptions {
    /// Number of dynamic samples per row.
    pub n_dyns: usize,
    /// Rows hold concentrations already, skip SPGR inversion.
    pub input_ct: bool,
    /// Row layout: a T1 column follows the dynamic samples.
    pub has_t1: bool,
    /// Row layout: an M0 column follows T1.
    pub has_m0: bool,
    /// Row layout: a B1 column follows M0.
    pub has_b1: bool,
    /// Acquisition parameters shared by all rows.
    pub fa: f64,
    pub tr: f64,
    pub r1: f64,
    pub prebolus: usize,
    /// Dynamic time grid in minutes, `n_dyns` entries.
    pub times: Vec<f64>,
    /// IAUC window lengths in seconds.
    pub iauc_times: Vec<f64>,
    pub iauc_at_peak: bool,
    pub test_enhancement: bool,
    pub first_image: usize,
    pub last_image: usize,
    pub max_iters: usize,
    pub backend: FitterType,
    pub output_ct_mod: bool,
    pub output_ct_sig: bool,
}

impl Default for LiteOptions {
    fn default() -> Self {
        LiteOptions {
            n_dyns: 0,
            input_ct: false,
            has_t1: false,
            has_m0: false,
            has_b1: false,
            fa: 20.0,
            tr: 3.5,
            r1: 3.4,
            prebolus: 8,
            times: Vec::new(),
            iauc_times: vec![60.0, 90.0, 120.0],
            iauc_at_peak: false,
            test_enhancement: true,
            first_image: 0,
            last_image: 0,
            max_iters: 500,
            backend: FitterType::Bleic,
            output_ct_mod: false,
            output_ct_sig: false,
        }
    }
}

/// Fit every row of `input`, stream results to `output`. Returns the number
/// of voxels processed.
pub fn run(
    options: &LiteOptions,
    model: &DceModel,
    input: impl Read,
    output: impl Write,
) -> Result<usize, QmriError> {
    if options.times.len() != options.n_dyns {
        return Err(QmriError::config(format!(
            "dynamic time grid has {} entries for {} samples",
            options.times.len(),
            options.n_dyns
        )));
    }
    if !options.input_ct && !options.has_t1 {
        return Err(QmriError::config(
            "signal input rows need a T1 column to convert to concentration",
        ));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .from_writer(output);

    let mut n_voxels = 0;
    for (rowno, record) in reader.records().enumerate() {
        let record = record.map_err(|e| QmriError::format(format!("row {}: {e}", rowno + 1)))?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        let row = parse_row(options, &record, rowno + 1)?;
        let fit = fit_row(options, model, row);
        write_row(&mut writer, &fit)
            .map_err(|e| QmriError::format(format!("row {}: {e}", rowno + 1)))?;
        n_voxels += 1;
    }
    log::info!("fitted {n_voxels} voxels from per-voxel input");
    Ok(n_voxels)
}

struct LiteRow {
    samples: Vec<f64>,
    t1: Option<f64>,
    m0: Option<f64>,
    b1: f64,
}

struct LiteFit {
    status: VoxelStatus,
    enhancing: bool,
    model_fit_error: f64,
    iauc: Vec<f64>,
    params: Vec<f64>,
    ct_mod: Option<Vec<f64>>,
    ct_sig: Option<Vec<f64>>,
}

fn parse_row(
    options: &LiteOptions,
    record: &StringRecord,
    rowno: usize,
) -> Result<LiteRow, QmriError> {
    let mut expected = options.n_dyns;
    expected += options.has_t1 as usize + options.has_m0 as usize + options.has_b1 as usize;
    let fields: Vec<&str> = record.iter().filter(|f| !f.is_empty()).collect();
    if fields.len() != expected {
        return Err(QmriError::format(format!(
            "row {rowno}: expected {expected} columns, found {}",
            fields.len()
        )));
    }

    let parse = |s: &str| -> Result<f64, QmriError> {
        s.parse()
            .map_err(|_| QmriError::format(format!("row {rowno}: bad number {s:?}")))
    };
    let samples: Vec<f64> = fields[..options.n_dyns]
        .iter()
        .map(|s| parse(s))
        .collect::<Result<_, _>>()?;

    let mut cursor = options.n_dyns;
    let mut next = |flag: bool| -> Result<Option<f64>, QmriError> {
        if flag {
            let v = parse(fields[cursor])?;
            cursor += 1;
            Ok(Some(v))
        } else {
            Ok(None)
        }
    };
    let t1 = next(options.has_t1)?;
    let m0 = next(options.has_m0)?;
    let b1 = next(options.has_b1)?.unwrap_or(1.0);

    Ok(LiteRow {
        samples,
        t1,
        m0,
        b1,
    })
}

fn fit_row(options: &LiteOptions, model_template: &DceModel, row: LiteRow) -> LiteFit {
    let iauc_mins: Vec<f64> = options.iauc_times.iter().map(|&s| s / 60.0).collect();
    let mut voxel = if options.input_ct {
        DceVoxel::new(
            Vec::new(),
            row.samples.clone(),
            options.prebolus,
            options.times.clone(),
            iauc_mins,
            options.iauc_at_peak,
        )
    } else {
        let mut voxel = DceVoxel::new(
            row.samples.clone(),
            Vec::new(),
            options.prebolus,
            options.times.clone(),
            iauc_mins,
            options.iauc_at_peak,
        );
        let m0_mode = match row.m0 {
            Some(m0) => M0Mode::Value(m0),
            None => M0Mode::Ratio,
        };
        let code = voxel.compute_ct_from_signal(
            row.t1.unwrap_or(0.0),
            options.fa,
            options.tr,
            options.r1,
            m0_mode,
            row.b1,
        );
        if code != ErrorCode::Ok {
            log::debug!("lite voxel not convertible: {code:?}");
        }
        voxel
    };

    if voxel.status().fittable() {
        voxel.compute_iauc();
        if options.test_enhancement {
            voxel.test_enhancing();
        }
    }

    let mut model = model_template.clone();
    let mut fitter = ModelFitter::new(
        options.first_image,
        options.last_image,
        Vec::new(),
        options.backend,
        options.max_iters,
    );
    let ct_data = if voxel.ct_data().len() == options.n_dyns {
        voxel.ct_data().to_vec()
    } else {
        vec![0.0; options.n_dyns]
    };
    fitter.initialise_fit(&mut model, &ct_data);
    fitter.fit(&mut model, &ct_data, voxel.status());

    let mut params = model.params().to_vec();
    let model_fit_error = fitter.model_fit_error();
    if model_fit_error == BAD_FIT_SSD {
        params.iter_mut().for_each(|p| *p = 0.0);
    }

    LiteFit {
        status: voxel.status(),
        enhancing: voxel.enhancing(),
        model_fit_error,
        iauc: voxel.iauc_vals().to_vec(),
        params,
        ct_mod: options.output_ct_mod.then(|| model.ct_model().to_vec()),
        ct_sig: options.output_ct_sig.then(|| ct_data),
    }
}

fn write_row<W: Write>(writer: &mut csv::Writer<W>, fit: &LiteFit) -> Result<(), csv::Error> {
    let status = match fit.status {
        VoxelStatus::Ok => 0,
        VoxelStatus::DynT1Bad => 1,
        VoxelStatus::NonEnhancing => 2,
        VoxelStatus::DceInvalidInput => 3,
    };
    let mut fields: Vec<String> = vec![
        status.to_string(),
        (fit.enhancing as u8).to_string(),
        format!("{:.9}", fit.model_fit_error),
    ];
    fields.extend(fit.iauc.iter().map(|v| format!("{v:.9}")));
    fields.extend(fit.params.iter().map(|v| format!("{v:.9}")));
    if let Some(ct_mod) = &fit.ct_mod {
        fields.extend(ct_mod.iter().map(|v| format!("{v:.9}")));
    }
    if let Some(ct_sig) = &fit.ct_sig {
        fields.extend(ct_sig.iter().map(|v| format!("{v:.9}")));
    }
    writer.write_record(&fields)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crate::aif::{Aif, AifType, PifType};
    use crate::dce::model::{create_model, DceModelKind, ModelOverrides};

    use super::*;

    fn lite_setup(n: usize) -> (LiteOptions, DceModel) {
        let times: Vec<f64> = (0..n).map(|i| i as f64 / 10.0).collect();
        let mut aif = Aif::new(AifType::Pop, PifType::None);
        aif.set_times(times.clone()).unwrap();
        aif.set_prebolus(5).unwrap();
        aif.resample().unwrap();
        let model = create_model(
            DceModelKind::Tofts,
            Arc::new(aif),
            &ModelOverrides::default(),
        )
        .unwrap();
        let options = LiteOptions {
            n_dyns: n,
            input_ct: true,
            prebolus: 5,
            times,
            iauc_times: vec![60.0],
            ..Default::default()
        };
        (options, model)
    }

    #[test]
    fn fits_concentration_rows() {
        let n = 30;
        let (options, model) = lite_setup(n);

        // two flat voxels in, two rows out
        let row = vec!["0.0"; n].join(" ");
        let input = format!("{row}\n{row}\n");
        let mut output = Vec::new();
        let n_voxels = run(&options, &model, input.as_bytes(), &mut output).unwrap();
        assert_eq!(n_voxels, 2);

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let fields: Vec<&str> = lines[0].split(' ').collect();
        // status enhancing error IAUC60 + 5 ETM params
        assert_eq!(fields.len(), 3 + 1 + 5);
        // flat input is non-enhancing
        assert_eq!(fields[0], "2");
        assert_eq!(fields[1], "0");
    }

    #[test]
    fn wrong_column_count_is_an_error() {
        let (options, model) = lite_setup(30);
        let input = "1.0 2.0 3.0\n";
        let mut output = Vec::new();
        assert!(run(&options, &model, input.as_bytes(), &mut output).is_err());
    }

    #[test]
    fn signal_rows_need_t1() {
        let (mut options, model) = lite_setup(30);
        options.input_ct = false;
        options.has_t1 = false;
        let mut output = Vec::new();
        assert!(run(&options, &model, "".as_bytes(), &mut output).is_err());
    }
}
