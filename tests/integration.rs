//! End-to-end runs of the qmri binary on synthetic volumes.

use std::error::Error;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use assert_cmd::prelude::OutputAssertExt;
use assert_fs::assert::PathAssert;
use assert_fs::fixture::PathChild;
use assert_fs::TempDir;
use escargot::CargoBuild;
use predicates::prelude::predicate;
use pretty_assertions::assert_eq;
use libqmri::aif::{Aif, AifType, PifType};
use libqmri::dce::model::{create_model, DceModelKind, ModelOverrides};
use libqmri::image_io::{read_image_3d, write_image_3d, DataType, ImageFormat};
use libqmri::signal::signal_from_concentration;
use libqmri::Image3D;

const N_TIMES: usize = 30;
const PREBOLUS: usize = 8;
const T1: f64 = 1000.0;
const M0: f64 = 1000.0;
const FA: f64 = 20.0;
const TR: f64 = 3.5;
const R1: f64 = 3.4;

fn qmri_bin() -> escargot::CargoRun {
    CargoBuild::new()
        .package("qmri")
        .bin("qmri")
        .run()
        .expect("building qmri")
}

/// Population-AIF Tofts tissue curve used to synthesise the test volumes.
fn tofts_truth() -> Vec<f64> {
    let times: Vec<f64> = (0..N_TIMES).map(|i| i as f64 * 6.0 / 60.0).collect();
    let mut aif = Aif::new(AifType::Pop, PifType::None);
    aif.set_times(times).unwrap();
    aif.set_prebolus(PREBOLUS).unwrap();
    aif.resample().unwrap();

    let mut model = create_model(
        DceModelKind::Tofts,
        Arc::new(aif),
        &ModelOverrides::default(),
    )
    .unwrap();
    model.reset(N_TIMES);
    model.set_params(vec![0.25, 0.4, 0.0, 0.0, 1.0]);
    model.compute_ct(N_TIMES);
    model.ct_model().to_vec()
}

fn write_scalar_map(dir: &Path, name: &str, value: f64) {
    let mut img = Image3D::new(3, 3, 1);
    img.fill(value);
    write_image_3d(dir.join(name), &img, ImageFormat::Analyze, DataType::Double).unwrap();
}

fn write_dynamic_series(dir: &Path, ct_truth: &[f64]) {
    for (t, &ct) in ct_truth.iter().enumerate() {
        let mut img = Image3D::new(3, 3, 1);
        img.meta_mut().flip_angle = Some(FA);
        img.meta_mut().tr = Some(TR);
        img.meta_mut().set_timestamp_from_secs(36000.0 + t as f64 * 6.0);
        let s = signal_from_concentration(ct, T1, M0, FA, TR, 1.0, R1);
        img.fill(s);
        write_image_3d(
            dir.join(format!("dyn{}", t + 1)),
            &img,
            ImageFormat::Analyze,
            DataType::Double,
        )
        .unwrap();
    }
}

#[test]
fn dce_volume_run_recovers_parameters() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?.into_persistent_if(std::env::var("TEST_PERSIST").is_ok());
    let data = temp_dir.path();

    write_dynamic_series(data, &tofts_truth());
    write_scalar_map(data, "T1", T1);
    write_scalar_map(data, "M0", M0);

    let out = data.join("dce_output");
    qmri_bin()
        .command()
        .arg("dce")
        .args(["--model", "TOFTS"])
        .arg("--dyn")
        .arg(data.join("dyn"))
        .args(["--n_dyns", &N_TIMES.to_string()])
        .arg("--T1")
        .arg(data.join("T1"))
        .arg("--M0")
        .arg(data.join("M0"))
        .args(["--inj", &PREBOLUS.to_string()])
        .args(["--iauc", "60"])
        .arg("--output")
        .arg(&out)
        .env("RUST_BACKTRACE", "full")
        .assert()
        .success();

    let ktrans = read_image_3d(out.join("Ktrans"), ImageFormat::Analyze, false)?;
    let ve = read_image_3d(out.join("v_e"), ImageFormat::Analyze, false)?;
    for idx in 0..9 {
        assert!(
            (ktrans.voxel(idx) - 0.25).abs() < 0.05,
            "Ktrans[{idx}] = {}",
            ktrans.voxel(idx)
        );
        assert!(
            (ve.voxel(idx) - 0.4).abs() < 0.1,
            "v_e[{idx}] = {}",
            ve.voxel(idx)
        );
    }
    for name in [
        "IAUC60.hdr",
        "residual.hdr",
        "error_tracker.hdr",
        "AIF.txt",
        "qmri_DCE_ProgramLog.txt",
    ] {
        temp_dir
            .child(format!("dce_output/{name}"))
            .assert(predicate::path::exists());
    }
    Ok(())
}

#[test]
fn t1_run_maps_uniform_volume() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let data = temp_dir.path();

    for (i, fa) in [2.0, 20.0].iter().enumerate() {
        let mut img = Image3D::new(3, 3, 1);
        img.meta_mut().flip_angle = Some(*fa);
        img.meta_mut().tr = Some(TR);
        img.fill(signal_from_concentration(0.0, T1, M0, *fa, TR, 1.0, R1));
        write_image_3d(
            data.join(format!("fa{}", i + 1)),
            &img,
            ImageFormat::Analyze,
            DataType::Double,
        )?;
    }

    let out = data.join("t1_output");
    qmri_bin()
        .command()
        .arg("t1")
        .arg("--T1_vols")
        .arg(data.join("fa1"))
        .arg(data.join("fa2"))
        .arg("--output")
        .arg(&out)
        .assert()
        .success();

    let t1 = read_image_3d(out.join("T1"), ImageFormat::Analyze, false)?;
    let m0 = read_image_3d(out.join("M0"), ImageFormat::Analyze, false)?;
    for idx in 0..9 {
        assert!((t1.voxel(idx) - T1).abs() < 1.0, "T1 = {}", t1.voxel(idx));
        assert!((m0.voxel(idx) - M0).abs() < 0.5, "M0 = {}", m0.voxel(idx));
    }
    Ok(())
}

#[test]
fn dce_lite_round_trip() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let data = temp_dir.path();

    let ct = tofts_truth();
    let row = ct
        .iter()
        .map(|v| format!("{v:.9}"))
        .collect::<Vec<_>>()
        .join(" ");
    std::fs::write(data.join("voxels.dat"), format!("{row}\n{row}\n{row}\n"))?;

    let times = (0..N_TIMES)
        .map(|i| format!("{}", i as f64 * 6.0 / 60.0))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(data.join("times.dat"), times)?;

    let out_file = data.join("fits.dat");
    qmri_bin()
        .command()
        .arg("dce-lite")
        .args(["--model", "TOFTS"])
        .arg("--data")
        .arg(data.join("voxels.dat"))
        .arg("--dyn_times")
        .arg(data.join("times.dat"))
        .args(["--n_dyns", &N_TIMES.to_string()])
        .args(["--inj", &PREBOLUS.to_string()])
        .arg("--Ct_in")
        .arg("--output")
        .arg(&out_file)
        .assert()
        .success();

    let text = std::fs::read_to_string(&out_file)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let fields: Vec<&str> = line.split(' ').collect();
        // status enhancing error 3xIAUC 5 params
        assert_eq!(fields.len(), 3 + 3 + 5);
        assert_eq!(fields[0], "0");
        let ktrans: f64 = fields[6].parse()?;
        assert!((ktrans - 0.25).abs() < 0.05, "Ktrans = {ktrans}");
    }
    Ok(())
}

#[test]
fn sparse_analyze_survives_pipeline_reload() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let data = temp_dir.path();

    let mut img = Image3D::new(4, 4, 4);
    img.set_voxel_mm(1.5, 1.5, 4.0);
    img.meta_mut().flip_angle = Some(FA);
    img.meta_mut().tr = Some(TR);
    img.set_voxel_xyz(2, 2, 2, 3.14);

    write_image_3d(
        data.join("sparse"),
        &img,
        ImageFormat::AnalyzeSparse,
        DataType::Double,
    )?;
    let back = read_image_3d(data.join("sparse"), ImageFormat::AnalyzeSparse, true)?;

    assert_eq!(back.dims(), img.dims());
    assert_eq!(back.as_slice(), img.as_slice());
    assert_eq!(back.meta().flip_angle, Some(FA));
    assert_eq!(back.meta().tr, Some(TR));
    Ok(())
}
