//! XTR metadata side-car: plain-text key/value doubles next to the image
//! file. Two layouts exist in the wild: the old fixed four-line format
//! (first token `voxel`) and the new one-key-per-line format. Both are read,
//! the new format is written.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::errors::QmriError;
use crate::image::Image3D;

pub fn write(path: &Path, img: &Image3D) -> Result<(), QmriError> {
    let mut file = File::create(path).map_err(|e| QmriError::io(path, e))?;
    let meta = img.meta();
    let (dx, dy, dz) = img.voxel_mm();

    let inner = |f: &mut File| -> std::io::Result<()> {
        writeln!(f, "VoxelDimensions {dx} {dy} {dz}")?;
        if let Some(v) = meta.flip_angle {
            writeln!(f, "FlipAngle {v}")?;
        }
        if let Some(v) = meta.tr {
            writeln!(f, "TR {v}")?;
        }
        if let Some(v) = meta.te {
            writeln!(f, "TE {v}")?;
        }
        if let Some(v) = meta.ti {
            writeln!(f, "TI {v}")?;
        }
        if let Some(v) = meta.b_value {
            writeln!(f, "B {v}")?;
        }
        if let Some(v) = meta.timestamp {
            writeln!(f, "TimeStamp {v}")?;
        }
        Ok(())
    };
    inner(&mut file).map_err(|e| QmriError::io(path, e))
}

pub fn read(path: &Path, img: &mut Image3D) -> Result<(), QmriError> {
    let file = File::open(path).map_err(|e| QmriError::io(path, e))?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()
        .map_err(|e| QmriError::io(path, e))?;

    let first_token = lines
        .first()
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("");
    if first_token.eq_ignore_ascii_case("voxel") {
        read_old(path, &lines, img)
    } else {
        read_new(path, &lines, img)
    }
}

fn read_new(path: &Path, lines: &[String], img: &mut Image3D) -> Result<(), QmriError> {
    for (lineno, line) in lines.iter().enumerate() {
        let mut tokens = line.split_whitespace();
        let key = match tokens.next() {
            Some(k) => k,
            None => continue,
        };
        let values: Vec<f64> = tokens
            .map(|t| {
                t.parse().map_err(|_| {
                    QmriError::format(format!(
                        "{}:{}: bad value for {key}",
                        path.display(),
                        lineno + 1
                    ))
                })
            })
            .collect::<Result<_, _>>()?;

        match (key, values.as_slice()) {
            ("VoxelDimensions", [dx, dy, dz]) => img.set_voxel_mm(*dx, *dy, *dz),
            ("FlipAngle", [v]) => img.meta_mut().flip_angle = Some(*v),
            ("TR", [v]) => img.meta_mut().tr = Some(*v),
            ("TE", [v]) => img.meta_mut().te = Some(*v),
            ("TI", [v]) => img.meta_mut().ti = Some(*v),
            ("B", [v]) => img.meta_mut().b_value = Some(*v),
            ("TimeStamp", [v]) => img.meta_mut().timestamp = Some(*v),
            _ => log::debug!("{}: ignoring XTR key {key}", path.display()),
        }
    }
    Ok(())
}

/// Old format, fixed order:
/// ```text
/// voxel dimensions:  dx dy dz
/// flip angle:        fa
/// TR:                tr
/// timestamp:         hrs mins secs packed
/// ```
fn read_old(path: &Path, lines: &[String], img: &mut Image3D) -> Result<(), QmriError> {
    let trailing_doubles = |line: &str| -> Vec<f64> {
        line.split_whitespace()
            .filter_map(|t| t.parse::<f64>().ok())
            .collect()
    };
    let line = |i: usize| -> Result<&String, QmriError> {
        lines.get(i).ok_or_else(|| {
            QmriError::format(format!("{}: truncated old-format XTR", path.display()))
        })
    };

    if let [dx, dy, dz] = trailing_doubles(line(0)?).as_slice() {
        img.set_voxel_mm(*dx, *dy, *dz);
    }
    if let [fa] = trailing_doubles(line(1)?).as_slice() {
        img.meta_mut().flip_angle = Some(*fa);
    }
    if let [tr] = trailing_doubles(line(2)?).as_slice() {
        img.meta_mut().tr = Some(*tr);
    }
    // last value on the timestamp line is the packed hhmmss.fff
    if let Some(ts) = trailing_doubles(line(3)?).last() {
        img.meta_mut().timestamp = Some(*ts);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn new_format_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("img.xtr");

        let mut img = Image3D::new(2, 2, 2);
        img.set_voxel_mm(1.25, 1.25, 5.0);
        img.meta_mut().flip_angle = Some(20.0);
        img.meta_mut().tr = Some(3.5);
        img.meta_mut().b_value = Some(800.0);
        img.meta_mut().timestamp = Some(143217.5);
        write(&path, &img).unwrap();

        let mut back = Image3D::new(2, 2, 2);
        read(&path, &mut back).unwrap();
        assert_eq!(back.meta(), img.meta());
        let (dx, _, dz) = back.voxel_mm();
        assert_float_eq!(dx, 1.25, abs <= 1e-12);
        assert_float_eq!(dz, 5.0, abs <= 1e-12);
    }

    #[test]
    fn old_format_is_detected_and_parsed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("old.xtr");
        std::fs::write(
            &path,
            "voxel dimensions:\t1.5 1.5 4.0\nflip angle:\t20\nTR:\t3.5\ntimestamp:\t14 32 17.5 143217.5\n",
        )
        .unwrap();

        let mut img = Image3D::new(2, 2, 2);
        read(&path, &mut img).unwrap();
        assert_eq!(img.meta().flip_angle, Some(20.0));
        assert_eq!(img.meta().tr, Some(3.5));
        assert_eq!(img.meta().timestamp, Some(143217.5));
        let (dx, dy, dz) = img.voxel_mm();
        assert_float_eq!(dx, 1.5, abs <= 1e-12);
        assert_float_eq!(dy, 1.5, abs <= 1e-12);
        assert_float_eq!(dz, 4.0, abs <= 1e-12);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("extra.xtr");
        std::fs::write(&path, "FlipAngle 15\nSliceThickness 5.0\n").unwrap();

        let mut img = Image3D::new(2, 2, 2);
        read(&path, &mut img).unwrap();
        assert_eq!(img.meta().flip_angle, Some(15.0));
    }
}
