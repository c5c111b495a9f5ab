//! Image reading and writing. Analyze (hdr/img pairs, dense or sparse) and
//! the XTR metadata side-car are implemented here; NIFTI and DICOM live in
//! external collaborators and are surfaced only as format names.

pub mod analyze;
pub mod xtr;

use std::path::Path;

use crate::errors::QmriError;
use crate::image::Image3D;

/// On-disk image formats accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Analyze,
    AnalyzeSparse,
    Nifti,
    NiftiGz,
    Dicom,
}

impl ImageFormat {
    pub fn parse(s: &str) -> Result<Self, QmriError> {
        match s {
            "ANALYZE" => Ok(ImageFormat::Analyze),
            "ANALYZE_SPARSE" => Ok(ImageFormat::AnalyzeSparse),
            "NIFTI" => Ok(ImageFormat::Nifti),
            "NIFTI_GZ" => Ok(ImageFormat::NiftiGz),
            "DICOM" => Ok(ImageFormat::Dicom),
            _ => Err(QmriError::config(format!(
                "image format ({s}) is not recognised"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Analyze => "ANALYZE",
            ImageFormat::AnalyzeSparse => "ANALYZE_SPARSE",
            ImageFormat::Nifti => "NIFTI",
            ImageFormat::NiftiGz => "NIFTI_GZ",
            ImageFormat::Dicom => "DICOM",
        }
    }
}

/// Voxel datatype used when writing Analyze images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Short,
    Float,
    Double,
}

/// Read an image from `base` (no extension), loading the XTR side-car when
/// present and requested.
pub fn read_image_3d(
    base: impl AsRef<Path>,
    format: ImageFormat,
    load_metadata: bool,
) -> Result<Image3D, QmriError> {
    let base = base.as_ref();
    let mut img = match format {
        ImageFormat::Analyze | ImageFormat::AnalyzeSparse => analyze::read(base)?,
        other => {
            return Err(QmriError::Unsupported(format!(
                "{} reading is handled by an external collaborator",
                other.name()
            )))
        }
    };
    if load_metadata {
        let xtr_path = base.with_extension("xtr");
        if xtr_path.exists() {
            xtr::read(&xtr_path, &mut img)?;
        }
    }
    Ok(img)
}

/// Write an image to `base` (no extension) plus its XTR side-car.
pub fn write_image_3d(
    base: impl AsRef<Path>,
    img: &Image3D,
    format: ImageFormat,
    dtype: DataType,
) -> Result<(), QmriError> {
    let base = base.as_ref();
    match format {
        ImageFormat::Analyze => analyze::write(base, img, dtype, false)?,
        ImageFormat::AnalyzeSparse => analyze::write(base, img, dtype, true)?,
        other => {
            return Err(QmriError::Unsupported(format!(
                "{} writing is handled by an external collaborator",
                other.name()
            )))
        }
    }
    xtr::write(&base.with_extension("xtr"), img)?;
    Ok(())
}
