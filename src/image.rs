use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::errors::QmriError;

/// Relative tolerance applied when comparing voxel sizes between images.
const VOXEL_SIZE_TOLERANCE: f64 = 0.01;

/// Tag describing what an image holds, used to pick side-car metadata and
/// output naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Generic,
    T1,
    M0,
    B1,
    Dynamic,
    CtDynamic,
    CtModel,
    Roi,
    ErrorTracker,
    AifVoxelMap,
    Adc,
    Ivim,
}

impl Default for ImageType {
    fn default() -> Self {
        ImageType::Generic
    }
}

/// Acquisition metadata carried by an image, serialised to the XTR side-car.
///
/// The timestamp is the scanner convention `hhmmss.fff` packed into one
/// double, e.g. 143217.5 for 14:32:17.5.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub flip_angle: Option<f64>,
    pub tr: Option<f64>,
    pub te: Option<f64>,
    pub ti: Option<f64>,
    pub b_value: Option<f64>,
    pub timestamp: Option<f64>,
    pub origin: [f64; 3],
    pub row_dir: [f64; 3],
    pub col_dir: [f64; 3],
    pub scale: Option<f64>,
    pub intercept: Option<f64>,
}

impl ImageMeta {
    /// Seconds since midnight for the packed `hhmmss.fff` timestamp.
    pub fn timestamp_secs(&self) -> Option<f64> {
        self.timestamp.map(|ts| {
            let hrs = (ts / 10000.0).floor();
            let mins = ((ts - hrs * 10000.0) / 100.0).floor();
            let secs = ts - hrs * 10000.0 - mins * 100.0;
            hrs * 3600.0 + mins * 60.0 + secs
        })
    }

    /// Pack seconds since midnight back into the `hhmmss.fff` convention.
    pub fn set_timestamp_from_secs(&mut self, secs: f64) {
        let hrs = (secs / 3600.0).floor();
        let mins = ((secs - hrs * 3600.0) / 60.0).floor();
        let s = secs - hrs * 3600.0 - mins * 60.0;
        self.timestamp = Some(hrs * 10000.0 + mins * 100.0 + s);
    }
}

/// Dense 3D image. Voxels are stored x-fastest so the flat view matches the
/// linear voxel index `x + nx*(y + ny*z)` used throughout the mappers.
#[derive(Debug, Clone)]
pub struct Image3D {
    // shape (nz, ny, nx): C-order flat layout is x-fastest
    data: Array3<f64>,
    voxel_mm: (f64, f64, f64),
    meta: ImageMeta,
    image_type: ImageType,
}

impl Image3D {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Image3D {
            data: Array3::zeros((nz, ny, nx)),
            voxel_mm: (1.0, 1.0, 1.0),
            meta: ImageMeta::default(),
            image_type: ImageType::Generic,
        }
    }

    /// New image sharing this image's dims, voxel sizes and metadata, with
    /// zeroed voxels and a new type tag.
    pub fn copy_shape(&self, image_type: ImageType) -> Self {
        let (nx, ny, nz) = self.dims();
        let mut img = Image3D::new(nx, ny, nz);
        img.voxel_mm = self.voxel_mm;
        img.meta = self.meta.clone();
        img.image_type = image_type;
        img
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        let (nz, ny, nx) = self.data.dim();
        (nx, ny, nz)
    }

    pub fn num_voxels(&self) -> usize {
        self.data.len()
    }

    pub fn voxel_mm(&self) -> (f64, f64, f64) {
        self.voxel_mm
    }

    pub fn set_voxel_mm(&mut self, dx: f64, dy: f64, dz: f64) {
        self.voxel_mm = (dx, dy, dz);
    }

    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    pub fn set_image_type(&mut self, image_type: ImageType) {
        self.image_type = image_type;
    }

    pub fn meta(&self) -> &ImageMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut ImageMeta {
        &mut self.meta
    }

    pub fn sub_to_ind(&self, x: usize, y: usize, z: usize) -> usize {
        let (nx, ny, _) = self.dims();
        x + nx * (y + ny * z)
    }

    pub fn ind_to_sub(&self, idx: usize) -> (usize, usize, usize) {
        let (nx, ny, _) = self.dims();
        let x = idx % nx;
        let y = (idx / nx) % ny;
        let z = idx / (nx * ny);
        (x, y, z)
    }

    pub fn voxel(&self, idx: usize) -> f64 {
        self.as_slice()[idx]
    }

    pub fn set_voxel(&mut self, idx: usize, value: f64) {
        self.as_mut_slice()[idx] = value;
    }

    pub fn voxel_xyz(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[[z, y, x]]
    }

    pub fn set_voxel_xyz(&mut self, x: usize, y: usize, z: usize, value: f64) {
        self.data[[z, y, x]] = value;
    }

    /// Flat view in linear-index order.
    pub fn as_slice(&self) -> &[f64] {
        self.data.as_slice().expect("image storage is contiguous")
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        self.data
            .as_slice_mut()
            .expect("image storage is contiguous")
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn scale_by(&mut self, factor: f64) {
        self.data *= factor;
    }

    pub fn offset_by(&mut self, offset: f64) {
        self.data += offset;
    }

    /// Element-wise add, used when accumulating voxel means.
    pub fn add_image(&mut self, other: &Image3D) -> Result<(), QmriError> {
        self.check_same_grid(other, false)?;
        self.data += &other.data;
        Ok(())
    }

    /// Indices of all non-zero voxels, linear order.
    pub fn nonzero_voxels(&self) -> Vec<(usize, f64)> {
        self.as_slice()
            .iter()
            .enumerate()
            .filter(|(_, &v)| v != 0.0)
            .map(|(i, &v)| (i, v))
            .collect()
    }

    /// Check this image shares `other`'s grid. Dimension mismatch is always
    /// an error; voxel-size mismatch is an error unless `warn_only`.
    pub fn check_same_grid(&self, other: &Image3D, warn_only: bool) -> Result<(), QmriError> {
        if self.dims() != other.dims() {
            return Err(QmriError::GridMismatch {
                expected: self.dims(),
                got: other.dims(),
            });
        }
        let (dx, dy, dz) = self.voxel_mm;
        let (ox, oy, oz) = other.voxel_mm;
        let close = |a: f64, b: f64| (a - b).abs() <= VOXEL_SIZE_TOLERANCE * a.abs().max(1e-12);
        if !(close(dx, ox) && close(dy, oy) && close(dz, oz)) {
            if warn_only {
                log::warn!(
                    "voxel size mismatch: {:?} vs {:?}, continuing",
                    self.voxel_mm,
                    other.voxel_mm
                );
            } else {
                return Err(QmriError::config(format!(
                    "voxel size mismatch: {:?} vs {:?}",
                    self.voxel_mm, other.voxel_mm
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;

    use super::*;

    #[test]
    fn linear_index_is_x_fastest() {
        let mut img = Image3D::new(4, 3, 2);
        img.set_voxel_xyz(1, 2, 1, 7.0);
        let idx = img.sub_to_ind(1, 2, 1);
        assert_eq!(idx, 1 + 4 * (2 + 3 * 1));
        assert_eq!(img.voxel(idx), 7.0);
        assert_eq!(img.ind_to_sub(idx), (1, 2, 1));
    }

    #[test]
    fn timestamp_round_trip() {
        let mut meta = ImageMeta::default();
        meta.timestamp = Some(143217.5);
        let secs = meta.timestamp_secs().unwrap();
        assert_float_eq!(secs, 14.0 * 3600.0 + 32.0 * 60.0 + 17.5, abs <= 1e-9);

        let mut back = ImageMeta::default();
        back.set_timestamp_from_secs(secs);
        assert_float_eq!(back.timestamp.unwrap(), 143217.5, abs <= 1e-9);
    }

    #[test]
    fn grid_mismatch_raises() {
        let a = Image3D::new(4, 4, 4);
        let b = Image3D::new(4, 4, 5);
        assert!(a.check_same_grid(&b, true).is_err());

        let mut c = Image3D::new(4, 4, 4);
        c.set_voxel_mm(2.0, 2.0, 2.0);
        assert!(a.check_same_grid(&c, false).is_err());
        assert!(a.check_same_grid(&c, true).is_ok());
    }
}
