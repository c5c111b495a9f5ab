use crate::errors::QmriError;
use crate::image::{Image3D, ImageType};

/// Per-voxel error bits. A voxel accumulates codes by bitwise OR across the
/// whole pipeline, and across re-runs when a prior tracker image is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    VfaThreshFail = 1 << 0,
    T1FitFail = 1 << 1,
    M0FitFail = 1 << 2,
    DynT1Bad = 1 << 3,
    CaIsNan = 1 << 4,
    DceInvalidInput = 1 << 5,
    DceFitFail = 1 << 6,
    NonEnhIauc = 1 << 7,
    B1Invalid = 1 << 8,
}

impl ErrorCode {
    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Voxel-indexed bitmask volume, co-registered with the analysis grid.
#[derive(Debug, Clone)]
pub struct ErrorTracker {
    image: Image3D,
}

impl ErrorTracker {
    /// Fresh tracker on the given grid.
    pub fn new(template: &Image3D) -> Self {
        ErrorTracker {
            image: template.copy_shape(ImageType::ErrorTracker),
        }
    }

    /// Resume from a previously saved tracker image. Bits already set stay
    /// set, which keeps codes monotonic across re-runs.
    pub fn from_image(image: Image3D, grid: &Image3D) -> Result<Self, QmriError> {
        grid.check_same_grid(&image, false)?;
        let mut image = image;
        image.set_image_type(ImageType::ErrorTracker);
        Ok(ErrorTracker { image })
    }

    pub fn or_voxel(&mut self, idx: usize, code: ErrorCode) {
        if code != ErrorCode::Ok {
            let bits = self.image.voxel(idx) as u32 | code.bits();
            self.image.set_voxel(idx, bits as f64);
        }
    }

    pub fn or_voxel_bits(&mut self, idx: usize, bits: u32) {
        if bits != 0 {
            let cur = self.image.voxel(idx) as u32 | bits;
            self.image.set_voxel(idx, cur as f64);
        }
    }

    pub fn voxel_bits(&self, idx: usize) -> u32 {
        self.image.voxel(idx) as u32
    }

    pub fn voxel_ok(&self, idx: usize) -> bool {
        self.voxel_bits(idx) == 0
    }

    pub fn image(&self) -> &Image3D {
        &self.image
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_accumulate_across_runs() {
        let grid = Image3D::new(2, 2, 2);

        // run 1
        let mut tracker = ErrorTracker::new(&grid);
        tracker.or_voxel(3, ErrorCode::VfaThreshFail);
        let saved = tracker.image().clone();

        // run 2 reloads the saved tracker
        let mut tracker = ErrorTracker::from_image(saved, &grid).unwrap();
        tracker.or_voxel(3, ErrorCode::DceFitFail);

        assert_eq!(
            tracker.voxel_bits(3),
            ErrorCode::VfaThreshFail.bits() | ErrorCode::DceFitFail.bits()
        );
        assert!(tracker.voxel_ok(0));
    }

    #[test]
    fn mismatched_grid_rejected() {
        let grid = Image3D::new(2, 2, 2);
        let other = Image3D::new(3, 2, 2);
        assert!(ErrorTracker::from_image(other, &grid).is_err());
    }
}
