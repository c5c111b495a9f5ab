pub mod fitter;
pub mod model;
pub mod models;
pub mod volume;
pub mod voxel;

pub use fitter::ModelFitter;
pub use model::{DceModel, DceModelKind, ModelOverrides};
pub use volume::{DceVolumeAnalysis, DceVolumeOptions};
pub use voxel::{DceVoxel, VoxelStatus};
