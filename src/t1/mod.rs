//! T1/M0 mapping from variable flip-angle or inversion-recovery
//! acquisitions.

pub mod ir;
pub mod mapper;
pub mod vfa;

pub use mapper::{T1Mapper, T1MapperOptions};

use crate::errors::QmriError;

/// Upper bound of plausible T1 in ms, fits outside are failures.
pub const T1_MAX_MS: f64 = 1.0e4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T1Method {
    /// Variable flip-angle SPGR, non-linear fit.
    Vfa,
    /// VFA with a per-voxel B1 correction map.
    VfaB1,
    /// VFA solved by the linearised form.
    VfaLin,
    /// Inversion recovery.
    Ir,
}

impl T1Method {
    pub fn parse(s: &str) -> Result<Self, QmriError> {
        match s {
            "VFA" => Ok(T1Method::Vfa),
            "VFA_B1" => Ok(T1Method::VfaB1),
            "VFA_LIN" => Ok(T1Method::VfaLin),
            "IR" => Ok(T1Method::Ir),
            _ => Err(QmriError::config(format!(
                "T1 method ({s}) is not recognised, must be one of VFA, VFA_B1, VFA_LIN or IR"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            T1Method::Vfa => "VFA",
            T1Method::VfaB1 => "VFA_B1",
            T1Method::VfaLin => "VFA_LIN",
            T1Method::Ir => "IR",
        }
    }

    /// Fewest signal inputs the method can work from.
    pub fn minimum_inputs(self) -> usize {
        match self {
            T1Method::Vfa | T1Method::VfaB1 | T1Method::VfaLin => 2,
            T1Method::Ir => 3,
        }
    }

    pub fn maximum_inputs(self) -> usize {
        usize::MAX
    }

    pub fn uses_b1(self) -> bool {
        self == T1Method::VfaB1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_round_trips_names() {
        for name in ["VFA", "VFA_B1", "VFA_LIN", "IR"] {
            assert_eq!(T1Method::parse(name).unwrap().name(), name);
        }
        assert!(T1Method::parse("SRTF").is_err());
    }

    #[test]
    fn input_counts() {
        assert_eq!(T1Method::Vfa.minimum_inputs(), 2);
        assert_eq!(T1Method::Ir.minimum_inputs(), 3);
        assert!(T1Method::Vfa.maximum_inputs() > 100);
    }
}
