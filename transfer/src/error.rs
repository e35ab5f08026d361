// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for the transfer-function build.
//!
//! Every failure is deterministic in the configuration: malformed grids,
//! out-of-range interpolation, unsupported selection or Limber kinds. None
//! of them is retried; the first one aborts the build. Negligible
//! contributions are not errors, they are stored as exact zeros.

use thiserror::Error;

use crate::modes::{Mode, RadialFunctionKind};
use crate::perturbations::SourceKind;

/// Errors arising while planning grids, adapting sources or integrating.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A sampling grid came out with too few points or overran its bound.
    #[error("malformed grid: {0}")]
    MalformedGrid(String),

    /// A type asks for a multipole beyond the last value of the l grid.
    #[error("requested l_max = {requested} exceeds the largest grid multipole {available}")]
    MultipoleOutOfRange {
        /// Multipole asked for by the output type.
        requested: usize,
        /// Last multipole available in the grid.
        available: usize,
    },

    /// A k(q) value falls outside the perturbation k grid.
    #[error("wavenumber k = {k:e} outside perturbation range [{k_min:e}, {k_max:e}]")]
    WavenumberOutOfRange {
        /// Offending wavenumber.
        k: f64,
        /// Smallest k sampled by the perturbations.
        k_min: f64,
        /// Largest k sampled by the perturbations.
        k_max: f64,
    },

    /// Unknown selection-function kind.
    #[error("unsupported selection function '{0}' (expected dirac, gaussian or tophat)")]
    UnsupportedSelection(String),

    /// Limber approximation requested for a kernel without a coded formula.
    #[error("no Limber formula coded for radial function {0:?}")]
    LimberNotCoded(RadialFunctionKind),

    /// Two bracketing abscissas coincide.
    #[error("zero bracket width at index {index} while interpolating {what}")]
    ZeroBracketWidth {
        /// What was being interpolated.
        what: &'static str,
        /// Lower bracket index.
        index: usize,
    },

    /// Interpolation requested outside a tabulated domain.
    #[error("{what}: x = {x:e} outside tabulated range [{min:e}, {max:e}]")]
    InterpolationOutOfRange {
        /// Which table was queried.
        what: &'static str,
        /// Requested abscissa.
        x: f64,
        /// Lower edge of the table.
        min: f64,
        /// Upper edge of the table.
        max: f64,
    },

    /// A requested output needs a source the perturbations do not provide.
    #[error("{mode:?} perturbations provide no {kind:?} source")]
    MissingSource {
        /// Mode being computed.
        mode: Mode,
        /// Source the output type maps to.
        kind: SourceKind,
    },

    /// Collaborator data is inconsistent (sizes, signs, orderings).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Redshift-distribution file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File that failed.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Redshift-distribution file is malformed.
    #[error("{path}:{line}: {msg}")]
    Parse {
        /// File being parsed.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        msg: String,
    },

    /// JSON configuration failed to deserialize.
    #[error("configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Worker pool could not be created.
    #[error("thread pool: {0}")]
    ThreadPool(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_malformed_grid() {
        let err = TransferError::MalformedGrid("q_size = 1".into());
        assert_eq!(err.to_string(), "malformed grid: q_size = 1");
    }

    #[test]
    fn display_multipole_out_of_range() {
        let err = TransferError::MultipoleOutOfRange {
            requested: 3000,
            available: 2500,
        };
        assert!(err.to_string().contains("3000"));
        assert!(err.to_string().contains("2500"));
    }

    #[test]
    fn display_limber_kind() {
        let err = TransferError::LimberNotCoded(RadialFunctionKind::TensorPolarisationB);
        assert!(err.to_string().contains("TensorPolarisationB"));
    }

    #[test]
    fn json_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TransferError = parse.map_err(TransferError::from).unwrap_err();
        assert!(err.to_string().starts_with("configuration:"));
    }

    #[test]
    fn error_trait_works() {
        let err = TransferError::UnsupportedSelection("boxcar".into());
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("boxcar"));
    }
}
