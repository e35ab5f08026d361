// SPDX-License-Identifier: AGPL-3.0-only

//! cosmicTransfer — angular transfer functions Δ_l(q)
//!
//! Projects perturbation sources S(k, τ) onto multipoles l by integrating
//! them against hyperspherical Bessel kernels along the line of sight, for
//! CMB temperature, polarization and lensing and for galaxy number counts
//! and cosmic shear in redshift bins, in flat, open and closed geometries.
//!
//! ## Pipeline
//!   - `grid` — multipole, wavenumber and per-mode k grids
//!   - `sources` — k-splined sources redefined per observable
//!   - `selection` — redshift windows and their time samplings
//!   - `hyperspherical` — Φ_l^ν tables (shared flat, per-q curved)
//!   - `radial` — kernel combinations for each observable
//!   - `integrate` — neglect rules, quadrature and Limber per wavenumber
//!   - `transfer` — parallel build and the queryable [`TransferTable`]
//!
//! ## Supporting modules
//!   - `config` — precision parameters and output requests (serde JSON)
//!   - `cosmology`, `perturbations` — collaborator inputs
//!   - `numerical` — splines, trapezoid weights, parabolic interpolation
//!   - `tolerances` — named numerical guards and check tolerances
//!   - `validation` — pass/fail harness of `validate_transfer`

pub mod config;
pub mod cosmology;
pub mod error;
pub mod grid;
pub mod hyperspherical;
pub mod integrate;
pub mod modes;
pub mod numerical;
pub mod perturbations;
pub mod radial;
pub mod selection;
pub mod sources;
pub mod tolerances;
pub mod transfer;
pub mod validation;
pub mod workspace;

pub use config::{Precision, TransferConfig};
pub use cosmology::{Background, Curvature, EinsteinDeSitter, Thermodynamics};
pub use error::TransferError;
pub use modes::{Mode, TransferType};
pub use perturbations::{ModeSources, NonlinearCorrections, PerturbationSources, SourceKind};
pub use transfer::TransferTable;
