// SPDX-License-Identifier: AGPL-3.0-only

//! Per-wavenumber scratch state.
//!
//! One [`Workspace`] is created for each q index, used for every mode,
//! initial condition, type and multipole at that q, and dropped when the
//! task ends. It owns the curved-space kernel table of that q, if one is
//! needed.

use std::f64::consts::FRAC_PI_2;

use tracing::trace;

use crate::config::Precision;
use crate::cosmology::Curvature;
use crate::error::TransferError;
use crate::hyperspherical::{relevant_l_size, HyperTable};
use crate::radial::RadialCoordinates;
use crate::tolerances::{CLOSED_NU_INTEGER_TOL, CLOSED_NU_ROUNDING_OFFSET};

/// Buffers and the optional curved kernel table of one wavenumber.
#[derive(Debug, Default)]
pub struct Workspace {
    /// Perturbation source at the current k on the full time grid.
    pub interpolated: Vec<f64>,
    /// Transfer source of the current type on its own time sampling.
    pub sources: Vec<f64>,
    /// Radial kernel on the truncated sampling.
    pub radial: Vec<f64>,
    /// χ, csc and cot of the current sampling.
    pub coords: RadialCoordinates,
    /// Curved-space table of the current q, when the exact kernel is used.
    pub curved: Option<HyperTable>,
}

impl Workspace {
    /// Empty workspace with buffers sized for `tau_size_max` samples.
    #[must_use]
    pub fn new(tau_size_max: usize) -> Self {
        Self {
            interpolated: Vec::with_capacity(tau_size_max),
            sources: Vec::with_capacity(tau_size_max),
            radial: Vec::with_capacity(tau_size_max),
            coords: RadialCoordinates::default(),
            curved: None,
        }
    }

    /// Number of multipoles of the curved table; 0 without one.
    #[must_use]
    pub fn curved_l_size(&self) -> usize {
        self.curved.as_ref().map_or(0, HyperTable::l_size)
    }

    /// Build the curved kernel table of q when curvature is non-zero and q
    /// lies below the flat-approximation index; clear it otherwise.
    ///
    /// The table spans χ up to √|K| τ0 (at most π/2 − x_min in closed
    /// space, the rest following by symmetry) and covers the grid
    /// multipoles that are non-negligible in that range: l < ν in closed
    /// space, the [`relevant_l_size`] cut in open space.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] if ν ≤ 0 or, in closed
    /// space, ν is not an integer, and table-building failures.
    #[allow(clippy::too_many_arguments)]
    pub fn refresh_curved_table(
        &mut self,
        curvature: Curvature,
        q: f64,
        index_q: usize,
        index_q_flat_approximation: usize,
        tau0: f64,
        l_grid: &[usize],
        precision: &Precision,
    ) -> Result<(), TransferError> {
        self.curved = None;
        let sgn = curvature.sign();
        if sgn == 0 || index_q >= index_q_flat_approximation {
            return Ok(());
        }

        let sqrt_abs_k = curvature.sqrt_abs();
        let x_min = precision.hyper_x_min;
        let mut x_max = sqrt_abs_k * tau0;
        let mut nu = q / sqrt_abs_k;
        if !(nu > 0.0) {
            return Err(TransferError::InvalidInput(format!(
                "curved kernel table needs nu > 0, got {nu:e} at q = {q:e}"
            )));
        }

        let l_size = if sgn == 1 {
            x_max = x_max.min(FRAC_PI_2 - x_min);
            let nu_int = (nu + CLOSED_NU_ROUNDING_OFFSET).floor();
            if (nu - nu_int).abs() > CLOSED_NU_INTEGER_TOL {
                return Err(TransferError::InvalidInput(format!(
                    "closed-space nu = {nu} at q = {q:e} is not an integer"
                )));
            }
            nu = nu_int;
            l_grid.partition_point(|&l| (l as f64) < nu)
        } else {
            relevant_l_size(
                sgn,
                nu,
                l_grid,
                x_max,
                precision.hyper_phi_min_abs,
                x_min,
                precision.hyper_x_tol,
            )
        };
        if l_size == 0 {
            return Ok(());
        }

        let sampling = if nu > precision.hyper_nu_sampling_step {
            precision.hyper_sampling_curved_high_nu
        } else {
            precision.hyper_sampling_curved_low_nu
        };
        let table = HyperTable::build(
            sgn,
            nu,
            &l_grid[..l_size],
            x_min,
            x_max,
            sampling,
            precision.hyper_phi_min_abs,
        )?;
        trace!(index_q, nu, l_size, x_max, "curved kernel table");
        self.curved = Some(table);
        Ok(())
    }
}
