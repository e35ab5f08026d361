// SPDX-License-Identifier: AGPL-3.0-only

//! Source adapter: from perturbation sources S(k, τ) to the transfer
//! sources convolved with the radial kernels.
//!
//! Raw sources are splined in k once per build ([`SplinedSources`]).
//! Matter sources are copied and multiplied by the nonlinear correction;
//! every other source is borrowed from the perturbation output. At each
//! wavenumber the spline is evaluated across the whole time grid and
//! [`SourceAdapter::redefine`] turns the result into the source of one
//! output type on its own time sampling.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::config::CmbLensingRescale;
use crate::cosmology::Curvature;
use crate::error::TransferError;
use crate::modes::{Category, Mode, TransferType, TypeInfo};
use crate::numerical;
use crate::perturbations::{ModeSources, NonlinearCorrections};
use crate::selection::{SelectionWindows, TypeWindow};
use crate::tolerances::K_MIN_ROUNDING;

/// One (ic, kind) source table with its second derivatives in k.
#[derive(Clone, Debug)]
pub struct SplinedSource<'a> {
    values: Cow<'a, [f64]>,
    ddk: Vec<f64>,
}

impl SplinedSource<'_> {
    /// Whether this table is a corrected copy rather than a view of the
    /// perturbation output.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        matches!(self.values, Cow::Owned(_))
    }
}

/// All sources of one mode, splined in k.
#[derive(Clone, Debug)]
pub struct SplinedSources<'a> {
    k: &'a [f64],
    tau_size: usize,
    kinds: usize,
    entries: Vec<SplinedSource<'a>>,
}

impl<'a> SplinedSources<'a> {
    /// Spline every source of `mode_sources` along k, applying the
    /// nonlinear correction to matter sources when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] if the correction table does
    /// not match the source size, and spline failures on a degenerate k
    /// grid.
    pub fn new(
        mode_sources: &'a ModeSources,
        tau_size: usize,
        nonlinear: Option<&NonlinearCorrections>,
    ) -> Result<Self, TransferError> {
        let kinds = mode_sources.kinds.len();
        let jobs: Vec<(usize, usize)> = (0..mode_sources.ic_size)
            .flat_map(|ic| (0..kinds).map(move |tp| (ic, tp)))
            .collect();
        let entries = jobs
            .into_par_iter()
            .map(|(ic, tp)| -> Result<SplinedSource<'a>, TransferError> {
                let raw = mode_sources.source(ic, tp);
                let kind = mode_sources.kinds[tp];
                let values = match nonlinear {
                    Some(nl) if kind.is_nonlinear_corrected() && mode_sources.mode == Mode::Scalar => {
                        let factor = nl.for_kind(kind)?;
                        if factor.len() != raw.len() {
                            return Err(TransferError::InvalidInput(format!(
                                "nonlinear correction has {} entries for {} source samples",
                                factor.len(),
                                raw.len()
                            )));
                        }
                        Cow::Owned(raw.iter().zip(factor).map(|(s, f)| s * f).collect())
                    }
                    _ => Cow::Borrowed(raw),
                };
                let ddk = numerical::spline_rows(&mode_sources.k, &values)?;
                Ok(SplinedSource { values, ddk })
            })
            .collect::<Result<Vec<_>, TransferError>>()?;
        Ok(Self {
            k: &mode_sources.k,
            tau_size,
            kinds,
            entries,
        })
    }

    /// Splined table of (ic, kind index).
    #[must_use]
    pub fn entry(&self, ic: usize, tp: usize) -> &SplinedSource<'a> {
        &self.entries[ic * self.kinds + tp]
    }

    /// S(k, τ) across the full time grid, by cubic spline between the two
    /// bracketing k samples.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InterpolationOutOfRange`] for k outside the
    /// perturbation grid and [`TransferError::ZeroBracketWidth`] on a
    /// repeated k.
    pub fn interpolate_at_k(&self, ic: usize, tp: usize, k: f64, out: &mut Vec<f64>) -> Result<(), TransferError> {
        let entry = self.entry(ic, tp);
        let i = numerical::bracket(self.k, k, "perturbation sources in k")?;
        let [a, b, c, d] = numerical::spline_weights(self.k, i, k)?;
        let n = self.k.len();
        out.clear();
        out.extend((0..self.tau_size).map(|t| {
            let row = t * n + i;
            a * entry.values[row] + b * entry.values[row + 1] + c * entry.ddk[row] + d * entry.ddk[row + 1]
        }));
        Ok(())
    }
}

/// A time sampling τ0 − τ (decreasing) with its trapezoidal weights.
#[derive(Clone, Debug, Default)]
pub struct TimeSampling {
    /// τ0 − τ.
    pub tau0_minus_tau: Vec<f64>,
    /// Trapezoidal weights.
    pub weights: Vec<f64>,
}

impl TimeSampling {
    fn from_tau(tau0: f64, tau: &[f64]) -> Self {
        let tau0_minus_tau: Vec<f64> = tau.iter().map(|t| tau0 - t).collect();
        let weights = numerical::trapezoidal_weights(&tau0_minus_tau);
        Self {
            tau0_minus_tau,
            weights,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tau0_minus_tau.len()
    }

    /// Whether the sampling is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tau0_minus_tau.is_empty()
    }
}

/// Wavenumber-independent data needed to redefine sources.
#[derive(Debug)]
pub struct SourceAdapter<'a> {
    tau: &'a [f64],
    tau0: f64,
    full: TimeSampling,
    after_rec: TimeSampling,
    index_tau_rec: usize,
    lensing_kernel: Vec<f64>,
    lcmb: CmbLensingRescale,
    windows: &'a SelectionWindows,
}

impl<'a> SourceAdapter<'a> {
    /// Prepare the full and post-recombination samplings and the CMB
    /// lensing kernel W(τ) = sin_K(τ_rec − τ) / [sin_K(τ0 − τ) sin_K(τ0 − τ_rec)],
    /// set to zero today.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] if no perturbation time lies
    /// after recombination.
    pub fn new(
        tau: &'a [f64],
        tau0: f64,
        tau_rec: f64,
        curvature: Curvature,
        lcmb: CmbLensingRescale,
        windows: &'a SelectionWindows,
    ) -> Result<Self, TransferError> {
        let index_tau_rec = tau.partition_point(|&t| t <= tau_rec);
        if index_tau_rec >= tau.len() {
            return Err(TransferError::InvalidInput(format!(
                "no perturbation time after recombination at tau = {tau_rec}"
            )));
        }
        let late = &tau[index_tau_rec..];
        let last = late.len() - 1;
        let lensing_kernel = late
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                if i == last {
                    0.0
                } else {
                    curvature.sin_k(tau_rec - t) / curvature.sin_k(tau0 - t) / curvature.sin_k(tau0 - tau_rec)
                }
            })
            .collect();
        Ok(Self {
            tau,
            tau0,
            full: TimeSampling::from_tau(tau0, tau),
            after_rec: TimeSampling::from_tau(tau0, late),
            index_tau_rec,
            lensing_kernel,
            lcmb,
            windows,
        })
    }

    /// Time sampling of the type stored at `index_tt`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidInput`] if a number-count or lensing
    /// type has no precomputed window.
    pub fn sampling(&self, info: &TypeInfo, index_tt: usize) -> Result<(&[f64], &[f64]), TransferError> {
        Ok(match info.category {
            Category::Cmb => (&self.full.tau0_minus_tau, &self.full.weights),
            Category::CmbLensing => (&self.after_rec.tau0_minus_tau, &self.after_rec.weights),
            Category::NumberCountLocal | Category::LineOfSight => {
                let w = self.window(info, index_tt)?;
                (&w.tau0_minus_tau, &w.weights)
            }
        })
    }

    /// Largest number of time samples of any type.
    #[must_use]
    pub fn tau_size_max(&self) -> usize {
        self.full.len().max(self.windows.tau_size_max())
    }

    fn window(&self, info: &TypeInfo, index_tt: usize) -> Result<&TypeWindow, TransferError> {
        self.windows.get(index_tt).ok_or_else(|| {
            TransferError::InvalidInput(format!("no selection window precomputed for {:?}", info.ty))
        })
    }

    /// Transfer source of the type at `index_tt` from the source
    /// `interpolated` (on the full perturbation time grid) at wavenumber k.
    ///
    /// # Errors
    ///
    /// Returns interpolation errors if a window reaches outside the
    /// perturbation time grid.
    pub fn redefine(
        &self,
        info: &TypeInfo,
        index_tt: usize,
        k: f64,
        interpolated: &[f64],
        out: &mut Vec<f64>,
    ) -> Result<(), TransferError> {
        out.clear();
        match info.category {
            Category::Cmb => out.extend_from_slice(interpolated),
            Category::CmbLensing => {
                let factor = self.lcmb.factor(k);
                out.extend(
                    interpolated[self.index_tau_rec..]
                        .iter()
                        .zip(&self.lensing_kernel)
                        .map(|(s, w)| s * w * factor),
                );
            }
            Category::NumberCountLocal | Category::LineOfSight => {
                let w = self.window(info, index_tt)?;
                let factor = match info.ty {
                    TransferType::Doppler0(_) => 1.0 / (k * k),
                    TransferType::Doppler1(_) => 1.0 / k,
                    TransferType::Gr5(_) => k,
                    _ => 1.0,
                };
                for (&d, &win) in w.tau0_minus_tau.iter().zip(&w.window) {
                    out.push(self.resample(interpolated, self.tau0 - d)? * win * factor);
                }
            }
        }
        Ok(())
    }

    /// Linear interpolation of a full-grid source at time τ, tolerating
    /// rounding just past either end of the grid.
    fn resample(&self, interpolated: &[f64], tau: f64) -> Result<f64, TransferError> {
        let first = self.tau[0];
        let last = self.tau[self.tau.len() - 1];
        let slack = K_MIN_ROUNDING * self.tau0;
        let t = if tau > last && tau - last <= slack {
            last
        } else if tau < first && first - tau <= slack {
            first
        } else {
            tau
        };
        numerical::linear_interpolate(self.tau, interpolated, t, "source resampling in tau")
    }
}
